//! Export pipeline: re-rasterize every page, stamp stored signatures, and
//! re-encode the pages as a new image-only PDF.

use crate::coordinates::PdfPoint;
use crate::error::{SignError, SignResult};
use crate::placement::PlacementStore;
use doc_model::SignatureSize;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use image::imageops::{self, FilterType};
use image::RgbaImage;
use lopdf::{dictionary, Document, Object, ObjectId, Stream};
use pdf_engine::{DocumentHandle, PageSize, PdfEngine, RenderRequest};
use std::io::Write;

const PAGE_IMAGE_NAME: &str = "Im0";

/// Tallest stamp accepted, in multiples of the page raster height.
const MAX_STAMP_PAGE_HEIGHTS: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComposeOptions {
    pub signature_size: SignatureSize,
    /// Raster pixels per page point. `1.0` matches the nominal page size.
    pub render_scale: f32,
}

impl Default for ComposeOptions {
    fn default() -> Self {
        Self { signature_size: SignatureSize::default(), render_scale: 1.0 }
    }
}

impl ComposeOptions {
    pub fn with_size(signature_size: SignatureSize) -> Self {
        Self { signature_size, ..Self::default() }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportReport {
    pub pages: u32,
    pub signed_pages: u32,
}

/// Pixel rectangle a stamped signature occupies. May extend past the page edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StampBounds {
    pub x: i64,
    pub y: i64,
    pub width: u32,
    pub height: u32,
}

/// Target signature size in page pixels: `size` percent of the page width, aspect preserved.
pub fn scaled_signature_size(
    signature: (u32, u32),
    page_width_px: u32,
    size: SignatureSize,
) -> (f32, f32) {
    let (sig_w, sig_h) = signature;
    let width = page_width_px as f32 * size.fraction();
    let height = sig_h as f32 * (width / sig_w as f32);
    (width, height)
}

/// Converts an anchor in page space into pixel space of a raster of `raster` dimensions.
pub fn anchor_to_pixels(anchor: PdfPoint, page: PageSize, raster: (u32, u32)) -> (f32, f32) {
    let sx = if page.width_pt > 0.0 { raster.0 as f32 / page.width_pt } else { 1.0 };
    let sy = if page.height_pt > 0.0 { raster.1 as f32 / page.height_pt } else { 1.0 };
    (anchor.x * sx, anchor.y * sy)
}

/// Scales `signature` with a filtered kernel and alpha-blends it centred on `anchor_px`.
///
/// Pixels falling outside the page are clipped; the anchor itself is never clamped.
pub fn composite_signature(
    page: &mut RgbaImage,
    signature: &RgbaImage,
    anchor_px: (f32, f32),
    size: SignatureSize,
) -> SignResult<StampBounds> {
    let (sig_w, sig_h) = signature.dimensions();
    if sig_w == 0 || sig_h == 0 {
        return Err(SignError::InvalidPlacement { width: sig_w, height: sig_h });
    }

    let (width, height) = scaled_signature_size((sig_w, sig_h), page.width(), size);
    let limit = page.height().max(1).saturating_mul(MAX_STAMP_PAGE_HEIGHTS);
    if !height.is_finite() || height > limit as f32 {
        return Err(SignError::OversizedSignature {
            width: width.round() as u32,
            height: height.round() as u32,
            limit,
        });
    }

    let width_px = width.round().max(1.0) as u32;
    let height_px = height.round().max(1.0) as u32;

    let scaled = imageops::resize(signature, width_px, height_px, FilterType::CatmullRom);

    let x = (anchor_px.0 - width / 2.0).round() as i64;
    let y = (anchor_px.1 - height / 2.0).round() as i64;
    imageops::overlay(page, &scaled, x, y);

    Ok(StampBounds { x, y, width: width_px, height: height_px })
}

/// Accumulates page rasters as flate-compressed image pages and serializes them on finish.
///
/// Each appended raster is compressed immediately so callers can drop it before
/// rendering the next page.
pub struct PdfPageWriter {
    doc: Document,
    pages_id: ObjectId,
    kids: Vec<Object>,
}

impl Default for PdfPageWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl PdfPageWriter {
    pub fn new() -> Self {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        Self { doc, pages_id, kids: Vec::new() }
    }

    pub fn page_count(&self) -> usize {
        self.kids.len()
    }

    pub fn append_page(&mut self, page: &RgbaImage) -> SignResult<()> {
        let (width, height) = page.dimensions();

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&flatten_to_rgb(page))?;
        let pixels = encoder.finish()?;

        let image_id = self.doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => width as i64,
                "Height" => height as i64,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
                "Filter" => "FlateDecode",
            },
            pixels,
        ));

        let content = format!("q {width} 0 0 {height} 0 0 cm /{PAGE_IMAGE_NAME} Do Q");
        let content_id = self.doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));

        let page_id = self.doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => self.pages_id,
            "MediaBox" => vec![
                Object::Integer(0),
                Object::Integer(0),
                Object::Integer(width as i64),
                Object::Integer(height as i64),
            ],
            "Resources" => dictionary! {
                "XObject" => dictionary! {
                    PAGE_IMAGE_NAME => image_id,
                },
            },
            "Contents" => content_id,
        });

        self.kids.push(Object::Reference(page_id));
        Ok(())
    }

    pub fn finish<W: Write>(mut self, writer: &mut W) -> SignResult<()> {
        let count = self.kids.len() as i64;
        self.doc.objects.insert(
            self.pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => self.kids,
                "Count" => count,
            }),
        );

        let catalog_id = self.doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => self.pages_id,
        });
        self.doc.trailer.set("Root", catalog_id);

        self.doc.save_to(writer)?;
        writer.flush()?;
        Ok(())
    }
}

/// Drops the alpha channel, compositing any translucent pixels over white paper.
fn flatten_to_rgb(page: &RgbaImage) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(page.width() as usize * page.height() as usize * 3);

    for pixel in page.pixels() {
        let [r, g, b, a] = pixel.0;
        if a == u8::MAX {
            rgb.extend_from_slice(&[r, g, b]);
            continue;
        }

        let a = u32::from(a);
        let over_white = |c: u8| ((u32::from(c) * a + 255 * (255 - a) + 127) / 255) as u8;
        rgb.extend_from_slice(&[over_white(r), over_white(g), over_white(b)]);
    }

    rgb
}

/// Renders every page of `handle`, stamps the placements, and writes the new document.
///
/// Pages are processed strictly in order and each raster is released before the
/// next one is rendered. Any failure aborts the whole export.
pub fn compose<E, W>(
    engine: &E,
    handle: DocumentHandle,
    placements: &PlacementStore,
    options: &ComposeOptions,
    mut writer: W,
) -> SignResult<ExportReport>
where
    E: PdfEngine + ?Sized,
    W: Write,
{
    let page_count = engine.page_count(handle).map_err(|source| SignError::UnreadableDocument {
        path: format!("handle {}", handle.raw()),
        source,
    })?;

    let span = tracing::info_span!(
        "compose",
        pages = page_count,
        placements = placements.len(),
        size = options.signature_size.percent()
    );
    let _entered = span.enter();

    let mut output = PdfPageWriter::new();
    let mut report = ExportReport::default();

    for page_index in 0..page_count {
        let page_error = |source| SignError::PageRender { page: page_index, source };

        let request = RenderRequest::page(page_index).with_scale(options.render_scale);
        let mut raster = engine.render_page(handle, request).map_err(page_error)?;

        if let Some(placement) = placements.get(page_index) {
            let page_size = engine.page_size(handle, page_index).map_err(page_error)?;
            let anchor_px = anchor_to_pixels(placement.anchor(), page_size, raster.dimensions());
            let bounds = composite_signature(
                &mut raster,
                placement.image(),
                anchor_px,
                options.signature_size,
            )?;

            tracing::debug!(
                page = page_index,
                x = bounds.x,
                y = bounds.y,
                width = bounds.width,
                height = bounds.height,
                "stamped signature"
            );
            report.signed_pages += 1;
        }

        output.append_page(&raster)?;
        report.pages += 1;
    }

    output.finish(&mut writer)?;
    tracing::info!(pages = report.pages, signed = report.signed_pages, "export complete");

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{decode_pages, fixture_engine, solid_signature};
    use image::Rgba;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn size(percent: f32) -> SignatureSize {
        SignatureSize::new(percent).expect("valid size")
    }

    #[test]
    fn signature_width_follows_page_width_percentage() {
        let (w, h) = scaled_signature_size((200, 100), 595, size(20.0));

        assert!((w - 119.0).abs() < 1e-4);
        assert!((h - 59.5).abs() < 1e-4);
    }

    #[test]
    fn anchor_scales_with_raster_resolution() {
        let page = PageSize { width_pt: 595.0, height_pt: 842.0 };

        assert_eq!(anchor_to_pixels(PdfPoint::new(100.0, 200.0), page, (595, 842)), (100.0, 200.0));
        assert_eq!(anchor_to_pixels(PdfPoint::new(100.0, 200.0), page, (1190, 1684)), (200.0, 400.0));
    }

    #[test]
    fn composite_centres_signature_on_anchor() {
        let mut page = RgbaImage::from_pixel(595, 842, Rgba([255, 255, 255, 255]));
        let signature = RgbaImage::from_pixel(200, 100, Rgba([255, 0, 0, 255]));

        let bounds =
            composite_signature(&mut page, &signature, (297.5, 421.0), size(20.0)).expect("stamp");

        assert_eq!(bounds, StampBounds { x: 238, y: 391, width: 119, height: 60 });
        assert_eq!(page.get_pixel(297, 421).0, [255, 0, 0, 255]);
        assert_eq!(page.get_pixel(237, 421).0, [255, 255, 255, 255]);
    }

    #[test]
    fn signature_past_the_edge_is_clipped_without_error() {
        let mut page = RgbaImage::from_pixel(100, 100, Rgba([255, 255, 255, 255]));
        let signature = RgbaImage::from_pixel(10, 10, Rgba([0, 0, 255, 255]));

        let bounds =
            composite_signature(&mut page, &signature, (-5.0, 98.0), size(50.0)).expect("stamp");

        assert_eq!(bounds.x, -30);
        assert_eq!(page.dimensions(), (100, 100));
        assert_eq!(page.get_pixel(0, 99).0, [0, 0, 255, 255]);
        assert_eq!(page.get_pixel(0, 50).0, [255, 255, 255, 255]);
    }

    #[test]
    fn extreme_aspect_ratio_is_rejected_before_scaling() {
        let mut page = RgbaImage::from_pixel(595, 842, Rgba([255, 255, 255, 255]));
        let signature = RgbaImage::from_pixel(1, 4000, Rgba([0, 0, 0, 255]));

        let err = composite_signature(&mut page, &signature, (297.0, 421.0), size(100.0))
            .expect_err("should refuse");

        assert!(matches!(
            err,
            SignError::OversizedSignature { width: 595, height: 2_380_000, limit: 3368 }
        ));
        assert!(page.pixels().all(|pixel| pixel.0 == [255, 255, 255, 255]));
    }

    #[test]
    fn tall_signature_within_limit_is_stamped() {
        let mut page = RgbaImage::from_pixel(100, 100, Rgba([255, 255, 255, 255]));
        let signature = RgbaImage::from_pixel(10, 40, Rgba([0, 0, 255, 255]));

        let bounds =
            composite_signature(&mut page, &signature, (50.0, 50.0), size(100.0)).expect("stamp");

        assert_eq!((bounds.width, bounds.height), (100, 400));
        assert_eq!(page.get_pixel(50, 50).0, [0, 0, 255, 255]);
    }

    #[test]
    fn transparent_signature_pixels_leave_page_untouched() {
        let mut page = RgbaImage::from_pixel(100, 100, Rgba([255, 255, 255, 255]));
        let signature = RgbaImage::from_pixel(10, 10, Rgba([0, 0, 0, 0]));

        composite_signature(&mut page, &signature, (50.0, 50.0), size(40.0)).expect("stamp");

        assert!(page.pixels().all(|pixel| pixel.0 == [255, 255, 255, 255]));
    }

    #[test]
    fn flatten_composites_translucent_pixels_over_white() {
        let page = RgbaImage::from_vec(2, 1, vec![10, 20, 30, 255, 0, 0, 0, 0]).expect("buffer");

        assert_eq!(flatten_to_rgb(&page), vec![10, 20, 30, 255, 255, 255]);
    }

    #[test]
    fn centred_signature_on_a4_page() {
        let (engine, handle) = fixture_engine(1);
        let mut placements = PlacementStore::new();
        placements
            .put(0, Arc::new(solid_signature(200, 100)), PdfPoint::new(297.5, 421.0))
            .expect("put");

        let mut bytes = Vec::new();
        let report =
            compose(&engine, handle, &placements, &ComposeOptions::with_size(size(20.0)), &mut bytes)
                .expect("compose should succeed");

        assert_eq!(report, ExportReport { pages: 1, signed_pages: 1 });

        let pages = decode_pages(&bytes);
        assert_eq!(pages.len(), 1);
        let page = &pages[0];
        assert_eq!(page.dimensions(), (595, 842));

        let red: Vec<(u32, u32)> = page
            .enumerate_pixels()
            .filter(|(_, _, pixel)| pixel.0 == [255, 0, 0])
            .map(|(x, y, _)| (x, y))
            .collect();
        let min_x = red.iter().map(|p| p.0).min().expect("red pixels");
        let max_x = red.iter().map(|p| p.0).max().expect("red pixels");
        let min_y = red.iter().map(|p| p.1).min().expect("red pixels");
        let max_y = red.iter().map(|p| p.1).max().expect("red pixels");

        let width = (max_x - min_x + 1) as f32;
        let centre_x = (min_x + max_x + 1) as f32 / 2.0;
        let centre_y = (min_y + max_y + 1) as f32 / 2.0;

        assert!((width - 119.0).abs() <= 1.0, "width was {width}");
        assert!((centre_x - 297.5).abs() <= 1.0, "centre x was {centre_x}");
        assert!((centre_y - 421.0).abs() <= 1.0, "centre y was {centre_y}");
    }

    #[test]
    fn unsigned_pages_match_plain_rasterization() {
        let (engine, handle) = fixture_engine(3);

        let mut bytes = Vec::new();
        let report = compose(
            &engine,
            handle,
            &PlacementStore::new(),
            &ComposeOptions::default(),
            &mut bytes,
        )
        .expect("compose should succeed");

        assert_eq!(report, ExportReport { pages: 3, signed_pages: 0 });

        let pages = decode_pages(&bytes);
        assert_eq!(pages.len(), 3);
        for (index, page) in pages.iter().enumerate() {
            let expected = engine.render_page(handle, RenderRequest::page(index as u32)).expect("render");
            assert_eq!(page.as_raw(), &flatten_to_rgb(&expected), "page {index} differs");
        }
    }

    #[test]
    fn compose_is_deterministic() {
        let (engine, handle) = fixture_engine(2);
        let mut placements = PlacementStore::new();
        placements
            .put(1, Arc::new(solid_signature(64, 32)), PdfPoint::new(100.0, 700.0))
            .expect("put");

        let mut first = Vec::new();
        let mut second = Vec::new();
        compose(&engine, handle, &placements, &ComposeOptions::default(), &mut first).expect("first");
        compose(&engine, handle, &placements, &ComposeOptions::default(), &mut second).expect("second");

        assert_eq!(first, second);
    }

    #[test]
    fn exported_page_size_uses_raster_dimensions() {
        let (engine, handle) = fixture_engine(1);
        let options = ComposeOptions { render_scale: 2.0, ..ComposeOptions::default() };

        let mut bytes = Vec::new();
        compose(&engine, handle, &PlacementStore::new(), &options, &mut bytes).expect("compose");

        let pages = decode_pages(&bytes);
        assert_eq!(pages[0].dimensions(), (1190, 1684));
    }

    proptest! {
        #[test]
        fn scaling_preserves_aspect_ratio(
            sig_w in 1u32..4000,
            sig_h in 1u32..4000,
            page_w in 1u32..5000,
            percent in 0.5f32..=100.0,
        ) {
            let (w, h) = scaled_signature_size((sig_w, sig_h), page_w, size(percent));
            let original = sig_w as f64 / sig_h as f64;
            let scaled = w as f64 / h as f64;

            prop_assert!(((scaled - original) / original).abs() < 1e-5);
        }
    }
}
