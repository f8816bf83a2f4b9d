#[cfg(feature = "pdfium")]
pub mod pdfium_backend;
pub mod vector;

use image::{ImageBuffer, Rgba};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use vector::PageTransform;

pub type RgbaImage = ImageBuffer<Rgba<u8>, Vec<u8>>;

/// Fallback page geometry when neither the page nor its ancestors carry a MediaBox (A4).
pub const DEFAULT_PAGE_SIZE: PageSize = PageSize { width_pt: 595.0, height_pt: 842.0 };

const PAGE_FILL: Rgba<u8> = Rgba([255, 255, 255, 255]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocumentHandle(u64);

impl DocumentHandle {
    pub fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageSize {
    pub width_pt: f32,
    pub height_pt: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderRequest {
    pub page_index: u32,
    pub scale: f32,
}

impl Default for RenderRequest {
    fn default() -> Self {
        Self { page_index: 0, scale: 1.0 }
    }
}

impl RenderRequest {
    pub fn page(page_index: u32) -> Self {
        Self { page_index, ..Self::default() }
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }
}

#[derive(Debug, Clone)]
pub enum OpenSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

impl OpenSource {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Path(path) => Some(path),
            Self::Bytes(_) => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Path(path) => path.display().to_string(),
            Self::Bytes(bytes) => format!("<{} bytes in memory>", bytes.len()),
        }
    }
}

impl From<PathBuf> for OpenSource {
    fn from(value: PathBuf) -> Self {
        Self::Path(value)
    }
}

impl From<&Path> for OpenSource {
    fn from(value: &Path) -> Self {
        Self::Path(value.to_path_buf())
    }
}

impl From<Vec<u8>> for OpenSource {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PdfEngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("PDF parse error: {0}")]
    Parse(#[from] lopdf::Error),
    #[error("invalid handle {0}")]
    InvalidHandle(u64),
    #[error("page {page} out of range (page_count={page_count})")]
    PageOutOfRange { page: u32, page_count: u32 },
    #[error("encrypted PDFs are not supported in the default backend")]
    EncryptedUnsupported,
    #[error("document has no pages")]
    NoPages,
    #[error("backend error: {0}")]
    Backend(String),
    #[error("no full-fidelity PDF rasterizer available: {0}")]
    RasterizerUnavailable(String),
}

/// Page rasterization source consumed by the signing pipeline.
pub trait PdfEngine {
    fn open(&mut self, source: OpenSource) -> Result<DocumentHandle, PdfEngineError>;
    fn page_count(&self, handle: DocumentHandle) -> Result<u32, PdfEngineError>;
    fn page_size(
        &self,
        handle: DocumentHandle,
        page_index: u32,
    ) -> Result<PageSize, PdfEngineError>;
    fn render_page(
        &self,
        handle: DocumentHandle,
        request: RenderRequest,
    ) -> Result<RgbaImage, PdfEngineError>;
    fn close(&mut self, handle: DocumentHandle) -> Result<(), PdfEngineError>;
}

/// Pixel dimensions a page of `size` occupies when rendered at `scale`.
pub fn raster_dimensions(size: PageSize, scale: f32) -> (u32, u32) {
    let scale = if scale <= 0.0 { 1.0 } else { scale };
    let width = (size.width_pt * scale).round().max(1.0) as u32;
    let height = (size.height_pt * scale).round().max(1.0) as u32;
    (width, height)
}

#[derive(Debug, Clone, Copy)]
struct PageRecord {
    id: ObjectId,
    origin: (f32, f32),
    size: PageSize,
}

#[derive(Debug)]
struct DocumentRecord {
    doc: Document,
    pages: Vec<PageRecord>,
}

/// Built-in engine: parses pages with lopdf and rasterizes their path content
/// (fills and strokes in device colours). Text, images and shadings are not
/// drawn; pages containing them are logged at `warn` level when rendered.
#[derive(Debug, Default)]
pub struct LopdfEngine {
    next_handle: u64,
    docs: HashMap<DocumentHandle, DocumentRecord>,
}

impl LopdfEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn parse(bytes: &[u8]) -> Result<DocumentRecord, PdfEngineError> {
        if bytes.windows("/Encrypt".len()).any(|window| window == b"/Encrypt") {
            return Err(PdfEngineError::EncryptedUnsupported);
        }

        let doc = Document::load_mem(bytes)?;
        let pages = doc
            .get_pages()
            .into_values()
            .map(|id| {
                let (origin, size) = inherited_media_box(&doc, id)
                    .unwrap_or(((0.0, 0.0), DEFAULT_PAGE_SIZE));
                PageRecord { id, origin, size }
            })
            .collect::<Vec<_>>();

        if pages.is_empty() {
            return Err(PdfEngineError::NoPages);
        }

        Ok(DocumentRecord { doc, pages })
    }

    fn record(&self, handle: DocumentHandle) -> Result<&DocumentRecord, PdfEngineError> {
        self.docs.get(&handle).ok_or(PdfEngineError::InvalidHandle(handle.raw()))
    }

    fn page(&self, handle: DocumentHandle, page_index: u32) -> Result<(&DocumentRecord, PageRecord), PdfEngineError> {
        let record = self.record(handle)?;
        let page = record.pages.get(page_index as usize).copied().ok_or(
            PdfEngineError::PageOutOfRange { page: page_index, page_count: record.pages.len() as u32 },
        )?;
        Ok((record, page))
    }
}

fn inherited_media_box(doc: &Document, page_id: ObjectId) -> Option<((f32, f32), PageSize)> {
    let mut current = Some(page_id);

    while let Some(id) = current {
        let dict = doc.get_dictionary(id).ok()?;
        if let Some(media_box) = media_box(doc, dict) {
            return Some(media_box);
        }
        current = dict.get(b"Parent").and_then(Object::as_reference).ok();
    }

    None
}

fn media_box(doc: &Document, dict: &Dictionary) -> Option<((f32, f32), PageSize)> {
    let raw = dict.get(b"MediaBox").ok()?;
    let resolved = match raw {
        Object::Reference(id) => doc.get_object(*id).ok()?,
        other => other,
    };

    let array = resolved.as_array().ok()?;
    if array.len() != 4 {
        return None;
    }

    let x0 = array[0].as_float().ok()?;
    let y0 = array[1].as_float().ok()?;
    let x1 = array[2].as_float().ok()?;
    let y1 = array[3].as_float().ok()?;
    let size = PageSize { width_pt: (x1 - x0).abs(), height_pt: (y1 - y0).abs() };

    (size.width_pt > 0.0 && size.height_pt > 0.0).then_some(((x0.min(x1), y0.min(y1)), size))
}

/// Concatenated, decoded content streams of one page.
fn page_content(doc: &Document, page_id: ObjectId) -> Result<Vec<u8>, PdfEngineError> {
    let mut content = Vec::new();

    for stream_id in doc.get_page_contents(page_id) {
        let stream = doc.get_object(stream_id).and_then(Object::as_stream)?;
        if stream.dict.has(b"Filter") {
            content.extend_from_slice(&stream.decompressed_content()?);
        } else {
            content.extend_from_slice(&stream.content);
        }
        content.push(b'\n');
    }

    Ok(content)
}

impl PdfEngine for LopdfEngine {
    fn open(&mut self, source: OpenSource) -> Result<DocumentHandle, PdfEngineError> {
        let bytes = match source {
            OpenSource::Path(path) => fs::read(path)?,
            OpenSource::Bytes(bytes) => bytes,
        };

        let record = Self::parse(&bytes)?;

        self.next_handle += 1;
        let handle = DocumentHandle(self.next_handle);
        tracing::debug!(handle = handle.raw(), pages = record.pages.len(), "opened document");
        self.docs.insert(handle, record);

        Ok(handle)
    }

    fn page_count(&self, handle: DocumentHandle) -> Result<u32, PdfEngineError> {
        Ok(self.record(handle)?.pages.len() as u32)
    }

    fn page_size(
        &self,
        handle: DocumentHandle,
        page_index: u32,
    ) -> Result<PageSize, PdfEngineError> {
        Ok(self.page(handle, page_index)?.1.size)
    }

    fn render_page(
        &self,
        handle: DocumentHandle,
        request: RenderRequest,
    ) -> Result<RgbaImage, PdfEngineError> {
        let (record, page) = self.page(handle, request.page_index)?;
        let (width, height) = raster_dimensions(page.size, request.scale);

        let mut image = RgbaImage::from_pixel(width, height, PAGE_FILL);
        let content = page_content(&record.doc, page.id)?;
        let transform = PageTransform {
            origin_x: page.origin.0,
            origin_y: page.origin.1,
            width_pt: page.size.width_pt,
            height_pt: page.size.height_pt,
            raster_width: width,
            raster_height: height,
        };

        let skipped = vector::render_content(&mut image, &content, transform)?;
        if !skipped.is_empty() {
            tracing::warn!(
                page = request.page_index,
                text = skipped.text,
                images = skipped.images,
                shadings = skipped.shadings,
                "page has content the lopdf engine cannot draw"
            );
        }

        Ok(image)
    }

    fn close(&mut self, handle: DocumentHandle) -> Result<(), PdfEngineError> {
        tracing::debug!(handle = handle.raw(), "closing document");
        self.docs.remove(&handle).map(|_| ()).ok_or(PdfEngineError::InvalidHandle(handle.raw()))
    }
}

/// Engine chosen at runtime.
pub enum Engine {
    Lopdf(LopdfEngine),
    #[cfg(feature = "pdfium")]
    Pdfium(pdfium_backend::PdfiumEngine),
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Engine").field(&self.name()).finish()
    }
}

impl Engine {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Lopdf(_) => "lopdf",
            #[cfg(feature = "pdfium")]
            Self::Pdfium(_) => "pdfium",
        }
    }

    /// Whether every kind of page content (text, images, shadings) is rasterized.
    pub fn is_full_fidelity(&self) -> bool {
        match self {
            Self::Lopdf(_) => false,
            #[cfg(feature = "pdfium")]
            Self::Pdfium(_) => true,
        }
    }

    fn inner(&self) -> &dyn PdfEngine {
        match self {
            Self::Lopdf(engine) => engine,
            #[cfg(feature = "pdfium")]
            Self::Pdfium(engine) => engine,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn PdfEngine {
        match self {
            Self::Lopdf(engine) => engine,
            #[cfg(feature = "pdfium")]
            Self::Pdfium(engine) => engine,
        }
    }
}

impl PdfEngine for Engine {
    fn open(&mut self, source: OpenSource) -> Result<DocumentHandle, PdfEngineError> {
        self.inner_mut().open(source)
    }

    fn page_count(&self, handle: DocumentHandle) -> Result<u32, PdfEngineError> {
        self.inner().page_count(handle)
    }

    fn page_size(
        &self,
        handle: DocumentHandle,
        page_index: u32,
    ) -> Result<PageSize, PdfEngineError> {
        self.inner().page_size(handle, page_index)
    }

    fn render_page(
        &self,
        handle: DocumentHandle,
        request: RenderRequest,
    ) -> Result<RgbaImage, PdfEngineError> {
        self.inner().render_page(handle, request)
    }

    fn close(&mut self, handle: DocumentHandle) -> Result<(), PdfEngineError> {
        self.inner_mut().close(handle)
    }
}

/// The full-fidelity engine (pdfium). Fails when the library cannot be bound
/// or the crate was built without the `pdfium` feature.
pub fn default_engine() -> Result<Engine, PdfEngineError> {
    #[cfg(feature = "pdfium")]
    {
        pdfium_backend::PdfiumEngine::bind().map(Engine::Pdfium)
    }
    #[cfg(not(feature = "pdfium"))]
    {
        Err(PdfEngineError::RasterizerUnavailable("built without the `pdfium` feature".to_owned()))
    }
}

/// Writes a minimal PDF with one empty page per entry in `page_sizes`.
///
/// Used to build fixtures for tests across the workspace.
pub fn blank_document(page_sizes: &[PageSize]) -> Result<Vec<u8>, PdfEngineError> {
    let pages: Vec<(PageSize, &[u8])> = page_sizes.iter().map(|size| (*size, &b""[..])).collect();
    document_with_contents(&pages)
}

/// Like [`blank_document`], with a flate-compressed content stream per page.
pub fn document_with_contents(pages: &[(PageSize, &[u8])]) -> Result<Vec<u8>, PdfEngineError> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let mut kids = Vec::with_capacity(pages.len());

    for (size, content) in pages {
        let mut stream = Stream::new(dictionary! {}, content.to_vec());
        if !content.is_empty() {
            stream.compress()?;
        }
        let content_id = doc.add_object(stream);
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![
                Object::Integer(0),
                Object::Integer(0),
                Object::Real(size.width_pt),
                Object::Real(size.height_pt),
            ],
            "Contents" => content_id,
        });
        kids.push(Object::Reference(page_id));
    }

    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => pages.len() as i64,
        }),
    );

    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pdf_bytes(pages: usize) -> Vec<u8> {
        blank_document(&vec![DEFAULT_PAGE_SIZE; pages]).expect("fixture should build")
    }

    #[test]
    fn opens_pdf_and_reads_page_count() {
        let mut engine = LopdfEngine::new();
        let handle =
            engine.open(OpenSource::Bytes(sample_pdf_bytes(3))).expect("open should succeed");

        assert_eq!(engine.page_count(handle).expect("count should succeed"), 3);
    }

    #[test]
    fn page_size_comes_from_media_box() {
        let bytes = blank_document(&[
            PageSize { width_pt: 612.0, height_pt: 792.0 },
            PageSize { width_pt: 842.0, height_pt: 595.0 },
        ])
        .expect("fixture should build");

        let mut engine = LopdfEngine::new();
        let handle = engine.open(OpenSource::Bytes(bytes)).expect("open should succeed");

        assert_eq!(
            engine.page_size(handle, 1).expect("size should resolve"),
            PageSize { width_pt: 842.0, height_pt: 595.0 }
        );
    }

    #[test]
    fn render_page_matches_native_size_at_unit_scale() {
        let mut engine = LopdfEngine::new();
        let handle =
            engine.open(OpenSource::Bytes(sample_pdf_bytes(1))).expect("open should succeed");

        let image = engine.render_page(handle, RenderRequest::page(0)).expect("render");

        assert_eq!(image.dimensions(), (595, 842));
        assert!(image.pixels().all(|pixel| *pixel == PAGE_FILL));
    }

    #[test]
    fn render_page_draws_filled_paths() {
        let bytes = document_with_contents(&[(DEFAULT_PAGE_SIZE, b"0 0 0 rg 100 100 300 300 re f")])
            .expect("fixture should build");
        let mut engine = LopdfEngine::new();
        let handle = engine.open(OpenSource::Bytes(bytes)).expect("open should succeed");

        let image = engine.render_page(handle, RenderRequest::page(0)).expect("render");

        let black = image.pixels().filter(|pixel| pixel.0 == [0, 0, 0, 255]).count();
        assert_eq!(black, 90_000);
        assert_eq!(*image.get_pixel(250, 600), Rgba([0, 0, 0, 255]));
        assert_eq!(*image.get_pixel(50, 50), PAGE_FILL);
    }

    #[test]
    fn render_page_scales_content_with_the_page() {
        let bytes = document_with_contents(&[(DEFAULT_PAGE_SIZE, b"1 0 0 rg 0 0 10 10 re f")])
            .expect("fixture should build");
        let mut engine = LopdfEngine::new();
        let handle = engine.open(OpenSource::Bytes(bytes)).expect("open should succeed");

        let image =
            engine.render_page(handle, RenderRequest::page(0).with_scale(2.0)).expect("render");

        let red = image.pixels().filter(|pixel| pixel.0 == [255, 0, 0, 255]).count();
        assert_eq!(red, 400);
        assert_eq!(*image.get_pixel(0, 1683), Rgba([255, 0, 0, 255]));
    }

    #[test]
    fn page_with_text_still_renders_its_paths() {
        let bytes = document_with_contents(&[(
            DEFAULT_PAGE_SIZE,
            b"BT /F1 12 Tf 72 720 Td (Hello) Tj ET 0 g 0 0 5 5 re f",
        )])
        .expect("fixture should build");
        let mut engine = LopdfEngine::new();
        let handle = engine.open(OpenSource::Bytes(bytes)).expect("open should succeed");

        let image = engine.render_page(handle, RenderRequest::page(0)).expect("render");

        assert_eq!(image.pixels().filter(|pixel| pixel.0 == [0, 0, 0, 255]).count(), 25);
    }

    #[test]
    fn engine_reports_name_and_fidelity() {
        let engine = Engine::Lopdf(LopdfEngine::new());

        assert_eq!(engine.name(), "lopdf");
        assert!(!engine.is_full_fidelity());
    }

    #[cfg(not(feature = "pdfium"))]
    #[test]
    fn default_engine_is_unavailable_without_pdfium() {
        assert!(matches!(default_engine(), Err(PdfEngineError::RasterizerUnavailable(_))));
    }

    #[test]
    fn render_page_honours_scale() {
        let mut engine = LopdfEngine::new();
        let handle =
            engine.open(OpenSource::Bytes(sample_pdf_bytes(1))).expect("open should succeed");

        let image =
            engine.render_page(handle, RenderRequest::page(0).with_scale(2.0)).expect("render");

        assert_eq!(image.dimensions(), (1190, 1684));
    }

    #[test]
    fn render_out_of_range_page_fails() {
        let mut engine = LopdfEngine::new();
        let handle =
            engine.open(OpenSource::Bytes(sample_pdf_bytes(2))).expect("open should succeed");

        let err = engine.render_page(handle, RenderRequest::page(2)).expect_err("should fail");
        assert!(matches!(err, PdfEngineError::PageOutOfRange { page: 2, page_count: 2 }));
    }

    #[test]
    fn garbage_bytes_fail_to_open() {
        let mut engine = LopdfEngine::new();
        let err = engine
            .open(OpenSource::Bytes(b"not a pdf at all".to_vec()))
            .expect_err("should fail");

        assert!(matches!(err, PdfEngineError::Parse(_)));
    }

    #[test]
    fn encrypted_marker_is_rejected() {
        let mut bytes = sample_pdf_bytes(1);
        bytes.extend_from_slice(b"\n% /Encrypt\n");

        let mut engine = LopdfEngine::new();
        let err = engine.open(OpenSource::Bytes(bytes)).expect_err("should fail");
        assert!(matches!(err, PdfEngineError::EncryptedUnsupported));
    }

    #[test]
    fn invalid_handle_returns_error() {
        let engine = LopdfEngine::new();
        let err =
            engine.page_count(DocumentHandle(999)).expect_err("should fail for unknown handle");

        assert!(matches!(err, PdfEngineError::InvalidHandle(999)));
    }

    #[test]
    fn close_releases_handle() {
        let mut engine = LopdfEngine::new();
        let handle =
            engine.open(OpenSource::Bytes(sample_pdf_bytes(1))).expect("open should succeed");

        engine.close(handle).expect("close should succeed");
        assert!(matches!(engine.close(handle), Err(PdfEngineError::InvalidHandle(_))));
    }

    #[test]
    fn raster_dimensions_round_and_clamp() {
        let size = PageSize { width_pt: 100.4, height_pt: 0.2 };
        assert_eq!(raster_dimensions(size, 1.0), (100, 1));
        assert_eq!(raster_dimensions(size, -3.0), (100, 1));
    }
}
