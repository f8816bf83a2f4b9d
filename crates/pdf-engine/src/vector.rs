//! Content-stream rasterizer for the lopdf engine.
//!
//! Draws filled and stroked paths in the device colour spaces onto an RGBA
//! page. Text, images, form XObjects and shadings are not drawn; they are
//! reported in [`SkippedContent`] so callers can flag lossy pages.

use crate::RgbaImage;
use image::Rgba;
use lopdf::content::{Content, Operation};

const CURVE_STEPS: usize = 16;

/// Operators that were present on a page but could not be drawn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkippedContent {
    pub text: bool,
    pub images: bool,
    pub shadings: bool,
}

impl SkippedContent {
    pub fn is_empty(&self) -> bool {
        !(self.text || self.images || self.shadings)
    }
}

/// Affine transform in PDF row-vector convention: `(x, y) -> (a x + c y + e, b x + d y + f)`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Matrix {
    a: f32,
    b: f32,
    c: f32,
    d: f32,
    e: f32,
    f: f32,
}

impl Matrix {
    fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        (self.a * x + self.c * y + self.e, self.b * x + self.d * y + self.f)
    }

    /// `self` applied first, then `outer`.
    fn then(&self, outer: &Matrix) -> Matrix {
        Matrix {
            a: self.a * outer.a + self.b * outer.c,
            b: self.a * outer.b + self.b * outer.d,
            c: self.c * outer.a + self.d * outer.c,
            d: self.c * outer.b + self.d * outer.d,
            e: self.e * outer.a + self.f * outer.c + outer.e,
            f: self.e * outer.b + self.f * outer.d + outer.f,
        }
    }

    fn scale_factor(&self) -> f32 {
        (self.a * self.d - self.b * self.c).abs().sqrt()
    }
}

/// Where the page's MediaBox lands in the raster.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageTransform {
    pub origin_x: f32,
    pub origin_y: f32,
    pub width_pt: f32,
    pub height_pt: f32,
    pub raster_width: u32,
    pub raster_height: u32,
}

impl PageTransform {
    fn device_matrix(&self) -> Matrix {
        let sx = self.raster_width as f32 / self.width_pt;
        let sy = self.raster_height as f32 / self.height_pt;

        Matrix {
            a: sx,
            b: 0.0,
            c: 0.0,
            d: -sy,
            e: -self.origin_x * sx,
            f: (self.origin_y + self.height_pt) * sy,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct GraphicsState {
    ctm: Matrix,
    fill: [u8; 3],
    stroke: [u8; 3],
    line_width: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FillRule {
    NonZero,
    EvenOdd,
}

#[derive(Debug, Default)]
struct SubPath {
    points: Vec<(f32, f32)>,
    closed: bool,
}

/// Decodes `content` and paints it onto `page`.
pub fn render_content(
    page: &mut RgbaImage,
    content: &[u8],
    transform: PageTransform,
) -> Result<SkippedContent, lopdf::Error> {
    let content = Content::decode(content)?;
    let mut painter = Painter::new(page, transform);

    for operation in &content.operations {
        painter.execute(operation);
    }

    Ok(painter.skipped)
}

struct Painter<'a> {
    page: &'a mut RgbaImage,
    state: GraphicsState,
    stack: Vec<GraphicsState>,
    path: Vec<SubPath>,
    current: Option<(f32, f32)>,
    skipped: SkippedContent,
}

impl<'a> Painter<'a> {
    fn new(page: &'a mut RgbaImage, transform: PageTransform) -> Self {
        Self {
            page,
            state: GraphicsState {
                ctm: transform.device_matrix(),
                fill: [0, 0, 0],
                stroke: [0, 0, 0],
                line_width: 1.0,
            },
            stack: Vec::new(),
            path: Vec::new(),
            current: None,
            skipped: SkippedContent::default(),
        }
    }

    fn execute(&mut self, op: &Operation) {
        match op.operator.as_str() {
            "q" => self.stack.push(self.state),
            "Q" => {
                if let Some(state) = self.stack.pop() {
                    self.state = state;
                }
            }
            "cm" => {
                if let Some([a, b, c, d, e, f]) = numbers::<6>(op) {
                    self.state.ctm = Matrix { a, b, c, d, e, f }.then(&self.state.ctm);
                }
            }
            "w" => {
                if let Some([width]) = numbers::<1>(op) {
                    self.state.line_width = width;
                }
            }

            "g" | "rg" | "k" | "sc" | "scn" => {
                if let Some(rgb) = device_color(op) {
                    self.state.fill = rgb;
                }
            }
            "G" | "RG" | "K" | "SC" | "SCN" => {
                if let Some(rgb) = device_color(op) {
                    self.state.stroke = rgb;
                }
            }

            "m" => {
                if let Some([x, y]) = numbers::<2>(op) {
                    let point = self.state.ctm.apply(x, y);
                    self.path.push(SubPath { points: vec![point], closed: false });
                    self.current = Some(point);
                }
            }
            "l" => {
                if let Some([x, y]) = numbers::<2>(op) {
                    self.line_to(self.state.ctm.apply(x, y));
                }
            }
            "c" => {
                if let Some([x1, y1, x2, y2, x3, y3]) = numbers::<6>(op) {
                    let ctm = self.state.ctm;
                    self.curve_to(ctm.apply(x1, y1), ctm.apply(x2, y2), ctm.apply(x3, y3));
                }
            }
            "v" => {
                if let (Some([x2, y2, x3, y3]), Some(start)) = (numbers::<4>(op), self.current) {
                    let ctm = self.state.ctm;
                    self.curve_to(start, ctm.apply(x2, y2), ctm.apply(x3, y3));
                }
            }
            "y" => {
                if let Some([x1, y1, x3, y3]) = numbers::<4>(op) {
                    let ctm = self.state.ctm;
                    let end = ctm.apply(x3, y3);
                    self.curve_to(ctm.apply(x1, y1), end, end);
                }
            }
            "h" => self.close_subpath(),
            "re" => {
                if let Some([x, y, w, h]) = numbers::<4>(op) {
                    let ctm = self.state.ctm;
                    let points = vec![
                        ctm.apply(x, y),
                        ctm.apply(x + w, y),
                        ctm.apply(x + w, y + h),
                        ctm.apply(x, y + h),
                    ];
                    self.current = points.first().copied();
                    self.path.push(SubPath { points, closed: true });
                }
            }

            "f" | "F" => self.paint(Some(FillRule::NonZero), false),
            "f*" => self.paint(Some(FillRule::EvenOdd), false),
            "S" => self.paint(None, true),
            "s" => {
                self.close_subpath();
                self.paint(None, true);
            }
            "B" => self.paint(Some(FillRule::NonZero), true),
            "B*" => self.paint(Some(FillRule::EvenOdd), true),
            "b" => {
                self.close_subpath();
                self.paint(Some(FillRule::NonZero), true);
            }
            "b*" => {
                self.close_subpath();
                self.paint(Some(FillRule::EvenOdd), true);
            }
            // Clipping is not modelled; `n` only ends the path.
            "n" => self.clear_path(),

            "BT" => self.skipped.text = true,
            "Do" | "BI" => self.skipped.images = true,
            "sh" => self.skipped.shadings = true,
            _ => {}
        }
    }

    fn line_to(&mut self, point: (f32, f32)) {
        match self.path.last_mut() {
            Some(subpath) if !subpath.closed => subpath.points.push(point),
            _ => self.path.push(SubPath { points: vec![point], closed: false }),
        }
        self.current = Some(point);
    }

    fn curve_to(&mut self, c1: (f32, f32), c2: (f32, f32), end: (f32, f32)) {
        let Some(start) = self.current else {
            return;
        };

        for step in 1..=CURVE_STEPS {
            let t = step as f32 / CURVE_STEPS as f32;
            let u = 1.0 - t;
            let (w0, w1, w2, w3) = (u * u * u, 3.0 * u * u * t, 3.0 * u * t * t, t * t * t);
            self.line_to((
                w0 * start.0 + w1 * c1.0 + w2 * c2.0 + w3 * end.0,
                w0 * start.1 + w1 * c1.1 + w2 * c2.1 + w3 * end.1,
            ));
        }
    }

    fn close_subpath(&mut self) {
        if let Some(subpath) = self.path.last_mut() {
            subpath.closed = true;
            self.current = subpath.points.first().copied();
        }
    }

    fn clear_path(&mut self) {
        self.path.clear();
        self.current = None;
    }

    fn paint(&mut self, fill: Option<FillRule>, stroke: bool) {
        if let Some(rule) = fill {
            let polygons: Vec<&[(f32, f32)]> =
                self.path.iter().map(|subpath| subpath.points.as_slice()).collect();
            fill_polygons(self.page, &polygons, rule, self.state.fill);
        }

        if stroke {
            let half_width = (self.state.line_width * self.state.ctm.scale_factor() / 2.0).max(0.5);
            for subpath in &self.path {
                stroke_subpath(self.page, subpath, half_width, self.state.stroke);
            }
        }

        self.clear_path();
    }
}

fn numbers<const N: usize>(op: &Operation) -> Option<[f32; N]> {
    if op.operands.len() != N {
        return None;
    }

    let mut values = [0.0f32; N];
    for (slot, operand) in values.iter_mut().zip(&op.operands) {
        *slot = operand.as_float().ok()?;
    }
    Some(values)
}

/// Gray, RGB or CMYK depending on the operand count.
fn device_color(op: &Operation) -> Option<[u8; 3]> {
    let channel = |value: f32| (value.clamp(0.0, 1.0) * 255.0).round() as u8;

    match op.operands.len() {
        1 => numbers::<1>(op).map(|[gray]| [channel(gray); 3]),
        3 => numbers::<3>(op).map(|[r, g, b]| [channel(r), channel(g), channel(b)]),
        4 => numbers::<4>(op).map(|[c, m, y, k]| {
            let k = 1.0 - k.clamp(0.0, 1.0);
            [channel((1.0 - c) * k), channel((1.0 - m) * k), channel((1.0 - y) * k)]
        }),
        _ => None,
    }
}

/// Scanline fill sampling pixel centres. Every polygon is implicitly closed.
fn fill_polygons(page: &mut RgbaImage, polygons: &[&[(f32, f32)]], rule: FillRule, rgb: [u8; 3]) {
    let (width, height) = page.dimensions();
    let edges: Vec<((f32, f32), (f32, f32))> = polygons
        .iter()
        .filter(|points| points.len() >= 2)
        .flat_map(|points| {
            let points: &[(f32, f32)] = points;
            (0..points.len()).map(move |i| (points[i], points[(i + 1) % points.len()]))
        })
        .filter(|(a, b)| a.1 != b.1)
        .collect();

    if edges.is_empty() {
        return;
    }

    let min_y = edges.iter().map(|(a, b)| a.1.min(b.1)).fold(f32::INFINITY, f32::min);
    let max_y = edges.iter().map(|(a, b)| a.1.max(b.1)).fold(f32::NEG_INFINITY, f32::max);
    let first_row = (min_y - 0.5).ceil().max(0.0) as u32;
    let last_row = ((max_y - 0.5).ceil().max(0.0) as u32).min(height);

    let color = Rgba([rgb[0], rgb[1], rgb[2], 255]);
    let mut crossings: Vec<(f32, i32)> = Vec::new();

    for row in first_row..last_row {
        let yc = row as f32 + 0.5;

        crossings.clear();
        for &(a, b) in &edges {
            let (lo, hi) = if a.1 < b.1 { (a.1, b.1) } else { (b.1, a.1) };
            if yc < lo || yc >= hi {
                continue;
            }
            let x = a.0 + (yc - a.1) * (b.0 - a.0) / (b.1 - a.1);
            crossings.push((x, if b.1 > a.1 { 1 } else { -1 }));
        }
        crossings.sort_by(|l, r| l.0.total_cmp(&r.0));

        let mut winding = 0;
        for pair in crossings.windows(2) {
            winding += pair[0].1;
            let inside = match rule {
                FillRule::NonZero => winding != 0,
                FillRule::EvenOdd => winding % 2 != 0,
            };
            if !inside {
                continue;
            }

            let start = (pair[0].0 - 0.5).ceil().max(0.0) as u32;
            let end = ((pair[1].0 - 0.5).ceil().max(0.0) as u32).min(width);
            for x in start..end {
                page.put_pixel(x, row, color);
            }
        }
    }
}

/// Strokes each segment as a quad extended by half the width at both ends.
fn stroke_subpath(page: &mut RgbaImage, subpath: &SubPath, half_width: f32, rgb: [u8; 3]) {
    let points = &subpath.points;
    let closing = subpath.closed.then(|| (points.last(), points.first()));

    let mut segments: Vec<((f32, f32), (f32, f32))> =
        points.windows(2).map(|pair| (pair[0], pair[1])).collect();
    if let Some((Some(&last), Some(&first))) = closing {
        segments.push((last, first));
    }

    for (a, b) in segments {
        let (dx, dy) = (b.0 - a.0, b.1 - a.1);
        let length = (dx * dx + dy * dy).sqrt();
        if length <= f32::EPSILON {
            continue;
        }

        let (ux, uy) = (dx / length * half_width, dy / length * half_width);
        let (nx, ny) = (-uy, ux);
        let quad = [
            (a.0 - ux + nx, a.1 - uy + ny),
            (b.0 + ux + nx, b.1 + uy + ny),
            (b.0 + ux - nx, b.1 + uy - ny),
            (a.0 - ux - nx, a.1 - uy - ny),
        ];
        fill_polygons(page, &[&quad], FillRule::NonZero, rgb);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);

    fn a4() -> (RgbaImage, PageTransform) {
        let transform = PageTransform {
            origin_x: 0.0,
            origin_y: 0.0,
            width_pt: 595.0,
            height_pt: 842.0,
            raster_width: 595,
            raster_height: 842,
        };
        (RgbaImage::from_pixel(595, 842, WHITE), transform)
    }

    fn count(page: &RgbaImage, rgb: [u8; 3]) -> usize {
        page.pixels().filter(|pixel| pixel.0 == [rgb[0], rgb[1], rgb[2], 255]).count()
    }

    #[test]
    fn filled_rectangle_covers_exact_pixels() {
        let (mut page, transform) = a4();

        let skipped =
            render_content(&mut page, b"0 0 0 rg 100 100 300 300 re f", transform).expect("render");

        assert!(skipped.is_empty());
        assert_eq!(count(&page, [0, 0, 0]), 300 * 300);
        // y is flipped: user-space y=100..400 lands on rows 442..742.
        assert_eq!(page.get_pixel(100, 442).0, [0, 0, 0, 255]);
        assert_eq!(page.get_pixel(100, 441).0, WHITE.0);
        assert_eq!(page.get_pixel(399, 741).0, [0, 0, 0, 255]);
        assert_eq!(page.get_pixel(400, 741).0, WHITE.0);
    }

    #[test]
    fn raster_scale_and_media_box_origin_are_applied() {
        let transform = PageTransform {
            origin_x: 50.0,
            origin_y: 50.0,
            width_pt: 100.0,
            height_pt: 100.0,
            raster_width: 200,
            raster_height: 200,
        };
        let mut page = RgbaImage::from_pixel(200, 200, WHITE);

        render_content(&mut page, b"1 0 0 rg 50 50 10 10 re f", transform).expect("render");

        assert_eq!(count(&page, [255, 0, 0]), 20 * 20);
        assert_eq!(page.get_pixel(0, 199).0, [255, 0, 0, 255]);
    }

    #[test]
    fn even_odd_leaves_a_hole() {
        let (mut page, transform) = a4();
        let content = b"0.5 g 100 100 200 200 re 150 150 100 100 re f*";

        render_content(&mut page, content, transform).expect("render");

        assert_eq!(count(&page, [128, 128, 128]), 200 * 200 - 100 * 100);
        assert_eq!(page.get_pixel(200, 842 - 200).0, WHITE.0);
    }

    #[test]
    fn graphics_state_restores_colour_and_transform() {
        let (mut page, transform) = a4();
        let content = b"q 0 0 1 rg 2 0 0 2 0 0 cm 10 10 10 10 re f Q 10 10 10 10 re f";

        render_content(&mut page, content, transform).expect("render");

        assert_eq!(count(&page, [0, 0, 255]), 20 * 20);
        assert_eq!(count(&page, [0, 0, 0]), 10 * 10);
    }

    #[test]
    fn stroked_line_has_its_width() {
        let (mut page, transform) = a4();

        render_content(&mut page, b"0 1 0 RG 4 w 100 421 m 300 421 l S", transform).expect("render");

        let green = (0..842).filter(|&y| page.get_pixel(200, y).0 == [0, 255, 0, 255]).count();
        assert_eq!(green, 4);
        assert_eq!(page.get_pixel(50, 421).0, WHITE.0);
    }

    #[test]
    fn cmyk_black_is_black() {
        let (mut page, transform) = a4();

        render_content(&mut page, b"0 0 0 1 k 0 0 10 10 re f", transform).expect("render");

        assert_eq!(count(&page, [0, 0, 0]), 100);
    }

    #[test]
    fn text_and_images_are_reported() {
        let (mut page, transform) = a4();
        let content = b"BT /F1 12 Tf 72 720 Td (Hello) Tj ET q 100 0 0 100 0 0 cm /Im1 Do Q";

        let skipped = render_content(&mut page, content, transform).expect("render");

        assert_eq!(skipped, SkippedContent { text: true, images: true, shadings: false });
        assert!(page.pixels().all(|pixel| *pixel == WHITE));
    }
}
