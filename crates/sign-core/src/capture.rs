//! Freehand signature capture.
//!
//! A [`SignaturePad`] accumulates pointer strokes in surface pixel coordinates
//! and exports them as an anti-aliased raster on a transparent background.

use crate::error::{SignError, SignResult};
use doc_model::SignatureColor;
use image::{imageops, Pixel, Rgba, RgbaImage};
use std::fmt;

pub const DEFAULT_STROKE_WIDTH: f32 = 5.0;

/// Invoked whenever the pad flips between empty and non-empty.
pub type DrawStateListener = Box<dyn FnMut(bool) + Send>;

pub struct SignaturePad {
    width: u32,
    height: u32,
    strokes: Vec<Vec<(f32, f32)>>,
    pen_down: bool,
    has_drawn: bool,
    color: SignatureColor,
    stroke_width: f32,
    background: Option<RgbaImage>,
    listener: Option<DrawStateListener>,
}

impl fmt::Debug for SignaturePad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignaturePad")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("strokes", &self.strokes.len())
            .field("has_drawn", &self.has_drawn)
            .field("color", &self.color)
            .field("stroke_width", &self.stroke_width)
            .field("background", &self.background.as_ref().map(RgbaImage::dimensions))
            .finish()
    }
}

impl SignaturePad {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            strokes: Vec::new(),
            pen_down: false,
            has_drawn: false,
            color: SignatureColor::default(),
            stroke_width: DEFAULT_STROKE_WIDTH,
            background: None,
            listener: None,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn color(&self) -> SignatureColor {
        self.color
    }

    pub fn set_color(&mut self, color: SignatureColor) {
        self.color = color;
    }

    pub fn set_stroke_width(&mut self, width: f32) {
        if width.is_finite() && width > 0.0 {
            self.stroke_width = width;
        }
    }

    /// Image drawn underneath the strokes, anchored at the top-left corner.
    pub fn set_background(&mut self, background: Option<RgbaImage>) {
        self.background = background;
    }

    pub fn on_draw_state_changed(&mut self, listener: DrawStateListener) {
        self.listener = Some(listener);
    }

    pub fn begin_stroke(&mut self, x: f32, y: f32) {
        self.strokes.push(vec![(x, y)]);
        self.pen_down = true;
    }

    pub fn extend_stroke(&mut self, x: f32, y: f32) {
        if !self.pen_down {
            self.begin_stroke(x, y);
            return;
        }

        if let Some(stroke) = self.strokes.last_mut() {
            stroke.push((x, y));
        }
        self.set_has_drawn(true);
    }

    pub fn end_stroke(&mut self) {
        self.pen_down = false;
    }

    /// Convenience for replaying a recorded polyline as one stroke.
    pub fn draw_polyline(&mut self, points: &[(f32, f32)]) {
        let Some((&(x, y), rest)) = points.split_first() else {
            return;
        };

        self.begin_stroke(x, y);
        for &(x, y) in rest {
            self.extend_stroke(x, y);
        }
        self.end_stroke();
    }

    pub fn clear(&mut self) {
        self.strokes.clear();
        self.pen_down = false;
        self.set_has_drawn(false);
    }

    pub fn is_empty(&self) -> bool {
        !self.has_drawn
    }

    pub fn export(&self) -> SignResult<RgbaImage> {
        if self.is_empty() {
            return Err(SignError::EmptySignature);
        }
        if self.width == 0 || self.height == 0 {
            return Err(SignError::InvalidPlacement { width: self.width, height: self.height });
        }

        let [r, g, b] = self.color.rgb();
        // Transparent pixels keep the ink colour so filtered scaling does not darken the edges.
        let mut canvas = RgbaImage::from_pixel(self.width, self.height, Rgba([r, g, b, 0]));

        if let Some(background) = &self.background {
            imageops::overlay(&mut canvas, background, 0, 0);
        }

        let coverage = stroke_coverage(self.width, self.height, &self.strokes, self.stroke_width);
        for (pixel, cover) in canvas.pixels_mut().zip(coverage) {
            if cover <= 0.0 {
                continue;
            }
            let alpha = (cover * 255.0).round() as u8;
            pixel.blend(&Rgba([r, g, b, alpha]));
        }

        Ok(canvas)
    }

    fn set_has_drawn(&mut self, has_drawn: bool) {
        if self.has_drawn == has_drawn {
            return;
        }

        self.has_drawn = has_drawn;
        if let Some(listener) = self.listener.as_mut() {
            listener(has_drawn);
        }
    }
}

/// Per-pixel ink coverage in `[0, 1]` for round-capped strokes of `stroke_width`.
fn stroke_coverage(width: u32, height: u32, strokes: &[Vec<(f32, f32)>], stroke_width: f32) -> Vec<f32> {
    let mut coverage = vec![0.0f32; width as usize * height as usize];
    let radius = stroke_width / 2.0;
    let reach = radius + 1.0;

    for stroke in strokes {
        for segment in stroke.windows(2) {
            let (a, b) = (segment[0], segment[1]);

            let min_x = (a.0.min(b.0) - reach).floor().max(0.0) as u32;
            let min_y = (a.1.min(b.1) - reach).floor().max(0.0) as u32;
            let max_x = ((a.0.max(b.0) + reach).ceil().max(0.0) as u32).min(width);
            let max_y = ((a.1.max(b.1) + reach).ceil().max(0.0) as u32).min(height);

            for y in min_y..max_y {
                for x in min_x..max_x {
                    let d = distance_to_segment((x as f32 + 0.5, y as f32 + 0.5), a, b);
                    let cover = (radius + 0.5 - d).clamp(0.0, 1.0);
                    let slot = &mut coverage[y as usize * width as usize + x as usize];
                    if cover > *slot {
                        *slot = cover;
                    }
                }
            }
        }
    }

    coverage
}

fn distance_to_segment(p: (f32, f32), a: (f32, f32), b: (f32, f32)) -> f32 {
    let (dx, dy) = (b.0 - a.0, b.1 - a.1);
    let len_sq = dx * dx + dy * dy;

    let t = if len_sq <= f32::EPSILON {
        0.0
    } else {
        (((p.0 - a.0) * dx + (p.1 - a.1) * dy) / len_sq).clamp(0.0, 1.0)
    };

    let (cx, cy) = (a.0 + t * dx, a.1 + t * dy);
    ((p.0 - cx).powi(2) + (p.1 - cy).powi(2)).sqrt()
}
