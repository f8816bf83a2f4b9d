//! Conversions between on-screen tap positions and PDF page space.
//!
//! Page space has its origin at the top-left corner of the page, y grows
//! downwards, and one unit is one point of the page's nominal size.

use pdf_engine::PageSize;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PdfPoint {
    pub x: f32,
    pub y: f32,
}

impl PdfPoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Size {
    pub width: f32,
    pub height: f32,
}

impl Size {
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }
}

impl From<PageSize> for Size {
    fn from(value: PageSize) -> Self {
        Self { width: value.width_pt, height: value.height_pt }
    }
}

/// Where the page image is actually drawn inside its viewport.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayRect {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

impl DisplayRect {
    pub fn filling(viewport: Size) -> Self {
        Self { left: 0.0, top: 0.0, width: viewport.width, height: viewport.height }
    }

    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= self.left
            && y >= self.top
            && x <= self.left + self.width
            && y <= self.top + self.height
    }
}

/// Linear scale from viewport pixels to page space, assuming the page image fills the viewport.
pub fn map_tap_to_pdf_space(tap_x: f32, tap_y: f32, viewport: Size, page: Size) -> PdfPoint {
    debug_assert!(viewport.width > 0.0 && viewport.height > 0.0, "viewport must be non-empty");

    PdfPoint {
        x: (tap_x / viewport.width) * page.width,
        y: (tap_y / viewport.height) * page.height,
    }
}

/// Aspect-fit, centred rectangle a page of `page` size occupies inside `viewport`.
pub fn fit_display_rect(viewport: Size, page: Size) -> DisplayRect {
    if viewport.width <= 0.0 || viewport.height <= 0.0 || page.width <= 0.0 || page.height <= 0.0
    {
        return DisplayRect::filling(viewport);
    }

    let scale = (viewport.width / page.width).min(viewport.height / page.height);
    let width = page.width * scale;
    let height = page.height * scale;

    DisplayRect {
        left: (viewport.width - width) / 2.0,
        top: (viewport.height - height) / 2.0,
        width,
        height,
    }
}

/// Maps a tap inside a letterboxed display. Taps on the letterbox bars map to `None`.
pub fn map_tap_in_display(tap_x: f32, tap_y: f32, rect: DisplayRect, page: Size) -> Option<PdfPoint> {
    if rect.width <= 0.0 || rect.height <= 0.0 || !rect.contains(tap_x, tap_y) {
        return None;
    }

    Some(map_tap_to_pdf_space(
        tap_x - rect.left,
        tap_y - rect.top,
        Size::new(rect.width, rect.height),
        page,
    ))
}

/// Inverse of [`map_tap_in_display`], used to draw a cursor marker over the page.
pub fn pdf_to_viewport(point: PdfPoint, rect: DisplayRect, page: Size) -> (f32, f32) {
    (
        rect.left + point.x / page.width * rect.width,
        rect.top + point.y / page.height * rect.height,
    )
}
