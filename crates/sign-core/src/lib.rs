//! Signature placement and signed-copy export for PDF documents.

pub mod capture;
pub mod compose;
pub mod coordinates;
pub mod error;
pub mod placement;
pub mod session;

pub use capture::{DrawStateListener, SignaturePad, DEFAULT_STROKE_WIDTH};
pub use compose::{
    anchor_to_pixels, composite_signature, compose, scaled_signature_size, ComposeOptions,
    ExportReport, PdfPageWriter, StampBounds,
};
pub use coordinates::{
    fit_display_rect, map_tap_in_display, map_tap_to_pdf_space, pdf_to_viewport, DisplayRect,
    PdfPoint, Size,
};
pub use error::{SignError, SignResult};
pub use placement::{Placement, PlacementStore};
pub use session::{default_output_name, ExportGate, ExportJob, ExportTicket, SigningSession};
