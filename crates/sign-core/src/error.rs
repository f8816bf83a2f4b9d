use doc_model::ModelError;
use pdf_engine::PdfEngineError;
use std::io;

/// Errors raised while placing signatures or exporting a signed document.
///
/// Every export failure is terminal: callers must not treat the destination
/// as a usable file once one of these is returned.
#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("cannot open document {path}")]
    UnreadableDocument {
        path: String,
        #[source]
        source: PdfEngineError,
    },
    #[error("failed to release document {path}")]
    Close {
        path: String,
        #[source]
        source: PdfEngineError,
    },
    #[error("failed to rasterize page {page}")]
    PageRender {
        page: u32,
        #[source]
        source: PdfEngineError,
    },
    #[error("failed to write output document")]
    OutputWrite(#[from] io::Error),
    #[error("signature image must have a non-zero size, got {width}x{height}")]
    InvalidPlacement { width: u32, height: u32 },
    #[error("signature would be {width}x{height}px at this size, more than {limit}px tall")]
    OversizedSignature { width: u32, height: u32, limit: u32 },
    #[error("page {page} out of range (page_count={page_count})")]
    PageOutOfRange { page: u32, page_count: u32 },
    #[error("signature pad has no strokes to export")]
    EmptySignature,
    #[error("an export is already running for this document")]
    ExportInProgress,
    #[error(transparent)]
    Model(#[from] ModelError),
}

impl From<lopdf::Error> for SignError {
    fn from(err: lopdf::Error) -> Self {
        Self::OutputWrite(io::Error::other(err))
    }
}

pub type SignResult<T> = Result<T, SignError>;
