use crate::{
    raster_dimensions, DocumentHandle, OpenSource, PageSize, PdfEngine, PdfEngineError,
    RenderRequest, RgbaImage,
};
use pdfium_render::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

/// Directory searched first for the pdfium shared library.
pub const LIBRARY_DIR_ENV: &str = "PDFIUM_DYNAMIC_LIB_PATH";

struct PdfiumRecord {
    bytes: Vec<u8>,
    page_sizes: Vec<PageSize>,
}

/// Full-fidelity rasterizer backed by the pdfium library.
pub struct PdfiumEngine {
    pdfium: Pdfium,
    next_handle: u64,
    docs: HashMap<DocumentHandle, PdfiumRecord>,
}

fn backend(err: PdfiumError) -> PdfEngineError {
    PdfEngineError::Backend(err.to_string())
}

impl PdfiumEngine {
    /// Binds pdfium from `PDFIUM_DYNAMIC_LIB_PATH`, the executable's directory,
    /// the working directory, then the system library paths.
    pub fn bind() -> Result<Self, PdfEngineError> {
        let mut search: Vec<PathBuf> = Vec::new();
        if let Some(dir) = std::env::var_os(LIBRARY_DIR_ENV).filter(|dir| !dir.is_empty()) {
            search.push(PathBuf::from(dir));
        }
        if let Some(dir) = std::env::current_exe().ok().and_then(|exe| exe.parent().map(PathBuf::from)) {
            search.push(dir);
        }
        search.push(PathBuf::from("./"));

        for dir in &search {
            if let Ok(bindings) =
                Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(dir))
            {
                tracing::debug!(dir = %dir.display(), "bound pdfium");
                return Ok(Self::with_bindings(bindings));
            }
        }

        let bindings = Pdfium::bind_to_system_library()
            .map_err(|err| PdfEngineError::RasterizerUnavailable(err.to_string()))?;
        tracing::debug!("bound system pdfium");

        Ok(Self::with_bindings(bindings))
    }

    fn with_bindings(bindings: Box<dyn PdfiumLibraryBindings>) -> Self {
        Self { pdfium: Pdfium::new(bindings), next_handle: 0, docs: HashMap::new() }
    }

    fn record(&self, handle: DocumentHandle) -> Result<&PdfiumRecord, PdfEngineError> {
        self.docs.get(&handle).ok_or(PdfEngineError::InvalidHandle(handle.raw()))
    }
}

impl PdfEngine for PdfiumEngine {
    fn open(&mut self, source: OpenSource) -> Result<DocumentHandle, PdfEngineError> {
        let bytes = match source {
            OpenSource::Path(path) => fs::read(path)?,
            OpenSource::Bytes(bytes) => bytes,
        };

        let page_sizes = {
            let document = self.pdfium.load_pdf_from_byte_slice(&bytes, None).map_err(backend)?;
            document
                .pages()
                .iter()
                .map(|page| PageSize { width_pt: page.width().value, height_pt: page.height().value })
                .collect::<Vec<_>>()
        };

        if page_sizes.is_empty() {
            return Err(PdfEngineError::NoPages);
        }

        self.next_handle += 1;
        let handle = DocumentHandle(self.next_handle);
        tracing::debug!(handle = handle.raw(), pages = page_sizes.len(), "opened document with pdfium");
        self.docs.insert(handle, PdfiumRecord { bytes, page_sizes });

        Ok(handle)
    }

    fn page_count(&self, handle: DocumentHandle) -> Result<u32, PdfEngineError> {
        Ok(self.record(handle)?.page_sizes.len() as u32)
    }

    fn page_size(
        &self,
        handle: DocumentHandle,
        page_index: u32,
    ) -> Result<PageSize, PdfEngineError> {
        let record = self.record(handle)?;
        record.page_sizes.get(page_index as usize).copied().ok_or(PdfEngineError::PageOutOfRange {
            page: page_index,
            page_count: record.page_sizes.len() as u32,
        })
    }

    fn render_page(
        &self,
        handle: DocumentHandle,
        request: RenderRequest,
    ) -> Result<RgbaImage, PdfEngineError> {
        let page_size = self.page_size(handle, request.page_index)?;
        let (width, height) = raster_dimensions(page_size, request.scale);
        let index = pdfium_page_index(request.page_index, self.page_count(handle)?)?;

        let record = self.record(handle)?;
        let document = self.pdfium.load_pdf_from_byte_slice(&record.bytes, None).map_err(backend)?;
        let page = document.pages().get(index).map_err(backend)?;

        let config = PdfRenderConfig::new().set_target_size(width as i32, height as i32);
        let bitmap = page.render_with_config(&config).map_err(backend)?;

        let (bitmap_width, bitmap_height) = (bitmap.width() as u32, bitmap.height() as u32);
        RgbaImage::from_raw(bitmap_width, bitmap_height, bitmap.as_rgba_bytes()).ok_or_else(|| {
            PdfEngineError::Backend(format!(
                "pdfium returned a malformed {bitmap_width}x{bitmap_height} bitmap"
            ))
        })
    }

    fn close(&mut self, handle: DocumentHandle) -> Result<(), PdfEngineError> {
        tracing::debug!(handle = handle.raw(), "closing document");
        self.docs.remove(&handle).map(|_| ()).ok_or(PdfEngineError::InvalidHandle(handle.raw()))
    }
}

/// pdfium addresses pages with `u16`; larger indices cannot be rendered.
fn pdfium_page_index(page_index: u32, page_count: u32) -> Result<u16, PdfEngineError> {
    u16::try_from(page_index).map_err(|_| PdfEngineError::PageOutOfRange { page: page_index, page_count })
}
