//! One signing session per open document.
//!
//! A [`SigningSession`] owns the rasterization handle and the placement store.
//! The handle is released on [`SigningSession::close`] or when the session is
//! dropped, whichever comes first.

use crate::compose::{compose, ComposeOptions, ExportReport};
use crate::coordinates::PdfPoint;
use crate::error::{SignError, SignResult};
use crate::placement::{Placement, PlacementStore};
use image::RgbaImage;
use pdf_engine::{DocumentHandle, OpenSource, PageSize, PdfEngine, RenderRequest};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Suggested file name for the signed copy: `<stem>_signed.pdf` next to the source.
pub fn default_output_name(source: &Path) -> PathBuf {
    let stem = source.file_stem().and_then(|name| name.to_str()).unwrap_or("document");
    source.with_file_name(format!("{stem}_signed.pdf"))
}

/// Allows a single export per session at a time.
#[derive(Debug, Clone, Default)]
pub struct ExportGate {
    busy: Arc<AtomicBool>,
}

impl ExportGate {
    pub fn try_begin(&self) -> SignResult<ExportTicket> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SignError::ExportInProgress)?;

        Ok(ExportTicket { busy: Arc::clone(&self.busy) })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Held for the duration of an export; reopens the gate when dropped.
#[derive(Debug)]
pub struct ExportTicket {
    busy: Arc<AtomicBool>,
}

impl Drop for ExportTicket {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

struct OpenHandle<'e, E: PdfEngine> {
    engine: &'e mut E,
    handle: DocumentHandle,
}

impl<E: PdfEngine> Drop for OpenHandle<'_, E> {
    fn drop(&mut self) {
        if let Err(err) = self.engine.close(self.handle) {
            tracing::warn!(handle = self.handle.raw(), error = %err, "failed to close document");
        }
    }
}

fn open_document<E: PdfEngine>(engine: &mut E, source: &OpenSource) -> SignResult<DocumentHandle> {
    engine
        .open(source.clone())
        .map_err(|err| SignError::UnreadableDocument { path: source.describe(), source: err })
}

/// Writes through a staging file in the destination directory and renames it into
/// place only after `write` succeeds. Nothing is left at `dest` on failure.
fn publish_atomically<F>(dest: &Path, write: F) -> SignResult<ExportReport>
where
    F: FnOnce(&mut BufWriter<&mut std::fs::File>) -> SignResult<ExportReport>,
{
    let dir = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut staging =
        tempfile::Builder::new().prefix(".signpdf-").suffix(".part").tempfile_in(dir)?;

    let report = {
        let mut writer = BufWriter::new(staging.as_file_mut());
        let report = write(&mut writer)?;
        writer.flush()?;
        report
    };
    staging.as_file().sync_all()?;

    staging.persist(dest).map_err(|err| SignError::OutputWrite(err.error))?;
    tracing::info!(path = %dest.display(), "published signed document");

    Ok(report)
}

pub struct SigningSession<E: PdfEngine> {
    engine: E,
    handle: DocumentHandle,
    open: bool,
    source: OpenSource,
    page_count: u32,
    placements: PlacementStore,
    gate: ExportGate,
}

impl<E: PdfEngine> SigningSession<E> {
    pub fn open(mut engine: E, source: impl Into<OpenSource>) -> SignResult<Self> {
        let source = source.into();
        let handle = open_document(&mut engine, &source)?;

        let page_count = match engine.page_count(handle) {
            Ok(count) => count,
            Err(err) => {
                if let Err(close_err) = engine.close(handle) {
                    tracing::warn!(handle = handle.raw(), error = %close_err, "failed to close document");
                }
                return Err(SignError::UnreadableDocument { path: source.describe(), source: err });
            }
        };

        tracing::info!(source = %source.describe(), pages = page_count, "signing session opened");

        Ok(Self {
            engine,
            handle,
            open: true,
            source,
            page_count,
            placements: PlacementStore::new(),
            gate: ExportGate::default(),
        })
    }

    pub fn source(&self) -> &OpenSource {
        &self.source
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn page_size(&self, page_index: u32) -> SignResult<PageSize> {
        self.ensure_page(page_index)?;
        self.engine
            .page_size(self.handle, page_index)
            .map_err(|source| SignError::PageRender { page: page_index, source })
    }

    /// Rasterizes a page for display.
    pub fn render_page(&self, page_index: u32, scale: f32) -> SignResult<RgbaImage> {
        self.ensure_page(page_index)?;
        self.engine
            .render_page(self.handle, RenderRequest::page(page_index).with_scale(scale))
            .map_err(|source| SignError::PageRender { page: page_index, source })
    }

    pub fn placements(&self) -> &PlacementStore {
        &self.placements
    }

    pub fn place(&mut self, page_index: u32, image: Arc<RgbaImage>, anchor: PdfPoint) -> SignResult<()> {
        self.ensure_page(page_index)?;
        self.placements.put(page_index, image, anchor)?;
        tracing::debug!(page = page_index, x = anchor.x, y = anchor.y, "placed signature");
        Ok(())
    }

    pub fn place_on_all_pages(&mut self, image: Arc<RgbaImage>, anchor: PdfPoint) -> SignResult<()> {
        self.placements.put_for_all_pages(image, anchor, self.page_count)?;
        tracing::debug!(pages = self.page_count, x = anchor.x, y = anchor.y, "placed signature on all pages");
        Ok(())
    }

    pub fn unplace(&mut self, page_index: u32) -> Option<Placement> {
        self.placements.remove(page_index)
    }

    pub fn is_exporting(&self) -> bool {
        self.gate.is_busy()
    }

    /// Exports the current document with its current placements into `writer`.
    pub fn export<W: Write>(&self, writer: W, options: &ComposeOptions) -> SignResult<ExportReport> {
        let _ticket = self.gate.try_begin()?;
        compose(&self.engine, self.handle, &self.placements, options, writer)
    }

    /// Like [`export`](Self::export), but publishes to `dest` atomically.
    pub fn export_to_path(&self, dest: &Path, options: &ComposeOptions) -> SignResult<ExportReport> {
        let _ticket = self.gate.try_begin()?;
        publish_atomically(dest, |writer| {
            compose(&self.engine, self.handle, &self.placements, options, writer)
        })
    }

    /// Snapshots the placements for an export that runs off the interactive thread.
    ///
    /// The session refuses further exports until the returned job is finished or dropped.
    pub fn prepare_export(&self, options: ComposeOptions) -> SignResult<ExportJob> {
        let ticket = self.gate.try_begin()?;

        Ok(ExportJob {
            source: self.source.clone(),
            placements: self.placements.clone(),
            options,
            _ticket: ticket,
        })
    }

    pub fn close(mut self) -> SignResult<()> {
        self.open = false;
        self.engine.close(self.handle).map_err(|source| SignError::Close {
            path: self.source.describe(),
            source,
        })
    }

    fn ensure_page(&self, page_index: u32) -> SignResult<()> {
        if page_index >= self.page_count {
            return Err(SignError::PageOutOfRange { page: page_index, page_count: self.page_count });
        }
        Ok(())
    }
}

impl<E: PdfEngine> Drop for SigningSession<E> {
    fn drop(&mut self) {
        if !self.open {
            return;
        }

        self.open = false;
        if let Err(err) = self.engine.close(self.handle) {
            tracing::warn!(handle = self.handle.raw(), error = %err, "failed to close document");
        }
    }
}

/// A detached export. Opens its own handle on the source so the session's
/// handle is never shared across threads.
#[derive(Debug)]
pub struct ExportJob {
    source: OpenSource,
    placements: PlacementStore,
    options: ComposeOptions,
    _ticket: ExportTicket,
}

impl ExportJob {
    pub fn run<E: PdfEngine, W: Write>(self, engine: &mut E, writer: W) -> SignResult<ExportReport> {
        let handle = open_document(engine, &self.source)?;
        let open = OpenHandle { engine, handle };
        compose(&*open.engine, open.handle, &self.placements, &self.options, writer)
    }

    pub fn run_to_path<E: PdfEngine>(self, engine: &mut E, dest: &Path) -> SignResult<ExportReport> {
        let handle = open_document(engine, &self.source)?;
        let open = OpenHandle { engine, handle };
        publish_atomically(dest, |writer| {
            compose(&*open.engine, open.handle, &self.placements, &self.options, writer)
        })
    }

    pub fn spawn<E>(self, mut engine: E, dest: PathBuf) -> JoinHandle<SignResult<ExportReport>>
    where
        E: PdfEngine + Send + 'static,
    {
        thread::spawn(move || self.run_to_path(&mut engine, &dest))
    }
}
