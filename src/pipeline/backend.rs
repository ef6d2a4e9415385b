//! Default document backends: pdfium for PDFs, the `image` crate for photos.
//!
//! ## Why a dedicated pdfium thread?
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which keeps
//! global state and is not safe to drive from several threads at once.
//! Rather than re-binding the library inside every `spawn_blocking` call,
//! one long-lived `pdfium` thread owns the [`Pdfium`] instance and every
//! open [`PdfDocument`]. Async callers talk to it over a channel and await
//! a `oneshot` reply, so tokio worker threads never block on rendering.
//!
//! ## Why close on a dropped reply?
//!
//! The loader wraps `open` in a timeout. If the timeout fires while pdfium
//! is still parsing, the caller's reply receiver is gone by the time the
//! document is ready. The worker notices the failed reply and drops the
//! document immediately instead of keeping it in its table forever.
//!
//! ## Library discovery
//!
//! `PDFIUM_LIB_PATH` (a library file or the directory holding it), then the
//! working directory, then the system library search path.

use crate::document::{Bitmap, DocumentBackend, OpenedDocument, SourceKind};
use crate::error::AdapterError;
use async_trait::async_trait;
use image::imageops::FilterType;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{mpsc, Arc, OnceLock};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Environment variable naming the pdfium shared library (file or directory).
pub const PDFIUM_LIB_PATH_ENV: &str = "PDFIUM_LIB_PATH";

/// Longest edge of any rendered bitmap, in pixels.
pub const MAX_RENDER_EDGE: u32 = 4096;

// ── Default backend ──────────────────────────────────────────────────────────

/// Routes documents to pdfium and images to the in-memory decoder.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBackend {
    pdf: PdfiumBackend,
    image: ImageBackend,
}

impl DefaultBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentBackend for DefaultBackend {
    async fn open(
        &self,
        bytes: Vec<u8>,
        kind: SourceKind,
    ) -> Result<Box<dyn OpenedDocument>, AdapterError> {
        match kind {
            SourceKind::TextDocument => self.pdf.open(bytes, kind).await,
            SourceKind::Image => self.image.open(bytes, kind).await,
        }
    }
}

// ── pdfium ───────────────────────────────────────────────────────────────────

type Reply<T> = oneshot::Sender<Result<T, AdapterError>>;

enum Command {
    Open {
        bytes: Vec<u8>,
        reply: Reply<(u64, usize)>,
    },
    Text {
        id: u64,
        page: usize,
        reply: Reply<String>,
    },
    Render {
        id: u64,
        page: usize,
        scale: f32,
        reply: Reply<DynamicImage>,
    },
    Close {
        id: u64,
    },
}

static WORKER: OnceLock<mpsc::Sender<Command>> = OnceLock::new();

/// Sender for the process-wide pdfium thread, starting it on first use.
fn worker() -> &'static mpsc::Sender<Command> {
    WORKER.get_or_init(|| {
        let (tx, rx) = mpsc::channel();
        if let Err(e) = std::thread::Builder::new()
            .name("pdfium".into())
            .spawn(move || run_worker(rx))
        {
            // The receiver is gone with the closure; every send reports it.
            warn!("Failed to start pdfium thread: {e}");
        }
        tx
    })
}

fn worker_gone() -> AdapterError {
    AdapterError::Unavailable("pdfium worker is not running".into())
}

fn bind_pdfium() -> Result<Box<dyn PdfiumLibraryBindings>, String> {
    if let Ok(configured) = std::env::var(PDFIUM_LIB_PATH_ENV) {
        let path = PathBuf::from(&configured);
        let lib = if path.is_dir() {
            Pdfium::pdfium_platform_library_name_at_path(&path)
        } else {
            path
        };
        return Pdfium::bind_to_library(&lib)
            .map_err(|e| format!("cannot load pdfium from {}: {e:?}", lib.display()));
    }

    Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
        .or_else(|_| Pdfium::bind_to_system_library())
        .map_err(|e| format!("pdfium library not found (set {PDFIUM_LIB_PATH_ENV}): {e:?}"))
}

fn pdfium_failed(e: PdfiumError) -> AdapterError {
    AdapterError::Failed(format!("{e:?}"))
}

fn page_index(page: usize) -> Result<u16, AdapterError> {
    page.checked_sub(1)
        .and_then(|i| u16::try_from(i).ok())
        .ok_or_else(|| AdapterError::Failed(format!("page {page} is out of range")))
}

fn run_worker(rx: mpsc::Receiver<Command>) {
    let (pdfium, bind_error) = match bind_pdfium() {
        Ok(bindings) => {
            info!("pdfium bound");
            (Some(Pdfium::new(bindings)), String::new())
        }
        Err(e) => {
            warn!("{e}");
            (None, e)
        }
    };
    let mut documents: HashMap<u64, PdfDocument<'_>> = HashMap::new();
    let mut next_id = 0u64;

    while let Ok(command) = rx.recv() {
        match command {
            Command::Open { bytes, reply } => {
                let Some(pdfium) = pdfium.as_ref() else {
                    let _ = reply.send(Err(AdapterError::Unavailable(bind_error.clone())));
                    continue;
                };
                match pdfium.load_pdf_from_byte_vec(bytes, None) {
                    Ok(document) => {
                        next_id += 1;
                        let pages = document.pages().len() as usize;
                        if reply.send(Ok((next_id, pages))).is_ok() {
                            documents.insert(next_id, document);
                        } else {
                            debug!(id = next_id, "open abandoned by caller, closing");
                        }
                    }
                    Err(e) => {
                        let _ = reply.send(Err(pdfium_failed(e)));
                    }
                }
            }
            Command::Text { id, page, reply } => {
                let result = match documents.get(&id) {
                    Some(document) => extract_text(document, page),
                    None => Err(AdapterError::Failed(format!("document {id} is not open"))),
                };
                let _ = reply.send(result);
            }
            Command::Render {
                id,
                page,
                scale,
                reply,
            } => {
                let result = match documents.get(&id) {
                    Some(document) => render(document, page, scale),
                    None => Err(AdapterError::Failed(format!("document {id} is not open"))),
                };
                let _ = reply.send(result);
            }
            Command::Close { id } => {
                documents.remove(&id);
            }
        }
    }
}

fn extract_text(document: &PdfDocument<'_>, page: usize) -> Result<String, AdapterError> {
    let pdf_page = document.pages().get(page_index(page)?).map_err(pdfium_failed)?;
    let text = pdf_page.text().map_err(pdfium_failed)?;
    Ok(text.all())
}

fn render(document: &PdfDocument<'_>, page: usize, scale: f32) -> Result<DynamicImage, AdapterError> {
    let pdf_page = document.pages().get(page_index(page)?).map_err(pdfium_failed)?;
    let config = PdfRenderConfig::new()
        .scale_page_by_factor(scale)
        .set_maximum_width(MAX_RENDER_EDGE as i32)
        .set_maximum_height(MAX_RENDER_EDGE as i32);
    let bitmap = pdf_page.render_with_config(&config).map_err(pdfium_failed)?;
    let image = bitmap.as_image();
    debug!(page, width = image.width(), height = image.height(), "rendered");
    Ok(image)
}

/// Opens PDFs on the shared pdfium thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfiumBackend;

#[async_trait]
impl DocumentBackend for PdfiumBackend {
    async fn open(
        &self,
        bytes: Vec<u8>,
        kind: SourceKind,
    ) -> Result<Box<dyn OpenedDocument>, AdapterError> {
        if kind != SourceKind::TextDocument {
            return Err(AdapterError::Unsupported(format!("pdfium cannot open an {kind}")));
        }
        let sender = worker().clone();
        let (reply, rx) = oneshot::channel();
        sender
            .send(Command::Open { bytes, reply })
            .map_err(|_| worker_gone())?;
        let (id, page_count) = rx.await.map_err(|_| worker_gone())??;
        debug!(id, page_count, "pdf opened");
        Ok(Box::new(PdfiumDocument {
            id,
            page_count,
            sender,
        }))
    }
}

struct PdfiumDocument {
    id: u64,
    page_count: usize,
    sender: mpsc::Sender<Command>,
}

impl PdfiumDocument {
    async fn request<T>(&self, command: Command, rx: oneshot::Receiver<Result<T, AdapterError>>) -> Result<T, AdapterError> {
        self.sender.send(command).map_err(|_| worker_gone())?;
        rx.await.map_err(|_| worker_gone())?
    }
}

#[async_trait]
impl OpenedDocument for PdfiumDocument {
    fn page_count(&self) -> usize {
        self.page_count
    }

    async fn page_text(&self, page_number: usize) -> Result<String, AdapterError> {
        let (reply, rx) = oneshot::channel();
        let command = Command::Text {
            id: self.id,
            page: page_number,
            reply,
        };
        self.request(command, rx).await
    }

    async fn render_page_to_image(
        &self,
        page_number: usize,
        scale: f32,
    ) -> Result<Bitmap, AdapterError> {
        let (reply, rx) = oneshot::channel();
        let command = Command::Render {
            id: self.id,
            page: page_number,
            scale,
            reply,
        };
        self.request(command, rx).await.map(Bitmap::new)
    }

    fn close(&mut self) {
        let _ = self.sender.send(Command::Close { id: self.id });
    }
}

// ── Images ───────────────────────────────────────────────────────────────────

/// Decodes JPEG/PNG/WebP/BMP/TIFF bytes into a one-page document.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageBackend;

#[async_trait]
impl DocumentBackend for ImageBackend {
    async fn open(
        &self,
        bytes: Vec<u8>,
        kind: SourceKind,
    ) -> Result<Box<dyn OpenedDocument>, AdapterError> {
        if kind != SourceKind::Image {
            return Err(AdapterError::Unsupported(format!("image decoder cannot open a {kind}")));
        }
        let image = tokio::task::spawn_blocking(move || image::load_from_memory(&bytes))
            .await
            .map_err(|e| AdapterError::Failed(format!("decode task panicked: {e}")))?
            .map_err(|e| AdapterError::Failed(format!("cannot decode image: {e}")))?;
        debug!(width = image.width(), height = image.height(), "image decoded");
        Ok(Box::new(ImageDocument::new(image)))
    }
}

/// A decoded raster image exposed as a single page without a text layer.
pub struct ImageDocument {
    image: Option<Arc<DynamicImage>>,
}

impl ImageDocument {
    pub fn new(image: DynamicImage) -> Self {
        Self {
            image: Some(Arc::new(image)),
        }
    }
}

/// Target dimensions for `scale`, with the longest edge capped.
fn scaled_dimensions(width: u32, height: u32, scale: f32) -> (u32, u32) {
    let mut w = (width as f32 * scale).round().max(1.0);
    let mut h = (height as f32 * scale).round().max(1.0);
    let longest = w.max(h);
    if longest > MAX_RENDER_EDGE as f32 {
        let shrink = MAX_RENDER_EDGE as f32 / longest;
        w = (w * shrink).round().max(1.0);
        h = (h * shrink).round().max(1.0);
    }
    (w as u32, h as u32)
}

#[async_trait]
impl OpenedDocument for ImageDocument {
    fn page_count(&self) -> usize {
        1
    }

    async fn page_text(&self, _page_number: usize) -> Result<String, AdapterError> {
        Err(AdapterError::Unsupported("images have no text layer".into()))
    }

    async fn render_page_to_image(
        &self,
        page_number: usize,
        scale: f32,
    ) -> Result<Bitmap, AdapterError> {
        if page_number != 1 {
            return Err(AdapterError::Failed(format!("image has no page {page_number}")));
        }
        let image = self
            .image
            .clone()
            .ok_or_else(|| AdapterError::Failed("image already closed".into()))?;
        let (w, h) = scaled_dimensions(image.width(), image.height(), scale);
        if (w, h) == (image.width(), image.height()) {
            return Ok(Bitmap::new((*image).clone()));
        }
        tokio::task::spawn_blocking(move || Bitmap::new(image.resize_exact(w, h, FilterType::Triangle)))
            .await
            .map_err(|e| AdapterError::Failed(format!("resize task panicked: {e}")))
    }

    fn close(&mut self) {
        self.image = None;
    }
}
