//! Document handles and the capability traits behind them.
//!
//! The pipeline never talks to pdfium or an image decoder directly. A
//! [`DocumentBackend`] opens raw bytes into an [`OpenedDocument`], and the
//! orchestrator wraps that in a [`DocumentHandle`] which it owns for exactly
//! one extraction call.
//!
//! ## Release guarantee
//!
//! A handle is released exactly once on every exit path. [`DocumentHandle::release`]
//! consumes the handle; if the handle is instead dropped (an early `?`, the
//! overall timeout dropping the whole run future, a panic) `Drop` performs
//! the release. Backends therefore see exactly one `close()` per `open()`.

use crate::error::AdapterError;
use async_trait::async_trait;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use tracing::debug;

/// The two input modalities the pipeline accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    /// Paginated document with a (possibly empty) text layer, i.e. a PDF.
    TextDocument,
    /// Single raster image (photo or scan).
    Image,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::TextDocument => f.write_str("document"),
            SourceKind::Image => f.write_str("image"),
        }
    }
}

/// A rendered page, ready for OCR.
#[derive(Clone)]
pub struct Bitmap {
    image: DynamicImage,
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}

impl Bitmap {
    pub fn new(image: DynamicImage) -> Self {
        Self { image }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn into_image(self) -> DynamicImage {
        self.image
    }

    /// Encode as PNG. Lossless, so glyph edges survive for the recognizer.
    pub fn to_png(&self) -> Result<Vec<u8>, image::ImageError> {
        let mut buf = Vec::new();
        self.image
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
        Ok(buf)
    }
}

/// An opened document as seen by a backend.
///
/// Page numbers are 1-indexed. `close` is called exactly once, by
/// [`DocumentHandle`]; no other method is called after it.
#[async_trait]
pub trait OpenedDocument: Send + Sync {
    fn page_count(&self) -> usize;

    /// Text layer of one page. Images return [`AdapterError::Unsupported`].
    async fn page_text(&self, page_number: usize) -> Result<String, AdapterError>;

    /// Rasterise one page at `scale` × its natural size.
    async fn render_page_to_image(
        &self,
        page_number: usize,
        scale: f32,
    ) -> Result<Bitmap, AdapterError>;

    fn close(&mut self);
}

/// Opens validated input bytes into an [`OpenedDocument`].
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Implementations must not leak the document if the returned future is
    /// dropped before completion (the load timeout does exactly that).
    async fn open(
        &self,
        bytes: Vec<u8>,
        kind: SourceKind,
    ) -> Result<Box<dyn OpenedDocument>, AdapterError>;
}

/// An opened document owned by one extraction call.
pub struct DocumentHandle {
    inner: Box<dyn OpenedDocument>,
    page_count: usize,
    byte_size: u64,
    source_kind: SourceKind,
    released: bool,
}

impl fmt::Debug for DocumentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentHandle")
            .field("page_count", &self.page_count)
            .field("byte_size", &self.byte_size)
            .field("source_kind", &self.source_kind)
            .finish()
    }
}

impl DocumentHandle {
    pub(crate) fn new(inner: Box<dyn OpenedDocument>, byte_size: u64, source_kind: SourceKind) -> Self {
        let page_count = inner.page_count();
        Self {
            inner,
            page_count,
            byte_size,
            source_kind,
            released: false,
        }
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    pub fn source_kind(&self) -> SourceKind {
        self.source_kind
    }

    fn check_page(&self, page_number: usize) -> Result<(), AdapterError> {
        if page_number == 0 || page_number > self.page_count {
            return Err(AdapterError::Failed(format!(
                "page {page_number} is out of range (document has {} pages)",
                self.page_count
            )));
        }
        Ok(())
    }

    pub async fn page_text(&self, page_number: usize) -> Result<String, AdapterError> {
        self.check_page(page_number)?;
        self.inner.page_text(page_number).await
    }

    pub async fn render_page(&self, page_number: usize, scale: f32) -> Result<Bitmap, AdapterError> {
        self.check_page(page_number)?;
        self.inner.render_page_to_image(page_number, scale).await
    }

    /// Release the underlying document now.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.inner.close();
            debug!(pages = self.page_count, kind = %self.source_kind, "document released");
        }
    }
}

impl Drop for DocumentHandle {
    fn drop(&mut self) {
        self.release_inner();
    }
}
