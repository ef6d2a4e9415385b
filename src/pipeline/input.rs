//! Input resolution: validate a caller-supplied source and open it.
//!
//! ## Validation order
//!
//! 1. Declared type (MIME type or file extension) must be a PDF or one of
//!    the accepted image formats. No declaration means "sniff the bytes".
//! 2. Size must stay under the ceiling for that kind. For paths this is
//!    checked from metadata before anything is read.
//! 3. Magic bytes must agree with the kind, so a `.pdf` that is really a
//!    JPEG is rejected here rather than crashing pdfium later.
//!
//! ## Why two timeouts?
//!
//! Downloads have their own, longer budget (`download_timeout`). Reading a
//! local file and opening it in the backend share `load_timeout`. When the
//! load timeout fires, the open future is dropped; backends are required to
//! close anything they finish opening after that point.

use crate::config::ExtractionOptions;
use crate::document::{DocumentBackend, DocumentHandle, SourceKind};
use crate::error::{ExtractionError, Stage};
use std::path::{Path, PathBuf};
use tokio::time::Instant;
use tracing::{debug, info};

/// Where the bytes of one extraction call come from.
#[derive(Debug, Clone)]
pub enum ExtractionSource {
    /// In-memory bytes with an optional declared MIME type or file name.
    Bytes {
        data: Vec<u8>,
        declared: Option<String>,
    },
    /// A local file; its extension is the declared type.
    Path(PathBuf),
    /// An `http://` or `https://` URL.
    Url(String),
}

impl ExtractionSource {
    pub fn bytes(data: impl Into<Vec<u8>>, declared: Option<&str>) -> Self {
        ExtractionSource::Bytes {
            data: data.into(),
            declared: declared.map(str::to_string),
        }
    }

    pub fn path(path: impl Into<PathBuf>) -> Self {
        ExtractionSource::Path(path.into())
    }

    pub fn url(url: impl Into<String>) -> Self {
        ExtractionSource::Url(url.into())
    }

    /// Interpret a command-line argument as a URL or a local path.
    pub fn parse(input: &str) -> Self {
        if is_url(input) {
            ExtractionSource::url(input)
        } else {
            ExtractionSource::path(input)
        }
    }
}

impl From<PathBuf> for ExtractionSource {
    fn from(path: PathBuf) -> Self {
        ExtractionSource::Path(path)
    }
}

impl From<&Path> for ExtractionSource {
    fn from(path: &Path) -> Self {
        ExtractionSource::Path(path.to_path_buf())
    }
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

// ── Type detection ───────────────────────────────────────────────────────────

const DOCUMENT_MIME: &[&str] = &["application/pdf", "application/x-pdf"];
const IMAGE_MIME: &[&str] = &[
    "image/jpeg",
    "image/jpg",
    "image/pjpeg",
    "image/png",
    "image/webp",
    "image/bmp",
    "image/x-bmp",
    "image/x-ms-bmp",
    "image/tiff",
];
const DOCUMENT_EXT: &[&str] = &["pdf"];
const IMAGE_EXT: &[&str] = &["jpg", "jpeg", "jpe", "png", "webp", "bmp", "tif", "tiff"];
/// Declarations that carry no type information.
const OPAQUE_MIME: &[&str] = &["application/octet-stream", "binary/octet-stream"];

/// Map a declared MIME type or file name onto a kind.
///
/// `Ok(None)` means nothing useful was declared and the bytes decide.
pub fn declared_kind(declared: &str) -> Result<Option<SourceKind>, ExtractionError> {
    let lowered = declared.trim().to_ascii_lowercase();
    let mime = lowered.split(';').next().unwrap_or("").trim();

    if mime.is_empty() || OPAQUE_MIME.contains(&mime) {
        return Ok(None);
    }
    if DOCUMENT_MIME.contains(&mime) {
        return Ok(Some(SourceKind::TextDocument));
    }
    if IMAGE_MIME.contains(&mime) {
        return Ok(Some(SourceKind::Image));
    }

    let file_name = lowered.rsplit(['/', '\\']).next().unwrap_or(&lowered);
    match file_name.rsplit_once('.') {
        Some((_, ext)) if DOCUMENT_EXT.contains(&ext) => Ok(Some(SourceKind::TextDocument)),
        Some((_, ext)) if IMAGE_EXT.contains(&ext) => Ok(Some(SourceKind::Image)),
        // A bare name without extension declares nothing.
        None if !mime.contains('/') => Ok(None),
        _ => Err(ExtractionError::InvalidFileType {
            detail: format!("'{declared}' is not a PDF or a supported image"),
        }),
    }
}

/// Identify the kind from magic bytes alone.
pub fn sniff_kind(bytes: &[u8]) -> Option<SourceKind> {
    if bytes.starts_with(b"%PDF") {
        return Some(SourceKind::TextDocument);
    }
    match image::guess_format(bytes) {
        Ok(
            image::ImageFormat::Jpeg
            | image::ImageFormat::Png
            | image::ImageFormat::WebP
            | image::ImageFormat::Bmp
            | image::ImageFormat::Tiff,
        ) => Some(SourceKind::Image),
        _ => None,
    }
}

fn max_bytes(kind: SourceKind, options: &ExtractionOptions) -> u64 {
    match kind {
        SourceKind::TextDocument => options.max_document_bytes,
        SourceKind::Image => options.max_image_bytes,
    }
}

/// The kind with the larger size ceiling.
fn widest_kind(options: &ExtractionOptions) -> SourceKind {
    if options.max_document_bytes >= options.max_image_bytes {
        SourceKind::TextDocument
    } else {
        SourceKind::Image
    }
}

fn check_size(size: u64, kind: SourceKind, options: &ExtractionOptions) -> Result<(), ExtractionError> {
    let max = max_bytes(kind, options);
    if size > max {
        return Err(ExtractionError::FileTooLarge { size, max, kind });
    }
    Ok(())
}

/// Bytes that passed validation, with their kind.
#[derive(Debug)]
pub(crate) struct LoadedInput {
    pub bytes: Vec<u8>,
    pub kind: SourceKind,
}

/// Run the three validation steps over in-memory bytes.
pub(crate) fn validate(
    bytes: Vec<u8>,
    declared: Option<&str>,
    options: &ExtractionOptions,
) -> Result<LoadedInput, ExtractionError> {
    let declared = match declared {
        Some(d) => declared_kind(d)?,
        None => None,
    };
    if bytes.is_empty() {
        return Err(ExtractionError::FileLoadFailed {
            detail: "input is empty".into(),
        });
    }

    let sniffed = sniff_kind(&bytes);
    let kind = declared.or(sniffed).ok_or_else(|| ExtractionError::InvalidFileType {
        detail: "content is neither a PDF nor a supported image".into(),
    })?;
    check_size(bytes.len() as u64, kind, options)?;

    if sniffed != Some(kind) {
        return Err(ExtractionError::InvalidFileType {
            detail: format!("declared as {kind} but the content does not match"),
        });
    }
    Ok(LoadedInput { bytes, kind })
}

// ── Local files ──────────────────────────────────────────────────────────────

async fn read_path(path: &Path, options: &ExtractionOptions) -> Result<LoadedInput, ExtractionError> {
    let declared = path.file_name().and_then(|n| n.to_str()).map(str::to_string);
    let kind_hint = match declared.as_deref() {
        Some(name) => declared_kind(name)?,
        None => None,
    };

    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| ExtractionError::FileLoadFailed {
            detail: format!("{}: {e}", path.display()),
        })?;
    if !metadata.is_file() {
        return Err(ExtractionError::FileLoadFailed {
            detail: format!("{} is not a regular file", path.display()),
        });
    }
    // Unknown kind: the larger ceiling still stops a runaway read.
    let ceiling_kind = kind_hint.unwrap_or_else(|| widest_kind(options));
    check_size(metadata.len(), ceiling_kind, options)?;

    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| ExtractionError::FileLoadFailed {
            detail: format!("{}: {e}", path.display()),
        })?;
    debug!("Read {} bytes from {}", bytes.len(), path.display());
    validate(bytes, declared.as_deref(), options)
}

// ── Downloads ────────────────────────────────────────────────────────────────

fn network(url: &str, reason: impl std::fmt::Display) -> ExtractionError {
    ExtractionError::Network {
        detail: format!("{url}: {reason}"),
    }
}

/// Extract a file name with an extension from the URL path, if any.
fn url_file_name(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let last = parsed.path_segments()?.next_back()?;
    (!last.is_empty() && last.contains('.')).then(|| last.to_string())
}

async fn download(url: &str, options: &ExtractionOptions) -> Result<LoadedInput, ExtractionError> {
    info!("Downloading from: {}", url);
    let started = Instant::now();
    let timeout = options.download_timeout();
    let map_err = |e: reqwest::Error| {
        if e.is_timeout() {
            ExtractionError::timeout(Stage::Download, started.elapsed())
        } else {
            network(url, e)
        }
    };

    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| network(url, e))?;
    let mut response = client.get(url).send().await.map_err(map_err)?;

    if !response.status().is_success() {
        return Err(network(url, format!("HTTP {}", response.status())));
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let declared = match content_type {
        Some(ct) if declared_kind(&ct).ok().flatten().is_some() => Some(ct),
        _ => url_file_name(url),
    };

    let ceiling_kind = match declared.as_deref().map(declared_kind) {
        Some(Ok(Some(kind))) => kind,
        _ => widest_kind(options),
    };
    if let Some(len) = response.content_length() {
        check_size(len, ceiling_kind, options)?;
    }

    let mut bytes = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(map_err)? {
        bytes.extend_from_slice(&chunk);
        check_size(bytes.len() as u64, ceiling_kind, options)?;
    }

    info!("Downloaded {} bytes in {:?}", bytes.len(), started.elapsed());
    validate(bytes, declared.as_deref(), options)
}

// ── Opening ──────────────────────────────────────────────────────────────────

enum Pending {
    Loaded(LoadedInput),
    Path(PathBuf),
}

/// Validate `source`, read it, and open it in `backend`.
///
/// Reading a path and opening the document are bounded together by
/// `load_timeout`; a download is bounded by `download_timeout` first.
pub async fn open_document(
    backend: &dyn DocumentBackend,
    source: ExtractionSource,
    options: &ExtractionOptions,
) -> Result<DocumentHandle, ExtractionError> {
    let pending = match source {
        ExtractionSource::Url(url) => Pending::Loaded(download(&url, options).await?),
        ExtractionSource::Bytes { data, declared } => {
            Pending::Loaded(validate(data, declared.as_deref(), options)?)
        }
        ExtractionSource::Path(path) => Pending::Path(path),
    };

    let load = async move {
        let input = match pending {
            Pending::Loaded(input) => input,
            Pending::Path(path) => read_path(&path, options).await?,
        };
        let byte_size = input.bytes.len() as u64;
        let kind = input.kind;
        let document = backend
            .open(input.bytes, kind)
            .await
            .map_err(|e| ExtractionError::FileLoadFailed {
                detail: format!("cannot open {kind}: {e}"),
            })?;
        Ok::<_, ExtractionError>(DocumentHandle::new(document, byte_size, kind))
    };

    let handle = tokio::time::timeout(options.load_timeout(), load)
        .await
        .map_err(|_| ExtractionError::timeout(Stage::Load, options.load_timeout()))??;
    debug!(
        pages = handle.page_count(),
        bytes = handle.byte_size(),
        kind = %handle.source_kind(),
        "document loaded"
    );
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Bitmap, OpenedDocument};
    use crate::error::{AdapterError, ErrorKind};
    use async_trait::async_trait;
    use std::time::Duration;

    const PDF: &[u8] = b"%PDF-1.7\n%fake body";
    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";
    const JPEG: &[u8] = b"\xFF\xD8\xFF\xE0\0\x10JFIF\0";

    fn opts() -> ExtractionOptions {
        ExtractionOptions::default()
    }

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/doc.pdf"));
        assert!(is_url("http://example.com/doc.pdf"));
        assert!(!is_url("/tmp/doc.pdf"));
        assert!(!is_url("doc.pdf"));
        assert!(!is_url(""));
    }

    #[test]
    fn parse_picks_variant() {
        assert!(matches!(ExtractionSource::parse("https://x/y.pdf"), ExtractionSource::Url(_)));
        assert!(matches!(ExtractionSource::parse("y.pdf"), ExtractionSource::Path(_)));
    }

    #[test]
    fn declared_kind_accepts_mime_and_extensions() {
        assert_eq!(declared_kind("application/pdf").unwrap(), Some(SourceKind::TextDocument));
        assert_eq!(declared_kind("image/jpeg; q=1").unwrap(), Some(SourceKind::Image));
        assert_eq!(declared_kind("Recipe.PDF").unwrap(), Some(SourceKind::TextDocument));
        assert_eq!(declared_kind("/tmp/photo.webp").unwrap(), Some(SourceKind::Image));
        assert_eq!(declared_kind("application/octet-stream").unwrap(), None);
        assert_eq!(declared_kind("README").unwrap(), None);
    }

    #[test]
    fn declared_kind_rejects_unknown_types() {
        for d in ["text/plain", "notes.docx", "image/gif", "clip.gif"] {
            let err = declared_kind(d).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidFileType, "{d}");
        }
    }

    #[test]
    fn sniffing() {
        assert_eq!(sniff_kind(PDF), Some(SourceKind::TextDocument));
        assert_eq!(sniff_kind(PNG), Some(SourceKind::Image));
        assert_eq!(sniff_kind(JPEG), Some(SourceKind::Image));
        assert_eq!(sniff_kind(b"GIF89a......"), None);
        assert_eq!(sniff_kind(b"hello"), None);
    }

    #[test]
    fn validate_empty_is_load_failure() {
        let err = validate(vec![], Some("a.pdf"), &opts()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileLoadFailed);
    }

    #[test]
    fn validate_rejects_oversize_per_kind() {
        let options = ExtractionOptions::builder()
            .max_document_bytes(10)
            .max_image_bytes(5)
            .build()
            .unwrap();
        let err = validate(PDF.to_vec(), Some("application/pdf"), &options).unwrap_err();
        assert!(matches!(
            err,
            ExtractionError::FileTooLarge { max: 10, kind: SourceKind::TextDocument, .. }
        ));
        let err = validate(PNG.to_vec(), None, &options).unwrap_err();
        assert!(matches!(err, ExtractionError::FileTooLarge { max: 5, .. }));
    }

    #[test]
    fn validate_rejects_mismatched_magic() {
        let err = validate(JPEG.to_vec(), Some("application/pdf"), &opts()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFileType);
        let err = validate(b"plain text".to_vec(), None, &opts()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFileType);
    }

    #[test]
    fn validate_sniffs_undeclared() {
        let input = validate(PDF.to_vec(), None, &opts()).unwrap();
        assert_eq!(input.kind, SourceKind::TextDocument);
        let input = validate(PNG.to_vec(), Some("application/octet-stream"), &opts()).unwrap();
        assert_eq!(input.kind, SourceKind::Image);
    }

    #[test]
    fn url_file_name_needs_extension() {
        assert_eq!(url_file_name("https://x.test/a/b.pdf?x=1").as_deref(), Some("b.pdf"));
        assert_eq!(url_file_name("https://x.test/a/"), None);
        assert_eq!(url_file_name("https://x.test/download"), None);
    }

    // ── open_document ────────────────────────────────────────────────────

    struct OnePage;

    #[async_trait]
    impl OpenedDocument for OnePage {
        fn page_count(&self) -> usize {
            1
        }
        async fn page_text(&self, _page: usize) -> Result<String, AdapterError> {
            Ok("text".into())
        }
        async fn render_page_to_image(&self, _page: usize, _scale: f32) -> Result<Bitmap, AdapterError> {
            Err(AdapterError::Unsupported("no render".into()))
        }
        fn close(&mut self) {}
    }

    struct Backend {
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl DocumentBackend for Backend {
        async fn open(
            &self,
            _bytes: Vec<u8>,
            _kind: SourceKind,
        ) -> Result<Box<dyn OpenedDocument>, AdapterError> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(AdapterError::Failed("corrupt xref".into()));
            }
            Ok(Box::new(OnePage))
        }
    }

    #[tokio::test]
    async fn opens_bytes() {
        let backend = Backend { delay: Duration::ZERO, fail: false };
        let handle = open_document(&backend, ExtractionSource::bytes(PDF, Some("r.pdf")), &opts())
            .await
            .unwrap();
        assert_eq!(handle.page_count(), 1);
        assert_eq!(handle.byte_size(), PDF.len() as u64);
        assert_eq!(handle.source_kind(), SourceKind::TextDocument);
    }

    #[tokio::test]
    async fn backend_failure_is_load_failure() {
        let backend = Backend { delay: Duration::ZERO, fail: true };
        let err = open_document(&backend, ExtractionSource::bytes(PDF, None), &opts())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileLoadFailed);
        assert!(err.to_string().contains("corrupt xref"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_open_times_out() {
        let backend = Backend { delay: Duration::from_secs(120), fail: false };
        let err = open_document(&backend, ExtractionSource::bytes(PDF, None), &opts())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::Timeout { stage: Stage::Load, .. }));
    }

    #[tokio::test]
    async fn reads_path_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recipe.pdf");
        std::fs::write(&path, PDF).unwrap();
        let backend = Backend { delay: Duration::ZERO, fail: false };
        let handle = open_document(&backend, ExtractionSource::path(&path), &opts())
            .await
            .unwrap();
        assert_eq!(handle.byte_size(), PDF.len() as u64);
    }

    #[tokio::test]
    async fn missing_path_is_load_failure() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend { delay: Duration::ZERO, fail: false };
        let err = open_document(&backend, ExtractionSource::path(dir.path().join("nope.pdf")), &opts())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileLoadFailed);
    }

    #[tokio::test]
    async fn oversize_path_rejected_before_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.pdf");
        std::fs::write(&path, vec![b'%'; 64]).unwrap();
        let options = ExtractionOptions::builder().max_document_bytes(32).build().unwrap();
        let backend = Backend { delay: Duration::ZERO, fail: false };
        let err = open_document(&backend, ExtractionSource::path(&path), &options)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileTooLarge);
    }

    #[tokio::test]
    async fn wrong_extension_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recipe.txt");
        std::fs::write(&path, PDF).unwrap();
        let backend = Backend { delay: Duration::ZERO, fail: false };
        let err = open_document(&backend, ExtractionSource::path(&path), &opts())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFileType);
    }
}
