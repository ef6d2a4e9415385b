//! Error types for the recipe-extract library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`ExtractionError`] — **Terminal**: the extraction call as a whole
//!   failed (file too large, wrong type, timeout, cancelled, OCR produced
//!   nothing usable). Exactly one of these reaches the caller per failed call.
//!
//! * [`AdapterError`] — **Local**: a collaborator (document backend, OCR
//!   engine, HTTP client) reported a failure for one operation. The pipeline
//!   decides at the boundary whether to retry it, absorb it into a
//!   placeholder page, or map it onto an [`ExtractionError`].
//!
//! Callers that only need to branch on the failure class use
//! [`ExtractionError::kind`], which is stable across message changes.

use std::fmt;
use thiserror::Error;

/// Pipeline stage that was active when a timeout fired.
///
/// Carried in [`ExtractionError::Timeout`] for diagnostics only; the typed
/// kind is always [`ErrorKind::Timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Stage {
    /// Reading the input and opening the document.
    Load,
    /// Downloading a remote input.
    Download,
    /// Rasterising a page for OCR.
    Render,
    /// The external recognition call.
    Recognize,
    /// The whole extraction call.
    Overall,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Load => "load",
            Stage::Download => "download",
            Stage::Render => "render",
            Stage::Recognize => "recognize",
            Stage::Overall => "overall",
        };
        f.write_str(s)
    }
}

/// Fieldless classification of [`ExtractionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    FileTooLarge,
    InvalidFileType,
    FileLoadFailed,
    Timeout,
    ExtractionFailed,
    InsufficientOcrText,
    Cancelled,
    Network,
    InvalidConfig,
}

/// All terminal errors returned by the recipe-extract library.
///
/// Per-page failures never surface here: they are absorbed into placeholder
/// text in [`crate::output::PageResult`].
#[derive(Debug, Error)]
pub enum ExtractionError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input exceeds the configured size ceiling for its kind.
    #[error("File is too large: {size} bytes (maximum for {kind} is {max} bytes)")]
    FileTooLarge {
        size: u64,
        max: u64,
        kind: crate::document::SourceKind,
    },

    /// Declared type or magic bytes are not an accepted document or image.
    #[error("Unsupported file type: {detail}\nAccepted: PDF documents and JPEG/PNG/WebP/BMP/TIFF images.")]
    InvalidFileType { detail: String },

    /// The input could not be read or the backend could not open it.
    #[error("Failed to load file: {detail}")]
    FileLoadFailed { detail: String },

    // ── Runtime errors ────────────────────────────────────────────────────
    /// A layer timed out. The stage is diagnostic only.
    #[error("Timed out during {stage} after {elapsed_ms}ms")]
    Timeout { stage: Stage, elapsed_ms: u64 },

    /// The text-layer path (or the rasteriser) failed with no usable output.
    #[error("Text extraction failed: {detail}")]
    ExtractionFailed { detail: String },

    /// OCR ran but produced fewer usable characters than required.
    #[error("OCR produced only {chars} usable characters (minimum {min})\nThe image may be blurry, rotated, or contain no text.")]
    InsufficientOcrText { chars: usize, min: usize },

    /// The caller cancelled the extraction.
    #[error("Extraction cancelled")]
    Cancelled,

    /// Transport failure talking to a remote resource.
    #[error("Network error: {detail}")]
    Network { detail: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ExtractionError {
    /// The fieldless kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExtractionError::FileTooLarge { .. } => ErrorKind::FileTooLarge,
            ExtractionError::InvalidFileType { .. } => ErrorKind::InvalidFileType,
            ExtractionError::FileLoadFailed { .. } => ErrorKind::FileLoadFailed,
            ExtractionError::Timeout { .. } => ErrorKind::Timeout,
            ExtractionError::ExtractionFailed { .. } => ErrorKind::ExtractionFailed,
            ExtractionError::InsufficientOcrText { .. } => ErrorKind::InsufficientOcrText,
            ExtractionError::Cancelled => ErrorKind::Cancelled,
            ExtractionError::Network { .. } => ErrorKind::Network,
            ExtractionError::InvalidConfig(_) => ErrorKind::InvalidConfig,
        }
    }

    pub(crate) fn timeout(stage: Stage, elapsed: std::time::Duration) -> Self {
        ExtractionError::Timeout {
            stage,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }
}

/// A failure reported by an external capability (backend, OCR engine, HTTP).
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    /// The operation failed; retrying may help.
    #[error("{0}")]
    Failed(String),

    /// The capability does not support this operation for this document
    /// (e.g. asking an image for its text layer).
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Transport-level failure (connection refused, TLS, HTTP status).
    #[error("transport: {0}")]
    Transport(String),

    /// The capability could not be initialised (missing library, no provider).
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl AdapterError {
    /// Map a recognizer failure onto the terminal error the caller sees.
    pub(crate) fn into_ocr_error(self) -> ExtractionError {
        match self {
            AdapterError::Transport(detail) => ExtractionError::Network { detail },
            other => ExtractionError::ExtractionFailed {
                detail: format!("OCR failed: {other}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn timeout_display_names_stage() {
        let e = ExtractionError::timeout(Stage::Render, Duration::from_millis(20_000));
        let msg = e.to_string();
        assert!(msg.contains("render"), "got: {msg}");
        assert!(msg.contains("20000ms"), "got: {msg}");
        assert_eq!(e.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn timeout_kind_is_independent_of_stage() {
        for stage in [Stage::Load, Stage::Render, Stage::Overall] {
            assert_eq!(
                ExtractionError::timeout(stage, Duration::ZERO).kind(),
                ErrorKind::Timeout
            );
        }
    }

    #[test]
    fn insufficient_ocr_display() {
        let e = ExtractionError::InsufficientOcrText { chars: 4, min: 20 };
        assert!(e.to_string().contains("only 4"));
        assert_eq!(e.kind(), ErrorKind::InsufficientOcrText);
    }

    #[test]
    fn transport_maps_to_network() {
        let e = AdapterError::Transport("connection reset".into()).into_ocr_error();
        assert_eq!(e.kind(), ErrorKind::Network);
        assert!(e.to_string().contains("connection reset"));
    }

    #[test]
    fn other_adapter_errors_map_to_extraction_failed() {
        let e = AdapterError::Unavailable("no provider".into()).into_ocr_error();
        assert_eq!(e.kind(), ErrorKind::ExtractionFailed);
    }
}
