//! # recipe-extract
//!
//! Turn a recipe PDF or a photo of a recipe card into clean, normalised
//! text ready for recipe parsing.
//!
//! ## Why this crate?
//!
//! Most recipe PDFs carry a text layer, and reading it is fast and exact.
//! Scanned cookbooks and phone photos do not, and some "text" layers are
//! just a few stray glyphs. This crate reads the text layer first and falls
//! back to OCR (a vision model reading a rendered page) only when the text
//! layer is missing or too thin, then applies one deterministic cleanup
//! pass so both paths produce text in the same shape.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF / image
//!  │
//!  ├─ 1. Input      validate type, size and magic bytes; open under a timeout
//!  ├─ 2. Schedule   direct (short docs) or bounded batches (long docs)
//!  ├─ 3. Page text  text layer per page, retried with backoff
//!  ├─ 4. Normalise  whitespace, digit/fraction repairs, section headers
//!  ├─ 5. OCR        only if the text layer is unusable: render → recognise
//!  └─ 6. Output     normalised text + per-page results + stats
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use recipe_extract::{extract, ExtractionOptions, ExtractionSource};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = ExtractionOptions::default();
//!     let text = extract(ExtractionSource::path("lasagne.pdf"), None, &options).await?;
//!     println!("{text}");
//!     Ok(())
//! }
//! ```
//!
//! Custom backends and OCR engines plug in through [`Extractor::new`] with
//! a [`DocumentBackend`] and an [`OcrService`] wrapping any
//! [`TextRecognizer`].
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `recipe-extract` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! recipe-extract = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod document;
pub mod error;
pub mod extract;
pub mod output;
pub mod pipeline;
pub mod progress;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ExtractionOptions, ExtractionOptionsBuilder, DEFAULT_OCR_ALLOWLIST};
pub use document::{Bitmap, DocumentBackend, DocumentHandle, OpenedDocument, SourceKind};
pub use error::{AdapterError, ErrorKind, ExtractionError, Stage};
pub use extract::{
    extract, extract_cancellable, extract_sync, ExtractionHandle, ExtractionState, Extractor,
};
pub use output::{ExtractionMethod, ExtractionOutput, ExtractionStats, PageResult};
pub use pipeline::input::ExtractionSource;
pub use pipeline::normalize::normalize;
pub use pipeline::ocr::{OcrService, RecognitionOptions, RecognizedText, TextRecognizer};
pub use progress::{ProgressAggregator, ProgressCallback, ProgressSink};
pub use tokio_util::sync::CancellationToken;
