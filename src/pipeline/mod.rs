//! Pipeline stages for recipe text extraction.
//!
//! Each submodule implements exactly one step, so each can be tested with an
//! in-memory backend and swapped without touching the others.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ chunk ──▶ page ──▶ normalize
//!   │         (batches) (retry)     ▲
//!   │                               │
//!   └──────▶ render ──▶ ocr ────────┘
//!           (bitmap)   (fallback)
//! ```
//!
//! 1. [`input`]     — validate the source and open a [`crate::document::DocumentHandle`]
//! 2. [`chunk`]     — schedule pages directly or in bounded batches
//! 3. [`page`]      — one page's text layer with retry/backoff
//! 4. [`render`]    — rasterise a page under a timeout
//! 5. [`ocr`]       — recognise the bitmap; validate and normalise the result
//! 6. [`normalize`] — deterministic cleanup of extraction artefacts
//!
//! [`backend`] and [`vision`] hold the default capability implementations
//! (pdfium/image decoding and a vision-model recognizer).

pub mod backend;
pub mod chunk;
pub mod input;
pub mod normalize;
pub mod ocr;
pub mod page;
pub mod render;
pub mod vision;
