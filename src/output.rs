//! Result types returned by an extraction call.

use serde::{Deserialize, Serialize};

/// Text recovered from one page of the text layer.
///
/// Created once by the page extractor and never mutated afterwards. When
/// every attempt failed, `text` holds a placeholder and `failed` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageResult {
    /// 1-indexed page number.
    pub page_number: usize,
    pub text: String,
    /// Attempts made, including the successful one.
    pub attempt_count: u32,
    pub failed: bool,
}

impl PageResult {
    /// Placeholder used for a page whose text could not be extracted.
    pub fn placeholder_text(page_number: usize) -> String {
        format!("[Error extracting text from page {page_number}]")
    }
}

/// Which path produced the final text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtractionMethod {
    /// Text layer, one page at a time.
    Direct,
    /// Text layer, in bounded batches.
    Chunked,
    /// Rasterised page through the OCR engine.
    Ocr,
}

/// Counters collected during one call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionStats {
    /// Pages in the source document.
    pub total_pages: usize,
    /// Pages whose text layer was requested (≤ `max_pages`).
    pub attempted_pages: usize,
    /// Attempted pages that ended with a placeholder.
    pub failed_pages: usize,
    /// Batches scheduled on the text-layer path.
    pub batches: usize,
    /// Whether the OCR fallback ran.
    pub ocr_used: bool,
    pub byte_size: u64,
    pub total_duration_ms: u64,
}

/// Full output of [`crate::Extractor::run`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionOutput {
    /// Normalised text, ready for recipe parsing.
    pub text: String,
    pub method: ExtractionMethod,
    /// Text-layer page results in page order. Empty for image sources.
    pub pages: Vec<PageResult>,
    pub stats: ExtractionStats,
}
