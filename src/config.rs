//! Configuration types for recipe text extraction.
//!
//! All extraction behaviour is controlled through [`ExtractionOptions`],
//! built via its [`ExtractionOptionsBuilder`]. Every limit the pipeline
//! enforces (sizes, pages, batches, the timeout layers, OCR thresholds) is a
//! field here, so two runs can be compared by diffing their options.

use crate::error::ExtractionError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Characters the OCR engine may emit for recipe text: letters, digits,
/// whitespace, common punctuation, fraction glyphs and the degree sign.
pub const DEFAULT_OCR_ALLOWLIST: &str = concat!(
    "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz",
    "0123456789",
    " .,;:!?'\"()[]-–/&%+*#@",
    "½⅓⅔¼¾⅛⅜⅝⅞°",
    "éèêëàâäîïôöùûüçñÉÈÀÇ",
);

/// Options for one extraction call.
///
/// Built via [`ExtractionOptions::builder()`] or using
/// [`ExtractionOptions::default()`].
///
/// # Example
/// ```rust
/// use recipe_extract::ExtractionOptions;
///
/// let options = ExtractionOptions::builder()
///     .max_pages(10)
///     .batch_size(5)
///     .overall_timeout_ms(60_000)
///     .build()
///     .unwrap();
/// assert_eq!(options.batch_size, 5);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionOptions {
    /// Maximum number of pages attempted. Default: 15.
    ///
    /// Pages beyond the cap are skipped, never requested from the backend.
    pub max_pages: usize,

    /// Pages per batch in chunked mode. Default: 3.
    ///
    /// Pages within a batch run concurrently; batches run one after another.
    pub batch_size: usize,

    /// Documents with at most this many pages (after the cap) are extracted
    /// directly, one page at a time, without batching. Default: 10.
    pub direct_threshold: usize,

    /// Timeout for the whole call in milliseconds. Default: 120 000.
    pub overall_timeout_ms: u64,

    /// Minimum characters of usable text; below this the OCR path runs
    /// (primary) or the call fails (OCR). Default: 20.
    pub min_usable_chars: usize,

    /// Characters the OCR engine may produce. Default: [`DEFAULT_OCR_ALLOWLIST`].
    pub ocr_char_allowlist: String,

    /// Size ceiling for PDF documents in bytes. Default: 15 MiB.
    pub max_document_bytes: u64,

    /// Size ceiling for images in bytes. Default: 10 MiB.
    pub max_image_bytes: u64,

    /// Timeout for reading the input and opening the document. Default: 30 000.
    pub load_timeout_ms: u64,

    /// Timeout for downloading a URL input. Default: 60 000.
    pub download_timeout_ms: u64,

    /// Attempts per page before the placeholder is used. Default: 3.
    pub page_attempts: u32,

    /// Initial backoff between page attempts; doubles per retry. Default: 100.
    pub retry_backoff_ms: u64,

    /// Timeout for a single page-text attempt. Default: 10 000.
    pub page_timeout_ms: u64,

    /// Pause between batches so per-page resources can be reclaimed. Default: 50.
    pub batch_delay_ms: u64,

    /// Rasterisation scale for OCR legibility. Default: 2.0.
    pub render_scale: f32,

    /// Timeout for rasterising one page. Default: 20 000.
    pub render_timeout_ms: u64,

    /// 1-indexed page handed to OCR. Default: 1.
    pub ocr_page: usize,

    /// Timeout for one recognition call. Default: 60 000.
    pub ocr_timeout_ms: u64,

    /// Minimum interval between progress reports. Default: 250.
    pub progress_interval_ms: u64,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self {
            max_pages: 15,
            batch_size: 3,
            direct_threshold: 10,
            overall_timeout_ms: 120_000,
            min_usable_chars: 20,
            ocr_char_allowlist: DEFAULT_OCR_ALLOWLIST.to_string(),
            max_document_bytes: 15 * 1024 * 1024,
            max_image_bytes: 10 * 1024 * 1024,
            load_timeout_ms: 30_000,
            download_timeout_ms: 60_000,
            page_attempts: 3,
            retry_backoff_ms: 100,
            page_timeout_ms: 10_000,
            batch_delay_ms: 50,
            render_scale: 2.0,
            render_timeout_ms: 20_000,
            ocr_page: 1,
            ocr_timeout_ms: 60_000,
            progress_interval_ms: 250,
        }
    }
}

impl ExtractionOptions {
    /// Create a new builder for `ExtractionOptions`.
    pub fn builder() -> ExtractionOptionsBuilder {
        ExtractionOptionsBuilder {
            options: Self::default(),
        }
    }

    /// Continue building from these options, e.g. to layer overrides on
    /// top of a parsed JSON file.
    pub fn into_builder(self) -> ExtractionOptionsBuilder {
        ExtractionOptionsBuilder { options: self }
    }

    /// Parse options from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ExtractionError> {
        let options: Self = serde_json::from_str(json)
            .map_err(|e| ExtractionError::InvalidConfig(format!("options JSON: {e}")))?;
        options.validate()?;
        Ok(options)
    }

    pub fn overall_timeout(&self) -> Duration {
        Duration::from_millis(self.overall_timeout_ms)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_millis(self.download_timeout_ms)
    }

    pub fn page_timeout(&self) -> Duration {
        Duration::from_millis(self.page_timeout_ms)
    }

    pub fn render_timeout(&self) -> Duration {
        Duration::from_millis(self.render_timeout_ms)
    }

    pub fn ocr_timeout(&self) -> Duration {
        Duration::from_millis(self.ocr_timeout_ms)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// Check option constraints.
    pub fn validate(&self) -> Result<(), ExtractionError> {
        if self.max_pages == 0 {
            return Err(ExtractionError::InvalidConfig(
                "max_pages must be ≥ 1".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ExtractionError::InvalidConfig(
                "batch_size must be ≥ 1".into(),
            ));
        }
        if self.page_attempts == 0 {
            return Err(ExtractionError::InvalidConfig(
                "page_attempts must be ≥ 1".into(),
            ));
        }
        if self.overall_timeout_ms == 0 {
            return Err(ExtractionError::InvalidConfig(
                "overall_timeout_ms must be > 0".into(),
            ));
        }
        if !(self.render_scale > 0.0 && self.render_scale <= 8.0) {
            return Err(ExtractionError::InvalidConfig(format!(
                "render_scale must be in (0, 8], got {}",
                self.render_scale
            )));
        }
        if self.ocr_page == 0 {
            return Err(ExtractionError::InvalidConfig(
                "ocr_page is 1-indexed".into(),
            ));
        }
        if self.ocr_char_allowlist.trim().is_empty() {
            return Err(ExtractionError::InvalidConfig(
                "ocr_char_allowlist must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`ExtractionOptions`].
#[derive(Debug)]
pub struct ExtractionOptionsBuilder {
    options: ExtractionOptions,
}

impl ExtractionOptionsBuilder {
    pub fn max_pages(mut self, n: usize) -> Self {
        self.options.max_pages = n.max(1);
        self
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.options.batch_size = n.clamp(1, 10);
        self
    }

    pub fn direct_threshold(mut self, n: usize) -> Self {
        self.options.direct_threshold = n;
        self
    }

    pub fn overall_timeout_ms(mut self, ms: u64) -> Self {
        self.options.overall_timeout_ms = ms;
        self
    }

    pub fn min_usable_chars(mut self, n: usize) -> Self {
        self.options.min_usable_chars = n;
        self
    }

    pub fn ocr_char_allowlist(mut self, chars: impl Into<String>) -> Self {
        self.options.ocr_char_allowlist = chars.into();
        self
    }

    pub fn max_document_bytes(mut self, bytes: u64) -> Self {
        self.options.max_document_bytes = bytes;
        self
    }

    pub fn max_image_bytes(mut self, bytes: u64) -> Self {
        self.options.max_image_bytes = bytes;
        self
    }

    pub fn load_timeout_ms(mut self, ms: u64) -> Self {
        self.options.load_timeout_ms = ms;
        self
    }

    pub fn download_timeout_ms(mut self, ms: u64) -> Self {
        self.options.download_timeout_ms = ms;
        self
    }

    pub fn page_attempts(mut self, n: u32) -> Self {
        self.options.page_attempts = n.max(1);
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.options.retry_backoff_ms = ms;
        self
    }

    pub fn page_timeout_ms(mut self, ms: u64) -> Self {
        self.options.page_timeout_ms = ms;
        self
    }

    pub fn batch_delay_ms(mut self, ms: u64) -> Self {
        self.options.batch_delay_ms = ms;
        self
    }

    pub fn render_scale(mut self, scale: f32) -> Self {
        self.options.render_scale = scale;
        self
    }

    pub fn render_timeout_ms(mut self, ms: u64) -> Self {
        self.options.render_timeout_ms = ms;
        self
    }

    pub fn ocr_page(mut self, page: usize) -> Self {
        self.options.ocr_page = page;
        self
    }

    pub fn ocr_timeout_ms(mut self, ms: u64) -> Self {
        self.options.ocr_timeout_ms = ms;
        self
    }

    pub fn progress_interval_ms(mut self, ms: u64) -> Self {
        self.options.progress_interval_ms = ms;
        self
    }

    /// Build the options, validating constraints.
    pub fn build(self) -> Result<ExtractionOptions, ExtractionError> {
        self.options.validate()?;
        Ok(self.options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let o = ExtractionOptions::default();
        assert_eq!(o.max_pages, 15);
        assert_eq!(o.overall_timeout_ms, 120_000);
        assert_eq!(o.min_usable_chars, 20);
        assert_eq!(o.max_document_bytes, 15 * 1024 * 1024);
        assert_eq!(o.page_attempts, 3);
        assert_eq!(o.retry_backoff_ms, 100);
        assert_eq!(o.render_timeout_ms, 20_000);
        assert_eq!(o.load_timeout_ms, 30_000);
        assert_eq!(o.progress_interval_ms, 250);
        assert!((o.render_scale - 2.0).abs() < f32::EPSILON);
    }

    #[test]
    fn builder_clamps_batch_size() {
        let o = ExtractionOptions::builder().batch_size(0).build().unwrap();
        assert_eq!(o.batch_size, 1);
        let o = ExtractionOptions::builder().batch_size(99).build().unwrap();
        assert_eq!(o.batch_size, 10);
    }

    #[test]
    fn overrides_on_parsed_options_keep_the_clamp() {
        let parsed = ExtractionOptions::from_json(r#"{"max_pages": 30}"#).unwrap();
        let o = parsed.into_builder().batch_size(500).build().unwrap();
        assert_eq!(o.max_pages, 30);
        assert_eq!(o.batch_size, 10);
    }

    #[test]
    fn builder_rejects_bad_scale() {
        let err = ExtractionOptions::builder().render_scale(0.0).build().unwrap_err();
        assert!(err.to_string().contains("render_scale"));
    }

    #[test]
    fn builder_rejects_empty_allowlist() {
        assert!(ExtractionOptions::builder()
            .ocr_char_allowlist("   ")
            .build()
            .is_err());
    }

    #[test]
    fn allowlist_covers_recipe_glyphs() {
        for c in ['½', '¾', '°', '1', 'g', '/', '.'] {
            assert!(DEFAULT_OCR_ALLOWLIST.contains(c), "missing {c}");
        }
    }

    #[test]
    fn from_json_fills_defaults() {
        let o = ExtractionOptions::from_json(r#"{"max_pages": 4, "batch_size": 2}"#).unwrap();
        assert_eq!(o.max_pages, 4);
        assert_eq!(o.batch_size, 2);
        assert_eq!(o.min_usable_chars, 20);
    }

    #[test]
    fn from_json_validates() {
        let err = ExtractionOptions::from_json(r#"{"max_pages": 0}"#).unwrap_err();
        assert!(err.to_string().contains("max_pages"));
        assert!(ExtractionOptions::from_json("not json").is_err());
    }
}
