//! Page text: pull one page's text layer, retrying transient failures.
//!
//! ## Retry Strategy
//!
//! Text-layer reads fail intermittently on damaged or oddly-encoded pages.
//! Each attempt is bounded by `page_timeout`; between attempts the extractor
//! backs off exponentially (`retry_backoff_ms * 2^(attempt-1)`): with the
//! 100 ms default and 3 attempts the waits are 100 ms → 200 ms.
//!
//! A page that fails every attempt is not an error for the document. It
//! becomes a placeholder [`PageResult`] so one bad page does not abort the
//! others. Only cancellation escapes as an error.

use crate::config::ExtractionOptions;
use crate::document::DocumentHandle;
use crate::error::{AdapterError, ExtractionError};
use crate::output::PageResult;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Extract the text layer of `page_number` (1-indexed).
pub async fn extract_page(
    handle: &DocumentHandle,
    page_number: usize,
    options: &ExtractionOptions,
    cancel: &CancellationToken,
) -> Result<PageResult, ExtractionError> {
    let attempts = options.page_attempts.max(1);
    let mut made = 0;
    let mut last_err = String::new();

    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Err(ExtractionError::Cancelled);
        }
        made = attempt;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ExtractionError::Cancelled),
            r = tokio::time::timeout(options.page_timeout(), handle.page_text(page_number)) => r,
        };

        match outcome {
            Ok(Ok(text)) => {
                debug!(page = page_number, attempt, chars = text.len(), "page text extracted");
                return Ok(PageResult {
                    page_number,
                    text,
                    attempt_count: attempt,
                    failed: false,
                });
            }
            Ok(Err(AdapterError::Unsupported(reason))) => {
                // Retrying cannot make an unsupported operation work.
                last_err = reason;
                break;
            }
            Ok(Err(e)) => {
                warn!("Page {}: attempt {} failed: {}", page_number, attempt, e);
                last_err = e.to_string();
            }
            Err(_) => {
                warn!(
                    "Page {}: attempt {} timed out after {}ms",
                    page_number, attempt, options.page_timeout_ms
                );
                last_err = format!("timed out after {}ms", options.page_timeout_ms);
            }
        }

        if attempt < attempts {
            let backoff = options
                .retry_backoff_ms
                .saturating_mul(2u64.saturating_pow(attempt - 1));
            if cancel.is_cancelled() {
                return Err(ExtractionError::Cancelled);
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ExtractionError::Cancelled),
                _ = sleep(Duration::from_millis(backoff)) => {}
            }
        }
    }

    warn!("Page {}: giving up after {} attempt(s): {}", page_number, made, last_err);
    Ok(PageResult {
        page_number,
        text: PageResult::placeholder_text(page_number),
        attempt_count: made,
        failed: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Bitmap, DocumentHandle, OpenedDocument, SourceKind};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    /// Fails the first `failures` calls, then returns text. `hang` makes every
    /// call sleep past any timeout.
    struct Flaky {
        calls: Arc<AtomicU32>,
        failures: u32,
        hang: bool,
        unsupported: bool,
    }

    #[async_trait]
    impl OpenedDocument for Flaky {
        fn page_count(&self) -> usize {
            3
        }

        async fn page_text(&self, page_number: usize) -> Result<String, AdapterError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.hang {
                sleep(Duration::from_secs(3600)).await;
            }
            if self.unsupported {
                return Err(AdapterError::Unsupported("no text layer".into()));
            }
            if n <= self.failures {
                return Err(AdapterError::Failed(format!("glitch {n}")));
            }
            Ok(format!("page {page_number} text"))
        }

        async fn render_page_to_image(&self, _: usize, _: f32) -> Result<Bitmap, AdapterError> {
            Err(AdapterError::Unsupported("render".into()))
        }

        fn close(&mut self) {}
    }

    fn handle(failures: u32, hang: bool, unsupported: bool) -> (DocumentHandle, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let doc = Flaky {
            calls: Arc::clone(&calls),
            failures,
            hang,
            unsupported,
        };
        (DocumentHandle::new(Box::new(doc), 1, SourceKind::TextDocument), calls)
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_first_try() {
        let (h, calls) = handle(0, false, false);
        let r = extract_page(&h, 2, &ExtractionOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(r.text, "page 2 text");
        assert_eq!(r.attempt_count, 1);
        assert!(!r.failed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_exponential_backoff() {
        let (h, _) = handle(2, false, false);
        let start = Instant::now();
        let r = extract_page(&h, 1, &ExtractionOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(r.attempt_count, 3);
        assert!(!r.failed);
        assert_eq!(start.elapsed(), Duration::from_millis(100 + 200));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_attempts_give_placeholder() {
        let (h, calls) = handle(u32::MAX, false, false);
        let r = extract_page(&h, 3, &ExtractionOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(r.failed);
        assert_eq!(r.attempt_count, 3);
        assert_eq!(r.text, "[Error extracting text from page 3]");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_attempts_time_out() {
        let (h, calls) = handle(0, true, false);
        let start = Instant::now();
        let r = extract_page(&h, 1, &ExtractionOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(r.failed);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_millis(3 * 10_000 + 100 + 200));
    }

    #[tokio::test(start_paused = true)]
    async fn unsupported_is_not_retried() {
        let (h, calls) = handle(0, false, true);
        let r = extract_page(&h, 1, &ExtractionOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(r.failed);
        assert_eq!(r.attempt_count, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_start() {
        let (h, calls) = handle(0, false, false);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = extract_page(&h, 1, &ExtractionOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_backoff() {
        let (h, calls) = handle(u32::MAX, false, false);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let err = extract_page(&h, 1, &ExtractionOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
