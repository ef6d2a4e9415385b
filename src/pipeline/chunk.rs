//! Chunk scheduling: run the text layer over the page range in batches.
//!
//! ## Why bounded batches?
//!
//! Long cookbooks would otherwise put every page in flight at once, and
//! each in-flight page pins parsed page objects in the backend. Pages in
//! a batch run concurrently via `join_all`; the next batch starts only
//! after the previous one has fully finished and `batch_delay` has passed.
//! Short documents skip batching and run pages one after another.

use crate::config::ExtractionOptions;
use crate::document::DocumentHandle;
use crate::error::ExtractionError;
use crate::output::PageResult;
use crate::pipeline::normalize::normalize;
use crate::pipeline::page::extract_page;
use crate::progress::ProgressAggregator;
use futures::future::join_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// How the text-layer pages of one document are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// One page at a time, no batching.
    Direct,
    /// Bounded concurrent batches.
    Chunked { batch_size: usize },
}

impl Schedule {
    /// Direct when the pages to attempt fit under `direct_threshold`.
    pub fn choose(page_count: usize, options: &ExtractionOptions) -> Self {
        if pages_to_attempt(page_count, options) <= options.direct_threshold {
            Schedule::Direct
        } else {
            Schedule::Chunked {
                batch_size: options.batch_size.max(1),
            }
        }
    }
}

/// Pages that will be requested: the document length capped by `max_pages`.
pub fn pages_to_attempt(page_count: usize, options: &ExtractionOptions) -> usize {
    page_count.min(options.max_pages)
}

/// Split pages `1..=pages` into consecutive batches of at most `batch_size`.
pub fn plan_batches(pages: usize, batch_size: usize) -> Vec<Vec<usize>> {
    let batch_size = batch_size.max(1);
    (1..=pages)
        .collect::<Vec<_>>()
        .chunks(batch_size)
        .map(<[usize]>::to_vec)
        .collect()
}

/// Result of the text-layer path.
#[derive(Debug, Clone, Default)]
pub struct TextLayerOutcome {
    /// One entry per attempted page, in page order.
    pub pages: Vec<PageResult>,
    /// Batches run; zero for [`Schedule::Direct`].
    pub batches: usize,
}

impl TextLayerOutcome {
    /// All page texts, placeholders included, joined by blank lines and normalised.
    pub fn text(&self) -> String {
        let joined = self
            .pages
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        normalize(&joined)
    }

    /// Characters of normalised text recovered from successful pages only.
    pub fn usable_chars(&self) -> usize {
        let joined = self
            .pages
            .iter()
            .filter(|p| !p.failed)
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        normalize(&joined).chars().count()
    }

    pub fn failed_pages(&self) -> usize {
        self.pages.iter().filter(|p| p.failed).count()
    }

    /// True when no attempted page produced text (or none was attempted).
    pub fn all_failed(&self) -> bool {
        self.pages.iter().all(|p| p.failed)
    }
}

/// Run the text layer over `min(page_count, max_pages)` pages.
///
/// Progress on `task` advances after every finished page. Cancellation is
/// checked before each page (direct) or each batch (chunked) and is the
/// only error this returns.
pub async fn run_text_layer(
    handle: &DocumentHandle,
    schedule: Schedule,
    options: &ExtractionOptions,
    cancel: &CancellationToken,
    progress: &ProgressAggregator,
    task: &str,
) -> Result<TextLayerOutcome, ExtractionError> {
    let total = pages_to_attempt(handle.page_count(), options);
    if handle.page_count() > total {
        info!(
            "Document has {} pages; extracting the first {}",
            handle.page_count(),
            total
        );
    }

    let done = AtomicUsize::new(0);
    let page_finished = || {
        let n = done.fetch_add(1, Ordering::SeqCst) + 1;
        progress.update_task(task, n as f64 * 100.0 / total as f64);
    };

    let mut outcome = TextLayerOutcome::default();
    match schedule {
        Schedule::Direct => {
            for page in 1..=total {
                if cancel.is_cancelled() {
                    return Err(ExtractionError::Cancelled);
                }
                let result = extract_page(handle, page, options, cancel).await?;
                page_finished();
                outcome.pages.push(result);
            }
        }
        Schedule::Chunked { batch_size } => {
            let batches = plan_batches(total, batch_size);
            let count = batches.len();
            for (i, batch) in batches.into_iter().enumerate() {
                if i > 0 && !options.batch_delay().is_zero() {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(ExtractionError::Cancelled),
                        _ = tokio::time::sleep(options.batch_delay()) => {}
                    }
                }
                if cancel.is_cancelled() {
                    return Err(ExtractionError::Cancelled);
                }
                debug!(batch = i + 1, of = count, pages = ?batch, "running batch");

                let results = join_all(batch.iter().map(|&page| {
                    let page_finished = &page_finished;
                    async move {
                        let r = extract_page(handle, page, options, cancel).await;
                        if r.is_ok() {
                            page_finished();
                        }
                        r
                    }
                }))
                .await;
                for result in results {
                    outcome.pages.push(result?);
                }
                outcome.batches += 1;
            }
        }
    }

    if total > 0 {
        progress.complete_task(task);
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_batches_splits_evenly() {
        assert_eq!(
            plan_batches(15, 5),
            vec![
                vec![1, 2, 3, 4, 5],
                vec![6, 7, 8, 9, 10],
                vec![11, 12, 13, 14, 15]
            ]
        );
    }

    #[test]
    fn plan_batches_remainder_and_edges() {
        assert_eq!(plan_batches(7, 3), vec![vec![1, 2, 3], vec![4, 5, 6], vec![7]]);
        assert!(plan_batches(0, 3).is_empty());
        assert_eq!(plan_batches(2, 0), vec![vec![1], vec![2]]);
    }

    #[test]
    fn schedule_choice_uses_capped_page_count() {
        let o = ExtractionOptions::default();
        assert_eq!(Schedule::choose(3, &o), Schedule::Direct);
        assert_eq!(Schedule::choose(10, &o), Schedule::Direct);
        assert_eq!(Schedule::choose(11, &o), Schedule::Chunked { batch_size: 3 });
        let capped = ExtractionOptions::builder().max_pages(8).build().unwrap();
        assert_eq!(Schedule::choose(200, &capped), Schedule::Direct);
    }

    fn page(n: usize, text: &str, failed: bool) -> PageResult {
        PageResult {
            page_number: n,
            text: text.into(),
            attempt_count: 1,
            failed,
        }
    }

    #[test]
    fn outcome_text_keeps_placeholders_but_usable_ignores_them() {
        let outcome = TextLayerOutcome {
            pages: vec![
                page(1, "INGREDIENTS", false),
                page(2, &PageResult::placeholder_text(2), true),
            ],
            batches: 0,
        };
        assert_eq!(
            outcome.text(),
            "Ingredients:\n\n[Error extracting text from page 2]"
        );
        assert_eq!(outcome.usable_chars(), "Ingredients:".len());
        assert_eq!(outcome.failed_pages(), 1);
        assert!(!outcome.all_failed());
    }

    #[test]
    fn empty_outcome_counts_as_failed() {
        assert!(TextLayerOutcome::default().all_failed());
        assert_eq!(TextLayerOutcome::default().usable_chars(), 0);
    }
}
