//! Extraction entry points and the orchestrating state machine.
//!
//! ## States
//!
//! ```text
//! Idle ─▶ Loading ─┬─▶ DirectExtracting ──┬─▶ Completed
//!                  ├─▶ ChunkedExtracting ─┤
//!                  │                      └─▶ OcrFallback ─▶ Completed
//!                  └─▶ OcrFallback (images)
//!
//! any state ─▶ Failed | Cancelled
//! ```
//!
//! ## Why one overall timeout around everything?
//!
//! Each layer has its own budget (load, per-page attempt, render,
//! recognition), but retries and batches add up. `overall_timeout` bounds
//! the whole call with `tokio::time::timeout`; on expiry the run future is
//! dropped, and dropping it drops the [`DocumentHandle`], which releases the
//! document. No exit path leaves a handle open.

use crate::config::ExtractionOptions;
use crate::document::{DocumentBackend, DocumentHandle, SourceKind};
use crate::error::{ExtractionError, Stage};
use crate::output::{ExtractionMethod, ExtractionOutput, ExtractionStats};
use crate::pipeline::backend::DefaultBackend;
use crate::pipeline::chunk::{run_text_layer, Schedule, TextLayerOutcome};
use crate::pipeline::input::{open_document, ExtractionSource};
use crate::pipeline::ocr::{run_ocr_fallback, OcrService};
use crate::progress::{ProgressAggregator, ProgressCallback};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const TASK_LOAD: &str = "load";
const TASK_TEXT: &str = "text";
const TASK_OCR: &str = "ocr";

const WEIGHT_LOAD: f64 = 10.0;
const WEIGHT_TEXT: f64 = 65.0;
const WEIGHT_OCR: f64 = 25.0;

/// Where an extraction call currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtractionState {
    Idle,
    Loading,
    DirectExtracting,
    ChunkedExtracting,
    OcrFallback,
    Completed,
    Failed,
    Cancelled,
}

impl ExtractionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExtractionState::Completed | ExtractionState::Failed | ExtractionState::Cancelled
        )
    }
}

impl fmt::Display for ExtractionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExtractionState::Idle => "idle",
            ExtractionState::Loading => "loading",
            ExtractionState::DirectExtracting => "direct extracting",
            ExtractionState::ChunkedExtracting => "chunked extracting",
            ExtractionState::OcrFallback => "ocr fallback",
            ExtractionState::Completed => "completed",
            ExtractionState::Failed => "failed",
            ExtractionState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Current state of one call, shared with its [`ExtractionHandle`].
#[derive(Debug)]
struct StateCell(Mutex<ExtractionState>);

impl StateCell {
    fn new() -> Self {
        StateCell(Mutex::new(ExtractionState::Idle))
    }

    fn get(&self) -> ExtractionState {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enter(&self, next: ExtractionState) {
        let mut state = self.0.lock().unwrap_or_else(|e| e.into_inner());
        let prev = *state;
        if prev != next {
            debug!(from = %prev, to = %next, "extraction state");
            *state = next;
        }
    }
}

// ── Extractor ────────────────────────────────────────────────────────────────

#[derive(Clone)]
enum OcrRef {
    Global,
    Shared(Arc<OcrService>),
}

impl OcrRef {
    fn get(&self) -> &OcrService {
        match self {
            OcrRef::Global => OcrService::global(),
            OcrRef::Shared(service) => service.as_ref(),
        }
    }
}

/// Runs extractions against a document backend and an OCR service.
#[derive(Clone)]
pub struct Extractor {
    backend: Arc<dyn DocumentBackend>,
    ocr: OcrRef,
}

impl fmt::Debug for Extractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extractor").finish_non_exhaustive()
    }
}

impl Default for Extractor {
    fn default() -> Self {
        Self {
            backend: Arc::new(DefaultBackend::new()),
            ocr: OcrRef::Global,
        }
    }
}

impl Extractor {
    pub fn new(backend: Arc<dyn DocumentBackend>, ocr: Arc<OcrService>) -> Self {
        Self {
            backend,
            ocr: OcrRef::Shared(ocr),
        }
    }

    /// pdfium + image decoding, with the process-wide OCR service.
    pub fn with_defaults() -> Self {
        Self::default()
    }

    /// Extract and return only the normalised text.
    pub async fn extract(
        &self,
        source: ExtractionSource,
        progress: Option<ProgressCallback>,
        cancel: Option<CancellationToken>,
        options: &ExtractionOptions,
    ) -> Result<String, ExtractionError> {
        self.run(source, progress, cancel, options)
            .await
            .map(|out| out.text)
    }

    /// Extract and return the text with per-page results and counters.
    pub async fn run(
        &self,
        source: ExtractionSource,
        progress: Option<ProgressCallback>,
        cancel: Option<CancellationToken>,
        options: &ExtractionOptions,
    ) -> Result<ExtractionOutput, ExtractionError> {
        let state = StateCell::new();
        self.run_tracked(source, progress, cancel.unwrap_or_default(), options, &state)
            .await
    }

    /// Start an extraction on the current tokio runtime.
    pub fn spawn(
        &self,
        source: ExtractionSource,
        progress: Option<ProgressCallback>,
        options: ExtractionOptions,
    ) -> ExtractionHandle {
        let cancel = CancellationToken::new();
        let state = Arc::new(StateCell::new());
        let extractor = self.clone();
        let task = {
            let cancel = cancel.clone();
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                extractor
                    .run_tracked(source, progress, cancel, &options, &state)
                    .await
            })
        };
        ExtractionHandle {
            cancel,
            state,
            task,
        }
    }

    async fn run_tracked(
        &self,
        source: ExtractionSource,
        progress: Option<ProgressCallback>,
        cancel: CancellationToken,
        options: &ExtractionOptions,
        state: &StateCell,
    ) -> Result<ExtractionOutput, ExtractionError> {
        let started = Instant::now();
        let progress = ProgressAggregator::new(progress, options.progress_interval());
        let budget = options.overall_timeout();

        let result = match tokio::time::timeout(
            budget,
            self.run_inner(source, options, &cancel, &progress, state, started),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!("Extraction exceeded the overall timeout of {:?}", budget);
                Err(ExtractionError::timeout(Stage::Overall, budget))
            }
        };

        match &result {
            Ok(out) => {
                state.enter(ExtractionState::Completed);
                info!(
                    method = ?out.method,
                    chars = out.text.len(),
                    elapsed_ms = out.stats.total_duration_ms,
                    "Extraction complete"
                );
            }
            Err(ExtractionError::Cancelled) => {
                state.enter(ExtractionState::Cancelled);
                info!("Extraction cancelled");
            }
            Err(e) => {
                state.enter(ExtractionState::Failed);
                warn!("Extraction failed: {e}");
            }
        }
        result
    }

    async fn run_inner(
        &self,
        source: ExtractionSource,
        options: &ExtractionOptions,
        cancel: &CancellationToken,
        progress: &ProgressAggregator,
        state: &StateCell,
        started: Instant,
    ) -> Result<ExtractionOutput, ExtractionError> {
        progress.reset();
        progress.register_task(TASK_LOAD, WEIGHT_LOAD);
        progress.register_task(TASK_TEXT, WEIGHT_TEXT);
        progress.register_task(TASK_OCR, WEIGHT_OCR);

        if cancel.is_cancelled() {
            return Err(ExtractionError::Cancelled);
        }

        // ── Step 1: Load ─────────────────────────────────────────────────
        state.enter(ExtractionState::Loading);
        let handle = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ExtractionError::Cancelled),
            r = open_document(self.backend.as_ref(), source, options) => r?,
        };
        progress.complete_task(TASK_LOAD);
        info!(
            "Loaded {} ({} pages, {} bytes)",
            handle.source_kind(),
            handle.page_count(),
            handle.byte_size()
        );

        // `handle` is dropped (and released) on any early return below.
        if cancel.is_cancelled() {
            return Err(ExtractionError::Cancelled);
        }

        // ── Step 2: Text layer, then OCR if needed ───────────────────────
        let extracted = self
            .extract_from(&handle, options, cancel, progress, state)
            .await;

        let total_pages = handle.page_count();
        let byte_size = handle.byte_size();
        handle.release();
        let (text, method, outcome) = extracted?;

        Ok(ExtractionOutput {
            text,
            method,
            stats: ExtractionStats {
                total_pages,
                attempted_pages: outcome.pages.len(),
                failed_pages: outcome.failed_pages(),
                batches: outcome.batches,
                ocr_used: method == ExtractionMethod::Ocr,
                byte_size,
                total_duration_ms: started.elapsed().as_millis() as u64,
            },
            pages: outcome.pages,
        })
    }

    async fn extract_from(
        &self,
        handle: &DocumentHandle,
        options: &ExtractionOptions,
        cancel: &CancellationToken,
        progress: &ProgressAggregator,
        state: &StateCell,
    ) -> Result<(String, ExtractionMethod, TextLayerOutcome), ExtractionError> {
        if handle.source_kind() == SourceKind::Image {
            progress.complete_task(TASK_TEXT);
            state.enter(ExtractionState::OcrFallback);
            let text = run_ocr_fallback(handle, self.ocr.get(), options, cancel, progress, TASK_OCR).await?;
            return Ok((text, ExtractionMethod::Ocr, TextLayerOutcome::default()));
        }

        let schedule = Schedule::choose(handle.page_count(), options);
        let method = match schedule {
            Schedule::Direct => {
                state.enter(ExtractionState::DirectExtracting);
                ExtractionMethod::Direct
            }
            Schedule::Chunked { .. } => {
                state.enter(ExtractionState::ChunkedExtracting);
                ExtractionMethod::Chunked
            }
        };
        let outcome = run_text_layer(handle, schedule, options, cancel, progress, TASK_TEXT).await?;

        let usable = outcome.usable_chars();
        let fallback_reason = if outcome.all_failed() {
            Some("text layer failed on every page".to_string())
        } else if usable < options.min_usable_chars {
            Some(format!(
                "text layer yielded {usable} usable characters (minimum {})",
                options.min_usable_chars
            ))
        } else {
            None
        };

        let Some(reason) = fallback_reason else {
            progress.complete_task(TASK_OCR);
            return Ok((outcome.text(), method, outcome));
        };

        info!("{reason}; falling back to OCR");
        progress.complete_task(TASK_TEXT);
        if cancel.is_cancelled() {
            return Err(ExtractionError::Cancelled);
        }
        state.enter(ExtractionState::OcrFallback);
        let text = run_ocr_fallback(handle, self.ocr.get(), options, cancel, progress, TASK_OCR).await?;
        Ok((text, ExtractionMethod::Ocr, outcome))
    }
}

// ── Background handle ────────────────────────────────────────────────────────

/// A running extraction started with [`Extractor::spawn`].
#[derive(Debug)]
pub struct ExtractionHandle {
    cancel: CancellationToken,
    state: Arc<StateCell>,
    task: JoinHandle<Result<ExtractionOutput, ExtractionError>>,
}

impl ExtractionHandle {
    /// Request cancellation. Repeated calls, or calls after completion, do nothing.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> ExtractionState {
        self.state.get()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the extraction to finish.
    pub async fn wait(self) -> Result<ExtractionOutput, ExtractionError> {
        self.task.await.map_err(|e| ExtractionError::ExtractionFailed {
            detail: format!("extraction task failed: {e}"),
        })?
    }
}

// ── Free functions (default stack) ───────────────────────────────────────────

/// Extract text with the default backend and the process-wide OCR service.
///
/// # Errors
/// Returns the single terminal [`ExtractionError`] of the call. Pages that
/// fail on their own are absorbed into placeholders instead.
pub async fn extract(
    source: ExtractionSource,
    progress: Option<ProgressCallback>,
    options: &ExtractionOptions,
) -> Result<String, ExtractionError> {
    Extractor::with_defaults()
        .extract(source, progress, None, options)
        .await
}

/// Like [`extract`], observing `cancel`.
pub async fn extract_cancellable(
    source: ExtractionSource,
    progress: Option<ProgressCallback>,
    cancel: CancellationToken,
    options: &ExtractionOptions,
) -> Result<String, ExtractionError> {
    Extractor::with_defaults()
        .extract(source, progress, Some(cancel), options)
        .await
}

/// Blocking variant of [`extract`].
///
/// Creates a temporary tokio runtime internally; do not call from inside
/// an async context.
pub fn extract_sync(
    source: ExtractionSource,
    options: &ExtractionOptions,
) -> Result<String, ExtractionError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| ExtractionError::ExtractionFailed {
            detail: format!("failed to create tokio runtime: {e}"),
        })?
        .block_on(extract(source, None, options))
}
