//! Progress reporting: weighted sub-tasks folded into one throttled percent.
//!
//! Inject an [`Arc<dyn ProgressSink>`] (any `Fn(u8) + Send + Sync` closure
//! works) to receive a single 0–100 value for the whole extraction, no
//! matter which stages run. The pipeline registers one
//! [`ProgressAggregator`] task per stage with a weight proportional to its
//! expected share of the work:
//!
//! | Task   | Weight | Range     |
//! |--------|--------|-----------|
//! | `load` | 10     | 0–10 %    |
//! | `text` | 65     | 10–75 %   |
//! | `ocr`  | 25     | 75–100 %  |
//!
//! # Example
//!
//! ```rust
//! use recipe_extract::progress::{ProgressAggregator, ProgressCallback};
//! use std::sync::{Arc, Mutex};
//! use std::time::Duration;
//!
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let sink = Arc::clone(&seen);
//! let callback: ProgressCallback = Arc::new(move |p: u8| sink.lock().unwrap().push(p));
//!
//! let progress = ProgressAggregator::new(Some(callback), Duration::ZERO);
//! progress.register_task("a", 1.0);
//! progress.register_task("b", 3.0);
//! progress.complete_task("a");
//! assert_eq!(progress.current(), 25);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Receives the overall extraction progress.
///
/// Implementations must be `Send + Sync`: pages within a batch are extracted
/// concurrently and each one may trigger a report.
pub trait ProgressSink: Send + Sync {
    /// `percent` is in `0..=100` and never decreases within one call.
    fn report(&self, percent: u8);
}

impl<F> ProgressSink for F
where
    F: Fn(u8) + Send + Sync,
{
    fn report(&self, percent: u8) {
        self(percent)
    }
}

/// Convenience alias for the shared callback type.
pub type ProgressCallback = Arc<dyn ProgressSink>;

#[derive(Debug, Clone)]
struct TaskState {
    weight: f64,
    percent: f64,
    completed: bool,
}

#[derive(Debug, Default)]
struct Inner {
    tasks: HashMap<String, TaskState>,
    last_reported: Option<u8>,
    last_report_at: Option<Instant>,
}

impl Inner {
    /// Weighted mean of all task percentages, floored to an integer.
    fn overall(&self) -> u8 {
        let total_weight: f64 = self.tasks.values().map(|t| t.weight).sum();
        if total_weight <= 0.0 {
            return 0;
        }
        let weighted: f64 = self.tasks.values().map(|t| t.weight * t.percent).sum();
        (weighted / total_weight).floor().clamp(0.0, 100.0) as u8
    }
}

/// Tracks N weighted tasks and reports one throttled overall percentage.
///
/// A report reaches the sink only when the throttle interval has elapsed
/// since the previous report **and** the value changed. Reaching 100 skips
/// the interval so the terminal value is never swallowed, and `reset()`
/// always reports 0 immediately.
pub struct ProgressAggregator {
    sink: Option<ProgressCallback>,
    interval: Duration,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for ProgressAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressAggregator")
            .field("sink", &self.sink.as_ref().map(|_| "<dyn ProgressSink>"))
            .field("interval", &self.interval)
            .finish()
    }
}

impl ProgressAggregator {
    pub fn new(sink: Option<ProgressCallback>, interval: Duration) -> Self {
        Self {
            sink,
            interval,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register (or re-register) a task at 0 %.
    pub fn register_task(&self, id: impl Into<String>, weight: f64) {
        let mut inner = self.lock();
        inner.tasks.insert(
            id.into(),
            TaskState {
                weight: weight.max(0.0),
                percent: 0.0,
                completed: false,
            },
        );
        self.maybe_report(&mut inner);
    }

    /// Set a task's percentage. Values are clamped to 100 and never move a
    /// task backwards; completed and unknown tasks are left untouched.
    pub fn update_task(&self, id: &str, percent: f64) {
        let mut inner = self.lock();
        match inner.tasks.get_mut(id) {
            Some(task) if !task.completed => {
                let clamped = percent.clamp(0.0, 100.0);
                if clamped > task.percent {
                    task.percent = clamped;
                }
            }
            Some(_) => return,
            None => {
                debug!(task = id, "progress update for unregistered task ignored");
                return;
            }
        }
        self.maybe_report(&mut inner);
    }

    /// Mark a task as finished (100 %). Further updates are ignored.
    pub fn complete_task(&self, id: &str) {
        let mut inner = self.lock();
        match inner.tasks.get_mut(id) {
            Some(task) => {
                task.percent = 100.0;
                task.completed = true;
            }
            None => {
                debug!(task = id, "completion for unregistered task ignored");
                return;
            }
        }
        self.maybe_report(&mut inner);
    }

    /// Drop every task and report 0 immediately.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.tasks.clear();
        inner.last_reported = Some(0);
        inner.last_report_at = Some(Instant::now());
        if let Some(ref sink) = self.sink {
            sink.report(0);
        }
    }

    /// Current overall value, never below what was last reported.
    pub fn current(&self) -> u8 {
        let inner = self.lock();
        inner.overall().max(inner.last_reported.unwrap_or(0))
    }

    /// The last value delivered to the sink, if any.
    pub fn last_reported(&self) -> Option<u8> {
        self.lock().last_reported
    }

    /// Report while holding the lock so concurrent updates reach the sink
    /// in non-decreasing order.
    fn maybe_report(&self, inner: &mut Inner) {
        let value = inner.overall().max(inner.last_reported.unwrap_or(0));
        if inner.last_reported == Some(value) {
            return;
        }
        let now = Instant::now();
        let interval_elapsed = inner
            .last_report_at
            .map(|at| now.duration_since(at) >= self.interval)
            .unwrap_or(true);
        if !interval_elapsed && value < 100 {
            return;
        }
        inner.last_reported = Some(value);
        inner.last_report_at = Some(now);
        if let Some(ref sink) = self.sink {
            sink.report(value);
        }
    }
}
