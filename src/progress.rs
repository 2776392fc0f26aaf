//! Progress reporting for long-running phases (extraction, relocation).
//!
//! The core only talks to the [`ProgressSink`] trait. Phases are announced with
//! `begin`; starting a new phase implicitly ends the previous one. How (or whether)
//! anything is drawn is up to the sink.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Receiver of progress events.
pub trait ProgressSink: Send + Sync {
    /// Start a phase. `None` means the total is not known yet (a spinner).
    fn begin(&self, total: Option<u64>, label: &str);
    /// Record `n` more processed items in the current phase.
    fn advance(&self, n: u64);
    /// Finish the current phase, if any.
    fn end(&self);
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn begin(&self, _total: Option<u64>, _label: &str) {}
    fn advance(&self, _n: u64) {}
    fn end(&self) {}
}

/// State handed to progress callbacks.
#[derive(Debug, Clone)]
pub struct ProgressState {
    pub label: String,
    pub total: Option<u64>,
    pub processed: u64,
    pub elapsed: Duration,
    pub finished: bool,
}

impl ProgressState {
    /// Completion in percent, if the total is known.
    pub fn percent(&self) -> Option<f32> {
        match self.total {
            Some(0) => Some(100.0),
            Some(total) => Some((self.processed as f32 / total as f32 * 100.0).min(100.0)),
            None => None,
        }
    }
}

/// A finished (or current) phase as seen by the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseRecord {
    pub label: String,
    pub total: Option<u64>,
    pub processed: u64,
}

/// Progress callback function type
pub type ProgressCallback = dyn Fn(&ProgressState) + Send + Sync;

struct Phase {
    label: String,
    total: Option<u64>,
    started: Instant,
}

/// Counting progress sink with an optional, throttled callback.
///
/// The hot path (`advance`) is a single atomic add; the callback is invoked at most
/// once per `emit_interval`, plus once at every phase boundary.
pub struct ProgressTracker {
    current: Mutex<Option<Phase>>,
    processed: AtomicU64,
    history: Mutex<Vec<PhaseRecord>>,
    last_emit: Mutex<Instant>,
    emit_interval: Duration,
    callback: Option<Arc<ProgressCallback>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ProgressTracker {
    pub fn new(emit_interval: Duration) -> Self {
        Self {
            current: Mutex::new(None),
            processed: AtomicU64::new(0),
            history: Mutex::new(Vec::new()),
            last_emit: Mutex::new(Instant::now()),
            emit_interval,
            callback: None,
        }
    }

    /// Attach a callback that receives the aggregated state.
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ProgressState) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// Items processed in the current phase.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// All phases finished so far, in order.
    pub fn phases(&self) -> Vec<PhaseRecord> {
        lock(&self.history).clone()
    }

    fn state(&self, finished: bool) -> Option<ProgressState> {
        let current = lock(&self.current);
        current.as_ref().map(|phase| ProgressState {
            label: phase.label.clone(),
            total: phase.total,
            processed: self.processed(),
            elapsed: phase.started.elapsed(),
            finished,
        })
    }

    fn emit(&self, finished: bool) {
        if let Some(callback) = &self.callback {
            if let Some(state) = self.state(finished) {
                callback(&state);
            }
        }
    }

    fn maybe_emit(&self) {
        if self.callback.is_none() {
            return;
        }
        let now = Instant::now();
        let due = {
            let mut last = lock(&self.last_emit);
            if now.duration_since(*last) >= self.emit_interval {
                *last = now;
                true
            } else {
                false
            }
        };
        if due {
            self.emit(false);
        }
    }

    fn finish_current(&self) {
        self.emit(true);
        let finished = lock(&self.current).take();
        if let Some(phase) = finished {
            lock(&self.history).push(PhaseRecord {
                label: phase.label,
                total: phase.total,
                processed: self.processed.swap(0, Ordering::Relaxed),
            });
        }
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl ProgressSink for ProgressTracker {
    fn begin(&self, total: Option<u64>, label: &str) {
        self.finish_current();
        *lock(&self.current) = Some(Phase {
            label: label.to_string(),
            total,
            started: Instant::now(),
        });
        self.emit(false);
    }

    fn advance(&self, n: u64) {
        self.processed.fetch_add(n, Ordering::Relaxed);
        self.maybe_emit();
    }

    fn end(&self) {
        self.finish_current();
    }
}

/// State shared by the phases of one extraction run.
///
/// Holds the progress sink and the non-directory entry count, so the count is
/// computed at most once and reused by extraction and relocation.
pub struct RunContext<'a> {
    pub progress: &'a dyn ProgressSink,
    pub entry_count: Option<u64>,
}

impl<'a> RunContext<'a> {
    pub fn new(progress: &'a dyn ProgressSink) -> Self {
        Self { progress, entry_count: None }
    }
}
