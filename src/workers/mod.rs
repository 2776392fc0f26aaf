//! Bounded worker pool with fail-fast cancellation.
//!
//! Jobs are handed to a fixed set of scoped threads over a rendezvous channel, so
//! the dispatching thread blocks until a worker is free to take the next job. The
//! first error wins: it is stored, dispatch stops, and in-flight jobs finish before
//! the error is returned.

use crate::error::PackError;
use crossbeam_channel::bounded;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;

/// Worker count used when the caller does not choose one.
pub fn default_worker_count() -> usize {
    num_cpus::get().max(1)
}

#[derive(Default)]
struct FailFast {
    cancelled: AtomicBool,
    first_error: Mutex<Option<PackError>>,
}

impl FailFast {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn record(&self, err: PackError) {
        let mut slot = self.first_error.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_none() {
            *slot = Some(err);
        }
        self.cancelled.store(true, Ordering::Release);
    }

    fn take(self) -> Option<PackError> {
        self.first_error.into_inner().unwrap_or_else(|p| p.into_inner())
    }
}

/// Runs `task` over every job with at most `workers` jobs in flight.
///
/// An `Err` produced by the job iterator itself is treated like a failed job.
/// Returns the number of dispatched jobs.
pub fn run_bounded<T, I, F>(jobs: I, workers: usize, task: F) -> Result<usize, PackError>
where
    T: Send,
    I: IntoIterator<Item = Result<T, PackError>>,
    F: Fn(T) -> Result<(), PackError> + Sync,
{
    let workers = workers.max(1);
    let state = FailFast::default();

    let (dispatched, panicked) = thread::scope(|s| {
        // capacity 0: a send only completes once a worker has taken the job
        let (sender, receiver) = bounded::<T>(0);

        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let receiver = receiver.clone();
                let task = &task;
                let state = &state;
                s.spawn(move || {
                    for job in receiver.iter() {
                        if state.is_cancelled() {
                            continue;
                        }
                        if let Err(e) = task(job) {
                            state.record(e);
                        }
                    }
                })
            })
            .collect();
        drop(receiver);

        let mut dispatched = 0usize;
        for job in jobs {
            if state.is_cancelled() {
                break;
            }
            match job {
                Ok(job) => {
                    if sender.send(job).is_err() {
                        break;
                    }
                    dispatched += 1;
                }
                Err(e) => {
                    state.record(e);
                    break;
                }
            }
        }
        drop(sender);

        let panicked = handles
            .into_iter()
            .fold(false, |acc, handle| handle.join().is_err() || acc);
        (dispatched, panicked)
    });

    if let Some(err) = state.take() {
        return Err(err);
    }
    if panicked {
        return Err(PackError::WorkerPanicked);
    }
    Ok(dispatched)
}
