//! Periodic progress reporting
//!
//! Progress is mutated only by the pipeline's processing loop; a dedicated
//! reporter thread polls it at a fixed interval and invokes the user
//! callback, plus once more on stop so the final state is always reported.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

/// Snapshot of a stream's progress
#[derive(Debug, Clone, Default)]
pub struct Progress {
    /// Total number of chunks, once the split is known
    pub total_chunks: Option<usize>,
    /// Chunks fully processed so far
    pub processed_chunks: usize,
    /// Source bytes covered by processed chunks
    pub bytes_processed: usize,
    /// Fatal per-chunk errors seen so far
    pub errors: Vec<String>,
    /// Non-fatal diagnostics seen so far
    pub warnings: Vec<String>,
}

impl Progress {
    /// Completion ratio in [0, 1], when the total is known
    pub fn ratio(&self) -> Option<f64> {
        self.total_chunks.map(|total| {
            if total == 0 {
                1.0
            } else {
                self.processed_chunks as f64 / total as f64
            }
        })
    }
}

/// Callback invoked with each progress snapshot
pub type ProgressCallback = Box<dyn Fn(&Progress) + Send + 'static>;

/// Reporter thread handle; stopping fires one final report
pub(crate) struct ProgressReporter {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ProgressReporter {
    pub(crate) fn spawn(
        progress: Arc<Mutex<Progress>>,
        interval: Duration,
        callback: ProgressCallback,
    ) -> Self {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let stop_for_thread = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("lintra-progress".to_string())
            .spawn(move || {
                let report = |callback: &ProgressCallback| {
                    let snapshot = progress
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clone();
                    callback(&snapshot);
                };

                let (flag, condvar) = &*stop_for_thread;
                let mut stopped = flag.lock().unwrap_or_else(PoisonError::into_inner);
                while !*stopped {
                    let (guard, _timeout) = condvar
                        .wait_timeout(stopped, interval)
                        .unwrap_or_else(PoisonError::into_inner);
                    stopped = guard;
                    if !*stopped {
                        report(&callback);
                    }
                }
                drop(stopped);
                // Final report with the terminal state
                report(&callback);
            })
            .ok();

        Self {
            stop,
            handle,
        }
    }

    pub(crate) fn stop(&mut self) {
        let (flag, condvar) = &*self.stop;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        condvar.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.stop();
    }
}
