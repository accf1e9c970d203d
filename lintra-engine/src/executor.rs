//! Bounded-concurrency chunk execution
//!
//! Chunks are submitted to a rayon pool in index order, capped by an
//! in-flight window; workers push results over an mpsc channel and the
//! consumer yields them in completion order. A chunk that outlives the
//! configured timeout is reported as failed and marked abandoned; its
//! late real result is discarded when it eventually arrives.

use crate::cancel::CancellationToken;
use crate::error::{EngineError, Result};
use lintra_core::chunk::{Chunk, ChunkResult};
use lintra_core::traits::TelemetryRecorder;
use std::collections::{BTreeMap, HashSet};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared per-chunk processing function
pub(crate) type ProcessFn = Arc<dyn Fn(Chunk) -> ChunkResult + Send + Sync>;

/// Build a named worker pool
pub(crate) fn build_pool(threads: Option<usize>) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads.unwrap_or_else(num_cpus::get))
        .thread_name(|index| format!("lintra-worker-{index}"))
        .build()
        .map_err(|err| EngineError::WorkerPool {
            reason: err.to_string(),
        })
}

/// One parallel execution over a fixed chunk sequence
///
/// Yields results in completion order, not submission order. Cancellation
/// is observed before each submission; chunks already submitted run to
/// completion and are still yielded.
pub(crate) struct ParallelRun {
    pool: rayon::ThreadPool,
    process: ProcessFn,
    telemetry: Arc<dyn TelemetryRecorder>,
    cancel: CancellationToken,
    pending: std::vec::IntoIter<Chunk>,
    sender: Sender<ChunkResult>,
    receiver: Receiver<ChunkResult>,
    /// Submission instant per in-flight chunk index, oldest first
    in_flight: BTreeMap<usize, Instant>,
    abandoned: HashSet<usize>,
    window: usize,
    timeout: Option<Duration>,
}

impl ParallelRun {
    pub(crate) fn new(
        pool: rayon::ThreadPool,
        chunks: Vec<Chunk>,
        window: usize,
        timeout: Option<Duration>,
        cancel: CancellationToken,
        process: ProcessFn,
        telemetry: Arc<dyn TelemetryRecorder>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            pool,
            process,
            telemetry,
            cancel,
            pending: chunks.into_iter(),
            sender,
            receiver,
            in_flight: BTreeMap::new(),
            abandoned: HashSet::new(),
            window: window.max(1),
            timeout,
        }
    }

    fn submit_up_to_window(&mut self) {
        while self.in_flight.len() < self.window && !self.cancel.is_cancelled() {
            let Some(chunk) = self.pending.next() else {
                break;
            };
            let index = chunk.index;
            self.in_flight.insert(index, Instant::now());
            let process = Arc::clone(&self.process);
            let sender = self.sender.clone();
            self.pool.spawn(move || {
                let result = process(chunk);
                // The consumer may have been dropped; nothing to do then
                let _ = sender.send(result);
            });
        }
    }

    /// Index of the longest-in-flight chunk that has exceeded `timeout`
    fn oldest_overdue(&self, timeout: Duration) -> Option<usize> {
        self.in_flight
            .iter()
            .min_by_key(|(_, submitted)| **submitted)
            .filter(|(_, submitted)| submitted.elapsed() >= timeout)
            .map(|(index, _)| *index)
    }

    fn wait_for_result(&mut self) -> Option<ChunkResult> {
        loop {
            let Some(timeout) = self.timeout else {
                return self.receiver.recv().ok();
            };

            let deadline = self
                .in_flight
                .values()
                .min()
                .map(|submitted| *submitted + timeout)?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.receiver.recv_timeout(remaining) {
                Ok(result) => return Some(result),
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(index) = self.oldest_overdue(timeout) {
                        self.in_flight.remove(&index);
                        self.abandoned.insert(index);
                        tracing::warn!(index, ?timeout, "chunk processing timed out");
                        self.telemetry.record_event(
                            "chunk.timeout",
                            Some(timeout),
                            &[("index", index as u64)],
                        );
                        return Some(ChunkResult::timed_out(index, timeout));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

impl Iterator for ParallelRun {
    type Item = ChunkResult;

    fn next(&mut self) -> Option<ChunkResult> {
        loop {
            self.submit_up_to_window();
            if self.in_flight.is_empty() {
                return None;
            }
            let result = self.wait_for_result()?;
            if self.abandoned.remove(&result.index) {
                // Late result for a chunk already reported as timed out
                tracing::debug!(index = result.index, "discarding abandoned chunk result");
                continue;
            }
            self.in_flight.remove(&result.index);
            return Some(result);
        }
    }
}
