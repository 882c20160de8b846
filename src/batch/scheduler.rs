//! Fixed-size worker pool over a shared claim cursor
//!
//! Workers are futures polled together on the calling task, so they
//! interleave only at await points. Each worker claims the next index with a
//! single `fetch_add`; no index is ever handed to two workers and claims are
//! issued in increasing order. Completion order is not preserved, so results
//! are re-ordered by index before they are returned.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::batch::types::WorkResult;

/// Metrics for monitoring worker behaviour during a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerMetrics {
    /// Workers spawned
    pub worker_count: usize,
    /// Indices claimed across all workers
    pub items_processed: usize,
    /// Largest number of items in progress at once
    pub peak_in_flight: usize,
}

/// Worker pool management for bounded execution
pub struct WorkerPool {
    concurrency: usize,
    metrics: Mutex<WorkerMetrics>,
}

impl WorkerPool {
    /// Create a pool that runs at most `concurrency` items at once
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            metrics: Mutex::new(WorkerMetrics::default()),
        }
    }

    /// Workers that will be spawned for `total` items
    pub fn worker_count(&self, total: usize) -> usize {
        self.concurrency.min(total)
    }

    /// Run `work` once for every index in `0..total`
    ///
    /// Returns when every worker has left its claim loop, with one result per
    /// index ordered by index.
    pub async fn run<F, Fut>(&self, total: usize, work: F) -> Vec<WorkResult>
    where
        F: Fn(usize) -> Fut,
        Fut: Future<Output = WorkResult>,
    {
        let worker_count = self.worker_count(total);
        if worker_count == 0 {
            return Vec::new();
        }

        let cursor = AtomicUsize::new(0);
        let in_flight = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        debug!(total, worker_count, "Starting workers");

        let workers = (0..worker_count).map(|worker_id| {
            let work = &work;
            let cursor = &cursor;
            let in_flight = &in_flight;
            let peak = &peak;
            async move {
                let mut produced = Vec::new();
                loop {
                    let index = cursor.fetch_add(1, Ordering::SeqCst);
                    if index >= total {
                        break;
                    }
                    trace!(worker_id, index, "Claimed item");

                    let running = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(running, Ordering::SeqCst);
                    let result = work(index).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);

                    produced.push(result);
                }
                trace!(worker_id, claimed = produced.len(), "Worker finished");
                produced
            }
        });

        let mut results: Vec<WorkResult> = join_all(workers).await.into_iter().flatten().collect();
        results.sort_by_key(|result| result.index);

        let mut metrics = self.metrics.lock();
        metrics.worker_count = worker_count;
        metrics.items_processed = results.len();
        metrics.peak_in_flight = peak.load(Ordering::SeqCst);

        results
    }

    /// Metrics of the most recent run
    pub fn metrics(&self) -> WorkerMetrics {
        self.metrics.lock().clone()
    }
}
