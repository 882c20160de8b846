//! Periodic aggregate-progress telemetry
//!
//! The poller runs beside the worker pool rather than inside it: it is
//! started before any worker is spawned and stopped by the façade once the
//! workers have joined. Dropping a [`StatsPoller`] also stops it. A poll that
//! is still in flight when the poller stops is abandoned, so a stalled source
//! never holds up the run.

use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::types::StatusCallback;

/// Aggregate progress of a batch as seen by the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
    /// Rows stored for the batch
    pub total: usize,
    /// Rows with a recorded answer, error or short-query flag
    pub processed: usize,
    /// Rows whose recorded outcome is an error
    pub failed: usize,
}

/// Best-effort source of aggregate stats
#[async_trait]
pub trait StatsSource: Send + Sync {
    /// Current aggregate counts for `batch_id`
    async fn get_stats(&self, batch_id: &str) -> Result<BatchStats>;
}

/// Handle to a running poll loop
pub struct StatsPoller {
    stop: CancellationToken,
    handle: Option<JoinHandle<usize>>,
}

impl StatsPoller {
    /// Poll `source` every `interval`, forwarding each result to `on_status`
    ///
    /// The first poll happens one interval after start. Failed polls are
    /// logged and skipped.
    pub fn start(
        source: Arc<dyn StatsSource>,
        batch_id: impl Into<String>,
        interval: Duration,
        on_status: Option<StatusCallback>,
    ) -> Self {
        let batch_id = batch_id.into();
        let stop = CancellationToken::new();
        let stopped = stop.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut emitted = 0usize;

            loop {
                tokio::select! {
                    biased;
                    _ = stopped.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let polled = tokio::select! {
                    biased;
                    _ = stopped.cancelled() => {
                        debug!(batch_id = %batch_id, "Abandoning in-flight stats poll");
                        break;
                    }
                    polled = poll_once(source.as_ref(), &batch_id) => polled,
                };

                match polled {
                    Ok(stats) => {
                        debug!(batch_id = %batch_id, ?stats, "Polled batch stats");
                        if let Some(callback) = &on_status {
                            callback(stats);
                        }
                        emitted += 1;
                    }
                    Err(e) => {
                        warn!(batch_id = %batch_id, error = %e, "Stats poll failed");
                    }
                }
            }
            emitted
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Stop polling and wait for the loop to exit; returns the number of emissions
    pub async fn stop(mut self) -> usize {
        self.stop.cancel();
        match self.handle.take() {
            Some(handle) => handle.await.unwrap_or_else(|e| {
                warn!(error = %e, "Stats poller ended abnormally");
                0
            }),
            None => 0,
        }
    }
}

#[instrument(level = "debug", skip(source))]
async fn poll_once(source: &dyn StatsSource, batch_id: &str) -> Result<BatchStats> {
    source.get_stats(batch_id).await
}

impl Drop for StatsPoller {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
