//! Write-through of item outcomes to an external progress store
//!
//! Workers hand updates to a [`ProgressPersister`] without waiting. A
//! detached task performs the writes in order; failed writes are logged and
//! counted but never change an item's outcome. Recorded chat references are
//! what lets a later run skip rows that already succeeded.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, warn};

use super::stats::{BatchStats, StatsSource};
use super::types::{BatchItem, ItemOutcome, SkipReason, WorkResult};

/// Persisted fields for one row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemUpdate {
    /// Row the update applies to
    pub row_index: usize,
    /// Set when the row was answered
    pub chat_reference: Option<String>,
    /// Failure message, or the processor's note for a short query
    pub error: Option<String>,
    /// Row was turned away as too short to answer
    pub short_query: bool,
    /// Row was blocked by content policy
    pub redacted: bool,
    /// Suggested place to send the user for a short query
    pub fallback_url: Option<String>,
    /// When the outcome was reached
    pub processed_at: DateTime<Utc>,
}

impl ItemUpdate {
    /// Update to persist for `result`, if its outcome is recorded
    ///
    /// Rows skipped because they were already answered or because the run was
    /// cancelled leave the store untouched.
    pub fn from_result(result: &WorkResult) -> Option<Self> {
        let mut update = ItemUpdate {
            row_index: result.row_index,
            chat_reference: None,
            error: None,
            short_query: false,
            redacted: false,
            fallback_url: None,
            processed_at: Utc::now(),
        };

        match &result.outcome {
            ItemOutcome::Completed { chat_reference, .. } => {
                update.chat_reference = Some(chat_reference.clone());
            }
            ItemOutcome::Failed { error, redacted } => {
                update.error = Some(error.clone());
                update.redacted = *redacted;
            }
            ItemOutcome::Skipped {
                reason: SkipReason::ShortQuery,
                fallback_url,
                message,
                ..
            } => {
                update.short_query = true;
                update.error = message.clone();
                update.fallback_url = fallback_url.clone();
            }
            ItemOutcome::Skipped { .. } => return None,
        }
        Some(update)
    }
}

/// External store of per-row progress
///
/// Writes are keyed by `row_index` and must be idempotent: applying the same
/// update twice leaves the same state as applying it once.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Apply `items` to the stored rows of `batch_id`
    async fn upsert_items(&self, batch_id: &str, items: &[ItemUpdate]) -> Result<()>;
}

/// What the detached writer managed to persist
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceReport {
    /// Updates the store accepted
    pub written: usize,
    /// Updates the store rejected
    pub failed: usize,
    /// Updates still queued or in flight when the writer was stopped
    pub abandoned: usize,
    /// The writer task stopped before draining its queue
    pub interrupted: bool,
}

#[derive(Debug, Default)]
struct WriteCounters {
    queued: AtomicUsize,
    written: AtomicUsize,
    failed: AtomicUsize,
}

impl WriteCounters {
    fn report(&self, interrupted: bool) -> PersistenceReport {
        let written = self.written.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        PersistenceReport {
            written,
            failed,
            abandoned: self
                .queued
                .load(Ordering::SeqCst)
                .saturating_sub(written + failed),
            interrupted,
        }
    }
}

/// Detached, best-effort writer for one run
pub struct ProgressPersister {
    sender: mpsc::UnboundedSender<ItemUpdate>,
    handle: JoinHandle<()>,
    counters: Arc<WriteCounters>,
}

impl ProgressPersister {
    /// Start the writer task for `batch_id`
    pub fn spawn(store: Arc<dyn ProgressStore>, batch_id: impl Into<String>) -> Self {
        let batch_id = batch_id.into();
        let (sender, mut receiver) = mpsc::unbounded_channel::<ItemUpdate>();
        let counters = Arc::new(WriteCounters::default());
        let progress = Arc::clone(&counters);

        let handle = tokio::spawn(async move {
            while let Some(update) = receiver.recv().await {
                match store
                    .upsert_items(&batch_id, std::slice::from_ref(&update))
                    .await
                {
                    Ok(()) => {
                        progress.written.fetch_add(1, Ordering::SeqCst);
                        debug!(batch_id = %batch_id, row_index = update.row_index, "Persisted item progress");
                    }
                    Err(e) => {
                        progress.failed.fetch_add(1, Ordering::SeqCst);
                        warn!(
                            batch_id = %batch_id,
                            row_index = update.row_index,
                            error = %e,
                            "Failed to persist item progress"
                        );
                    }
                }
            }
        });

        Self {
            sender,
            handle,
            counters,
        }
    }

    /// Queue an update without waiting for the write
    pub fn record(&self, update: ItemUpdate) {
        let row_index = update.row_index;
        self.counters.queued.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(update).is_err() {
            self.counters.queued.fetch_sub(1, Ordering::SeqCst);
            warn!(row_index, "Progress writer has stopped, dropping update");
        }
    }

    /// Close the queue and wait up to `drain_timeout` for queued updates
    ///
    /// Updates the writer has not reached by then are dropped and counted as
    /// abandoned; the rows stay unprocessed in the store.
    pub async fn finish(self, drain_timeout: Duration) -> PersistenceReport {
        let Self {
            sender,
            mut handle,
            counters,
        } = self;
        drop(sender);

        let interrupted = match time::timeout(drain_timeout, &mut handle).await {
            Ok(Ok(())) => false,
            Ok(Err(e)) => {
                error!(error = %e, "Progress writer task ended abnormally");
                true
            }
            Err(_) => {
                handle.abort();
                true
            }
        };

        let report = counters.report(interrupted);
        if interrupted && report.abandoned > 0 {
            warn!(
                abandoned = report.abandoned,
                drain_timeout_ms = drain_timeout.as_millis() as u64,
                "Progress writer did not drain in time"
            );
        }
        report
    }
}

/// In-memory progress store, also usable as a stats source
#[derive(Clone, Default)]
pub struct MemoryProgressStore {
    batches: Arc<DashMap<String, BTreeMap<usize, BatchItem>>>,
    fail_writes: Arc<AtomicBool>,
    fail_stats: Arc<AtomicBool>,
    upsert_calls: Arc<AtomicUsize>,
}

impl MemoryProgressStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the rows of a freshly uploaded batch
    pub fn seed(&self, batch_id: &str, items: &[BatchItem]) {
        let mut rows = self.batches.entry(batch_id.to_string()).or_default();
        for item in items {
            rows.insert(item.row_index, item.clone());
        }
    }

    /// Rows of a batch ordered by row index, as a resumed run would load them
    pub fn items(&self, batch_id: &str) -> Vec<BatchItem> {
        self.batches
            .get(batch_id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// One stored row
    pub fn item(&self, batch_id: &str, row_index: usize) -> Option<BatchItem> {
        self.batches
            .get(batch_id)
            .and_then(|rows| rows.get(&row_index).cloned())
    }

    /// Make subsequent writes fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent stats queries fail
    pub fn set_fail_stats(&self, fail: bool) {
        self.fail_stats.store(fail, Ordering::SeqCst);
    }

    /// Number of upsert calls received, including failed ones
    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn upsert_items(&self, batch_id: &str, items: &[ItemUpdate]) -> Result<()> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("progress store unavailable"));
        }

        let mut rows = self.batches.entry(batch_id.to_string()).or_default();
        for update in items {
            let row = rows.entry(update.row_index).or_insert_with(|| BatchItem {
                row_index: update.row_index,
                ..Default::default()
            });
            // a recorded answer is permanent
            if row.chat_reference.is_some() {
                continue;
            }
            row.chat_reference = update.chat_reference.clone();
            row.error = update.error.clone();
            row.short_query = update.short_query;
            row.redacted = update.redacted;
        }
        Ok(())
    }
}

#[async_trait]
impl StatsSource for MemoryProgressStore {
    async fn get_stats(&self, batch_id: &str) -> Result<BatchStats> {
        if self.fail_stats.load(Ordering::SeqCst) {
            return Err(anyhow!("stats source unavailable"));
        }

        let rows = self
            .batches
            .get(batch_id)
            .ok_or_else(|| anyhow!("unknown batch {}", batch_id))?;

        Ok(rows.values().fold(
            BatchStats {
                total: rows.len(),
                ..Default::default()
            },
            |mut stats, row| {
                if row.chat_reference.is_some() || row.error.is_some() || row.short_query {
                    stats.processed += 1;
                }
                if row.chat_reference.is_none() && row.error.is_some() && !row.short_query {
                    stats.failed += 1;
                }
                stats
            },
        ))
    }
}
