//! Batch Engine
//!
//! Entry point for running a batch:
//! - Validates run-level preconditions (rows present, batch identifier set)
//! - Registers the run for cancellation and rejects duplicate runs
//! - Starts the stats poller, then a bounded pool of workers
//! - Per item: cancellation check, resume check, question extraction, retry loop
//! - Writes each recorded outcome through to the progress store without blocking
//! - Stops the poller and drains pending writes before returning the summary

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::cancellation::{CancelOutcome, CancellationRegistry};
use super::error_handling::{DefaultErrorClassifier, ErrorClassifier, RetryController, RetryPolicy};
use super::persister::{ItemUpdate, ProgressPersister, ProgressStore};
use super::processor::{ItemProcessor, RuntimeContext};
use super::question::{extract_question, NO_QUESTION_MESSAGE};
use super::scheduler::WorkerPool;
use super::stats::{BatchStats, StatsPoller, StatsSource};
use super::types::{
    BatchItem, BatchRunOutput, ItemOutcome, ProgressCallback, ProgressUpdate, RunSummary,
    SkipReason, StatusCallback, WorkResult,
};
use crate::config::BatchConfig;
use crate::{BatchError, Result};

/// Parameters of one `run_batch` call
///
/// Unset options fall back to the engine's [`BatchConfig`].
#[derive(Clone, Default)]
pub struct RunRequest {
    /// Rows to process
    pub entries: Vec<BatchItem>,
    /// Persisted batch identifier; required
    pub batch_id: Option<String>,
    /// Worker count, clamped to `1..=entries.len()`
    pub concurrency: Option<usize>,
    /// Additional attempts beyond the first
    pub retries: Option<u32>,
    /// Interval between stats polls
    pub stats_polling_interval: Option<Duration>,
    /// Settings forwarded to the processor
    pub context: Option<RuntimeContext>,
    /// Called after each item reaches its outcome
    pub on_progress: Option<ProgressCallback>,
    /// Called with each successful stats poll
    pub on_status_update: Option<StatusCallback>,
    /// Caller-owned cancellation signal; bypasses [`BatchEngine::cancel_batch`]
    pub abort_signal: Option<CancellationToken>,
}

impl fmt::Debug for RunRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunRequest")
            .field("entries", &self.entries.len())
            .field("batch_id", &self.batch_id)
            .field("concurrency", &self.concurrency)
            .field("retries", &self.retries)
            .field("stats_polling_interval", &self.stats_polling_interval)
            .field("context", &self.context)
            .field("on_progress", &self.on_progress.is_some())
            .field("on_status_update", &self.on_status_update.is_some())
            .field("abort_signal", &self.abort_signal.is_some())
            .finish()
    }
}

impl RunRequest {
    /// Request for `entries` of the batch `batch_id`
    pub fn new(batch_id: impl Into<String>, entries: Vec<BatchItem>) -> Self {
        Self {
            entries,
            batch_id: Some(batch_id.into()),
            ..Default::default()
        }
    }

    /// Override the worker count
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Override the retry budget
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Override the stats polling interval
    pub fn with_stats_polling_interval(mut self, interval: Duration) -> Self {
        self.stats_polling_interval = Some(interval);
        self
    }

    /// Settings forwarded to the processor; defaults to the batch id alone
    pub fn with_context(mut self, context: RuntimeContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Cancel through a caller-owned signal
    pub fn with_abort_signal(mut self, signal: CancellationToken) -> Self {
        self.abort_signal = Some(signal);
        self
    }

    /// Set progress callback
    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(ProgressUpdate) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    /// Set stats callback
    pub fn on_status_update<F>(mut self, callback: F) -> Self
    where
        F: Fn(BatchStats) + Send + Sync + 'static,
    {
        self.on_status_update = Some(Arc::new(callback));
        self
    }
}

/// State shared by the workers of one run
struct RunState<'a> {
    batch_id: &'a str,
    total: usize,
    context: RuntimeContext,
    retry: RetryController,
    signal: CancellationToken,
    persister: &'a ProgressPersister,
    on_progress: Option<ProgressCallback>,
    finished: AtomicUsize,
}

/// Drives batches of rows through an [`ItemProcessor`]
pub struct BatchEngine {
    processor: Arc<dyn ItemProcessor>,
    store: Arc<dyn ProgressStore>,
    stats: Arc<dyn StatsSource>,
    classifier: Arc<dyn ErrorClassifier>,
    config: BatchConfig,
    registry: CancellationRegistry,
}

impl BatchEngine {
    /// Create an engine with default settings
    pub fn new(
        processor: Arc<dyn ItemProcessor>,
        store: Arc<dyn ProgressStore>,
        stats: Arc<dyn StatsSource>,
    ) -> Self {
        Self {
            processor,
            store,
            stats,
            classifier: Arc::new(DefaultErrorClassifier),
            config: BatchConfig::default(),
            registry: CancellationRegistry::new(),
        }
    }

    /// Replace the engine defaults
    pub fn with_config(mut self, config: BatchConfig) -> Result<Self> {
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    /// Replace the error classifier
    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Engine defaults
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Registry of active runs, shared with anything that needs to cancel them
    pub fn registry(&self) -> &CancellationRegistry {
        &self.registry
    }

    /// Request cooperative cancellation of a running batch
    pub fn cancel_batch(&self, batch_id: &str) -> CancelOutcome {
        self.registry.cancel(batch_id)
    }

    /// Process every row of a batch
    ///
    /// Fails only on run-level preconditions; item failures are reported in
    /// the returned results.
    #[instrument(skip(self, request), fields(batch_id = ?request.batch_id, total = request.entries.len()))]
    pub async fn run_batch(&self, request: RunRequest) -> Result<BatchRunOutput> {
        let run_start = Instant::now();
        let RunRequest {
            entries,
            batch_id,
            concurrency,
            retries,
            stats_polling_interval,
            context,
            on_progress,
            on_status_update,
            abort_signal,
        } = request;

        let total = entries.len();
        if total == 0 {
            return Err(BatchError::EmptyBatch);
        }
        let batch_id = batch_id
            .filter(|id| !id.trim().is_empty())
            .ok_or(BatchError::MissingBatchId)?;

        let concurrency = concurrency.unwrap_or(self.config.concurrency).clamp(1, total);
        let retries = retries.unwrap_or(self.config.retries);
        let interval = stats_polling_interval.unwrap_or_else(|| self.config.stats_polling_interval());
        if interval.is_zero() {
            return Err(BatchError::Config(
                "stats polling interval must be greater than zero".to_string(),
            ));
        }

        let guard = self.registry.begin_run(&batch_id, abort_signal)?;
        info!(
            batch_id = %batch_id,
            total,
            concurrency,
            retries,
            poll_interval_ms = interval.as_millis() as u64,
            "Starting batch run"
        );

        let persister = ProgressPersister::spawn(Arc::clone(&self.store), batch_id.clone());
        let poller = StatsPoller::start(
            Arc::clone(&self.stats),
            batch_id.clone(),
            interval,
            on_status_update,
        );

        let state = RunState {
            batch_id: &batch_id,
            total,
            context: context.unwrap_or_else(|| RuntimeContext::for_batch(batch_id.clone())),
            retry: RetryController::with_classifier(
                RetryPolicy::from_config(&self.config).with_retries(retries),
                Arc::clone(&self.classifier),
            ),
            signal: guard.signal(),
            persister: &persister,
            on_progress,
            finished: AtomicUsize::new(0),
        };

        let pool = WorkerPool::new(concurrency);
        let results = pool
            .run(total, |index| self.process_item(index, &entries[index], &state))
            .await;
        drop(state);

        let polls = poller.stop().await;
        let persistence = persister
            .finish(self.config.persistence_drain_timeout())
            .await;
        drop(guard);

        let summary = RunSummary::from_results(&results);
        info!(
            batch_id = %batch_id,
            total = summary.total,
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped,
            persisted = persistence.written,
            persist_failures = persistence.failed,
            persist_abandoned = persistence.abandoned,
            polls,
            peak_in_flight = pool.metrics().peak_in_flight,
            duration_ms = run_start.elapsed().as_millis() as u64,
            "Batch run completed"
        );
        if persistence.failed > 0 || persistence.abandoned > 0 {
            warn!(
                batch_id = %batch_id,
                failed_writes = persistence.failed,
                abandoned_writes = persistence.abandoned,
                "Some item outcomes were not persisted; they will be re-processed on resume"
            );
        }

        Ok(BatchRunOutput {
            results,
            summary,
            persistence,
        })
    }

    #[instrument(level = "debug", skip(self, item, state), fields(batch_id = state.batch_id, row_index = item.row_index))]
    async fn process_item(&self, index: usize, item: &BatchItem, state: &RunState<'_>) -> WorkResult {
        let result = self.resolve_item(index, item, state).await;

        if let Some(update) = ItemUpdate::from_result(&result) {
            state.persister.record(update);
        }

        let completed = state.finished.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(callback) = &state.on_progress {
            callback(ProgressUpdate {
                completed,
                total: state.total,
                result: result.clone(),
            });
        }
        result
    }

    async fn resolve_item(&self, index: usize, item: &BatchItem, state: &RunState<'_>) -> WorkResult {
        let row_index = item.row_index;

        if state.signal.is_cancelled() {
            debug!(batch_id = state.batch_id, index, "Run cancelled, skipping item");
            return WorkResult::skipped(index, row_index, SkipReason::Aborted);
        }

        if let Some(chat_reference) = &item.chat_reference {
            debug!(batch_id = state.batch_id, index, row_index, "Item already processed");
            return WorkResult {
                index,
                row_index,
                attempts: 0,
                outcome: ItemOutcome::Skipped {
                    reason: SkipReason::AlreadyProcessed,
                    chat_reference: Some(chat_reference.clone()),
                    fallback_url: None,
                    message: None,
                },
            };
        }

        let Some(question) = extract_question(&item.original_data) else {
            warn!(batch_id = state.batch_id, index, row_index, "No question text found in row");
            return WorkResult::failed(index, row_index, 0, NO_QUESTION_MESSAGE);
        };

        let outcome = state
            .retry
            .attempt(index, || self.processor.process(question, &state.context))
            .await;

        WorkResult {
            index,
            row_index,
            attempts: outcome.attempts,
            outcome: outcome.outcome,
        }
    }
}
