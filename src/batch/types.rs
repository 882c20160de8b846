//! Batch records, per-item outcomes and run results

use std::sync::Arc;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::persister::PersistenceReport;
use super::processor::RuntimeContext;
use super::stats::BatchStats;
use crate::{BatchError, Result};

/// Lifecycle status of a batch, mutated by the caller around a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    /// Rows stored, never run
    Uploaded,
    /// A run is in progress
    Processing,
    /// Last run finished
    Processed,
    /// Last run failed at run level
    Failed,
}

impl BatchStatus {
    /// Whether the lifecycle permits moving from `self` to `next`
    ///
    /// Finished batches may be re-run, which is how resumption is triggered.
    pub fn can_transition_to(self, next: BatchStatus) -> bool {
        use BatchStatus::*;
        matches!(
            (self, next),
            (Uploaded, Processing)
                | (Processing, Processed)
                | (Processing, Failed)
                | (Processed, Processing)
                | (Failed, Processing)
        )
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BatchStatus::Uploaded => "uploaded",
            BatchStatus::Processing => "processing",
            BatchStatus::Processed => "processed",
            BatchStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A named collection of rows processed under one policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    /// Persisted identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Model provider selector
    pub provider: Option<String>,
    /// Model selector within the provider
    pub model: Option<String>,
    /// Workflow variant selector
    pub workflow: Option<String>,
    /// Response language
    pub language: Option<String>,
    /// Search provider selector
    pub search_provider: Option<String>,
    /// Preferred worker count for runs of this batch
    pub concurrency: Option<usize>,
    /// Preferred retry budget for runs of this batch
    pub retries: Option<u32>,
    /// Lifecycle status
    pub status: BatchStatus,
    /// Upload time
    pub created_at: DateTime<Utc>,
}

impl Batch {
    /// Create an uploaded batch with a fresh identifier
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            provider: None,
            model: None,
            workflow: None,
            language: None,
            search_provider: None,
            concurrency: None,
            retries: None,
            status: BatchStatus::Uploaded,
            created_at: Utc::now(),
        }
    }

    /// Move to `next` if the lifecycle allows it
    pub fn transition(&mut self, next: BatchStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(BatchError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Settings forwarded to the processor for every row of this batch
    pub fn runtime_context(&self) -> RuntimeContext {
        RuntimeContext {
            batch_id: self.id.clone(),
            provider: self.provider.clone(),
            model: self.model.clone(),
            workflow: self.workflow.clone(),
            language: self.language.clone(),
            search_provider: self.search_provider.clone(),
        }
    }
}

/// One row of a batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItem {
    /// Stable position of the row within its batch
    pub row_index: usize,
    /// Source record, in its natural column order
    pub original_data: Map<String, Value>,
    /// Set once the row has been answered in any run
    pub chat_reference: Option<String>,
    /// Error recorded by a previous run
    pub error: Option<String>,
    /// Turned away as too short to answer
    #[serde(default)]
    pub short_query: bool,
    /// Blocked by content policy
    #[serde(default)]
    pub redacted: bool,
}

impl BatchItem {
    /// Create an unprocessed row
    pub fn new(row_index: usize, original_data: Map<String, Value>) -> Self {
        Self {
            row_index,
            original_data,
            ..Default::default()
        }
    }

    /// Create a row from a JSON object; anything else yields an empty record
    pub fn from_json(row_index: usize, value: Value) -> Self {
        let original_data = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::new(row_index, original_data)
    }

    /// Mark the row as answered by an earlier run
    pub fn with_chat_reference(mut self, chat_reference: impl Into<String>) -> Self {
        self.chat_reference = Some(chat_reference.into());
        self
    }
}

/// Why an item was skipped in this run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
    /// Already carries a chat reference from an earlier run
    AlreadyProcessed,
    /// Too short or ambiguous to answer without conversation context
    ShortQuery,
    /// The run was cancelled before the item was claimed
    Aborted,
}

/// Terminal outcome of one item in one run
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    /// The processor answered the question
    Completed {
        /// Chat the answer was recorded under
        chat_reference: String,
        /// Opaque answer payload
        answer: Value,
    },
    /// The item could not be answered
    Failed {
        /// Final failure message
        error: String,
        /// Input was blocked by content policy
        redacted: bool,
    },
    /// The item was not sent to the processor, or was turned away by it
    Skipped {
        /// Why the item was skipped
        reason: SkipReason,
        /// Reference from an earlier run, for already processed items
        chat_reference: Option<String>,
        /// Suggested place to send the user instead
        fallback_url: Option<String>,
        /// Processor's explanation, if it turned the item away
        message: Option<String>,
    },
}

/// Per-run, per-item outcome
///
/// Built once per item when the item reaches a terminal state, so a result is
/// never partially written.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(into = "WorkResultRecord")]
pub struct WorkResult {
    /// Position in the run's entry list
    pub index: usize,
    /// Row index of the underlying item
    pub row_index: usize,
    /// Processor invocations made for this item in this run
    pub attempts: u32,
    /// Terminal outcome
    pub outcome: ItemOutcome,
}

impl WorkResult {
    /// Result for a completed item
    pub fn completed(index: usize, row_index: usize, attempts: u32, chat_reference: String, answer: Value) -> Self {
        Self {
            index,
            row_index,
            attempts,
            outcome: ItemOutcome::Completed { chat_reference, answer },
        }
    }

    /// Result for a failed item
    pub fn failed(index: usize, row_index: usize, attempts: u32, error: impl Into<String>) -> Self {
        Self {
            index,
            row_index,
            attempts,
            outcome: ItemOutcome::Failed {
                error: error.into(),
                redacted: false,
            },
        }
    }

    /// Result for an item skipped for `reason`
    pub fn skipped(index: usize, row_index: usize, reason: SkipReason) -> Self {
        Self {
            index,
            row_index,
            attempts: 0,
            outcome: ItemOutcome::Skipped {
                reason,
                chat_reference: None,
                fallback_url: None,
                message: None,
            },
        }
    }

    /// Chat reference of a completed or already processed item
    pub fn chat_reference(&self) -> Option<&str> {
        match &self.outcome {
            ItemOutcome::Completed { chat_reference, .. } => Some(chat_reference),
            ItemOutcome::Skipped { chat_reference, .. } => chat_reference.as_deref(),
            ItemOutcome::Failed { .. } => None,
        }
    }

    /// Answer payload of a completed item
    pub fn answer(&self) -> Option<&Value> {
        match &self.outcome {
            ItemOutcome::Completed { answer, .. } => Some(answer),
            _ => None,
        }
    }

    /// Failure message, or the processor's note for a skipped item
    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            ItemOutcome::Failed { error, .. } => Some(error),
            ItemOutcome::Skipped { message, .. } => message.as_deref(),
            ItemOutcome::Completed { .. } => None,
        }
    }

    /// Reason the item was skipped
    pub fn skip_reason(&self) -> Option<SkipReason> {
        match &self.outcome {
            ItemOutcome::Skipped { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// The processor answered the item
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, ItemOutcome::Completed { .. })
    }

    /// The item failed
    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, ItemOutcome::Failed { .. })
    }

    /// The item was skipped
    pub fn is_skipped(&self) -> bool {
        matches!(self.outcome, ItemOutcome::Skipped { .. })
    }

    /// Skipped as too short to answer
    pub fn short_query(&self) -> bool {
        self.skip_reason() == Some(SkipReason::ShortQuery)
    }

    /// Failed on content policy
    pub fn redacted(&self) -> bool {
        matches!(self.outcome, ItemOutcome::Failed { redacted: true, .. })
    }
}

/// Flat wire shape of a [`WorkResult`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkResultRecord {
    /// Position in the run's entry list
    pub index: usize,
    /// Row index of the underlying item
    pub row_index: usize,
    /// Processor invocations made
    pub attempts: u32,
    /// Set for completed and already processed items
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_reference: Option<String>,
    /// Answer payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure message or skip note
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Present and `true` for skipped items
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<bool>,
    /// Why the item was skipped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<SkipReason>,
    /// Suggested place to send the user instead
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_url: Option<String>,
    /// Present and `true` for short queries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_query: Option<bool>,
    /// Present and `true` for content-policy failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redacted: Option<bool>,
}

impl From<WorkResult> for WorkResultRecord {
    fn from(result: WorkResult) -> Self {
        let short_query = result.short_query().then_some(true);
        let redacted = result.redacted().then_some(true);
        let mut record = WorkResultRecord {
            index: result.index,
            row_index: result.row_index,
            attempts: result.attempts,
            chat_reference: None,
            result: None,
            error: None,
            skipped: None,
            reason: None,
            fallback_url: None,
            short_query,
            redacted,
        };
        match result.outcome {
            ItemOutcome::Completed { chat_reference, answer } => {
                record.chat_reference = Some(chat_reference);
                record.result = Some(answer);
            }
            ItemOutcome::Failed { error, .. } => {
                record.error = Some(error);
            }
            ItemOutcome::Skipped { reason, chat_reference, fallback_url, message } => {
                record.skipped = Some(true);
                record.reason = Some(reason);
                record.chat_reference = chat_reference;
                record.fallback_url = fallback_url;
                record.error = message;
            }
        }
        record
    }
}

/// Aggregate counts for one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Items in the run
    pub total: usize,
    /// Items answered
    pub completed: usize,
    /// Items that failed
    pub failed: usize,
    /// Items skipped for any reason
    pub skipped: usize,
}

impl RunSummary {
    /// Reduce a run's results; every result lands in exactly one bucket
    pub fn from_results(results: &[WorkResult]) -> Self {
        results.iter().fold(
            Self {
                total: results.len(),
                ..Default::default()
            },
            |mut summary, result| {
                match result.outcome {
                    ItemOutcome::Completed { .. } => summary.completed += 1,
                    ItemOutcome::Failed { .. } => summary.failed += 1,
                    ItemOutcome::Skipped { .. } => summary.skipped += 1,
                }
                summary
            },
        )
    }
}

/// Progress notification emitted after each item finishes
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    /// Items finished so far in this run, in completion order
    pub completed: usize,
    /// Items in the run
    pub total: usize,
    /// Outcome of the item that just finished
    pub result: WorkResult,
}

/// Callback for per-item progress
pub type ProgressCallback = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Callback for aggregate stats polled during a run
pub type StatusCallback = Arc<dyn Fn(BatchStats) + Send + Sync>;

/// Everything a run produces
#[derive(Debug, Clone)]
pub struct BatchRunOutput {
    /// One result per entry, ordered by index
    pub results: Vec<WorkResult>,
    /// Counts per outcome
    pub summary: RunSummary,
    /// Outcome of the write-through to the progress store
    pub persistence: PersistenceReport,
}
