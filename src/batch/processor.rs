//! Contract for the external per-item answer pipeline

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error_handling::ProcessorError;

/// Batch-level settings handed to the processor with every question
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeContext {
    /// Batch the item belongs to
    pub batch_id: String,
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
}

impl RuntimeContext {
    /// Context carrying only a batch identifier
    pub fn for_batch(batch_id: impl Into<String>) -> Self {
        Self {
            batch_id: batch_id.into(),
            ..Default::default()
        }
    }
}

/// Successful answer for one item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerResult {
    /// Reference to the chat the answer was recorded under; marks the row as done
    pub chat_reference: String,
    /// Opaque answer payload
    pub answer: Value,
}

impl AnswerResult {
    /// Create an answer result
    pub fn new(chat_reference: impl Into<String>, answer: Value) -> Self {
        Self {
            chat_reference: chat_reference.into(),
            answer,
        }
    }
}

/// The answer-generation pipeline, reached through one call per attempt
///
/// Implementations report failures through [`ProcessorError`]; the variant
/// decides whether the engine skips, flags or retries the item.
#[async_trait]
pub trait ItemProcessor: Send + Sync {
    /// Answer a single question
    async fn process(
        &self,
        question: &str,
        context: &RuntimeContext,
    ) -> Result<AnswerResult, ProcessorError>;
}
