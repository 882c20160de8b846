//! # Batch Engine
//!
//! Bounded-concurrency batch execution for question-answering pipelines.
//!
//! ## Overview
//!
//! A batch is a list of rows (typically a spreadsheet of questions). The engine
//! drives every row through an external [`batch::ItemProcessor`] with a fixed
//! number of workers, classifies processor failures, retries transient ones
//! with exponential backoff, honours cooperative cancellation, skips rows that
//! already succeeded in an earlier run and writes each outcome through to a
//! [`batch::ProgressStore`] without blocking the workers.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use batch_engine::batch::{
//!     AnswerResult, BatchEngine, BatchItem, ItemProcessor, MemoryProgressStore,
//!     ProcessorError, RunRequest, RuntimeContext,
//! };
//! use serde_json::json;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl ItemProcessor for Echo {
//!     async fn process(
//!         &self,
//!         question: &str,
//!         _ctx: &RuntimeContext,
//!     ) -> Result<AnswerResult, ProcessorError> {
//!         Ok(AnswerResult::new(format!("chat-{}", question.len()), json!(question)))
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let store = Arc::new(MemoryProgressStore::new());
//! let engine = BatchEngine::new(Arc::new(Echo), store.clone(), store);
//!
//! let entries = vec![BatchItem::from_json(0, json!({ "question": "How do I renew a passport?" }))];
//! let output = engine
//!     .run_batch(RunRequest::new("batch-1", entries).with_concurrency(2))
//!     .await?;
//! assert_eq!(output.summary.completed, 1);
//! # Ok::<(), batch_engine::BatchError>(())
//! # }).unwrap();
//! ```
//!
//! ## Modules
//!
//! - [`batch`]: worker pool, retry controller, cancellation, persistence and polling
//! - [`config`]: engine defaults and their validation
//! - [`logging`]: tracing subscriber setup

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use thiserror::Error;

/// Result type for batch engine operations
pub type Result<T> = std::result::Result<T, BatchError>;

/// Main error type for batch engine operations
///
/// Only run-level preconditions surface here. Per-item failures are contained
/// in [`batch::WorkResult`] and never abort a run.
#[derive(Error, Debug)]
pub enum BatchError {
    /// The run was started without any rows
    #[error("No entries provided")]
    EmptyBatch,

    /// The run was started without a persisted batch identifier
    #[error("Batch ID is required for processing")]
    MissingBatchId,

    /// Another run for the same batch identifier is still active
    #[error("Batch {0} is already running")]
    AlreadyRunning(String),

    /// Batch lifecycle status change that the lifecycle does not allow
    #[error("Invalid batch status transition: {from} -> {to}")]
    InvalidTransition {
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },

    /// Invalid engine configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Batch execution module
pub mod batch;

/// Engine configuration
pub mod config;

/// Structured logging setup
pub mod logging;

pub use config::BatchConfig;
