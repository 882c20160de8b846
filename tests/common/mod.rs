//! Shared test utilities for batch engine tests
//!
//! - `ScriptedProcessor`: answers every question, optionally failing first
//!   with queued errors, and records call times and peak concurrency
//! - row and engine factories

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use batch_engine::batch::{
    AnswerResult, BatchEngine, BatchItem, ItemProcessor, MemoryProgressStore, ProcessorError,
    RuntimeContext,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::time::Instant;

/// Processor driven by a per-question script of failures
pub struct ScriptedProcessor {
    delay: Duration,
    failures: Mutex<HashMap<String, VecDeque<ProcessorError>>>,
    calls: Mutex<HashMap<String, Vec<Instant>>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedProcessor {
    /// Processor that takes `delay` per call
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Fail the next calls for `question` with `errors`, in order
    pub fn fail_with(self, question: &str, errors: Vec<ProcessorError>) -> Self {
        self.failures
            .lock()
            .insert(question.to_string(), errors.into_iter().collect());
        self
    }

    /// Fail every call for `question` (up to 100) with `error`
    pub fn always_fail(self, question: &str, error: ProcessorError) -> Self {
        self.fail_with(question, vec![error; 100])
    }

    pub fn calls_for(&self, question: &str) -> usize {
        self.calls.lock().get(question).map_or(0, Vec::len)
    }

    pub fn call_times(&self, question: &str) -> Vec<Instant> {
        self.calls.lock().get(question).cloned().unwrap_or_default()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().map(Vec::len).sum()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ItemProcessor for ScriptedProcessor {
    async fn process(
        &self,
        question: &str,
        _context: &RuntimeContext,
    ) -> Result<AnswerResult, ProcessorError> {
        self.calls
            .lock()
            .entry(question.to_string())
            .or_default()
            .push(Instant::now());

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let failure = self
            .failures
            .lock()
            .get_mut(question)
            .and_then(VecDeque::pop_front);
        match failure {
            Some(error) => Err(error),
            None => Ok(AnswerResult::new(
                format!("chat-{}", question),
                json!({ "answer": format!("answer to {}", question) }),
            )),
        }
    }
}

/// Row whose question column holds `question`
pub fn row(row_index: usize, question: &str) -> BatchItem {
    BatchItem::from_json(
        row_index,
        json!({ "id": format!("Q-{}", row_index), "question": question }),
    )
}

/// Rows `0..names.len()` with the given questions
pub fn rows(questions: &[&str]) -> Vec<BatchItem> {
    questions
        .iter()
        .enumerate()
        .map(|(i, q)| row(i, q))
        .collect()
}

/// Engine over `processor` backed by a fresh in-memory store
pub fn engine_with(processor: Arc<ScriptedProcessor>) -> (BatchEngine, Arc<MemoryProgressStore>) {
    let store = Arc::new(MemoryProgressStore::new());
    let engine = BatchEngine::new(processor, store.clone(), store.clone());
    (engine, store)
}
