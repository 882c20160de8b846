//! Retry and error classification through the full engine

mod common;

use std::sync::Arc;
use std::time::Duration;

use batch_engine::batch::{
    ErrorClassifier, ErrorContext, ErrorKind, ItemOutcome, ProcessorError, RunRequest,
    RunSummary, SkipReason,
};
use common::{engine_with, rows, ScriptedProcessor};
use pretty_assertions::assert_eq;

#[tokio::test(start_paused = true)]
async fn test_transient_retried_with_exponential_backoff() {
    let processor = Arc::new(
        ScriptedProcessor::new(Duration::ZERO)
            .always_fail("flaky", ProcessorError::other("503 Service Unavailable")),
    );
    let (engine, store) = engine_with(processor.clone());

    let output = engine
        .run_batch(RunRequest::new("batch-backoff", rows(&["flaky"])).with_retries(3))
        .await
        .unwrap();

    let times = processor.call_times("flaky");
    assert_eq!(times.len(), 4);
    let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(
        gaps,
        vec![
            Duration::from_millis(500),
            Duration::from_millis(1000),
            Duration::from_millis(2000)
        ]
    );

    let result = &output.results[0];
    assert_eq!(result.attempts, 4);
    assert_eq!(result.error(), Some("503 Service Unavailable"));
    assert_eq!(output.summary, RunSummary { total: 1, completed: 0, failed: 1, skipped: 0 });
    assert_eq!(
        store.item("batch-backoff", 0).unwrap().error.as_deref(),
        Some("503 Service Unavailable")
    );
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_status_is_transient() {
    let processor = Arc::new(ScriptedProcessor::new(Duration::ZERO).fail_with(
        "busy",
        vec![
            ProcessorError::http(429, "slow down"),
            ProcessorError::http(502, "bad gateway"),
        ],
    ));
    let (engine, _store) = engine_with(processor.clone());

    let output = engine
        .run_batch(RunRequest::new("batch-429", rows(&["busy"])).with_retries(2))
        .await
        .unwrap();

    assert!(output.results[0].is_completed());
    assert_eq!(processor.calls_for("busy"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_zero_retries_means_single_attempt() {
    let processor = Arc::new(
        ScriptedProcessor::new(Duration::ZERO)
            .fail_with("once", vec![ProcessorError::other("network timeout")]),
    );
    let (engine, _store) = engine_with(processor.clone());

    let output = engine
        .run_batch(RunRequest::new("batch-no-retry", rows(&["once"])).with_retries(0))
        .await
        .unwrap();

    assert_eq!(processor.calls_for("once"), 1);
    assert!(output.results[0].is_failed());
}

#[tokio::test(start_paused = true)]
async fn test_permanent_failure_not_retried() {
    let processor = Arc::new(
        ScriptedProcessor::new(Duration::ZERO)
            .always_fail("bad", ProcessorError::other("invalid request body")),
    );
    let (engine, _store) = engine_with(processor.clone());

    let output = engine
        .run_batch(RunRequest::new("batch-permanent", rows(&["bad", "good"])).with_retries(5))
        .await
        .unwrap();

    assert_eq!(processor.calls_for("bad"), 1);
    assert_eq!(output.summary, RunSummary { total: 2, completed: 1, failed: 1, skipped: 0 });
}

#[tokio::test(start_paused = true)]
async fn test_validation_failure_skips_with_fallback() {
    let processor = Arc::new(ScriptedProcessor::new(Duration::ZERO).always_fail(
        "passport?",
        ProcessorError::validation(
            "Question too short to answer without context",
            Some("https://www.canada.ca/en/immigration-refugees-citizenship/services/canadian-passports.html".to_string()),
        ),
    ));
    let (engine, store) = engine_with(processor.clone());

    let output = engine
        .run_batch(RunRequest::new("batch-short", rows(&["passport?"])).with_retries(3))
        .await
        .unwrap();

    assert_eq!(processor.calls_for("passport?"), 1);
    let result = &output.results[0];
    assert!(result.is_skipped());
    assert!(result.short_query());
    assert!(!result.redacted());
    match &result.outcome {
        ItemOutcome::Skipped { reason, fallback_url, .. } => {
            assert_eq!(*reason, SkipReason::ShortQuery);
            assert!(fallback_url.as_deref().unwrap().ends_with("canadian-passports.html"));
        }
        other => panic!("expected skip, got {:?}", other),
    }
    assert_eq!(output.summary.skipped, 1);

    let stored = store.item("batch-short", 0).unwrap();
    assert!(stored.short_query);
    assert!(stored.chat_reference.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_content_policy_failure_flags_redacted() {
    let processor = Arc::new(ScriptedProcessor::new(Duration::ZERO).always_fail(
        "my SIN is 123 456 789",
        ProcessorError::content_policy("Personal information detected"),
    ));
    let (engine, store) = engine_with(processor.clone());

    let output = engine
        .run_batch(
            RunRequest::new("batch-pii", rows(&["my SIN is 123 456 789"])).with_retries(3),
        )
        .await
        .unwrap();

    assert_eq!(processor.calls_for("my SIN is 123 456 789"), 1);
    let result = &output.results[0];
    assert!(result.is_failed());
    assert!(result.redacted());
    assert_eq!(output.summary.failed, 1);
    assert!(store.item("batch-pii", 0).unwrap().redacted);
}

/// Treats everything mentioning "retry" as transient
#[derive(Debug)]
struct KeywordClassifier;

impl ErrorClassifier for KeywordClassifier {
    fn classify_error(&self, error: &ProcessorError, _context: &ErrorContext) -> ErrorKind {
        if error.to_string().contains("retry") {
            ErrorKind::Transient
        } else {
            ErrorKind::Permanent
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_custom_classifier_is_used() {
    let processor = Arc::new(
        ScriptedProcessor::new(Duration::ZERO)
            .fail_with("q", vec![ProcessorError::permanent("please retry")]),
    );
    let (engine, _store) = engine_with(processor.clone());
    let engine = engine.with_classifier(Arc::new(KeywordClassifier));

    let output = engine
        .run_batch(RunRequest::new("batch-custom", rows(&["q"])).with_retries(1))
        .await
        .unwrap();

    assert_eq!(processor.calls_for("q"), 2);
    assert!(output.results[0].is_completed());
}
