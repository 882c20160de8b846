//! Item-level error classification and the bounded retry loop
//!
//! Processor failures are tagged with their kind where the processor knows
//! it. [`ProcessorError::Unclassified`] is left for an [`ErrorClassifier`] to
//! sort into transient or permanent.

use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::processor::AnswerResult;
use super::types::{ItemOutcome, SkipReason};
use crate::config::BatchConfig;

lazy_static! {
    static ref TRANSIENT_MESSAGE: Regex = Regex::new(
        r"(?i)\b(timeout|timed out|network|econnreset|econnrefused|etimedout|socket hang up|connection (reset|refused|closed)|rate[ -]?limit(ed)?|too many requests|service unavailable|bad gateway|gateway timeout|429|502|503|504)\b"
    )
    .expect("transient pattern is valid");
}

/// HTTP statuses that are safe to retry
pub const TRANSIENT_STATUSES: &[u16] = &[429, 502, 503, 504];

/// Failure reported by an [`super::ItemProcessor`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessorError {
    /// Input too short or ambiguous to answer without more context
    #[error("{message}")]
    Validation {
        /// Explanation suitable for the end user
        message: String,
        /// Suggested place to send the user instead
        fallback_url: Option<String>,
    },

    /// Input contains material that must not be forwarded
    #[error("{message}")]
    ContentPolicy {
        /// What was detected
        message: String,
    },

    /// Known to be safe to retry
    #[error("{message}")]
    Transient {
        /// Upstream failure description
        message: String,
    },

    /// Known not to succeed on retry
    #[error("{message}")]
    Permanent {
        /// Upstream failure description
        message: String,
    },

    /// Failure of unknown kind, optionally with an upstream HTTP status
    #[error("{message}")]
    Unclassified {
        /// Upstream failure description
        message: String,
        /// HTTP status of the failed upstream call
        status: Option<u16>,
    },
}

impl ProcessorError {
    /// Validation failure with a fallback suggestion
    pub fn validation(message: impl Into<String>, fallback_url: Option<String>) -> Self {
        Self::Validation {
            message: message.into(),
            fallback_url,
        }
    }

    /// Content-policy failure
    pub fn content_policy(message: impl Into<String>) -> Self {
        Self::ContentPolicy { message: message.into() }
    }

    /// Retry-safe failure
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient { message: message.into() }
    }

    /// Non-retryable failure
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent { message: message.into() }
    }

    /// Failure to be classified from its message
    pub fn other(message: impl Into<String>) -> Self {
        Self::Unclassified {
            message: message.into(),
            status: None,
        }
    }

    /// Failure to be classified from an HTTP status and message
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Unclassified {
            message: message.into(),
            status: Some(status),
        }
    }
}

/// How the retry controller treats a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Skip the item, never retry
    Validation,
    /// Fail the item with the redacted flag, never retry
    ContentPolicy,
    /// Retry with backoff while attempts remain
    Transient,
    /// Fail the item, never retry
    Permanent,
}

/// Context information for error classification
#[derive(Debug, Clone)]
pub struct ErrorContext {
    /// Position of the item in the run
    pub index: usize,
    /// Zero-based attempt that produced the error
    pub attempt_number: u32,
    /// Total attempts the policy allows
    pub max_attempts: u32,
}

/// Error classification interface
pub trait ErrorClassifier: Send + Sync + Debug {
    /// Decide how the retry loop treats `error`
    fn classify_error(&self, error: &ProcessorError, context: &ErrorContext) -> ErrorKind;
}

/// Honours explicit tags; classifies the rest by status code and message
#[derive(Debug, Default)]
pub struct DefaultErrorClassifier;

impl ErrorClassifier for DefaultErrorClassifier {
    fn classify_error(&self, error: &ProcessorError, _context: &ErrorContext) -> ErrorKind {
        match error {
            ProcessorError::Validation { .. } => ErrorKind::Validation,
            ProcessorError::ContentPolicy { .. } => ErrorKind::ContentPolicy,
            ProcessorError::Transient { .. } => ErrorKind::Transient,
            ProcessorError::Permanent { .. } => ErrorKind::Permanent,
            ProcessorError::Unclassified { message, status } => {
                let transient_status = status.map_or(false, |s| TRANSIENT_STATUSES.contains(&s));
                if transient_status || TRANSIENT_MESSAGE.is_match(message) {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Permanent
                }
            }
        }
    }
}

/// Retry budget and backoff schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first
    pub retries: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Optional cap on a single delay
    pub max_delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&BatchConfig::default())
    }
}

impl RetryPolicy {
    /// Policy from engine defaults
    pub fn from_config(config: &BatchConfig) -> Self {
        Self {
            retries: config.retries,
            base_delay: config.backoff_base(),
            max_delay: config.max_backoff(),
        }
    }

    /// Override the retry budget
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Total attempts the policy allows
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Delay after zero-based `attempt` failed: `base * 2^attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}

/// Terminal outcome of the retry loop for one item
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptOutcome {
    /// Processor invocations made
    pub attempts: u32,
    /// Where the item ended up
    pub outcome: ItemOutcome,
}

/// Wraps one item's processing in a bounded retry loop
#[derive(Debug, Clone)]
pub struct RetryController {
    policy: RetryPolicy,
    classifier: Arc<dyn ErrorClassifier>,
}

impl RetryController {
    /// Controller using [`DefaultErrorClassifier`]
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_classifier(policy, Arc::new(DefaultErrorClassifier))
    }

    /// Controller with a custom classifier
    pub fn with_classifier(policy: RetryPolicy, classifier: Arc<dyn ErrorClassifier>) -> Self {
        Self { policy, classifier }
    }

    /// Retry budget and backoff in use
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `call` until it succeeds, fails terminally or exhausts the budget
    pub async fn attempt<F, Fut>(&self, index: usize, mut call: F) -> AttemptOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<AnswerResult, ProcessorError>>,
    {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 0u32;

        loop {
            let error = match call().await {
                Ok(answer) => {
                    debug!(index, attempt, "Item answered");
                    return AttemptOutcome {
                        attempts: attempt + 1,
                        outcome: ItemOutcome::Completed {
                            chat_reference: answer.chat_reference,
                            answer: answer.answer,
                        },
                    };
                }
                Err(error) => error,
            };

            let context = ErrorContext {
                index,
                attempt_number: attempt,
                max_attempts,
            };
            let kind = self.classifier.classify_error(&error, &context);

            let outcome = match (kind, error) {
                (ErrorKind::Validation, ProcessorError::Validation { message, fallback_url }) => {
                    ItemOutcome::Skipped {
                        reason: SkipReason::ShortQuery,
                        chat_reference: None,
                        fallback_url,
                        message: Some(message),
                    }
                }
                (ErrorKind::Validation, error) => ItemOutcome::Skipped {
                    reason: SkipReason::ShortQuery,
                    chat_reference: None,
                    fallback_url: None,
                    message: Some(error.to_string()),
                },
                (ErrorKind::ContentPolicy, error) => ItemOutcome::Failed {
                    error: error.to_string(),
                    redacted: true,
                },
                (ErrorKind::Transient, error) if attempt < self.policy.retries => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        index,
                        attempt = attempt + 1,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                (_, error) => {
                    warn!(index, attempts = attempt + 1, kind = ?kind, error = %error, "Item failed");
                    ItemOutcome::Failed {
                        error: error.to_string(),
                        redacted: false,
                    }
                }
            };

            return AttemptOutcome {
                attempts: attempt + 1,
                outcome,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn classify(error: ProcessorError) -> ErrorKind {
        let context = ErrorContext {
            index: 0,
            attempt_number: 0,
            max_attempts: 3,
        };
        DefaultErrorClassifier.classify_error(&error, &context)
    }

    #[test]
    fn test_tagged_errors_keep_their_kind() {
        assert_eq!(classify(ProcessorError::validation("too short", None)), ErrorKind::Validation);
        assert_eq!(classify(ProcessorError::content_policy("pii")), ErrorKind::ContentPolicy);
        // a tag wins over message heuristics
        assert_eq!(classify(ProcessorError::permanent("network timeout")), ErrorKind::Permanent);
        assert_eq!(classify(ProcessorError::transient("odd")), ErrorKind::Transient);
    }

    #[test]
    fn test_unclassified_transient_patterns() {
        for message in [
            "network timeout",
            "Request timed out",
            "503 Service Unavailable",
            "upstream returned 502",
            "Rate limit exceeded",
            "rate-limited by provider",
            "Too Many Requests",
            "ECONNRESET",
            "connection reset by peer",
        ] {
            assert_eq!(classify(ProcessorError::other(message)), ErrorKind::Transient, "{}", message);
        }
    }

    #[test]
    fn test_unclassified_status_codes() {
        assert_eq!(classify(ProcessorError::http(429, "slow down")), ErrorKind::Transient);
        assert_eq!(classify(ProcessorError::http(504, "upstream")), ErrorKind::Transient);
        assert_eq!(classify(ProcessorError::http(400, "bad request")), ErrorKind::Permanent);
        assert_eq!(classify(ProcessorError::http(500, "internal")), ErrorKind::Permanent);
    }

    #[test]
    fn test_unclassified_permanent() {
        assert_eq!(classify(ProcessorError::other("invalid model name")), ErrorKind::Permanent);
        // status digits inside longer numbers do not count
        assert_eq!(classify(ProcessorError::other("order 15030 rejected")), ErrorKind::Permanent);
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
    }

    #[test]
    fn test_backoff_cap() {
        let policy = RetryPolicy {
            retries: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Some(Duration::from_secs(3)),
        };
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(3));
        assert_eq!(policy.delay_for(40), Duration::from_secs(3));
    }

    proptest! {
        #[test]
        fn uncapped_backoff_never_shrinks(attempt in 0u32..64) {
            let policy = RetryPolicy::default();
            prop_assert!(policy.delay_for(attempt + 1) >= policy.delay_for(attempt));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_exhausts_budget() {
        let controller = RetryController::new(RetryPolicy::default().with_retries(2));
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();

        let outcome = controller
            .attempt(0, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProcessorError::other("503 Service Unavailable")) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.attempts, 3);
        // 500ms + 1000ms between the three attempts
        assert_eq!(start.elapsed(), Duration::from_millis(1500));
        assert_eq!(
            outcome.outcome,
            ItemOutcome::Failed {
                error: "503 Service Unavailable".to_string(),
                redacted: false
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient() {
        let controller = RetryController::new(RetryPolicy::default().with_retries(1));
        let calls = AtomicU32::new(0);

        let outcome = controller
            .attempt(2, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(ProcessorError::other("network timeout"))
                    } else {
                        Ok(AnswerResult::new("chat-c", json!("ok")))
                    }
                }
            })
            .await;

        assert_eq!(outcome.attempts, 2);
        assert!(matches!(outcome.outcome, ItemOutcome::Completed { ref chat_reference, .. } if chat_reference == "chat-c"));
    }

    #[tokio::test]
    async fn test_validation_is_never_retried() {
        let controller = RetryController::new(RetryPolicy::default());
        let calls = AtomicU32::new(0);

        let outcome = controller
            .attempt(0, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(ProcessorError::validation(
                        "Question too short",
                        Some("https://www.canada.ca/en/contact.html".to_string()),
                    ))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match outcome.outcome {
            ItemOutcome::Skipped { reason, fallback_url, .. } => {
                assert_eq!(reason, SkipReason::ShortQuery);
                assert_eq!(fallback_url.as_deref(), Some("https://www.canada.ca/en/contact.html"));
            }
            other => panic!("expected skip, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_content_policy_is_never_retried() {
        let controller = RetryController::new(RetryPolicy::default());
        let calls = AtomicU32::new(0);

        let outcome = controller
            .attempt(0, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProcessorError::content_policy("Personal information detected")) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            outcome.outcome,
            ItemOutcome::Failed {
                error: "Personal information detected".to_string(),
                redacted: true
            }
        );
    }

    #[tokio::test]
    async fn test_permanent_fails_immediately() {
        let controller = RetryController::new(RetryPolicy::default());
        let calls = AtomicU32::new(0);

        let outcome = controller
            .attempt(0, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProcessorError::other("invalid model name")) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.attempts, 1);
    }

    #[derive(Debug)]
    struct AlwaysValidation;

    impl ErrorClassifier for AlwaysValidation {
        fn classify_error(&self, _error: &ProcessorError, _context: &ErrorContext) -> ErrorKind {
            ErrorKind::Validation
        }
    }

    #[tokio::test]
    async fn test_custom_classifier() {
        let controller =
            RetryController::with_classifier(RetryPolicy::default(), Arc::new(AlwaysValidation));

        let outcome = controller
            .attempt(0, || async { Err(ProcessorError::other("needs context")) })
            .await;

        assert_eq!(outcome.attempts, 1);
        match outcome.outcome {
            ItemOutcome::Skipped { reason, message, .. } => {
                assert_eq!(reason, SkipReason::ShortQuery);
                assert_eq!(message.as_deref(), Some("needs context"));
            }
            other => panic!("expected skip, got {:?}", other),
        }
    }
}
