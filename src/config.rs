//! Engine defaults
//!
//! [`BatchConfig`] holds the concurrency, retry, backoff and polling defaults
//! used when a [`crate::batch::RunRequest`] does not override them. It can be
//! built in code or deserialized from JSON; missing fields fall back to the
//! defaults.

use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::{BatchError, Result};

/// Default number of concurrent workers
pub const DEFAULT_CONCURRENCY: usize = 4;
/// Default number of retries after the first attempt
pub const DEFAULT_RETRIES: u32 = 2;
/// Default interval between stats polls
pub const DEFAULT_STATS_POLLING_INTERVAL_MS: u64 = 5000;
/// Default base delay for exponential backoff
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 500;
/// Default bound on draining queued progress writes after the workers join
pub const DEFAULT_PERSISTENCE_DRAIN_TIMEOUT_MS: u64 = 30_000;

/// Batch execution configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BatchConfig {
    /// Number of workers pulling from the shared cursor
    pub concurrency: usize,
    /// Additional attempts beyond the first for transient failures
    pub retries: u32,
    /// Interval between aggregate stats polls
    pub stats_polling_interval_ms: u64,
    /// Base delay; attempt `n` waits `base * 2^n`
    pub backoff_base_ms: u64,
    /// Optional upper bound on a single backoff delay
    pub max_backoff_ms: Option<u64>,
    /// How long a run waits for queued progress writes before returning
    pub persistence_drain_timeout_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retries: DEFAULT_RETRIES,
            stats_polling_interval_ms: DEFAULT_STATS_POLLING_INTERVAL_MS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            max_backoff_ms: None,
            persistence_drain_timeout_ms: DEFAULT_PERSISTENCE_DRAIN_TIMEOUT_MS,
        }
    }
}

impl BatchConfig {
    /// Create a configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a JSON configuration document
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the worker count
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the retry budget
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Set the stats polling interval
    pub fn with_stats_polling_interval(mut self, interval: Duration) -> Self {
        self.stats_polling_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the backoff base delay
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base_ms = base.as_millis() as u64;
        self
    }

    /// Cap individual backoff delays
    pub fn with_max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff_ms = Some(max.as_millis() as u64);
        self
    }

    /// Bound the wait for queued progress writes at the end of a run
    pub fn with_persistence_drain_timeout(mut self, timeout: Duration) -> Self {
        self.persistence_drain_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Stats polling interval as a [`Duration`]
    pub fn stats_polling_interval(&self) -> Duration {
        Duration::from_millis(self.stats_polling_interval_ms)
    }

    /// Backoff base delay as a [`Duration`]
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    /// Backoff cap as a [`Duration`], if any
    pub fn max_backoff(&self) -> Option<Duration> {
        self.max_backoff_ms.map(Duration::from_millis)
    }

    /// Progress drain bound as a [`Duration`]
    pub fn persistence_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.persistence_drain_timeout_ms)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(BatchError::Config("concurrency must be at least 1".to_string()));
        }
        if self.stats_polling_interval_ms == 0 {
            return Err(BatchError::Config(
                "statsPollingIntervalMs must be greater than zero".to_string(),
            ));
        }
        if self.backoff_base_ms == 0 {
            return Err(BatchError::Config("backoffBaseMs must be greater than zero".to_string()));
        }
        if self.persistence_drain_timeout_ms == 0 {
            return Err(BatchError::Config(
                "persistenceDrainTimeoutMs must be greater than zero".to_string(),
            ));
        }
        if let Some(max) = self.max_backoff_ms {
            if max < self.backoff_base_ms {
                return Err(BatchError::Config(format!(
                    "maxBackoffMs ({}) is smaller than backoffBaseMs ({})",
                    max, self.backoff_base_ms
                )));
            }
        }
        Ok(())
    }
}
