//! Per-batch cancellation signals
//!
//! The registry is owned by a [`super::BatchEngine`] rather than held in a
//! process-wide static. Each active run holds a [`RunGuard`]; dropping the
//! guard removes the entry, whether the run returned normally, failed or
//! unwound.

use std::sync::Arc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{BatchError, Result};

/// Result of a cancellation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOutcome {
    /// A registry-owned signal was fired by this request
    pub cancelled: bool,
}

#[derive(Debug)]
struct RunEntry {
    run_id: Uuid,
    /// Registry-owned signal; `None` when the caller supplied its own or it already fired
    token: Option<CancellationToken>,
}

/// Maps active batch identifiers to their cancellation signals
#[derive(Debug, Clone, Default)]
pub struct CancellationRegistry {
    entries: Arc<DashMap<String, RunEntry>>,
}

impl CancellationRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run and create a signal for it
    pub fn register(&self, batch_id: &str) -> Result<RunGuard> {
        self.begin_run(batch_id, None)
    }

    /// Register a run, using `external` as its signal when supplied
    ///
    /// A caller-supplied signal bypasses the registry: [`Self::cancel`] will
    /// not reach it. The batch is still marked active so a second concurrent
    /// run for the same identifier is rejected.
    pub fn begin_run(&self, batch_id: &str, external: Option<CancellationToken>) -> Result<RunGuard> {
        let run_id = Uuid::new_v4();
        let (signal, owned) = match external {
            Some(token) => (token, None),
            None => {
                let token = CancellationToken::new();
                (token.clone(), Some(token))
            }
        };

        match self.entries.entry(batch_id.to_string()) {
            Entry::Occupied(_) => return Err(BatchError::AlreadyRunning(batch_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(RunEntry { run_id, token: owned });
            }
        }
        debug!(batch_id, %run_id, "Registered batch run");

        Ok(RunGuard {
            entries: Arc::clone(&self.entries),
            batch_id: batch_id.to_string(),
            run_id,
            signal,
        })
    }

    /// Fire the signal registered for `batch_id`
    ///
    /// Unknown, finished, externally-signalled or already-cancelled batches
    /// return `cancelled: false`.
    pub fn cancel(&self, batch_id: &str) -> CancelOutcome {
        let token = self
            .entries
            .get_mut(batch_id)
            .and_then(|mut entry| entry.token.take());

        match token {
            Some(token) => {
                token.cancel();
                info!(batch_id, "Batch cancellation requested");
                CancelOutcome { cancelled: true }
            }
            None => CancelOutcome { cancelled: false },
        }
    }

    /// Whether a run for `batch_id` is active
    pub fn is_running(&self, batch_id: &str) -> bool {
        self.entries.contains_key(batch_id)
    }

    /// Number of active runs
    pub fn active_runs(&self) -> usize {
        self.entries.len()
    }
}

/// Registration of one active run
#[derive(Debug)]
pub struct RunGuard {
    entries: Arc<DashMap<String, RunEntry>>,
    batch_id: String,
    run_id: Uuid,
    signal: CancellationToken,
}

impl RunGuard {
    /// Signal the workers observe
    pub fn signal(&self) -> CancellationToken {
        self.signal.clone()
    }

    /// Batch this run belongs to
    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let run_id = self.run_id;
        self.entries
            .remove_if(&self.batch_id, |_, entry| entry.run_id == run_id);
        debug!(batch_id = %self.batch_id, %run_id, "Released batch run");
    }
}
