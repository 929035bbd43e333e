//! Optimistic commit retry.

use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;

/// How often a read-decide-commit cycle is retried after a version conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for CommitPolicy {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for CommitPolicy {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.max_commit_attempts.max(1),
            backoff: config.retry_backoff,
        }
    }
}

impl CommitPolicy {
    /// Run `attempt` until it succeeds, fails with anything other than a store
    /// conflict, or runs out of attempts.
    ///
    /// Each attempt must reload what it reads: a conflict means its snapshot
    /// is stale.
    pub fn run<T, F>(&self, operation: &'static str, mut attempt: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Result<T, EngineError>,
    {
        for n in 1..=self.max_attempts {
            match attempt() {
                Err(err) if err.is_conflict() => {
                    debug!(operation, attempt = n, error = %err, "commit conflict; retrying");
                    if n < self.max_attempts && !self.backoff.is_zero() {
                        thread::sleep(self.backoff * n);
                    }
                }
                other => return other,
            }
        }

        warn!(
            operation,
            attempts = self.max_attempts,
            "commit attempts exhausted"
        );
        Err(EngineError::ConcurrencyExhausted {
            operation,
            attempts: self.max_attempts,
        })
    }
}
