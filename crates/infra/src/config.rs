//! Engine configuration.
//!
//! Defaults work out of the box; every field can be overridden through a
//! `STOCKFLOW_*` environment variable.

use std::time::Duration;

use thiserror::Error;

use stockflow_purchasing::RestockPolicy;

/// Upper bound for audit page reads.
pub const MAX_AUDIT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}: cannot parse '{value}'")]
    Parse { key: &'static str, value: String },

    #[error("{key}: {reason}")]
    OutOfRange { key: &'static str, reason: String },
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Commit attempts per operation before `ConcurrencyExhausted`.
    pub max_commit_attempts: u32,
    /// Sleep between attempts, multiplied by the attempt number.
    pub retry_backoff: Duration,
    pub restock_policy: RestockPolicy,
    /// Audit entries fetched per store round trip.
    pub audit_page_size: usize,
    /// Evaluate restock right after each commit. When false, a `RestockWorker`
    /// is expected to react to `StockChanged` events instead.
    pub inline_restock: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_commit_attempts: 16,
            retry_backoff: Duration::from_millis(1),
            restock_policy: RestockPolicy::default(),
            audit_page_size: 256,
            inline_restock: true,
        }
    }
}

impl EngineConfig {
    pub fn with_max_commit_attempts(mut self, attempts: u32) -> Self {
        self.max_commit_attempts = attempts.max(1);
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_restock_policy(mut self, policy: RestockPolicy) -> Self {
        self.restock_policy = policy;
        self
    }

    pub fn with_audit_page_size(mut self, size: usize) -> Self {
        self.audit_page_size = size.clamp(1, MAX_AUDIT_PAGE_SIZE);
        self
    }

    pub fn with_inline_restock(mut self, inline: bool) -> Self {
        self.inline_restock = inline;
        self
    }

    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (unset keys keep their defaults).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let max_commit_attempts: u32 = parse(&lookup, "STOCKFLOW_MAX_COMMIT_ATTEMPTS")?
            .unwrap_or(defaults.max_commit_attempts);
        if max_commit_attempts == 0 {
            return Err(ConfigError::OutOfRange {
                key: "STOCKFLOW_MAX_COMMIT_ATTEMPTS",
                reason: "must be at least 1".to_string(),
            });
        }

        let retry_backoff = parse::<u64, _>(&lookup, "STOCKFLOW_RETRY_BACKOFF_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry_backoff);

        let multiplier = parse(&lookup, "STOCKFLOW_RESTOCK_MULTIPLIER")?
            .unwrap_or(defaults.restock_policy.multiplier);
        let minimum = parse(&lookup, "STOCKFLOW_RESTOCK_MINIMUM")?
            .unwrap_or(defaults.restock_policy.minimum_quantity);
        let restock_policy =
            RestockPolicy::new(multiplier, minimum).map_err(|e| ConfigError::OutOfRange {
                key: "STOCKFLOW_RESTOCK_MULTIPLIER/STOCKFLOW_RESTOCK_MINIMUM",
                reason: e.to_string(),
            })?;

        let audit_page_size: usize =
            parse(&lookup, "STOCKFLOW_AUDIT_PAGE_SIZE")?.unwrap_or(defaults.audit_page_size);
        if audit_page_size == 0 {
            return Err(ConfigError::OutOfRange {
                key: "STOCKFLOW_AUDIT_PAGE_SIZE",
                reason: "must be at least 1".to_string(),
            });
        }

        let inline_restock =
            parse(&lookup, "STOCKFLOW_INLINE_RESTOCK")?.unwrap_or(defaults.inline_restock);

        Ok(Self {
            max_commit_attempts,
            retry_backoff,
            restock_policy,
            audit_page_size: audit_page_size.min(MAX_AUDIT_PAGE_SIZE),
            inline_restock,
        })
    }
}

fn parse<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Parse { key, value: raw }),
    }
}
