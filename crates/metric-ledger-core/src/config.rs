//! Ledger configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::LedgerError;

/// Default number of attempts per subscription charge.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Default delay before the first retry.
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 5;

/// Default cap on the retry delay.
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 1000;

/// How balance writes detect concurrent modification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// Version compare-and-swap on every balance write.
    #[default]
    Optimistic,

    /// No conflict detection: the write overwrites whatever is stored.
    ///
    /// Reproduces the lost-update anomaly. Only meant for the concurrency
    /// harness' negative control.
    Unchecked,
}

impl IsolationMode {
    /// Whether writes in this mode detect conflicts.
    #[must_use]
    pub const fn detects_conflicts(self) -> bool {
        matches!(self, Self::Optimistic)
    }

    /// Mode name as used in configuration.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Optimistic => "optimistic",
            Self::Unchecked => "unchecked",
        }
    }
}

impl fmt::Display for IsolationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IsolationMode {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "optimistic" | "serializable" => Ok(Self::Optimistic),
            "unchecked" | "read_committed" | "autocommit" => Ok(Self::Unchecked),
            other => Err(LedgerError::Configuration(format!(
                "unknown isolation mode: {other}"
            ))),
        }
    }
}

/// Settings for the ledger update path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Conflict detection for balance writes.
    pub isolation_mode: IsolationMode,

    /// Attempts per subscription charge before giving up (at least 1).
    pub max_attempts: u32,

    /// Delay before the first retry; conflicts jitter around it, store
    /// failures double it per attempt.
    pub retry_backoff: Duration,

    /// Upper bound for any retry delay.
    pub max_backoff: Duration,

    /// Sleep inserted between reading a balance and writing it back.
    pub artificial_delay: Option<Duration>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            isolation_mode: IsolationMode::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
            artificial_delay: None,
        }
    }
}

impl LedgerConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the isolation mode.
    #[must_use]
    pub fn with_isolation_mode(mut self, mode: IsolationMode) -> Self {
        self.isolation_mode = mode;
        self
    }

    /// Set the maximum number of attempts (clamped to at least 1).
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the initial retry backoff.
    #[must_use]
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Set the retry backoff cap.
    #[must_use]
    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Set the artificial read-to-write delay.
    #[must_use]
    pub fn with_artificial_delay(mut self, delay: Option<Duration>) -> Self {
        self.artificial_delay = delay.filter(|d| !d.is_zero());
        self
    }

    /// Check the configuration for values the retry policy cannot use.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Configuration` if `max_attempts` is zero or the
    /// backoff cap is below the initial backoff.
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_attempts == 0 {
            return Err(LedgerError::Configuration(
                "max_attempts must be at least 1".into(),
            ));
        }
        if self.max_backoff < self.retry_backoff {
            return Err(LedgerError::Configuration(format!(
                "max_backoff ({:?}) is below retry_backoff ({:?})",
                self.max_backoff, self.retry_backoff
            )));
        }
        Ok(())
    }
}
