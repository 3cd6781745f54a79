//! Error types for the metric ledger.

use crate::SubscriptionId;

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Terminal errors of the ledger update path.
///
/// Transient conditions (write conflicts, a briefly unavailable store) are
/// absorbed by the retry policy; what reaches callers is one of these.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// The metric or subscription does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of entity that was looked up.
        entity: &'static str,
        /// The identifier that was not found.
        id: String,
    },

    /// Every attempt lost the race for the subscription's balance.
    #[error("conflict retries exhausted for subscription {subscription_id} after {attempts} attempts")]
    ConflictExhausted {
        /// Contended subscription.
        subscription_id: SubscriptionId,
        /// Attempts made.
        attempts: u32,
    },

    /// The store kept failing after the retry ceiling.
    #[error("store unavailable after {attempts} attempts: {message}")]
    StoreUnavailable {
        /// Attempts made.
        attempts: u32,
        /// Last store error.
        message: String,
    },

    /// Applying the charge would overflow the balance.
    #[error("balance overflow for subscription {subscription_id}: {total_cents} + {amount_cents}")]
    BalanceOverflow {
        /// Affected subscription.
        subscription_id: SubscriptionId,
        /// Balance read before the charge.
        total_cents: i64,
        /// Charge amount.
        amount_cents: i64,
    },

    /// Non-retryable storage failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl LedgerError {
    /// Whether this error means the entity was missing.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
