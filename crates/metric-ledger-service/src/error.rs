//! Service error types.

use metric_ledger_core::LedgerError;
use metric_ledger_store::StoreError;

/// Result type for service operations.
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Errors raised by the harness, the load test and the binary.
///
/// The ingestion path itself reports [`LedgerError`]; this type wraps it for
/// the outer layers that also have to deal with configuration and tasks.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// A ledger operation failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Seeding or auditing hit a store error.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The catalog has nothing to ingest against.
    #[error("metric catalog is empty")]
    EmptyCatalog,

    /// A worker task panicked or was cancelled.
    #[error("worker task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for ServiceError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

/// Failure of a single executor attempt.
///
/// Only [`ExecutionError::Transient`] is worth another attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Transient(String),

    /// Retrying cannot help.
    #[error(transparent)]
    Fatal(LedgerError),
}

impl From<StoreError> for ExecutionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(message) => Self::Transient(message),
            other => Self::Fatal(other.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_store_is_transient() {
        let err = ExecutionError::from(StoreError::Unavailable("connection reset".into()));
        assert_eq!(err, ExecutionError::Transient("connection reset".into()));
    }

    #[test]
    fn missing_subscription_is_fatal() {
        let err = ExecutionError::from(StoreError::not_found("subscription", "abc"));
        assert!(matches!(err, ExecutionError::Fatal(ref e) if e.is_not_found()));
    }
}
