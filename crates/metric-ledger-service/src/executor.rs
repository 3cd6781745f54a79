//! Single read-modify-write attempt against a subscription balance.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use metric_ledger_core::{
    IsolationMode, LedgerConfig, LedgerError, MetricId, SubscriptionId, Transaction, Version,
};
use metric_ledger_store::{AggregateWrite, SubscriptionAggregateStore, VersionCheck, WriteOutcome};

use crate::error::ExecutionError;

/// One metric observation's charge against one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargeRequest {
    /// Subscription to charge.
    pub subscription_id: SubscriptionId,

    /// Metric the observation belongs to.
    pub metric_id: MetricId,

    /// Amount in cents.
    pub amount_cents: i64,

    /// When the observation was made.
    pub observed_at: DateTime<Utc>,
}

/// A committed charge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChargeReceipt {
    /// The appended ledger entry.
    pub transaction: Transaction,

    /// Balance after the charge, in cents.
    pub new_total_cents: i64,

    /// Aggregate version after the charge.
    pub version: Version,
}

/// How an attempt ended, when it did not fail outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Balance and ledger entry were written.
    Committed(ChargeReceipt),

    /// Someone else wrote first. Nothing was written.
    ConflictAborted {
        /// Version the balance was read at.
        expected: Version,
        /// Version found at write time.
        current: Version,
    },
}

/// Reads a balance, adds a charge and writes it back conditionally.
///
/// The executor holds no lock of its own. Whether two concurrent attempts can
/// overwrite each other is decided entirely by the store's conditional write
/// and the configured [`IsolationMode`].
pub struct LedgerTransactionExecutor<S: ?Sized> {
    store: Arc<S>,
    isolation_mode: IsolationMode,
    artificial_delay: Option<Duration>,
}

impl<S: ?Sized> Clone for LedgerTransactionExecutor<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            isolation_mode: self.isolation_mode,
            artificial_delay: self.artificial_delay,
        }
    }
}

impl<S> LedgerTransactionExecutor<S>
where
    S: SubscriptionAggregateStore + ?Sized,
{
    /// Create an executor over `store`.
    #[must_use]
    pub fn new(store: Arc<S>, config: &LedgerConfig) -> Self {
        Self {
            store,
            isolation_mode: config.isolation_mode,
            artificial_delay: config.artificial_delay,
        }
    }

    /// Make one attempt at applying `request`.
    ///
    /// # Errors
    ///
    /// - `ExecutionError::Transient` if the store is unavailable.
    /// - `ExecutionError::Fatal` if the subscription is missing, the new
    ///   balance would overflow, or the store reports a permanent failure.
    pub async fn execute(
        &self,
        request: &ChargeRequest,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let snapshot = self.store.read(&request.subscription_id).await?;

        if let Some(delay) = self.artificial_delay {
            tokio::time::sleep(delay).await;
        }

        let new_total_cents = snapshot
            .total_amount_cents
            .checked_add(request.amount_cents)
            .ok_or(ExecutionError::Fatal(LedgerError::BalanceOverflow {
                subscription_id: request.subscription_id,
                total_cents: snapshot.total_amount_cents,
                amount_cents: request.amount_cents,
            }))?;

        let write = AggregateWrite {
            subscription_id: request.subscription_id,
            check: VersionCheck::for_mode(self.isolation_mode, snapshot.version),
            new_total_cents,
            transaction: Transaction::metric_charge(
                request.subscription_id,
                request.metric_id,
                request.amount_cents,
                request.observed_at,
            ),
        };

        match self.store.conditional_write(&write).await? {
            WriteOutcome::Committed { version } => {
                tracing::debug!(
                    subscription_id = %request.subscription_id,
                    transaction_id = %write.transaction.id,
                    amount_cents = request.amount_cents,
                    new_total_cents,
                    version = %version,
                    "Charge committed"
                );
                Ok(ExecutionOutcome::Committed(ChargeReceipt {
                    transaction: write.transaction,
                    new_total_cents,
                    version,
                }))
            }
            WriteOutcome::ConflictAborted { current } => {
                tracing::debug!(
                    subscription_id = %request.subscription_id,
                    expected = %snapshot.version,
                    current = %current,
                    "Charge aborted on version conflict"
                );
                Ok(ExecutionOutcome::ConflictAborted {
                    expected: snapshot.version,
                    current,
                })
            }
        }
    }
}
