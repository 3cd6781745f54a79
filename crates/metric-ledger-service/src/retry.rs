//! Retry policy around the ledger executor.
//!
//! Conflicts are retried after a short jittered pause so colliding writers
//! spread out. An unavailable store is retried with exponential backoff.
//! Both share one attempt ceiling.

use std::time::Duration;

use rand::Rng;
use serde::Serialize;

use metric_ledger_core::{LedgerConfig, LedgerError};
use metric_ledger_store::SubscriptionAggregateStore;

use crate::error::ExecutionError;
use crate::executor::{ChargeReceipt, ChargeRequest, ExecutionOutcome, LedgerTransactionExecutor};

/// A committed charge and the number of attempts it took.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedCharge {
    /// What was committed.
    pub receipt: ChargeReceipt,

    /// Attempts made, including the successful one.
    pub attempts: u32,
}

/// Bounded retries for conflicting or failing charges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictRetryPolicy {
    max_attempts: u32,
    retry_backoff: Duration,
    max_backoff: Duration,
}

impl ConflictRetryPolicy {
    /// Build the policy described by `config`.
    #[must_use]
    pub fn from_config(config: &LedgerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            retry_backoff: config.retry_backoff.min(config.max_backoff),
            max_backoff: config.max_backoff,
        }
    }

    /// Run `request` through `executor` until it commits or the policy gives up.
    ///
    /// Dropping the returned future between attempts is safe: every attempt
    /// either committed in full or left nothing behind.
    ///
    /// # Errors
    ///
    /// - `LedgerError::ConflictExhausted` if every attempt lost a race.
    /// - `LedgerError::StoreUnavailable` if the store stayed unreachable.
    /// - Any fatal executor error, unchanged and without retrying.
    pub async fn apply<S>(
        &self,
        executor: &LedgerTransactionExecutor<S>,
        request: &ChargeRequest,
    ) -> Result<AppliedCharge, LedgerError>
    where
        S: SubscriptionAggregateStore + ?Sized,
    {
        let mut attempt = 0;
        let mut backoff = self.retry_backoff;

        loop {
            attempt += 1;

            match executor.execute(request).await {
                Ok(ExecutionOutcome::Committed(receipt)) => {
                    return Ok(AppliedCharge {
                        receipt,
                        attempts: attempt,
                    });
                }
                Ok(ExecutionOutcome::ConflictAborted { current, .. }) => {
                    if attempt >= self.max_attempts {
                        tracing::warn!(
                            subscription_id = %request.subscription_id,
                            attempt = %attempt,
                            current = %current,
                            "Conflict retries exhausted"
                        );
                        return Err(LedgerError::ConflictExhausted {
                            subscription_id: request.subscription_id,
                            attempts: attempt,
                        });
                    }

                    let pause = self.conflict_pause();
                    tracing::debug!(
                        subscription_id = %request.subscription_id,
                        attempt = %attempt,
                        pause_ms = %pause.as_millis(),
                        "Version conflict, retrying"
                    );
                    tokio::time::sleep(pause).await;
                }
                Err(ExecutionError::Transient(message)) => {
                    if attempt >= self.max_attempts {
                        tracing::warn!(
                            subscription_id = %request.subscription_id,
                            attempt = %attempt,
                            error = %message,
                            "Store unavailable after max retries"
                        );
                        return Err(LedgerError::StoreUnavailable {
                            attempts: attempt,
                            message,
                        });
                    }

                    tracing::debug!(
                        subscription_id = %request.subscription_id,
                        attempt = %attempt,
                        backoff_ms = %backoff.as_millis(),
                        error = %message,
                        "Store unavailable, retrying"
                    );
                    tokio::time::sleep(backoff).await;

                    // Exponential backoff with cap
                    backoff = backoff.saturating_mul(2).min(self.max_backoff);
                }
                Err(ExecutionError::Fatal(e)) => return Err(e),
            }
        }
    }

    /// A pause between half and one and a half times the base backoff.
    fn conflict_pause(&self) -> Duration {
        let base = self.retry_backoff.min(self.max_backoff);
        if base.is_zero() {
            return Duration::ZERO;
        }
        let factor = rand::thread_rng().gen_range(0.5..1.5);
        base.mul_f64(factor).min(self.max_backoff)
    }
}
