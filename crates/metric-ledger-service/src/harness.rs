//! Concurrency harness.
//!
//! Seeds one subscription and one metric, fires `K` concurrent ingests at
//! them and checks that the balance still matches its ledger. Running the
//! same scenario in [`IsolationMode::Unchecked`] with a delay between read and
//! write reproduces the lost update the conditional write guards against.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinSet;

use metric_ledger_core::{
    Client, IsolationMode, LedgerConfig, Metric, MetricId, Subscription, SubscriptionId, Topic,
};
use metric_ledger_store::LedgerStore;

use crate::error::Result;
use crate::ingest::MetricIngestionService;

/// Default delay between a worker's read and its write.
pub const DEFAULT_ARTIFICIAL_DELAY: Duration = Duration::from_millis(100);

/// One harness run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencyScenario {
    /// Subscription to seed and contend on.
    pub subscription_id: SubscriptionId,

    /// Metric to seed and ingest.
    pub metric_id: MetricId,

    /// Pricing of the subscription, charged once per ingest.
    pub amount_cents: i64,

    /// Opening balance.
    pub initial_balance_cents: i64,

    /// Number of concurrent ingests.
    pub concurrency: usize,

    /// Conflict detection for balance writes.
    pub isolation_mode: IsolationMode,

    /// Sleep between read and write in each attempt.
    pub artificial_delay: Option<Duration>,
}

impl Default for ConcurrencyScenario {
    fn default() -> Self {
        Self {
            subscription_id: SubscriptionId::generate(),
            metric_id: MetricId::generate(),
            amount_cents: 100,
            initial_balance_cents: 0,
            concurrency: 2,
            isolation_mode: IsolationMode::Optimistic,
            artificial_delay: Some(DEFAULT_ARTIFICIAL_DELAY),
        }
    }
}

impl ConcurrencyScenario {
    /// Set the per-ingest charge.
    #[must_use]
    pub fn with_amount_cents(mut self, amount_cents: i64) -> Self {
        self.amount_cents = amount_cents;
        self
    }

    /// Set the opening balance.
    #[must_use]
    pub fn with_initial_balance_cents(mut self, initial_balance_cents: i64) -> Self {
        self.initial_balance_cents = initial_balance_cents;
        self
    }

    /// Set the number of concurrent ingests.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the isolation mode.
    #[must_use]
    pub fn with_isolation_mode(mut self, mode: IsolationMode) -> Self {
        self.isolation_mode = mode;
        self
    }

    /// Set the delay between read and write.
    #[must_use]
    pub fn with_artificial_delay(mut self, delay: Option<Duration>) -> Self {
        self.artificial_delay = delay;
        self
    }

    /// Balance expected if every ingest is charged exactly once.
    #[must_use]
    pub fn expected_balance_cents(&self) -> i64 {
        let workers = i64::try_from(self.concurrency).unwrap_or(i64::MAX);
        self.initial_balance_cents
            .saturating_add(workers.saturating_mul(self.amount_cents))
    }
}

/// Outcome of a harness run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HarnessReport {
    /// The contended subscription.
    pub subscription_id: SubscriptionId,

    /// Isolation mode the run used.
    pub isolation_mode: IsolationMode,

    /// Number of concurrent ingests.
    pub concurrency: usize,

    /// Balance after every worker settled.
    pub final_balance_cents: i64,

    /// Balance if every ingest had been charged exactly once.
    pub expected_balance_cents: i64,

    /// Ledger rows for the subscription, opening entry included.
    pub transaction_count: usize,

    /// Sum of those rows.
    pub ledger_sum_cents: i64,

    /// Charges that committed.
    pub committed: usize,

    /// Charges that failed, exhausted retries included.
    pub failed: usize,

    /// Whether the balance equals the ledger sum.
    pub consistent: bool,

    /// Wall-clock duration of the concurrent phase.
    pub elapsed: Duration,
}

impl HarnessReport {
    /// Charges that committed to the ledger but are missing from the balance.
    #[must_use]
    pub fn lost_updates(&self, amount_cents: i64) -> i64 {
        if amount_cents == 0 {
            return 0;
        }
        (self.ledger_sum_cents - self.final_balance_cents) / amount_cents
    }
}

/// Runs [`ConcurrencyScenario`]s against a store.
pub struct ConcurrencyHarness<S: ?Sized> {
    store: Arc<S>,
    config: LedgerConfig,
}

impl<S> ConcurrencyHarness<S>
where
    S: LedgerStore + ?Sized + 'static,
{
    /// Create a harness. `config` supplies the retry settings; each scenario
    /// overrides the isolation mode and artificial delay.
    #[must_use]
    pub fn new(store: Arc<S>, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    /// Seed `scenario`, run its workers to completion and audit the result.
    ///
    /// # Errors
    ///
    /// Returns an error if seeding or the final audit fails, or a worker task
    /// panics. Individual charge failures are counted, not returned.
    pub async fn run(&self, scenario: &ConcurrencyScenario) -> Result<HarnessReport> {
        self.seed(scenario).await?;

        let config = self
            .config
            .clone()
            .with_isolation_mode(scenario.isolation_mode)
            .with_artificial_delay(scenario.artificial_delay);
        let service = Arc::new(MetricIngestionService::new(Arc::clone(&self.store), &config));

        tracing::info!(
            subscription_id = %scenario.subscription_id,
            concurrency = scenario.concurrency,
            isolation_mode = %scenario.isolation_mode,
            delay_ms = ?scenario.artificial_delay.map(|d| d.as_millis()),
            "Starting concurrency test"
        );

        let started = Instant::now();
        let mut workers = JoinSet::new();
        for _ in 0..scenario.concurrency {
            let service = Arc::clone(&service);
            let metric_id = scenario.metric_id;
            workers.spawn(async move { service.ingest(metric_id, 1.0, None).await });
        }

        let mut committed = 0;
        let mut failed = 0;
        while let Some(joined) = workers.join_next().await {
            match joined? {
                Ok(report) => {
                    committed += report.committed();
                    failed += report.outcomes.len() - report.committed();
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Ingest failed");
                    failed += 1;
                }
            }
        }
        let elapsed = started.elapsed();

        let audit = self
            .store
            .audit_subscription(&scenario.subscription_id)
            .await?;

        let report = HarnessReport {
            subscription_id: scenario.subscription_id,
            isolation_mode: scenario.isolation_mode,
            concurrency: scenario.concurrency,
            final_balance_cents: audit.total_amount_cents,
            expected_balance_cents: scenario.expected_balance_cents(),
            transaction_count: audit.transaction_count,
            ledger_sum_cents: audit.ledger_sum_cents,
            committed,
            failed,
            consistent: audit.is_consistent(),
            elapsed,
        };

        if report.consistent {
            tracing::info!(
                final_balance_cents = report.final_balance_cents,
                expected_balance_cents = report.expected_balance_cents,
                committed,
                failed,
                elapsed_ms = %elapsed.as_millis(),
                "Concurrency test finished"
            );
        } else {
            tracing::warn!(
                final_balance_cents = report.final_balance_cents,
                ledger_sum_cents = report.ledger_sum_cents,
                lost_updates = report.lost_updates(scenario.amount_cents),
                "Balance diverged from ledger"
            );
        }

        Ok(report)
    }

    async fn seed(&self, scenario: &ConcurrencyScenario) -> Result<()> {
        let topic = Topic::new("Concurrency");
        let client = Client::new("Concurrency Test Client");
        let metric = Metric {
            id: scenario.metric_id,
            name: "Concurrency Metric".into(),
            topic_ids: vec![topic.id],
        };
        let subscription = Subscription::new(client.id, topic.id, scenario.amount_cents)
            .with_id(scenario.subscription_id)
            .with_opening_balance(scenario.initial_balance_cents);

        self.store.put_topic(&topic).await?;
        self.store.put_client(&client).await?;
        self.store.put_metric(&metric).await?;
        self.store.put_subscription(&subscription).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metric_ledger_store::MemoryStore;

    #[test]
    fn expected_balance_accounts_for_every_worker() {
        let scenario = ConcurrencyScenario::default()
            .with_amount_cents(25)
            .with_initial_balance_cents(1_000)
            .with_concurrency(8);
        assert_eq!(scenario.expected_balance_cents(), 1_200);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn optimistic_run_without_delay_is_consistent() {
        let harness = ConcurrencyHarness::new(Arc::new(MemoryStore::new()), LedgerConfig::default());
        let scenario = ConcurrencyScenario::default()
            .with_concurrency(4)
            .with_artificial_delay(None);

        let report = harness.run(&scenario).await.unwrap();
        assert_eq!(report.final_balance_cents, 400);
        assert_eq!(report.committed, 4);
        assert_eq!(report.transaction_count, 4);
        assert!(report.consistent);
        assert_eq!(report.lost_updates(100), 0);
    }
}
