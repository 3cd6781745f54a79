//! Metric ingestion with per-subscription fan-out.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;

use metric_ledger_core::{
    LedgerConfig, LedgerError, MetricId, MetricValue, SubscriptionCharge, SubscriptionId,
};
use metric_ledger_store::LedgerStore;

use crate::executor::{ChargeRequest, LedgerTransactionExecutor};
use crate::retry::{AppliedCharge, ConflictRetryPolicy};

/// What happened to one subscription during an ingest.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionOutcome {
    /// The charged subscription.
    pub subscription_id: SubscriptionId,

    /// The committed charge, or why it could not be applied.
    pub result: Result<AppliedCharge, LedgerError>,
}

impl SubscriptionOutcome {
    /// Whether the charge committed.
    #[must_use]
    pub const fn is_committed(&self) -> bool {
        self.result.is_ok()
    }
}

/// Result of ingesting one metric observation.
///
/// The observation is recorded regardless of how the fan-out went.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestReport {
    /// The recorded observation.
    pub metric_value: MetricValue,

    /// One entry per subscription on the metric's topics.
    pub outcomes: Vec<SubscriptionOutcome>,
}

impl IngestReport {
    /// Number of committed charges.
    #[must_use]
    pub fn committed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_committed()).count()
    }

    /// The subscriptions that could not be charged, with their errors.
    pub fn failures(&self) -> impl Iterator<Item = (SubscriptionId, &LedgerError)> + '_ {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.subscription_id, e)))
    }

    /// Whether every subscription was charged.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.outcomes.iter().all(SubscriptionOutcome::is_committed)
    }
}

/// Records metric observations and charges every subscribed client.
pub struct MetricIngestionService<S: ?Sized> {
    store: Arc<S>,
    executor: LedgerTransactionExecutor<S>,
    policy: ConflictRetryPolicy,
}

impl<S> MetricIngestionService<S>
where
    S: LedgerStore + ?Sized,
{
    /// Create a service over `store`.
    #[must_use]
    pub fn new(store: Arc<S>, config: &LedgerConfig) -> Self {
        Self {
            executor: LedgerTransactionExecutor::new(Arc::clone(&store), config),
            policy: ConflictRetryPolicy::from_config(config),
            store,
        }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Record an observation of `metric_id` and charge each subscription on
    /// one of its topics.
    ///
    /// `observed_at` defaults to now. Subscriptions are charged concurrently
    /// and independently: one failing leaves the others and the recorded
    /// observation in place.
    ///
    /// # Errors
    ///
    /// - `LedgerError::NotFound` if the metric doesn't exist. Nothing is
    ///   written in that case.
    /// - Any store error raised while recording the observation or listing
    ///   subscriptions.
    pub async fn ingest(
        &self,
        metric_id: MetricId,
        value: f64,
        observed_at: Option<DateTime<Utc>>,
    ) -> Result<IngestReport, LedgerError> {
        let metric = self
            .store
            .get_metric(&metric_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound {
                entity: "metric",
                id: metric_id.to_string(),
            })?;

        let observed_at = observed_at.unwrap_or_else(Utc::now);
        let metric_value = MetricValue::new(metric.id, value, observed_at);
        self.store.insert_metric_value(&metric_value).await?;

        let charges = self
            .store
            .list_subscriptions_by_topics(&metric.topic_ids)
            .await?;

        let metric_id = metric.id;
        let pending: Vec<_> = charges
            .into_iter()
            .map(|charge| self.charge(charge, metric_id, observed_at))
            .collect();
        let outcomes = join_all(pending).await;

        let report = IngestReport {
            metric_value,
            outcomes,
        };

        for (subscription_id, error) in report.failures() {
            tracing::warn!(
                metric_id = %metric_id,
                subscription_id = %subscription_id,
                error = %error,
                "Subscription charge failed"
            );
        }

        tracing::debug!(
            metric_id = %metric_id,
            metric_value_id = %report.metric_value.id,
            subscriptions = report.outcomes.len(),
            committed = report.committed(),
            "Metric value ingested"
        );

        Ok(report)
    }

    async fn charge(
        &self,
        charge: SubscriptionCharge,
        metric_id: MetricId,
        observed_at: DateTime<Utc>,
    ) -> SubscriptionOutcome {
        let request = ChargeRequest {
            subscription_id: charge.subscription_id,
            metric_id,
            amount_cents: charge.pricing_cents,
            observed_at,
        };
        SubscriptionOutcome {
            subscription_id: charge.subscription_id,
            result: self.policy.apply(&self.executor, &request).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metric_ledger_core::{Client, Metric, Subscription, Topic};
    use metric_ledger_store::{
        LedgerRegistry, MemoryStore, MetricValueLog, SubscriptionAggregateStore,
    };

    struct Catalog {
        store: Arc<MemoryStore>,
        metric: Metric,
        covered: Vec<Subscription>,
        uncovered: Subscription,
    }

    async fn catalog() -> Catalog {
        let store = Arc::new(MemoryStore::new());
        let finance = Topic::new("Finance");
        let health = Topic::new("Health");
        let sports = Topic::new("Sports");
        for topic in [&finance, &health, &sports] {
            store.put_topic(topic).await.unwrap();
        }

        let metric = Metric::new("Page Views", vec![finance.id, health.id]);
        store.put_metric(&metric).await.unwrap();

        let client = Client::new("Acme");
        store.put_client(&client).await.unwrap();
        let covered = vec![
            Subscription::new(client.id, finance.id, 100),
            Subscription::new(client.id, health.id, 40).with_opening_balance(1_000),
        ];
        let uncovered = Subscription::new(client.id, sports.id, 7);
        for sub in covered.iter().chain([&uncovered]) {
            store.put_subscription(sub).await.unwrap();
        }

        Catalog {
            store,
            metric,
            covered,
            uncovered,
        }
    }

    #[tokio::test]
    async fn charges_every_subscription_on_the_metric_topics() {
        let catalog = catalog().await;
        let service = MetricIngestionService::new(Arc::clone(&catalog.store), &LedgerConfig::default());

        let report = service.ingest(catalog.metric.id, 42.5, None).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.committed(), 2);
        assert_eq!(report.metric_value.value, 42.5);

        let finance = catalog.store.read(&catalog.covered[0].id).await.unwrap();
        let health = catalog.store.read(&catalog.covered[1].id).await.unwrap();
        let sports = catalog.store.read(&catalog.uncovered.id).await.unwrap();
        assert_eq!(finance.total_amount_cents, 100);
        assert_eq!(health.total_amount_cents, 1_040);
        assert_eq!(sports.total_amount_cents, 0);
    }

    #[tokio::test]
    async fn unknown_metric_writes_nothing() {
        let catalog = catalog().await;
        let service = MetricIngestionService::new(Arc::clone(&catalog.store), &LedgerConfig::default());

        let err = service
            .ingest(MetricId::generate(), 1.0, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { entity: "metric", .. }));
        assert_eq!(catalog.store.metric_value_count(), 0);
    }

    #[tokio::test]
    async fn keeps_the_given_observation_time() {
        let catalog = catalog().await;
        let service = MetricIngestionService::new(Arc::clone(&catalog.store), &LedgerConfig::default());
        let observed_at = Utc::now() - chrono::Duration::days(3);

        service
            .ingest(catalog.metric.id, 1.0, Some(observed_at))
            .await
            .unwrap();

        let values = catalog
            .store
            .list_metric_values(&catalog.metric.id)
            .await
            .unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].calculated_on, observed_at);

        let ledger = catalog
            .store
            .list_transactions_by_subscription(&catalog.covered[0].id)
            .await
            .unwrap();
        assert_eq!(ledger[0].created_at, observed_at);
    }

    #[tokio::test]
    async fn metric_without_subscribers_still_records_the_value() {
        let store = Arc::new(MemoryStore::new());
        let metric = Metric::new("Bounce Rate", vec![Topic::new("Science").id]);
        store.put_metric(&metric).await.unwrap();
        let service = MetricIngestionService::new(Arc::clone(&store), &LedgerConfig::default());

        let report = service.ingest(metric.id, 3.0, None).await.unwrap();
        assert!(report.outcomes.is_empty());
        assert!(report.is_complete());
        assert_eq!(store.metric_value_count(), 1);
    }
}
