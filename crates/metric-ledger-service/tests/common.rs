//! Common test utilities for metric ledger integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use metric_ledger_core::{
    Client, LedgerConfig, Metric, MetricId, MetricValue, Subscription, SubscriptionCharge,
    SubscriptionId, Topic, TopicId, Transaction,
};
use metric_ledger_store::{
    AggregateSnapshot, AggregateWrite, LedgerRegistry, MemoryStore, MetricCatalog,
    MetricValueLog, Result, StoreError, SubscriptionAggregateStore, SubscriptionDirectory,
    WriteOutcome,
};

/// Ledger settings with short retry pauses.
pub fn fast_config(max_attempts: u32) -> LedgerConfig {
    LedgerConfig::default()
        .with_max_attempts(max_attempts)
        .with_retry_backoff(Duration::from_millis(1))
        .with_max_backoff(Duration::from_millis(10))
}

/// A seeded metric and the subscriptions it charges.
pub struct Fixture {
    pub metric: Metric,
    pub subscriptions: Vec<Subscription>,
}

/// Seed one subscription per entry of `plans`, each on its own topic, and a
/// metric covering all of them.
pub async fn seed<S>(store: &S, plans: &[(i64, i64)]) -> Fixture
where
    S: LedgerRegistry + ?Sized,
{
    let client = Client::new("Acme");
    store.put_client(&client).await.unwrap();

    let mut topic_ids: Vec<TopicId> = Vec::new();
    let mut subscriptions = Vec::new();
    for (n, (pricing_cents, opening_cents)) in plans.iter().enumerate() {
        let topic = Topic::new(format!("Topic {n}"));
        store.put_topic(&topic).await.unwrap();
        let subscription = Subscription::new(client.id, topic.id, *pricing_cents)
            .with_opening_balance(*opening_cents);
        store.put_subscription(&subscription).await.unwrap();
        topic_ids.push(topic.id);
        subscriptions.push(subscription);
    }

    let metric = Metric::new("Page Views", topic_ids);
    store.put_metric(&metric).await.unwrap();

    Fixture {
        metric,
        subscriptions,
    }
}

/// Wraps a [`MemoryStore`] and reports the store unavailable on demand.
///
/// Outages are injected on balance reads, either for the next `n` reads or
/// permanently for one subscription.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    pending_outages: AtomicU32,
    dead: Mutex<Vec<SubscriptionId>>,
    reads: AtomicU32,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `n` balance reads.
    pub fn fail_next_reads(&self, n: u32) {
        self.pending_outages.store(n, Ordering::SeqCst);
    }

    /// Fail every balance read of `subscription_id`.
    pub fn kill(&self, subscription_id: SubscriptionId) {
        self.dead.lock().push(subscription_id);
    }

    /// Balance reads attempted so far, failed ones included.
    pub fn reads(&self) -> u32 {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }
}

#[async_trait]
impl MetricCatalog for FlakyStore {
    async fn get_metric(&self, metric_id: &MetricId) -> Result<Option<Metric>> {
        self.inner.get_metric(metric_id).await
    }

    async fn list_metrics(&self) -> Result<Vec<Metric>> {
        self.inner.list_metrics().await
    }
}

#[async_trait]
impl SubscriptionDirectory for FlakyStore {
    async fn list_subscriptions_by_topics(
        &self,
        topic_ids: &[TopicId],
    ) -> Result<Vec<SubscriptionCharge>> {
        self.inner.list_subscriptions_by_topics(topic_ids).await
    }

    async fn get_subscription(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<Option<Subscription>> {
        self.inner.get_subscription(subscription_id).await
    }
}

#[async_trait]
impl MetricValueLog for FlakyStore {
    async fn insert_metric_value(&self, value: &MetricValue) -> Result<()> {
        self.inner.insert_metric_value(value).await
    }

    async fn list_metric_values(&self, metric_id: &MetricId) -> Result<Vec<MetricValue>> {
        self.inner.list_metric_values(metric_id).await
    }
}

#[async_trait]
impl SubscriptionAggregateStore for FlakyStore {
    async fn read(&self, subscription_id: &SubscriptionId) -> Result<AggregateSnapshot> {
        self.reads.fetch_add(1, Ordering::SeqCst);

        if self.dead.lock().contains(subscription_id) {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        let injected = self
            .pending_outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("connection reset by peer".into()));
        }

        self.inner.read(subscription_id).await
    }

    async fn conditional_write(&self, write: &AggregateWrite) -> Result<WriteOutcome> {
        self.inner.conditional_write(write).await
    }

    async fn list_transactions_by_subscription(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<Vec<Transaction>> {
        self.inner
            .list_transactions_by_subscription(subscription_id)
            .await
    }
}

#[async_trait]
impl LedgerRegistry for FlakyStore {
    async fn put_client(&self, client: &Client) -> Result<()> {
        self.inner.put_client(client).await
    }

    async fn put_topic(&self, topic: &Topic) -> Result<()> {
        self.inner.put_topic(topic).await
    }

    async fn put_metric(&self, metric: &Metric) -> Result<()> {
        self.inner.put_metric(metric).await
    }

    async fn put_subscription(&self, subscription: &Subscription) -> Result<()> {
        self.inner.put_subscription(subscription).await
    }
}
