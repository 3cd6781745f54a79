//! In-memory storage implementation.
//!
//! All tables live behind one `RwLock`. A conditional write checks the stored
//! version and applies the balance and ledger entry under the same write
//! guard, so it is atomic with respect to every other operation.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;

use metric_ledger_core::{
    Client, ClientId, Metric, MetricId, MetricValue, Subscription, SubscriptionCharge,
    SubscriptionId, Topic, TopicId, Transaction, TransactionId,
};

use crate::aggregate::{AggregateSnapshot, AggregateWrite, WriteOutcome};
use crate::error::{Result, StoreError};
use crate::{
    LedgerRegistry, MetricCatalog, MetricValueLog, SubscriptionAggregateStore,
    SubscriptionDirectory,
};

#[derive(Default)]
struct Tables {
    clients: HashMap<ClientId, Client>,
    topics: HashMap<TopicId, Topic>,
    metrics: HashMap<MetricId, Metric>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    transactions: BTreeMap<TransactionId, Transaction>,
    transactions_by_subscription: HashMap<SubscriptionId, Vec<TransactionId>>,
    metric_values: Vec<MetricValue>,
}

impl Tables {
    fn append_transaction(&mut self, transaction: &Transaction) {
        self.transactions_by_subscription
            .entry(transaction.subscription_id)
            .or_default()
            .push(transaction.id);
        self.transactions.insert(transaction.id, transaction.clone());
    }
}

/// Storage backed by process memory.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of metric observations recorded so far.
    #[must_use]
    pub fn metric_value_count(&self) -> usize {
        self.tables.read().metric_values.len()
    }

    /// Number of ledger transactions recorded so far.
    #[must_use]
    pub fn transaction_count(&self) -> usize {
        self.tables.read().transactions.len()
    }
}

#[async_trait]
impl MetricCatalog for MemoryStore {
    async fn get_metric(&self, metric_id: &MetricId) -> Result<Option<Metric>> {
        Ok(self.tables.read().metrics.get(metric_id).cloned())
    }

    async fn list_metrics(&self) -> Result<Vec<Metric>> {
        let mut metrics: Vec<_> = self.tables.read().metrics.values().cloned().collect();
        metrics.sort_by_key(|m| m.id);
        Ok(metrics)
    }
}

#[async_trait]
impl SubscriptionDirectory for MemoryStore {
    async fn list_subscriptions_by_topics(
        &self,
        topic_ids: &[TopicId],
    ) -> Result<Vec<SubscriptionCharge>> {
        let tables = self.tables.read();
        let mut charges: Vec<_> = tables
            .subscriptions
            .values()
            .filter(|s| topic_ids.contains(&s.topic_id))
            .map(Subscription::charge)
            .collect();
        charges.sort_by_key(|c| c.subscription_id);
        Ok(charges)
    }

    async fn get_subscription(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<Option<Subscription>> {
        Ok(self.tables.read().subscriptions.get(subscription_id).cloned())
    }
}

#[async_trait]
impl MetricValueLog for MemoryStore {
    async fn insert_metric_value(&self, value: &MetricValue) -> Result<()> {
        self.tables.write().metric_values.push(value.clone());
        Ok(())
    }

    async fn list_metric_values(&self, metric_id: &MetricId) -> Result<Vec<MetricValue>> {
        Ok(self
            .tables
            .read()
            .metric_values
            .iter()
            .filter(|v| v.metric_id == *metric_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SubscriptionAggregateStore for MemoryStore {
    async fn read(&self, subscription_id: &SubscriptionId) -> Result<AggregateSnapshot> {
        let tables = self.tables.read();
        let subscription = tables
            .subscriptions
            .get(subscription_id)
            .ok_or_else(|| StoreError::not_found("subscription", subscription_id))?;

        Ok(AggregateSnapshot {
            total_amount_cents: subscription.total_amount_cents,
            version: subscription.version,
        })
    }

    async fn conditional_write(&self, write: &AggregateWrite) -> Result<WriteOutcome> {
        let mut tables = self.tables.write();
        let subscription = tables
            .subscriptions
            .get_mut(&write.subscription_id)
            .ok_or_else(|| StoreError::not_found("subscription", write.subscription_id))?;

        if !write.check.admits(subscription.version) {
            return Ok(WriteOutcome::ConflictAborted {
                current: subscription.version,
            });
        }

        subscription.total_amount_cents = write.new_total_cents;
        subscription.version = subscription.version.next();
        let version = subscription.version;

        tables.append_transaction(&write.transaction);

        Ok(WriteOutcome::Committed { version })
    }

    async fn list_transactions_by_subscription(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<Vec<Transaction>> {
        let tables = self.tables.read();
        let Some(ids) = tables.transactions_by_subscription.get(subscription_id) else {
            return Ok(Vec::new());
        };

        let mut transactions: Vec<_> = ids
            .iter()
            .filter_map(|id| tables.transactions.get(id).cloned())
            .collect();
        transactions.sort_by_key(|t| t.id);
        Ok(transactions)
    }
}

#[async_trait]
impl LedgerRegistry for MemoryStore {
    async fn put_client(&self, client: &Client) -> Result<()> {
        self.tables.write().clients.insert(client.id, client.clone());
        Ok(())
    }

    async fn put_topic(&self, topic: &Topic) -> Result<()> {
        self.tables.write().topics.insert(topic.id, topic.clone());
        Ok(())
    }

    async fn put_metric(&self, metric: &Metric) -> Result<()> {
        self.tables.write().metrics.insert(metric.id, metric.clone());
        Ok(())
    }

    async fn put_subscription(&self, subscription: &Subscription) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.subscriptions.contains_key(&subscription.id) {
            return Err(StoreError::already_exists("subscription", subscription.id));
        }

        tables
            .subscriptions
            .insert(subscription.id, subscription.clone());

        if subscription.total_amount_cents != 0 {
            tables.append_transaction(&Transaction::opening(
                subscription.id,
                subscription.total_amount_cents,
            ));
        }

        Ok(())
    }
}
