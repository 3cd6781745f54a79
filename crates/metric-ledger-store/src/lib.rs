//! Storage layer for the metric ledger.
//!
//! The ledger core only talks to storage through the narrow traits in this
//! crate:
//!
//! - [`MetricCatalog`]: metric lookup
//! - [`SubscriptionDirectory`]: subscriptions bound to a set of topics
//! - [`MetricValueLog`]: append-only metric observations
//! - [`SubscriptionAggregateStore`]: versioned balance read and conditional write
//! - [`LedgerRegistry`]: insert primitives for seeding catalogs
//!
//! # Backends
//!
//! - [`MemoryStore`]: in-process tables behind a lock, used by tests and the
//!   concurrency harness
//! - [`RocksStore`]: `RocksDB` optimistic transactions with column families
//!   (feature `rocksdb-backend`)
//! - [`PgStore`]: `PostgreSQL` via `sqlx`, version column compare-and-swap
//!
//! # Example
//!
//! ```no_run
//! use metric_ledger_store::{MemoryStore, SubscriptionAggregateStore};
//! use metric_ledger_core::SubscriptionId;
//!
//! # async fn run() -> metric_ledger_store::Result<()> {
//! let store = MemoryStore::new();
//! let snapshot = store.read(&SubscriptionId::generate()).await;
//! assert!(snapshot.is_err());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod aggregate;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod schema;

#[cfg(feature = "rocksdb-backend")]
pub mod keys;
#[cfg(feature = "rocksdb-backend")]
pub mod rocks;

pub use aggregate::{AggregateSnapshot, AggregateWrite, VersionCheck, WriteOutcome};
pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use postgres::PgStore;
#[cfg(feature = "rocksdb-backend")]
pub use rocks::RocksStore;

use async_trait::async_trait;
use metric_ledger_core::{
    Client, LedgerAudit, Metric, MetricId, MetricValue, Subscription, SubscriptionCharge,
    SubscriptionId, Topic, TopicId, Transaction,
};

/// Metric lookup.
#[async_trait]
pub trait MetricCatalog: Send + Sync {
    /// Get a metric by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_metric(&self, metric_id: &MetricId) -> Result<Option<Metric>>;

    /// List every metric in the catalog.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_metrics(&self) -> Result<Vec<Metric>>;
}

/// Subscription lookup by topic.
#[async_trait]
pub trait SubscriptionDirectory: Send + Sync {
    /// List the subscriptions whose topic is one of `topic_ids`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_subscriptions_by_topics(
        &self,
        topic_ids: &[TopicId],
    ) -> Result<Vec<SubscriptionCharge>>;

    /// Get a full subscription record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_subscription(&self, subscription_id: &SubscriptionId)
        -> Result<Option<Subscription>>;
}

/// Append-only log of metric observations.
#[async_trait]
pub trait MetricValueLog: Send + Sync {
    /// Record an observation.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn insert_metric_value(&self, value: &MetricValue) -> Result<()>;

    /// List observations of a metric, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_metric_values(&self, metric_id: &MetricId) -> Result<Vec<MetricValue>>;
}

/// Versioned access to subscription balances.
///
/// This is the only way a balance changes. Every committed write appends its
/// transaction in the same atomic step.
#[async_trait]
pub trait SubscriptionAggregateStore: Send + Sync {
    /// Read the current balance and version.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the subscription doesn't exist.
    async fn read(&self, subscription_id: &SubscriptionId) -> Result<AggregateSnapshot>;

    /// Append `write.transaction` and set the balance to `write.new_total_cents`,
    /// provided the version check passes.
    ///
    /// A failed check returns [`WriteOutcome::ConflictAborted`] and leaves no
    /// trace in the store.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the subscription doesn't exist.
    /// - `StoreError::Unavailable` if the store can't be reached.
    async fn conditional_write(&self, write: &AggregateWrite) -> Result<WriteOutcome>;

    /// List transactions for a subscription, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_transactions_by_subscription(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<Vec<Transaction>>;

    /// Compare the stored balance with the sum of its ledger.
    ///
    /// Only meaningful once concurrent writers have settled.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the subscription doesn't exist.
    async fn audit_subscription(&self, subscription_id: &SubscriptionId) -> Result<LedgerAudit> {
        let snapshot = self.read(subscription_id).await?;
        let transactions = self.list_transactions_by_subscription(subscription_id).await?;
        Ok(LedgerAudit::new(
            *subscription_id,
            snapshot.total_amount_cents,
            &transactions,
        ))
    }
}

/// Insert primitives for catalogs and subscriptions.
#[async_trait]
pub trait LedgerRegistry: Send + Sync {
    /// Insert or replace a client.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn put_client(&self, client: &Client) -> Result<()>;

    /// Insert or replace a topic.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn put_topic(&self, topic: &Topic) -> Result<()>;

    /// Insert or replace a metric and its topic associations.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn put_metric(&self, metric: &Metric) -> Result<()>;

    /// Insert a new subscription.
    ///
    /// A non-zero opening balance is recorded as an opening transaction in
    /// the same atomic step.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::AlreadyExists` if the id is taken.
    async fn put_subscription(&self, subscription: &Subscription) -> Result<()>;

    /// Register a client with one subscription per topic.
    ///
    /// # Errors
    ///
    /// Returns an error if any insert fails; earlier inserts are kept.
    async fn create_client_with_subscriptions(
        &self,
        name: &str,
        topic_ids: &[TopicId],
        single_metric_pricing_cents: i64,
        initial_amount_cents: i64,
    ) -> Result<(Client, Vec<Subscription>)> {
        let client = Client::new(name);
        self.put_client(&client).await?;

        let mut subscriptions = Vec::with_capacity(topic_ids.len());
        for topic_id in topic_ids {
            let subscription = Subscription::new(client.id, *topic_id, single_metric_pricing_cents)
                .with_opening_balance(initial_amount_cents);
            self.put_subscription(&subscription).await?;
            subscriptions.push(subscription);
        }

        tracing::debug!(
            client_id = %client.id,
            subscriptions = subscriptions.len(),
            "Client registered"
        );

        Ok((client, subscriptions))
    }
}

/// Everything the ledger service needs from one backend.
pub trait LedgerStore:
    MetricCatalog + SubscriptionDirectory + MetricValueLog + SubscriptionAggregateStore + LedgerRegistry
{
}

impl<T> LedgerStore for T where
    T: MetricCatalog
        + SubscriptionDirectory
        + MetricValueLog
        + SubscriptionAggregateStore
        + LedgerRegistry
{
}
