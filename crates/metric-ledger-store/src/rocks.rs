//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the storage traits.
//! The database is opened as an `OptimisticTransactionDB`: a conditional write
//! re-reads the subscription with `get_for_update`, compares its version and
//! stages the balance and ledger rows in one transaction. A commit that loses
//! to a concurrent writer fails with `Busy`, which is reported as a conflict.
//! Unchecked writes bypass conflict tracking and go through a plain write
//! batch, so they always land.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, Direction, ErrorKind, IteratorMode, MultiThreaded,
    OptimisticTransactionDB, Options, WriteBatchWithTransaction,
};

use metric_ledger_core::{
    Client, Metric, MetricId, MetricValue, MetricValueId, Subscription, SubscriptionCharge,
    SubscriptionId, Topic, TopicId, Transaction, TransactionId,
};

use crate::aggregate::{AggregateSnapshot, AggregateWrite, VersionCheck, WriteOutcome};
use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::{
    LedgerRegistry, MetricCatalog, MetricValueLog, SubscriptionAggregateStore,
    SubscriptionDirectory,
};

type Db = OptimisticTransactionDB<MultiThreaded>;

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<Db>,
}

/// Map a `RocksDB` error onto the store taxonomy.
fn db_error(e: &rocksdb::Error) -> StoreError {
    match e.kind() {
        ErrorKind::IOError | ErrorKind::TimedOut => StoreError::Unavailable(e.to_string()),
        _ => StoreError::Database(e.to_string()),
    }
}

/// Whether a commit failed because another transaction touched the same keys.
fn is_write_conflict(e: &rocksdb::Error) -> bool {
    matches!(e.kind(), ErrorKind::Busy | ErrorKind::TryAgain)
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = Db::open_cf_descriptors(&opts, path, cf_descriptors).map_err(|e| db_error(&e))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn get<T: serde::de::DeserializeOwned>(
        &self,
        cf_name: &str,
        key: &[u8],
    ) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        self.db
            .get_cf(&cf, key)
            .map_err(|e| db_error(&e))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn put<T: serde::Serialize>(&self, cf_name: &str, key: &[u8], value: &T) -> Result<()> {
        let cf = self.cf(cf_name)?;
        let value = Self::serialize(value)?;
        self.db.put_cf(&cf, key, value).map_err(|e| db_error(&e))
    }

    fn load_subscription(&self, subscription_id: &SubscriptionId) -> Result<Option<Subscription>> {
        self.get(cf::SUBSCRIPTIONS, &keys::subscription_key(subscription_id))
    }

    /// Collect the 16 byte suffixes of every index key starting with `prefix`.
    fn index_suffixes(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<[u8; 16]>> {
        let cf = self.cf(cf_name)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));

        let mut suffixes = Vec::new();
        for item in iter {
            let (key, _) = item.map_err(|e| db_error(&e))?;
            if !key.starts_with(prefix) {
                break;
            }
            if let Some(suffix) = keys::suffix_of(&key) {
                suffixes.push(suffix);
            }
        }
        Ok(suffixes)
    }

    /// Stage a ledger entry and its subscription index row in `txn`.
    fn stage_transaction(
        &self,
        txn: &rocksdb::Transaction<'_, Db>,
        transaction: &Transaction,
    ) -> Result<()> {
        let cf_tx = self.cf(cf::TRANSACTIONS)?;
        let cf_by_sub = self.cf(cf::TRANSACTIONS_BY_SUBSCRIPTION)?;

        let tx_key = keys::transaction_key(&transaction.id);
        let index_key =
            keys::subscription_transaction_key(&transaction.subscription_id, &transaction.id);

        txn.put_cf(&cf_tx, &tx_key, Self::serialize(transaction)?)
            .map_err(|e| db_error(&e))?;
        txn.put_cf(&cf_by_sub, &index_key, [])
            .map_err(|e| db_error(&e))?;
        Ok(())
    }

    /// Overwrite the balance without a version check.
    fn blind_write(&self, write: &AggregateWrite) -> Result<WriteOutcome> {
        let mut subscription = self
            .load_subscription(&write.subscription_id)?
            .ok_or_else(|| StoreError::not_found("subscription", write.subscription_id))?;
        subscription.total_amount_cents = write.new_total_cents;
        subscription.version = subscription.version.next();

        let cf_subs = self.cf(cf::SUBSCRIPTIONS)?;
        let cf_tx = self.cf(cf::TRANSACTIONS)?;
        let cf_by_sub = self.cf(cf::TRANSACTIONS_BY_SUBSCRIPTION)?;
        let transaction = &write.transaction;

        let mut batch = WriteBatchWithTransaction::<true>::default();
        batch.put_cf(
            &cf_subs,
            keys::subscription_key(&write.subscription_id),
            Self::serialize(&subscription)?,
        );
        batch.put_cf(
            &cf_tx,
            keys::transaction_key(&transaction.id),
            Self::serialize(transaction)?,
        );
        batch.put_cf(
            &cf_by_sub,
            keys::subscription_transaction_key(&transaction.subscription_id, &transaction.id),
            [],
        );
        self.db.write(batch).map_err(|e| db_error(&e))?;

        Ok(WriteOutcome::Committed {
            version: subscription.version,
        })
    }
}

#[async_trait]
impl MetricCatalog for RocksStore {
    async fn get_metric(&self, metric_id: &MetricId) -> Result<Option<Metric>> {
        self.get(cf::METRICS, metric_id.as_bytes())
    }

    async fn list_metrics(&self) -> Result<Vec<Metric>> {
        let cf = self.cf(cf::METRICS)?;
        let mut metrics = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item.map_err(|e| db_error(&e))?;
            metrics.push(Self::deserialize(&value)?);
        }
        Ok(metrics)
    }
}

#[async_trait]
impl SubscriptionDirectory for RocksStore {
    async fn list_subscriptions_by_topics(
        &self,
        topic_ids: &[TopicId],
    ) -> Result<Vec<SubscriptionCharge>> {
        let mut charges = Vec::new();
        for topic_id in topic_ids {
            for suffix in self.index_suffixes(cf::SUBSCRIPTIONS_BY_TOPIC, topic_id.as_bytes())? {
                let subscription_id = SubscriptionId::from_uuid(uuid::Uuid::from_bytes(suffix));
                if let Some(subscription) = self.load_subscription(&subscription_id)? {
                    charges.push(subscription.charge());
                }
            }
        }
        charges.sort_by_key(|c| c.subscription_id);
        charges.dedup();
        Ok(charges)
    }

    async fn get_subscription(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<Option<Subscription>> {
        self.load_subscription(subscription_id)
    }
}

#[async_trait]
impl MetricValueLog for RocksStore {
    async fn insert_metric_value(&self, value: &MetricValue) -> Result<()> {
        let key = keys::metric_value_key(&value.metric_id, &value.id);
        self.put(cf::METRIC_VALUES, &key, value)
    }

    async fn list_metric_values(&self, metric_id: &MetricId) -> Result<Vec<MetricValue>> {
        let mut values = Vec::new();
        for suffix in self.index_suffixes(cf::METRIC_VALUES, metric_id.as_bytes())? {
            let key = keys::metric_value_key(metric_id, &MetricValueId::from_bytes(suffix));
            if let Some(value) = self.get(cf::METRIC_VALUES, &key)? {
                values.push(value);
            }
        }
        Ok(values)
    }
}

#[async_trait]
impl SubscriptionAggregateStore for RocksStore {
    async fn read(&self, subscription_id: &SubscriptionId) -> Result<AggregateSnapshot> {
        let subscription = self
            .load_subscription(subscription_id)?
            .ok_or_else(|| StoreError::not_found("subscription", subscription_id))?;

        Ok(AggregateSnapshot {
            total_amount_cents: subscription.total_amount_cents,
            version: subscription.version,
        })
    }

    async fn conditional_write(&self, write: &AggregateWrite) -> Result<WriteOutcome> {
        if write.check == VersionCheck::Unchecked {
            return self.blind_write(write);
        }

        let cf_subs = self.cf(cf::SUBSCRIPTIONS)?;
        let key = keys::subscription_key(&write.subscription_id);

        let txn = self.db.transaction();

        let current = txn
            .get_for_update_cf(&cf_subs, &key, true)
            .map_err(|e| db_error(&e))?
            .ok_or_else(|| StoreError::not_found("subscription", write.subscription_id))?;

        let mut subscription: Subscription = Self::deserialize(&current)?;
        if !write.check.admits(subscription.version) {
            return Ok(WriteOutcome::ConflictAborted {
                current: subscription.version,
            });
        }

        subscription.total_amount_cents = write.new_total_cents;
        subscription.version = subscription.version.next();

        txn.put_cf(&cf_subs, &key, Self::serialize(&subscription)?)
            .map_err(|e| db_error(&e))?;
        self.stage_transaction(&txn, &write.transaction)?;

        match txn.commit() {
            Ok(()) => Ok(WriteOutcome::Committed {
                version: subscription.version,
            }),
            Err(e) if is_write_conflict(&e) => {
                tracing::debug!(
                    subscription_id = %write.subscription_id,
                    error = %e,
                    "Optimistic commit lost to a concurrent writer"
                );
                let current = self
                    .load_subscription(&write.subscription_id)?
                    .map_or(subscription.version, |s| s.version);
                Ok(WriteOutcome::ConflictAborted { current })
            }
            Err(e) => Err(db_error(&e)),
        }
    }

    async fn list_transactions_by_subscription(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<Vec<Transaction>> {
        let mut transactions = Vec::new();
        for suffix in
            self.index_suffixes(cf::TRANSACTIONS_BY_SUBSCRIPTION, subscription_id.as_bytes())?
        {
            let key = keys::transaction_key(&TransactionId::from_bytes(suffix));
            if let Some(tx) = self.get(cf::TRANSACTIONS, &key)? {
                transactions.push(tx);
            }
        }
        Ok(transactions)
    }
}

#[async_trait]
impl LedgerRegistry for RocksStore {
    async fn put_client(&self, client: &Client) -> Result<()> {
        self.put(cf::CLIENTS, client.id.as_bytes(), client)
    }

    async fn put_topic(&self, topic: &Topic) -> Result<()> {
        self.put(cf::TOPICS, topic.id.as_bytes(), topic)
    }

    async fn put_metric(&self, metric: &Metric) -> Result<()> {
        self.put(cf::METRICS, metric.id.as_bytes(), metric)
    }

    async fn put_subscription(&self, subscription: &Subscription) -> Result<()> {
        let cf_subs = self.cf(cf::SUBSCRIPTIONS)?;
        let cf_by_topic = self.cf(cf::SUBSCRIPTIONS_BY_TOPIC)?;
        let key = keys::subscription_key(&subscription.id);

        let txn = self.db.transaction();
        if txn
            .get_for_update_cf(&cf_subs, &key, true)
            .map_err(|e| db_error(&e))?
            .is_some()
        {
            return Err(StoreError::already_exists("subscription", subscription.id));
        }

        txn.put_cf(&cf_subs, &key, Self::serialize(subscription)?)
            .map_err(|e| db_error(&e))?;
        txn.put_cf(
            &cf_by_topic,
            keys::topic_subscription_key(&subscription.topic_id, &subscription.id),
            [],
        )
        .map_err(|e| db_error(&e))?;

        if subscription.total_amount_cents != 0 {
            let opening = Transaction::opening(subscription.id, subscription.total_amount_cents);
            self.stage_transaction(&txn, &opening)?;
        }

        txn.commit().map_err(|e| {
            if is_write_conflict(&e) {
                StoreError::already_exists("subscription", subscription.id)
            } else {
                db_error(&e)
            }
        })
    }
}
