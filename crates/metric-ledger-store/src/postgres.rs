//! `PostgreSQL` storage implementation.
//!
//! Balances live in the `subscription` table next to a `version` column. A
//! conditional write is one database transaction:
//!
//! ```sql
//! UPDATE subscription SET total_amount_cents = $1, version = version + 1
//!  WHERE id = $2 AND version = $3
//! RETURNING version
//! ```
//!
//! followed by the ledger insert. Zero updated rows means another writer got
//! there first. Under `READ COMMITTED` a concurrent `UPDATE` of the same row
//! blocks on the row lock and then re-evaluates the `version` predicate, so
//! the compare-and-swap holds without raising the isolation level. Should the
//! database abort with a serialization failure anyway, the write is reported
//! as a conflict too.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use metric_ledger_core::{
    Client, ClientId, Metric, MetricId, MetricValue, Subscription, SubscriptionCharge,
    SubscriptionId, Topic, TopicId, Transaction, TransactionSource, Version,
};

use crate::aggregate::{AggregateSnapshot, AggregateWrite, VersionCheck, WriteOutcome};
use crate::error::{Result, StoreError};
use crate::{
    LedgerRegistry, MetricCatalog, MetricValueLog, SubscriptionAggregateStore,
    SubscriptionDirectory,
};

/// Default pool size.
const DEFAULT_MAX_CONNECTIONS: u32 = 16;

/// How long to wait for a pooled connection before reporting the store unavailable.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLSTATE codes that mean "retry the transaction".
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const UNIQUE_VIOLATION: &str = "23505";

/// PostgreSQL-backed storage implementation.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    schema: String,
}

/// Map a `sqlx` error onto the store taxonomy.
fn sql_error(e: &sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(e.to_string()),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Serialization(e.to_string())
        }
        _ => StoreError::Database(e.to_string()),
    }
}

fn sqlstate(e: &sqlx::Error) -> Option<String> {
    match e {
        sqlx::Error::Database(db) => db.code().map(|code| code.into_owned()),
        _ => None,
    }
}

fn is_retryable_abort(e: &sqlx::Error) -> bool {
    matches!(
        sqlstate(e).as_deref(),
        Some(SERIALIZATION_FAILURE | DEADLOCK_DETECTED)
    )
}

fn to_db_version(version: Version) -> Result<i64> {
    i64::try_from(version.get())
        .map_err(|_| StoreError::Serialization(format!("version out of range: {version}")))
}

fn from_db_version(raw: i64) -> Result<Version> {
    u64::try_from(raw)
        .map(Version::new)
        .map_err(|_| StoreError::Serialization(format!("negative version: {raw}")))
}

fn is_valid_schema_name(schema: &str) -> bool {
    !schema.is_empty()
        && schema
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn subscription_from_row(row: &PgRow) -> Result<Subscription> {
    let get = |e: sqlx::Error| sql_error(&e);
    Ok(Subscription {
        id: SubscriptionId::from_uuid(row.try_get("id").map_err(get)?),
        client_id: ClientId::from_uuid(row.try_get("client_id").map_err(get)?),
        topic_id: TopicId::from_uuid(row.try_get("topic_id").map_err(get)?),
        total_amount_cents: row.try_get("total_amount_cents").map_err(get)?,
        single_metric_pricing_cents: row.try_get("single_metric_pricing_cents").map_err(get)?,
        version: from_db_version(row.try_get("version").map_err(get)?)?,
        created_at: row.try_get("created_at").map_err(get)?,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction> {
    let get = |e: sqlx::Error| sql_error(&e);
    let id: String = row.try_get("id").map_err(get)?;
    let metric_id: Option<Uuid> = row.try_get("metric_id").map_err(get)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(get)?;

    Ok(Transaction {
        id: id
            .parse()
            .map_err(|e| StoreError::Serialization(format!("transaction id {id}: {e}")))?,
        subscription_id: SubscriptionId::from_uuid(row.try_get("subscription_id").map_err(get)?),
        source: metric_id.map_or(TransactionSource::Opening, |id| TransactionSource::Metric {
            metric_id: MetricId::from_uuid(id),
        }),
        amount_cents: row.try_get("amount_cents").map_err(get)?,
        created_at,
    })
}

impl PgStore {
    /// Connect to `database_url`, resolving tables in `schema`.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema name is invalid or the pool cannot
    /// connect.
    pub async fn connect(database_url: &str, schema: &str) -> Result<Self> {
        if !is_valid_schema_name(schema) {
            return Err(StoreError::Database(format!("invalid schema name: {schema}")));
        }

        let options = PgConnectOptions::from_str(database_url)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .options([("search_path", schema)]);

        let pool = PgPoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(|e| sql_error(&e))?;

        tracing::debug!(schema = %schema, "Connected to PostgreSQL");

        Ok(Self {
            pool,
            schema: schema.to_string(),
        })
    }

    /// Create the schema if needed and apply the bundled migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created or a migration fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", self.schema))
            .execute(&self.pool)
            .await
            .map_err(|e| sql_error(&e))?;

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("migration failed: {e}")))?;

        tracing::info!(schema = %self.schema, "Ledger schema migrated");
        Ok(())
    }

    async fn current_version(&self, subscription_id: &SubscriptionId) -> Result<Option<Version>> {
        let raw: Option<i64> = sqlx::query_scalar("SELECT version FROM subscription WHERE id = $1")
            .bind(subscription_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| sql_error(&e))?;
        raw.map(from_db_version).transpose()
    }

    /// Report a lost race, or `NotFound` if the row is gone.
    async fn conflict(&self, subscription_id: &SubscriptionId) -> Result<WriteOutcome> {
        match self.current_version(subscription_id).await? {
            Some(current) => Ok(WriteOutcome::ConflictAborted { current }),
            None => Err(StoreError::not_found("subscription", subscription_id)),
        }
    }
}

#[async_trait]
impl MetricCatalog for PgStore {
    async fn get_metric(&self, metric_id: &MetricId) -> Result<Option<Metric>> {
        let row = sqlx::query("SELECT id, name, topic_ids FROM metric WHERE id = $1")
            .bind(metric_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| sql_error(&e))?;

        row.map(|row| metric_from_row(&row)).transpose()
    }

    async fn list_metrics(&self) -> Result<Vec<Metric>> {
        sqlx::query("SELECT id, name, topic_ids FROM metric ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| sql_error(&e))?
            .iter()
            .map(metric_from_row)
            .collect()
    }
}

fn metric_from_row(row: &PgRow) -> Result<Metric> {
    let get = |e: sqlx::Error| sql_error(&e);
    let topic_ids: Vec<Uuid> = row.try_get("topic_ids").map_err(get)?;
    Ok(Metric {
        id: MetricId::from_uuid(row.try_get("id").map_err(get)?),
        name: row.try_get("name").map_err(get)?,
        topic_ids: topic_ids.into_iter().map(TopicId::from_uuid).collect(),
    })
}

#[async_trait]
impl SubscriptionDirectory for PgStore {
    async fn list_subscriptions_by_topics(
        &self,
        topic_ids: &[TopicId],
    ) -> Result<Vec<SubscriptionCharge>> {
        let topic_ids: Vec<Uuid> = topic_ids.iter().map(|t| *t.as_uuid()).collect();
        let rows = sqlx::query(
            "SELECT id, single_metric_pricing_cents FROM subscription \
             WHERE topic_id = ANY($1) ORDER BY id",
        )
        .bind(topic_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| sql_error(&e))?;

        rows.iter()
            .map(|row| {
                Ok(SubscriptionCharge {
                    subscription_id: SubscriptionId::from_uuid(
                        row.try_get("id").map_err(|e| sql_error(&e))?,
                    ),
                    pricing_cents: row
                        .try_get("single_metric_pricing_cents")
                        .map_err(|e| sql_error(&e))?,
                })
            })
            .collect()
    }

    async fn get_subscription(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<Option<Subscription>> {
        let row = sqlx::query(
            "SELECT id, client_id, topic_id, total_amount_cents, single_metric_pricing_cents, \
             version, created_at FROM subscription WHERE id = $1",
        )
        .bind(subscription_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| sql_error(&e))?;

        row.map(|row| subscription_from_row(&row)).transpose()
    }
}

#[async_trait]
impl MetricValueLog for PgStore {
    async fn insert_metric_value(&self, value: &MetricValue) -> Result<()> {
        sqlx::query(
            "INSERT INTO metric_value (id, metric_id, value, calculated_on) VALUES ($1, $2, $3, $4)",
        )
        .bind(value.id.to_string())
        .bind(value.metric_id.as_uuid())
        .bind(value.value)
        .bind(value.calculated_on)
        .execute(&self.pool)
        .await
        .map_err(|e| sql_error(&e))?;
        Ok(())
    }

    async fn list_metric_values(&self, metric_id: &MetricId) -> Result<Vec<MetricValue>> {
        let rows = sqlx::query(
            "SELECT id, metric_id, value, calculated_on FROM metric_value \
             WHERE metric_id = $1 ORDER BY id",
        )
        .bind(metric_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| sql_error(&e))?;

        rows.iter()
            .map(|row| {
                let get = |e: sqlx::Error| sql_error(&e);
                let id: String = row.try_get("id").map_err(get)?;
                Ok(MetricValue {
                    id: id
                        .parse()
                        .map_err(|e| StoreError::Serialization(format!("metric value id {id}: {e}")))?,
                    metric_id: MetricId::from_uuid(row.try_get("metric_id").map_err(get)?),
                    value: row.try_get("value").map_err(get)?,
                    calculated_on: row.try_get("calculated_on").map_err(get)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl SubscriptionAggregateStore for PgStore {
    async fn read(&self, subscription_id: &SubscriptionId) -> Result<AggregateSnapshot> {
        let row = sqlx::query("SELECT total_amount_cents, version FROM subscription WHERE id = $1")
            .bind(subscription_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| sql_error(&e))?
            .ok_or_else(|| StoreError::not_found("subscription", subscription_id))?;

        Ok(AggregateSnapshot {
            total_amount_cents: row.try_get("total_amount_cents").map_err(|e| sql_error(&e))?,
            version: from_db_version(row.try_get("version").map_err(|e| sql_error(&e))?)?,
        })
    }

    async fn conditional_write(&self, write: &AggregateWrite) -> Result<WriteOutcome> {
        let subscription_id = write.subscription_id.as_uuid();
        let mut tx = self.pool.begin().await.map_err(|e| sql_error(&e))?;

        let updated = match write.check {
            VersionCheck::Expect(expected) => {
                sqlx::query_scalar::<_, i64>(
                    "UPDATE subscription SET total_amount_cents = $1, version = version + 1 \
                     WHERE id = $2 AND version = $3 RETURNING version",
                )
                .bind(write.new_total_cents)
                .bind(subscription_id)
                .bind(to_db_version(expected)?)
                .fetch_optional(&mut *tx)
                .await
            }
            VersionCheck::Unchecked => {
                sqlx::query_scalar::<_, i64>(
                    "UPDATE subscription SET total_amount_cents = $1, version = version + 1 \
                     WHERE id = $2 RETURNING version",
                )
                .bind(write.new_total_cents)
                .bind(subscription_id)
                .fetch_optional(&mut *tx)
                .await
            }
        };

        let version = match updated {
            Ok(Some(raw)) => from_db_version(raw)?,
            Ok(None) => {
                // Dropping `tx` rolls back.
                drop(tx);
                return self.conflict(&write.subscription_id).await;
            }
            Err(e) if is_retryable_abort(&e) => {
                drop(tx);
                return self.conflict(&write.subscription_id).await;
            }
            Err(e) => return Err(sql_error(&e)),
        };

        let transaction = &write.transaction;
        let inserted = sqlx::query(
            "INSERT INTO ledger_transaction (id, subscription_id, metric_id, amount_cents, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(transaction.id.to_string())
        .bind(transaction.subscription_id.as_uuid())
        .bind(transaction.metric_id().map(|m| *m.as_uuid()))
        .bind(transaction.amount_cents)
        .bind(transaction.created_at)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(e) if is_retryable_abort(&e) => {
                drop(tx);
                return self.conflict(&write.subscription_id).await;
            }
            Err(e) => return Err(sql_error(&e)),
        }

        match tx.commit().await {
            Ok(()) => Ok(WriteOutcome::Committed { version }),
            Err(e) if is_retryable_abort(&e) => self.conflict(&write.subscription_id).await,
            Err(e) => Err(sql_error(&e)),
        }
    }

    async fn list_transactions_by_subscription(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<Vec<Transaction>> {
        sqlx::query(
            "SELECT id, subscription_id, metric_id, amount_cents, created_at \
             FROM ledger_transaction WHERE subscription_id = $1 ORDER BY id",
        )
        .bind(subscription_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| sql_error(&e))?
        .iter()
        .map(transaction_from_row)
        .collect()
    }
}

#[async_trait]
impl LedgerRegistry for PgStore {
    async fn put_client(&self, client: &Client) -> Result<()> {
        sqlx::query(
            "INSERT INTO client (id, name, created_at) VALUES ($1, $2, $3) \
             ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name",
        )
        .bind(client.id.as_uuid())
        .bind(&client.name)
        .bind(client.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| sql_error(&e))?;
        Ok(())
    }

    async fn put_topic(&self, topic: &Topic) -> Result<()> {
        sqlx::query(
            "INSERT INTO topic (id, name) VALUES ($1, $2) \
             ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name",
        )
        .bind(topic.id.as_uuid())
        .bind(&topic.name)
        .execute(&self.pool)
        .await
        .map_err(|e| sql_error(&e))?;
        Ok(())
    }

    async fn put_metric(&self, metric: &Metric) -> Result<()> {
        let topic_ids: Vec<Uuid> = metric.topic_ids.iter().map(|t| *t.as_uuid()).collect();
        sqlx::query(
            "INSERT INTO metric (id, name, topic_ids) VALUES ($1, $2, $3) \
             ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, topic_ids = EXCLUDED.topic_ids",
        )
        .bind(metric.id.as_uuid())
        .bind(&metric.name)
        .bind(topic_ids)
        .execute(&self.pool)
        .await
        .map_err(|e| sql_error(&e))?;
        Ok(())
    }

    async fn put_subscription(&self, subscription: &Subscription) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| sql_error(&e))?;

        let inserted = sqlx::query(
            "INSERT INTO subscription (id, client_id, topic_id, total_amount_cents, \
             single_metric_pricing_cents, version, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(subscription.id.as_uuid())
        .bind(subscription.client_id.as_uuid())
        .bind(subscription.topic_id.as_uuid())
        .bind(subscription.total_amount_cents)
        .bind(subscription.single_metric_pricing_cents)
        .bind(to_db_version(subscription.version)?)
        .bind(subscription.created_at)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            return Err(if sqlstate(&e).as_deref() == Some(UNIQUE_VIOLATION) {
                StoreError::already_exists("subscription", subscription.id)
            } else {
                sql_error(&e)
            });
        }

        if subscription.total_amount_cents != 0 {
            let opening = Transaction::opening(subscription.id, subscription.total_amount_cents);
            sqlx::query(
                "INSERT INTO ledger_transaction (id, subscription_id, metric_id, amount_cents, created_at) \
                 VALUES ($1, $2, NULL, $3, $4)",
            )
            .bind(opening.id.to_string())
            .bind(opening.subscription_id.as_uuid())
            .bind(opening.amount_cents)
            .bind(opening.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| sql_error(&e))?;
        }

        tx.commit().await.map_err(|e| sql_error(&e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_names_are_plain_identifiers() {
        assert!(is_valid_schema_name("public"));
        assert!(is_valid_schema_name("ledger_test_01"));
        assert!(!is_valid_schema_name(""));
        assert!(!is_valid_schema_name("public\"; DROP TABLE client; --"));
    }

    #[test]
    fn versions_roundtrip_through_bigint() {
        assert_eq!(to_db_version(Version::new(7)).unwrap(), 7);
        assert_eq!(from_db_version(7).unwrap(), Version::new(7));
        assert!(from_db_version(-1).is_err());
        assert!(to_db_version(Version::new(u64::MAX)).is_err());
    }

    #[test]
    fn pool_exhaustion_is_transient() {
        assert!(sql_error(&sqlx::Error::PoolTimedOut).is_transient());
        assert!(!sql_error(&sqlx::Error::RowNotFound).is_transient());
    }
}
