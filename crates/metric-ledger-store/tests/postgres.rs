//! `PostgreSQL` backend tests.
//!
//! These need a live database and are skipped unless `TEST_DATABASE_URL` is
//! set. Each test works in its own schema.

use metric_ledger_core::{Client, Metric, Subscription, Topic, Transaction, Version};
use metric_ledger_store::{
    AggregateWrite, LedgerRegistry, MetricCatalog, PgStore, SubscriptionAggregateStore,
    SubscriptionDirectory, VersionCheck, WriteOutcome,
};

struct TestDb {
    url: String,
    schema: String,
}

async fn test_db() -> Option<(PgStore, TestDb)> {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return None;
    };
    let schema = format!("ledger_test_{}", uuid::Uuid::new_v4().simple());
    let store = PgStore::connect(&url, &schema).await.unwrap();
    store.migrate().await.unwrap();
    Some((store, TestDb { url, schema }))
}

async fn test_store() -> Option<PgStore> {
    test_db().await.map(|(store, _)| store)
}

async fn seed(store: &PgStore, pricing_cents: i64) -> (Subscription, Metric) {
    let topic = Topic::new("Finance");
    let client = Client::new("Acme");
    let metric = Metric::new("Page Views", vec![topic.id]);
    let subscription = Subscription::new(client.id, topic.id, pricing_cents);

    store.put_topic(&topic).await.unwrap();
    store.put_client(&client).await.unwrap();
    store.put_metric(&metric).await.unwrap();
    store.put_subscription(&subscription).await.unwrap();
    (subscription, metric)
}

fn charge(sub: &Subscription, metric: &Metric, check: VersionCheck, total: i64) -> AggregateWrite {
    AggregateWrite {
        subscription_id: sub.id,
        check,
        new_total_cents: total,
        transaction: Transaction::metric_charge(
            sub.id,
            metric.id,
            sub.single_metric_pricing_cents,
            chrono::Utc::now(),
        ),
    }
}

#[tokio::test]
async fn catalog_roundtrip() {
    let Some(store) = test_store().await else {
        return;
    };
    let (sub, metric) = seed(&store, 100).await;

    assert_eq!(store.get_metric(&metric.id).await.unwrap(), Some(metric.clone()));
    let charges = store
        .list_subscriptions_by_topics(&metric.topic_ids)
        .await
        .unwrap();
    assert_eq!(charges, vec![sub.charge()]);
}

#[tokio::test]
async fn stale_version_is_a_conflict() {
    let Some(store) = test_store().await else {
        return;
    };
    let (sub, metric) = seed(&store, 100).await;

    let first = store
        .conditional_write(&charge(&sub, &metric, VersionCheck::Expect(Version::INITIAL), 100))
        .await
        .unwrap();
    assert_eq!(first, WriteOutcome::Committed { version: Version::new(1) });

    let second = store
        .conditional_write(&charge(&sub, &metric, VersionCheck::Expect(Version::INITIAL), 100))
        .await
        .unwrap();
    assert_eq!(second, WriteOutcome::ConflictAborted { current: Version::new(1) });

    let audit = store.audit_subscription(&sub.id).await.unwrap();
    assert_eq!(audit.transaction_count, 1);
    assert!(audit.is_consistent());
}

#[tokio::test]
async fn opening_balance_and_duplicates() {
    let Some(store) = test_store().await else {
        return;
    };
    let topic = Topic::new("Sports");
    store.put_topic(&topic).await.unwrap();
    let (_, subs) = store
        .create_client_with_subscriptions("Initech", &[topic.id], 50, 1_000)
        .await
        .unwrap();

    let audit = store.audit_subscription(&subs[0].id).await.unwrap();
    assert_eq!(audit.total_amount_cents, 1_000);
    assert!(audit.is_consistent());

    assert!(store.put_subscription(&subs[0]).await.is_err());
}

#[tokio::test]
async fn serialization_failure_on_ledger_insert_is_a_conflict() {
    let Some((store, db)) = test_db().await else {
        return;
    };
    let (sub, metric) = seed(&store, 100).await;

    let admin = sqlx::PgPool::connect(&db.url).await.unwrap();
    sqlx::query(&format!(
        "CREATE FUNCTION {}.abort_insert() RETURNS trigger LANGUAGE plpgsql AS \
         $$ BEGIN RAISE EXCEPTION 'could not serialize access' USING ERRCODE = '40001'; END $$",
        db.schema
    ))
    .execute(&admin)
    .await
    .unwrap();
    sqlx::query(&format!(
        "CREATE TRIGGER abort_insert BEFORE INSERT ON {0}.ledger_transaction \
         FOR EACH ROW EXECUTE FUNCTION {0}.abort_insert()",
        db.schema
    ))
    .execute(&admin)
    .await
    .unwrap();

    let outcome = store
        .conditional_write(&charge(&sub, &metric, VersionCheck::Expect(Version::INITIAL), 100))
        .await
        .unwrap();
    assert_eq!(outcome, WriteOutcome::ConflictAborted { current: Version::INITIAL });

    let audit = store.audit_subscription(&sub.id).await.unwrap();
    assert_eq!(audit.total_amount_cents, 0);
    assert_eq!(audit.transaction_count, 0);
}
