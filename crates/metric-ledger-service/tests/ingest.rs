//! Metric ingestion integration tests.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{fast_config, seed, FlakyStore};
use metric_ledger_core::{LedgerError, MetricId};
use metric_ledger_service::MetricIngestionService;
use metric_ledger_store::{MemoryStore, MetricValueLog, SubscriptionAggregateStore};

// ============================================================================
// Fatal short-circuit
// ============================================================================

#[tokio::test]
async fn unknown_metric_is_not_found_and_records_nothing() {
    let store = FlakyStore::new();
    seed(store.as_ref(), &[(100, 0)]).await;
    let service = MetricIngestionService::new(Arc::clone(&store), &fast_config(5));

    let err = service
        .ingest(MetricId::generate(), 12.0, None)
        .await
        .unwrap_err();

    assert!(err.is_not_found());
    assert_eq!(store.inner().metric_value_count(), 0);
    assert_eq!(store.reads(), 0);
}

// ============================================================================
// Partial fan-out
// ============================================================================

#[tokio::test]
async fn overflow_on_one_subscription_leaves_the_others_charged() {
    let store = Arc::new(MemoryStore::new());
    let fixture = seed(store.as_ref(), &[(100, 0), (1, i64::MAX), (40, 60)]).await;
    let service = MetricIngestionService::new(Arc::clone(&store), &fast_config(5));

    let report = service.ingest(fixture.metric.id, 7.0, None).await.unwrap();

    assert_eq!(report.outcomes.len(), 3);
    assert_eq!(report.committed(), 2);
    assert!(!report.is_complete());
    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, fixture.subscriptions[1].id);
    assert!(matches!(failures[0].1, LedgerError::BalanceOverflow { .. }));

    let values = store.list_metric_values(&fixture.metric.id).await.unwrap();
    assert_eq!(values.len(), 1);

    let expected = [100, i64::MAX, 100];
    for (sub, total) in fixture.subscriptions.iter().zip(expected) {
        let audit = store.audit_subscription(&sub.id).await.unwrap();
        assert_eq!(audit.total_amount_cents, total);
        assert!(audit.is_consistent());
    }
}

#[tokio::test]
async fn unreachable_subscription_fails_alone() {
    let store = FlakyStore::new();
    let fixture = seed(store.as_ref(), &[(100, 0), (30, 0)]).await;
    store.kill(fixture.subscriptions[0].id);
    let service = MetricIngestionService::new(Arc::clone(&store), &fast_config(3));

    let report = service.ingest(fixture.metric.id, 1.0, None).await.unwrap();

    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(
        failures[0].1,
        &LedgerError::StoreUnavailable {
            attempts: 3,
            message: "connection refused".into()
        }
    );

    let charged = store.read(&fixture.subscriptions[1].id).await.unwrap();
    assert_eq!(charged.total_amount_cents, 30);
    assert_eq!(store.inner().metric_value_count(), 1);
}

// ============================================================================
// Transient store failures
// ============================================================================

#[tokio::test]
async fn brief_outage_is_retried_to_commit() {
    let store = FlakyStore::new();
    let fixture = seed(store.as_ref(), &[(100, 0)]).await;
    let service = MetricIngestionService::new(Arc::clone(&store), &fast_config(5));

    store.fail_next_reads(2);
    let report = service.ingest(fixture.metric.id, 1.0, None).await.unwrap();

    assert!(report.is_complete());
    let applied = report.outcomes[0].result.as_ref().unwrap();
    assert_eq!(applied.attempts, 3);
    assert_eq!(applied.receipt.new_total_cents, 100);

    let audit = store
        .audit_subscription(&fixture.subscriptions[0].id)
        .await
        .unwrap();
    assert_eq!(audit.transaction_count, 1);
    assert!(audit.is_consistent());
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn abandoned_ingest_leaves_no_partial_write() {
    let store = Arc::new(MemoryStore::new());
    let fixture = seed(store.as_ref(), &[(100, 0)]).await;
    let subscription_id = fixture.subscriptions[0].id;

    let slow = fast_config(5).with_artificial_delay(Some(Duration::from_millis(500)));
    let service = MetricIngestionService::new(Arc::clone(&store), &slow);
    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        service.ingest(fixture.metric.id, 1.0, None),
    )
    .await;
    assert!(abandoned.is_err());

    let audit = store.audit_subscription(&subscription_id).await.unwrap();
    assert_eq!(audit.total_amount_cents, 0);
    assert_eq!(audit.transaction_count, 0);

    let service = MetricIngestionService::new(Arc::clone(&store), &fast_config(5));
    service.ingest(fixture.metric.id, 1.0, None).await.unwrap();

    let audit = store.audit_subscription(&subscription_id).await.unwrap();
    assert_eq!(audit.total_amount_cents, 100);
    assert!(audit.is_consistent());
}
