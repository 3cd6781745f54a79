//! Concurrency harness against the `RocksDB` backend.

#![cfg(feature = "rocksdb-backend")]

mod common;

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use common::fast_config;
use metric_ledger_core::IsolationMode;
use metric_ledger_service::{ConcurrencyHarness, ConcurrencyScenario};
use metric_ledger_store::RocksStore;

fn rocks_harness(max_attempts: u32) -> (ConcurrencyHarness<RocksStore>, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let store = RocksStore::open(temp_dir.path()).expect("Failed to open store");
    (
        ConcurrencyHarness::new(Arc::new(store), fast_config(max_attempts)),
        temp_dir,
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn optimistic_transactions_keep_every_charge() {
    let (harness, _temp_dir) = rocks_harness(32);
    let scenario = ConcurrencyScenario::default()
        .with_concurrency(6)
        .with_amount_cents(100)
        .with_initial_balance_cents(1_000)
        .with_artificial_delay(Some(Duration::from_millis(10)));

    let report = harness.run(&scenario).await.unwrap();

    assert_eq!(report.final_balance_cents, 1_600);
    assert_eq!(report.committed, 6);
    assert_eq!(report.transaction_count, 7);
    assert!(report.consistent);
}

#[tokio::test(flavor = "multi_thread")]
async fn two_worker_scenario_matches_memory_backend() {
    let (harness, _temp_dir) = rocks_harness(10);
    let scenario = ConcurrencyScenario::default()
        .with_amount_cents(100)
        .with_isolation_mode(IsolationMode::Optimistic);

    let report = harness.run(&scenario).await.unwrap();

    assert_eq!(report.final_balance_cents, 200);
    assert_eq!(report.transaction_count, 2);
    assert!(report.consistent);
}
