//! Metric ingestion and the ledger update path.
//!
//! A metric observation is recorded once and then charged to every
//! subscription bound to one of the metric's topics:
//!
//! - [`MetricIngestionService`] records the observation and fans out
//! - [`ConflictRetryPolicy`] retries each subscription's charge on conflict
//! - [`LedgerTransactionExecutor`] does one read-modify-write attempt through
//!   the store's conditional write
//!
//! [`ConcurrencyHarness`] and [`LoadTest`] drive the path for verification
//! and benchmarking; the `metric-ledger` binary exposes both.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod executor;
pub mod harness;
pub mod ingest;
pub mod retry;

pub use config::{ServiceConfig, StoreBackend};
pub use error::{ExecutionError, Result, ServiceError};
pub use executor::{ChargeReceipt, ChargeRequest, ExecutionOutcome, LedgerTransactionExecutor};
pub use harness::{ConcurrencyHarness, ConcurrencyScenario, HarnessReport};
pub use ingest::{IngestReport, MetricIngestionService, SubscriptionOutcome};
pub use load_test::{seed_catalog, CatalogSummary, LoadTest, LoadTestReport};
pub use retry::{AppliedCharge, ConflictRetryPolicy};
