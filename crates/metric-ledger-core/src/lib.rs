//! Core types for the metric ledger.
//!
//! Clients subscribe to topics and pay a fixed price per observation of any
//! metric bound to that topic. This crate holds the shared vocabulary:
//!
//! - **Identifiers**: `ClientId`, `TopicId`, `MetricId`, `SubscriptionId`,
//!   `TransactionId`, `MetricValueId`
//! - **Catalog**: `Client`, `Topic`, `Metric`, `Subscription`
//! - **Ledger**: `Transaction`, `MetricValue`, `Version`, `LedgerAudit`
//! - **Configuration**: `LedgerConfig`, `IsolationMode`
//!
//! # Money
//!
//! Amounts are `i64` integer cents (`1.00` is stored as `100`) to avoid
//! floating point drift in running balances.
//!
//! # Ledger invariant
//!
//! For every subscription, `total_amount_cents` equals the sum of
//! `amount_cents` over its transactions.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod catalog;
pub mod config;
pub mod error;
pub mod ids;
pub mod ledger;

pub use catalog::{Client, Metric, Subscription, SubscriptionCharge, Topic};
pub use config::{IsolationMode, LedgerConfig};
pub use error::{LedgerError, Result};
pub use ids::{ClientId, IdError, MetricId, MetricValueId, SubscriptionId, TopicId, TransactionId};
pub use ledger::{LedgerAudit, MetricValue, Transaction, TransactionSource, Version};
