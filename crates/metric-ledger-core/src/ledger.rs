//! Ledger records: transactions, metric observations and aggregate versions.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{MetricId, MetricValueId, SubscriptionId, TransactionId};

/// Opaque version of a subscription aggregate.
///
/// Every committed balance write produces the next version. Two reads that
/// return the same version observed the same committed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    /// Version of a freshly created aggregate.
    pub const INITIAL: Self = Self(0);

    /// Wrap a raw version number.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw version number.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The version a successful write produces.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Where a ledger transaction came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransactionSource {
    /// Charge for a metric observation.
    Metric {
        /// The observed metric.
        metric_id: MetricId,
    },

    /// Opening balance recorded when the subscription was created.
    Opening,
}

/// An append-only ledger entry against a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction identifier (ULID for time-ordering).
    pub id: TransactionId,

    /// The charged subscription.
    pub subscription_id: SubscriptionId,

    /// What caused the charge.
    pub source: TransactionSource,

    /// Amount in cents; the subscription's pricing at the time of charge.
    pub amount_cents: i64,

    /// When the charge was made (the observation time for metric charges).
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// Create a charge for a metric observation.
    #[must_use]
    pub fn metric_charge(
        subscription_id: SubscriptionId,
        metric_id: MetricId,
        amount_cents: i64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TransactionId::generate(),
            subscription_id,
            source: TransactionSource::Metric { metric_id },
            amount_cents,
            created_at,
        }
    }

    /// Create the opening entry for a subscription seeded with a balance.
    #[must_use]
    pub fn opening(subscription_id: SubscriptionId, amount_cents: i64) -> Self {
        Self {
            id: TransactionId::generate(),
            subscription_id,
            source: TransactionSource::Opening,
            amount_cents,
            created_at: Utc::now(),
        }
    }

    /// The metric this transaction charged for, if any.
    #[must_use]
    pub fn metric_id(&self) -> Option<MetricId> {
        match self.source {
            TransactionSource::Metric { metric_id } => Some(metric_id),
            TransactionSource::Opening => None,
        }
    }
}

/// A single metric observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    /// Observation identifier.
    pub id: MetricValueId,

    /// The observed metric.
    pub metric_id: MetricId,

    /// Observed value.
    pub value: f64,

    /// When the value was calculated.
    pub calculated_on: DateTime<Utc>,
}

impl MetricValue {
    /// Create a new observation.
    #[must_use]
    pub fn new(metric_id: MetricId, value: f64, calculated_on: DateTime<Utc>) -> Self {
        Self {
            id: MetricValueId::generate(),
            metric_id,
            value,
            calculated_on,
        }
    }
}

/// Result of checking a subscription's balance against its ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAudit {
    /// Audited subscription.
    pub subscription_id: SubscriptionId,

    /// Stored running balance.
    pub total_amount_cents: i64,

    /// Sum of all transactions for the subscription.
    pub ledger_sum_cents: i64,

    /// Number of transactions for the subscription.
    pub transaction_count: usize,
}

impl LedgerAudit {
    /// Build an audit from a balance and its transactions.
    #[must_use]
    pub fn new(
        subscription_id: SubscriptionId,
        total_amount_cents: i64,
        transactions: &[Transaction],
    ) -> Self {
        Self {
            subscription_id,
            total_amount_cents,
            ledger_sum_cents: transactions.iter().map(|t| t.amount_cents).sum(),
            transaction_count: transactions.len(),
        }
    }

    /// Whether the balance equals the ledger sum.
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        self.total_amount_cents == self.ledger_sum_cents
    }
}
