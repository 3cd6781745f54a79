//! Database schema definitions.
//!
//! Column families for the `RocksDB` backend and table names for the
//! `PostgreSQL` backend.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Client records, keyed by `client_id`.
    pub const CLIENTS: &str = "clients";

    /// Topic records, keyed by `topic_id`.
    pub const TOPICS: &str = "topics";

    /// Metric records, keyed by `metric_id`.
    pub const METRICS: &str = "metrics";

    /// Subscription records (balance and version included), keyed by `subscription_id`.
    pub const SUBSCRIPTIONS: &str = "subscriptions";

    /// Index: subscriptions by topic, keyed by `topic_id || subscription_id`.
    /// Value is empty (index only).
    pub const SUBSCRIPTIONS_BY_TOPIC: &str = "subscriptions_by_topic";

    /// Ledger transactions, keyed by `transaction_id` (ULID).
    pub const TRANSACTIONS: &str = "transactions";

    /// Index: transactions by subscription, keyed by `subscription_id || transaction_id`.
    /// Value is empty (index only).
    pub const TRANSACTIONS_BY_SUBSCRIPTION: &str = "transactions_by_subscription";

    /// Metric observations, keyed by `metric_id || metric_value_id`.
    pub const METRIC_VALUES: &str = "metric_values";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::CLIENTS,
        cf::TOPICS,
        cf::METRICS,
        cf::SUBSCRIPTIONS,
        cf::SUBSCRIPTIONS_BY_TOPIC,
        cf::TRANSACTIONS,
        cf::TRANSACTIONS_BY_SUBSCRIPTION,
        cf::METRIC_VALUES,
    ]
}

/// Table names for the `PostgreSQL` database.
pub mod table {
    /// Clients.
    pub const CLIENT: &str = "client";

    /// Topics.
    pub const TOPIC: &str = "topic";

    /// Metrics with their `topic_ids` array.
    pub const METRIC: &str = "metric";

    /// Subscriptions with `total_amount_cents` and `version`.
    pub const SUBSCRIPTION: &str = "subscription";

    /// Append-only ledger.
    pub const TRANSACTION: &str = "ledger_transaction";

    /// Metric observations.
    pub const METRIC_VALUE: &str = "metric_value";
}
