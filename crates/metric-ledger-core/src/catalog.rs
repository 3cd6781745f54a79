//! Catalog entities: clients, topics, metrics and subscriptions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ClientId, MetricId, SubscriptionId, TopicId, Version};

/// A paying client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    /// Client identifier.
    pub id: ClientId,

    /// Display name.
    pub name: String,

    /// When the client was registered.
    pub created_at: DateTime<Utc>,
}

impl Client {
    /// Create a new client with a generated id.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ClientId::generate(),
            name: name.into(),
            created_at: Utc::now(),
        }
    }
}

/// A topic that subscriptions and metrics are bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    /// Topic identifier.
    pub id: TopicId,

    /// Display name.
    pub name: String,
}

impl Topic {
    /// Create a new topic with a generated id.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: TopicId::generate(),
            name: name.into(),
        }
    }
}

/// A metric whose observations are billed to every subscription on one of
/// its topics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metric {
    /// Metric identifier.
    pub id: MetricId,

    /// Display name.
    pub name: String,

    /// Topics this metric is associated with.
    pub topic_ids: Vec<TopicId>,
}

impl Metric {
    /// Create a new metric bound to the given topics.
    #[must_use]
    pub fn new(name: impl Into<String>, topic_ids: Vec<TopicId>) -> Self {
        Self {
            id: MetricId::generate(),
            name: name.into(),
            topic_ids,
        }
    }
}

/// A client's subscription to a topic.
///
/// `total_amount_cents` is the running amount charged so far. It is only ever
/// changed by a conditional write that appends a matching [`Transaction`],
/// and every committed write bumps `version`.
///
/// [`Transaction`]: crate::Transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Subscription identifier.
    pub id: SubscriptionId,

    /// The owning client.
    pub client_id: ClientId,

    /// The subscribed topic.
    pub topic_id: TopicId,

    /// Running balance in cents.
    pub total_amount_cents: i64,

    /// Amount in cents charged per qualifying metric observation.
    pub single_metric_pricing_cents: i64,

    /// Aggregate version, bumped on every committed balance write.
    pub version: Version,

    /// When the subscription was created.
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    /// Create a new subscription with a zero balance.
    #[must_use]
    pub fn new(client_id: ClientId, topic_id: TopicId, single_metric_pricing_cents: i64) -> Self {
        Self {
            id: SubscriptionId::generate(),
            client_id,
            topic_id,
            total_amount_cents: 0,
            single_metric_pricing_cents,
            version: Version::INITIAL,
            created_at: Utc::now(),
        }
    }

    /// Set the opening balance.
    ///
    /// Stores record the opening balance as an opening transaction so the
    /// ledger invariant holds from the start.
    #[must_use]
    pub fn with_opening_balance(mut self, total_amount_cents: i64) -> Self {
        self.total_amount_cents = total_amount_cents;
        self
    }

    /// Use a specific id instead of a generated one.
    #[must_use]
    pub fn with_id(mut self, id: SubscriptionId) -> Self {
        self.id = id;
        self
    }

    /// The charge a metric observation makes against this subscription.
    #[must_use]
    pub fn charge(&self) -> SubscriptionCharge {
        SubscriptionCharge {
            subscription_id: self.id,
            pricing_cents: self.single_metric_pricing_cents,
        }
    }
}

/// The slice of a subscription the ingestion fan-out needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionCharge {
    /// Subscription to charge.
    pub subscription_id: SubscriptionId,

    /// Amount in cents to charge per observation.
    pub pricing_cents: i64,
}
