//! Key encoding utilities for `RocksDB`.
//!
//! Index keys are two 16 byte identifiers concatenated, so a prefix scan on
//! the first identifier yields every entry for it, ordered by the second.

use metric_ledger_core::{MetricId, MetricValueId, SubscriptionId, TopicId, TransactionId};

/// Length of a two-part index key.
pub const COMPOSITE_KEY_LEN: usize = 32;

/// Concatenate two 16 byte identifiers.
#[must_use]
pub fn composite_key(left: &[u8; 16], right: &[u8; 16]) -> Vec<u8> {
    let mut key = Vec::with_capacity(COMPOSITE_KEY_LEN);
    key.extend_from_slice(left);
    key.extend_from_slice(right);
    key
}

/// Create a subscription key.
#[must_use]
pub fn subscription_key(subscription_id: &SubscriptionId) -> Vec<u8> {
    subscription_id.as_bytes().to_vec()
}

/// Create a topic-subscription index key.
#[must_use]
pub fn topic_subscription_key(topic_id: &TopicId, subscription_id: &SubscriptionId) -> Vec<u8> {
    composite_key(topic_id.as_bytes(), subscription_id.as_bytes())
}

/// Create a transaction key.
#[must_use]
pub fn transaction_key(transaction_id: &TransactionId) -> Vec<u8> {
    transaction_id.to_bytes().to_vec()
}

/// Create a subscription-transaction index key.
///
/// Since ULIDs are time-ordered, transactions for a subscription sort by time.
#[must_use]
pub fn subscription_transaction_key(
    subscription_id: &SubscriptionId,
    transaction_id: &TransactionId,
) -> Vec<u8> {
    composite_key(subscription_id.as_bytes(), &transaction_id.to_bytes())
}

/// Create a metric value key.
#[must_use]
pub fn metric_value_key(metric_id: &MetricId, value_id: &MetricValueId) -> Vec<u8> {
    composite_key(metric_id.as_bytes(), &value_id.to_bytes())
}

/// The trailing identifier of a two-part index key.
///
/// Returns `None` if the key is not exactly [`COMPOSITE_KEY_LEN`] bytes.
#[must_use]
pub fn suffix_of(key: &[u8]) -> Option<[u8; 16]> {
    if key.len() != COMPOSITE_KEY_LEN {
        return None;
    }
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&key[16..]);
    Some(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_transaction_key_format() {
        let sub = SubscriptionId::generate();
        let tx = TransactionId::generate();
        let key = subscription_transaction_key(&sub, &tx);

        assert_eq!(key.len(), COMPOSITE_KEY_LEN);
        assert_eq!(&key[..16], sub.as_bytes());
        assert_eq!(suffix_of(&key), Some(tx.to_bytes()));
    }

    #[test]
    fn suffix_rejects_short_keys() {
        let sub = SubscriptionId::generate();
        assert_eq!(suffix_of(&subscription_key(&sub)), None);
    }
}
