//! Request and response types for the subscription aggregate contract.

use metric_ledger_core::{IsolationMode, SubscriptionId, Transaction, Version};

/// A consistent view of a subscription balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateSnapshot {
    /// Balance in cents.
    pub total_amount_cents: i64,

    /// Version the balance was read at.
    pub version: Version,
}

/// What a balance write checks before committing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionCheck {
    /// Commit only if the aggregate is still at this version.
    Expect(Version),

    /// Commit regardless of interim writes (lost-update prone).
    Unchecked,
}

impl VersionCheck {
    /// The check a write in `mode` performs against a value read at `version`.
    #[must_use]
    pub const fn for_mode(mode: IsolationMode, version: Version) -> Self {
        match mode {
            IsolationMode::Optimistic => Self::Expect(version),
            IsolationMode::Unchecked => Self::Unchecked,
        }
    }

    /// Whether a stored `current` version passes this check.
    #[must_use]
    pub fn admits(&self, current: Version) -> bool {
        match self {
            Self::Expect(expected) => *expected == current,
            Self::Unchecked => true,
        }
    }
}

/// A balance write paired with its ledger entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateWrite {
    /// Target subscription.
    pub subscription_id: SubscriptionId,

    /// Version check to perform.
    pub check: VersionCheck,

    /// Balance to store on commit.
    pub new_total_cents: i64,

    /// Ledger entry appended on commit.
    pub transaction: Transaction,
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Balance and ledger entry are both durable.
    Committed {
        /// Version after the write.
        version: Version,
    },

    /// Another writer committed first; nothing was written.
    ConflictAborted {
        /// Version found in the store.
        current: Version,
    },
}

impl WriteOutcome {
    /// Whether the write committed.
    #[must_use]
    pub const fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optimistic_check_admits_only_the_read_version() {
        let check = VersionCheck::for_mode(IsolationMode::Optimistic, Version::new(3));
        assert!(check.admits(Version::new(3)));
        assert!(!check.admits(Version::new(4)));
    }

    #[test]
    fn unchecked_admits_anything() {
        let check = VersionCheck::for_mode(IsolationMode::Unchecked, Version::new(3));
        assert_eq!(check, VersionCheck::Unchecked);
        assert!(check.admits(Version::new(99)));
    }
}
