//! Character items: the unit of replication.

use serde::{Deserialize, Serialize};

/// Identifies a replica (one editing participant's copy of a document).
pub type ReplicaId = u64;

/// Reserved replica that owns the characters of a seeded document.
///
/// Every replica seeding the same content produces identical items under
/// this id, so independently seeded copies merge without duplication.
pub const SEED_REPLICA: ReplicaId = 0;

/// Globally unique, immutable identifier of a character item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId {
    pub replica: ReplicaId,
    pub counter: u64,
}

impl ItemId {
    pub const fn new(replica: ReplicaId, counter: u64) -> Self {
        Self { replica, counter }
    }

    /// The id allocated just before this one by the same replica.
    pub fn predecessor(&self) -> Option<ItemId> {
        self.counter
            .checked_sub(1)
            .map(|counter| ItemId::new(self.replica, counter))
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.replica, self.counter)
    }
}

/// A character as it travels inside an update.
///
/// `origin_left` / `origin_right` are the neighbours the character was
/// inserted between on the replica that created it. They never change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemRecord {
    pub id: ItemId,
    pub origin_left: Option<ItemId>,
    pub origin_right: Option<ItemId>,
    pub content: char,
}
