use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::encoding::{write_var_u64, Reader};
use crate::error::EngineError;
use crate::item::{ItemId, ReplicaId};

/// Per-replica high-water marks.
///
/// Each entry is the number of items integrated from that replica, i.e. the
/// exclusive upper bound of its contiguous counters. A replica that typed
/// "hello" starting at counter 0 has entry 5.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector {
    clocks: BTreeMap<ReplicaId, u64>,
}

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next counter expected from `replica`.
    pub fn get(&self, replica: ReplicaId) -> u64 {
        self.clocks.get(&replica).copied().unwrap_or(0)
    }

    /// Raise the mark for `replica`. Never lowers it.
    pub fn advance(&mut self, replica: ReplicaId, clock: u64) {
        let entry = self.clocks.entry(replica).or_insert(0);
        if clock > *entry {
            *entry = clock;
        }
    }

    /// Whether the item with this id is covered by the vector.
    pub fn contains(&self, id: &ItemId) -> bool {
        id.counter < self.get(id.replica)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ReplicaId, u64)> + '_ {
        self.clocks.iter().map(|(r, c)| (*r, *c))
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.values().all(|c| *c == 0)
    }

    /// True when every entry of `other` is covered by `self`.
    pub fn dominates(&self, other: &StateVector) -> bool {
        other.iter().all(|(replica, clock)| self.get(replica) >= clock)
    }

    /// Wire form: `[varint count] ([varint replica] [varint clock])*`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + self.clocks.len() * 4);
        write_var_u64(&mut buf, self.clocks.len() as u64);
        for (replica, clock) in &self.clocks {
            write_var_u64(&mut buf, *replica);
            write_var_u64(&mut buf, *clock);
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EngineError> {
        let mut reader = Reader::new(bytes);
        let count = reader.read_len(2)?;
        let mut sv = StateVector::new();
        for _ in 0..count {
            let replica = reader.read_var_u64()?;
            let clock = reader.read_var_u64()?;
            sv.advance(replica, clock);
        }
        if !reader.is_empty() {
            return Err(EngineError::CorruptUpdate(format!(
                "{} trailing bytes after state vector",
                reader.remaining()
            )));
        }
        Ok(sv)
    }
}

impl FromIterator<(ReplicaId, u64)> for StateVector {
    fn from_iter<T: IntoIterator<Item = (ReplicaId, u64)>>(iter: T) -> Self {
        let mut sv = StateVector::new();
        for (replica, clock) in iter {
            sv.advance(replica, clock);
        }
        sv
    }
}
