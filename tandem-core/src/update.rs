//! Update records and their binary encoding.
//!
//! Wire format (all integers LEB128 varints unless noted):
//! ```text
//! ┌─────────┬─────────────┬──────────────────────────┬────────────────────┐
//! │ version │ block count │ blocks                   │ delete set         │
//! │ 1 byte  │ varint      │ see below                │ see below          │
//! └─────────┴─────────────┴──────────────────────────┴────────────────────┘
//!
//! block      = replica, start counter, flags (1 byte),
//!              [left origin replica, counter]  if flags & 0x01
//!              [right origin replica, counter] if flags & 0x02
//!              byte length, utf-8 text
//! delete set = replica count, (replica, range count, (start, len)*)*
//! ```
//!
//! A block holds a run of characters typed left to right by one replica:
//! character `i > 0` has the previous character as its left origin and
//! shares the block's right origin. Sequential typing therefore costs one
//! block regardless of length.

use std::collections::BTreeMap;

use crate::encoding::{write_bytes, write_var_u64, Reader};
use crate::error::EngineError;
use crate::item::{ItemId, ItemRecord, ReplicaId};
use crate::state_vector::StateVector;

/// Current encoding version. Decoders reject anything else.
pub const UPDATE_VERSION: u8 = 1;

const FLAG_LEFT: u8 = 0x01;
const FLAG_RIGHT: u8 = 0x02;

/// Tombstoned id ranges, normalized per replica (sorted, non-adjacent).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteSet {
    ranges: BTreeMap<ReplicaId, Vec<(u64, u64)>>,
}

impl DeleteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ItemId) {
        self.insert_range(id.replica, id.counter, 1);
    }

    /// Add `len` ids starting at `start`, coalescing with existing ranges.
    pub fn insert_range(&mut self, replica: ReplicaId, start: u64, len: u64) {
        if len == 0 {
            return;
        }
        let ranges = self.ranges.entry(replica).or_default();
        let mut lo = start;
        let mut hi = start.saturating_add(len);

        let first = ranges.partition_point(|(s, l)| s + l < lo);
        let mut last = first;
        while last < ranges.len() && ranges[last].0 <= hi {
            lo = lo.min(ranges[last].0);
            hi = hi.max(ranges[last].0 + ranges[last].1);
            last += 1;
        }
        ranges.splice(first..last, [(lo, hi - lo)]);
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.ranges.get(&id.replica).is_some_and(|ranges| {
            let idx = ranges.partition_point(|(s, _)| *s <= id.counter);
            idx > 0 && {
                let (s, l) = ranges[idx - 1];
                id.counter < s + l
            }
        })
    }

    pub fn merge(&mut self, other: &DeleteSet) {
        for (replica, ranges) in &other.ranges {
            for (start, len) in ranges {
                self.insert_range(*replica, *start, *len);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.values().all(|r| r.is_empty())
    }

    /// Number of ids covered.
    pub fn len(&self) -> u64 {
        self.ranges.values().flatten().map(|(_, l)| *l).sum()
    }

    /// `(replica, start, len)` for every stored range.
    pub fn iter_ranges(&self) -> impl Iterator<Item = (ReplicaId, u64, u64)> + '_ {
        self.ranges
            .iter()
            .flat_map(|(replica, ranges)| ranges.iter().map(move |(s, l)| (*replica, *s, *l)))
    }

    /// Every id in the set, replica by replica in counter order.
    pub fn ids(&self) -> impl Iterator<Item = ItemId> + '_ {
        self.ranges.iter().flat_map(|(replica, ranges)| {
            ranges
                .iter()
                .flat_map(move |(start, len)| (*start..start + len).map(move |c| ItemId::new(*replica, c)))
        })
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        let replicas: Vec<_> = self.ranges.iter().filter(|(_, r)| !r.is_empty()).collect();
        write_var_u64(buf, replicas.len() as u64);
        for (replica, ranges) in replicas {
            write_var_u64(buf, *replica);
            write_var_u64(buf, ranges.len() as u64);
            for (start, len) in ranges {
                write_var_u64(buf, *start);
                write_var_u64(buf, *len);
            }
        }
    }

    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, EngineError> {
        let mut ds = DeleteSet::new();
        let replicas = reader.read_len(2)?;
        for _ in 0..replicas {
            let replica = reader.read_var_u64()?;
            let count = reader.read_len(2)?;
            for _ in 0..count {
                let start = reader.read_var_u64()?;
                let len = reader.read_var_u64()?;
                if start.checked_add(len).is_none() {
                    return Err(EngineError::CorruptUpdate(format!(
                        "delete range {start}+{len} overflows"
                    )));
                }
                ds.insert_range(replica, start, len);
            }
        }
        Ok(ds)
    }
}

/// An immutable delta between two document states.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Update {
    pub(crate) items: Vec<ItemRecord>,
    pub(crate) deletes: DeleteSet,
}

impl Update {
    pub fn new(items: Vec<ItemRecord>, deletes: DeleteSet) -> Self {
        Self { items, deletes }
    }

    pub fn items(&self) -> &[ItemRecord] {
        &self.items
    }

    pub fn deletes(&self) -> &DeleteSet {
        &self.deletes
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.deletes.is_empty()
    }

    /// Number of created items carried.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Exclusive upper counter per replica over the created items.
    pub fn upper_bounds(&self) -> StateVector {
        self.items
            .iter()
            .map(|item| (item.id.replica, item.id.counter + 1))
            .collect()
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.items.len() * 2);
        buf.push(UPDATE_VERSION);

        let blocks = self.blocks();
        write_var_u64(&mut buf, blocks.len() as u64);
        let mut text = String::new();
        for block in blocks {
            let head = &self.items[block.start];
            write_var_u64(&mut buf, head.id.replica);
            write_var_u64(&mut buf, head.id.counter);

            let mut flags = 0;
            if head.origin_left.is_some() {
                flags |= FLAG_LEFT;
            }
            if head.origin_right.is_some() {
                flags |= FLAG_RIGHT;
            }
            buf.push(flags);
            for origin in [head.origin_left, head.origin_right].into_iter().flatten() {
                write_var_u64(&mut buf, origin.replica);
                write_var_u64(&mut buf, origin.counter);
            }

            text.clear();
            text.extend(self.items[block.start..block.end].iter().map(|i| i.content));
            write_bytes(&mut buf, text.as_bytes());
        }

        self.deletes.encode_into(&mut buf);
        buf
    }

    /// Parse the binary wire format.
    ///
    /// Fails with [`EngineError::CorruptUpdate`] on any malformed input;
    /// never panics and never allocates more than the input can justify.
    pub fn decode(bytes: &[u8]) -> Result<Self, EngineError> {
        let mut reader = Reader::new(bytes);
        let version = reader.read_u8()?;
        if version != UPDATE_VERSION {
            return Err(EngineError::CorruptUpdate(format!(
                "unsupported update version {version}"
            )));
        }

        // Smallest block: replica, counter, flags, length, one byte of text
        let block_count = reader.read_len(5)?;
        let mut items = Vec::new();
        for _ in 0..block_count {
            let replica = reader.read_var_u64()?;
            let start = reader.read_var_u64()?;
            let flags = reader.read_u8()?;
            if flags & !(FLAG_LEFT | FLAG_RIGHT) != 0 {
                return Err(EngineError::CorruptUpdate(format!("unknown block flags {flags:#04x}")));
            }
            let origin_left = if flags & FLAG_LEFT != 0 {
                Some(ItemId::new(reader.read_var_u64()?, reader.read_var_u64()?))
            } else {
                None
            };
            let origin_right = if flags & FLAG_RIGHT != 0 {
                Some(ItemId::new(reader.read_var_u64()?, reader.read_var_u64()?))
            } else {
                None
            };

            let text = reader.read_str()?;
            if text.is_empty() {
                return Err(EngineError::CorruptUpdate("empty block".into()));
            }
            let char_count = text.chars().count() as u64;
            if start.checked_add(char_count).is_none() {
                return Err(EngineError::CorruptUpdate(format!(
                    "block {replica}:{start} overflows counter space"
                )));
            }

            let mut left = origin_left;
            for (offset, content) in text.chars().enumerate() {
                let id = ItemId::new(replica, start + offset as u64);
                items.push(ItemRecord { id, origin_left: left, origin_right, content });
                left = Some(id);
            }
        }

        let deletes = DeleteSet::decode_from(&mut reader)?;
        if !reader.is_empty() {
            return Err(EngineError::CorruptUpdate(format!(
                "{} trailing bytes after update",
                reader.remaining()
            )));
        }
        Ok(Update { items, deletes })
    }

    /// Split `items` into maximal runs that encode as one block.
    fn blocks(&self) -> Vec<std::ops::Range<usize>> {
        let mut blocks: Vec<std::ops::Range<usize>> = Vec::new();
        for (idx, item) in self.items.iter().enumerate() {
            if let Some(block) = blocks.last_mut() {
                let prev = &self.items[idx - 1];
                let head = &self.items[block.start];
                let continues = item.id.replica == prev.id.replica
                    && Some(item.id.counter) == prev.id.counter.checked_add(1)
                    && item.origin_left == Some(prev.id)
                    && item.origin_right == head.origin_right;
                if continues {
                    block.end = idx + 1;
                    continue;
                }
            }
            blocks.push(idx..idx + 1);
        }
        blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn typed(replica: ReplicaId, start: u64, text: &str, right: Option<ItemId>) -> Vec<ItemRecord> {
        let mut left = None;
        text.chars()
            .enumerate()
            .map(|(i, content)| {
                let id = ItemId::new(replica, start + i as u64);
                let record = ItemRecord { id, origin_left: left, origin_right: right, content };
                left = Some(id);
                record
            })
            .collect()
    }

    #[test]
    fn test_sequential_typing_is_one_block() {
        let update = Update::new(typed(3, 0, "hello world", None), DeleteSet::new());
        assert_eq!(update.blocks().len(), 1);
        // version + count + replica + counter + flags + len + 11 bytes + empty delete set
        assert_eq!(update.encode().len(), 1 + 1 + 1 + 1 + 1 + 1 + 11 + 1);
    }

    #[test]
    fn test_encode_decode_preserves_origins() {
        let mut items = typed(1, 0, "ab", Some(ItemId::new(9, 4)));
        items.extend(typed(2, 7, "é", None));
        let mut deletes = DeleteSet::new();
        deletes.insert_range(1, 0, 1);
        deletes.insert(ItemId::new(9, 4));
        let update = Update::new(items, deletes);

        let decoded = Update::decode(&update.encode()).unwrap();
        assert_eq!(decoded, update);
        assert_eq!(decoded.items()[2].content, 'é');
        assert_eq!(decoded.items()[1].origin_left, Some(ItemId::new(1, 0)));
    }

    #[test]
    fn test_non_contiguous_items_split_blocks() {
        let mut items = typed(1, 0, "a", None);
        items.extend(typed(1, 5, "b", None));
        let update = Update::new(items, DeleteSet::new());
        assert_eq!(update.blocks().len(), 2);
        assert_eq!(Update::decode(&update.encode()).unwrap(), update);
    }

    #[test]
    fn test_decode_truncated_input() {
        let update = Update::new(typed(1, 0, "hello", None), DeleteSet::new());
        let bytes = update.encode();
        for cut in 0..bytes.len() {
            assert!(
                matches!(Update::decode(&bytes[..cut]), Err(EngineError::CorruptUpdate(_))),
                "prefix of length {cut} should be rejected"
            );
        }
    }

    #[test]
    fn test_decode_rejects_bad_version_and_flags() {
        assert!(Update::decode(&[2, 0, 0]).is_err());
        // one block with an unknown flag bit
        assert!(Update::decode(&[1, 1, 1, 0, 0x80, 1, b'a', 0]).is_err());
    }

    #[test]
    fn test_decode_rejects_oversized_counts() {
        // Claims u32::MAX blocks in a 7-byte buffer
        let mut bytes = vec![UPDATE_VERSION];
        write_var_u64(&mut bytes, u32::MAX as u64);
        bytes.push(0);
        assert!(Update::decode(&bytes).is_err());
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut bytes = Update::default().encode();
        bytes.push(0);
        assert!(Update::decode(&bytes).is_err());
    }

    #[test]
    fn test_decode_garbage_never_panics() {
        let mut seed: u32 = 0x1234_5678;
        for len in 0..200 {
            let bytes: Vec<u8> = (0..len)
                .map(|_| {
                    seed ^= seed << 13;
                    seed ^= seed >> 17;
                    seed ^= seed << 5;
                    seed as u8
                })
                .collect();
            let _ = Update::decode(&bytes);
        }
    }

    #[test]
    fn test_delete_set_coalesces() {
        let mut ds = DeleteSet::new();
        ds.insert(ItemId::new(1, 3));
        ds.insert(ItemId::new(1, 5));
        ds.insert(ItemId::new(1, 4));
        ds.insert_range(1, 10, 2);
        assert_eq!(ds.ranges[&1], vec![(3, 3), (10, 2)]);
        assert_eq!(ds.len(), 5);
        assert!(ds.contains(&ItemId::new(1, 5)));
        assert!(!ds.contains(&ItemId::new(1, 6)));
        assert!(!ds.contains(&ItemId::new(2, 3)));
    }

    #[test]
    fn test_delete_set_merge_and_ids() {
        let mut a = DeleteSet::new();
        a.insert_range(1, 0, 2);
        let mut b = DeleteSet::new();
        b.insert_range(1, 1, 3);
        b.insert(ItemId::new(2, 0));
        a.merge(&b);
        let ids: Vec<_> = a.ids().collect();
        assert_eq!(
            ids,
            vec![
                ItemId::new(1, 0),
                ItemId::new(1, 1),
                ItemId::new(1, 2),
                ItemId::new(1, 3),
                ItemId::new(2, 0)
            ]
        );
    }

    #[test]
    fn test_upper_bounds() {
        let mut items = typed(1, 0, "abc", None);
        items.extend(typed(2, 4, "d", None));
        let sv = Update::new(items, DeleteSet::new()).upper_bounds();
        assert_eq!(sv.get(1), 3);
        assert_eq!(sv.get(2), 5);
    }
}
