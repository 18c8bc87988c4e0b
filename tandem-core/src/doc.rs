//! Replicated text model.
//!
//! A sequence CRDT in the YATA family: every character is an item with an
//! immutable `(replica, counter)` id and the ids of the neighbours it was
//! typed between. Concurrent inserts at the same place are ordered by a
//! deterministic rule over those origins and the replica id, so merge is
//! commutative, associative and idempotent.
//!
//! ```text
//!  insert(pos, text) ──► items (replica, counter++) ──► Update
//!                                                        │
//!  merge(Update) ──► pending buffer ──► integrate ──► Vec<TextChange>
//!                    (missing deps)      (YATA)
//! ```
//!
//! Items live in an arena indexed by slot; ids map to slots through a hash
//! index and document order is kept by [`Sequence`]. Deleted characters stay
//! as tombstones so later concurrent inserts can still find their origins.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::error::EngineError;
use crate::item::{ItemId, ItemRecord, ReplicaId, SEED_REPLICA};
use crate::sequence::Sequence;
use crate::state_vector::StateVector;
use crate::update::{DeleteSet, Update};

/// A change to the visible text, in the coordinates of the text as it is
/// when the change is applied. Lists of changes apply in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextChange {
    Insert { index: usize, text: String },
    Delete { index: usize, len: usize },
}

/// One replica of a shared text document.
pub struct Doc {
    replica: ReplicaId,
    /// Arena of every item ever integrated.
    items: Vec<ItemRecord>,
    lookup: HashMap<ItemId, usize>,
    order: Sequence,
    state: StateVector,
    deletes: DeleteSet,
    /// Remote items waiting for a missing origin or predecessor.
    pending_items: BTreeMap<ItemId, ItemRecord>,
    /// Missing dependency → pending items parked on it.
    waiting: HashMap<ItemId, Vec<ItemId>>,
    /// Remote deletes targeting items not integrated yet.
    pending_deletes: DeleteSet,
}

impl Doc {
    /// Create an empty replica. `replica` must be unique among all
    /// participants and must not be [`SEED_REPLICA`].
    pub fn new(replica: ReplicaId) -> Self {
        debug_assert_ne!(replica, SEED_REPLICA, "replica id 0 is reserved for seeded content");
        Self {
            replica,
            items: Vec::new(),
            lookup: HashMap::new(),
            order: Sequence::new(),
            state: StateVector::new(),
            deletes: DeleteSet::new(),
            pending_items: BTreeMap::new(),
            waiting: HashMap::new(),
            pending_deletes: DeleteSet::new(),
        }
    }

    /// Create a replica whose initial text comes from a persisted snapshot
    /// of plain content.
    ///
    /// The seed characters get deterministic ids under [`SEED_REPLICA`], so
    /// two replicas seeded with the same content hold identical items.
    pub fn seeded(replica: ReplicaId, content: &str) -> Self {
        let mut doc = Doc::new(replica);
        let mut left = None;
        let mut scratch = ChangeLog::default();
        for (counter, ch) in content.chars().enumerate() {
            let id = ItemId::new(SEED_REPLICA, counter as u64);
            doc.integrate(
                ItemRecord { id, origin_left: left, origin_right: None, content: ch },
                false,
                &mut scratch,
            );
            left = Some(id);
        }
        doc
    }

    /// Create a replica and load a full-state update into it.
    pub fn from_update(replica: ReplicaId, update: &Update) -> Self {
        let mut doc = Doc::new(replica);
        doc.merge(update);
        doc
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// Visible length in characters.
    pub fn len(&self) -> usize {
        self.order.visible_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visible text.
    pub fn text(&self) -> String {
        self.order
            .iter()
            .filter(|slot| self.order.is_visible(*slot))
            .map(|slot| self.items[slot].content)
            .collect()
    }

    pub fn state_vector(&self) -> StateVector {
        self.state.clone()
    }

    /// Remote items buffered until their dependencies arrive.
    pub fn pending_len(&self) -> usize {
        self.pending_items.len()
    }

    /// Insert `text` before the visible character at `position`.
    pub fn insert(&mut self, position: usize, text: &str) -> Result<Update, EngineError> {
        let visible_len = self.len();
        if position > visible_len {
            return Err(EngineError::InvalidLocalOperation {
                position,
                length: 0,
                visible_len,
            });
        }
        if text.is_empty() {
            return Ok(Update::default());
        }

        let mut left = match position {
            0 => None,
            p => self.order.visible_slot(p - 1).map(|slot| self.items[slot].id),
        };
        let right_index = left.map_or(0, |id| self.index_after(id));
        let right = self
            .order
            .iter_from(right_index)
            .next()
            .map(|slot| self.items[slot].id);

        let mut records = Vec::with_capacity(text.len());
        let mut scratch = ChangeLog::default();
        for ch in text.chars() {
            let id = ItemId::new(self.replica, self.state.get(self.replica));
            let record = ItemRecord { id, origin_left: left, origin_right: right, content: ch };
            self.integrate(record.clone(), false, &mut scratch);
            records.push(record);
            left = Some(id);
        }

        log::trace!(
            "replica {} inserted {} chars at {position}",
            self.replica,
            records.len()
        );
        Ok(Update::new(records, DeleteSet::new()))
    }

    /// Tombstone `length` visible characters starting at `position`.
    pub fn delete(&mut self, position: usize, length: usize) -> Result<Update, EngineError> {
        let visible_len = self.len();
        if position.checked_add(length).is_none_or(|end| end > visible_len) {
            return Err(EngineError::InvalidLocalOperation { position, length, visible_len });
        }

        let mut targets = Vec::with_capacity(length);
        if length > 0 {
            let first = self
                .order
                .visible_slot(position)
                .map(|slot| self.order.index_of(slot))
                .unwrap_or(0);
            targets.extend(
                self.order
                    .iter_from(first)
                    .filter(|slot| self.order.is_visible(*slot))
                    .take(length),
            );
        }

        let mut deletes = DeleteSet::new();
        for slot in targets {
            self.order.hide(slot);
            let id = self.items[slot].id;
            self.deletes.insert(id);
            deletes.insert(id);
        }
        Ok(Update::new(Vec::new(), deletes))
    }

    /// Integrate a remote update and report what changed in the visible
    /// text.
    ///
    /// Items already known are ignored, so merging is idempotent. Items
    /// whose dependencies are missing are buffered and integrated once the
    /// gap is filled by a later merge.
    pub fn merge(&mut self, update: &Update) -> Vec<TextChange> {
        let mut changes = ChangeLog::default();

        let mut fresh = Vec::new();
        for record in &update.items {
            if self.state.contains(&record.id) || self.pending_items.contains_key(&record.id) {
                continue;
            }
            self.pending_items.insert(record.id, record.clone());
            fresh.push(record.id);
        }
        self.pending_deletes.merge(&update.deletes);

        self.drain_pending_items(fresh, &mut changes);
        self.drain_pending_deletes(&mut changes);

        if !self.pending_items.is_empty() {
            log::debug!(
                "replica {} buffering {} items with missing dependencies",
                self.replica,
                self.pending_items.len()
            );
        }
        changes.into_changes()
    }

    /// Everything created after `remote` plus the complete delete set.
    pub fn diff_since(&self, remote: &StateVector) -> Update {
        let mut items: Vec<ItemRecord> = self
            .items
            .iter()
            .filter(|item| !remote.contains(&item.id))
            .cloned()
            .collect();
        items.sort_by_key(|item| item.id);
        Update::new(items, self.deletes.clone())
    }

    /// The whole document as one update, for snapshots and fresh peers.
    pub fn encode_state_as_update(&self) -> Update {
        self.diff_since(&StateVector::new())
    }

    /// First dependency of `record` that is not integrated yet.
    fn missing_dependency(&self, record: &ItemRecord) -> Option<ItemId> {
        let next = self.state.get(record.id.replica);
        if record.id.counter > next {
            return Some(ItemId::new(record.id.replica, record.id.counter - 1));
        }
        [record.origin_left, record.origin_right]
            .into_iter()
            .flatten()
            .find(|id| !self.lookup.contains_key(id))
    }

    /// Queue `id` for integration, or park it on its missing dependency.
    fn schedule(&mut self, id: ItemId, ready: &mut VecDeque<ItemId>) {
        let Some(record) = self.pending_items.get(&id) else {
            return;
        };
        match self.missing_dependency(record) {
            Some(dependency) => self.waiting.entry(dependency).or_default().push(id),
            None => ready.push_back(id),
        }
    }

    /// Integrate every pending item whose dependencies are now present.
    ///
    /// Each pending item is parked on one missing dependency at a time and
    /// only re-examined when that dependency integrates, so a catch-up is
    /// linear in the number of items however the replicas interleave.
    fn drain_pending_items(&mut self, fresh: Vec<ItemId>, changes: &mut ChangeLog) {
        let mut ready = VecDeque::new();
        for id in fresh {
            self.schedule(id, &mut ready);
        }
        while let Some(id) = ready.pop_front() {
            let Some(record) = self.pending_items.remove(&id) else {
                continue;
            };
            let tombstoned = self.pending_deletes.contains(&record.id);
            self.integrate(record, tombstoned, changes);
            if let Some(dependents) = self.waiting.remove(&id) {
                for dependent in dependents {
                    self.schedule(dependent, &mut ready);
                }
            }
        }
    }

    fn drain_pending_deletes(&mut self, changes: &mut ChangeLog) {
        if self.pending_deletes.is_empty() {
            return;
        }
        let mut still_pending = DeleteSet::new();
        let ranges: Vec<_> = self.pending_deletes.iter_ranges().collect();
        for (replica, start, len) in ranges {
            let end = start + len;
            // Counters below the state vector are all integrated
            let known_end = end.min(self.state.get(replica)).max(start);
            for counter in start..known_end {
                let id = ItemId::new(replica, counter);
                if let Some(&slot) = self.lookup.get(&id) {
                    self.tombstone(slot, changes);
                }
            }
            still_pending.insert_range(replica, known_end, end - known_end);
        }
        self.pending_deletes = still_pending;
    }

    fn tombstone(&mut self, slot: usize, changes: &mut ChangeLog) {
        let id = self.items[slot].id;
        self.deletes.insert(id);
        if !self.order.is_visible(slot) {
            return;
        }
        let index = self.order.visible_before(self.order.index_of(slot));
        self.order.hide(slot);
        changes.delete(index);
    }

    /// Absolute index just past the item `id`, or 0 if it is unknown.
    fn index_after(&self, id: ItemId) -> usize {
        self.lookup
            .get(&id)
            .map_or(0, |slot| self.order.index_of(*slot) + 1)
    }

    /// Place one item whose dependencies are all present.
    fn integrate(&mut self, record: ItemRecord, tombstoned: bool, changes: &mut ChangeLog) {
        let start = record.origin_left.map_or(0, |id| self.index_after(id));
        let right_index = record
            .origin_right
            .and_then(|id| self.lookup.get(&id))
            .map_or(self.order.len(), |slot| self.order.index_of(*slot));

        // Walk the items between the origins and skip past every one that
        // must precede the new item in the total order.
        let mut dest = start;
        let mut before_origin = HashSet::new();
        let mut conflicting = HashSet::new();
        for (offset, slot) in self
            .order
            .iter_from(start)
            .take(right_index.saturating_sub(start))
            .enumerate()
        {
            let other = &self.items[slot];
            before_origin.insert(other.id);
            conflicting.insert(other.id);

            if other.origin_left == record.origin_left {
                if other.id.replica < record.id.replica {
                    dest = start + offset + 1;
                    conflicting.clear();
                } else if other.origin_right == record.origin_right {
                    break;
                }
            } else if let Some(origin) = other.origin_left.filter(|o| before_origin.contains(o)) {
                if !conflicting.contains(&origin) {
                    dest = start + offset + 1;
                    conflicting.clear();
                }
            } else {
                break;
            }
        }

        let slot = self.items.len();
        let id = record.id;
        let content = record.content;
        self.lookup.insert(id, slot);
        self.items.push(record);
        self.order.insert(dest, slot, !tombstoned);
        self.state.advance(id.replica, id.counter + 1);

        if tombstoned {
            self.deletes.insert(id);
            return;
        }
        let index = self.order.visible_before(dest);
        changes.insert(index, content);
    }
}

/// Visible changes of one merge, with adjacent runs coalesced.
#[derive(Default)]
struct ChangeLog {
    changes: Vec<TextChange>,
    /// Length in chars of the trailing insert.
    tail_chars: usize,
}

impl ChangeLog {
    fn insert(&mut self, index: usize, ch: char) {
        if let Some(TextChange::Insert { index: at, text }) = self.changes.last_mut() {
            if *at + self.tail_chars == index {
                text.push(ch);
                self.tail_chars += 1;
                return;
            }
        }
        self.changes.push(TextChange::Insert { index, text: ch.to_string() });
        self.tail_chars = 1;
    }

    fn delete(&mut self, index: usize) {
        match self.changes.last_mut() {
            Some(TextChange::Delete { index: at, len }) if *at == index => *len += 1,
            _ => self.changes.push(TextChange::Delete { index, len: 1 }),
        }
    }

    fn into_changes(self) -> Vec<TextChange> {
        self.changes
    }
}

impl std::fmt::Debug for Doc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Doc")
            .field("replica", &self.replica)
            .field("len", &self.len())
            .field("items", &self.items.len())
            .field("state", &self.state)
            .field("pending", &self.pending_items.len())
            .finish()
    }
}
