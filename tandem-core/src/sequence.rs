//! Chunked order index over the item arena.
//!
//! The document order (tombstones included) is a list of arena slots split
//! into chunks of bounded size. Each chunk caches how many of its slots are
//! visible, so positional lookups skip whole chunks instead of rescanning
//! every character.

/// Chunks split in half once they grow past this many slots.
const CHUNK_CAPACITY: usize = 128;

#[derive(Debug)]
struct Chunk {
    id: u32,
    slots: Vec<usize>,
    visible: usize,
}

/// Document order plus tombstone flags, indexed by arena slot.
#[derive(Debug, Default)]
pub(crate) struct Sequence {
    chunks: Vec<Chunk>,
    /// Arena slot -> id of the chunk that holds it.
    slot_chunk: Vec<u32>,
    /// Arena slot -> not tombstoned.
    slot_visible: Vec<bool>,
    next_chunk_id: u32,
    visible: usize,
}

impl Sequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of slots, tombstones included.
    pub fn len(&self) -> usize {
        self.slot_chunk.len()
    }

    pub fn visible_len(&self) -> usize {
        self.visible
    }

    pub fn is_visible(&self, slot: usize) -> bool {
        self.slot_visible[slot]
    }

    fn chunk_position(&self, chunk_id: u32) -> usize {
        self.chunks
            .iter()
            .position(|c| c.id == chunk_id)
            .unwrap_or_else(|| unreachable!("slot maps to missing chunk {chunk_id}"))
    }

    /// Absolute index of an arena slot in document order.
    pub fn index_of(&self, slot: usize) -> usize {
        let ci = self.chunk_position(self.slot_chunk[slot]);
        let before: usize = self.chunks[..ci].iter().map(|c| c.slots.len()).sum();
        let offset = self.chunks[ci]
            .slots
            .iter()
            .position(|s| *s == slot)
            .unwrap_or_else(|| unreachable!("slot {slot} missing from its chunk"));
        before + offset
    }

    /// Slots in document order, starting at absolute index `start`.
    pub fn iter_from(&self, start: usize) -> impl Iterator<Item = usize> + '_ {
        let mut skip = start;
        let mut first = self.chunks.len();
        for (ci, chunk) in self.chunks.iter().enumerate() {
            if skip < chunk.slots.len() {
                first = ci;
                break;
            }
            skip -= chunk.slots.len();
        }
        self.chunks[first..]
            .iter()
            .flat_map(|c| c.slots.iter().copied())
            .skip(skip)
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.chunks.iter().flat_map(|c| c.slots.iter().copied())
    }

    /// Slot holding the `pos`-th visible character.
    pub fn visible_slot(&self, pos: usize) -> Option<usize> {
        let mut remaining = pos;
        for chunk in &self.chunks {
            if remaining >= chunk.visible {
                remaining -= chunk.visible;
                continue;
            }
            return chunk
                .slots
                .iter()
                .copied()
                .filter(|s| self.slot_visible[*s])
                .nth(remaining);
        }
        None
    }

    /// Number of visible slots strictly before absolute index `index`.
    pub fn visible_before(&self, index: usize) -> usize {
        let mut remaining = index;
        let mut count = 0;
        for chunk in &self.chunks {
            if remaining >= chunk.slots.len() {
                remaining -= chunk.slots.len();
                count += chunk.visible;
                continue;
            }
            count += chunk.slots[..remaining]
                .iter()
                .filter(|s| self.slot_visible[**s])
                .count();
            break;
        }
        count
    }

    /// Place a freshly allocated arena slot at absolute index `index`.
    ///
    /// Slots are allocated densely, so `slot` must equal the number of
    /// slots inserted so far.
    pub fn insert(&mut self, index: usize, slot: usize, visible: bool) {
        debug_assert_eq!(slot, self.slot_chunk.len());
        if self.chunks.is_empty() {
            let id = self.alloc_chunk_id();
            self.chunks.push(Chunk { id, slots: Vec::with_capacity(CHUNK_CAPACITY), visible: 0 });
        }

        // Find the chunk that owns `index`; an index equal to a chunk's
        // length appends to that chunk only if it is the last one.
        let last = self.chunks.len() - 1;
        let mut offset = index.min(self.len());
        let mut ci = last;
        for (i, chunk) in self.chunks.iter().enumerate() {
            if offset < chunk.slots.len() || (i == last && offset == chunk.slots.len()) {
                ci = i;
                break;
            }
            offset -= chunk.slots.len();
        }

        let chunk = &mut self.chunks[ci];
        chunk.slots.insert(offset, slot);
        if visible {
            chunk.visible += 1;
            self.visible += 1;
        }
        self.slot_chunk.push(chunk.id);
        self.slot_visible.push(visible);

        if self.chunks[ci].slots.len() > CHUNK_CAPACITY {
            self.split(ci);
        }
    }

    /// Turn a visible slot into a tombstone. Returns false if it already was.
    pub fn hide(&mut self, slot: usize) -> bool {
        if !self.slot_visible[slot] {
            return false;
        }
        self.slot_visible[slot] = false;
        let ci = self.chunk_position(self.slot_chunk[slot]);
        self.chunks[ci].visible -= 1;
        self.visible -= 1;
        true
    }

    fn alloc_chunk_id(&mut self) -> u32 {
        let id = self.next_chunk_id;
        self.next_chunk_id += 1;
        id
    }

    fn split(&mut self, ci: usize) {
        let id = self.alloc_chunk_id();
        let half = self.chunks[ci].slots.len() / 2;
        let tail = self.chunks[ci].slots.split_off(half);
        let mut moved_visible = 0;
        for &slot in &tail {
            self.slot_chunk[slot] = id;
            if self.slot_visible[slot] {
                moved_visible += 1;
            }
        }
        self.chunks[ci].visible -= moved_visible;
        self.chunks.insert(ci + 1, Chunk { id, slots: tail, visible: moved_visible });
    }
}
