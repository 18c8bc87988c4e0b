//! Awareness: live presence of the participants of a document.
//!
//! Replicated separately from the text. Every participant owns one entry
//! holding an opaque state blob and a clock that only its owner advances.
//! Receivers keep the newest clock per participant (last writer wins), so
//! the table converges however updates are ordered or duplicated.
//!
//! ```text
//! set_local_state(blob) ──► clock += 1 ──► AwarenessUpdate ──► peers
//!                                                               │
//! peers ──► apply_update(update, now) ──► AwarenessChange ◄─────┘
//!                                │
//!        heartbeat tick ──► expire(now) ──► removed participants
//! ```
//!
//! A `None` state is the "gone" marker: the participant left on purpose and
//! is hidden at once instead of waiting for the timeout.
//!
//! Reference: Kleppmann, Chapter 8 — Broadcast Protocols

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::protocol::ProtocolError;

/// Participants share the id space of document replicas.
pub type ParticipantId = u64;

/// Entries not refreshed for this long are dropped.
pub const DEFAULT_AWARENESS_TIMEOUT: Duration = Duration::from_secs(30);

// ───────────────────────────────────────────────────────────────────
// Presence blob
// ───────────────────────────────────────────────────────────────────

/// RGBA color for remote cursor rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, visually distinct color for a participant.
    ///
    /// Hues are spread with the golden ratio so consecutive ids do not
    /// land next to each other on the color wheel.
    pub fn from_participant(id: ParticipantId) -> Self {
        let hue = ((id as f64) * 0.618_033_988_749_895).fract() as f32;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    /// `#rrggbb` for web-style consumers.
    pub fn to_hex(&self) -> String {
        let channel = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!("#{:02x}{:02x}{:02x}", channel(self.r), channel(self.g), channel(self.b))
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Text selection in visible-character offsets. `anchor == head` is a caret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: usize,
    pub head: usize,
}

/// What an editor publishes about its user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    pub name: String,
    pub color: CursorColor,
    pub selection: Option<Selection>,
}

impl Presence {
    pub fn new(participant: ParticipantId, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: CursorColor::from_participant(participant),
            selection: None,
        }
    }

    pub fn with_selection(mut self, anchor: usize, head: usize) -> Self {
        self.selection = Some(Selection { anchor, head });
        self
    }

    /// Encode to binary (bincode).
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (presence, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Ok(presence)
    }
}

// ───────────────────────────────────────────────────────────────────
// Wire payload
// ───────────────────────────────────────────────────────────────────

/// One participant's entry as sent over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessRecord {
    pub participant: ParticipantId,
    pub clock: u64,
    /// `None` marks the participant as gone.
    pub state: Option<Vec<u8>>,
}

/// Payload of an `Awareness` frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub records: Vec<AwarenessRecord>,
}

impl AwarenessUpdate {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Encode to binary (bincode, varint integers).
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let config = bincode::config::standard().with_limit::<{ crate::protocol::DEFAULT_MAX_FRAME_LEN }>();
        let (update, read) = bincode::serde::decode_from_slice(bytes, config)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if read != bytes.len() {
            return Err(ProtocolError::Malformed("trailing bytes after awareness update".into()));
        }
        Ok(update)
    }
}

// ───────────────────────────────────────────────────────────────────
// Store
// ───────────────────────────────────────────────────────────────────

/// Participants that appeared, changed or left in one step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ParticipantId>,
    pub updated: Vec<ParticipantId>,
    pub removed: Vec<ParticipantId>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Entry {
    clock: u64,
    state: Option<Vec<u8>>,
    last_seen: Instant,
}

/// Replicated participant → presence table.
pub struct Awareness {
    local: ParticipantId,
    local_clock: u64,
    local_state: Option<Vec<u8>>,
    /// Remote participants, gone markers included until they expire.
    entries: HashMap<ParticipantId, Entry>,
    timeout: Duration,
    broadcast_pending: bool,
}

impl Awareness {
    pub fn new(local: ParticipantId) -> Self {
        Self::with_timeout(local, DEFAULT_AWARENESS_TIMEOUT)
    }

    pub fn with_timeout(local: ParticipantId, timeout: Duration) -> Self {
        Self {
            local,
            local_clock: 0,
            local_state: None,
            entries: HashMap::new(),
            timeout,
            broadcast_pending: false,
        }
    }

    pub fn local_id(&self) -> ParticipantId {
        self.local
    }

    pub fn local_state(&self) -> Option<&[u8]> {
        self.local_state.as_deref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Replace the local presence. Returns the update to broadcast.
    pub fn set_local_state(&mut self, state: Vec<u8>) -> AwarenessUpdate {
        self.local_clock += 1;
        self.local_state = Some(state);
        self.broadcast_pending = true;
        self.local_update()
    }

    /// Re-announce the local state with a fresh clock so peers do not
    /// expire it. Empty if no local state was ever set.
    pub fn renew_local(&mut self) -> AwarenessUpdate {
        if self.local_state.is_none() {
            return AwarenessUpdate::default();
        }
        self.local_clock += 1;
        self.local_update()
    }

    /// Final gone marker for the local participant.
    pub fn remove_local(&mut self) -> AwarenessUpdate {
        self.local_clock += 1;
        self.local_state = None;
        self.broadcast_pending = true;
        AwarenessUpdate {
            records: vec![AwarenessRecord {
                participant: self.local,
                clock: self.local_clock,
                state: None,
            }],
        }
    }

    /// Whether a local change has not been picked up by
    /// [`take_broadcast_pending`](Self::take_broadcast_pending) yet.
    pub fn broadcast_pending(&self) -> bool {
        self.broadcast_pending
    }

    pub fn take_broadcast_pending(&mut self) -> bool {
        std::mem::take(&mut self.broadcast_pending)
    }

    fn local_update(&self) -> AwarenessUpdate {
        AwarenessUpdate {
            records: vec![AwarenessRecord {
                participant: self.local,
                clock: self.local_clock,
                state: self.local_state.clone(),
            }],
        }
    }

    /// Apply one remote entry. Returns false for stale or duplicate clocks,
    /// which are dropped silently.
    pub fn apply_remote(
        &mut self,
        participant: ParticipantId,
        clock: u64,
        state: Option<Vec<u8>>,
        now: Instant,
    ) -> bool {
        self.apply_record(participant, clock, state, now).is_some()
    }

    /// Apply a whole wire update and report what changed.
    pub fn apply_update(&mut self, update: &AwarenessUpdate, now: Instant) -> AwarenessChange {
        let mut change = AwarenessChange::default();
        for record in &update.records {
            match self.apply_record(record.participant, record.clock, record.state.clone(), now) {
                Some(Transition::Added) => change.added.push(record.participant),
                Some(Transition::Updated) => change.updated.push(record.participant),
                Some(Transition::Removed) => change.removed.push(record.participant),
                Some(Transition::Silent) | None => {}
            }
        }
        change
    }

    fn apply_record(
        &mut self,
        participant: ParticipantId,
        clock: u64,
        state: Option<Vec<u8>>,
        now: Instant,
    ) -> Option<Transition> {
        if participant == self.local {
            return None;
        }
        let was_visible = match self.entries.get(&participant) {
            Some(entry) if clock < entry.clock => return None,
            // A relay synthesizes gone markers at the clock the participant
            // uses next, so a state at that same clock supersedes the marker
            Some(entry) if clock == entry.clock && !(entry.state.is_none() && state.is_some()) => {
                return None
            }
            Some(entry) => entry.state.is_some(),
            None => false,
        };
        let transition = match (was_visible, state.is_some()) {
            (false, true) => Transition::Added,
            (true, true) => Transition::Updated,
            (true, false) => Transition::Removed,
            (false, false) => Transition::Silent,
        };
        self.entries.insert(participant, Entry { clock, state, last_seen: now });
        Some(transition)
    }

    /// Drop entries not refreshed within the timeout. Returns the visible
    /// participants that were removed.
    pub fn expire(&mut self, now: Instant) -> Vec<ParticipantId> {
        let timeout = self.timeout;
        let mut removed = Vec::new();
        self.entries.retain(|id, entry| {
            let alive = now.saturating_duration_since(entry.last_seen) < timeout;
            if !alive && entry.state.is_some() {
                removed.push(*id);
            }
            alive
        });
        if !removed.is_empty() {
            log::debug!("Awareness expired {} participants", removed.len());
        }
        removed
    }

    /// Hide a remote participant that vanished without a gone marker
    /// (e.g. its connection dropped) and return the marker to forward.
    /// Empty if the participant is unknown or already gone.
    pub fn mark_gone(&mut self, participant: ParticipantId, now: Instant) -> AwarenessUpdate {
        let Some(entry) = self.entries.get_mut(&participant).filter(|e| e.state.is_some()) else {
            return AwarenessUpdate::default();
        };
        entry.clock += 1;
        entry.state = None;
        entry.last_seen = now;
        AwarenessUpdate {
            records: vec![AwarenessRecord { participant, clock: entry.clock, state: None }],
        }
    }

    /// Full announcement for a fresh connection. The local clock first
    /// moves past any gone marker a relay made for us while we were away.
    pub fn reannounce(&mut self) -> AwarenessUpdate {
        if self.local_state.is_some() {
            self.local_clock += 1;
        }
        self.full_update()
    }

    /// Every known entry, local one included, for a peer that just joined.
    pub fn full_update(&self) -> AwarenessUpdate {
        let mut records: Vec<AwarenessRecord> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.state.is_some())
            .map(|(id, entry)| AwarenessRecord {
                participant: *id,
                clock: entry.clock,
                state: entry.state.clone(),
            })
            .collect();
        if self.local_state.is_some() {
            records.push(AwarenessRecord {
                participant: self.local,
                clock: self.local_clock,
                state: self.local_state.clone(),
            });
        }
        records.sort_by_key(|r| r.participant);
        AwarenessUpdate { records }
    }

    /// Visible remote participants and their state blobs, by id.
    pub fn participants(&self) -> Vec<(ParticipantId, Vec<u8>)> {
        let mut out: Vec<_> = self
            .entries
            .iter()
            .filter_map(|(id, entry)| entry.state.clone().map(|state| (*id, state)))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    pub fn state_of(&self, participant: ParticipantId) -> Option<&[u8]> {
        self.entries.get(&participant).and_then(|e| e.state.as_deref())
    }

    /// Number of visible remote participants.
    pub fn peer_count(&self) -> usize {
        self.entries.values().filter(|e| e.state.is_some()).count()
    }
}

enum Transition {
    Added,
    Updated,
    Removed,
    /// A gone marker for someone not visible.
    Silent,
}
