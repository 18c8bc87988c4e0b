//! Sync session: the per-connection state machine.
//!
//! Sans-I/O: bytes, local edits and clock ticks go in; encoded frames and
//! [`SyncEvent`]s come out through [`Session::drain_outbound`] and
//! [`Session::drain_events`]. The owner (the client driver task, or a test)
//! moves them to and from a transport.
//!
//! ```text
//!              connect()                 peer SyncStep2 merged
//! Connecting ────────────► Handshaking ──── and ours acked ────► Synced
//!     ▲                        │  ▲                               │
//!     │                        │  └─── corrupt frames > limit ────┤
//!     │                        ▼                                  ▼
//!     └──── connect() ──── Reconnecting ◄──── silence / drop ─────┘
//!
//!                  disconnect() from any state ──► Closed
//! ```
//!
//! Handshake:
//! ```text
//! us ── SyncStep1(sv) + Awareness(full) ──► peer
//! us ◄────────── SyncStep1(peer sv) ─────── peer
//! us ──── SyncStep2(diff_since(peer sv)) ─► peer
//! us ◄──────── SyncStep2(diff) ──────────── peer   (merge, reply SyncDone)
//! us ◄──────────── SyncDone ─────────────── peer   (our diff merged)
//! ```
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tandem_core::{Doc, EngineError, StateVector, TextChange, Update};

use crate::awareness::{Awareness, AwarenessUpdate, ParticipantId, DEFAULT_AWARENESS_TIMEOUT};
use crate::protocol::{Frame, FrameDecoder, MessageType, DEFAULT_MAX_FRAME_LEN};

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No transport yet.
    Connecting,
    /// Transport up, exchanging state vectors.
    Handshaking,
    /// Both sides hold each other's history; updates flow live.
    Synced,
    /// Transport lost; local edits keep queueing.
    Reconnecting,
    /// Disconnected on purpose. Terminal.
    Closed,
}

/// Session tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Heartbeat (and awareness renewal) period
    pub heartbeat_interval: Duration,
    /// Silent intervals tolerated before the connection counts as lost
    pub max_missed_heartbeats: u32,
    /// Awareness entries expire after this long without refresh
    pub awareness_timeout: Duration,
    /// Corrupt frames tolerated per connection before a full resync
    pub max_corrupt_frames: u32,
    /// Largest accepted frame payload
    pub max_frame_len: usize,
    /// Local updates held while not synced
    pub offline_queue_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            max_missed_heartbeats: 3,
            awareness_timeout: DEFAULT_AWARENESS_TIMEOUT,
            max_corrupt_frames: 3,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            offline_queue_limit: 10_000,
        }
    }
}

/// Notifications for the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// The session moved to a new state
    StateChanged(SessionState),
    /// Remote edits changed the visible text
    RemoteChange(Vec<TextChange>),
    /// Participants appeared, changed their presence or left
    AwarenessChanged {
        added: Vec<ParticipantId>,
        updated: Vec<ParticipantId>,
        removed: Vec<ParticipantId>,
    },
}

/// Local updates made while not synced.
///
/// Whatever the peer has not received through our SyncStep2 is replayed
/// once the handshake completes.
pub struct OfflineQueue {
    queue: VecDeque<QueuedUpdate>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedUpdate {
    seq: u64,
    payload: Vec<u8>,
}

impl OfflineQueue {
    /// Create a new offline queue with max capacity.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an encoded update. Returns false when full.
    pub fn enqueue(&mut self, seq: u64, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedUpdate { seq, payload });
        true
    }

    /// Drain all queued updates in order.
    pub fn drain(&mut self) -> Vec<(u64, Vec<u8>)> {
        self.queue.drain(..).map(|u| (u.seq, u.payload)).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|u| u.payload.len()).sum()
    }
}

/// One replica's side of a sync connection.
pub struct Session {
    doc: Doc,
    awareness: Awareness,
    state: SessionState,
    config: SessionConfig,
    decoder: FrameDecoder,
    outbound: VecDeque<Vec<u8>>,
    events: VecDeque<SyncEvent>,
    offline: OfflineQueue,
    next_seq: u64,
    /// Peer's SyncStep2 merged on this connection.
    peer_step2_merged: bool,
    /// Peer acknowledged our SyncStep2.
    our_step2_acked: bool,
    our_step2_sent: bool,
    /// Last state vector received from the peer.
    peer_vector: Option<StateVector>,
    corrupt_frames: u32,
    last_heard: Instant,
    last_heartbeat: Instant,
}

impl Session {
    pub fn new(doc: Doc, config: SessionConfig, now: Instant) -> Self {
        let awareness = Awareness::with_timeout(doc.replica(), config.awareness_timeout);
        Self {
            doc,
            awareness,
            state: SessionState::Connecting,
            decoder: FrameDecoder::new(config.max_frame_len),
            offline: OfflineQueue::new(config.offline_queue_limit),
            config,
            outbound: VecDeque::new(),
            events: VecDeque::new(),
            next_seq: 0,
            peer_step2_merged: false,
            our_step2_acked: false,
            our_step2_sent: false,
            peer_vector: None,
            corrupt_frames: 0,
            last_heard: now,
            last_heartbeat: now,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn awareness(&self) -> &Awareness {
        &self.awareness
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn offline_len(&self) -> usize {
        self.offline.len()
    }

    /// State vector last received from the peer, if any.
    pub fn peer_vector(&self) -> Option<&StateVector> {
        self.peer_vector.as_ref()
    }

    pub fn text(&self) -> String {
        self.doc.text()
    }

    pub fn into_doc(self) -> Doc {
        self.doc
    }

    /// Encoded frames ready for the transport, in order.
    pub fn drain_outbound(&mut self) -> Vec<Vec<u8>> {
        self.outbound.drain(..).collect()
    }

    pub fn drain_events(&mut self) -> Vec<SyncEvent> {
        self.events.drain(..).collect()
    }

    fn send(&mut self, frame: Frame) {
        self.outbound.push_back(frame.encode());
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            log::debug!("Session {} {:?} -> {:?}", self.doc.replica(), self.state, state);
            self.state = state;
            self.events.push_back(SyncEvent::StateChanged(state));
        }
    }

    fn send_awareness(&mut self, update: &AwarenessUpdate) {
        if update.is_empty() {
            return;
        }
        match update.encode() {
            Ok(payload) => self.send(Frame::awareness(payload)),
            Err(e) => log::warn!("Dropping awareness update: {e}"),
        }
    }

    // ─── connection lifecycle ───────────────────────────────────────

    /// A new dial is starting after a lost connection.
    pub fn redial(&mut self) {
        if self.state == SessionState::Reconnecting {
            self.set_state(SessionState::Connecting);
        }
    }

    /// A transport was established: start the handshake.
    pub fn connect(&mut self, now: Instant) {
        if self.state == SessionState::Closed {
            return;
        }
        self.decoder.clear();
        self.outbound.clear();
        self.corrupt_frames = 0;
        self.last_heard = now;
        self.last_heartbeat = now;
        self.start_handshake();
        let full = self.awareness.reannounce();
        self.send_awareness(&full);
        self.awareness.take_broadcast_pending();
    }

    fn start_handshake(&mut self) {
        self.peer_step2_merged = false;
        self.our_step2_acked = false;
        self.our_step2_sent = false;
        self.set_state(SessionState::Handshaking);
        self.send(Frame::sync_step1(self.doc.state_vector().encode()));
    }

    /// The transport failed or went silent. Frames not yet written are
    /// dropped; the next handshake resends whatever the peer lacks.
    pub fn connection_lost(&mut self) {
        if matches!(self.state, SessionState::Closed | SessionState::Reconnecting) {
            return;
        }
        log::info!("Session {} lost its connection", self.doc.replica());
        self.outbound.clear();
        self.decoder.clear();
        self.set_state(SessionState::Reconnecting);
    }

    /// Leave for good: queue the gone marker and close.
    pub fn disconnect(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if matches!(self.state, SessionState::Handshaking | SessionState::Synced) {
            let gone = self.awareness.remove_local();
            self.send_awareness(&gone);
        }
        self.set_state(SessionState::Closed);
    }

    // ─── inbound ────────────────────────────────────────────────────

    /// Feed bytes from the transport. Partial frames are kept until the
    /// rest arrives.
    pub fn receive(&mut self, bytes: &[u8], now: Instant) {
        if !matches!(self.state, SessionState::Handshaking | SessionState::Synced) {
            return;
        }
        self.decoder.push(bytes);
        loop {
            match self.decoder.next_frame() {
                Ok(Some(frame)) => self.handle_frame(frame, now),
                Ok(None) => break,
                Err(e) => self.corrupt(&e.to_string()),
            }
            if !matches!(self.state, SessionState::Handshaking | SessionState::Synced) {
                break;
            }
        }
    }

    /// Process one decoded frame.
    pub fn handle_frame(&mut self, frame: Frame, now: Instant) {
        self.last_heard = now;
        match frame.msg_type {
            MessageType::SyncStep1 => match StateVector::decode(&frame.payload) {
                Ok(vector) => {
                    let diff = self.doc.diff_since(&vector);
                    self.send(Frame::sync_step2(diff.encode()));
                    // Everything queued so far travels inside this diff
                    self.offline.clear();
                    self.our_step2_sent = true;
                    self.peer_vector = Some(vector);
                    // The peer restarted its handshake; run ours again too
                    if self.state == SessionState::Synced {
                        self.start_handshake();
                        self.our_step2_sent = true;
                    }
                }
                Err(e) => self.corrupt(&e.to_string()),
            },
            MessageType::SyncStep2 => {
                if self.apply_remote_update(&frame.payload) {
                    self.send(Frame::sync_done());
                    self.peer_step2_merged = true;
                    self.check_synced();
                }
            }
            MessageType::SyncDone => {
                if self.our_step2_sent {
                    self.our_step2_acked = true;
                    self.check_synced();
                }
            }
            MessageType::Update => {
                self.apply_remote_update(&frame.payload);
            }
            MessageType::Awareness => match AwarenessUpdate::decode(&frame.payload) {
                Ok(update) => {
                    let change = self.awareness.apply_update(&update, now);
                    if !change.is_empty() {
                        self.events.push_back(SyncEvent::AwarenessChanged {
                            added: change.added,
                            updated: change.updated,
                            removed: change.removed,
                        });
                    }
                }
                Err(e) => self.corrupt(&e.to_string()),
            },
            MessageType::Heartbeat => {}
        }
    }

    /// Decode and merge. Returns false if the payload was corrupt.
    fn apply_remote_update(&mut self, payload: &[u8]) -> bool {
        match Update::decode(payload) {
            Ok(update) => {
                let changes = self.doc.merge(&update);
                if !changes.is_empty() {
                    self.events.push_back(SyncEvent::RemoteChange(changes));
                }
                true
            }
            Err(e) => {
                self.corrupt(&e.to_string());
                false
            }
        }
    }

    fn corrupt(&mut self, reason: &str) {
        self.corrupt_frames += 1;
        log::warn!(
            "Session {} discarded corrupt frame ({}/{}): {reason}",
            self.doc.replica(),
            self.corrupt_frames,
            self.config.max_corrupt_frames
        );
        if self.corrupt_frames > self.config.max_corrupt_frames {
            log::warn!("Session {} forcing full resync", self.doc.replica());
            self.corrupt_frames = 0;
            self.decoder.clear();
            self.start_handshake();
        }
    }

    fn check_synced(&mut self) {
        if self.state != SessionState::Handshaking
            || !self.peer_step2_merged
            || !self.our_step2_acked
        {
            return;
        }
        let queued = self.offline.drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued updates", queued.len());
        }
        for (_, payload) in queued {
            self.send(Frame::update(payload));
        }
        self.set_state(SessionState::Synced);
    }

    // ─── local edits ────────────────────────────────────────────────

    /// Insert locally and propagate (or queue) the update.
    pub fn insert(&mut self, position: usize, text: &str) -> Result<(), EngineError> {
        let update = self.doc.insert(position, text)?;
        self.publish(update);
        Ok(())
    }

    /// Delete locally and propagate (or queue) the update.
    pub fn delete(&mut self, position: usize, length: usize) -> Result<(), EngineError> {
        let update = self.doc.delete(position, length)?;
        self.publish(update);
        Ok(())
    }

    fn publish(&mut self, update: Update) {
        if update.is_empty() {
            return;
        }
        let payload = update.encode();
        match self.state {
            SessionState::Synced => self.send(Frame::update(payload)),
            SessionState::Closed => {}
            _ => {
                self.next_seq += 1;
                if self.offline.enqueue(self.next_seq, payload) {
                    return;
                }
                if self.state == SessionState::Handshaking && self.our_step2_sent {
                    // Our SyncStep2 is already out: fold the queue into one
                    // diff against the vector the peer sent
                    if let Some(vector) = &self.peer_vector {
                        let catch_up = self.doc.diff_since(vector).encode();
                        self.offline.clear();
                        self.offline.enqueue(self.next_seq, catch_up);
                        log::debug!("Offline queue full, compacted into one diff");
                    }
                } else {
                    // Still in the doc, so the next SyncStep2 carries it
                    log::debug!("Offline queue full, relying on handshake diff");
                }
            }
        }
    }

    /// Replace the local presence blob.
    pub fn set_local_presence(&mut self, state: Vec<u8>) {
        let update = self.awareness.set_local_state(state);
        if matches!(self.state, SessionState::Handshaking | SessionState::Synced) {
            self.send_awareness(&update);
            self.awareness.take_broadcast_pending();
        }
    }

    // ─── timers ─────────────────────────────────────────────────────

    /// Periodic tick: liveness check, heartbeat, awareness expiry.
    pub fn tick(&mut self, now: Instant) {
        if matches!(self.state, SessionState::Handshaking | SessionState::Synced) {
            let silence = now.saturating_duration_since(self.last_heard);
            if silence >= self.config.heartbeat_interval * self.config.max_missed_heartbeats {
                log::warn!("Session {} heard nothing for {silence:?}", self.doc.replica());
                self.connection_lost();
            } else if now.saturating_duration_since(self.last_heartbeat)
                >= self.config.heartbeat_interval
            {
                self.last_heartbeat = now;
                self.send(Frame::heartbeat());
                let renewal = self.awareness.renew_local();
                self.send_awareness(&renewal);
            }
        }

        let removed = self.awareness.expire(now);
        if !removed.is_empty() {
            self.events.push_back(SyncEvent::AwarenessChanged {
                added: Vec::new(),
                updated: Vec::new(),
                removed,
            });
        }
    }
}
