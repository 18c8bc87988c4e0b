//! Fan-out broadcast to the N-1 other connections of a room.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each connection gets an independent receiver that buffers up to
//! `capacity` frames; a receiver that falls further behind loses the
//! oldest frames and must be resynced by its owner.
//!
//! Reference: Patterson & Hennessy, Section 6.4 — Interconnection Networks

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::awareness::ParticipantId;

/// Identifies one relay connection.
pub type ConnectionId = Uuid;

/// An encoded frame and the connection it came from.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub sender: ConnectionId,
    pub frame: Arc<Vec<u8>>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Lock-free counters for the hot path.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// A broadcast group for a single document room.
///
/// Besides fan-out it remembers which awareness participants each
/// connection announced, so their gone markers can be sent when the
/// connection drops.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Envelope>,

    /// Connected peers and the participants they announced
    peers: RwLock<HashMap<ConnectionId, HashSet<ParticipantId>>>,

    capacity: usize,

    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is the per-connection backlog before frames are dropped.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            atomic_stats: AtomicBroadcastStats::new(),
        }
    }

    /// Register a connection and return its receiver.
    pub async fn add_peer(&self, id: ConnectionId) -> broadcast::Receiver<Envelope> {
        let mut peers = self.peers.write().await;
        peers.entry(id).or_default();
        self.sender.subscribe()
    }

    /// Register a connection unless the room already holds `max` of them.
    pub async fn try_add_peer(&self, id: ConnectionId, max: usize) -> Option<broadcast::Receiver<Envelope>> {
        let mut peers = self.peers.write().await;
        if peers.len() >= max && !peers.contains_key(&id) {
            return None;
        }
        peers.entry(id).or_default();
        Some(self.sender.subscribe())
    }

    /// Unregister a connection. Returns the participants it announced.
    pub async fn remove_peer(&self, id: &ConnectionId) -> Option<HashSet<ParticipantId>> {
        self.peers.write().await.remove(id)
    }

    /// Record that `participant` is (or no longer is) present through `id`.
    pub async fn note_participant(&self, id: &ConnectionId, participant: ParticipantId, present: bool) {
        let mut peers = self.peers.write().await;
        if let Some(participants) = peers.get_mut(id) {
            if present {
                participants.insert(participant);
            } else {
                participants.remove(&participant);
            }
        }
    }

    /// Fan a frame out to every receiver. Receivers skip their own frames.
    /// Returns the number of receivers.
    pub fn broadcast_from(&self, sender: ConnectionId, frame: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(Envelope { sender, frame }).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver lost.
    pub fn record_dropped(&self, n: u64) {
        self.atomic_stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    /// Whether any connection currently announces `participant`.
    pub async fn is_announced(&self, participant: ParticipantId) -> bool {
        self.peers.read().await.values().any(|p| p.contains(&participant))
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, id: &ConnectionId) -> bool {
        self.peers.read().await.contains_key(id)
    }

    /// Participants announced through `id`.
    pub async fn participants_of(&self, id: &ConnectionId) -> Vec<ParticipantId> {
        let peers = self.peers.read().await;
        let mut out: Vec<_> = peers.get(id).map(|p| p.iter().copied().collect()).unwrap_or_default();
        out.sort_unstable();
        out
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_group_add_remove() {
        let group = BroadcastGroup::new(16);
        let id = Uuid::new_v4();

        let _rx = group.add_peer(id).await;
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&id).await);

        group.note_participant(&id, 7, true).await;
        group.note_participant(&id, 8, true).await;
        group.note_participant(&id, 8, false).await;
        assert_eq!(group.participants_of(&id).await, vec![7]);

        let other = Uuid::new_v4();
        let _rx_other = group.add_peer(other).await;
        group.note_participant(&other, 9, true).await;
        assert!(group.is_announced(9).await);

        let announced = group.remove_peer(&id).await.unwrap();
        assert!(announced.contains(&7));
        assert!(!group.is_announced(7).await);
        group.remove_peer(&other).await;
        assert_eq!(group.peer_count().await, 0);
        assert!(!group.has_peer(&id).await);
    }

    #[tokio::test]
    async fn test_broadcast_fan_out_carries_sender() {
        let group = BroadcastGroup::new(16);
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let mut rx_alice = group.add_peer(alice).await;
        let mut rx_bob = group.add_peer(bob).await;

        let count = group.broadcast_from(alice, Arc::new(vec![1, 2, 3]));
        // Everyone receives; filtering own frames is the receiver's job
        assert_eq!(count, 2);

        let at_alice = rx_alice.recv().await.unwrap();
        assert_eq!(at_alice.sender, alice);
        let at_bob = rx_bob.recv().await.unwrap();
        assert_eq!(*at_bob.frame, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_max_peers() {
        let group = BroadcastGroup::new(16);
        assert!(group.try_add_peer(Uuid::new_v4(), 2).await.is_some());
        assert!(group.try_add_peer(Uuid::new_v4(), 2).await.is_some());
        assert!(group.try_add_peer(Uuid::new_v4(), 2).await.is_none());
        assert_eq!(group.peer_count().await, 2);
    }

    #[tokio::test]
    async fn test_lagging_receiver_loses_oldest() {
        let group = BroadcastGroup::new(2);
        let sender = Uuid::new_v4();
        let mut rx = group.add_peer(Uuid::new_v4()).await;

        for i in 0..5u8 {
            group.broadcast_from(sender, Arc::new(vec![i]));
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => group.record_dropped(n),
            other => panic!("expected lag, got {other:?}"),
        }
        assert_eq!(*rx.recv().await.unwrap().frame, vec![3]);

        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 5);
        assert_eq!(stats.messages_dropped, 3);
        assert_eq!(stats.active_peers, 1);
        assert_eq!(group.capacity(), 2);
    }
}
