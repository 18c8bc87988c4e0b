//! Persistence integration tests.
//!
//! Verifies:
//! - An idle room is snapshotted when its last connection leaves
//! - A restarted relay sharing the store serves the saved content
//! - Store failures never take the relay down
//! - Snapshot bytes survive the trip through a store

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tandem_collab::{
    random_replica_id, BackoffConfig, ClientConfig, ServerConfig, SessionState, SyncClient, SyncEvent,
    SyncServer, WsConnector,
};
use tandem_core::{Doc, MemoryStore, Snapshot, SnapshotStore, StoreError};
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};

// ─── Helpers ─────────────────────────────────────────────────────────────────

async fn start_relay(store: Arc<dyn SnapshotStore>) -> (Arc<SyncServer>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let server = Arc::new(SyncServer::with_store(ServerConfig::default(), store));
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    (server, url)
}

async fn synced_client(url: &str, room: &str) -> SyncClient {
    let config = ClientConfig {
        backoff: BackoffConfig { base: Duration::from_millis(10), ..Default::default() },
        tick_interval: Duration::from_millis(50),
        ..Default::default()
    };
    let mut client = SyncClient::spawn(WsConnector::for_room(url, room), Doc::new(random_replica_id()), config);
    let mut events = client.take_event_rx().unwrap();
    timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            if event == SyncEvent::StateChanged(SessionState::Synced) {
                return;
            }
        }
    })
    .await
    .expect("client never synced");
    client
}

async fn wait_room_text(server: &SyncServer, room: &str, expected: &str) {
    timeout(Duration::from_secs(5), async {
        while server.room_text(room).await.as_deref() != Some(expected) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("relay never reached expected text");
}

async fn wait_client_text(client: &SyncClient, expected: &str) {
    timeout(Duration::from_secs(5), async {
        while client.text().await.unwrap() != expected {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("client never reached expected text");
}

async fn wait_rooms_closed(server: &SyncServer) {
    timeout(Duration::from_secs(5), async {
        while !server.active_rooms().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("rooms never closed");
}

async fn wait_stored(store: &MemoryStore, count: usize) {
    timeout(Duration::from_secs(5), async {
        while store.len() < count {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("snapshots never saved");
}

/// A store whose every call fails.
#[derive(Default)]
struct BrokenStore {
    calls: AtomicUsize,
}

impl SnapshotStore for BrokenStore {
    fn load(&self, _document: &str) -> Result<Option<Snapshot>, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Backend("disk on fire".into()))
    }

    fn save(&self, _document: &str, _snapshot: &Snapshot) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Backend("disk on fire".into()))
    }
}

// ─── Room Snapshots ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_idle_room_is_snapshotted() {
    let store = Arc::new(MemoryStore::new());
    let (server, url) = start_relay(store.clone()).await;

    let client = synced_client(&url, "journal").await;
    client.insert(0, "dear diary").await.unwrap();
    wait_room_text(&server, "journal", "dear diary").await;

    let local = client.disconnect().await.unwrap();
    assert_eq!(local.text(), "dear diary");

    wait_rooms_closed(&server).await;
    assert_eq!(server.stats().await.persisted_snapshots, 1);

    let saved = store.load("journal").unwrap().expect("snapshot saved");
    assert_eq!(saved.restore(5).unwrap().text(), "dear diary");
}

#[tokio::test]
async fn test_restarted_relay_serves_saved_content() {
    let store = Arc::new(MemoryStore::new());

    {
        let (server, url) = start_relay(store.clone()).await;
        let writer = synced_client(&url, "shared").await;
        writer.insert(0, "survives restarts").await.unwrap();
        wait_room_text(&server, "shared", "survives restarts").await;
        writer.disconnect().await.unwrap();
        wait_stored(&store, 1).await;
    }

    // A fresh relay over the same store
    let (server, url) = start_relay(store.clone()).await;
    let reader = synced_client(&url, "shared").await;
    wait_client_text(&reader, "survives restarts").await;

    // Edits continue on top of the restored history
    reader.insert(0, "it ").await.unwrap();
    wait_room_text(&server, "shared", "it survives restarts").await;
}

#[tokio::test]
async fn test_rooms_persist_independently() {
    let store = Arc::new(MemoryStore::new());
    let (_server, url) = start_relay(store.clone()).await;

    for (room, text) in [("one", "first"), ("two", "second")] {
        let client = synced_client(&url, room).await;
        client.insert(0, text).await.unwrap();
        client.disconnect().await.unwrap();
    }
    wait_stored(&store, 2).await;

    assert_eq!(store.load("one").unwrap().unwrap().restore(1).unwrap().text(), "first");
    assert_eq!(store.load("two").unwrap().unwrap().restore(1).unwrap().text(), "second");
    assert!(store.load("three").unwrap().is_none());
}

#[tokio::test]
async fn test_broken_store_does_not_stop_relay() {
    let store = Arc::new(BrokenStore::default());
    let (server, url) = start_relay(store.clone()).await;

    let alice = synced_client(&url, "fragile").await;
    let bob = synced_client(&url, "fragile").await;
    alice.insert(0, "still syncing").await.unwrap();
    wait_client_text(&bob, "still syncing").await;

    alice.disconnect().await.unwrap();
    bob.disconnect().await.unwrap();
    wait_rooms_closed(&server).await;

    assert!(store.calls.load(Ordering::SeqCst) >= 2);
    assert_eq!(server.stats().await.persisted_snapshots, 0);
}

// ─── Snapshot Bytes ──────────────────────────────────────────────────────────

#[test]
fn test_snapshot_bytes_roundtrip_through_store() {
    let mut doc = Doc::new(3);
    doc.insert(0, &"The quick brown fox jumps over the lazy dog. ".repeat(200)).unwrap();
    doc.delete(0, 4).unwrap();

    let snapshot = Snapshot::capture(&doc);

    let store = MemoryStore::new();
    store.save("fox", &snapshot).unwrap();
    let restored = store.load("fox").unwrap().unwrap().restore(4).unwrap();
    assert_eq!(restored.text(), doc.text());
    assert_eq!(restored.state_vector(), doc.state_vector());
}

#[test]
fn test_corrupt_snapshot_bytes_are_rejected() {
    assert!(Snapshot::from_bytes(&[0xde, 0xad, 0xbe, 0xef]).is_err());
}
