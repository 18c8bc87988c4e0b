//! WebSocket relay with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                 ┌── Doc (authoritative, catch-up source)
//!             ├── Room ("/notes")├── Awareness table
//! Client B ──┘                 └── BroadcastGroup ──► other connections
//!                                        │
//!                              SnapshotStore (on open / when idle)
//! ```
//!
//! The room is the URL path of the WebSocket request. Per connection the
//! relay speaks the same frame protocol as a client session:
//!
//! ```text
//! client ── SyncStep1(sv) ──────► relay   ── SyncStep2(diff) + SyncStep1(room sv)
//! client ── SyncStep2(diff) ────► relay   ── SyncDone, diff fanned out as Update
//! client ── Update / Awareness ─► relay   ── merged, fanned out
//! client ── Heartbeat ──────────► relay   ── Heartbeat
//! ```
//!
//! A connection that falls behind the broadcast backlog is sent a fresh
//! SyncStep1, which makes its session run the handshake again.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapters 5 & 8

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use tandem_core::{Doc, MemoryStore, ReplicaId, Snapshot, SnapshotStore, StateVector, Update};

use crate::awareness::{Awareness, AwarenessUpdate, DEFAULT_AWARENESS_TIMEOUT};
use crate::broadcast::{BroadcastGroup, ConnectionId, Envelope};
use crate::protocol::{Frame, FrameDecoder, MessageType, DEFAULT_MAX_FRAME_LEN};

/// Replica id of the relay's own copy of each document. The relay never
/// edits, so this id never appears on an item.
pub const RELAY_REPLICA: ReplicaId = u64::MAX;

/// Room used when the request path is empty.
pub const DEFAULT_ROOM: &str = "default";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum connections per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Expected client heartbeat period in seconds
    pub heartbeat_interval_secs: u64,
    /// Silent heartbeat periods before a connection is dropped
    pub max_missed_heartbeats: u32,
    /// Largest accepted frame payload
    pub max_frame_len: usize,
    /// Corrupt frames tolerated per connection
    pub max_corrupt_frames: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 15,
            max_missed_heartbeats: 3,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            max_corrupt_frames: 3,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `TANDEM_BIND`, `TANDEM_MAX_PEERS` and
    /// `TANDEM_HEARTBEAT_SECS`. Unparsable values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(bind) = lookup("TANDEM_BIND") {
            config.bind_addr = bind;
        }
        if let Some(raw) = lookup("TANDEM_MAX_PEERS") {
            match raw.parse() {
                Ok(n) => config.max_peers_per_room = n,
                Err(e) => log::warn!("Ignoring TANDEM_MAX_PEERS={raw}: {e}"),
            }
        }
        if let Some(raw) = lookup("TANDEM_HEARTBEAT_SECS") {
            match raw.parse() {
                Ok(n) if n > 0 => config.heartbeat_interval_secs = n,
                Ok(_) => log::warn!("Ignoring TANDEM_HEARTBEAT_SECS=0"),
                Err(e) => log::warn!("Ignoring TANDEM_HEARTBEAT_SECS={raw}: {e}"),
            }
        }
        config
    }

    /// Silence after which a connection counts as dead.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs) * self.max_missed_heartbeats.max(1)
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub corrupt_frames: u64,
    pub active_rooms: usize,
    pub persisted_snapshots: u64,
}

struct RoomState {
    doc: Doc,
    awareness: Awareness,
}

/// Document room: authoritative replica, awareness table, fan-out.
struct DocumentRoom {
    name: String,
    state: Mutex<RoomState>,
    broadcast: BroadcastGroup,
}

impl std::fmt::Debug for DocumentRoom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentRoom")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl DocumentRoom {
    fn new(name: String, doc: Doc, broadcast_capacity: usize) -> Self {
        Self {
            name,
            state: Mutex::new(RoomState {
                doc,
                awareness: Awareness::with_timeout(RELAY_REPLICA, DEFAULT_AWARENESS_TIMEOUT),
            }),
            broadcast: BroadcastGroup::new(broadcast_capacity),
        }
    }
}

/// Shared state handed to every connection task.
#[derive(Clone)]
struct ServerContext {
    config: ServerConfig,
    rooms: Arc<RwLock<HashMap<String, Arc<DocumentRoom>>>>,
    stats: Arc<RwLock<ServerStats>>,
    store: Arc<dyn SnapshotStore>,
}

impl ServerContext {
    /// Open `name` if needed and register `conn_id` in it.
    ///
    /// The peer is added while the rooms lock is held, so `close_if_idle`
    /// (which needs the write lock) never retires a room between lookup and
    /// registration. `Err` carries the room when it is full.
    async fn join(
        &self,
        name: &str,
        conn_id: ConnectionId,
        max_peers: usize,
    ) -> Result<(Arc<DocumentRoom>, broadcast::Receiver<Envelope>), Arc<DocumentRoom>> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(name) {
                return match room.broadcast.try_add_peer(conn_id, max_peers).await {
                    Some(rx) => Ok((room.clone(), rx)),
                    None => Err(room.clone()),
                };
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        let room = match rooms.get(name) {
            Some(room) => room.clone(),
            None => {
                let room = Arc::new(DocumentRoom::new(
                    name.to_string(),
                    self.load_doc(name),
                    self.config.broadcast_capacity,
                ));
                rooms.insert(name.to_string(), room.clone());
                room
            }
        };
        let joined = room.broadcast.try_add_peer(conn_id, max_peers).await;
        let count = rooms.len();
        drop(rooms);
        self.stats.write().await.active_rooms = count;
        match joined {
            Some(rx) => Ok((room, rx)),
            None => Err(room),
        }
    }

    /// Room document from the stored snapshot, or empty.
    fn load_doc(&self, name: &str) -> Doc {
        match self.store.load(name) {
            Ok(Some(snapshot)) => match snapshot.restore(RELAY_REPLICA) {
                Ok(doc) => {
                    log::info!("Loaded snapshot for room {name} ({} chars)", doc.len());
                    doc
                }
                Err(e) => {
                    log::error!("Discarding unreadable snapshot for room {name}: {e}");
                    Doc::new(RELAY_REPLICA)
                }
            },
            Ok(None) => Doc::new(RELAY_REPLICA),
            Err(e) => {
                log::error!("Failed to load snapshot for room {name}: {e}");
                Doc::new(RELAY_REPLICA)
            }
        }
    }

    /// Persist and drop a room nobody is connected to.
    async fn close_if_idle(&self, room: &Arc<DocumentRoom>) {
        let mut rooms = self.rooms.write().await;
        let registered = rooms.get(&room.name).is_some_and(|r| Arc::ptr_eq(r, room));
        if !registered || room.broadcast.peer_count().await > 0 {
            return;
        }
        let snapshot = {
            let state = room.state.lock().await;
            Snapshot::capture(&state.doc)
        };
        match self.store.save(&room.name, &snapshot) {
            Ok(()) => {
                self.stats.write().await.persisted_snapshots += 1;
                log::info!(
                    "Persisted snapshot for room {} ({} bytes compressed)",
                    room.name,
                    snapshot.compressed_len()
                );
            }
            Err(e) => log::error!("Failed to persist snapshot for room {}: {e}", room.name),
        }
        rooms.remove(&room.name);
        let count = rooms.len();
        drop(rooms);
        self.stats.write().await.active_rooms = count;
        log::info!("Room {} closed (empty)", room.name);
    }
}

/// The relay server.
pub struct SyncServer {
    ctx: ServerContext,
}

impl SyncServer {
    /// Create a relay with an in-memory snapshot store.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Create a relay persisting idle rooms to `store`.
    pub fn with_store(config: ServerConfig, store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            ctx: ServerContext {
                config,
                rooms: Arc::new(RwLock::new(HashMap::new())),
                stats: Arc::new(RwLock::new(ServerStats::default())),
                store,
            },
        }
    }

    /// Bind to the configured address and serve forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.ctx.config.bind_addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");
            if let Err(e) = stream.set_nodelay(true) {
                log::debug!("set_nodelay failed for {addr}: {e}");
            }

            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, ctx).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.ctx.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.ctx.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.ctx.config
    }

    /// Names of the rooms currently open.
    pub async fn active_rooms(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ctx.rooms.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Current text of an open room.
    pub async fn room_text(&self, name: &str) -> Option<String> {
        let room = self.ctx.rooms.read().await.get(name).cloned()?;
        let state = room.state.lock().await;
        Some(state.doc.text())
    }
}

fn room_from_path(path: &str) -> String {
    let name = path.trim_matches('/');
    if name.is_empty() {
        DEFAULT_ROOM.to_string()
    } else {
        name.to_string()
    }
}

/// What the connection loop should do after a frame.
enum Reply {
    Send(Vec<Frame>),
    Corrupt(String),
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: ServerContext,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut path = String::new();
    let capture_path = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        path = req.uri().path().to_string();
        Ok(resp)
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, capture_path).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let conn_id: ConnectionId = Uuid::new_v4();
    let (room, mut broadcast_rx) = match ctx
        .join(&room_from_path(&path), conn_id, ctx.config.max_peers_per_room)
        .await
    {
        Ok(joined) => joined,
        Err(room) => {
            log::warn!("Room {} is full, rejecting {addr}", room.name);
            ctx.stats.write().await.rejected_connections += 1;
            let _ = ws_sender.send(Message::Close(None)).await;
            ctx.close_if_idle(&room).await;
            return Ok(());
        }
    };

    {
        let mut s = ctx.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }
    log::info!("Connection {conn_id} from {addr} joined room {}", room.name);

    // Current participants, so the newcomer sees them before their renewals
    let table = {
        let mut state = room.state.lock().await;
        state.awareness.expire(Instant::now());
        state.awareness.full_update()
    };
    if !table.is_empty() {
        let payload = table.encode()?;
        ws_sender.send(Message::Binary(Frame::awareness(payload).encode().into())).await?;
    }

    let result = connection_loop(&ctx, &room, conn_id, &mut ws_sender, &mut ws_receiver, &mut broadcast_rx).await;

    drop(broadcast_rx);
    release_participants(&room, conn_id).await;
    ctx.stats.write().await.active_connections -= 1;
    log::info!("Connection {conn_id} left room {}", room.name);
    ctx.close_if_idle(&room).await;

    result
}

/// Drop a connection from its room and broadcast gone markers for the
/// participants it announced that no other connection still announces.
async fn release_participants(room: &DocumentRoom, conn_id: ConnectionId) {
    let Some(participants) = room.broadcast.remove_peer(&conn_id).await else {
        return;
    };
    if participants.is_empty() {
        return;
    }
    let now = Instant::now();
    let mut state = room.state.lock().await;
    for participant in participants {
        // Checked under the state lock: a reconnect of the same
        // participant may already announce it elsewhere
        if room.broadcast.is_announced(participant).await {
            continue;
        }
        let gone = state.awareness.mark_gone(participant, now);
        if gone.is_empty() {
            continue;
        }
        match gone.encode() {
            Ok(payload) => {
                room.broadcast.broadcast_from(conn_id, Arc::new(Frame::awareness(payload).encode()));
            }
            Err(e) => log::warn!("Failed to encode gone marker: {e}"),
        }
    }
}

type WsSender = futures_util::stream::SplitSink<tokio_tungstenite::WebSocketStream<TcpStream>, Message>;
type WsReceiver = futures_util::stream::SplitStream<tokio_tungstenite::WebSocketStream<TcpStream>>;

async fn connection_loop(
    ctx: &ServerContext,
    room: &Arc<DocumentRoom>,
    conn_id: ConnectionId,
    ws_sender: &mut WsSender,
    ws_receiver: &mut WsReceiver,
    broadcast_rx: &mut broadcast::Receiver<Envelope>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let idle_timeout = ctx.config.idle_timeout();
    let mut decoder = FrameDecoder::new(ctx.config.max_frame_len);
    let mut corrupt_frames = 0u32;
    let mut last_heard = Instant::now();

    loop {
        let deadline = tokio::time::Instant::from_std(last_heard + idle_timeout);
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        last_heard = Instant::now();
                        {
                            let mut s = ctx.stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += data.len() as u64;
                        }
                        decoder.push(&data);
                        loop {
                            let reply = match decoder.next_frame() {
                                Ok(Some(frame)) => handle_frame(room, conn_id, frame).await,
                                Ok(None) => break,
                                Err(e) => Reply::Corrupt(e.to_string()),
                            };
                            match reply {
                                Reply::Send(frames) => {
                                    for frame in frames {
                                        ws_sender.send(Message::Binary(frame.encode().into())).await?;
                                    }
                                }
                                Reply::Corrupt(reason) => {
                                    corrupt_frames += 1;
                                    ctx.stats.write().await.corrupt_frames += 1;
                                    log::warn!(
                                        "Corrupt frame from {conn_id} ({corrupt_frames}/{}): {reason}",
                                        ctx.config.max_corrupt_frames
                                    );
                                    if corrupt_frames > ctx.config.max_corrupt_frames {
                                        log::warn!("Dropping {conn_id}: too many corrupt frames");
                                        let _ = ws_sender.send(Message::Close(None)).await;
                                        return Ok(());
                                    }
                                }
                            }
                        }
                    }

                    Some(Ok(Message::Close(_))) | None => {
                        log::debug!("Connection {conn_id} closed");
                        return Ok(());
                    }

                    Some(Ok(Message::Ping(data))) => {
                        last_heard = Instant::now();
                        ws_sender.send(Message::Pong(data)).await?;
                    }

                    Some(Err(e)) => {
                        log::warn!("WebSocket error on {conn_id}: {e}");
                        return Ok(());
                    }

                    _ => {}
                }
            }

            msg = broadcast_rx.recv() => {
                match msg {
                    Ok(envelope) => {
                        // Don't echo back to sender
                        if envelope.sender != conn_id {
                            ws_sender.send(Message::Binary(envelope.frame.to_vec().into())).await?;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Connection {conn_id} lagged by {n} frames, resyncing");
                        room.broadcast.record_dropped(n);
                        let sv = room.state.lock().await.doc.state_vector();
                        ws_sender.send(Message::Binary(Frame::sync_step1(sv.encode()).encode().into())).await?;
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }

            _ = tokio::time::sleep_until(deadline) => {
                log::info!("Connection {conn_id} silent for {idle_timeout:?}, dropping");
                let _ = ws_sender.send(Message::Close(None)).await;
                return Ok(());
            }
        }
    }
}

/// Apply one client frame to the room and produce the direct replies.
async fn handle_frame(room: &DocumentRoom, conn_id: ConnectionId, frame: Frame) -> Reply {
    match frame.msg_type {
        MessageType::SyncStep1 => {
            let Ok(remote) = StateVector::decode(&frame.payload) else {
                return Reply::Corrupt("bad state vector".into());
            };
            let state = room.state.lock().await;
            let diff = state.doc.diff_since(&remote);
            let ours = state.doc.state_vector();
            Reply::Send(vec![Frame::sync_step2(diff.encode()), Frame::sync_step1(ours.encode())])
        }
        MessageType::SyncStep2 | MessageType::Update => {
            let update = match Update::decode(&frame.payload) {
                Ok(update) => update,
                Err(e) => return Reply::Corrupt(e.to_string()),
            };
            if !update.is_empty() {
                let changes = room.state.lock().await.doc.merge(&update);
                log::trace!("Room {}: merged {} items, {} visible changes", room.name, update.len(), changes.len());
                room.broadcast
                    .broadcast_from(conn_id, Arc::new(Frame::update(frame.payload).encode()));
            }
            if frame.msg_type == MessageType::SyncStep2 {
                Reply::Send(vec![Frame::sync_done()])
            } else {
                Reply::Send(Vec::new())
            }
        }
        MessageType::Awareness => {
            let update = match AwarenessUpdate::decode(&frame.payload) {
                Ok(update) => update,
                Err(e) => return Reply::Corrupt(e.to_string()),
            };
            // Noted before applying, so a concurrent cleanup of an older
            // connection sees the participant as present here
            for record in &update.records {
                room.broadcast
                    .note_participant(&conn_id, record.participant, record.state.is_some())
                    .await;
            }
            let now = Instant::now();
            let change = {
                let mut state = room.state.lock().await;
                state.awareness.expire(now);
                state.awareness.apply_update(&update, now)
            };
            if !change.is_empty() {
                log::debug!(
                    "Room {}: presence +{} ~{} -{}",
                    room.name,
                    change.added.len(),
                    change.updated.len(),
                    change.removed.len()
                );
            }
            // Renewals are forwarded too; they keep the entry alive elsewhere
            room.broadcast
                .broadcast_from(conn_id, Arc::new(Frame::awareness(frame.payload).encode()));
            Reply::Send(Vec::new())
        }
        MessageType::Heartbeat => Reply::Send(vec![Frame::heartbeat()]),
        MessageType::SyncDone => Reply::Send(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::AwarenessRecord;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_peers_per_room, 100);
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.heartbeat_interval_secs, 15);
        assert_eq!(config.idle_timeout(), Duration::from_secs(45));
    }

    #[test]
    fn test_config_from_lookup() {
        let env: HashMap<&str, &str> = [
            ("TANDEM_BIND", "0.0.0.0:7000"),
            ("TANDEM_MAX_PEERS", "12"),
            ("TANDEM_HEARTBEAT_SECS", "soon"),
        ]
        .into_iter()
        .collect();
        let config = ServerConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.max_peers_per_room, 12);
        assert_eq!(config.heartbeat_interval_secs, 15);
    }

    #[test]
    fn test_room_from_path() {
        assert_eq!(room_from_path("/notes"), "notes");
        assert_eq!(room_from_path("/team/plan/"), "team/plan");
        assert_eq!(room_from_path("/"), DEFAULT_ROOM);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.active_rooms, 0);
        assert!(server.active_rooms().await.is_empty());
    }

    #[tokio::test]
    async fn test_handshake_replies() {
        let room = DocumentRoom::new("r".into(), Doc::seeded(RELAY_REPLICA, "abc"), 16);
        let conn = Uuid::new_v4();

        let Reply::Send(frames) = handle_frame(&room, conn, Frame::sync_step1(StateVector::new().encode())).await
        else {
            panic!("expected replies");
        };
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].msg_type, MessageType::SyncStep2);
        assert_eq!(frames[1].msg_type, MessageType::SyncStep1);
        let mut client = Doc::new(5);
        client.merge(&Update::decode(&frames[0].payload).unwrap());
        assert_eq!(client.text(), "abc");

        let edit = client.insert(3, "d").unwrap();
        let Reply::Send(frames) = handle_frame(&room, conn, Frame::sync_step2(edit.encode())).await else {
            panic!("expected SyncDone");
        };
        assert_eq!(frames, vec![Frame::sync_done()]);
        assert_eq!(room.state.lock().await.doc.text(), "abcd");
    }

    #[tokio::test]
    async fn test_updates_fan_out_to_others() {
        let room = DocumentRoom::new("r".into(), Doc::new(RELAY_REPLICA), 16);
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let _rx_alice = room.broadcast.add_peer(alice).await;
        let mut rx_bob = room.broadcast.add_peer(bob).await;

        let mut doc = Doc::new(1);
        let update = doc.insert(0, "hi").unwrap();
        handle_frame(&room, alice, Frame::update(update.encode())).await;

        let envelope = rx_bob.recv().await.unwrap();
        assert_eq!(envelope.sender, alice);
        let frame = Frame::decode(&envelope.frame).unwrap();
        assert_eq!(frame, Frame::update(update.encode()));
    }

    #[tokio::test]
    async fn test_corrupt_payloads_reported() {
        let room = DocumentRoom::new("r".into(), Doc::new(RELAY_REPLICA), 16);
        let conn = Uuid::new_v4();
        assert!(matches!(
            handle_frame(&room, conn, Frame::update(vec![0xFF, 0xFF])).await,
            Reply::Corrupt(_)
        ));
        assert!(matches!(
            handle_frame(&room, conn, Frame::awareness(vec![0xFF; 3])).await,
            Reply::Corrupt(_)
        ));
        assert!(matches!(
            handle_frame(&room, conn, Frame::heartbeat()).await,
            Reply::Send(frames) if frames == vec![Frame::heartbeat()]
        ));
    }

    #[tokio::test]
    async fn test_idle_room_persisted_and_reloaded() {
        let store = Arc::new(MemoryStore::new());
        let server = SyncServer::with_store(ServerConfig::default(), store.clone());

        let conn = Uuid::new_v4();
        let (room, _rx) = server.ctx.join("notes", conn, 10).await.unwrap();
        room.state.lock().await.doc.merge(&Doc::seeded(1, "kept").encode_state_as_update());
        room.broadcast.remove_peer(&conn).await;
        server.ctx.close_if_idle(&room).await;

        assert!(server.active_rooms().await.is_empty());
        assert_eq!(store.len(), 1);
        assert_eq!(server.stats().await.persisted_snapshots, 1);

        let (reopened, _rx) = server.ctx.join("notes", Uuid::new_v4(), 10).await.unwrap();
        assert_eq!(reopened.state.lock().await.doc.text(), "kept");
        assert_eq!(server.room_text("notes").await.as_deref(), Some("kept"));
    }

    #[tokio::test]
    async fn test_join_between_leave_and_close_keeps_room() {
        let store = Arc::new(MemoryStore::new());
        let server = SyncServer::with_store(ServerConfig::default(), store.clone());

        let first = Uuid::new_v4();
        let (room, _rx_first) = server.ctx.join("notes", first, 10).await.unwrap();
        room.broadcast.remove_peer(&first).await;

        // A newcomer arrives before the leaver's cleanup closes the room
        let second = Uuid::new_v4();
        let (joined, _rx_second) = server.ctx.join("notes", second, 10).await.unwrap();
        assert!(Arc::ptr_eq(&room, &joined));
        server.ctx.close_if_idle(&room).await;
        assert_eq!(server.active_rooms().await, vec!["notes".to_string()]);
        assert_eq!(store.len(), 0);

        joined.state.lock().await.doc.merge(&Doc::seeded(1, "kept").encode_state_as_update());
        let third = Uuid::new_v4();
        let (again, _rx_third) = server.ctx.join("notes", third, 10).await.unwrap();
        assert!(Arc::ptr_eq(&room, &again));
        assert_eq!(again.broadcast.peer_count().await, 2);

        room.broadcast.remove_peer(&second).await;
        room.broadcast.remove_peer(&third).await;
        server.ctx.close_if_idle(&room).await;
        assert!(server.active_rooms().await.is_empty());
        assert_eq!(store.load("notes").unwrap().unwrap().restore(2).unwrap().text(), "kept");
    }

    #[tokio::test]
    async fn test_full_room_rejects_join() {
        let server = SyncServer::with_defaults();
        let (room, _rx) = server.ctx.join("tiny", Uuid::new_v4(), 1).await.unwrap();
        let rejected = server.ctx.join("tiny", Uuid::new_v4(), 1).await;
        assert!(matches!(rejected, Err(full) if Arc::ptr_eq(&full, &room)));
        assert_eq!(room.broadcast.peer_count().await, 1);
    }

    #[tokio::test]
    async fn test_leaving_connection_keeps_participant_announced_elsewhere() {
        let room = DocumentRoom::new("r".into(), Doc::new(RELAY_REPLICA), 16);
        let old = Uuid::new_v4();
        let new = Uuid::new_v4();
        let watcher = Uuid::new_v4();
        let _rx_old = room.broadcast.add_peer(old).await;
        let _rx_new = room.broadcast.add_peer(new).await;
        let mut rx_watcher = room.broadcast.add_peer(watcher).await;

        let here = |clock| AwarenessUpdate {
            records: vec![AwarenessRecord { participant: 7, clock, state: Some(b"here".to_vec()) }],
        };
        handle_frame(&room, old, Frame::awareness(here(1).encode().unwrap())).await;
        handle_frame(&room, new, Frame::awareness(here(2).encode().unwrap())).await;
        while rx_watcher.try_recv().is_ok() {}

        // The stale connection goes away after the reload announced again
        release_participants(&room, old).await;
        assert!(rx_watcher.try_recv().is_err());
        assert_eq!(room.state.lock().await.awareness.participants(), vec![(7, b"here".to_vec())]);

        release_participants(&room, new).await;
        let envelope = rx_watcher.try_recv().unwrap();
        let frame = Frame::decode(&envelope.frame).unwrap();
        let gone = AwarenessUpdate::decode(&frame.payload).unwrap();
        assert_eq!(gone.records[0], AwarenessRecord { participant: 7, clock: 3, state: None });
        assert!(room.state.lock().await.awareness.participants().is_empty());
    }
}
