//! # tandem-collab — Networking and presence for tandem documents
//!
//! Keeps [`tandem_core::Doc`] replicas in sync over unreliable connections
//! and shares live presence between participants.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐                         ┌───────────────┐
//! │ EditorBinding │                         │ SyncServer    │
//! └───────┬───────┘                         │ (relay)       │
//!         ▼              frames             └──────┬────────┘
//! ┌───────────────┐  ◄──────────────────►          │
//! │ SyncClient    │     WebSocket / TCP     ┌──────┴────────┐
//! │  └─ Session   │                         │ Room: Doc +   │
//! │     ├─ Doc    │                         │ Awareness +   │
//! │     └─ Aware. │                         │ BroadcastGroup│
//! └───────────────┘                         └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Frame format and incremental decoder
//! - [`awareness`] — Participant → presence table with expiry
//! - [`session`] — Sans-I/O sync state machine for one connection
//! - [`reconnect`] — Exponential backoff with jitter, cancellation
//! - [`transport`] — WebSocket and byte-stream transports
//! - [`client`] — Driver task owning a session across reconnects
//! - [`binding`] — Editor widget ⇄ replica glue
//! - [`broadcast`] — Room fan-out with backpressure
//! - [`server`] — WebSocket relay

pub mod awareness;
pub mod binding;
pub mod broadcast;
pub mod client;
pub mod protocol;
pub mod reconnect;
pub mod server;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use awareness::{
    Awareness, AwarenessChange, AwarenessRecord, AwarenessUpdate, CursorColor, ParticipantId,
    Presence, Selection,
};
pub use binding::{EditSink, EditorBinding, EditorWidget, WidgetEdit};
pub use broadcast::{BroadcastGroup, BroadcastStats, ConnectionId};
pub use client::{random_replica_id, ClientConfig, ClientError, SyncClient};
pub use protocol::{Frame, FrameDecoder, MessageType, ProtocolError, DEFAULT_MAX_FRAME_LEN};
pub use reconnect::{cancel_pair, Backoff, BackoffConfig, CancelHandle, CancelToken, WaitOutcome};
pub use server::{ServerConfig, ServerStats, SyncServer, RELAY_REPLICA};
pub use session::{OfflineQueue, Session, SessionConfig, SessionState, SyncEvent};
pub use transport::{
    Connector, StreamTransport, TcpConnector, Transport, TransportError, WsConnector, WsTransport,
};
