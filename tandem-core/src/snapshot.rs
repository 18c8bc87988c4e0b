//! Document snapshots and the persistence seam.
//!
//! ```text
//! ┌──────────┐ capture ┌──────────────────────────────┐ save ┌───────────────┐
//! │   Doc    │ ──────► │ Snapshot                     │ ───► │ SnapshotStore │
//! │          │ ◄────── │  content (plain text)        │ ◄─── │ (memory, ...) │
//! └──────────┘ restore │  state vector                │ load └───────────────┘
//!                      │  full-state update (LZ4)     │
//!                      └──────────────────────────────┘
//! ```
//!
//! The engine never touches storage itself. Shells (the relay server, an
//! application) load a snapshot when a document opens and save one when it
//! goes idle.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::doc::Doc;
use crate::item::ReplicaId;
use crate::state_vector::StateVector;
use crate::update::Update;

/// Persisted state of one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Visible text at capture time.
    pub content: String,
    pub state_vector: StateVector,
    /// LZ4-compressed full-state update, tombstones included.
    update: Vec<u8>,
}

impl Snapshot {
    /// Capture the complete state of `doc`.
    pub fn capture(doc: &Doc) -> Self {
        let encoded = doc.encode_state_as_update().encode();
        Self {
            content: doc.text(),
            state_vector: doc.state_vector(),
            update: lz4_flex::compress_prepend_size(&encoded),
        }
    }

    /// Rebuild a replica from this snapshot.
    ///
    /// The restored replica holds the same items as the captured one, so it
    /// can resume syncing with peers that saw the original.
    pub fn restore(&self, replica: ReplicaId) -> Result<Doc, StoreError> {
        let encoded = lz4_flex::decompress_size_prepended(&self.update)
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        let update = Update::decode(&encoded).map_err(|e| StoreError::Decode(e.to_string()))?;
        let doc = Doc::from_update(replica, &update);
        if doc.pending_len() > 0 || doc.text() != self.content {
            return Err(StoreError::Decode(format!(
                "snapshot content mismatch ({} items left unintegrated)",
                doc.pending_len()
            )));
        }
        Ok(doc)
    }

    /// Size of the compressed update in bytes.
    pub fn compressed_len(&self) -> usize {
        self.update.len()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Encode(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        let (snapshot, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(snapshot)
    }
}

/// Snapshot store errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Serialization failed
    Encode(String),
    /// Stored bytes could not be turned back into a document
    Decode(String),
    /// The backing store failed
    Backend(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Encode(e) => write!(f, "Snapshot encode error: {e}"),
            StoreError::Decode(e) => write!(f, "Snapshot decode error: {e}"),
            StoreError::Backend(e) => write!(f, "Store backend error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// External persistence service, keyed by document name.
pub trait SnapshotStore: Send + Sync {
    fn load(&self, document: &str) -> Result<Option<Snapshot>, StoreError>;
    fn save(&self, document: &str, snapshot: &Snapshot) -> Result<(), StoreError>;
}

/// In-process store holding serialized snapshots.
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.documents.read().map(|docs| docs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotStore for MemoryStore {
    fn load(&self, document: &str) -> Result<Option<Snapshot>, StoreError> {
        let docs = self
            .documents
            .read()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        docs.get(document).map(|bytes| Snapshot::from_bytes(bytes)).transpose()
    }

    fn save(&self, document: &str, snapshot: &Snapshot) -> Result<(), StoreError> {
        let bytes = snapshot.to_bytes()?;
        log::debug!("Saving snapshot for '{document}' ({} bytes)", bytes.len());
        self.documents
            .write()
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .insert(document.to_string(), bytes);
        Ok(())
    }
}
