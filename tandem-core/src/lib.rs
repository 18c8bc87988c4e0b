//! # tandem-core — Replicated text engine
//!
//! I/O-free core of tandem: a sequence CRDT over plain text, its binary
//! update format, and the snapshot seam used by persistence shells.
//!
//! ## Architecture
//!
//! ```text
//! local edit ──► Doc::insert / Doc::delete ──► Update ──► encode() ──► wire
//!                                                                    │
//! wire ──► Update::decode ──► Doc::merge ──► Vec<TextChange> ◄───────┘
//!                                │
//!                                ▼
//!                     Snapshot ◄──► SnapshotStore
//! ```
//!
//! ## Modules
//!
//! - [`doc`] — Replicated text model (YATA integration, pending buffers)
//! - [`update`] — Update records, delete sets, binary codec
//! - [`state_vector`] — Per-replica high-water marks
//! - [`encoding`] — LEB128 varints and a bounds-checked reader
//! - [`snapshot`] — Snapshots and the persistence trait
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Local insert (100k char doc) | <20μs |
//! | Encode 1k sequential chars | one block |
//! | Merge 1k item update | <2ms |

pub mod doc;
pub mod encoding;
pub mod error;
pub mod item;
mod sequence;
pub mod snapshot;
pub mod state_vector;
pub mod update;

pub use doc::{Doc, TextChange};
pub use error::EngineError;
pub use item::{ItemId, ItemRecord, ReplicaId, SEED_REPLICA};
pub use snapshot::{MemoryStore, Snapshot, SnapshotStore, StoreError};
pub use state_vector::StateVector;
pub use update::{DeleteSet, Update, UPDATE_VERSION};
