//! Snapshot persistence for document sessions.
//!
//! ```text
//! ┌──────────────────┐   hydrate (first subscribe)   ┌────────────────┐
//! │ DocumentSession  │ ◄──────────────────────────── │ SnapshotStore  │
//! │ (in-memory)      │ ────────────────────────────► │                │
//! └──────────────────┘   save (drain / close)        └────────────────┘
//! ```
//!
//! Stores hold point-in-time copies of a document's text and revision,
//! used for catch-up and crash recovery. They are called on session
//! hydration and teardown only — never on the submit hot path.

pub mod memory;
pub mod rocks;

pub use memory::MemorySnapshotStore;
pub use rocks::{DocumentMetadata, RocksSnapshotStore, StoreConfig};

use uuid::Uuid;

/// A persisted point-in-time copy of a document. Not authoritative once a
/// session for the document is live in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub doc_id: Uuid,
    pub text: String,
    pub revision: u64,
}

/// Persistence contract for document snapshots.
pub trait SnapshotStore: Send + Sync {
    /// Load the latest snapshot for a document, if one exists.
    fn load(&self, doc_id: Uuid) -> Result<Option<Snapshot>, StoreError>;

    /// Persist a snapshot, replacing any previous one for the document.
    fn save(&self, snapshot: &Snapshot) -> Result<(), StoreError>;

    /// Delete a document's snapshot. Removing a missing document is not
    /// an error.
    fn remove(&self, doc_id: Uuid) -> Result<(), StoreError>;

    /// All document ids with a persisted snapshot.
    fn list_documents(&self) -> Result<Vec<Uuid>, StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Backend failure (database, lock)
    DatabaseError(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}
