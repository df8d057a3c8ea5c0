//! In-memory snapshot store for tests and persistence-free deployments.
//!
//! Documents drained by their session survive here until the process
//! exits, so an identifier can be reopened and re-hydrated without a
//! database on disk.

use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use super::{Snapshot, SnapshotStore, StoreError};

#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: RwLock<HashMap<Uuid, Snapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self, doc_id: Uuid) -> Result<Option<Snapshot>, StoreError> {
        let snapshots = self
            .snapshots
            .read()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;
        Ok(snapshots.get(&doc_id).cloned())
    }

    fn save(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let mut snapshots = self
            .snapshots
            .write()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;
        snapshots.insert(snapshot.doc_id, snapshot.clone());
        Ok(())
    }

    fn remove(&self, doc_id: Uuid) -> Result<(), StoreError> {
        let mut snapshots = self
            .snapshots
            .write()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;
        snapshots.remove(&doc_id);
        Ok(())
    }

    fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        let snapshots = self
            .snapshots
            .read()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;
        Ok(snapshots.keys().cloned().collect())
    }
}
