//! Document routing: one authoritative session per document identifier.
//!
//! The registry owns every [`DocumentSession`] and the client → document
//! map (a client subscribes to one document at a time). Creation is
//! atomic: two simultaneous first-subscribers are directed to a single
//! winning session — the losing creator's race is resolved here and never
//! surfaced to clients. Drained sessions are closed and reaped after the
//! configured grace period.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use tandem_core::{CommittedOperation, Operation};

use crate::session::{
    DocumentSession, Lifecycle, SessionConfig, SessionError, SubscribeOutcome,
};
use crate::storage::SnapshotStore;

/// Registry configuration, forwarded to every session it creates.
pub type RegistryConfig = SessionConfig;

/// Registry-level failures.
#[derive(Debug, Clone)]
pub enum RegistryError {
    /// The client has no current document subscription
    NotSubscribed(Uuid),
    Session(SessionError),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotSubscribed(client) => {
                write!(f, "client {client} is not subscribed to a document")
            }
            Self::Session(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RegistryError {}

impl From<SessionError> for RegistryError {
    fn from(e: SessionError) -> Self {
        Self::Session(e)
    }
}

/// Owner of all document sessions in the process. The sole mutation
/// point for session state — no ambient globals.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<DocumentSession>>>,
    /// client → the one document it is subscribed to
    clients: RwLock<HashMap<Uuid, Uuid>>,
    store: Arc<dyn SnapshotStore>,
    config: RegistryConfig,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig, store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            store,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    /// Get or lazily create the session for a document.
    async fn get_or_create(&self, doc_id: Uuid) -> Arc<DocumentSession> {
        // Fast path: read lock
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(&doc_id) {
                return session.clone();
            }
        }

        // Slow path: write lock to create
        let mut sessions = self.sessions.write().await;
        // Double-check after acquiring the write lock: a concurrent
        // creator may have won the race.
        if let Some(session) = sessions.get(&doc_id) {
            log::debug!("session creation race for document {doc_id}; using winner");
            return session.clone();
        }

        let session = Arc::new(DocumentSession::new(
            doc_id,
            self.config.clone(),
            self.store.clone(),
        ));
        sessions.insert(doc_id, session.clone());
        log::info!("created session for document {doc_id}");
        session
    }

    /// Subscribe a client to a document, returning the hydration material
    /// and live receiver. A client already subscribed elsewhere is moved.
    pub async fn subscribe(
        self: &Arc<Self>,
        client_id: Uuid,
        doc_id: Uuid,
        last_acked: Option<u64>,
    ) -> Result<SubscribeOutcome, RegistryError> {
        let previous = self.clients.write().await.insert(client_id, doc_id);
        if let Some(prev) = previous {
            if prev != doc_id {
                log::warn!("client {client_id} moved from document {prev} to {doc_id}");
                self.detach(client_id, prev).await;
            }
        }

        let session = self.get_or_create(doc_id).await;
        match session.subscribe(client_id, last_acked).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.clients.write().await.remove(&client_id);
                // A session left Empty by a rejected subscribe stays
                // resident; the next subscriber reuses it.
                Err(RegistryError::Session(e))
            }
        }
    }

    /// Remove a client from its document, scheduling teardown when it was
    /// the last subscriber.
    pub async fn unsubscribe(self: &Arc<Self>, client_id: &Uuid) {
        let doc_id = self.clients.write().await.remove(client_id);
        if let Some(doc_id) = doc_id {
            self.detach(*client_id, doc_id).await;
        }
    }

    async fn detach(self: &Arc<Self>, client_id: Uuid, doc_id: Uuid) {
        let session = self.sessions.read().await.get(&doc_id).cloned();
        if let Some(session) = session {
            if let Some(epoch) = session.unsubscribe(&client_id).await {
                self.schedule_drain(doc_id, epoch);
            }
        }
    }

    fn schedule_drain(self: &Arc<Self>, doc_id: Uuid, epoch: u64) {
        let registry = Arc::clone(self);
        let grace = self.config.drain_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let session = registry.sessions.read().await.get(&doc_id).cloned();
            if let Some(session) = session {
                if session.try_close(epoch).await {
                    registry.remove_if_closed(doc_id).await;
                }
            }
        });
    }

    async fn remove_if_closed(&self, doc_id: Uuid) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(&doc_id) {
            if session.lifecycle().await == Lifecycle::Closed {
                sessions.remove(&doc_id);
                log::info!("document session {doc_id} removed");
            }
        }
    }

    /// Route an operation to the client's session.
    pub async fn submit(
        &self,
        client_id: Uuid,
        op: Operation,
    ) -> Result<CommittedOperation, RegistryError> {
        let doc_id = self
            .clients
            .read()
            .await
            .get(&client_id)
            .copied()
            .ok_or(RegistryError::NotSubscribed(client_id))?;
        let session = self
            .sessions
            .read()
            .await
            .get(&doc_id)
            .cloned()
            .ok_or(RegistryError::NotSubscribed(client_id))?;
        session.submit(op).await.map_err(RegistryError::from)
    }

    /// Record a client's acknowledged revision.
    pub async fn acknowledge(&self, client_id: Uuid, revision: u64) {
        let doc_id = match self.clients.read().await.get(&client_id) {
            Some(doc_id) => *doc_id,
            None => return,
        };
        let session = self.sessions.read().await.get(&doc_id).cloned();
        if let Some(session) = session {
            session.acknowledge(&client_id, revision).await;
        }
    }

    /// The session a client is subscribed to, if any.
    pub async fn session_for(&self, client_id: &Uuid) -> Option<Arc<DocumentSession>> {
        let doc_id = *self.clients.read().await.get(client_id)?;
        self.sessions.read().await.get(&doc_id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<Uuid> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Hydration;
    use crate::storage::{MemorySnapshotStore, SnapshotStore};
    use std::time::Duration;

    fn test_registry(grace: Duration) -> (Arc<SessionRegistry>, Arc<MemorySnapshotStore>) {
        let store = Arc::new(MemorySnapshotStore::new());
        let registry = Arc::new(SessionRegistry::new(
            RegistryConfig {
                broadcast_capacity: 64,
                drain_grace: grace,
                create_missing: true,
            },
            store.clone(),
        ));
        (registry, store)
    }

    #[tokio::test]
    async fn test_one_session_per_document() {
        let (registry, _) = test_registry(Duration::from_secs(30));
        let doc_id = Uuid::new_v4();

        let s1 = registry.get_or_create(doc_id).await;
        let s2 = registry.get_or_create(doc_id).await;
        assert!(Arc::ptr_eq(&s1, &s2));
        assert_eq!(registry.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_subscribers_share_a_session() {
        let (registry, _) = test_registry(Duration::from_secs(30));
        let doc_id = Uuid::new_v4();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry
                        .subscribe(Uuid::new_v4(), doc_id, None)
                        .await
                        .unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(registry.session_count().await, 1);
        let session = registry.sessions.read().await.get(&doc_id).cloned().unwrap();
        assert_eq!(session.dispatch().subscriber_count().await, 8);
    }

    #[tokio::test]
    async fn test_subscribe_submit_flow() {
        let (registry, _) = test_registry(Duration::from_secs(30));
        let client = Uuid::new_v4();
        let doc_id = Uuid::new_v4();

        registry.subscribe(client, doc_id, None).await.unwrap();
        let committed = registry
            .submit(client, Operation::insert(client, 0, 0, "hi"))
            .await
            .unwrap();
        assert_eq!(committed.revision, 1);
    }

    #[tokio::test]
    async fn test_submit_without_subscribe_rejected() {
        let (registry, _) = test_registry(Duration::from_secs(30));
        let client = Uuid::new_v4();
        let err = registry
            .submit(client, Operation::insert(client, 0, 0, "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotSubscribed(_)));
    }

    #[tokio::test]
    async fn test_client_moves_between_documents() {
        let (registry, _) = test_registry(Duration::from_secs(30));
        let client = Uuid::new_v4();
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();

        registry.subscribe(client, doc_a, None).await.unwrap();
        registry.subscribe(client, doc_b, None).await.unwrap();
        assert_eq!(registry.client_count().await, 1);

        // The client's operations now route to document B.
        registry
            .submit(client, Operation::insert(client, 0, 0, "b"))
            .await
            .unwrap();
        let session_a = registry.sessions.read().await.get(&doc_a).cloned().unwrap();
        assert_eq!(session_a.revision().await, 0);
        let session_b = registry.sessions.read().await.get(&doc_b).cloned().unwrap();
        assert_eq!(session_b.revision().await, 1);
    }

    #[tokio::test]
    async fn test_drain_close_and_reap() {
        let (registry, store) = test_registry(Duration::from_millis(20));
        let client = Uuid::new_v4();
        let doc_id = Uuid::new_v4();

        registry.subscribe(client, doc_id, None).await.unwrap();
        registry
            .submit(client, Operation::insert(client, 0, 0, "saved"))
            .await
            .unwrap();
        registry.unsubscribe(&client).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(registry.session_count().await, 0);

        let snapshot = store.load(doc_id).unwrap().unwrap();
        assert_eq!(snapshot.text, "saved");

        // The identifier reopens from the snapshot.
        let outcome = registry.subscribe(client, doc_id, None).await.unwrap();
        match outcome.hydration {
            Hydration::Snapshot { text, revision } => {
                assert_eq!(text, "saved");
                assert_eq!(revision, 1);
            }
            Hydration::Backlog { .. } => panic!("expected snapshot hydrate"),
        }
    }

    #[tokio::test]
    async fn test_resubscribe_during_grace_keeps_session() {
        let (registry, _) = test_registry(Duration::from_millis(50));
        let client = Uuid::new_v4();
        let doc_id = Uuid::new_v4();

        registry.subscribe(client, doc_id, None).await.unwrap();
        registry
            .submit(client, Operation::insert(client, 0, 0, "alive"))
            .await
            .unwrap();
        registry.unsubscribe(&client).await;

        // Return before the grace period elapses.
        registry.subscribe(client, doc_id, Some(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(registry.session_count().await, 1);
        let session = registry.session_for(&client).await.unwrap();
        assert_eq!(session.text().await, "alive");
    }

    #[tokio::test]
    async fn test_unknown_document_policy() {
        let store: Arc<dyn SnapshotStore> = Arc::new(MemorySnapshotStore::new());
        let registry = Arc::new(SessionRegistry::new(
            RegistryConfig {
                create_missing: false,
                ..RegistryConfig::default()
            },
            store,
        ));

        let err = registry
            .subscribe(Uuid::new_v4(), Uuid::new_v4(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Session(SessionError::UnknownDocument)
        ));
        assert_eq!(registry.client_count().await, 0);
    }
}
