//! Per-document session: lifecycle, serialized sequencing, and fan-out.
//!
//! A session owns one document's authoritative [`DocumentState`] and its
//! [`DispatchGroup`]. Lifecycle:
//!
//! ```text
//! Empty ──subscribe──► Active ──last unsubscribe──► Draining
//!   ▲                    ▲                             │
//!   │                    └───────subscribe─────────────┤
//!   │                                                  │ grace elapsed:
//!   └────────subscribe (re-hydrate) ──── Closed ◄──────┘ snapshot + free
//! ```
//!
//! All submits for a document pass through the session's write lock, so
//! transform-apply-commit never races with itself, and committed frames
//! are broadcast under that same lock so channel order equals revision
//! order. Subscribe acquires the lock too, making catch-up atomic with
//! respect to new commits: the backlog and the live receiver are taken in
//! one critical section, so no operation is skipped or both replayed and
//! delivered live.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use tandem_core::{CommittedOperation, DocumentState, Operation, SubmitError};

use crate::dispatch::DispatchGroup;
use crate::protocol::Frame;
use crate::storage::{Snapshot, SnapshotStore, StoreError};

/// Session tuning knobs, shared by every session a registry creates.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Frames buffered per subscriber before it starts lagging
    pub broadcast_capacity: usize,
    /// How long a drained session lingers before snapshot + close
    pub drain_grace: Duration,
    /// Create documents with no backing snapshot on first subscribe;
    /// when false, such subscribes are rejected
    pub create_missing: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            drain_grace: Duration::from_secs(30),
            create_missing: true,
        }
    }
}

/// Lifecycle of a document session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// No subscribers, no in-memory text yet
    Empty,
    /// At least one subscriber; accepting operations
    Active,
    /// Last subscriber left; teardown timer running
    Draining,
    /// Memory released; reopening re-hydrates from the latest snapshot
    Closed,
}

/// How a subscriber is brought up to the present revision.
#[derive(Debug, Clone)]
pub enum Hydration {
    /// Full text replacement (first subscribe, or history no longer
    /// reaches the client's acknowledged revision)
    Snapshot { text: String, revision: u64 },
    /// Committed operations after the client's acknowledged revision,
    /// in order
    Backlog { operations: Vec<CommittedOperation> },
}

/// Result of a successful subscribe.
pub struct SubscribeOutcome {
    pub hydration: Hydration,
    /// Document revision at subscribe time
    pub revision: u64,
    /// Live feed; everything after `revision` (or after the backlog)
    /// arrives here in revision order
    pub receiver: broadcast::Receiver<Arc<Vec<u8>>>,
}

/// Session failures surfaced to the registry.
#[derive(Debug, Clone)]
pub enum SessionError {
    /// Session is closed; the caller must resubscribe
    Closed,
    /// No backing snapshot and auto-create is disabled
    UnknownDocument,
    Submit(SubmitError),
    Store(StoreError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "document session closed"),
            Self::UnknownDocument => write!(f, "unknown document"),
            Self::Submit(e) => write!(f, "{e}"),
            Self::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<SubmitError> for SessionError {
    fn from(e: SubmitError) -> Self {
        Self::Submit(e)
    }
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

struct SessionInner {
    state: DocumentState,
    lifecycle: Lifecycle,
    /// Bumped on every lifecycle transition; stale drain timers compare
    /// against it and stand down
    epoch: u64,
}

/// One live document.
pub struct DocumentSession {
    doc_id: Uuid,
    config: SessionConfig,
    store: Arc<dyn SnapshotStore>,
    dispatch: Arc<DispatchGroup>,
    inner: RwLock<SessionInner>,
}

impl DocumentSession {
    pub fn new(doc_id: Uuid, config: SessionConfig, store: Arc<dyn SnapshotStore>) -> Self {
        let dispatch = Arc::new(DispatchGroup::new(config.broadcast_capacity));
        Self {
            doc_id,
            config,
            store,
            dispatch,
            inner: RwLock::new(SessionInner {
                state: DocumentState::new(),
                lifecycle: Lifecycle::Empty,
                epoch: 0,
            }),
        }
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn dispatch(&self) -> &Arc<DispatchGroup> {
        &self.dispatch
    }

    /// Add a subscriber, hydrating the document first if the session is
    /// Empty or Closed. Returns the catch-up material and the live
    /// receiver, taken atomically with respect to commits.
    pub async fn subscribe(
        &self,
        client_id: Uuid,
        last_acked: Option<u64>,
    ) -> Result<SubscribeOutcome, SessionError> {
        let mut inner = self.inner.write().await;

        if matches!(inner.lifecycle, Lifecycle::Empty | Lifecycle::Closed) {
            inner.state = match self.store.load(self.doc_id)? {
                Some(snapshot) => {
                    log::info!(
                        "hydrated document {} at revision {}",
                        self.doc_id,
                        snapshot.revision
                    );
                    DocumentState::from_snapshot(snapshot.text, snapshot.revision)
                }
                None if self.config.create_missing => DocumentState::new(),
                None => return Err(SessionError::UnknownDocument),
            };
        }
        if inner.lifecycle == Lifecycle::Draining {
            log::debug!("document {} reactivated during drain", self.doc_id);
        }
        inner.lifecycle = Lifecycle::Active;
        inner.epoch += 1;

        let revision = inner.state.revision();
        let hydration = match last_acked {
            Some(acked) => match inner.state.operations_since(acked) {
                Ok(ops) => Hydration::Backlog {
                    operations: ops.to_vec(),
                },
                // Acked revision is ahead of us or behind the retained
                // log: fall back to a full hydrate.
                Err(_) => Hydration::Snapshot {
                    text: inner.state.text().to_string(),
                    revision,
                },
            },
            None => Hydration::Snapshot {
                text: inner.state.text().to_string(),
                revision,
            },
        };
        let acked_floor = match &hydration {
            Hydration::Snapshot { revision, .. } => *revision,
            Hydration::Backlog { .. } => last_acked.unwrap_or(0),
        };

        let receiver = self.dispatch.add_subscriber(client_id, acked_floor).await;
        let _ = self
            .dispatch
            .broadcast(&Frame::subscriber_joined(client_id, self.doc_id));

        Ok(SubscribeOutcome {
            hydration,
            revision,
            receiver,
        })
    }

    /// Remove a subscriber. Returns the drain epoch when the subscriber
    /// set became empty and the session entered Draining; the caller owns
    /// scheduling the teardown timer.
    pub async fn unsubscribe(&self, client_id: &Uuid) -> Option<u64> {
        let mut inner = self.inner.write().await;
        if self.dispatch.remove_subscriber(client_id).await.is_none() {
            return None;
        }
        let _ = self
            .dispatch
            .broadcast(&Frame::subscriber_left(*client_id, self.doc_id));

        if inner.lifecycle == Lifecycle::Active && self.dispatch.subscriber_count().await == 0 {
            inner.lifecycle = Lifecycle::Draining;
            inner.epoch += 1;
            log::info!("document {} draining", self.doc_id);
            return Some(inner.epoch);
        }
        None
    }

    /// Sequence one operation and broadcast the result.
    ///
    /// The whole transform-apply-commit-broadcast path runs under the
    /// session's write lock: submits for one document never race, and
    /// frames enter the channel in revision order. A disconnecting
    /// client's in-flight operation still commits — Draining accepts
    /// submits.
    pub async fn submit(&self, op: Operation) -> Result<CommittedOperation, SessionError> {
        let mut inner = self.inner.write().await;
        match inner.lifecycle {
            Lifecycle::Active | Lifecycle::Draining => {}
            Lifecycle::Empty | Lifecycle::Closed => return Err(SessionError::Closed),
        }

        match inner.state.submit(op) {
            Ok(committed) => {
                let _ = self
                    .dispatch
                    .broadcast(&Frame::committed(self.doc_id, &committed));
                Ok(committed)
            }
            Err(SubmitError::Corrupted(detail)) => {
                // Bounded blast radius: abandon this document only. Every
                // subscriber must resubscribe and re-hydrate from the last
                // good snapshot.
                log::error!(
                    "document {} state corrupted ({detail}); closing session",
                    self.doc_id
                );
                inner.lifecycle = Lifecycle::Closed;
                inner.epoch += 1;
                inner.state = DocumentState::new();
                Err(SessionError::Submit(SubmitError::Corrupted(detail)))
            }
            Err(e) => Err(SessionError::Submit(e)),
        }
    }

    /// Record a client's acknowledgement and prune committed history that
    /// every subscriber has seen.
    pub async fn acknowledge(&self, client_id: &Uuid, revision: u64) {
        let mut inner = self.inner.write().await;
        let clamped = revision.min(inner.state.revision());
        if self.dispatch.acknowledge(client_id, clamped).await {
            if let Some(min) = self.dispatch.min_acknowledged().await {
                inner.state.prune_history(min);
            }
        }
    }

    /// Drain-timer callback. Closes the session when no subscriber
    /// returned since the matching Draining transition; the text is
    /// snapshotted first so the identifier can be reopened. Returns true
    /// when the session closed.
    pub async fn try_close(&self, epoch: u64) -> bool {
        let mut inner = self.inner.write().await;
        if inner.epoch != epoch || inner.lifecycle != Lifecycle::Draining {
            return false;
        }

        let snapshot = Snapshot {
            doc_id: self.doc_id,
            text: inner.state.text().to_string(),
            revision: inner.state.revision(),
        };
        match self.store.save(&snapshot) {
            Ok(()) => log::info!(
                "persisted snapshot for document {} at revision {}",
                self.doc_id,
                snapshot.revision
            ),
            Err(e) => log::error!(
                "failed to persist snapshot for document {}: {e}",
                self.doc_id
            ),
        }

        inner.lifecycle = Lifecycle::Closed;
        inner.epoch += 1;
        inner.state = DocumentState::new();
        true
    }

    pub async fn lifecycle(&self) -> Lifecycle {
        self.inner.read().await.lifecycle
    }

    pub async fn revision(&self) -> u64 {
        self.inner.read().await.state.revision()
    }

    pub async fn text(&self) -> String {
        self.inner.read().await.state.text().to_string()
    }
}
