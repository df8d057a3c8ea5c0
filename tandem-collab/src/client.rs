//! WebSocket sync client for connecting to the collaboration server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, resubscribe)
//! - Revision tracking with duplicate suppression and gap detection
//! - One in-flight operation at a time; further edits queue behind it
//! - An edit queue that survives disconnects and replays on reconnect
//!
//! Edits are composed against the application's optimistic text (the
//! integrated document plus the client's own unconfirmed edits). To keep
//! those positions honest, the client runs the mirror image of the
//! server's reconciliation: every remote committed operation is bridged
//! across the in-flight edit and the queue with the same transform rules
//! the server uses, and a queued edit is only sent once the previous one
//! has committed, tagged with the revision current at send time.
//! Acknowledgements are sent automatically, but held back while local
//! edits are unconfirmed so the server never prunes history this client
//! still needs.

use std::collections::VecDeque;
use std::sync::Arc;
use futures_util::StreamExt;
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use tandem_core::{transform, CommittedOperation, Edit, Operation};

use crate::protocol::{Frame, FrameKind, ProtocolError, RejectReason};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Full document state received; replace the local buffer
    Hydrated { text: String, revision: u64 },
    /// A committed operation in revision order; `local` marks our own
    /// edits coming back transformed
    Committed {
        operation: CommittedOperation,
        local: bool,
    },
    /// A submit or subscribe of ours was rejected
    Rejected { reason: RejectReason },
    /// Another client joined the document
    SubscriberJoined(Uuid),
    /// Another client left the document
    SubscriberLeft(Uuid),
    /// A revision gap was detected; a resubscribe is already in flight
    Desynced { expected: u64, received: u64 },
}

/// Queue of edits composed while disconnected or while another edit is
/// in flight.
///
/// Each entry is a span set in the optimistic coordinate space of its
/// layer: it assumes every earlier entry (and the in-flight edit) has
/// been applied. Entries are re-positioned as remote commits arrive and
/// sent one at a time. Replay is at-least-once: an edit whose
/// acknowledgement was lost to a disconnect may be submitted twice,
/// detectably (same content, different revisions) by the application.
pub struct OfflineQueue {
    queue: VecDeque<Vec<Edit>>,
    max_size: usize,
}

impl OfflineQueue {
    /// Create a new offline queue with max capacity.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a span set for later submission. Returns false when full.
    pub fn enqueue(&mut self, edits: Vec<Edit>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(edits);
        true
    }

    /// Next span set to submit.
    pub fn pop(&mut self) -> Option<Vec<Edit>> {
        self.queue.pop_front()
    }

    /// Put a span set back at the head (an in-flight edit whose fate was
    /// lost to a disconnect).
    pub fn requeue_front(&mut self, edits: Vec<Edit>) {
        self.queue.push_front(edits);
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Vec<Edit>> {
        self.queue.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// The edit awaiting its committed frame.
struct InFlight {
    /// Where the edit now sits after bridging across remote commits —
    /// the same transform the server will apply when sequencing it
    edits: Vec<Edit>,
}

/// Mutable synchronization state shared with the reader task.
struct SyncCore {
    /// Highest committed revision integrated locally
    revision: u64,
    /// Whether an initial hydrate has been received
    hydrated: bool,
    in_flight: Option<InFlight>,
    queue: OfflineQueue,
}

impl SyncCore {
    /// Fold a remote committed operation across the in-flight edit and
    /// every queued layer (the zig-zag both directions), so local
    /// positions stay consistent with what the server will compute.
    fn bridge_remote(&mut self, committed: &CommittedOperation, client_id: Uuid) {
        let mut remote = committed.applied.clone();
        let author = committed.author;

        if let Some(in_flight) = self.in_flight.as_mut() {
            let new_remote = transform::include_set(&remote, author, &in_flight.edits, client_id);
            in_flight.edits =
                transform::include_set(&in_flight.edits, client_id, &remote, author);
            remote = new_remote;
        }
        for layer in self.queue.iter_mut() {
            let new_remote = transform::include_set(&remote, author, layer, client_id);
            *layer = transform::include_set(layer, client_id, &remote, author);
            remote = new_remote;
        }
    }
}

/// The sync client.
pub struct SyncClient {
    client_id: Uuid,
    doc_id: Uuid,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    core: Arc<Mutex<SyncCore>>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    /// Create a new sync client for one document.
    pub fn new(client_id: Uuid, doc_id: Uuid, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            client_id,
            doc_id,
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            core: Arc::new(Mutex::new(SyncCore {
                revision: 0,
                hydrated: false,
                in_flight: None,
                queue: OfflineQueue::new(10_000),
            })),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server and subscribe to the document.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(_) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel to the WebSocket.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx.clone());
        tokio::spawn(async move {
            use futures_util::SinkExt;
            while let Some(data) = out_rx.recv().await {
                if ws_writer
                    .send(tokio_tungstenite::tungstenite::Message::Binary(data.into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        // Subscribe, presenting our last integrated revision for catch-up.
        {
            let core = self.core.lock().await;
            let last_acked = core.hydrated.then_some(core.revision);
            let frame = Frame::subscribe(self.client_id, self.doc_id, last_acked);
            if let Ok(encoded) = frame.encode() {
                let _ = out_tx.send(encoded).await;
            }
        }

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        self.spawn_reader(ws_reader, out_tx);
        Ok(())
    }

    fn spawn_reader(
        &self,
        mut ws_reader: impl futures_util::Stream<
                Item = Result<
                    tokio_tungstenite::tungstenite::Message,
                    tokio_tungstenite::tungstenite::Error,
                >,
            > + Unpin
            + Send
            + 'static,
        out_tx: mpsc::Sender<Vec<u8>>,
    ) {
        let core = self.core.clone();
        let state = self.state.clone();
        let event_tx = self.event_tx.clone();
        let client_id = self.client_id;
        let doc_id = self.doc_id;

        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(tokio_tungstenite::tungstenite::Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let frame = match Frame::decode(&bytes) {
                            Ok(frame) => frame,
                            Err(e) => {
                                log::warn!("client {client_id}: undecodable frame: {e}");
                                continue;
                            }
                        };
                        Self::handle_frame(frame, client_id, doc_id, &core, &out_tx, &event_tx)
                            .await;
                    }
                    Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost: an unconfirmed in-flight edit goes back to
            // the queue head for replay after reconnect.
            {
                let mut core = core.lock().await;
                if let Some(in_flight) = core.in_flight.take() {
                    core.queue.requeue_front(in_flight.edits);
                }
            }
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });
    }

    async fn handle_frame(
        frame: Frame,
        client_id: Uuid,
        doc_id: Uuid,
        core: &Arc<Mutex<SyncCore>>,
        out_tx: &mpsc::Sender<Vec<u8>>,
        event_tx: &mpsc::Sender<SyncEvent>,
    ) {
        match frame.kind {
            FrameKind::Hydrate => {
                let text = match frame.hydrate_text() {
                    Ok(text) => text,
                    Err(e) => {
                        log::warn!("client {client_id}: bad hydrate payload: {e}");
                        return;
                    }
                };
                let mut guard = core.lock().await;
                guard.revision = frame.revision;
                guard.hydrated = true;
                // A fresh baseline invalidates bridging for anything still
                // unconfirmed; replay it best-effort against the new text.
                if let Some(in_flight) = guard.in_flight.take() {
                    guard.queue.requeue_front(in_flight.edits);
                }
                Self::pump_queue(&mut guard, client_id, doc_id, out_tx).await;
                drop(guard);
                let _ = event_tx
                    .send(SyncEvent::Hydrated {
                        text,
                        revision: frame.revision,
                    })
                    .await;
            }

            FrameKind::Committed => {
                let operation = match frame.committed_operation() {
                    Ok(op) => op,
                    Err(e) => {
                        log::warn!("client {client_id}: bad committed payload: {e}");
                        return;
                    }
                };
                let mut guard = core.lock().await;
                if operation.revision <= guard.revision {
                    // At-least-once delivery: same revision twice.
                    log::trace!(
                        "client {client_id}: duplicate revision {}",
                        operation.revision
                    );
                    return;
                }
                if operation.revision != guard.revision + 1 {
                    let expected = guard.revision + 1;
                    let received = operation.revision;
                    log::warn!(
                        "client {client_id}: revision gap (expected {expected}, got {received}); resubscribing"
                    );
                    let resub = Frame::subscribe(client_id, doc_id, Some(guard.revision));
                    if let Ok(encoded) = resub.encode() {
                        let _ = out_tx.send(encoded).await;
                    }
                    drop(guard);
                    let _ = event_tx.send(SyncEvent::Desynced { expected, received }).await;
                    return;
                }

                guard.revision = operation.revision;
                guard.hydrated = true;
                let local = operation.author == client_id;
                if local {
                    guard.in_flight = None;
                    Self::pump_queue(&mut guard, client_id, doc_id, out_tx).await;
                } else {
                    // Keep local unconfirmed edits positioned against the
                    // advancing document.
                    guard.bridge_remote(&operation, client_id);
                }
                // Acknowledge only once no local edit is unconfirmed, so
                // retained history always covers what we might resend.
                if guard.in_flight.is_none() && guard.queue.is_empty() {
                    let ack = Frame::ack(client_id, doc_id, guard.revision);
                    if let Ok(encoded) = ack.encode() {
                        let _ = out_tx.send(encoded).await;
                    }
                }
                drop(guard);
                let _ = event_tx.send(SyncEvent::Committed { operation, local }).await;
            }

            FrameKind::Rejected => {
                let reason = match frame.reject_reason() {
                    Ok(reason) => reason,
                    Err(e) => {
                        log::warn!("client {client_id}: bad rejection payload: {e}");
                        return;
                    }
                };
                let mut guard = core.lock().await;
                // Rejections only reach the author; the in-flight edit is dead.
                guard.in_flight = None;
                match reason {
                    RejectReason::FutureRevision { .. }
                    | RejectReason::StaleRevision { .. }
                    | RejectReason::SessionClosed => {
                        // Desynchronized: re-hydrate from scratch.
                        guard.hydrated = false;
                        let resub = Frame::subscribe(client_id, doc_id, None);
                        if let Ok(encoded) = resub.encode() {
                            let _ = out_tx.send(encoded).await;
                        }
                    }
                    _ => {
                        Self::pump_queue(&mut guard, client_id, doc_id, out_tx).await;
                    }
                }
                drop(guard);
                let _ = event_tx.send(SyncEvent::Rejected { reason }).await;
            }

            FrameKind::SubscriberJoined => {
                if frame.client_id != client_id {
                    let _ = event_tx.send(SyncEvent::SubscriberJoined(frame.client_id)).await;
                }
            }

            FrameKind::SubscriberLeft => {
                if frame.client_id != client_id {
                    let _ = event_tx.send(SyncEvent::SubscriberLeft(frame.client_id)).await;
                }
            }

            FrameKind::Pong => {}

            _ => {
                log::debug!("client {client_id}: unhandled frame kind {:?}", frame.kind);
            }
        }
    }

    /// Send the next queued edit when nothing is in flight.
    ///
    /// A queue layer that bridged into multiple spans is sent one span at
    /// a time: the first span goes in flight and the remainder returns to
    /// the queue head, shifted into the coordinates left behind by the
    /// spans before it.
    async fn pump_queue(
        core: &mut SyncCore,
        client_id: Uuid,
        doc_id: Uuid,
        out_tx: &mpsc::Sender<Vec<u8>>,
    ) {
        if core.in_flight.is_some() {
            return;
        }
        while let Some(mut edits) = core.queue.pop() {
            edits.retain(|edit| !edit.is_empty());
            if edits.is_empty() {
                // Fully annulled by concurrent remote edits.
                continue;
            }
            let first = edits.remove(0);
            if !edits.is_empty() {
                let shift = first.len();
                for edit in edits.iter_mut() {
                    if let Edit::Delete { pos, .. } = edit {
                        *pos -= shift;
                    }
                }
                core.queue.requeue_front(edits);
            }
            let op = Operation {
                author: client_id,
                base_revision: core.revision,
                edit: first.clone(),
            };
            core.in_flight = Some(InFlight { edits: vec![first] });
            let frame = Frame::submit(client_id, doc_id, &op);
            if let Ok(encoded) = frame.encode() {
                let _ = out_tx.send(encoded).await;
            }
            return;
        }
    }

    /// Submit one edit, composed against the application's optimistic
    /// text (integrated document plus unconfirmed local edits).
    ///
    /// The edit goes straight to the server when the connection is up and
    /// nothing else is in flight; otherwise it queues behind the edits
    /// before it.
    pub async fn submit_edit(&self, edit: Edit) -> Result<(), ProtocolError> {
        let mut core = self.core.lock().await;

        let connected = *self.state.read().await == ConnectionState::Connected;
        if !connected || core.in_flight.is_some() || !core.queue.is_empty() {
            if !core.queue.enqueue(vec![edit]) {
                return Err(ProtocolError::ConnectionClosed);
            }
            return Ok(());
        }

        let op = Operation {
            author: self.client_id,
            base_revision: core.revision,
            edit: edit.clone(),
        };
        core.in_flight = Some(InFlight { edits: vec![edit] });
        drop(core);
        self.send_frame(&Frame::submit(self.client_id, self.doc_id, &op)).await
    }

    /// Leave the document. The connection stays up.
    pub async fn unsubscribe(&self) -> Result<(), ProtocolError> {
        self.send_frame(&Frame::unsubscribe(self.client_id, self.doc_id)).await
    }

    /// Send a heartbeat ping.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send_frame(&Frame::ping(self.client_id)).await
    }

    async fn send_frame(&self, frame: &Frame) -> Result<(), ProtocolError> {
        let encoded = frame.encode()?;
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Highest committed revision integrated locally.
    pub async fn revision(&self) -> u64 {
        self.core.lock().await.revision
    }

    /// Number of edit layers queued behind the in-flight edit.
    pub async fn queued_len(&self) -> usize {
        self.core.lock().await.queue.len()
    }

    /// Whether an edit is awaiting its committed frame.
    pub async fn has_pending(&self) -> bool {
        self.core.lock().await.in_flight.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client_id = Uuid::new_v4();
        let doc_id = Uuid::new_v4();
        let client = SyncClient::new(client_id, doc_id, "ws://localhost:9090");

        assert_eq!(client.client_id(), client_id);
        assert_eq!(client.doc_id(), doc_id);
        assert_eq!(client.server_url(), "ws://localhost:9090");
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = SyncClient::new(Uuid::new_v4(), Uuid::new_v4(), "ws://localhost:9090");

        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.revision().await, 0);
        assert_eq!(client.queued_len().await, 0);
        assert!(!client.has_pending().await);
    }

    #[tokio::test]
    async fn test_submit_edit_offline_queues() {
        let client = SyncClient::new(Uuid::new_v4(), Uuid::new_v4(), "ws://localhost:9090");

        client.submit_edit(Edit::insert(0, "a")).await.unwrap();
        assert_eq!(client.queued_len().await, 1);

        client.submit_edit(Edit::insert(1, "b")).await.unwrap();
        assert_eq!(client.queued_len().await, 2);
        assert!(!client.has_pending().await);
    }

    #[test]
    fn test_offline_queue() {
        let mut queue = OfflineQueue::new(100);
        assert!(queue.is_empty());

        queue.enqueue(vec![Edit::insert(0, "a")]);
        queue.enqueue(vec![Edit::insert(1, "b")]);
        assert_eq!(queue.len(), 2);

        let first = queue.pop().unwrap();
        assert_eq!(first, vec![Edit::insert(0, "a")]);

        queue.requeue_front(first);
        assert_eq!(queue.pop().unwrap(), vec![Edit::insert(0, "a")]);
        assert_eq!(queue.pop().unwrap(), vec![Edit::insert(1, "b")]);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_offline_queue_capacity() {
        let mut queue = OfflineQueue::new(2);

        assert!(queue.enqueue(vec![Edit::insert(0, "a")]));
        assert!(queue.enqueue(vec![Edit::insert(0, "b")]));
        assert!(!queue.enqueue(vec![Edit::insert(0, "c")]));
        assert_eq!(queue.len(), 2);

        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_bridge_remote_repositions_queued_edits() {
        let me = Uuid::parse_str("00000000-0000-0000-0000-00000000000b").unwrap();
        let them = Uuid::parse_str("00000000-0000-0000-0000-00000000000a").unwrap();
        let mut core = SyncCore {
            revision: 0,
            hydrated: true,
            in_flight: Some(InFlight {
                edits: vec![Edit::insert(3, "x")],
            }),
            queue: OfflineQueue::new(100),
        };
        core.queue.enqueue(vec![Edit::insert(4, "y")]);

        // Remote client inserted five characters at the front.
        let committed = CommittedOperation {
            revision: 1,
            author: them,
            base_revision: 0,
            applied: vec![Edit::insert(0, "abcde")],
        };
        core.bridge_remote(&committed, me);

        assert_eq!(
            core.in_flight.as_ref().unwrap().edits,
            vec![Edit::insert(8, "x")]
        );
        let layer = core.queue.pop().unwrap();
        assert_eq!(layer, vec![Edit::insert(9, "y")]);
    }

    #[test]
    fn test_bridge_remote_splits_queued_delete() {
        let me = Uuid::parse_str("00000000-0000-0000-0000-00000000000b").unwrap();
        let them = Uuid::parse_str("00000000-0000-0000-0000-00000000000a").unwrap();
        let mut core = SyncCore {
            revision: 0,
            hydrated: true,
            in_flight: None,
            queue: OfflineQueue::new(100),
        };
        // We queued a delete of five characters at the front.
        core.queue.enqueue(vec![Edit::delete(0, 5)]);

        // A remote insert lands inside that range.
        let committed = CommittedOperation {
            revision: 1,
            author: them,
            base_revision: 0,
            applied: vec![Edit::insert(2, "X")],
        };
        core.bridge_remote(&committed, me);

        let layer = core.queue.pop().unwrap();
        assert_eq!(layer, vec![Edit::delete(0, 2), Edit::delete(3, 3)]);
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = SyncClient::new(Uuid::new_v4(), Uuid::new_v4(), "ws://localhost:9090");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_send_frame_without_connection_errors() {
        let client = SyncClient::new(Uuid::new_v4(), Uuid::new_v4(), "ws://localhost:9090");
        assert!(client.send_ping().await.is_err());
        assert!(client.unsubscribe().await.is_err());
    }

    #[test]
    fn test_connection_state_values() {
        assert_ne!(ConnectionState::Disconnected, ConnectionState::Connected);
        assert_ne!(ConnectionState::Connecting, ConnectionState::Reconnecting);
    }
}
