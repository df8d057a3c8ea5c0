//! WebSocket sync server with registry-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── SessionRegistry ── DocumentSession ── DispatchGroup
//! Client B ──┘                            │
//!                                         ├── SnapshotStore
//!                                         │    (memory or RocksDB)
//!                              ┌──────────┼───────────┐
//!                              ▼          ▼           ▼
//!                           Client A   Client B    Client C
//! ```
//!
//! Each connection drives a select loop over its socket and its
//! document's broadcast receiver. Operations are sequenced by the
//! session; committed frames flow back through the broadcast feed to
//! every subscriber, the author included — the author's own frame is its
//! acknowledgement. Rejections go to the originating connection only.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use tandem_core::SubmitError;

use crate::protocol::{Frame, FrameKind, RejectReason, SubscribeRequest};
use crate::registry::{RegistryConfig, RegistryError, SessionRegistry};
use crate::session::{Hydration, SessionError};
use crate::storage::{MemorySnapshotStore, RocksSnapshotStore, SnapshotStore, StoreConfig};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per document
    pub broadcast_capacity: usize,
    /// Grace period before an empty document session is torn down
    pub drain_grace_secs: u64,
    /// Auto-create documents with no backing snapshot
    pub create_missing: bool,
    /// Persistence storage path (None = in-memory snapshots only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            drain_grace_secs: 30,
            create_missing: true,
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub active_documents: usize,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a new sync server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let store: Arc<dyn SnapshotStore> = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Arc::new(
                    RocksSnapshotStore::open(store_config)
                        .expect("Failed to open snapshot store"),
                )
            }
            None => Arc::new(MemorySnapshotStore::new()),
        };

        let registry = Arc::new(SessionRegistry::new(
            RegistryConfig {
                broadcast_capacity: config.broadcast_capacity,
                drain_grace: Duration::from_secs(config.drain_grace_secs),
                create_missing: config.create_missing,
            },
            store,
        ));

        Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration (in-memory snapshots).
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Create with persistence enabled at the given path.
    pub fn with_storage(bind_addr: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let config = ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        };
        Self::new(config)
    }

    /// Survey persisted documents on startup. Sessions hydrate lazily on
    /// first subscribe, so this only reports what is available.
    pub async fn recover(&self) -> Result<usize, crate::storage::StoreError> {
        let docs = self.registry.store().list_documents()?;
        for doc_id in &docs {
            log::debug!("persisted document available: {doc_id}");
        }
        log::info!("{} persisted documents available for hydration", docs.len());
        Ok(docs.len())
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let recovered = self.recover().await?;
        if recovered > 0 {
            log::info!("{recovered} documents recoverable from persistent storage");
        }

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("sync server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry, stats).await {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<SessionRegistry>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // State for this connection
        let mut client_id: Option<Uuid> = None;
        let mut updates_rx: Option<broadcast::Receiver<Arc<Vec<u8>>>> = None;

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            let frame = match Frame::decode(&bytes) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    log::warn!("undecodable frame from {addr}: {e}");
                                    continue;
                                }
                            };

                            {
                                let mut s = stats.write().await;
                                s.total_frames += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            match frame.kind {
                                FrameKind::Subscribe => {
                                    let request = frame
                                        .subscribe_request()
                                        .unwrap_or(SubscribeRequest { last_acked: None });
                                    match registry
                                        .subscribe(frame.client_id, frame.doc_id, request.last_acked)
                                        .await
                                    {
                                        Ok(outcome) => {
                                            client_id = Some(frame.client_id);
                                            // Attach the live feed before replaying, so
                                            // nothing between backlog and live is skipped.
                                            updates_rx = Some(outcome.receiver);
                                            match outcome.hydration {
                                                Hydration::Snapshot { text, revision } => {
                                                    let reply = Frame::hydrate(frame.doc_id, &text, revision);
                                                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                                }
                                                Hydration::Backlog { operations } => {
                                                    for op in &operations {
                                                        let reply = Frame::committed(frame.doc_id, op);
                                                        ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                                    }
                                                }
                                            }
                                            log::info!(
                                                "client {} subscribed to document {} at revision {}",
                                                frame.client_id,
                                                frame.doc_id,
                                                outcome.revision
                                            );
                                            {
                                                let mut s = stats.write().await;
                                                s.active_documents = registry.session_count().await;
                                            }
                                        }
                                        Err(e) => {
                                            let reply = Frame::rejected(
                                                frame.client_id,
                                                frame.doc_id,
                                                &reject_reason(&e),
                                            );
                                            ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                        }
                                    }
                                }

                                FrameKind::Submit => {
                                    match frame.operation() {
                                        Ok(op) => {
                                            // The committed frame returns through the
                                            // document feed; only failures answer here.
                                            if let Err(e) = registry.submit(frame.client_id, op).await {
                                                let reply = Frame::rejected(
                                                    frame.client_id,
                                                    frame.doc_id,
                                                    &reject_reason(&e),
                                                );
                                                ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                            }
                                        }
                                        Err(e) => {
                                            let reply = Frame::rejected(
                                                frame.client_id,
                                                frame.doc_id,
                                                &RejectReason::Malformed(e.to_string()),
                                            );
                                            ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                        }
                                    }
                                }

                                FrameKind::Ack => {
                                    registry.acknowledge(frame.client_id, frame.revision).await;
                                }

                                FrameKind::Unsubscribe => {
                                    registry.unsubscribe(&frame.client_id).await;
                                    updates_rx = None;
                                    log::info!("client {} unsubscribed", frame.client_id);
                                }

                                FrameKind::Ping => {
                                    let reply = Frame::pong(frame.client_id);
                                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                }

                                _ => {
                                    log::debug!("unhandled frame kind {:?} from {addr}", frame.kind);
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing document feed
                update = async {
                    match updates_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        // No subscription yet — wait forever
                        None => std::future::pending().await,
                    }
                } => {
                    match update {
                        Ok(bytes) => {
                            ws_sender.send(Message::Binary(bytes.to_vec().into())).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            // The client missed frames; its next committed
                            // revision will show a gap and trigger a
                            // resubscribe on its side.
                            log::warn!("client {client_id:?} lagged by {n} frames");
                        }
                        Err(_) => break,
                    }
                }
            }
        }

        // Cleanup: drop the subscription. In-flight operations already
        // sequenced by the session still commit.
        if let Some(client) = client_id {
            registry.unsubscribe(&client).await;
        }
        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
            s.active_documents = registry.session_count().await;
        }

        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Get the session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }
}

/// Map internal errors onto the wire-level rejection taxonomy.
fn reject_reason(err: &RegistryError) -> RejectReason {
    match err {
        RegistryError::NotSubscribed(_) => RejectReason::NotSubscribed,
        RegistryError::Session(session_err) => match session_err {
            SessionError::Closed => RejectReason::SessionClosed,
            SessionError::UnknownDocument => RejectReason::UnknownDocument,
            SessionError::Store(e) => {
                log::error!("snapshot store failure surfaced to client: {e}");
                RejectReason::SessionClosed
            }
            SessionError::Submit(submit_err) => match submit_err {
                SubmitError::FutureRevision { base, current } => RejectReason::FutureRevision {
                    base: *base,
                    current: *current,
                },
                SubmitError::StaleRevision { base, floor } => RejectReason::StaleRevision {
                    base: *base,
                    floor: *floor,
                },
                SubmitError::OutOfRange { pos, len, doc_len } => RejectReason::OutOfRange {
                    pos: *pos,
                    len: *len,
                    doc_len: *doc_len,
                },
                SubmitError::Corrupted(_) => RejectReason::SessionClosed,
            },
        },
    }
}
