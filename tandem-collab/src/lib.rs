//! # tandem-collab — server-mediated document synchronization
//!
//! Real-time collaborative editing over WebSocket, sequenced by a central
//! server using the operational-transform engine from `tandem-core`.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────────┐
//! │ SyncClient  │ ◄────────────────► │ SyncServer      │
//! │ (per user)  │    Binary Frames   │                 │
//! └─────────────┘                    └───────┬─────────┘
//!                                            │
//!                                   ┌────────┴────────┐
//!                                   │ SessionRegistry │  one owner per
//!                                   └────────┬────────┘  document id
//!                                            │
//!                                   ┌────────┴────────┐
//!                                   │ DocumentSession │  serialize,
//!                                   │  (tandem-core)  │  transform,
//!                                   └────────┬────────┘  commit
//!                                    ┌───────┴───────┐
//!                                    │ DispatchGroup │  revision-ordered
//!                                    │  (fan-out)    │  broadcast
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded frames)
//! - [`session`] — Per-document lifecycle and sequencing
//! - [`registry`] — Document routing and session ownership
//! - [`dispatch`] — Revision-ordered fan-out with backpressure
//! - [`server`] — WebSocket sync server
//! - [`client`] — WebSocket sync client with offline queue
//! - [`storage`] — Snapshot persistence (in-memory and RocksDB)

pub mod client;
pub mod dispatch;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use client::{ConnectionState, OfflineQueue, SyncClient, SyncEvent};
pub use dispatch::{DispatchGroup, DispatchStats};
pub use protocol::{Frame, FrameKind, ProtocolError, RejectReason, SubscribeRequest};
pub use registry::{RegistryConfig, RegistryError, SessionRegistry};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{
    DocumentSession, Hydration, Lifecycle, SessionConfig, SessionError, SubscribeOutcome,
};
pub use storage::{
    DocumentMetadata, MemorySnapshotStore, RocksSnapshotStore, Snapshot, SnapshotStore,
    StoreConfig, StoreError,
};
