//! # tandem-core — document synchronization engine
//!
//! The pure core of Tandem's collaborative editing: single-span edit
//! operations, the transform engine that reconciles concurrent edits, and
//! the per-document sequencer that assigns revisions.
//!
//! ```text
//! client edit ──► Operation ──► DocumentState::submit
//!                                   │  fold across committed log
//!                                   │  (transform::include_committed)
//!                                   ▼
//!                            CommittedOperation ──► broadcast / replay
//! ```
//!
//! No async runtime, no I/O: everything here is exercisable from plain
//! unit tests. The networking layer lives in `tandem-collab`.

pub mod document;
pub mod operation;
pub mod transform;

pub use document::{DocumentState, SubmitError};
pub use operation::{CommittedOperation, Edit, Operation, SpanOutOfBounds};
pub use transform::{include, include_committed, include_set, transform};
