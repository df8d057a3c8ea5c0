//! Binary protocol for document synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ kind     │ client_id │ doc_id   │ revision │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes │ 8 bytes  │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Every message is one of a small closed set of tagged frames with an
//! explicit payload schema; malformed input is rejected as data, never
//! interpreted.

use serde::{Deserialize, Serialize};
use tandem_core::{CommittedOperation, Operation};
use uuid::Uuid;

/// Frame kinds for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameKind {
    /// Client joins a document, optionally presenting its last
    /// acknowledged revision for catch-up
    Subscribe = 1,
    /// Full document state for a (re)joining client
    Hydrate = 2,
    /// Client submits one operation
    Submit = 3,
    /// A committed operation, fanned out to every subscriber (the
    /// author's own frame doubles as its acknowledgement)
    Committed = 4,
    /// Submit or subscribe rejected; sent to the originator only
    Rejected = 5,
    /// Client acknowledges having integrated up to a revision
    Ack = 6,
    /// Client leaves its document
    Unsubscribe = 7,
    /// Another client joined the document
    SubscriberJoined = 8,
    /// Another client left the document
    SubscriberLeft = 9,
    /// Heartbeat ping
    Ping = 10,
    /// Heartbeat pong
    Pong = 11,
}

/// Subscribe payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SubscribeRequest {
    /// Highest committed revision the client has integrated; `None`
    /// requests a full hydrate.
    pub last_acked: Option<u64>,
}

/// Why a request was rejected. Mirrors the sequencer's error taxonomy;
/// rejections reach the originating client only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    OutOfRange {
        pos: usize,
        len: usize,
        doc_len: usize,
    },
    FutureRevision {
        base: u64,
        current: u64,
    },
    StaleRevision {
        base: u64,
        floor: u64,
    },
    UnknownDocument,
    NotSubscribed,
    SessionClosed,
    Malformed(String),
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfRange { pos, len, doc_len } => {
                write!(f, "span at {pos} (len {len}) outside document of {doc_len} chars")
            }
            Self::FutureRevision { base, current } => {
                write!(f, "base revision {base} ahead of document revision {current}")
            }
            Self::StaleRevision { base, floor } => {
                write!(f, "base revision {base} below retained history floor {floor}")
            }
            Self::UnknownDocument => write!(f, "unknown document"),
            Self::NotSubscribed => write!(f, "client is not subscribed to a document"),
            Self::SessionClosed => write!(f, "document session closed"),
            Self::Malformed(detail) => write!(f, "malformed request: {detail}"),
        }
    }
}

/// Top-level protocol frame.
///
/// Serialized with bincode for minimal overhead. The `revision` header
/// carries the committed, acknowledged, or hydrated revision depending on
/// `kind`, and is zero otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub kind: FrameKind,
    pub client_id: Uuid,
    pub doc_id: Uuid,
    pub revision: u64,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a subscribe frame.
    pub fn subscribe(client_id: Uuid, doc_id: Uuid, last_acked: Option<u64>) -> Self {
        let payload = bincode::serde::encode_to_vec(
            SubscribeRequest { last_acked },
            bincode::config::standard(),
        )
        .unwrap_or_default();
        Self {
            kind: FrameKind::Subscribe,
            client_id,
            doc_id,
            revision: last_acked.unwrap_or(0),
            payload,
        }
    }

    /// Create a hydrate frame carrying the full document text.
    pub fn hydrate(doc_id: Uuid, text: &str, revision: u64) -> Self {
        let payload = bincode::serde::encode_to_vec(text, bincode::config::standard())
            .unwrap_or_default();
        Self {
            kind: FrameKind::Hydrate,
            client_id: Uuid::nil(),
            doc_id,
            revision,
            payload,
        }
    }

    /// Create a submit frame for one operation.
    pub fn submit(client_id: Uuid, doc_id: Uuid, operation: &Operation) -> Self {
        let payload = bincode::serde::encode_to_vec(operation, bincode::config::standard())
            .unwrap_or_default();
        Self {
            kind: FrameKind::Submit,
            client_id,
            doc_id,
            revision: operation.base_revision,
            payload,
        }
    }

    /// Create a committed frame. The author's id rides in the header so
    /// receivers can tell their own acknowledgement from remote edits.
    pub fn committed(doc_id: Uuid, operation: &CommittedOperation) -> Self {
        let payload = bincode::serde::encode_to_vec(operation, bincode::config::standard())
            .unwrap_or_default();
        Self {
            kind: FrameKind::Committed,
            client_id: operation.author,
            doc_id,
            revision: operation.revision,
            payload,
        }
    }

    /// Create a rejection frame.
    pub fn rejected(client_id: Uuid, doc_id: Uuid, reason: &RejectReason) -> Self {
        let payload = bincode::serde::encode_to_vec(reason, bincode::config::standard())
            .unwrap_or_default();
        Self {
            kind: FrameKind::Rejected,
            client_id,
            doc_id,
            revision: 0,
            payload,
        }
    }

    /// Create an acknowledgement frame.
    pub fn ack(client_id: Uuid, doc_id: Uuid, revision: u64) -> Self {
        Self {
            kind: FrameKind::Ack,
            client_id,
            doc_id,
            revision,
            payload: Vec::new(),
        }
    }

    /// Create an unsubscribe frame.
    pub fn unsubscribe(client_id: Uuid, doc_id: Uuid) -> Self {
        Self {
            kind: FrameKind::Unsubscribe,
            client_id,
            doc_id,
            revision: 0,
            payload: Vec::new(),
        }
    }

    /// Create a subscriber-joined notification.
    pub fn subscriber_joined(client_id: Uuid, doc_id: Uuid) -> Self {
        Self {
            kind: FrameKind::SubscriberJoined,
            client_id,
            doc_id,
            revision: 0,
            payload: Vec::new(),
        }
    }

    /// Create a subscriber-left notification.
    pub fn subscriber_left(client_id: Uuid, doc_id: Uuid) -> Self {
        Self {
            kind: FrameKind::SubscriberLeft,
            client_id,
            doc_id,
            revision: 0,
            payload: Vec::new(),
        }
    }

    /// Create a ping frame.
    pub fn ping(client_id: Uuid) -> Self {
        Self {
            kind: FrameKind::Ping,
            client_id,
            doc_id: Uuid::nil(),
            revision: 0,
            payload: Vec::new(),
        }
    }

    /// Create a pong frame.
    pub fn pong(client_id: Uuid) -> Self {
        Self {
            kind: FrameKind::Pong,
            client_id,
            doc_id: Uuid::nil(),
            revision: 0,
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(frame)
    }

    /// Parse a subscribe payload.
    pub fn subscribe_request(&self) -> Result<SubscribeRequest, ProtocolError> {
        if self.kind != FrameKind::Subscribe {
            return Err(ProtocolError::InvalidFrameKind);
        }
        Self::decode_payload(&self.payload)
    }

    /// Parse a hydrate payload.
    pub fn hydrate_text(&self) -> Result<String, ProtocolError> {
        if self.kind != FrameKind::Hydrate {
            return Err(ProtocolError::InvalidFrameKind);
        }
        Self::decode_payload(&self.payload)
    }

    /// Parse a submit payload.
    pub fn operation(&self) -> Result<Operation, ProtocolError> {
        if self.kind != FrameKind::Submit {
            return Err(ProtocolError::InvalidFrameKind);
        }
        Self::decode_payload(&self.payload)
    }

    /// Parse a committed payload.
    pub fn committed_operation(&self) -> Result<CommittedOperation, ProtocolError> {
        if self.kind != FrameKind::Committed {
            return Err(ProtocolError::InvalidFrameKind);
        }
        Self::decode_payload(&self.payload)
    }

    /// Parse a rejection payload.
    pub fn reject_reason(&self) -> Result<RejectReason, ProtocolError> {
        if self.kind != FrameKind::Rejected {
            return Err(ProtocolError::InvalidFrameKind);
        }
        Self::decode_payload(&self.payload)
    }

    fn decode_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
        let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(value)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidFrameKind,
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidFrameKind => write!(f, "Invalid frame kind"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::Edit;

    #[test]
    fn test_subscribe_roundtrip() {
        let client = Uuid::new_v4();
        let doc = Uuid::new_v4();

        let msg = Frame::subscribe(client, doc, Some(42));
        let decoded = Frame::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.kind, FrameKind::Subscribe);
        assert_eq!(decoded.client_id, client);
        assert_eq!(decoded.doc_id, doc);
        assert_eq!(decoded.subscribe_request().unwrap().last_acked, Some(42));
    }

    #[test]
    fn test_hydrate_roundtrip() {
        let doc = Uuid::new_v4();
        let msg = Frame::hydrate(doc, "fn main() {}", 7);
        let decoded = Frame::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.kind, FrameKind::Hydrate);
        assert_eq!(decoded.revision, 7);
        assert_eq!(decoded.hydrate_text().unwrap(), "fn main() {}");
    }

    #[test]
    fn test_submit_roundtrip() {
        let client = Uuid::new_v4();
        let doc = Uuid::new_v4();
        let op = Operation::insert(client, 3, 10, "hello");

        let msg = Frame::submit(client, doc, &op);
        let decoded = Frame::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.kind, FrameKind::Submit);
        assert_eq!(decoded.revision, 3);
        assert_eq!(decoded.operation().unwrap(), op);
    }

    #[test]
    fn test_committed_roundtrip() {
        let author = Uuid::new_v4();
        let doc = Uuid::new_v4();
        let committed = CommittedOperation {
            revision: 9,
            author,
            base_revision: 7,
            applied: vec![Edit::delete(0, 2), Edit::delete(3, 3)],
        };

        let msg = Frame::committed(doc, &committed);
        let decoded = Frame::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.kind, FrameKind::Committed);
        assert_eq!(decoded.client_id, author);
        assert_eq!(decoded.revision, 9);
        assert_eq!(decoded.committed_operation().unwrap(), committed);
    }

    #[test]
    fn test_rejected_roundtrip() {
        let client = Uuid::new_v4();
        let doc = Uuid::new_v4();
        let reason = RejectReason::FutureRevision { base: 12, current: 9 };

        let msg = Frame::rejected(client, doc, &reason);
        let decoded = Frame::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.kind, FrameKind::Rejected);
        assert_eq!(decoded.reject_reason().unwrap(), reason);
    }

    #[test]
    fn test_ack_and_lifecycle_frames() {
        let client = Uuid::new_v4();
        let doc = Uuid::new_v4();

        let ack = Frame::decode(&Frame::ack(client, doc, 5).encode().unwrap()).unwrap();
        assert_eq!(ack.kind, FrameKind::Ack);
        assert_eq!(ack.revision, 5);

        let unsub = Frame::decode(&Frame::unsubscribe(client, doc).encode().unwrap()).unwrap();
        assert_eq!(unsub.kind, FrameKind::Unsubscribe);

        let joined =
            Frame::decode(&Frame::subscriber_joined(client, doc).encode().unwrap()).unwrap();
        assert_eq!(joined.kind, FrameKind::SubscriberJoined);
        assert_eq!(joined.client_id, client);

        let left = Frame::decode(&Frame::subscriber_left(client, doc).encode().unwrap()).unwrap();
        assert_eq!(left.kind, FrameKind::SubscriberLeft);
    }

    #[test]
    fn test_ping_pong_roundtrip() {
        let client = Uuid::new_v4();

        let ping = Frame::decode(&Frame::ping(client).encode().unwrap()).unwrap();
        let pong = Frame::decode(&Frame::pong(client).encode().unwrap()).unwrap();

        assert_eq!(ping.kind, FrameKind::Ping);
        assert_eq!(pong.kind, FrameKind::Pong);
        assert!(ping.payload.is_empty());
    }

    #[test]
    fn test_wrong_kind_accessor_errors() {
        let msg = Frame::ping(Uuid::new_v4());
        assert!(msg.operation().is_err());
        assert!(msg.committed_operation().is_err());
        assert!(msg.subscribe_request().is_err());
        assert!(msg.hydrate_text().is_err());
        assert!(msg.reject_reason().is_err());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(Frame::decode(&garbage).is_err());
    }

    #[test]
    fn test_large_hydrate() {
        let doc = Uuid::new_v4();
        let text = "x".repeat(65536);

        let msg = Frame::hydrate(doc, &text, 1);
        let decoded = Frame::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.hydrate_text().unwrap().len(), 65536);
    }

    #[test]
    fn test_frame_size_efficient() {
        let client = Uuid::new_v4();
        let doc = Uuid::new_v4();
        let op = Operation::insert(client, 1, 0, "typical keystroke");

        let encoded = Frame::submit(client, doc, &op).encode().unwrap();
        // Header is ~42 bytes; a small operation should stay well under 150.
        assert!(
            encoded.len() < 150,
            "encoded size {} too large for a small operation",
            encoded.len()
        );
    }
}
