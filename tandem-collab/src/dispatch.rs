//! Revision-ordered fan-out to a document's subscribers.
//!
//! Uses a tokio broadcast channel for O(1) send to all subscribers; each
//! subscriber gets an independent receiver buffering up to `capacity`
//! frames. Frames are pre-encoded once and shared as `Arc<Vec<u8>>`.
//!
//! Ordering: the owning session broadcasts while holding its commit lock,
//! so frames enter the channel in revision order and no subscriber ever
//! observes revision N before N-1. Delivery is at-least-once; duplicates
//! carry the same revision and are dropped by the client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{Frame, ProtocolError};

/// Statistics for monitoring dispatch health.
#[derive(Debug, Clone, Default)]
pub struct DispatchStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub active_subscribers: usize,
}

/// Atomic dispatch counters — lock-free on the send path.
struct AtomicDispatchStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl AtomicDispatchStats {
    fn new() -> Self {
        Self {
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }
}

/// Per-subscriber bookkeeping.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscriberState {
    /// Highest revision the client has acknowledged. Informational: used
    /// only to bound how much committed history the session retains.
    pub last_acked: u64,
}

/// The fan-out group for a single document.
pub struct DispatchGroup {
    /// Broadcast channel sender, shared by the whole document
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    /// Subscribed clients and their acknowledgement high-water marks
    subscribers: RwLock<HashMap<Uuid, SubscriberState>>,
    /// Frames buffered per receiver before lagging ones drop messages
    capacity: usize,
    stats: AtomicDispatchStats,
}

impl DispatchGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            subscribers: RwLock::new(HashMap::new()),
            capacity,
            stats: AtomicDispatchStats::new(),
        }
    }

    /// Add a subscriber, returning its receiver for live frames.
    pub async fn add_subscriber(
        &self,
        client_id: Uuid,
        last_acked: u64,
    ) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut subscribers = self.subscribers.write().await;
        subscribers.insert(client_id, SubscriberState { last_acked });
        self.sender.subscribe()
    }

    /// Remove a subscriber.
    pub async fn remove_subscriber(&self, client_id: &Uuid) -> Option<SubscriberState> {
        let mut subscribers = self.subscribers.write().await;
        subscribers.remove(client_id)
    }

    /// Encode and broadcast a frame to all subscribers.
    ///
    /// Returns the number of receivers it reached. Stats are tracked via
    /// atomics — no lock acquired on the send path.
    pub fn broadcast(&self, frame: &Frame) -> Result<usize, ProtocolError> {
        let encoded = frame.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Broadcast pre-encoded bytes directly (zero-copy fast path).
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        match self.sender.send(encoded) {
            Ok(count) => {
                self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                count
            }
            Err(_) => {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    /// Record an acknowledgement. High-water marks only move forward.
    /// Returns false for clients that are not subscribed.
    pub async fn acknowledge(&self, client_id: &Uuid, revision: u64) -> bool {
        let mut subscribers = self.subscribers.write().await;
        match subscribers.get_mut(client_id) {
            Some(state) => {
                if revision > state.last_acked {
                    state.last_acked = revision;
                }
                true
            }
            None => false,
        }
    }

    /// Lowest acknowledged revision across subscribers — the history the
    /// session may not prune. `None` when nobody is subscribed.
    pub async fn min_acknowledged(&self) -> Option<u64> {
        let subscribers = self.subscribers.read().await;
        subscribers.values().map(|s| s.last_acked).min()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn subscriber_ids(&self) -> Vec<Uuid> {
        self.subscribers.read().await.keys().cloned().collect()
    }

    pub async fn has_subscriber(&self, client_id: &Uuid) -> bool {
        self.subscribers.read().await.contains_key(client_id)
    }

    /// Dispatch statistics (lock-free counters, snapshot of the map).
    pub async fn stats(&self) -> DispatchStats {
        let subscribers = self.subscribers.read().await;
        DispatchStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            active_subscribers: subscribers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::{CommittedOperation, Edit};

    fn committed_frame(doc: Uuid, revision: u64) -> Frame {
        let committed = CommittedOperation {
            revision,
            author: Uuid::new_v4(),
            base_revision: revision.saturating_sub(1),
            applied: vec![Edit::insert(0, "x")],
        };
        Frame::committed(doc, &committed)
    }

    #[tokio::test]
    async fn test_add_remove_subscriber() {
        let group = DispatchGroup::new(16);
        let client = Uuid::new_v4();

        let _rx = group.add_subscriber(client, 0).await;
        assert_eq!(group.subscriber_count().await, 1);
        assert!(group.has_subscriber(&client).await);

        group.remove_subscriber(&client).await;
        assert_eq!(group.subscriber_count().await, 0);
        assert!(!group.has_subscriber(&client).await);
    }

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let group = DispatchGroup::new(16);
        let doc = Uuid::new_v4();

        let mut rx1 = group.add_subscriber(Uuid::new_v4(), 0).await;
        let mut rx2 = group.add_subscriber(Uuid::new_v4(), 0).await;
        let mut rx3 = group.add_subscriber(Uuid::new_v4(), 0).await;

        let count = group.broadcast(&committed_frame(doc, 1)).unwrap();
        assert_eq!(count, 3);

        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            let bytes = rx.recv().await.unwrap();
            let frame = Frame::decode(&bytes).unwrap();
            assert_eq!(frame.revision, 1);
        }
    }

    #[tokio::test]
    async fn test_frames_arrive_in_send_order() {
        let group = DispatchGroup::new(64);
        let doc = Uuid::new_v4();
        let mut rx = group.add_subscriber(Uuid::new_v4(), 0).await;

        for revision in 1..=10 {
            group.broadcast(&committed_frame(doc, revision)).unwrap();
        }
        for expected in 1..=10 {
            let bytes = rx.recv().await.unwrap();
            assert_eq!(Frame::decode(&bytes).unwrap().revision, expected);
        }
    }

    #[tokio::test]
    async fn test_broadcast_raw_zero_copy() {
        let group = DispatchGroup::new(16);
        let mut rx = group.add_subscriber(Uuid::new_v4(), 0).await;

        let data = Arc::new(vec![10, 20, 30]);
        let count = group.broadcast_raw(data.clone());
        assert_eq!(count, 1);

        let received = rx.recv().await.unwrap();
        assert_eq!(*received, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn test_broadcast_without_subscribers_is_dropped() {
        let group = DispatchGroup::new(16);
        let count = group.broadcast(&committed_frame(Uuid::new_v4(), 1)).unwrap();
        assert_eq!(count, 0);

        let stats = group.stats().await;
        assert_eq!(stats.frames_sent, 0);
        assert_eq!(stats.frames_dropped, 1);
    }

    #[tokio::test]
    async fn test_acknowledgements_move_forward_only() {
        let group = DispatchGroup::new(16);
        let client = Uuid::new_v4();
        let _rx = group.add_subscriber(client, 0).await;

        assert!(group.acknowledge(&client, 5).await);
        assert!(group.acknowledge(&client, 3).await);
        assert_eq!(group.min_acknowledged().await, Some(5));

        assert!(!group.acknowledge(&Uuid::new_v4(), 9).await);
    }

    #[tokio::test]
    async fn test_min_acknowledged() {
        let group = DispatchGroup::new(16);
        assert_eq!(group.min_acknowledged().await, None);

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let _rx1 = group.add_subscriber(a, 0).await;
        let _rx2 = group.add_subscriber(b, 0).await;

        group.acknowledge(&a, 8).await;
        group.acknowledge(&b, 3).await;
        assert_eq!(group.min_acknowledged().await, Some(3));

        group.remove_subscriber(&b).await;
        assert_eq!(group.min_acknowledged().await, Some(8));
    }

    #[tokio::test]
    async fn test_stats() {
        let group = DispatchGroup::new(32);
        assert_eq!(group.capacity(), 32);

        let _rx = group.add_subscriber(Uuid::new_v4(), 0).await;
        let doc = Uuid::new_v4();
        group.broadcast(&committed_frame(doc, 1)).unwrap();
        group.broadcast(&committed_frame(doc, 2)).unwrap();

        let stats = group.stats().await;
        assert_eq!(stats.frames_sent, 2);
        assert_eq!(stats.active_subscribers, 1);
    }
}
