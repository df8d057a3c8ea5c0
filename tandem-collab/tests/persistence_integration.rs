//! Persistence integration tests.
//!
//! Verifies:
//! - Snapshot save/load roundtrip through the full server stack
//! - Drain/close persistence and re-hydration of a document
//! - Recovery: a server restarted over an existing store serves the
//!   persisted text
//! - Multi-document isolation under persistence

use tandem_collab::client::{SyncClient, SyncEvent};
use tandem_collab::server::{ServerConfig, SyncServer};
use tandem_collab::storage::{RocksSnapshotStore, Snapshot, SnapshotStore, StoreConfig};
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server with persistence and an immediate drain grace.
async fn start_persistent_server(storage_path: std::path::PathBuf) -> u16 {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        broadcast_capacity: 64,
        drain_grace_secs: 0,
        create_missing: true,
        storage_path: Some(storage_path),
    };
    let server = SyncServer::new(config);
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

async fn connect(port: u16, client_id: Uuid, doc_id: Uuid) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
    let url = format!("ws://127.0.0.1:{port}");
    let mut client = SyncClient::new(client_id, doc_id, &url);
    let events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    (client, events)
}

async fn wait_for_event(
    events: &mut mpsc::Receiver<SyncEvent>,
    mut predicate: impl FnMut(&SyncEvent) -> bool,
) -> SyncEvent {
    loop {
        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        if predicate(&event) {
            return event;
        }
    }
}

#[tokio::test]
async fn test_drain_persists_and_rehydrates() {
    let dir = tempdir().unwrap();
    let port = start_persistent_server(dir.path().join("db")).await;
    let doc_id = Uuid::new_v4();
    let alice = Uuid::new_v4();

    // Write and leave.
    {
        let (client, mut events) = connect(port, alice, doc_id).await;
        wait_for_event(&mut events, |e| matches!(e, SyncEvent::Hydrated { .. })).await;
        client
            .submit_edit(tandem_core::Edit::insert(0, "fn main() {}"))
            .await
            .unwrap();
        wait_for_event(&mut events, |e| matches!(e, SyncEvent::Committed { .. })).await;
        client.unsubscribe().await.unwrap();
    }

    // Grace is zero: the session drains, snapshots, and closes.
    tokio::time::sleep(Duration::from_millis(300)).await;

    // A later subscriber re-hydrates from the snapshot.
    let (_client, mut events) = connect(port, Uuid::new_v4(), doc_id).await;
    let hydrated = wait_for_event(&mut events, |e| matches!(e, SyncEvent::Hydrated { .. })).await;
    match hydrated {
        SyncEvent::Hydrated { text, revision } => {
            assert_eq!(text, "fn main() {}");
            assert_eq!(revision, 1);
        }
        other => panic!("expected Hydrated, got {other:?}"),
    }
}

#[tokio::test]
async fn test_server_restart_recovers_documents() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("db");
    let doc_id = Uuid::new_v4();

    // Seed the store directly, as a previous server run would have.
    {
        let store = RocksSnapshotStore::open(StoreConfig::for_testing(&db_path)).unwrap();
        store
            .save(&Snapshot {
                doc_id,
                text: "survived a restart".to_string(),
                revision: 9,
            })
            .unwrap();
    }

    let port = start_persistent_server(db_path).await;

    let (_client, mut events) = connect(port, Uuid::new_v4(), doc_id).await;
    let hydrated = wait_for_event(&mut events, |e| matches!(e, SyncEvent::Hydrated { .. })).await;
    match hydrated {
        SyncEvent::Hydrated { text, revision } => {
            assert_eq!(text, "survived a restart");
            assert_eq!(revision, 9);
        }
        other => panic!("expected Hydrated, got {other:?}"),
    }
}

#[tokio::test]
async fn test_revisions_continue_after_rehydration() {
    let dir = tempdir().unwrap();
    let port = start_persistent_server(dir.path().join("db")).await;
    let doc_id = Uuid::new_v4();

    {
        let (client, mut events) = connect(port, Uuid::new_v4(), doc_id).await;
        wait_for_event(&mut events, |e| matches!(e, SyncEvent::Hydrated { .. })).await;
        for text in ["one ", "two "] {
            client
                .submit_edit(tandem_core::Edit::insert(0, text))
                .await
                .unwrap();
            wait_for_event(&mut events, |e| matches!(e, SyncEvent::Committed { .. })).await;
        }
        client.unsubscribe().await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The reopened document continues from the snapshot revision.
    let (client, mut events) = connect(port, Uuid::new_v4(), doc_id).await;
    wait_for_event(&mut events, |e| matches!(e, SyncEvent::Hydrated { .. })).await;
    client
        .submit_edit(tandem_core::Edit::insert(0, "three "))
        .await
        .unwrap();
    let committed =
        wait_for_event(&mut events, |e| matches!(e, SyncEvent::Committed { .. })).await;
    match committed {
        SyncEvent::Committed { operation, .. } => assert_eq!(operation.revision, 3),
        other => panic!("expected Committed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_documents_are_isolated_under_persistence() {
    let dir = tempdir().unwrap();
    let port = start_persistent_server(dir.path().join("db")).await;
    let doc_a = Uuid::new_v4();
    let doc_b = Uuid::new_v4();

    for (doc_id, text) in [(doc_a, "alpha"), (doc_b, "beta")] {
        let (client, mut events) = connect(port, Uuid::new_v4(), doc_id).await;
        wait_for_event(&mut events, |e| matches!(e, SyncEvent::Hydrated { .. })).await;
        client
            .submit_edit(tandem_core::Edit::insert(0, text))
            .await
            .unwrap();
        wait_for_event(&mut events, |e| matches!(e, SyncEvent::Committed { .. })).await;
        client.unsubscribe().await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    for (doc_id, expected) in [(doc_a, "alpha"), (doc_b, "beta")] {
        let (_client, mut events) = connect(port, Uuid::new_v4(), doc_id).await;
        let hydrated =
            wait_for_event(&mut events, |e| matches!(e, SyncEvent::Hydrated { .. })).await;
        match hydrated {
            SyncEvent::Hydrated { text, .. } => assert_eq!(text, expected),
            other => panic!("expected Hydrated, got {other:?}"),
        }
    }
}
