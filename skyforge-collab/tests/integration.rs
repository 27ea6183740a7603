//! Integration tests for end-to-end canvas collaboration.
//!
//! These tests start a real relay and connect real engines,
//! verifying the full sync pipeline.

use std::sync::Arc;

use skyforge_collab::engine::{CollaborationEngine, CollaborationOptions, ConnectionStatus, EngineConfig};
use skyforge_collab::record::{EdgeRecord, NodeRecord};
use skyforge_collab::relay::{RelayConfig, RelayServer};
use skyforge_collab::store::{CanvasStore, MemoryStore};
use skyforge_collab::transport::{TransportProvider, TransportStatus};
use skyforge_collab::{use_collaboration, CollabError, LocalPeer, SharedDocument};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::tungstenite;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

struct TestRelay {
    server: Arc<RelayServer>,
    handle: JoinHandle<Result<(), CollabError>>,
}

impl TestRelay {
    async fn stop(self) {
        self.server.shutdown();
        let _ = timeout(Duration::from_secs(2), self.handle).await;
    }
}

/// Start a relay on `port`.
async fn start_relay(port: u16) -> TestRelay {
    start_relay_with_capacity(port, 64).await
}

async fn start_relay_with_capacity(port: u16, broadcast_capacity: usize) -> TestRelay {
    let config = RelayConfig {
        broadcast_capacity,
        ..RelayConfig::default()
    }
    .with_bind_addr(format!("127.0.0.1:{port}"));
    let server = Arc::new(RelayServer::new(config));
    let running = server.clone();
    let handle = tokio::spawn(async move { running.run().await });
    // Give the relay time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    TestRelay { server, handle }
}

fn engine_config(port: u16) -> EngineConfig {
    let mut config =
        EngineConfig::default().with_endpoint(format!("ws://127.0.0.1:{port}/ws/collaboration"));
    config.transport.reconnect_base = Duration::from_millis(20);
    config.transport.reconnect_max = Duration::from_millis(200);
    config
}

/// Poll `condition` until it holds, or fail after a few seconds.
async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn node_ids(store: &MemoryStore) -> Vec<String> {
    store.get_state().nodes.iter().map(|n| n.id.clone()).collect()
}

fn table(id: &str, x: f64) -> NodeRecord {
    NodeRecord::new(id, x, 0.0)
        .with_kind("tableNode")
        .with_data(serde_json::json!({ "name": id, "columns": [] }))
}

async fn connected_engine(port: u16, store: &MemoryStore, room: &str) -> CollaborationEngine {
    let engine = use_collaboration(
        engine_config(port),
        Arc::new(store.clone()),
        CollaborationOptions::new(room),
    )
    .await;
    wait_until("engine to connect", || engine.status() == ConnectionStatus::Connected).await;
    engine
}

// ─── Relay ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_relay_accepts_room_connections() {
    let port = free_port().await;
    let relay = start_relay(port).await;

    let url = format!("ws://127.0.0.1:{port}/ws/collaboration/skyforge-abc123");
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to relay");

    let deadline = Instant::now() + Duration::from_secs(5);
    while relay.server.stats().await.active_rooms != 1 {
        assert!(Instant::now() < deadline, "room should be created on join");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(relay.server.stats().await.total_connections, 1);

    relay.stop().await;
}

#[tokio::test]
async fn test_relay_rejects_missing_room() {
    let port = free_port().await;
    let relay = start_relay(port).await;

    let url = format!("ws://127.0.0.1:{port}/ws/collaboration/");
    match tokio_tungstenite::connect_async(&url).await {
        Err(tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), tungstenite::http::StatusCode::BAD_REQUEST);
        }
        other => panic!("expected HTTP 400, got {:?}", other.map(|_| ())),
    }

    relay.stop().await;
}

#[tokio::test]
async fn test_relay_echoes_to_sender() {
    use futures_util::{SinkExt, StreamExt};
    use tungstenite::Message;

    let port = free_port().await;
    let relay = start_relay(port).await;
    let url = format!("ws://127.0.0.1:{port}/ws/collaboration/skyforge-echo");

    let (mut a, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let (mut b, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    a.send(Message::Binary(vec![7, 7, 7].into())).await.unwrap();

    for socket in [&mut a, &mut b] {
        let frame = timeout(Duration::from_secs(2), socket.next()).await.unwrap();
        assert_eq!(frame.unwrap().unwrap(), Message::Binary(vec![7, 7, 7].into()));
    }

    let stats = relay.server.stats().await;
    assert_eq!(stats.active_rooms, 1);
    assert_eq!(stats.total_messages, 1);

    drop(a);
    drop(b);
    let server = relay.server.clone();
    let deadline = Instant::now() + Duration::from_secs(5);
    while server.stats().await.active_rooms != 0 {
        assert!(Instant::now() < deadline, "room should be removed when empty");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    relay.stop().await;
}

// ─── Canvas sync ─────────────────────────────────────────────────

#[tokio::test]
async fn test_first_peer_seeds_and_second_converges() {
    let port = free_port().await;
    let relay = start_relay(port).await;

    let store_a = MemoryStore::new();
    store_a.set_nodes(Arc::new(vec![table("n1", 0.0), table("n2", 240.0)]));
    let mut engine_a = connected_engine(port, &store_a, "abc123").await;

    let store_b = MemoryStore::new();
    let mut engine_b = connected_engine(port, &store_b, "abc123").await;

    wait_until("B to receive the seeded tables", || node_ids(&store_b) == ["n1", "n2"]).await;
    assert!(store_b.get_state().edges.is_empty());
    assert_eq!(node_ids(&store_a), ["n1", "n2"]);
    assert_eq!(store_b.get_state().nodes[1].data["name"], "n2");

    engine_a.shutdown().await;
    engine_b.shutdown().await;
    relay.stop().await;
}

#[tokio::test]
async fn test_local_edits_propagate_both_ways() {
    let port = free_port().await;
    let relay = start_relay(port).await;

    let store_a = MemoryStore::new();
    store_a.set_nodes(Arc::new(vec![table("users", 0.0), table("posts", 300.0)]));
    let mut engine_a = connected_engine(port, &store_a, "edits").await;
    let store_b = MemoryStore::new();
    let mut engine_b = connected_engine(port, &store_b, "edits").await;
    wait_until("initial sync", || node_ids(&store_b).len() == 2).await;

    store_b.add_edge(
        EdgeRecord::new("e1", "posts", "users").with_handles("posts-user_id-out", "users-id-in"),
    );
    wait_until("edge to reach A", || store_a.get_state().edges.len() == 1).await;
    assert_eq!(store_a.get_state().edges[0].source_handle.as_deref(), Some("posts-user_id-out"));

    for step in 0..10 {
        store_a.update_node_position("users", skyforge_collab::Position::new(step as f64, 5.0));
    }
    wait_until("final position to reach B", || {
        store_b.get_state().nodes.iter().any(|n| n.id == "users" && n.position.x == 9.0)
    })
    .await;

    store_b.delete_node("posts");
    wait_until("delete to reach A", || node_ids(&store_a) == ["users"]).await;
    assert!(store_a.get_state().edges.is_empty());

    engine_a.shutdown().await;
    engine_b.shutdown().await;
    relay.stop().await;
}

#[tokio::test]
async fn test_offline_edit_survives_relay_restart() {
    let port = free_port().await;
    let relay = start_relay(port).await;

    let store_a = MemoryStore::new();
    store_a.set_nodes(Arc::new(vec![table("n1", 0.0), table("n2", 240.0)]));
    let mut engine_a = connected_engine(port, &store_a, "abc123").await;
    let store_b = MemoryStore::new();
    let mut engine_b = connected_engine(port, &store_b, "abc123").await;
    wait_until("initial sync", || node_ids(&store_b) == ["n1", "n2"]).await;

    relay.stop().await;
    wait_until("A to notice the outage", || engine_a.status() != ConnectionStatus::Connected).await;
    wait_until("B to notice the outage", || engine_b.status() != ConnectionStatus::Connected).await;

    store_a.add_node(table("n3", 480.0));
    // Let the debounce write the change into A's document while offline.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(node_ids(&store_b), ["n1", "n2"]);

    let relay = start_relay(port).await;
    wait_until("A to reconnect", || engine_a.status() == ConnectionStatus::Connected).await;
    wait_until("B to reconnect", || engine_b.status() == ConnectionStatus::Connected).await;
    wait_until("B to gain n3", || node_ids(&store_b) == ["n1", "n2", "n3"]).await;

    // Nothing duplicated once things settle.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(node_ids(&store_a), ["n1", "n2", "n3"]);
    assert_eq!(node_ids(&store_b), ["n1", "n2", "n3"]);

    engine_a.shutdown().await;
    engine_b.shutdown().await;
    relay.stop().await;
}

#[tokio::test]
async fn test_lagging_peer_resyncs() {
    let port = free_port().await;
    let relay = start_relay_with_capacity(port, 4).await;

    let store_b = MemoryStore::new();
    let mut engine_b = connected_engine(port, &store_b, "burst").await;

    let doc_a = SharedDocument::new();
    let provider_a = TransportProvider::connect(engine_config(port).transport, "skyforge-burst", doc_a.clone()).unwrap();
    let mut status_a = provider_a.subscribe_status();
    timeout(Duration::from_secs(5), status_a.wait_for(|s| *s == TransportStatus::Connected))
        .await
        .unwrap()
        .unwrap();

    // One update frame per insert, far more than the room buffers.
    for i in 0..200u32 {
        doc_a.insert_nodes(i, &[table(&format!("t{i}"), f64::from(i))]).unwrap();
    }

    wait_until("B to receive the whole burst", || store_b.get_state().nodes.len() == 200).await;
    assert!(relay.server.stats().await.lagged_disconnects >= 1);
    let expected: Vec<String> = (0..200).map(|i| format!("t{i}")).collect();
    assert_eq!(node_ids(&store_b), expected);
    assert_eq!(doc_a.nodes().len(), 200);

    engine_b.shutdown().await;
    provider_a.destroy().await;
    relay.stop().await;
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let port = free_port().await;
    let relay = start_relay(port).await;

    let store_a = MemoryStore::new();
    store_a.set_nodes(Arc::new(vec![table("secret", 0.0)]));
    let mut engine_a = connected_engine(port, &store_a, "room-a").await;
    let store_b = MemoryStore::new();
    let mut engine_b = connected_engine(port, &store_b, "room-b").await;

    store_a.add_node(table("also-secret", 10.0));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(store_b.get_state().nodes.is_empty());
    assert_eq!(engine_a.room(), Some("skyforge-room-a"));
    assert_eq!(engine_b.room(), Some("skyforge-room-b"));

    engine_a.shutdown().await;
    engine_b.shutdown().await;
    relay.stop().await;
}

// ─── Lifecycle ───────────────────────────────────────────────────

#[tokio::test]
async fn test_teardown_releases_everything() {
    let port = free_port().await;
    let relay = start_relay(port).await;

    let store = MemoryStore::new();
    store.set_nodes(Arc::new(vec![table("n1", 0.0)]));
    let options = CollaborationOptions::new("teardown").with_user(LocalPeer::new("u1", "Alice"));
    let mut engine =
        use_collaboration(engine_config(port), Arc::new(store.clone()), options.clone()).await;
    wait_until("connect", || engine.status() == ConnectionStatus::Connected).await;
    assert_eq!(store.listener_count(), 1);
    assert!(!engine.peers().is_empty());

    engine
        .configure(CollaborationOptions {
            enabled: false,
            ..options
        })
        .await;

    assert_eq!(engine.status(), ConnectionStatus::Idle);
    assert!(engine.peers().is_empty());
    assert_eq!(store.listener_count(), 0);

    // No write-back after teardown: the store keeps whatever the host sets.
    store.add_node(table("n2", 10.0));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(node_ids(&store), ["n1", "n2"]);

    let server = relay.server.clone();
    let deadline = Instant::now() + Duration::from_secs(5);
    while server.stats().await.active_connections != 0 {
        assert!(Instant::now() < deadline, "socket should be closed after teardown");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    relay.stop().await;
}

#[tokio::test]
async fn test_room_change_restarts_session() {
    let port = free_port().await;
    let relay = start_relay(port).await;

    let store = MemoryStore::new();
    let mut engine = connected_engine(port, &store, "first").await;
    assert_eq!(engine.room(), Some("skyforge-first"));

    engine.configure(CollaborationOptions::new("second")).await;
    assert_eq!(engine.room(), Some("skyforge-second"));
    wait_until("reconnect in new room", || engine.status() == ConnectionStatus::Connected).await;
    assert_eq!(store.listener_count(), 1);

    engine.shutdown().await;
    assert_eq!(engine.status(), ConnectionStatus::Idle);
    relay.stop().await;
}

#[tokio::test]
async fn test_status_goes_idle_when_relay_unreachable() {
    let port = free_port().await;
    let store = MemoryStore::new();
    let mut engine = use_collaboration(
        engine_config(port),
        Arc::new(store),
        CollaborationOptions::new("nowhere"),
    )
    .await;

    let mut status = engine.subscribe_status();
    let reached_idle = timeout(Duration::from_secs(3), async {
        loop {
            if *status.borrow_and_update() == ConnectionStatus::Idle {
                return;
            }
            if status.changed().await.is_err() {
                return;
            }
        }
    })
    .await;
    assert!(reached_idle.is_ok());

    // Once a relay shows up the transport's own retry gets through.
    let relay = start_relay(port).await;
    wait_until("late connect", || engine.status() == ConnectionStatus::Connected).await;

    engine.shutdown().await;
    relay.stop().await;
}
