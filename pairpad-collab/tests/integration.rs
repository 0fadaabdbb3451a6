//! End-to-end tests for document synchronization.
//!
//! These boot a real relay on a free port and connect real clients,
//! exercising the full pipeline: admission, handshake, update relay,
//! room retirement.

use std::sync::Arc;
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

use pairpad_collab::{
    MemorySnapshotStore, MissingOriginPolicy, RelayServer, RoomRegistry, ServerConfig, SyncClient,
    SyncEvent, UserProfile, PROTOCOL_VERSION,
};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a relay on a free port, return the port and its registry.
async fn start_server(
    configure: impl FnOnce(&mut ServerConfig),
    store: Option<Arc<MemorySnapshotStore>>,
) -> (u16, Arc<RoomRegistry>) {
    let port = free_port().await;
    let mut config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..ServerConfig::default()
    };
    configure(&mut config);

    let registry = match store {
        Some(store) => Arc::new(RoomRegistry::with_store(config.broadcast_capacity, store)),
        None => Arc::new(RoomRegistry::new(config.broadcast_capacity)),
    };
    let server = RelayServer::new(config, registry.clone());
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give the server time to bind.
    tokio::time::sleep(Duration::from_millis(50)).await;
    (port, registry)
}

/// Connect a client and wait until its initial sync handshake completes.
async fn connect_synced(
    name: &str,
    room: &str,
    port: u16,
) -> (SyncClient, tokio::sync::mpsc::Receiver<SyncEvent>) {
    let url = format!("ws://127.0.0.1:{port}");
    let mut client = SyncClient::new(UserProfile::new(name), room, url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(3);
    while !client.is_synced() {
        assert!(Instant::now() < deadline, "client {name} never synced");
        let _ = timeout(Duration::from_millis(100), events.recv()).await;
    }
    (client, events)
}

/// Poll `cond` until it holds or the timeout elapses.
async fn eventually(cond: impl Fn() -> bool, wait: Duration) -> bool {
    let deadline = Instant::now() + wait;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    cond()
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (port, _registry) = start_server(|_| {}, None).await;
    let url = format!("ws://127.0.0.1:{port}/54321");
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "should connect to the relay");
}

#[tokio::test]
async fn test_missing_room_id_rejected() {
    let (port, _registry) = start_server(|_| {}, None).await;
    let url = format!("ws://127.0.0.1:{port}/");
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_err(), "a path without a room id must be refused");
}

#[tokio::test]
async fn test_fail_closed_on_missing_origin() {
    let (port, _registry) = start_server(
        |config| {
            config.origin.missing_origin = MissingOriginPolicy::Reject;
        },
        None,
    )
    .await;
    // connect_async sends no Origin header, so admission must fail.
    let url = format!("ws://127.0.0.1:{port}/54321");
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_err(), "origin-less connection must be rejected");
}

#[tokio::test]
async fn test_client_reaches_synced_state() {
    let (port, _registry) = start_server(|_| {}, None).await;
    let (client, _events) = connect_synced("Alice", "54321", port).await;
    assert!(client.is_synced());
}

#[tokio::test]
async fn test_late_joiner_sees_existing_content() {
    let (port, _registry) = start_server(|_| {}, None).await;

    let (alice, _alice_events) = connect_synced("Alice", "54321", port).await;
    alice.document().set_file("main.js", "a").unwrap();

    let (bob, _bob_events) = connect_synced("Bob", "54321", port).await;
    // Bob is synced, so the handshake delta already carried the file.
    assert!(
        eventually(
            || bob.document().file_content("main.js").unwrap() == Some("a".into()),
            Duration::from_secs(2)
        )
        .await,
        "late joiner should receive main.js"
    );
}

#[tokio::test]
async fn test_concurrent_edits_converge() {
    let (port, _registry) = start_server(|_| {}, None).await;

    // Connection 1 creates main.js = "a" in room 54321.
    let (alice, _alice_events) = connect_synced("Alice", "54321", port).await;
    alice.document().set_file("main.js", "a").unwrap();

    // Connection 2 joins and sees it.
    let (bob, _bob_events) = connect_synced("Bob", "54321", port).await;
    assert!(
        eventually(
            || bob.document().file_content("main.js").unwrap() == Some("a".into()),
            Duration::from_secs(2)
        )
        .await
    );

    // Concurrent edits: append on one side, prepend on the other.
    let alice_handle = alice.document().get_file("main.js").unwrap().unwrap();
    let bob_handle = bob.document().get_file("main.js").unwrap().unwrap();
    alice.document().insert(&alice_handle, 1, "b").unwrap();
    bob.document().insert(&bob_handle, 0, "c").unwrap();

    // Both replicas converge to the identical merged string.
    let converged = eventually(
        || {
            let a = alice.document().file_content("main.js").unwrap();
            let b = bob.document().file_content("main.js").unwrap();
            a == b && a.as_deref().map(str::len) == Some(3)
        },
        Duration::from_secs(3),
    )
    .await;
    assert!(converged, "replicas did not converge");
    assert!(alice.is_synced() && bob.is_synced());

    let merged = alice
        .document()
        .file_content("main.js")
        .unwrap()
        .unwrap();
    assert!(merged.contains('a') && merged.contains('b') && merged.contains('c'));
}

#[tokio::test]
async fn test_config_propagates() {
    let (port, _registry) = start_server(|_| {}, None).await;

    let (alice, _alice_events) = connect_synced("Alice", "54321", port).await;
    let (bob, _bob_events) = connect_synced("Bob", "54321", port).await;

    alice.document().set_config("language", "python").unwrap();

    assert!(
        eventually(
            || bob.document().get_config("language").unwrap() == Some("python".into()),
            Duration::from_secs(2)
        )
        .await,
        "config change should reach the other replica"
    );
}

#[tokio::test]
async fn test_room_isolation() {
    let (port, _registry) = start_server(|_| {}, None).await;

    let (alice, _alice_events) = connect_synced("Alice", "11111", port).await;
    let (bob, _bob_events) = connect_synced("Bob", "22222", port).await;

    alice.document().set_file("main.js", "secret").unwrap();

    // Bob must never see room 11111's update.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(bob.document().get_file("main.js").unwrap().is_none());
}

#[tokio::test]
async fn test_remote_update_events_emitted() {
    let (port, _registry) = start_server(|_| {}, None).await;

    let (alice, _alice_events) = connect_synced("Alice", "54321", port).await;
    let (_bob, mut bob_events) = connect_synced("Bob", "54321", port).await;

    alice.document().set_file("main.js", "x").unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        assert!(Instant::now() < deadline, "no RemoteUpdate event arrived");
        match timeout(Duration::from_millis(200), bob_events.recv()).await {
            Ok(Some(SyncEvent::RemoteUpdate { .. })) => break,
            Ok(Some(_)) => continue,
            _ => continue,
        }
    }
}

#[tokio::test]
async fn test_room_retired_after_last_leave() {
    let (port, registry) = start_server(|_| {}, None).await;

    let (mut alice, _alice_events) = connect_synced("Alice", "54321", port).await;
    assert_eq!(registry.room_count().await, 1);

    alice.disconnect().await;

    let deadline = Instant::now() + Duration::from_secs(2);
    while registry.room_count().await > 0 {
        assert!(
            Instant::now() < deadline,
            "room should be retired once the last connection leaves"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn test_snapshot_store_survives_empty_room() {
    let store = Arc::new(MemorySnapshotStore::new());
    let (port, registry) = start_server(|_| {}, Some(store.clone())).await;

    let (mut alice, _alice_events) = connect_synced("Alice", "54321", port).await;
    alice.document().set_file("main.js", "kept").unwrap();

    // Let the relay merge before leaving.
    tokio::time::sleep(Duration::from_millis(200)).await;
    alice.disconnect().await;

    let deadline = Instant::now() + Duration::from_secs(2);
    while registry.room_count().await > 0 {
        assert!(Instant::now() < deadline, "room never retired");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(store.len(), 1);

    // A later joiner finds the checkpointed content.
    let (carol, _carol_events) = connect_synced("Carol", "54321", port).await;
    assert!(
        eventually(
            || carol.document().file_content("main.js").unwrap() == Some("kept".into()),
            Duration::from_secs(2)
        )
        .await,
        "restored room should carry the checkpointed file"
    );
}

#[tokio::test]
async fn test_unknown_protocol_version_closes_connection() {
    let (port, _registry) = start_server(|_| {}, None).await;
    let url = format!("ws://127.0.0.1:{port}/54321");
    let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let (mut tx, mut rx) = ws.split();

    // A frame from a future protocol revision.
    let bogus = vec![PROTOCOL_VERSION + 1, 1, 2, 3];
    tx.send(Message::Binary(bogus.into())).await.unwrap();

    // The relay must close this connection (and only this one).
    let deadline = Instant::now() + Duration::from_secs(2);
    let closed = loop {
        if Instant::now() > deadline {
            break false;
        }
        match timeout(Duration::from_millis(200), rx.next()).await {
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => break true,
            _ => continue,
        }
    };
    assert!(closed, "connection should be closed on version mismatch");

    // The room keeps serving other clients.
    let (client, _events) = connect_synced("Alice", "54321", port).await;
    assert!(client.is_synced());
}

#[tokio::test]
async fn test_malformed_frame_closes_only_offender() {
    let (port, _registry) = start_server(|_| {}, None).await;

    let (alice, _alice_events) = connect_synced("Alice", "54321", port).await;

    // A connection that speaks garbage after a valid upgrade.
    let url = format!("ws://127.0.0.1:{port}/54321");
    let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let (mut tx, mut rx) = ws.split();
    tx.send(Message::Binary(vec![PROTOCOL_VERSION, 0xFF, 0xFF].into()))
        .await
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if Instant::now() > deadline {
            panic!("offending connection was not closed");
        }
        match timeout(Duration::from_millis(200), rx.next()).await {
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => break,
            _ => continue,
        }
    }

    // Alice is unaffected.
    alice.document().set_file("still.js", "alive").unwrap();
    assert!(alice.is_synced());
}

#[tokio::test]
async fn test_handshake_timeout_closes_idle_connection() {
    let (port, _registry) = start_server(
        |config| {
            config.handshake_timeout = Duration::from_millis(300);
        },
        None,
    )
    .await;

    // Raw connection that never answers the relay's state vector.
    let url = format!("ws://127.0.0.1:{port}/54321");
    let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let (_tx, mut rx) = ws.split();

    let deadline = Instant::now() + Duration::from_secs(3);
    let closed = loop {
        if Instant::now() > deadline {
            break false;
        }
        match timeout(Duration::from_millis(200), rx.next()).await {
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => break true,
            _ => continue,
        }
    };
    assert!(closed, "idle handshake should be timed out");
}

#[tokio::test]
async fn test_offline_edits_replay_on_connect() {
    let (port, _registry) = start_server(|_| {}, None).await;

    let url = format!("ws://127.0.0.1:{port}");
    let mut alice = SyncClient::new(UserProfile::new("Alice"), "54321", url);
    let _events = alice.take_event_rx().unwrap();

    // Edit before ever connecting: queued locally.
    alice.document().set_file("main.js", "offline").unwrap();
    assert_eq!(alice.offline_queue_len(), 1);

    alice.connect().await.unwrap();

    // After connecting, the queued edit reaches the room.
    let (bob, _bob_events) = connect_synced("Bob", "54321", port).await;
    assert!(
        eventually(
            || bob.document().file_content("main.js").unwrap() == Some("offline".into()),
            Duration::from_secs(2)
        )
        .await,
        "offline edit should reach other replicas after connect"
    );
    assert_eq!(alice.offline_queue_len(), 0);
}
