//! End-to-end tests for presence: announcement, cursor broadcast, typing,
//! removal on disconnect, and timeout eviction.

use std::time::Instant;

use tokio::sync::mpsc::Receiver;
use tokio::time::{timeout, Duration};

use pairpad_collab::{
    AwarenessState, RelayServer, RoomRegistry, ServerConfig, SyncClient, SyncEvent, UserProfile,
};
use std::sync::Arc;
use uuid::Uuid;

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_server(configure: impl FnOnce(&mut ServerConfig)) -> u16 {
    let port = free_port().await;
    let mut config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..ServerConfig::default()
    };
    configure(&mut config);
    let registry = Arc::new(RoomRegistry::new(config.broadcast_capacity));
    let server = RelayServer::new(config, registry);
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

async fn connect(name: &str, room: &str, port: u16) -> (SyncClient, Receiver<SyncEvent>) {
    let url = format!("ws://127.0.0.1:{port}");
    let mut client = SyncClient::new(UserProfile::new(name), room, url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    let deadline = Instant::now() + Duration::from_secs(3);
    // Poll for sync without consuming the event channel: the join roster is
    // delivered as Awareness events before the Synced event, so draining here
    // would discard the very roster the tests observe.
    while !client.is_synced() {
        assert!(Instant::now() < deadline, "client {name} never synced");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    (client, events)
}

/// Wait for the next awareness event matching `pred`.
async fn wait_for_awareness(
    events: &mut Receiver<SyncEvent>,
    wait: Duration,
    pred: impl Fn(&Uuid, &Option<AwarenessState>) -> bool,
) -> Option<(Uuid, Option<AwarenessState>)> {
    let deadline = Instant::now() + wait;
    while Instant::now() < deadline {
        match timeout(Duration::from_millis(200), events.recv()).await {
            Ok(Some(SyncEvent::Awareness { participant, state })) => {
                if pred(&participant, &state) {
                    return Some((participant, state));
                }
            }
            Ok(Some(_)) => continue,
            _ => continue,
        }
    }
    None
}

#[tokio::test]
async fn test_join_announcement_reaches_peers() {
    let port = start_server(|_| {}).await;
    let (_alice, mut alice_events) = connect("Alice", "54321", port).await;
    let (bob, _bob_events) = connect("Bob", "54321", port).await;

    let seen = wait_for_awareness(&mut alice_events, Duration::from_secs(2), |_, state| {
        matches!(state, Some(s) if s.user.name == "Bob")
    })
    .await;
    let (participant, _) = seen.expect("Alice should learn about Bob");
    assert_eq!(participant, bob.participant());
}

#[tokio::test]
async fn test_roster_sent_to_newcomer() {
    let port = start_server(|_| {}).await;
    // Alice announces on connect and then stays silent.
    let (alice, _alice_events) = connect("Alice", "54321", port).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Bob still learns about her from the join roster.
    let (_bob, mut bob_events) = connect("Bob", "54321", port).await;
    let seen = wait_for_awareness(&mut bob_events, Duration::from_secs(2), |_, state| {
        matches!(state, Some(s) if s.user.name == "Alice")
    })
    .await;
    let (participant, _) = seen.expect("roster should carry Alice");
    assert_eq!(participant, alice.participant());
}

#[tokio::test]
async fn test_cursor_position_propagates() {
    let port = start_server(|_| {}).await;
    let (alice, _alice_events) = connect("Alice", "54321", port).await;
    let (_bob, mut bob_events) = connect("Bob", "54321", port).await;

    alice.set_cursor(3, 14);

    let seen = wait_for_awareness(&mut bob_events, Duration::from_secs(2), |_, state| {
        matches!(
            state,
            Some(s) if s.cursor.map(|c| (c.line, c.column)) == Some((3, 14))
        )
    })
    .await;
    assert!(seen.is_some(), "Bob should see Alice's cursor at 3:14");
}

#[tokio::test]
async fn test_typing_flag_propagates() {
    let port = start_server(|_| {}).await;
    let (alice, _alice_events) = connect("Alice", "54321", port).await;
    let (_bob, mut bob_events) = connect("Bob", "54321", port).await;

    alice.set_typing(true);

    let seen = wait_for_awareness(&mut bob_events, Duration::from_secs(2), |_, state| {
        matches!(state, Some(s) if s.typing && s.typed_at_ms > 0)
    })
    .await;
    assert!(seen.is_some(), "Bob should see Alice typing");
}

#[tokio::test]
async fn test_follow_target_propagates() {
    let port = start_server(|_| {}).await;
    let (alice, _alice_events) = connect("Alice", "54321", port).await;
    let (bob, mut bob_events) = connect("Bob", "54321", port).await;

    let target = bob.participant();
    alice.set_follow(Some(target));

    let seen = wait_for_awareness(&mut bob_events, Duration::from_secs(2), |_, state| {
        matches!(state, Some(s) if s.follow == Some(target))
    })
    .await;
    assert!(seen.is_some(), "Bob should see Alice following him");
}

#[tokio::test]
async fn test_removal_broadcast_on_disconnect() {
    let port = start_server(|_| {}).await;
    let (mut alice, _alice_events) = connect("Alice", "54321", port).await;
    let alice_id = alice.participant();
    let (_bob, mut bob_events) = connect("Bob", "54321", port).await;

    // Let Bob observe Alice first.
    wait_for_awareness(&mut bob_events, Duration::from_secs(2), |id, state| {
        *id == alice_id && state.is_some()
    })
    .await
    .expect("Bob should see Alice before she leaves");

    alice.disconnect().await;

    let removal = wait_for_awareness(&mut bob_events, Duration::from_secs(2), |id, state| {
        *id == alice_id && state.is_none()
    })
    .await;
    assert!(removal.is_some(), "Bob should observe Alice's removal");
}

#[tokio::test]
async fn test_silent_participant_evicted_by_timeout() {
    // Short awareness window, heartbeat far away so pongs cannot refresh.
    let port = start_server(|config| {
        config.awareness_timeout = Duration::from_millis(250);
        config.heartbeat_interval = Duration::from_secs(60);
    })
    .await;

    let (alice, _alice_events) = connect("Alice", "54321", port).await;
    let alice_id = alice.participant();
    let (_bob, mut bob_events) = connect("Bob", "54321", port).await;

    // Alice sends nothing further; the sweep evicts her and announces it.
    let removal = wait_for_awareness(&mut bob_events, Duration::from_secs(3), |id, state| {
        *id == alice_id && state.is_none()
    })
    .await;
    assert!(
        removal.is_some(),
        "silent participant should be evicted and the removal broadcast"
    );
}
