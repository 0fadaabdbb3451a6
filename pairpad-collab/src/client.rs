//! WebSocket sync client.
//!
//! Owns the local replica ([`Document`]) for one room and keeps it
//! converged with the relay:
//!
//! - local mutations are captured by the document's update observer and
//!   forwarded automatically (remote-origin updates stay silent, so
//!   nothing echoes);
//! - the initial sync handshake runs on connect; `is_synced()` stays
//!   `false` until the delta exchange has completed in both directions —
//!   consumers must not treat local state as authoritative before then,
//!   or a default file can clobber real remote content;
//! - edits made while disconnected are queued and replayed on the next
//!   connect (the fresh handshake would recover them anyway; the replay
//!   just shortens the window);
//! - local presence (cursor, typing, follow) is throttled and published,
//!   remote presence arrives as [`SyncEvent::Awareness`] events.
//!
//! Reconnection is the caller's move: a new [`connect`](SyncClient::connect)
//! opens a fresh connection with a fresh participant id and a fresh
//! handshake. The server keeps no per-client retry state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use pairpad_core::{Document, Subscription, UpdateOrigin};

use crate::awareness::{AwarenessState, LocalAwareness, UserProfile};
use crate::protocol::{MessageKind, ProtocolError, SyncMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted to the embedding application.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Transport established (handshake still in flight).
    Connected,
    /// Transport lost.
    Disconnected,
    /// Initial sync completed in both directions; local state is now
    /// authoritative.
    Synced,
    /// A remote update was merged into the local document.
    RemoteUpdate { participant: Uuid, clock: u64 },
    /// A participant's presence changed; `None` means they are gone.
    Awareness {
        participant: Uuid,
        state: Option<AwarenessState>,
    },
}

/// Queue for updates produced while disconnected, replayed on reconnect.
pub struct OfflineQueue {
    queue: VecDeque<(u64, Vec<u8>)>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an update for later replay. Returns `false` when full.
    pub fn enqueue(&mut self, clock: u64, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back((clock, payload));
        true
    }

    pub fn drain(&mut self) -> Vec<(u64, Vec<u8>)> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|(_, p)| p.len()).sum()
    }
}

/// The sync client: one room, one document replica, one connection at a
/// time.
pub struct SyncClient {
    room_id: String,
    server_url: String,
    document: Arc<Document>,
    awareness: Arc<Mutex<LocalAwareness>>,
    state: Arc<RwLock<ConnectionState>>,
    synced: Arc<AtomicBool>,
    /// Lamport clock stamped on outgoing update frames.
    clock: Arc<AtomicU64>,
    offline: Arc<Mutex<OfflineQueue>>,
    /// Present while a connection is up; the update observer and the
    /// awareness publishers drop their frames here.
    outgoing: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>,
    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    connects: u64,
    _update_sub: Subscription,
}

impl SyncClient {
    /// Create a client for `room_id` with an empty local replica. Nothing
    /// touches the network until [`connect`](Self::connect).
    pub fn new(
        profile: UserProfile,
        room_id: impl Into<String>,
        server_url: impl Into<String>,
    ) -> Self {
        let room_id = room_id.into();
        let document = Arc::new(Document::new(room_id.clone()));
        let participant = Uuid::new_v4();
        let awareness = Arc::new(Mutex::new(LocalAwareness::new(participant, profile)));
        let clock = Arc::new(AtomicU64::new(0));
        let offline = Arc::new(Mutex::new(OfflineQueue::new(10_000)));
        let outgoing: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>> =
            Arc::new(Mutex::new(None));
        let (event_tx, event_rx) = mpsc::channel(256);

        // Forward every local mutation; queue it when the link is down.
        // Remote-origin updates were applied by the reader task and must
        // not bounce back.
        let update_sub = {
            let room = room_id.clone();
            let clock = clock.clone();
            let offline = offline.clone();
            let outgoing = outgoing.clone();
            let awareness = awareness.clone();
            document.observe_update(move |origin, update| {
                if origin != UpdateOrigin::Local {
                    return;
                }
                let clock = clock.fetch_add(1, Ordering::SeqCst) + 1;
                let participant = awareness.lock().expect("awareness lock poisoned").participant();
                let sender = outgoing.lock().expect("outgoing lock poisoned").clone();
                let sent = match sender {
                    Some(tx) => {
                        let msg = SyncMessage::update(participant, &room, clock, update.to_vec());
                        match msg.encode() {
                            Ok(bytes) => tx.send(Message::Binary(bytes.into())).is_ok(),
                            Err(e) => {
                                log::error!("room {room}: update encode failed: {e}");
                                return;
                            }
                        }
                    }
                    None => false,
                };
                if !sent {
                    let mut queue = offline.lock().expect("offline lock poisoned");
                    if !queue.enqueue(clock, update.to_vec()) {
                        log::warn!("room {room}: offline queue full, dropping update");
                    }
                }
            })
        };

        Self {
            room_id,
            server_url: server_url.into(),
            document,
            awareness,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            synced: Arc::new(AtomicBool::new(false)),
            clock,
            offline,
            outgoing,
            event_tx,
            event_rx: Some(event_rx),
            connects: 0,
            _update_sub: update_sub,
        }
    }

    /// Take the event receiver (can only be taken once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Open a connection and start the sync handshake. A fresh participant
    /// id is assigned: presence identity is connection-scoped.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        {
            let mut state = self.state.write().await;
            *state = if self.connects == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            };
        }
        self.connects += 1;

        let url = format!(
            "{}/{}",
            self.server_url.trim_end_matches('/'),
            self.room_id
        );
        let (ws, _) = tokio_tungstenite::connect_async(&url).await.map_err(|e| {
            log::debug!("room {}: connect failed: {e}", self.room_id);
            ProtocolError::ConnectionClosed
        })?;

        let participant = Uuid::new_v4();
        self.awareness
            .lock()
            .expect("awareness lock poisoned")
            .set_participant(participant);
        self.synced.store(false, Ordering::SeqCst);

        let (mut ws_tx, ws_rx) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

        // Writer task: drain the outgoing channel into the socket.
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_tx.send(msg).await.is_err() {
                    break;
                }
            }
        });
        *self.outgoing.lock().expect("outgoing lock poisoned") = Some(out_tx.clone());

        // Handshake step 1: our state vector.
        let sv = self
            .document
            .state_vector()
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        send_message(
            &out_tx,
            &SyncMessage::sync_step1(participant, &self.room_id, sv),
        )?;

        // Announce our presence right away so peers render us without
        // waiting for the first cursor move.
        {
            let (clock, state) = self
                .awareness
                .lock()
                .expect("awareness lock poisoned")
                .announce();
            let msg = SyncMessage::awareness(participant, &self.room_id, clock, &state)?;
            send_message(&out_tx, &msg)?;
        }

        // Replay edits queued while offline. The handshake would carry
        // them too; replaying is cheap and idempotent.
        let queued = self
            .offline
            .lock()
            .expect("offline lock poisoned")
            .drain();
        if !queued.is_empty() {
            log::info!(
                "room {}: replaying {} queued updates",
                self.room_id,
                queued.len()
            );
            for (clock, payload) in queued {
                send_message(
                    &out_tx,
                    &SyncMessage::update(participant, &self.room_id, clock, payload),
                )?;
            }
        }

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        self.spawn_reader(ws_rx, out_tx, participant);
        Ok(())
    }

    fn spawn_reader(
        &self,
        mut ws_rx: futures_util::stream::SplitStream<
            tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
        >,
        out_tx: mpsc::UnboundedSender<Message>,
        participant: Uuid,
    ) {
        let document = self.document.clone();
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let synced = self.synced.clone();
        let outgoing = self.outgoing.clone();
        let room_id = self.room_id.clone();

        tokio::spawn(async move {
            // Synced only once the delta exchange completed both ways.
            let mut sent_delta = false;
            let mut got_delta = false;

            while let Some(incoming) = ws_rx.next().await {
                match incoming {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let msg = match SyncMessage::decode(&bytes) {
                            Ok(msg) => msg,
                            Err(e) => {
                                log::warn!("room {room_id}: dropping bad frame: {e}");
                                continue;
                            }
                        };
                        if msg.participant == participant {
                            continue;
                        }
                        match msg.kind {
                            MessageKind::SyncStep1 => {
                                // The relay's state vector: answer with the
                                // delta it is missing.
                                match document.diff(&msg.payload) {
                                    Ok(delta) => {
                                        let reply = SyncMessage::sync_step2(
                                            participant,
                                            &room_id,
                                            delta,
                                        );
                                        match reply.encode() {
                                            Ok(bytes) => {
                                                let _ =
                                                    out_tx.send(Message::Binary(bytes.into()));
                                                sent_delta = true;
                                            }
                                            Err(e) => log::error!(
                                                "room {room_id}: step2 encode failed: {e}"
                                            ),
                                        }
                                    }
                                    Err(e) => {
                                        log::warn!("room {room_id}: bad state vector: {e}")
                                    }
                                }
                            }
                            MessageKind::SyncStep2 => {
                                match document.apply_update(&msg.payload) {
                                    Ok(()) => got_delta = true,
                                    Err(e) => {
                                        log::warn!("room {room_id}: bad sync delta: {e}")
                                    }
                                }
                            }
                            MessageKind::Update => match document.apply_update(&msg.payload) {
                                Ok(()) => {
                                    let _ = event_tx
                                        .send(SyncEvent::RemoteUpdate {
                                            participant: msg.participant,
                                            clock: msg.clock,
                                        })
                                        .await;
                                }
                                Err(e) => log::warn!("room {room_id}: bad update: {e}"),
                            },
                            MessageKind::Awareness => match msg.awareness_state() {
                                Ok(state) => {
                                    let _ = event_tx
                                        .send(SyncEvent::Awareness {
                                            participant: msg.participant,
                                            state,
                                        })
                                        .await;
                                }
                                Err(e) => {
                                    log::warn!("room {room_id}: bad awareness payload: {e}")
                                }
                            },
                        }
                        if sent_delta && got_delta && !synced.swap(true, Ordering::SeqCst) {
                            let _ = event_tx.send(SyncEvent::Synced).await;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        let _ = out_tx.send(Message::Pong(payload));
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }

            // Link gone: stop routing updates to the dead channel, require
            // a fresh handshake before trusting local state again.
            *outgoing.lock().expect("outgoing lock poisoned") = None;
            synced.store(false, Ordering::SeqCst);
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });
    }

    /// Announce departure and close the connection.
    pub async fn disconnect(&mut self) {
        let sender = self.outgoing.lock().expect("outgoing lock poisoned").take();
        if let Some(tx) = sender {
            let (participant, clock) = {
                let mut local = self.awareness.lock().expect("awareness lock poisoned");
                (local.participant(), local.removal_clock())
            };
            let removal = SyncMessage::awareness_removal(participant, &self.room_id, clock);
            if let Ok(bytes) = removal.encode() {
                let _ = tx.send(Message::Binary(bytes.into()));
            }
            let _ = tx.send(Message::Close(None));
        }
        self.synced.store(false, Ordering::SeqCst);
        *self.state.write().await = ConnectionState::Disconnected;
    }

    // ── local presence ──────────────────────────────────────────────

    fn publish_awareness(&self, publish: Option<(u64, AwarenessState)>) {
        let Some((clock, state)) = publish else {
            return;
        };
        let sender = self.outgoing.lock().expect("outgoing lock poisoned").clone();
        // Awareness is droppable: silently skipped while offline.
        let Some(tx) = sender else {
            return;
        };
        let participant = self
            .awareness
            .lock()
            .expect("awareness lock poisoned")
            .participant();
        match SyncMessage::awareness(participant, &self.room_id, clock, &state) {
            Ok(msg) => match msg.encode() {
                Ok(bytes) => {
                    let _ = tx.send(Message::Binary(bytes.into()));
                }
                Err(e) => log::error!("room {}: awareness encode failed: {e}", self.room_id),
            },
            Err(e) => log::error!("room {}: awareness encode failed: {e}", self.room_id),
        }
    }

    /// Publish the local cursor location (throttled).
    pub fn set_cursor(&self, line: u32, column: u32) {
        let publish = self
            .awareness
            .lock()
            .expect("awareness lock poisoned")
            .set_cursor(line, column);
        self.publish_awareness(publish);
    }

    /// Publish the typing flag.
    pub fn set_typing(&self, typing: bool) {
        let publish = self
            .awareness
            .lock()
            .expect("awareness lock poisoned")
            .set_typing(typing);
        self.publish_awareness(Some(publish));
    }

    /// Publish a display identity change.
    pub fn set_profile(&self, profile: UserProfile) {
        let publish = self
            .awareness
            .lock()
            .expect("awareness lock poisoned")
            .set_profile(profile);
        self.publish_awareness(Some(publish));
    }

    /// Publish whom we are following (viewport choice stays local; only
    /// the fact is shared).
    pub fn set_follow(&self, follow: Option<Uuid>) {
        let publish = self
            .awareness
            .lock()
            .expect("awareness lock poisoned")
            .set_follow(follow);
        self.publish_awareness(Some(publish));
    }

    // ── accessors ───────────────────────────────────────────────────

    /// The local replica. Mutate it through its own API; updates are
    /// forwarded automatically.
    pub fn document(&self) -> &Arc<Document> {
        &self.document
    }

    /// Current connection-scoped participant id.
    pub fn participant(&self) -> Uuid {
        self.awareness
            .lock()
            .expect("awareness lock poisoned")
            .participant()
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Whether the initial sync handshake has completed in both
    /// directions on the current connection.
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn clock(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    pub fn offline_queue_len(&self) -> usize {
        self.offline.lock().expect("offline lock poisoned").len()
    }
}

fn send_message(
    tx: &mpsc::UnboundedSender<Message>,
    msg: &SyncMessage,
) -> Result<(), ProtocolError> {
    let bytes = msg.encode()?;
    tx.send(Message::Binary(bytes.into()))
        .map_err(|_| ProtocolError::ConnectionClosed)
}
