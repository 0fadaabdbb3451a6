//! WebSocket relay server with room-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (room id) ── Document (authority) ── BroadcastGroup
//! Client B ──┘          │
//!                       └── AwarenessSet (ephemeral, swept on timeout)
//! ```
//!
//! The relay is a per-room message bus: frames received from one
//! connection are forwarded to every other connection of the same room.
//! Document updates are additionally merged into the room's authoritative
//! document so late joiners can be brought up to date from the relay
//! alone; awareness frames only pass through the room's ephemeral set.
//!
//! Each connection moves through an explicit state machine:
//! `Connecting → Validating → Active → Closing → Closed`. Validation
//! (origin/authorization) happens during the WebSocket upgrade and fails
//! the handshake with an HTTP status; everything after that is framed
//! protocol traffic. A malformed frame closes the offending connection
//! only — never the room.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use pairpad_core::DocumentError;

use crate::awareness::{AwarenessChange, DEFAULT_AWARENESS_TIMEOUT};
use crate::broadcast::{ConnectionId, Frame, RELAY_ORIGIN};
use crate::protocol::{MessageKind, ProtocolError, SyncMessage};
use crate::room::{Room, RoomRegistry};

/// Admission decision for a missing `Origin` header.
///
/// Browsers always send an origin; scripts and native clients usually do
/// not. Whether to admit origin-less connections is deliberately a
/// configuration decision, not a hardcoded default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingOriginPolicy {
    /// Admit connections without an origin (the reference deployment's
    /// documented relaxation, needed for non-browser tooling).
    Allow,
    /// Fail closed: no origin, no admission.
    Reject,
}

/// Origin admission rules for the default [`AccessPolicy`].
#[derive(Debug, Clone)]
pub struct OriginConfig {
    /// Origins admitted when one is declared. Empty admits any origin.
    pub allowed_origins: Vec<String>,
    pub missing_origin: MissingOriginPolicy,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            missing_origin: MissingOriginPolicy::Allow,
        }
    }
}

/// Why a connection was refused admission.
#[derive(Debug, Clone)]
pub struct ConnectionRejected {
    pub reason: String,
}

impl std::fmt::Display for ConnectionRejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "connection rejected: {}", self.reason)
    }
}

impl std::error::Error for ConnectionRejected {}

/// Origin/authorization collaborator consulted while a connection is in
/// the `Validating` phase. Rejection surfaces to the client as an HTTP 403
/// on the upgrade request; the relay retries nothing.
pub trait AccessPolicy: Send + Sync {
    fn check(&self, room_id: &str, origin: Option<&str>) -> Result<(), ConnectionRejected>;
}

/// Default policy: an origin allowlist plus the configured missing-origin
/// decision.
pub struct OriginAllowlist {
    config: OriginConfig,
}

impl OriginAllowlist {
    pub fn new(config: OriginConfig) -> Self {
        Self { config }
    }
}

impl AccessPolicy for OriginAllowlist {
    fn check(&self, _room_id: &str, origin: Option<&str>) -> Result<(), ConnectionRejected> {
        match origin {
            None => match self.config.missing_origin {
                MissingOriginPolicy::Allow => Ok(()),
                MissingOriginPolicy::Reject => Err(ConnectionRejected {
                    reason: "missing origin".into(),
                }),
            },
            Some(origin) => {
                if self.config.allowed_origins.is_empty()
                    || self.config.allowed_origins.iter().any(|a| a == origin)
                {
                    Ok(())
                } else {
                    Err(ConnectionRejected {
                        reason: format!("origin {origin} not allowed"),
                    })
                }
            }
        }
    }
}

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Broadcast channel capacity per room.
    pub broadcast_capacity: usize,
    /// Interval between liveness pings; a connection missing a pong for a
    /// full interval is closed.
    pub heartbeat_interval: Duration,
    /// How long a connection may take to complete the initial sync
    /// handshake before it is closed.
    pub handshake_timeout: Duration,
    /// Window after which a silent participant is evicted from awareness.
    pub awareness_timeout: Duration,
    pub origin: OriginConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:1234".to_string(),
            broadcast_capacity: 256,
            heartbeat_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            awareness_timeout: DEFAULT_AWARENESS_TIMEOUT,
            origin: OriginConfig::default(),
        }
    }
}

/// Server-wide counters.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub malformed_frames: u64,
    pub active_rooms: usize,
}

/// Lifecycle of one relay connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionPhase {
    Connecting,
    Validating,
    Active,
    Closing,
    Closed,
}

/// Why an active connection left the relay loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    /// Peer closed or the transport dropped.
    PeerGone,
    /// No pong within the heartbeat window.
    PingTimeout,
    /// Initial sync never completed.
    HandshakeTimeout,
    /// Undecodable or out-of-room frame.
    MalformedFrame,
    /// Frame from an unknown protocol revision.
    VersionMismatch,
    /// The room was retired underneath the connection.
    RoomRetired,
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// The relay server. Owns nothing global: the room registry is passed in
/// at construction, so independent instances can coexist in one process.
pub struct RelayServer {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    policy: Arc<dyn AccessPolicy>,
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    /// Server with the default origin-allowlist policy built from the
    /// config.
    pub fn new(config: ServerConfig, registry: Arc<RoomRegistry>) -> Self {
        let policy = Arc::new(OriginAllowlist::new(config.origin.clone()));
        Self::with_policy(config, registry, policy)
    }

    /// Server with a custom admission collaborator.
    pub fn with_policy(
        config: ServerConfig,
        registry: Arc<RoomRegistry>,
        policy: Arc<dyn AccessPolicy>,
    ) -> Self {
        Self {
            config,
            registry,
            policy,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.registry.room_count().await;
        stats
    }

    /// Accept loop. Also spawns the awareness sweep that evicts silent
    /// participants and announces their removal to each room.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("relay listening on {}", self.config.bind_addr);

        Self::spawn_awareness_sweep(self.registry.clone(), self.config.awareness_timeout);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("{addr}: tcp accepted");

            let registry = self.registry.clone();
            let policy = self.policy.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry, policy, stats, config).await
                {
                    log::error!("{addr}: connection error: {e}");
                }
            });
        }
    }

    fn spawn_awareness_sweep(registry: Arc<RoomRegistry>, timeout: Duration) {
        let period = (timeout / 2).max(Duration::from_millis(50));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                for room in registry.rooms().await {
                    let evicted = room.awareness().sweep(timeout);
                    for (participant, clock) in evicted {
                        log::info!(
                            "room {}: participant {participant} timed out, evicting",
                            room.id()
                        );
                        let removal = SyncMessage::awareness_removal(participant, room.id(), clock);
                        match removal.encode() {
                            Ok(bytes) => {
                                room.broadcast().send(RELAY_ORIGIN, Arc::new(bytes));
                            }
                            Err(e) => log::error!("room {}: removal encode failed: {e}", room.id()),
                        }
                    }
                }
            }
        });
    }

    /// Drive one connection through its whole lifecycle.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<RoomRegistry>,
        policy: Arc<dyn AccessPolicy>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        log::trace!("{addr}: {:?}", ConnectionPhase::Connecting);
        let mut room_id: Option<String> = None;
        let mut rejected = false;

        // Validating: the room id comes from the request path and the
        // admission check runs before the upgrade completes, so a refusal
        // is an HTTP status rather than a doomed WebSocket.
        let upgrade = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            log::trace!("{addr}: {:?}", ConnectionPhase::Validating);
            let path = req.uri().path().trim_matches('/').to_string();
            if path.is_empty() {
                rejected = true;
                return Err(reject_with(StatusCode::BAD_REQUEST, "missing room id"));
            }
            let origin = req
                .headers()
                .get("origin")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            if let Err(refusal) = policy.check(&path, origin.as_deref()) {
                rejected = true;
                log::warn!("{addr}: {refusal} (origin {origin:?})");
                return Err(reject_with(StatusCode::FORBIDDEN, &refusal.reason));
            }
            room_id = Some(path);
            Ok(resp)
        })
        .await;

        let ws = match upgrade {
            Ok(ws) => ws,
            Err(e) => {
                if rejected {
                    stats.write().await.rejected_connections += 1;
                } else {
                    log::debug!("{addr}: websocket handshake failed: {e}");
                }
                return Ok(());
            }
        };
        let Some(room_id) = room_id else {
            return Ok(());
        };

        log::trace!("{addr}: {:?}", ConnectionPhase::Active);
        let connection: ConnectionId = Uuid::new_v4();
        let (room, room_rx) = registry.join(&room_id, connection).await;
        log::info!("{addr}: joined room {room_id} as connection {connection}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (ws_tx, ws_rx) = ws.split();
        let (reason, participant) = Self::pump(
            ws_tx, ws_rx, room_rx, &room, &room_id, connection, &stats, &config, addr,
        )
        .await;

        log::info!("{addr}: {:?} ({reason:?})", ConnectionPhase::Closing);

        // Presence is connection-scoped: announce the departure before the
        // connection is forgotten. Pending outbound frames are simply
        // dropped with the connection.
        if let Some(participant) = participant {
            let removal_clock = room.awareness().remove(participant);
            if let Some(clock) = removal_clock {
                let removal = SyncMessage::awareness_removal(participant, &room_id, clock);
                if let Ok(bytes) = removal.encode() {
                    room.broadcast().send(connection, Arc::new(bytes));
                }
            }
        }

        let retired = registry.leave(&room_id, &connection).await;
        if retired {
            log::debug!("{addr}: last connection out, room {room_id} retired");
        }

        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            if matches!(
                reason,
                CloseReason::MalformedFrame | CloseReason::VersionMismatch
            ) {
                s.malformed_frames += 1;
            }
        }

        log::trace!("{addr}: {:?}", ConnectionPhase::Closed);
        Ok(())
    }

    /// Active-phase relay loop. Returns why it ended and the participant
    /// id the peer announced (if any), for the departure broadcast.
    #[allow(clippy::too_many_arguments)]
    async fn pump(
        mut ws_tx: WsSink,
        mut ws_rx: WsSource,
        mut room_rx: broadcast::Receiver<Frame>,
        room: &Arc<Room>,
        room_id: &str,
        connection: ConnectionId,
        stats: &Arc<RwLock<ServerStats>>,
        config: &ServerConfig,
        addr: SocketAddr,
    ) -> (CloseReason, Option<Uuid>) {
        let mut participant: Option<Uuid> = None;

        // Initial sync, server side: our state vector, then the room's
        // current presence roster so the newcomer renders peers without
        // waiting for their next broadcast.
        let step1 = match room.document().state_vector() {
            Ok(sv) => SyncMessage::sync_step1(Uuid::nil(), room_id, sv),
            Err(_) => return (CloseReason::RoomRetired, participant),
        };
        if send_frame(&mut ws_tx, &step1).await.is_err() {
            return (CloseReason::PeerGone, participant);
        }
        let roster = room.awareness().states();
        for (peer, clock, state) in roster {
            match SyncMessage::awareness(peer, room_id, clock, &state) {
                Ok(frame) => {
                    if send_frame(&mut ws_tx, &frame).await.is_err() {
                        return (CloseReason::PeerGone, participant);
                    }
                }
                Err(e) => log::error!("{addr}: roster encode failed: {e}"),
            }
        }

        let started = Instant::now();
        let mut alive = true;
        // Both handshake directions must finish before the connection
        // counts as synced: we have answered their state vector and they
        // have answered ours.
        let mut sent_delta = false;
        let mut got_delta = false;
        let mut heartbeat = tokio::time::interval(config.heartbeat_interval);

        let reason = loop {
            let synced = sent_delta && got_delta;
            tokio::select! {
                inbound = ws_rx.next() => {
                    match inbound {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_frames += 1;
                                s.total_bytes += bytes.len() as u64;
                            }
                            match SyncMessage::decode(&bytes) {
                                Ok(msg) => {
                                    if msg.room != room_id {
                                        log::warn!(
                                            "{addr}: frame for room {:?} on a {room_id:?} connection",
                                            msg.room
                                        );
                                        break CloseReason::MalformedFrame;
                                    }
                                    if participant.is_none() {
                                        participant = Some(msg.participant);
                                    }
                                    match Self::relay_frame(
                                        &mut ws_tx, room, room_id, connection, msg, bytes,
                                        &mut sent_delta, &mut got_delta,
                                    )
                                    .await
                                    {
                                        Ok(()) => {}
                                        Err(reason) => break reason,
                                    }
                                }
                                Err(ProtocolError::VersionMismatch { found }) => {
                                    log::warn!("{addr}: unknown protocol version {found}");
                                    break CloseReason::VersionMismatch;
                                }
                                Err(e) => {
                                    log::warn!("{addr}: dropping malformed frame: {e}");
                                    break CloseReason::MalformedFrame;
                                }
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if ws_tx.send(Message::Pong(payload)).await.is_err() {
                                break CloseReason::PeerGone;
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            alive = true;
                            if let Some(participant) = participant {
                                room.awareness().touch(&participant);
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            break CloseReason::PeerGone;
                        }
                        Some(Err(e)) => {
                            log::debug!("{addr}: websocket error: {e}");
                            break CloseReason::PeerGone;
                        }
                        Some(Ok(_)) => {}
                    }
                }

                outbound = room_rx.recv() => {
                    match outbound {
                        Ok(frame) => {
                            if frame.origin == connection {
                                continue;
                            }
                            if ws_tx
                                .send(Message::Binary(frame.bytes.to_vec().into()))
                                .await
                                .is_err()
                            {
                                break CloseReason::PeerGone;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("{addr}: lagged by {n} frames");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            break CloseReason::RoomRetired;
                        }
                    }
                }

                _ = tokio::time::sleep_until(
                    (started + config.handshake_timeout).into()
                ), if !synced => {
                    log::warn!("{addr}: initial sync not completed in time");
                    break CloseReason::HandshakeTimeout;
                }

                _ = heartbeat.tick() => {
                    if !alive {
                        break CloseReason::PingTimeout;
                    }
                    alive = false;
                    if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break CloseReason::PeerGone;
                    }
                }
            }
        };

        (reason, participant)
    }

    /// Handle one decoded in-protocol frame.
    #[allow(clippy::too_many_arguments)]
    async fn relay_frame(
        ws_tx: &mut WsSink,
        room: &Arc<Room>,
        room_id: &str,
        connection: ConnectionId,
        msg: SyncMessage,
        raw: Vec<u8>,
        sent_delta: &mut bool,
        got_delta: &mut bool,
    ) -> Result<(), CloseReason> {
        match msg.kind {
            MessageKind::SyncStep1 => {
                // Their state vector: answer with the delta they miss.
                let delta = match room.document().diff(&msg.payload) {
                    Ok(delta) => delta,
                    Err(DocumentError::Closed) => return Err(CloseReason::RoomRetired),
                    Err(e) => {
                        log::warn!("room {room_id}: bad state vector: {e}");
                        return Err(CloseReason::MalformedFrame);
                    }
                };
                let reply = SyncMessage::sync_step2(Uuid::nil(), room_id, delta);
                if send_frame(ws_tx, &reply).await.is_err() {
                    return Err(CloseReason::PeerGone);
                }
                *sent_delta = true;
                Ok(())
            }
            MessageKind::SyncStep2 => {
                // The delta we were missing. Merge it, then pass the new
                // content on to the rest of the room as a regular update —
                // never as a step-2 frame, which would fake handshake
                // completion at the other connections.
                match room.document().apply_update(&msg.payload) {
                    Ok(()) => {}
                    Err(DocumentError::Closed) => return Err(CloseReason::RoomRetired),
                    Err(e) => {
                        log::warn!("room {room_id}: bad sync delta: {e}");
                        return Err(CloseReason::MalformedFrame);
                    }
                }
                *got_delta = true;
                if !msg.payload.is_empty() {
                    let forward =
                        SyncMessage::update(msg.participant, room_id, msg.clock, msg.payload);
                    match forward.encode() {
                        Ok(bytes) => {
                            room.broadcast().send(connection, Arc::new(bytes));
                        }
                        Err(e) => log::error!("room {room_id}: forward encode failed: {e}"),
                    }
                }
                Ok(())
            }
            MessageKind::Update => {
                // Merge into the authority first; once merged an update is
                // never discarded. Then forward verbatim.
                match room.document().apply_update(&msg.payload) {
                    Ok(()) => {}
                    Err(DocumentError::Closed) => return Err(CloseReason::RoomRetired),
                    Err(e) => {
                        log::warn!("room {room_id}: bad update: {e}");
                        return Err(CloseReason::MalformedFrame);
                    }
                }
                room.broadcast().send(connection, Arc::new(raw));
                Ok(())
            }
            MessageKind::Awareness => {
                let state = match msg.awareness_state() {
                    Ok(state) => state,
                    Err(e) => {
                        log::warn!("room {room_id}: bad awareness payload: {e}");
                        return Err(CloseReason::MalformedFrame);
                    }
                };
                let change = room.awareness().apply(msg.participant, msg.clock, state);
                // Stale frames die here; awareness is droppable by design.
                if change != AwarenessChange::Stale {
                    room.broadcast().send(connection, Arc::new(raw));
                }
                Ok(())
            }
        }
    }
}

async fn send_frame(ws_tx: &mut WsSink, msg: &SyncMessage) -> Result<(), ()> {
    let bytes = msg.encode().map_err(|e| {
        log::error!("frame encode failed: {e}");
    })?;
    ws_tx
        .send(Message::Binary(bytes.into()))
        .await
        .map_err(|_| ())
}

fn reject_with(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}
