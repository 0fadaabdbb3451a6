//! Fan-out of encoded frames to the other connections of a room.
//!
//! Built on tokio broadcast channels: every connection in a room holds an
//! independent receiver buffering up to `capacity` frames. Frames carry the
//! originating connection id so each connection's pump can skip its own
//! traffic without decoding; the relay itself never interprets frame
//! contents.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// Server-side identity of one transport connection. Distinct from the
/// participant id inside frames, which the client chooses.
pub type ConnectionId = Uuid;

/// Origin used for frames the relay itself produces (awareness eviction
/// announcements); never equal to a real connection id, so every
/// connection forwards them.
pub const RELAY_ORIGIN: ConnectionId = Uuid::nil();

/// One encoded frame travelling through a room.
#[derive(Debug, Clone)]
pub struct Frame {
    pub origin: ConnectionId,
    pub bytes: Arc<Vec<u8>>,
}

/// Counters for monitoring broadcast health, tracked with atomics so the
/// send path never takes a lock.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub active_connections: usize,
}

/// The broadcast channel shared by every connection of one room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Frame>,
    connections: Arc<RwLock<HashSet<ConnectionId>>>,
    capacity: usize,
    frames_sent: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` bounds how many frames a lagging connection may buffer
    /// before it starts losing them.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            connections: Arc::new(RwLock::new(HashSet::new())),
            capacity,
            frames_sent: AtomicU64::new(0),
        }
    }

    /// Register a connection and hand it its receiver.
    pub async fn register(&self, id: ConnectionId) -> broadcast::Receiver<Frame> {
        self.connections.write().await.insert(id);
        self.sender.subscribe()
    }

    /// Deregister a connection. Returns `true` if it was registered.
    pub async fn unregister(&self, id: &ConnectionId) -> bool {
        self.connections.write().await.remove(id)
    }

    /// Send pre-encoded bytes to every receiver. Receivers skip frames
    /// whose origin matches their own connection id. Returns the number of
    /// receivers the frame reached.
    pub fn send(&self, origin: ConnectionId, bytes: Arc<Vec<u8>>) -> usize {
        let reached = self.sender.send(Frame { origin, bytes }).unwrap_or(0);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        reached
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.read().await.contains(id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            active_connections: self.connections.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
