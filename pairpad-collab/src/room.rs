//! Room registry: room id → document + connection set.
//!
//! A room is created lazily when its first connection joins and retired
//! synchronously when its last connection leaves (documented choice: no
//! grace period — a rapid reconnect recreates the room, restoring from the
//! configured [`SnapshotStore`] when one exists, so nothing is lost).
//!
//! `join` and `leave` take the registry write lock across both the
//! membership change and the emptiness check, so the "is this the last
//! connection" decision can never race a concurrent join.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{broadcast, RwLock};

use pairpad_core::Document;

use crate::awareness::AwarenessSet;
use crate::broadcast::{BroadcastGroup, ConnectionId, Frame};

/// Optional persistence collaborator: checkpoints a room's full state on
/// retirement and restores it on (re)creation. The engine works identically
/// with or without one.
pub trait SnapshotStore: Send + Sync {
    /// Last checkpoint for `room_id`, if any.
    fn load(&self, room_id: &str) -> Option<Vec<u8>>;
    /// Persist a checkpoint for `room_id`.
    fn store(&self, room_id: &str, snapshot: &[u8]);
}

/// In-process snapshot store, for tests and single-process deployments
/// that want rooms to survive going empty.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().expect("snapshot lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self, room_id: &str) -> Option<Vec<u8>> {
        self.snapshots
            .lock()
            .expect("snapshot lock poisoned")
            .get(room_id)
            .cloned()
    }

    fn store(&self, room_id: &str, snapshot: &[u8]) {
        self.snapshots
            .lock()
            .expect("snapshot lock poisoned")
            .insert(room_id.to_string(), snapshot.to_vec());
    }
}

/// One live room: the authoritative document, the broadcast channel and
/// the awareness set shared by its connections.
pub struct Room {
    id: String,
    document: Document,
    broadcast: BroadcastGroup,
    awareness: Mutex<AwarenessSet>,
}

impl Room {
    fn new(id: impl Into<String>, broadcast_capacity: usize) -> Self {
        let id = id.into();
        Self {
            document: Document::new(id.clone()),
            broadcast: BroadcastGroup::new(broadcast_capacity),
            awareness: Mutex::new(AwarenessSet::new()),
            id,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The room's authoritative document. Connections hold the room by
    /// `Arc` and reference the document; they never own it.
    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn broadcast(&self) -> &BroadcastGroup {
        &self.broadcast
    }

    /// The room's awareness set. The guard must not be held across await
    /// points; callers take it, mutate, and drop.
    pub fn awareness(&self) -> MutexGuard<'_, AwarenessSet> {
        self.awareness.lock().expect("awareness lock poisoned")
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room").field("id", &self.id).finish()
    }
}

/// Maps room ids to live rooms. Passed explicitly to the relay server at
/// construction so multiple independent instances can coexist (tests,
/// sharding by room id).
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    broadcast_capacity: usize,
    store: Option<Arc<dyn SnapshotStore>>,
}

impl RoomRegistry {
    pub fn new(broadcast_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            broadcast_capacity,
            store: None,
        }
    }

    /// Registry with a persistence collaborator: rooms checkpoint on
    /// retirement and restore on creation.
    pub fn with_store(broadcast_capacity: usize, store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            broadcast_capacity,
            store: Some(store),
        }
    }

    /// Register `connection` with the room `room_id`, creating the room if
    /// absent. Returns the room and the connection's broadcast receiver.
    pub async fn join(
        &self,
        room_id: &str,
        connection: ConnectionId,
    ) -> (Arc<Room>, broadcast::Receiver<Frame>) {
        let mut rooms = self.rooms.write().await;
        let room = match rooms.get(room_id) {
            Some(room) => room.clone(),
            None => {
                let room = Arc::new(Room::new(room_id, self.broadcast_capacity));
                if let Some(store) = &self.store {
                    if let Some(snapshot) = store.load(room_id) {
                        match room.document().apply_update(&snapshot) {
                            Ok(()) => log::info!("room {room_id}: restored from checkpoint"),
                            Err(e) => {
                                log::warn!("room {room_id}: discarding bad checkpoint: {e}")
                            }
                        }
                    }
                }
                rooms.insert(room_id.to_string(), room.clone());
                log::info!("room {room_id}: created");
                room
            }
        };
        let rx = room.broadcast().register(connection).await;
        (room, rx)
    }

    /// Deregister `connection` from `room_id`. When the room's connection
    /// set becomes empty the room is retired: checkpointed to the store if
    /// one is configured, then its document is closed and the entry
    /// dropped. Returns `true` when the room was retired.
    pub async fn leave(&self, room_id: &str, connection: &ConnectionId) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(room_id) else {
            return false;
        };
        room.broadcast().unregister(connection).await;
        if room.broadcast().connection_count().await > 0 {
            return false;
        }

        if let Some(store) = &self.store {
            match room.document().snapshot() {
                Ok(snapshot) => store.store(room_id, &snapshot),
                Err(e) => log::error!("room {room_id}: checkpoint failed: {e}"),
            }
        }
        room.document().close();
        rooms.remove(room_id);
        log::info!("room {room_id}: retired (empty)");
        true
    }

    /// The room for `room_id`, if currently live.
    pub async fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// All live rooms (awareness sweep iterates these).
    pub async fn rooms(&self) -> Vec<Arc<Room>> {
        self.rooms.read().await.values().cloned().collect()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}
