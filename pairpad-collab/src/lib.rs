//! # pairpad-collab — real-time collaboration layer
//!
//! WebSocket-based multi-participant editing over the CRDT document model
//! of `pairpad-core`.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐      WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ RelayServer │
//! │ (per user)  │    Binary frames    │ (per room)  │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                    ┌──────────────┐
//! │ Document    │                    │ RoomRegistry │
//! │ (replica)   │                    │  Document    │
//! └─────────────┘                    │  (authority) │
//!                                    │  Awareness   │
//!                                    │  Broadcast   │
//!                                    └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — versioned binary wire protocol (bincode frames)
//! - [`awareness`] — ephemeral presence: cursors, typing, follow targets
//! - [`broadcast`] — per-room fan-out with backpressure
//! - [`room`] — room registry and the pluggable snapshot store
//! - [`server`] — the relay: admission, handshake, heartbeat, routing
//! - [`client`] — sync client with offline queue and auto-forwarded edits

pub mod awareness;
pub mod broadcast;
pub mod client;
pub mod protocol;
pub mod room;
pub mod server;

// Re-exports for convenience
pub use awareness::{
    AwarenessChange, AwarenessEntry, AwarenessSet, AwarenessState, CursorPosition,
    LocalAwareness, UserProfile,
};
pub use broadcast::{BroadcastGroup, BroadcastStats, ConnectionId, Frame};
pub use client::{ConnectionState, OfflineQueue, SyncClient, SyncEvent};
pub use protocol::{MessageKind, ProtocolError, SyncMessage, PROTOCOL_VERSION};
pub use room::{MemorySnapshotStore, Room, RoomRegistry, SnapshotStore};
pub use server::{
    AccessPolicy, ConnectionRejected, MissingOriginPolicy, OriginAllowlist, OriginConfig,
    RelayServer, ServerConfig, ServerStats,
};
