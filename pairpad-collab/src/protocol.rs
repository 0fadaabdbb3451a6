//! Binary wire protocol for document and awareness synchronization.
//!
//! Wire format:
//! ```text
//! ┌─────────┬──────────┬────────────────┬─────────┬─────────┬──────────┐
//! │ version │ kind     │ participant    │ room    │ clock   │ payload  │
//! │ 1 byte  │ 1 byte   │ 16 bytes       │ string  │ 8 bytes │ variable │
//! └─────────┴──────────┴────────────────┴─────────┴─────────┴──────────┘
//! ```
//!
//! The leading version byte is checked before any other byte is
//! interpreted: a frame from an unknown protocol revision fails the
//! connection instead of being misread. Everything after the version byte
//! is a bincode-encoded [`SyncMessage`].
//!
//! Two logically distinct streams share the one connection:
//!
//! - **Document sync** — `SyncStep1` (state vector), `SyncStep2` (missing
//!   delta) and `Update` (incremental edit). A connection is synced only
//!   once `SyncStep2` has completed in both directions.
//! - **Awareness** — each frame carries the sender's *full* presence state
//!   (not a diff) plus a monotonically increasing clock so stale frames can
//!   be discarded. An empty payload announces removal.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::awareness::AwarenessState;

/// Current wire protocol revision.
pub const PROTOCOL_VERSION: u8 = 1;

/// Frame kinds multiplexed over one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// State vector: "this is what I have seen".
    SyncStep1 = 1,
    /// Update delta computed against a received state vector.
    SyncStep2 = 2,
    /// Incremental document update.
    Update = 3,
    /// Full awareness state of one participant (empty payload = removed).
    Awareness = 4,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub kind: MessageKind,
    /// Connection-scoped participant id of the sender. Fresh per
    /// connection; not stable across reconnects.
    pub participant: Uuid,
    /// Room the frame belongs to. Opaque string; the reference deployment
    /// uses 5-digit numeric ids.
    pub room: String,
    /// Lamport clock for updates, awareness clock for presence frames.
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    /// First handshake step: announce our state vector.
    pub fn sync_step1(participant: Uuid, room: impl Into<String>, state_vector: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::SyncStep1,
            participant,
            room: room.into(),
            clock: 0,
            payload: state_vector,
        }
    }

    /// Second handshake step: the delta the peer is missing.
    pub fn sync_step2(participant: Uuid, room: impl Into<String>, delta: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::SyncStep2,
            participant,
            room: room.into(),
            clock: 0,
            payload: delta,
        }
    }

    /// Incremental document update.
    pub fn update(participant: Uuid, room: impl Into<String>, clock: u64, update: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Update,
            participant,
            room: room.into(),
            clock,
            payload: update,
        }
    }

    /// Full awareness state broadcast.
    pub fn awareness(
        participant: Uuid,
        room: impl Into<String>,
        clock: u64,
        state: &AwarenessState,
    ) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(state, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(Self {
            kind: MessageKind::Awareness,
            participant,
            room: room.into(),
            clock,
            payload,
        })
    }

    /// Awareness removal: the participant is gone and must be dropped from
    /// every peer's awareness set.
    pub fn awareness_removal(participant: Uuid, room: impl Into<String>, clock: u64) -> Self {
        Self {
            kind: MessageKind::Awareness,
            participant,
            room: room.into(),
            clock,
            payload: Vec::new(),
        }
    }

    /// Serialize to the wire format, version byte first.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let body = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        let mut frame = Vec::with_capacity(body.len() + 1);
        frame.push(PROTOCOL_VERSION);
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Deserialize from the wire format, rejecting unknown revisions before
    /// touching the body.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (&version, body) = bytes
            .split_first()
            .ok_or_else(|| ProtocolError::Malformed("empty frame".into()))?;
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch { found: version });
        }
        let (msg, _) = bincode::serde::decode_from_slice(body, bincode::config::standard())
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Ok(msg)
    }

    /// Parse an awareness payload. `Ok(None)` is a removal announcement.
    pub fn awareness_state(&self) -> Result<Option<AwarenessState>, ProtocolError> {
        if self.kind != MessageKind::Awareness {
            return Err(ProtocolError::InvalidKind);
        }
        if self.payload.is_empty() {
            return Ok(None);
        }
        let (state, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Ok(Some(state))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame was produced by an unknown protocol revision.
    VersionMismatch { found: u8 },
    /// The frame body could not be decoded.
    Malformed(String),
    /// A message could not be serialized.
    Encode(String),
    /// A payload accessor was called on the wrong frame kind.
    InvalidKind,
    /// The transport is gone.
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::VersionMismatch { found } => write!(
                f,
                "protocol version mismatch: got {found}, expected {PROTOCOL_VERSION}"
            ),
            Self::Malformed(e) => write!(f, "malformed frame: {e}"),
            Self::Encode(e) => write!(f, "encode error: {e}"),
            Self::InvalidKind => write!(f, "invalid message kind"),
            Self::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::{CursorPosition, UserProfile};

    #[test]
    fn test_update_roundtrip() {
        let participant = Uuid::new_v4();
        let payload = vec![1, 2, 3, 4, 5];

        let msg = SyncMessage::update(participant, "54321", 42, payload.clone());
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.kind, MessageKind::Update);
        assert_eq!(decoded.participant, participant);
        assert_eq!(decoded.room, "54321");
        assert_eq!(decoded.clock, 42);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_sync_steps_roundtrip() {
        let participant = Uuid::new_v4();

        let step1 = SyncMessage::sync_step1(participant, "11111", vec![10, 20]);
        let decoded = SyncMessage::decode(&step1.encode().unwrap()).unwrap();
        assert_eq!(decoded.kind, MessageKind::SyncStep1);
        assert_eq!(decoded.payload, vec![10, 20]);

        let step2 = SyncMessage::sync_step2(participant, "11111", vec![30]);
        let decoded = SyncMessage::decode(&step2.encode().unwrap()).unwrap();
        assert_eq!(decoded.kind, MessageKind::SyncStep2);
        assert_eq!(decoded.payload, vec![30]);
    }

    #[test]
    fn test_awareness_roundtrip() {
        let participant = Uuid::new_v4();
        let state = AwarenessState {
            user: UserProfile::new("Alice"),
            cursor: Some(CursorPosition { line: 3, column: 14 }),
            typing: true,
            typed_at_ms: 1_700_000_000_000,
            follow: Some(Uuid::new_v4()),
        };

        let msg = SyncMessage::awareness(participant, "54321", 7, &state).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.kind, MessageKind::Awareness);
        assert_eq!(decoded.clock, 7);
        assert_eq!(decoded.awareness_state().unwrap(), Some(state));
    }

    #[test]
    fn test_awareness_removal() {
        let participant = Uuid::new_v4();
        let msg = SyncMessage::awareness_removal(participant, "54321", 9);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert!(decoded.payload.is_empty());
        assert_eq!(decoded.awareness_state().unwrap(), None);
    }

    #[test]
    fn test_version_byte_leads_frame() {
        let msg = SyncMessage::update(Uuid::new_v4(), "54321", 1, vec![]);
        let encoded = msg.encode().unwrap();
        assert_eq!(encoded[0], PROTOCOL_VERSION);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let msg = SyncMessage::update(Uuid::new_v4(), "54321", 1, vec![1, 2]);
        let mut encoded = msg.encode().unwrap();
        encoded[0] = 0xFE;

        match SyncMessage::decode(&encoded) {
            Err(ProtocolError::VersionMismatch { found }) => assert_eq!(found, 0xFE),
            other => panic!("expected version mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_and_garbage_frames_rejected() {
        assert!(matches!(
            SyncMessage::decode(&[]),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            SyncMessage::decode(&[PROTOCOL_VERSION, 0xFF, 0xFF, 0xFF]),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_awareness_state_on_wrong_kind() {
        let msg = SyncMessage::update(Uuid::new_v4(), "54321", 1, vec![]);
        assert_eq!(msg.awareness_state(), Err(ProtocolError::InvalidKind));
    }

    #[test]
    fn test_frame_overhead_is_small() {
        let msg = SyncMessage::update(Uuid::new_v4(), "54321", 1, vec![0u8; 50]);
        let encoded = msg.encode().unwrap();
        // 1 version + 1 kind + 16 participant + room + 8 clock + payload,
        // with bincode varint lengths. Well under 100 bytes of overhead.
        assert!(
            encoded.len() < 100,
            "encoded size {} too large for a 50-byte update",
            encoded.len()
        );
    }
}
