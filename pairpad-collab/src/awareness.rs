//! Ephemeral presence: who is in the room, where their cursor is, whether
//! they are typing, whom they follow.
//!
//! Awareness is kept in a store completely separate from the document and
//! is never merged into CRDT history. The contract is last-writer-wins per
//! participant: every frame carries the sender's *full* state plus a
//! monotonically increasing clock, and receivers drop frames whose clock is
//! not newer than what they already hold. Participants that stop
//! refreshing are evicted by a timer-driven sweep rather than an explicit
//! delete.
//!
//! Two pieces:
//!
//! - [`AwarenessSet`] — the pure data store (`participant → state + clock +
//!   last-seen`), used by the relay for timeout eviction and by clients to
//!   render remote peers.
//! - [`LocalAwareness`] — this connection's own state plus the outgoing
//!   clock and the cursor broadcast throttle.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Cursor broadcasts are throttled to this interval; identity, typing and
/// follow changes always go out immediately.
pub const CURSOR_BROADCAST_INTERVAL: Duration = Duration::from_millis(100);

/// Default window after which a silent participant is evicted. Three
/// heartbeat intervals: entries are refreshed by liveness pongs, so a
/// healthy connection never comes close to this.
pub const DEFAULT_AWARENESS_TIMEOUT: Duration = Duration::from_secs(90);

/// Cursor palette; a participant's color is picked from it by id hash so
/// the same id always renders the same color.
const USER_COLORS: [&str; 7] = [
    "#f87171", "#fb923c", "#facc15", "#4ade80", "#60a5fa", "#c084fc", "#f472b6",
];

/// Display identity of a participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub name: String,
    /// Hex color for cursor and selection rendering.
    pub color: String,
}

impl UserProfile {
    /// Profile with a color derived from a random id.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Profile with a color stably derived from `id`.
    pub fn with_id(id: Uuid, name: impl Into<String>) -> Self {
        let color = USER_COLORS[(id.as_u128() % USER_COLORS.len() as u128) as usize];
        Self {
            name: name.into(),
            color: color.to_string(),
        }
    }
}

/// Cursor location in the currently edited file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub line: u32,
    pub column: u32,
}

/// Full ephemeral state of one participant, broadcast as a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessState {
    pub user: UserProfile,
    pub cursor: Option<CursorPosition>,
    /// Whether the participant is actively typing.
    pub typing: bool,
    /// Unix-millisecond timestamp of the last typing change, so stale
    /// typing indicators can decay on the rendering side.
    pub typed_at_ms: u64,
    /// Participant this one is following (a client-local viewport choice,
    /// visible to others but never an instruction to them).
    pub follow: Option<Uuid>,
}

impl AwarenessState {
    pub fn new(user: UserProfile) -> Self {
        Self {
            user,
            cursor: None,
            typing: false,
            typed_at_ms: 0,
            follow: None,
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One tracked remote participant.
#[derive(Debug, Clone)]
pub struct AwarenessEntry {
    pub state: AwarenessState,
    pub clock: u64,
    last_seen: Instant,
}

impl AwarenessEntry {
    /// Time since the last accepted frame from this participant.
    pub fn idle_for(&self) -> Duration {
        self.last_seen.elapsed()
    }
}

/// Outcome of applying one awareness frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwarenessChange {
    /// The participant's state was inserted or refreshed.
    Updated,
    /// The participant was removed from the set.
    Removed,
    /// The frame was older than the state already held and was dropped.
    Stale,
}

/// Store of remote participants' presence, keyed by participant id.
#[derive(Debug, Default)]
pub struct AwarenessSet {
    entries: HashMap<Uuid, AwarenessEntry>,
}

impl AwarenessSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one frame: `Some(state)` refreshes, `None` removes. Frames
    /// with a clock not newer than the held one are dropped, so reordered
    /// or duplicated deliveries cannot roll presence backwards.
    pub fn apply(
        &mut self,
        participant: Uuid,
        clock: u64,
        state: Option<AwarenessState>,
    ) -> AwarenessChange {
        if let Some(existing) = self.entries.get(&participant) {
            if clock <= existing.clock {
                return AwarenessChange::Stale;
            }
        }
        match state {
            Some(state) => {
                self.entries.insert(
                    participant,
                    AwarenessEntry {
                        state,
                        clock,
                        last_seen: Instant::now(),
                    },
                );
                AwarenessChange::Updated
            }
            None => {
                if self.entries.remove(&participant).is_some() {
                    AwarenessChange::Removed
                } else {
                    AwarenessChange::Stale
                }
            }
        }
    }

    /// Drop the participant unconditionally (disconnect path). Returns the
    /// clock the removal announcement should carry.
    pub fn remove(&mut self, participant: Uuid) -> Option<u64> {
        self.entries.remove(&participant).map(|e| e.clock + 1)
    }

    /// Refresh a participant's liveness without changing state; called when
    /// their connection answers a probe. Returns `false` for unknown ids.
    pub fn touch(&mut self, participant: &Uuid) -> bool {
        match self.entries.get_mut(participant) {
            Some(entry) => {
                entry.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Evict every participant silent for longer than `timeout`. Returns
    /// `(participant, removal clock)` pairs for broadcasting.
    pub fn sweep(&mut self, timeout: Duration) -> Vec<(Uuid, u64)> {
        let stale: Vec<(Uuid, u64)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.idle_for() > timeout)
            .map(|(id, e)| (*id, e.clock + 1))
            .collect();
        for (id, _) in &stale {
            self.entries.remove(id);
        }
        stale
    }

    pub fn get(&self, participant: &Uuid) -> Option<&AwarenessEntry> {
        self.entries.get(participant)
    }

    /// Snapshot of every tracked participant, for sending the room roster
    /// to a newly joined connection.
    pub fn states(&self) -> Vec<(Uuid, u64, AwarenessState)> {
        self.entries
            .iter()
            .map(|(id, e)| (*id, e.clock, e.state.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// This connection's own presence plus outgoing clock and throttle state.
///
/// Every mutator returns the `(clock, state)` pair to broadcast, except
/// [`set_cursor`](Self::set_cursor), which returns `None` while throttled.
#[derive(Debug)]
pub struct LocalAwareness {
    participant: Uuid,
    state: AwarenessState,
    clock: u64,
    last_cursor_broadcast: Instant,
    cursor_interval: Duration,
}

impl LocalAwareness {
    pub fn new(participant: Uuid, user: UserProfile) -> Self {
        Self {
            participant,
            state: AwarenessState::new(user),
            clock: 0,
            // Allow an immediate first cursor broadcast.
            last_cursor_broadcast: Instant::now() - CURSOR_BROADCAST_INTERVAL,
            cursor_interval: CURSOR_BROADCAST_INTERVAL,
        }
    }

    /// Override the cursor throttle (tests).
    pub fn with_interval(participant: Uuid, user: UserProfile, interval: Duration) -> Self {
        let mut local = Self::new(participant, user);
        local.cursor_interval = interval;
        local
    }

    pub fn participant(&self) -> Uuid {
        self.participant
    }

    /// Re-key after a reconnect: participant ids are connection-scoped.
    pub fn set_participant(&mut self, participant: Uuid) {
        self.participant = participant;
    }

    pub fn state(&self) -> &AwarenessState {
        &self.state
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    fn bump(&mut self) -> (u64, AwarenessState) {
        self.clock += 1;
        (self.clock, self.state.clone())
    }

    /// The state to announce on join (or re-announce on reconnect).
    pub fn announce(&mut self) -> (u64, AwarenessState) {
        self.bump()
    }

    /// Clock for the removal frame sent on clean disconnect.
    pub fn removal_clock(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Update the cursor location. Returns `None` while throttled; the
    /// latest position is still retained and goes out with the next
    /// broadcast of any kind.
    pub fn set_cursor(&mut self, line: u32, column: u32) -> Option<(u64, AwarenessState)> {
        self.state.cursor = Some(CursorPosition { line, column });
        if self.last_cursor_broadcast.elapsed() < self.cursor_interval {
            return None;
        }
        self.last_cursor_broadcast = Instant::now();
        Some(self.bump())
    }

    /// Flip the typing flag, stamping the change time.
    pub fn set_typing(&mut self, typing: bool) -> (u64, AwarenessState) {
        self.state.typing = typing;
        self.state.typed_at_ms = now_ms();
        self.bump()
    }

    /// Change display identity.
    pub fn set_profile(&mut self, user: UserProfile) -> (u64, AwarenessState) {
        self.state.user = user;
        self.bump()
    }

    /// Start or stop following another participant.
    pub fn set_follow(&mut self, follow: Option<Uuid>) -> (u64, AwarenessState) {
        self.state.follow = follow;
        self.bump()
    }
}
