//! The owned per-peer session value: who is playing, in which role, and how far along.

use crate::link::role::Role;
use crate::{PeerId, Tick};

/// Lifecycle phase of a [`DuelSession`]. Phases only move forward.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    /// Rosters, identities, seed and readiness are being exchanged.
    Handshake,
    /// Command buffers flow in both directions.
    Active,
    /// The match is over or being forced to end; the session is winding down.
    Ending,
    /// Nothing more happens. The controller ignores all further input.
    Closed,
}

impl Phase {
    /// Returns a string representation suitable for logging.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Phase::Handshake => "handshake",
            Phase::Active => "active",
            Phase::Ending => "ending",
            Phase::Closed => "closed",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One match between exactly two peers, as seen by one of them.
///
/// Each peer owns its own `DuelSession`; the two are kept consistent purely by message exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuelSession {
    local_peer: PeerId,
    remote_peer: PeerId,
    role: Role,
    stage: u32,
    phase: Phase,
    created_at: Tick,
    phase_changed_at: Tick,
}

impl DuelSession {
    /// Creates a session in the [`Phase::Handshake`] phase.
    #[must_use]
    pub fn new(local_peer: PeerId, remote_peer: PeerId, role: Role, created_at: Tick) -> Self {
        Self {
            local_peer,
            remote_peer,
            role,
            stage: 0,
            phase: Phase::Handshake,
            created_at,
            phase_changed_at: created_at,
        }
    }

    /// The local participant.
    #[must_use]
    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    /// The opponent.
    #[must_use]
    pub fn remote_peer(&self) -> &PeerId {
        &self.remote_peer
    }

    /// The local role.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// The role the opponent plays.
    #[must_use]
    pub const fn remote_role(&self) -> Role {
        self.role.opposite()
    }

    /// Number of completed buffer rounds.
    #[must_use]
    pub const fn stage(&self) -> u32 {
        self.stage
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Tick at which the session was created.
    #[must_use]
    pub const fn created_at(&self) -> Tick {
        self.created_at
    }

    /// Tick of the most recent phase change.
    #[must_use]
    pub const fn phase_changed_at(&self) -> Tick {
        self.phase_changed_at
    }

    /// Returns `true` once the session reached [`Phase::Closed`].
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    /// Moves to `next` if it lies ahead of the current phase. Returns `false` (and leaves the
    /// session untouched) for backward or repeated transitions.
    pub(crate) fn advance(&mut self, next: Phase, now: Tick) -> bool {
        if next <= self.phase {
            return false;
        }
        tracing::debug!(
            peer = %self.local_peer,
            from = %self.phase,
            to = %next,
            tick = %now,
            "session phase change"
        );
        self.phase = next;
        self.phase_changed_at = now;
        true
    }

    /// Increments the stage counter and returns the new value.
    pub(crate) fn increment_stage(&mut self) -> u32 {
        self.stage = self.stage.saturating_add(1);
        self.stage
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    fn session() -> DuelSession {
        DuelSession::new(PeerId::new("red"), PeerId::new("blue"), Role::Host, Tick::ZERO)
    }

    #[test]
    fn new_session_starts_in_handshake() {
        let session = session();
        assert_eq!(session.phase(), Phase::Handshake);
        assert_eq!(session.stage(), 0);
        assert_eq!(session.remote_role(), Role::Guest);
        assert!(!session.is_closed());
    }

    #[test]
    fn phases_only_move_forward() {
        let mut session = session();
        assert!(session.advance(Phase::Active, Tick::new(3)));
        assert!(!session.advance(Phase::Handshake, Tick::new(4)));
        assert!(!session.advance(Phase::Active, Tick::new(4)));
        assert_eq!(session.phase_changed_at(), Tick::new(3));
        assert!(session.advance(Phase::Closed, Tick::new(9)));
        assert!(session.is_closed());
    }

    #[test]
    fn handshake_may_skip_straight_to_ending() {
        let mut session = session();
        assert!(session.advance(Phase::Ending, Tick::new(1)));
        assert_eq!(session.phase(), Phase::Ending);
    }

    #[test]
    fn stage_increments() {
        let mut session = session();
        assert_eq!(session.increment_stage(), 1);
        assert_eq!(session.increment_stage(), 2);
        assert_eq!(session.stage(), 2);
    }
}
