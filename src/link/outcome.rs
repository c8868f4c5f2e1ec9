//! Outcome capture, mirroring and host-wins reconciliation.
//!
//! The local outcome is captured exactly once; later reads of the simulation never replace it.
//! A peer outcome that arrives first is mirrored into the local one. When both are known and
//! disagree, [`arbitrate_outcome`] decides.

use crate::error::InvalidRequestKind;
use crate::link::role::{arbitrate_outcome, Role};
use crate::network::messages::Message;
use crate::{Outcome, Tick};

/// What a peer `duel_end` did to the local outcome.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PeerEndEffect {
    /// No local outcome yet; it is now the mirror of the peer's.
    Mirrored(Outcome),
    /// Both outcomes agree.
    Consistent,
    /// The outcomes disagreed and the guest adopted the host's view.
    Overridden {
        /// What the guest had captured.
        previous: Outcome,
        /// The mirrored host outcome now in force.
        adopted: Outcome,
    },
    /// The outcomes disagreed and the host kept its own.
    HostKept {
        /// The guest's claim, from the guest's perspective.
        peer: Outcome,
    },
    /// A peer outcome had already been received.
    Duplicate,
}

/// What a disconnect notice did to the local outcome.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DisconnectEffect {
    /// No outcome had been captured; the match is aborted.
    Aborted,
    /// An outcome had already been captured and stands.
    Stands(Outcome),
}

/// Per-session outcome state.
///
/// ```
/// use duel_link::{Outcome, OutcomeSynchronizer, Role, Tick};
/// use duel_link::link::outcome::PeerEndEffect;
///
/// let mut sync = OutcomeSynchronizer::new(Role::Guest);
/// assert_eq!(
///     sync.on_peer_end(Outcome::Win, Tick::new(40)),
///     PeerEndEffect::Mirrored(Outcome::Lose)
/// );
/// assert_eq!(sync.local(), Some(Outcome::Lose));
/// assert!(sync.is_settled());
/// ```
#[derive(Debug, Clone)]
pub struct OutcomeSynchronizer {
    role: Role,
    local: Option<Outcome>,
    local_at: Option<Tick>,
    peer: Option<Outcome>,
    peer_disconnected: bool,
    end_sent: bool,
}

impl OutcomeSynchronizer {
    /// Creates an empty synchronizer.
    #[must_use]
    pub const fn new(role: Role) -> Self {
        Self {
            role,
            local: None,
            local_at: None,
            peer: None,
            peer_disconnected: false,
            end_sent: false,
        }
    }

    /// The local outcome, once known.
    #[must_use]
    pub const fn local(&self) -> Option<Outcome> {
        self.local
    }

    /// The peer's reported outcome (from the peer's perspective), once received.
    #[must_use]
    pub const fn peer(&self) -> Option<Outcome> {
        self.peer
    }

    /// Returns `true` once the relay reported the peer gone.
    #[must_use]
    pub const fn peer_disconnected(&self) -> bool {
        self.peer_disconnected
    }

    /// Captures the local outcome.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidRequestKind::OutcomeAlreadyReported`] if an outcome was already
    /// captured, whether reported locally, mirrored or aborted.
    pub fn report_local(&mut self, outcome: Outcome, now: Tick) -> Result<(), InvalidRequestKind> {
        if let Some(captured) = self.local {
            return Err(InvalidRequestKind::OutcomeAlreadyReported { captured });
        }
        tracing::info!(%outcome, tick = %now, "local outcome captured");
        self.set_local(outcome, now);
        Ok(())
    }

    /// Captures `Aborted` unless an outcome is already known. Returns `true` if it did.
    pub fn abort(&mut self, now: Tick) -> bool {
        if self.local.is_some() {
            return false;
        }
        self.set_local(Outcome::Aborted, now);
        true
    }

    /// Handles the peer's `duel_end`.
    pub fn on_peer_end(&mut self, peer: Outcome, now: Tick) -> PeerEndEffect {
        if self.peer.is_some() {
            return PeerEndEffect::Duplicate;
        }
        self.peer = Some(peer);

        let Some(local) = self.local else {
            let mirrored = peer.mirrored();
            self.set_local(mirrored, now);
            return PeerEndEffect::Mirrored(mirrored);
        };
        if local == peer.mirrored() {
            return PeerEndEffect::Consistent;
        }

        let settled = arbitrate_outcome(self.role, local, peer);
        if settled == local {
            PeerEndEffect::HostKept { peer }
        } else {
            self.local = Some(settled);
            // The corrected outcome goes out again.
            self.end_sent = false;
            PeerEndEffect::Overridden {
                previous: local,
                adopted: settled,
            }
        }
    }

    /// Handles `duel_opponent_disconnected`.
    pub fn on_peer_disconnected(&mut self, now: Tick) -> DisconnectEffect {
        self.peer_disconnected = true;
        match self.local {
            Some(outcome) => DisconnectEffect::Stands(outcome),
            None => {
                self.set_local(Outcome::Aborted, now);
                DisconnectEffect::Aborted
            },
        }
    }

    /// Returns `true` once the local outcome is known and the peer either reported its own or
    /// went away.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        self.local.is_some() && (self.peer.is_some() || self.peer_disconnected)
    }

    /// Returns `true` once `linger` ticks have passed since the local outcome was captured.
    #[must_use]
    pub fn linger_expired(&self, now: Tick, linger: u64) -> bool {
        self.local_at.is_some_and(|at| now.since(at) >= linger)
    }

    /// Returns the `duel_end` to send, once per captured (or corrected) outcome.
    pub fn take_end_message(&mut self) -> Option<Message> {
        if self.end_sent {
            return None;
        }
        let outcome = self.local?;
        self.end_sent = true;
        Some(Message::DuelEnd { outcome })
    }

    fn set_local(&mut self, outcome: Outcome, now: Tick) {
        self.local = Some(outcome);
        self.local_at = Some(now);
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

    #[test]
    fn local_outcome_is_captured_once() {
        let mut sync = OutcomeSynchronizer::new(Role::Host);
        sync.report_local(Outcome::Win, Tick::new(3)).unwrap();
        assert_eq!(
            sync.report_local(Outcome::Lose, Tick::new(4)),
            Err(InvalidRequestKind::OutcomeAlreadyReported {
                captured: Outcome::Win
            })
        );
        assert_eq!(sync.local(), Some(Outcome::Win));
        assert!(!sync.abort(Tick::new(5)));
    }

    #[test]
    fn end_message_is_sent_once() {
        let mut sync = OutcomeSynchronizer::new(Role::Host);
        assert!(sync.take_end_message().is_none());
        sync.report_local(Outcome::Draw, Tick::new(1)).unwrap();
        assert_eq!(
            sync.take_end_message(),
            Some(Message::DuelEnd {
                outcome: Outcome::Draw
            })
        );
        assert!(sync.take_end_message().is_none());
    }

    #[test]
    fn consistent_outcomes_settle() {
        let mut sync = OutcomeSynchronizer::new(Role::Host);
        sync.report_local(Outcome::Win, Tick::new(1)).unwrap();
        assert!(!sync.is_settled());
        assert_eq!(
            sync.on_peer_end(Outcome::Lose, Tick::new(2)),
            PeerEndEffect::Consistent
        );
        assert!(sync.is_settled());
        assert_eq!(
            sync.on_peer_end(Outcome::Lose, Tick::new(3)),
            PeerEndEffect::Duplicate
        );
    }

    #[test]
    fn guest_adopts_host_view_and_resends() {
        let mut sync = OutcomeSynchronizer::new(Role::Guest);
        sync.report_local(Outcome::Win, Tick::new(1)).unwrap();
        let _ = sync.take_end_message();
        assert_eq!(
            sync.on_peer_end(Outcome::Win, Tick::new(2)),
            PeerEndEffect::Overridden {
                previous: Outcome::Win,
                adopted: Outcome::Lose,
            }
        );
        assert_eq!(
            sync.take_end_message(),
            Some(Message::DuelEnd {
                outcome: Outcome::Lose
            })
        );
    }

    #[test]
    fn host_keeps_its_view() {
        let mut sync = OutcomeSynchronizer::new(Role::Host);
        sync.report_local(Outcome::Win, Tick::new(1)).unwrap();
        assert_eq!(
            sync.on_peer_end(Outcome::Win, Tick::new(2)),
            PeerEndEffect::HostKept {
                peer: Outcome::Win
            }
        );
        assert_eq!(sync.local(), Some(Outcome::Win));
    }

    #[test]
    fn disconnect_aborts_only_without_an_outcome() {
        let mut first = OutcomeSynchronizer::new(Role::Host);
        assert_eq!(
            first.on_peer_disconnected(Tick::new(9)),
            DisconnectEffect::Aborted
        );
        assert_eq!(first.local(), Some(Outcome::Aborted));
        assert!(first.is_settled());

        let mut second = OutcomeSynchronizer::new(Role::Host);
        second.report_local(Outcome::Lose, Tick::new(1)).unwrap();
        assert_eq!(
            second.on_peer_disconnected(Tick::new(9)),
            DisconnectEffect::Stands(Outcome::Lose)
        );
    }

    #[test]
    fn linger_counts_from_capture() {
        let mut sync = OutcomeSynchronizer::new(Role::Guest);
        assert!(!sync.linger_expired(Tick::new(100), 0));
        sync.report_local(Outcome::Lose, Tick::new(10)).unwrap();
        assert!(!sync.linger_expired(Tick::new(69), 60));
        assert!(sync.linger_expired(Tick::new(70), 60));
    }
}
