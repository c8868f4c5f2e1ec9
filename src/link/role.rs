//! Static host/guest assignment and host-wins outcome arbitration.

use crate::Outcome;

/// Which side of the link this peer plays.
///
/// The host is authoritative for the shared seed, for turn context and for the final outcome
/// when the two peers disagree. Roles are fixed before the handshake and never renegotiated.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Role {
    /// The initiating peer.
    Host,
    /// The accepting peer.
    Guest,
}

impl Role {
    /// Returns `true` for [`Role::Host`].
    #[must_use]
    pub const fn is_host(self) -> bool {
        matches!(self, Role::Host)
    }

    /// Returns `true` for [`Role::Guest`].
    #[must_use]
    pub const fn is_guest(self) -> bool {
        matches!(self, Role::Guest)
    }

    /// Returns the role the peer plays.
    #[must_use]
    pub const fn opposite(self) -> Role {
        match self {
            Role::Host => Role::Guest,
            Role::Guest => Role::Host,
        }
    }

    /// Returns a string representation suitable for logging.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Guest => "guest",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Assigns the role for a session. The initiator hosts.
///
/// ```
/// use duel_link::{assign_role, Role};
///
/// assert_eq!(assign_role(true), Role::Host);
/// assert_eq!(assign_role(false), Role::Guest);
/// ```
#[must_use]
pub const fn assign_role(is_initiator: bool) -> Role {
    if is_initiator {
        Role::Host
    } else {
        Role::Guest
    }
}

/// Settles the local outcome once both peers have reported.
///
/// `peer` is the outcome as the peer reported it, from the peer's perspective. When the two
/// reports agree (`local == peer.mirrored()`) the local outcome is returned unchanged. When
/// they disagree the host's view wins: a host keeps its own outcome and a guest adopts the
/// mirror of the host's.
///
/// ```
/// use duel_link::{arbitrate_outcome, Outcome, Role};
///
/// // Agreement
/// assert_eq!(arbitrate_outcome(Role::Guest, Outcome::Lose, Outcome::Win), Outcome::Lose);
/// // Both claim the win: the host's claim stands on both sides
/// assert_eq!(arbitrate_outcome(Role::Host, Outcome::Win, Outcome::Win), Outcome::Win);
/// assert_eq!(arbitrate_outcome(Role::Guest, Outcome::Win, Outcome::Win), Outcome::Lose);
/// ```
#[must_use]
pub const fn arbitrate_outcome(role: Role, local: Outcome, peer: Outcome) -> Outcome {
    match role {
        Role::Host => local,
        Role::Guest => peer.mirrored(),
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

    const ALL: [Outcome; 4] = [Outcome::Win, Outcome::Lose, Outcome::Draw, Outcome::Aborted];

    #[test]
    fn roles_are_opposites() {
        assert_eq!(Role::Host.opposite(), Role::Guest);
        assert_eq!(Role::Guest.opposite(), Role::Host);
        assert!(assign_role(true).is_host());
        assert!(assign_role(false).is_guest());
    }

    #[test]
    fn agreement_never_changes_local_outcome() {
        for role in [Role::Host, Role::Guest] {
            for local in ALL {
                assert_eq!(arbitrate_outcome(role, local, local.mirrored()), local);
            }
        }
    }

    #[test]
    fn both_sides_converge_on_host_view() {
        for host_local in ALL {
            for guest_local in ALL {
                let host_final = arbitrate_outcome(Role::Host, host_local, guest_local);
                let guest_final = arbitrate_outcome(Role::Guest, guest_local, host_local);
                assert_eq!(host_final, host_local);
                assert_eq!(guest_final, host_final.mirrored());
            }
        }
    }
}
