//! Per-session counters.

use crate::Tick;

/// The `LinkStats` struct contains counters about the current session.
///
/// Returned by [`LinkController::stats`](crate::LinkController::stats).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use = "LinkStats should be inspected or used after being queried"]
pub struct LinkStats {
    /// Messages handed to the transport.
    pub messages_sent: u64,
    /// Messages received from the transport, including discarded ones.
    pub messages_received: u64,
    /// Local buffers captured from the simulation.
    pub buffers_captured: u64,
    /// Peer buffers injected into the simulation.
    pub buffers_injected: u64,
    /// Buffer sends beyond the first for the same sequence number.
    pub retransmissions: u64,
    /// Peer messages dropped because their effect had already been applied.
    pub duplicates_discarded: u64,
    /// Peer buffers dropped because the slot was still unblocked.
    pub stale_discarded: u64,
    /// Peer messages dropped for any other reason.
    pub other_discarded: u64,
    /// Forfeit commands injected during forced termination.
    pub forfeit_injections: u64,
    /// Liveness pings sent.
    pub pings_sent: u64,
    /// Round trip of the most recent answered ping, in ticks.
    pub last_ping_rtt: Option<u64>,
    /// Tick at which the session became active.
    pub active_since: Option<Tick>,
}

impl LinkStats {
    /// Creates a new `LinkStats` instance with every counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total peer messages discarded for any reason.
    #[must_use]
    pub const fn total_discarded(&self) -> u64 {
        self.duplicates_discarded
            .saturating_add(self.stale_discarded)
            .saturating_add(self.other_discarded)
    }
}

impl std::fmt::Display for LinkStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            messages_sent,
            messages_received,
            buffers_captured,
            buffers_injected,
            retransmissions,
            duplicates_discarded,
            stale_discarded,
            other_discarded,
            forfeit_injections,
            pings_sent,
            last_ping_rtt,
            active_since,
        } = self;

        write!(
            f,
            "sent={messages_sent} received={messages_received} captured={buffers_captured} \
             injected={buffers_injected} retransmitted={retransmissions} \
             discarded={duplicates_discarded}/{stale_discarded}/{other_discarded} \
             forfeits={forfeit_injections} pings={pings_sent}"
        )?;
        if let Some(rtt) = last_ping_rtt {
            write!(f, " rtt={rtt}")?;
        }
        if let Some(tick) = active_since {
            write!(f, " active_since={tick}")?;
        }
        Ok(())
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
    fn new_stats_are_zero() {
        let stats = LinkStats::new();
        assert_eq!(stats.total_discarded(), 0);
        assert_eq!(stats.last_ping_rtt, None);
    }

    #[test]
    fn display_includes_optional_fields_when_known() {
        let stats = LinkStats {
            duplicates_discarded: 2,
            stale_discarded: 1,
            last_ping_rtt: Some(4),
            active_since: Some(Tick::new(12)),
            ..LinkStats::default()
        };
        let text = stats.to_string();
        assert!(text.contains("discarded=2/1/0"));
        assert!(text.contains("rtt=4"));
        assert!(text.contains("active_since=12"));
        assert_eq!(stats.total_discarded(), 3);
    }
}
