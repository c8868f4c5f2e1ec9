//! Stall detection and forced termination.
//!
//! A threshold of `T` ticks measured from the last activity at tick `last` fires at tick
//! `last + T + 1` and never earlier. Once fired, the controller starts a [`ForcedTermination`]
//! that injects a forfeit into the simulation every tick for a fixed number of ticks. The
//! safety timeout is a hard bound instead: a session that started ending at `start` is closed
//! no later than `start + safety`.

use smallvec::SmallVec;

use crate::link::session::Phase;
use crate::sessions::config::LinkTimings;
use crate::{BattlerSlot, SimulationMemory, TerminationCause, Tick};

/// Which stall threshold fired.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum StallKind {
    /// The handshake did not complete in time.
    Handshake,
    /// No command buffer progress while active.
    Relay,
    /// No inbound traffic of any kind.
    Liveness,
}

impl StallKind {
    /// The termination cause this stall leads to.
    #[must_use]
    pub const fn cause(self) -> TerminationCause {
        match self {
            StallKind::Handshake => TerminationCause::HandshakeTimeout,
            StallKind::Relay => TerminationCause::RelayStall,
            StallKind::Liveness => TerminationCause::LivenessLoss,
        }
    }

    /// Returns a string representation suitable for logging.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            StallKind::Handshake => "handshake",
            StallKind::Relay => "relay",
            StallKind::Liveness => "liveness",
        }
    }
}

impl std::fmt::Display for StallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns `true` if a threshold of `threshold` ticks, last reset at `last`, has fired by `now`.
///
/// ```
/// use duel_link::link::stall::stall_fires;
/// use duel_link::Tick;
///
/// assert!(!stall_fires(Tick::new(10), Tick::new(15), 5));
/// assert!(stall_fires(Tick::new(10), Tick::new(16), 5));
/// ```
#[must_use]
pub const fn stall_fires(last: Tick, now: Tick, threshold: u64) -> bool {
    now.since(last) > threshold
}

/// Last-activity ticks for one session.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LivenessRecord {
    /// Last captured, injected or acknowledged buffer (or activation).
    pub last_relay_progress: Tick,
    /// Last inbound message of any kind (or session start).
    pub last_inbound: Tick,
    /// Last ping we sent.
    pub last_ping_sent: Tick,
}

impl LivenessRecord {
    /// Creates a record with every timestamp at `now`.
    #[must_use]
    pub const fn new(now: Tick) -> Self {
        Self {
            last_relay_progress: now,
            last_inbound: now,
            last_ping_sent: now,
        }
    }
}

/// Evaluates the stall thresholds every tick.
#[derive(Debug, Clone)]
pub struct StallMonitor {
    record: LivenessRecord,
    relay_timeout: u64,
    liveness_timeout: u64,
    ping_interval: u64,
    next_nonce: u32,
}

impl StallMonitor {
    /// Creates a monitor whose record starts at `now`.
    #[must_use]
    pub fn new(timings: &LinkTimings, now: Tick) -> Self {
        Self {
            record: LivenessRecord::new(now),
            relay_timeout: timings.relay_timeout,
            liveness_timeout: timings.liveness_timeout,
            ping_interval: timings.ping_interval,
            next_nonce: 1,
        }
    }

    /// The current record.
    #[must_use]
    pub const fn record(&self) -> &LivenessRecord {
        &self.record
    }

    /// Notes buffer progress in either direction.
    pub fn note_progress(&mut self, now: Tick) {
        self.record.last_relay_progress = self.record.last_relay_progress.max(now);
    }

    /// Notes an inbound message.
    pub fn note_inbound(&mut self, now: Tick) {
        self.record.last_inbound = self.record.last_inbound.max(now);
    }

    /// Resets both clocks. Called when the session becomes active so handshake time does not
    /// count against the relay.
    pub fn restart(&mut self, now: Tick) {
        self.record.last_relay_progress = now;
        self.record.last_inbound = self.record.last_inbound.max(now);
        self.record.last_ping_sent = now;
    }

    /// Checks the thresholds that apply to `phase`. Returns the fired kind and the idle ticks.
    ///
    /// Only an active session is monitored here; the handshake window is owned by the
    /// handshake coordinator and an ending session is bounded by its safety timeout.
    #[must_use]
    pub fn check(&self, phase: Phase, now: Tick) -> Option<(StallKind, u64)> {
        if phase != Phase::Active {
            return None;
        }
        if stall_fires(self.record.last_inbound, now, self.liveness_timeout) {
            return Some((StallKind::Liveness, now.since(self.record.last_inbound)));
        }
        if stall_fires(self.record.last_relay_progress, now, self.relay_timeout) {
            return Some((StallKind::Relay, now.since(self.record.last_relay_progress)));
        }
        None
    }

    /// Returns a nonce to ping with if a ping is due at `now`.
    pub fn ping_due(&mut self, now: Tick) -> Option<u32> {
        if now.since(self.record.last_ping_sent) < self.ping_interval {
            return None;
        }
        self.record.last_ping_sent = now;
        let nonce = self.next_nonce;
        self.next_nonce = self.next_nonce.wrapping_add(1);
        Some(nonce)
    }
}

/// Drives an ending session: the forfeit loop that pushes the simulation to its match-end
/// pathway, and the safety deadline. A termination with no slots to forfeit only tracks the
/// deadline.
#[derive(Debug, Clone)]
pub struct ForcedTermination {
    cause: TerminationCause,
    started_at: Tick,
    slots: SmallVec<[BattlerSlot; 2]>,
    remaining: u64,
    injections: u64,
}

impl ForcedTermination {
    /// Starts forced termination at `now`, forfeiting `slots` for `repeat` ticks.
    #[must_use]
    pub fn start(cause: TerminationCause, slots: &[BattlerSlot], repeat: u64, now: Tick) -> Self {
        tracing::debug!(%cause, tick = %now, repeat, slots = slots.len(), "termination driver started");
        Self {
            cause,
            started_at: now,
            slots: slots.iter().copied().collect(),
            remaining: repeat,
            injections: 0,
        }
    }

    /// Why termination was forced.
    #[must_use]
    pub const fn cause(&self) -> TerminationCause {
        self.cause
    }

    /// Tick at which termination started.
    #[must_use]
    pub const fn started_at(&self) -> Tick {
        self.started_at
    }

    /// Total forfeit commands injected so far.
    #[must_use]
    pub const fn injections(&self) -> u64 {
        self.injections
    }

    /// Returns `true` once every forfeit repetition has been injected.
    #[must_use]
    pub const fn is_drained(&self) -> bool {
        self.remaining == 0
    }

    /// Injects this tick's forfeits. Returns the number of commands injected.
    pub fn inject<S: SimulationMemory + ?Sized>(&mut self, sim: &mut S) -> u64 {
        if self.remaining == 0 {
            return 0;
        }
        self.remaining -= 1;
        for slot in &self.slots {
            sim.inject_forfeit(*slot);
        }
        let injected = self.slots.len() as u64;
        self.injections = self.injections.saturating_add(injected);
        injected
    }

    /// Returns `true` once `safety_timeout` ticks have passed since the start. The session must
    /// be closed on that tick at the latest.
    #[must_use]
    pub const fn safety_expired(&self, now: Tick, safety_timeout: u64) -> bool {
        now.since(self.started_at) >= safety_timeout
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
    use crate::sessions::config::LinkConfig;
    use crate::{Outcome, PlayerIdentity, TurnContext};

    fn monitor() -> StallMonitor {
        let mut timings = LinkConfig::default().timings();
        timings.relay_timeout = 10;
        timings.liveness_timeout = 20;
        timings.ping_interval = 4;
        StallMonitor::new(&timings, Tick::ZERO)
    }

    #[test]
    fn relay_stall_fires_one_tick_after_threshold() {
        let mut monitor = monitor();
        monitor.note_inbound(Tick::new(10));
        assert_eq!(monitor.check(Phase::Active, Tick::new(10)), None);
        assert_eq!(
            monitor.check(Phase::Active, Tick::new(11)),
            Some((StallKind::Relay, 11))
        );
    }

    #[test]
    fn liveness_takes_precedence() {
        let monitor = monitor();
        assert_eq!(
            monitor.check(Phase::Active, Tick::new(21)),
            Some((StallKind::Liveness, 21))
        );
    }

    #[test]
    fn only_active_sessions_are_checked() {
        let monitor = monitor();
        for phase in [Phase::Handshake, Phase::Ending, Phase::Closed] {
            assert_eq!(monitor.check(phase, Tick::new(1000)), None);
        }
    }

    #[test]
    fn progress_resets_the_relay_clock() {
        let mut monitor = monitor();
        monitor.note_progress(Tick::new(8));
        monitor.note_inbound(Tick::new(8));
        assert_eq!(monitor.check(Phase::Active, Tick::new(18)), None);
        assert!(monitor.check(Phase::Active, Tick::new(19)).is_some());
    }

    #[test]
    fn pings_follow_the_interval() {
        let mut monitor = monitor();
        assert_eq!(monitor.ping_due(Tick::new(3)), None);
        assert_eq!(monitor.ping_due(Tick::new(4)), Some(1));
        assert_eq!(monitor.ping_due(Tick::new(5)), None);
        assert_eq!(monitor.ping_due(Tick::new(8)), Some(2));
    }

    #[derive(Default)]
    struct ForfeitSim {
        forfeits: Vec<BattlerSlot>,
    }

    impl SimulationMemory for ForfeitSim {
        fn read_outgoing_buffer(&self, _slot: BattlerSlot) -> Option<Vec<u8>> {
            None
        }
        fn write_incoming_buffer(&mut self, _slot: BattlerSlot, _bytes: &[u8]) {}
        fn read_generation(&self, _slot: BattlerSlot) -> u32 {
            0
        }
        fn read_turn_context(&self) -> TurnContext {
            TurnContext::default()
        }
        fn write_turn_context(&mut self, _context: &TurnContext) {}
        fn is_pipeline_unblocked(&self, _slot: BattlerSlot) -> bool {
            false
        }
        fn unblock_pipeline(&mut self, _slot: BattlerSlot) {}
        fn read_match_outcome(&self) -> Option<Outcome> {
            None
        }
        fn inject_forfeit(&mut self, slot: BattlerSlot) {
            self.forfeits.push(slot);
        }
        fn read_rng_seed(&self) -> u32 {
            0
        }
        fn write_rng_seed(&mut self, _seed: u32) {}
        fn write_peer_roster(&mut self, _roster: &[u8], _identity: &PlayerIdentity) {}
    }

    #[test]
    fn forfeits_repeat_for_the_window_then_stop() {
        let mut sim = ForfeitSim::default();
        let slots = [BattlerSlot::new(0), BattlerSlot::new(2)];
        let mut forced = ForcedTermination::start(TerminationCause::RelayStall, &slots, 3, Tick::new(5));
        for _ in 0..5 {
            forced.inject(&mut sim);
        }
        assert_eq!(sim.forfeits.len(), 6);
        assert_eq!(forced.injections(), 6);
        assert!(forced.is_drained());
        assert_eq!(forced.cause(), TerminationCause::RelayStall);
    }

    #[test]
    fn safety_timeout_is_measured_from_start() {
        let forced = ForcedTermination::start(TerminationCause::LivenessLoss, &[], 1, Tick::new(100));
        assert!(!forced.safety_expired(Tick::new(159), 60));
        assert!(forced.safety_expired(Tick::new(160), 60));
        assert!(forced.safety_expired(Tick::new(161), 60));
        assert_eq!(forced.started_at(), Tick::new(100));
    }

    #[test]
    fn stall_kinds_map_to_causes() {
        assert_eq!(StallKind::Handshake.cause(), TerminationCause::HandshakeTimeout);
        assert_eq!(StallKind::Relay.cause(), TerminationCause::RelayStall);
        assert_eq!(StallKind::Liveness.cause(), TerminationCause::LivenessLoss);
    }
}
