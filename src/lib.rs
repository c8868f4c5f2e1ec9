//! # Duel Link
//!
//! Duel Link lets two independently running instances of a turn-based battle simulation play
//! against each other as if they were joined by a physical link cable. Each instance keeps its
//! own private copy of the match state; the two only exchange discrete messages through a relay.
//!
//! The crate implements the link synchronization controller that keeps both simulations in
//! lockstep:
//!
//! - a three-phase handshake (EXCHANGE, READY, GO) that exchanges rosters, identities and the
//!   shared randomness seed before any turn traffic flows,
//! - a command buffer relay that ships each locally produced buffer to the peer and injects
//!   the peer's buffers into the local simulation exactly once,
//! - a static host/guest role assignment that makes the host authoritative for turn context,
//!   seed and ambiguous outcomes,
//! - a stall monitor that forces termination when the relay or the peer goes silent,
//! - an outcome synchronizer that mirrors the peer's result and tears the session down.
//!
//! The controller is driven by an explicit [`LinkController::tick`] call once per simulation
//! step. It never blocks: the transport is drained without waiting and every wait is bounded by
//! a deadline measured in ticks.
//!
//! ```
//! use duel_link::{MemoryRelay, PlayerIdentity, SessionBuilder, BattlerSlot};
//!
//! let relay = MemoryRelay::new();
//! let controller = SessionBuilder::new()
//!     .with_local_peer("red")
//!     .with_remote_peer("blue")
//!     .as_initiator(true)
//!     .with_roster(vec![1, 2, 3])
//!     .with_identity(PlayerIdentity::new("RED", 12345))
//!     .with_local_slots(&[BattlerSlot::new(0)])
//!     .with_remote_slots(&[BattlerSlot::new(1)])
//!     .start_session(relay.connect("red"))
//!     .expect("valid session");
//!
//! assert!(controller.role().is_host());
//! ```

#![forbid(unsafe_code)] // let us try
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub use error::{InvalidRequestKind, LinkError};
pub use link::controller::LinkController;
pub use link::handshake::{HandshakeFlag, HandshakeState};
pub use link::outcome::OutcomeSynchronizer;
pub use link::relay::{CommandBuffer, SequenceLog, SequenceVerdict};
pub use link::role::{arbitrate_outcome, assign_role, Role};
pub use link::session::{DuelSession, Phase};
pub use link::slot_map::SlotMap;
pub use link::stall::{LivenessRecord, StallKind};
pub use network::chaos_transport::{ChaosConfig, ChaosTransport};
pub use network::memory_relay::{MemoryRelay, MemoryRelayEndpoint};
pub use network::messages::{Message, PlayerIdentity, StageMarker, StageTag, TurnContext};
pub use network::stream_transport::StreamTransport;
pub use sessions::builder::SessionBuilder;
pub use sessions::config::LinkConfig;
pub use sessions::event_drain::EventDrain;
pub use sessions::link_stats::LinkStats;

pub mod error;
pub mod prelude;
pub mod rng;
pub mod telemetry;

/// The link synchronization controller and its components.
pub mod link {
    pub mod controller;
    pub mod handshake;
    pub mod outcome;
    pub mod relay;
    pub mod role;
    pub mod session;
    pub mod slot_map;
    pub mod stall;
}

/// Wire schema, codec and transport implementations.
pub mod network {
    pub mod chaos_transport;
    pub mod codec;
    pub mod memory_relay;
    pub mod messages;
    pub mod stream_transport;
}

/// Session construction, configuration and introspection.
pub mod sessions {
    pub mod builder;
    pub mod config;
    pub mod event_drain;
    pub mod link_stats;
}

// #############
// # CONSTANTS #
// #############

/// Highest number of battler slots a simulation may expose.
///
/// Absentee masks are carried as a `u8`, so every slot index must fit in one bit of it.
pub const MAX_BATTLER_SLOTS: u8 = 8;

// #############
// #   TYPES   #
// #############

/// A tick is one invocation of [`LinkController::tick`].
///
/// Ticks are the only unit of time the controller knows about. Every deadline (handshake,
/// relay stall, liveness, forfeit repetition, safety timeout) is converted from a
/// [`Duration`](web_time::Duration) into ticks once, using [`LinkConfig::tick_rate`].
///
/// # Examples
///
/// ```
/// use duel_link::Tick;
///
/// let start = Tick::new(10);
/// let later = start + 5;
/// assert_eq!(later.since(start), 5);
/// assert_eq!(start.since(later), 0);
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Tick(u64);

impl Tick {
    /// The tick at which a session is created.
    pub const ZERO: Tick = Tick(0);

    /// Creates a new `Tick` from a raw counter value.
    #[inline]
    #[must_use]
    pub const fn new(tick: u64) -> Self {
        Tick(tick)
    }

    /// Returns the underlying counter value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the tick immediately after this one.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Tick {
        Tick(self.0.saturating_add(1))
    }

    /// Returns how many ticks have passed since `earlier`, or 0 if `earlier` is in the future.
    #[inline]
    #[must_use]
    pub const fn since(self, earlier: Tick) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl std::fmt::Display for Tick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Add<u64> for Tick {
    type Output = Tick;

    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Tick(self.0.saturating_add(rhs))
    }
}

/// Identifies one simulation actor (battler) inside a simulation instance.
///
/// Slots are numbered from each simulation's own point of view: both peers usually consider
/// their own battler to be slot 0. The [`SlotMap`] translates between the two numberings.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct BattlerSlot(u8);

impl BattlerSlot {
    /// Creates a new `BattlerSlot`.
    ///
    /// Note: This does not validate the slot. Use [`BattlerSlot::is_valid`] to check that
    /// it fits in an absentee mask.
    #[inline]
    #[must_use]
    pub const fn new(slot: u8) -> Self {
        BattlerSlot(slot)
    }

    /// Returns the underlying slot index.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    /// Returns `true` if the slot is below [`MAX_BATTLER_SLOTS`].
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 < MAX_BATTLER_SLOTS
    }

    /// Returns the bit this slot occupies in an absentee mask, or `None` for invalid slots.
    #[inline]
    #[must_use]
    pub const fn mask_bit(self) -> Option<u8> {
        if self.is_valid() {
            Some(1 << self.0)
        } else {
            None
        }
    }
}

impl std::fmt::Display for BattlerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for BattlerSlot {
    #[inline]
    fn from(value: u8) -> Self {
        BattlerSlot(value)
    }
}

/// Opaque identity of a session participant, as known to the relay.
///
/// Stable for the lifetime of a session.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Creates a new `PeerId`.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    /// Returns the identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        PeerId(value.to_owned())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        PeerId(value)
    }
}

// #############
// #   ENUMS   #
// #############

/// Result of a match, always expressed from the perspective of the peer reporting it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The reporting peer won.
    Win,
    /// The reporting peer lost.
    Lose,
    /// Neither side won.
    Draw,
    /// The match did not finish normally (timeout, disconnect, handshake failure).
    Aborted,
}

impl Outcome {
    /// Returns the outcome as seen from the other peer.
    ///
    /// Mirroring is an involution: `outcome.mirrored().mirrored() == outcome`.
    ///
    /// ```
    /// use duel_link::Outcome;
    ///
    /// assert_eq!(Outcome::Win.mirrored(), Outcome::Lose);
    /// assert_eq!(Outcome::Lose.mirrored(), Outcome::Win);
    /// assert_eq!(Outcome::Draw.mirrored(), Outcome::Draw);
    /// assert_eq!(Outcome::Aborted.mirrored(), Outcome::Aborted);
    /// ```
    #[inline]
    #[must_use]
    pub const fn mirrored(self) -> Outcome {
        match self {
            Outcome::Win => Outcome::Lose,
            Outcome::Lose => Outcome::Win,
            Outcome::Draw => Outcome::Draw,
            Outcome::Aborted => Outcome::Aborted,
        }
    }

    /// Returns `true` for outcomes that decide the match (`Win`, `Lose`, `Draw`).
    #[inline]
    #[must_use]
    pub const fn is_substantive(self) -> bool {
        !matches!(self, Outcome::Aborted)
    }

    /// Returns a string representation suitable for logging.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Outcome::Win => "win",
            Outcome::Lose => "lose",
            Outcome::Draw => "draw",
            Outcome::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session left the `Active` phase (or never reached it).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TerminationCause {
    /// The local simulation finished the match on its own.
    LocalOutcome,
    /// The peer reported the end of the match first.
    PeerOutcome,
    /// The relay told us the peer is gone.
    PeerDisconnected,
    /// The peer did not complete EXCHANGE/READY within the handshake window.
    HandshakeTimeout,
    /// The peer's identity record did not match the local slot layout.
    HandshakeRejected,
    /// No command buffer progress within the relay timeout.
    RelayStall,
    /// No traffic of any kind from the peer within the liveness timeout.
    LivenessLoss,
    /// Forced termination did not finish before the safety timeout. Only reported on close.
    SafetyTimeout,
}

impl TerminationCause {
    /// Returns `true` if the cause came from a timeout or stall rather than an outcome.
    #[must_use]
    pub const fn is_stall(self) -> bool {
        matches!(
            self,
            TerminationCause::HandshakeTimeout
                | TerminationCause::RelayStall
                | TerminationCause::LivenessLoss
                | TerminationCause::SafetyTimeout
        )
    }

    /// Returns a string representation suitable for logging.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            TerminationCause::LocalOutcome => "local_outcome",
            TerminationCause::PeerOutcome => "peer_outcome",
            TerminationCause::PeerDisconnected => "peer_disconnected",
            TerminationCause::HandshakeTimeout => "handshake_timeout",
            TerminationCause::HandshakeRejected => "handshake_rejected",
            TerminationCause::RelayStall => "relay_stall",
            TerminationCause::LivenessLoss => "liveness_loss",
            TerminationCause::SafetyTimeout => "safety_timeout",
        }
    }
}

impl std::fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an inbound message was dropped without effect. None of these are errors.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DiscardReason {
    /// The message's effect has already been applied.
    DuplicateMessage,
    /// A buffer arrived for a slot whose pipeline is already unblocked.
    StaleBufferDelivery,
    /// A buffer named a slot outside the negotiated layout.
    UnknownSlot,
    /// The message came from a peer other than the session's opponent.
    WrongPeer,
    /// A guest sent a buffer carrying turn context.
    UnexpectedContext,
    /// The message is not valid in the current phase.
    NotActive,
    /// The buffer exceeds the configured maximum length.
    OversizedBuffer,
    /// A buffer message only the other role may send: a `duel_buffer_cmd` from a guest or a
    /// `duel_buffer_resp` from a host.
    WrongDirection,
}

impl DiscardReason {
    /// Returns a string representation suitable for logging.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            DiscardReason::DuplicateMessage => "duplicate_message",
            DiscardReason::StaleBufferDelivery => "stale_buffer_delivery",
            DiscardReason::UnknownSlot => "unknown_slot",
            DiscardReason::WrongPeer => "wrong_peer",
            DiscardReason::UnexpectedContext => "unexpected_context",
            DiscardReason::NotActive => "not_active",
            DiscardReason::OversizedBuffer => "oversized_buffer",
            DiscardReason::WrongDirection => "wrong_direction",
        }
    }
}

impl std::fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notifications produced by a [`LinkController`]. Drain them with [`LinkController::events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The handshake made progress. `completed` counts the handshake steps done so far.
    HandshakeProgress {
        /// Handshake steps completed so far.
        completed: u32,
        /// Handshake steps required in total.
        total: u32,
    },
    /// Both peers exchanged rosters and readiness; buffers now flow.
    Active {
        /// The local role for this session.
        role: Role,
    },
    /// A peer buffer was written into the local simulation and its pipeline unblocked.
    BufferInjected {
        /// Local slot the buffer was injected into.
        slot: BattlerSlot,
        /// Sequence number of the buffer.
        seq: u32,
    },
    /// A peer message was dropped.
    MessageDiscarded {
        /// Wire name of the dropped message.
        kind: &'static str,
        /// Why it was dropped.
        reason: DiscardReason,
    },
    /// The peer advanced to a new stage.
    PeerStage {
        /// The stage the peer reported.
        stage: StageTag,
    },
    /// The stall monitor fired.
    StallDetected {
        /// Which threshold fired.
        kind: StallKind,
        /// Ticks since the last observed activity.
        idle_ticks: u64,
    },
    /// The session entered the `Ending` phase.
    TerminationStarted {
        /// Why the session is ending.
        cause: TerminationCause,
    },
    /// The local result of the match is known (or was overridden by the host).
    OutcomeDecided {
        /// The local outcome.
        outcome: Outcome,
    },
    /// The session reached `Closed`. No further events follow.
    Closed {
        /// The final local outcome.
        outcome: Outcome,
        /// Why the session ended. [`TerminationCause::SafetyTimeout`] if the safety timeout
        /// closed it before the simulation finished.
        cause: TerminationCause,
    },
}

// #############
// #  TRAITS   #
// #############

/// Read/write access to the battle simulation being linked.
///
/// The controller is the only writer, once per tick. Implementations wrap whatever backs the
/// simulation (emulator memory, an in-process engine, a test stub); the layout behind these
/// calls is not the controller's business.
///
/// Slots passed to these methods are always in the local simulation's numbering.
#[cfg(feature = "sync-send")]
pub trait SimulationMemory: Send + Sync {
    /// Returns the buffer the local simulation produced for `slot`, if any.
    fn read_outgoing_buffer(&self, slot: BattlerSlot) -> Option<Vec<u8>>;
    /// Writes a peer buffer into the inbound area for `slot`.
    fn write_incoming_buffer(&mut self, slot: BattlerSlot, bytes: &[u8]);
    /// Returns the generation marker for `slot`'s outgoing buffer. It changes every time the
    /// simulation produces a new buffer, even if the content repeats.
    fn read_generation(&self, slot: BattlerSlot) -> u32;
    /// Reads the current turn context (host side).
    fn read_turn_context(&self) -> TurnContext;
    /// Writes a turn context received from the host.
    fn write_turn_context(&mut self, context: &TurnContext);
    /// Returns `true` if `slot`'s command pipeline is currently unblocked.
    fn is_pipeline_unblocked(&self, slot: BattlerSlot) -> bool;
    /// Marks `slot`'s command pipeline unblocked so the simulation proceeds.
    fn unblock_pipeline(&mut self, slot: BattlerSlot);
    /// Returns the match outcome once the simulation has finished the match.
    fn read_match_outcome(&self) -> Option<Outcome>;
    /// Injects a synthetic forfeit/exit command for `slot`.
    fn inject_forfeit(&mut self, slot: BattlerSlot);
    /// Reads the simulation's randomness seed (host side).
    fn read_rng_seed(&self) -> u32;
    /// Writes the shared randomness seed received from the host.
    fn write_rng_seed(&mut self, seed: u32);
    /// Writes the opponent's roster and identity once the session is active.
    fn write_peer_roster(&mut self, roster: &[u8], identity: &PlayerIdentity);
}

/// Read/write access to the battle simulation being linked.
///
/// The controller is the only writer, once per tick. Implementations wrap whatever backs the
/// simulation (emulator memory, an in-process engine, a test stub); the layout behind these
/// calls is not the controller's business.
///
/// Slots passed to these methods are always in the local simulation's numbering.
#[cfg(not(feature = "sync-send"))]
pub trait SimulationMemory {
    /// Returns the buffer the local simulation produced for `slot`, if any.
    fn read_outgoing_buffer(&self, slot: BattlerSlot) -> Option<Vec<u8>>;
    /// Writes a peer buffer into the inbound area for `slot`.
    fn write_incoming_buffer(&mut self, slot: BattlerSlot, bytes: &[u8]);
    /// Returns the generation marker for `slot`'s outgoing buffer. It changes every time the
    /// simulation produces a new buffer, even if the content repeats.
    fn read_generation(&self, slot: BattlerSlot) -> u32;
    /// Reads the current turn context (host side).
    fn read_turn_context(&self) -> TurnContext;
    /// Writes a turn context received from the host.
    fn write_turn_context(&mut self, context: &TurnContext);
    /// Returns `true` if `slot`'s command pipeline is currently unblocked.
    fn is_pipeline_unblocked(&self, slot: BattlerSlot) -> bool;
    /// Marks `slot`'s command pipeline unblocked so the simulation proceeds.
    fn unblock_pipeline(&mut self, slot: BattlerSlot);
    /// Returns the match outcome once the simulation has finished the match.
    fn read_match_outcome(&self) -> Option<Outcome>;
    /// Injects a synthetic forfeit/exit command for `slot`.
    fn inject_forfeit(&mut self, slot: BattlerSlot);
    /// Reads the simulation's randomness seed (host side).
    fn read_rng_seed(&self) -> u32;
    /// Writes the shared randomness seed received from the host.
    fn write_rng_seed(&mut self, seed: u32);
    /// Writes the opponent's roster and identity once the session is active.
    fn write_peer_roster(&mut self, roster: &[u8], identity: &PlayerIdentity);
}

/// This [`RelayTransport`] trait is used to plug Duel Link into whatever relay connects the two
/// peers. Messages must be delivered in send order; delivery latency is unbounded.
/// Sending is fire-and-forget and receiving must never block.
#[cfg(feature = "sync-send")]
pub trait RelayTransport: Send + Sync {
    /// Takes a [`Message`] and sends it to the given peer.
    fn send_to(&mut self, msg: &Message, peer: &PeerId);

    /// This method should return all messages received since the last time this method was called.
    /// The pairs `(PeerId, Message)` indicate which peer each message came from.
    fn receive_all_messages(&mut self) -> Vec<(PeerId, Message)>;
}

/// This [`RelayTransport`] trait is used to plug Duel Link into whatever relay connects the two
/// peers. Messages must be delivered in send order; delivery latency is unbounded.
/// Sending is fire-and-forget and receiving must never block.
#[cfg(not(feature = "sync-send"))]
pub trait RelayTransport {
    /// Takes a [`Message`] and sends it to the given peer.
    fn send_to(&mut self, msg: &Message, peer: &PeerId);

    /// This method should return all messages received since the last time this method was called.
    /// The pairs `(PeerId, Message)` indicate which peer each message came from.
    fn receive_all_messages(&mut self) -> Vec<(PeerId, Message)>;
}

// ###################
// # UNIT TESTS      #
// ###################

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
    fn tick_since_saturates() {
        assert_eq!(Tick::new(3).since(Tick::new(7)), 0);
        assert_eq!(Tick::new(7).since(Tick::new(3)), 4);
    }

    #[test]
    fn tick_next_and_add() {
        assert_eq!(Tick::ZERO.next(), Tick::new(1));
        assert_eq!(Tick::new(u64::MAX).next(), Tick::new(u64::MAX));
        assert_eq!(Tick::new(5) + 10, Tick::new(15));
    }

    #[test]
    fn battler_slot_mask_bits() {
        assert_eq!(BattlerSlot::new(0).mask_bit(), Some(0b0000_0001));
        assert_eq!(BattlerSlot::new(3).mask_bit(), Some(0b0000_1000));
        assert_eq!(BattlerSlot::new(MAX_BATTLER_SLOTS).mask_bit(), None);
        assert!(!BattlerSlot::new(9).is_valid());
    }

    #[test]
    fn outcome_mirroring_is_an_involution() {
        for outcome in [Outcome::Win, Outcome::Lose, Outcome::Draw, Outcome::Aborted] {
            assert_eq!(outcome.mirrored().mirrored(), outcome);
        }
        assert!(!Outcome::Aborted.is_substantive());
        assert!(Outcome::Draw.is_substantive());
    }

    #[test]
    fn outcome_serializes_snake_case() {
        let json = serde_json::to_string(&Outcome::Aborted).unwrap();
        assert_eq!(json, r#""aborted""#);
    }

    #[test]
    fn peer_id_is_transparent_on_the_wire() {
        let peer = PeerId::new("blue");
        assert_eq!(serde_json::to_string(&peer).unwrap(), r#""blue""#);
        assert_eq!(peer.to_string(), "blue");
    }

    #[test]
    fn termination_cause_classifies_stalls() {
        assert!(TerminationCause::RelayStall.is_stall());
        assert!(TerminationCause::HandshakeTimeout.is_stall());
        assert!(!TerminationCause::PeerDisconnected.is_stall());
        assert!(!TerminationCause::LocalOutcome.is_stall());
    }
}
