//! Three-phase handshake: EXCHANGE, READY, GO.
//!
//! In EXCHANGE each peer sends its roster and identity once, and the host additionally sends the
//! shared seed. Once everything has been sent and the peer's records have arrived, the peer
//! sends `duel_ready` once. GO is reached when readiness has been both sent and received; only
//! then is the peer roster written into the simulation.
//!
//! Progress is tracked in a [`HandshakeState`] bitset whose bits are only ever set.

use crate::link::role::Role;
use crate::link::slot_map::{SlotMap, SlotMismatch};
use crate::network::messages::{Message, PlayerIdentity, SlotList};
use crate::{BattlerSlot, SimulationMemory, Tick};

/// One step of the handshake.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HandshakeFlag {
    /// Our roster went out.
    RosterSent = 1 << 0,
    /// Our identity went out.
    IdentitySent = 1 << 1,
    /// The host sent the seed, or the guest received it.
    SeedSettled = 1 << 2,
    /// Our `duel_ready` went out.
    ReadySent = 1 << 3,
    /// The peer's roster arrived.
    PeerRoster = 1 << 4,
    /// The peer's identity arrived and matched our slot layout.
    PeerIdentity = 1 << 5,
    /// The peer's `duel_ready` arrived.
    PeerReady = 1 << 6,
}

impl HandshakeFlag {
    /// Every flag, in the order they are usually set.
    pub const ALL: [HandshakeFlag; 7] = [
        HandshakeFlag::RosterSent,
        HandshakeFlag::IdentitySent,
        HandshakeFlag::SeedSettled,
        HandshakeFlag::ReadySent,
        HandshakeFlag::PeerRoster,
        HandshakeFlag::PeerIdentity,
        HandshakeFlag::PeerReady,
    ];

    const fn bit(self) -> u8 {
        self as u8
    }
}

/// Set of completed handshake steps.
///
/// ```
/// use duel_link::{HandshakeFlag, HandshakeState};
///
/// let mut state = HandshakeState::default();
/// assert!(state.insert(HandshakeFlag::RosterSent));
/// assert!(!state.insert(HandshakeFlag::RosterSent));
/// assert_eq!(state.completed(), 1);
/// assert!(!state.is_go());
/// ```
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct HandshakeState(u8);

impl HandshakeState {
    /// Number of steps in a complete handshake.
    pub const TOTAL: u32 = HandshakeFlag::ALL.len() as u32;

    /// Returns `true` if `flag` is set.
    #[must_use]
    pub const fn contains(self, flag: HandshakeFlag) -> bool {
        self.0 & flag.bit() != 0
    }

    /// Sets `flag`. Returns `true` if it was not set before.
    pub fn insert(&mut self, flag: HandshakeFlag) -> bool {
        let fresh = !self.contains(flag);
        self.0 |= flag.bit();
        fresh
    }

    /// Number of steps completed.
    #[must_use]
    pub const fn completed(self) -> u32 {
        self.0.count_ones()
    }

    /// Returns `true` once everything EXCHANGE requires has been sent and received.
    #[must_use]
    pub const fn is_exchange_complete(self) -> bool {
        self.contains(HandshakeFlag::RosterSent)
            && self.contains(HandshakeFlag::IdentitySent)
            && self.contains(HandshakeFlag::SeedSettled)
            && self.contains(HandshakeFlag::PeerRoster)
            && self.contains(HandshakeFlag::PeerIdentity)
    }

    /// Returns `true` once readiness has been both sent and received.
    #[must_use]
    pub const fn is_go(self) -> bool {
        self.contains(HandshakeFlag::ReadySent) && self.contains(HandshakeFlag::PeerReady)
    }
}

/// What a handshake message did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeInput {
    /// The message completed a step.
    Applied(HandshakeFlag),
    /// The step was already complete; the message had no effect.
    Duplicate,
    /// The peer's identity does not fit our slot layout.
    Rejected(SlotMismatch),
    /// The message is not valid for our role (a host received a seed).
    Unexpected,
}

/// Drives one side of the handshake.
#[derive(Debug, Clone)]
pub struct HandshakeCoordinator {
    role: Role,
    state: HandshakeState,
    local_roster: Vec<u8>,
    local_identity: PlayerIdentity,
    local_slots: SlotList,
    remote_slots: SlotList,
    peer_roster: Option<Vec<u8>>,
    peer_identity: Option<PlayerIdentity>,
    slot_map: Option<SlotMap>,
    started_at: Tick,
}

impl HandshakeCoordinator {
    /// Starts a handshake at `now`. Nothing is sent until the first [`poll`](Self::poll).
    #[must_use]
    pub fn begin(
        role: Role,
        local_roster: Vec<u8>,
        local_identity: PlayerIdentity,
        local_slots: &[BattlerSlot],
        remote_slots: &[BattlerSlot],
        now: Tick,
    ) -> Self {
        tracing::debug!(%role, tick = %now, "handshake started");
        Self {
            role,
            state: HandshakeState::default(),
            local_roster,
            local_identity,
            local_slots: local_slots.iter().copied().collect(),
            remote_slots: remote_slots.iter().copied().collect(),
            peer_roster: None,
            peer_identity: None,
            slot_map: None,
            started_at: now,
        }
    }

    /// Current progress.
    #[must_use]
    pub const fn state(&self) -> HandshakeState {
        self.state
    }

    /// Tick at which the handshake started.
    #[must_use]
    pub const fn started_at(&self) -> Tick {
        self.started_at
    }

    /// The peer's identity, once received.
    #[must_use]
    pub fn peer_identity(&self) -> Option<&PlayerIdentity> {
        self.peer_identity.as_ref()
    }

    /// Returns `true` once readiness has been both sent and received.
    #[must_use]
    pub const fn is_go(&self) -> bool {
        self.state.is_go()
    }

    /// Returns `true` if the handshake has run for more than `timeout` ticks.
    #[must_use]
    pub fn is_expired(&self, now: Tick, timeout: u64) -> bool {
        now.since(self.started_at) > timeout
    }

    /// Queues every message that is due and not yet sent.
    pub fn poll<S: SimulationMemory + ?Sized>(&mut self, sim: &S, outbox: &mut Vec<Message>) {
        if self.state.insert(HandshakeFlag::RosterSent) {
            outbox.push(Message::DuelParty {
                roster: self.local_roster.clone(),
            });
        }
        if self.state.insert(HandshakeFlag::IdentitySent) {
            outbox.push(Message::DuelPlayerInfo(self.local_identity.clone()));
        }
        if self.role.is_host() && self.state.insert(HandshakeFlag::SeedSettled) {
            let seed = sim.read_rng_seed();
            tracing::debug!(seed, "sending shared seed");
            outbox.push(Message::DuelSeed { seed });
        }
        if self.state.is_exchange_complete() && self.state.insert(HandshakeFlag::ReadySent) {
            tracing::debug!(role = %self.role, "exchange complete, sending ready");
            outbox.push(Message::DuelReady);
        }
    }

    /// Applies a handshake message from the peer.
    ///
    /// Non-handshake messages are reported as [`HandshakeInput::Unexpected`].
    pub fn on_message<S: SimulationMemory + ?Sized>(
        &mut self,
        msg: &Message,
        sim: &mut S,
    ) -> HandshakeInput {
        match msg {
            Message::DuelParty { roster } => {
                if !self.state.insert(HandshakeFlag::PeerRoster) {
                    return HandshakeInput::Duplicate;
                }
                self.peer_roster = Some(roster.clone());
                HandshakeInput::Applied(HandshakeFlag::PeerRoster)
            },
            Message::DuelPlayerInfo(identity) => {
                if self.state.contains(HandshakeFlag::PeerIdentity) {
                    return HandshakeInput::Duplicate;
                }
                match SlotMap::negotiate(&self.local_slots, &self.remote_slots, identity) {
                    Ok(map) => {
                        self.state.insert(HandshakeFlag::PeerIdentity);
                        self.peer_identity = Some(identity.clone());
                        self.slot_map = Some(map);
                        HandshakeInput::Applied(HandshakeFlag::PeerIdentity)
                    },
                    Err(mismatch) => HandshakeInput::Rejected(mismatch),
                }
            },
            Message::DuelSeed { seed } => {
                if self.role.is_host() {
                    return HandshakeInput::Unexpected;
                }
                if !self.state.insert(HandshakeFlag::SeedSettled) {
                    return HandshakeInput::Duplicate;
                }
                tracing::debug!(seed, "writing shared seed from host");
                sim.write_rng_seed(*seed);
                HandshakeInput::Applied(HandshakeFlag::SeedSettled)
            },
            Message::DuelReady => {
                if self.state.insert(HandshakeFlag::PeerReady) {
                    HandshakeInput::Applied(HandshakeFlag::PeerReady)
                } else {
                    HandshakeInput::Duplicate
                }
            },
            _ => HandshakeInput::Unexpected,
        }
    }

    /// Returns `true` if the step `msg` completes has already been applied.
    ///
    /// A seed received by a host never applies.
    #[must_use]
    pub fn has_applied(&self, msg: &Message) -> bool {
        let flag = match msg {
            Message::DuelParty { .. } => HandshakeFlag::PeerRoster,
            Message::DuelPlayerInfo(_) => HandshakeFlag::PeerIdentity,
            Message::DuelSeed { .. } if self.role.is_guest() => HandshakeFlag::SeedSettled,
            Message::DuelReady => HandshakeFlag::PeerReady,
            _ => return false,
        };
        self.state.contains(flag)
    }

    /// Finishes the handshake: writes the peer roster into the simulation and hands over the
    /// negotiated slot map. Returns `None` before GO, or if called a second time.
    pub fn complete<S: SimulationMemory + ?Sized>(&mut self, sim: &mut S) -> Option<SlotMap> {
        if !self.is_go() {
            return None;
        }
        let map = self.slot_map.take()?;
        if let (Some(roster), Some(identity)) = (&self.peer_roster, &self.peer_identity) {
            sim.write_peer_roster(roster, identity);
        }
        Some(map)
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
    use crate::network::messages::TurnContext;
    use crate::Outcome;

    #[derive(Default)]
    struct SeedSim {
        seed: u32,
        roster_written: Option<Vec<u8>>,
    }

    impl SimulationMemory for SeedSim {
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
        fn inject_forfeit(&mut self, _slot: BattlerSlot) {}
        fn read_rng_seed(&self) -> u32 {
            self.seed
        }
        fn write_rng_seed(&mut self, seed: u32) {
            self.seed = seed;
        }
        fn write_peer_roster(&mut self, roster: &[u8], _identity: &PlayerIdentity) {
            self.roster_written = Some(roster.to_vec());
        }
    }

    const LOCAL: [BattlerSlot; 1] = [BattlerSlot::new(0)];
    const REMOTE: [BattlerSlot; 1] = [BattlerSlot::new(1)];

    fn coordinator(role: Role) -> HandshakeCoordinator {
        HandshakeCoordinator::begin(
            role,
            vec![1, 2, 3],
            PlayerIdentity::new("RED", 1).with_slots(&LOCAL, &REMOTE),
            &LOCAL,
            &REMOTE,
            Tick::ZERO,
        )
    }

    fn peer_identity() -> Message {
        Message::DuelPlayerInfo(PlayerIdentity::new("BLUE", 2).with_slots(&LOCAL, &REMOTE))
    }

    #[test]
    fn host_sends_exchange_once() {
        let sim = SeedSim {
            seed: 99,
            ..SeedSim::default()
        };
        let mut hs = coordinator(Role::Host);
        let mut outbox = Vec::new();
        hs.poll(&sim, &mut outbox);
        hs.poll(&sim, &mut outbox);

        let kinds: Vec<_> = outbox.iter().map(Message::kind).collect();
        assert_eq!(kinds, ["duel_party", "duel_player_info", "duel_seed"]);
        assert!(outbox.contains(&Message::DuelSeed { seed: 99 }));
    }

    #[test]
    fn guest_waits_for_seed_before_ready() {
        let mut sim = SeedSim::default();
        let mut hs = coordinator(Role::Guest);
        let mut outbox = Vec::new();
        hs.poll(&sim, &mut outbox);
        assert_eq!(outbox.len(), 2);

        hs.on_message(&Message::DuelParty { roster: vec![4] }, &mut sim);
        hs.on_message(&peer_identity(), &mut sim);
        hs.poll(&sim, &mut outbox);
        assert!(!outbox.contains(&Message::DuelReady));

        assert_eq!(
            hs.on_message(&Message::DuelSeed { seed: 1234 }, &mut sim),
            HandshakeInput::Applied(HandshakeFlag::SeedSettled)
        );
        assert_eq!(sim.seed, 1234);
        hs.poll(&sim, &mut outbox);
        assert_eq!(outbox.last(), Some(&Message::DuelReady));
    }

    #[test]
    fn duplicates_are_ignored() {
        let mut sim = SeedSim::default();
        let mut hs = coordinator(Role::Guest);
        let party = Message::DuelParty { roster: vec![4] };
        assert!(matches!(
            hs.on_message(&party, &mut sim),
            HandshakeInput::Applied(_)
        ));
        assert_eq!(
            hs.on_message(&Message::DuelParty { roster: vec![9] }, &mut sim),
            HandshakeInput::Duplicate
        );
        hs.on_message(&Message::DuelSeed { seed: 1 }, &mut sim);
        assert_eq!(
            hs.on_message(&Message::DuelSeed { seed: 2 }, &mut sim),
            HandshakeInput::Duplicate
        );
        assert_eq!(sim.seed, 1);
    }

    #[test]
    fn host_rejects_seed() {
        let mut sim = SeedSim::default();
        let mut hs = coordinator(Role::Host);
        assert_eq!(
            hs.on_message(&Message::DuelSeed { seed: 5 }, &mut sim),
            HandshakeInput::Unexpected
        );
    }

    #[test]
    fn mismatched_identity_is_rejected() {
        let mut sim = SeedSim::default();
        let mut hs = coordinator(Role::Host);
        let doubles = Message::DuelPlayerInfo(PlayerIdentity::new("BLUE", 2).with_slots(
            &[BattlerSlot::new(0), BattlerSlot::new(2)],
            &[BattlerSlot::new(1), BattlerSlot::new(3)],
        ));
        assert!(matches!(
            hs.on_message(&doubles, &mut sim),
            HandshakeInput::Rejected(_)
        ));
        assert!(!hs.state().contains(HandshakeFlag::PeerIdentity));
    }

    #[test]
    fn early_ready_from_peer_still_reaches_go() {
        let mut sim = SeedSim::default();
        let mut hs = coordinator(Role::Host);
        let mut outbox = Vec::new();

        hs.on_message(&Message::DuelReady, &mut sim);
        hs.poll(&sim, &mut outbox);
        assert!(!hs.is_go());

        hs.on_message(&Message::DuelParty { roster: vec![4] }, &mut sim);
        hs.on_message(&peer_identity(), &mut sim);
        hs.poll(&sim, &mut outbox);
        assert!(hs.is_go());
        assert_eq!(hs.state().completed(), HandshakeState::TOTAL);

        let map = hs.complete(&mut sim).unwrap();
        assert_eq!(map.to_local(BattlerSlot::new(0)), Some(BattlerSlot::new(1)));
        assert_eq!(sim.roster_written, Some(vec![4]));
        assert!(hs.complete(&mut sim).is_none());
    }

    #[test]
    fn expiry_fires_after_the_window() {
        let hs = coordinator(Role::Host);
        assert!(!hs.is_expired(Tick::new(720), 720));
        assert!(hs.is_expired(Tick::new(721), 720));
    }
}
