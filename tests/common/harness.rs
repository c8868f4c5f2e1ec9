//! Two-peer harness over an in-process relay.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    dead_code
)]

use duel_link::{
    BattlerSlot, LinkConfig, LinkController, LinkEvent, MemoryRelay, MemoryRelayEndpoint,
    Message, PeerId, Phase, PlayerIdentity, RelayTransport, SessionBuilder,
};
use web_time::Duration;

use super::stubs::SimStub;

pub const HOST: &str = "red";
pub const GUEST: &str = "blue";
pub const HOST_SEED: u32 = 0xC0FF_EE00;

/// Upper bound for loops that wait on the link.
pub const MAX_TICKS: u64 = 2_000;

/// Both peers call themselves slot 0 and their opponent slot 1.
pub const OWN_SLOT: BattlerSlot = BattlerSlot::new(0);
pub const OPPONENT_SLOT: BattlerSlot = BattlerSlot::new(1);

/// Short deadlines so tests finish quickly. At 60 ticks per second: handshake 120, relay 60,
/// liveness 120, ping 15, safety 180 and linger 15 ticks.
#[must_use]
pub fn test_config() -> LinkConfig {
    LinkConfig {
        tick_rate: 60,
        handshake_timeout: Duration::from_secs(2),
        relay_timeout: Duration::from_secs(1),
        liveness_timeout: Duration::from_secs(2),
        ping_interval: Duration::from_millis(250),
        forfeit_repeat_ticks: 5,
        safety_timeout: Duration::from_secs(3),
        inbound_refresh_ticks: 3,
        linger: Duration::from_millis(250),
        max_buffer_len: 512,
    }
}

/// Routes controller logs to the test output. Safe to call from every test.
pub fn init_tracing() {
    // Only the first call in a test binary installs the subscriber.
    let _ = tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .finish(),
    );
}

#[must_use]
pub fn roster_of(peer: &str) -> Vec<u8> {
    peer.bytes().collect()
}

/// Builds a singles controller for `local` talking to `remote` through `transport`.
pub fn singles_controller(
    local: &str,
    remote: &str,
    initiator: bool,
    config: LinkConfig,
    transport: impl RelayTransport + 'static,
) -> LinkController {
    SessionBuilder::new()
        .with_local_peer(local)
        .with_remote_peer(remote)
        .as_initiator(initiator)
        .with_roster(roster_of(local))
        .with_identity(PlayerIdentity::new(local.to_uppercase(), 100))
        .with_local_slots(&[OWN_SLOT])
        .with_remote_slots(&[OPPONENT_SLOT])
        .with_config(config)
        .start_session(transport)
        .expect("session should start")
}

/// Host and guest controllers with their simulations.
pub struct DuelPair {
    pub relay: MemoryRelay,
    pub host: LinkController,
    pub guest: LinkController,
    pub host_sim: SimStub,
    pub guest_sim: SimStub,
    pub ticks: u64,
}

impl DuelPair {
    #[must_use]
    pub fn new(config: LinkConfig) -> Self {
        let relay = MemoryRelay::new();
        let host = singles_controller(HOST, GUEST, true, config, relay.connect(HOST));
        let guest = singles_controller(GUEST, HOST, false, config, relay.connect(GUEST));
        Self {
            relay,
            host,
            guest,
            host_sim: SimStub::new(&[OWN_SLOT], HOST_SEED),
            guest_sim: SimStub::new(&[OWN_SLOT], 0),
            ticks: 0,
        }
    }

    /// Ticks the host, then the guest.
    pub fn tick(&mut self) -> (Phase, Phase) {
        self.ticks += 1;
        let host = self.host.tick(&mut self.host_sim);
        let guest = self.guest.tick(&mut self.guest_sim);
        (host, guest)
    }

    /// Ticks until `done` holds, returning the number of ticks it took.
    pub fn run_until(&mut self, mut done: impl FnMut(&DuelPair) -> bool) -> u64 {
        let start = self.ticks;
        while !done(self) {
            assert!(
                self.ticks - start < MAX_TICKS,
                "condition not reached within {} ticks (host {:?}, guest {:?})",
                MAX_TICKS,
                self.host.phase(),
                self.guest.phase()
            );
            self.tick();
        }
        self.ticks - start
    }

    pub fn run_until_active(&mut self) -> u64 {
        self.run_until(|pair| {
            pair.host.phase() == Phase::Active && pair.guest.phase() == Phase::Active
        })
    }

    pub fn run_until_closed(&mut self) -> u64 {
        self.run_until(|pair| {
            pair.host.phase() == Phase::Closed && pair.guest.phase() == Phase::Closed
        })
    }

    /// Plays one turn: both sides produce a buffer and tick until each has received the other's.
    pub fn play_turn(&mut self, host_bytes: &[u8], guest_bytes: &[u8]) {
        self.host_sim.produce(OWN_SLOT, host_bytes);
        self.guest_sim.produce(OWN_SLOT, guest_bytes);
        self.run_until(|pair| {
            pair.host_sim.is_unblocked(OPPONENT_SLOT) && pair.guest_sim.is_unblocked(OPPONENT_SLOT)
        });
        assert_eq!(
            self.host_sim.consume(OPPONENT_SLOT).as_deref(),
            Some(guest_bytes)
        );
        assert_eq!(
            self.guest_sim.consume(OPPONENT_SLOT).as_deref(),
            Some(host_bytes)
        );
    }

    pub fn host_events(&mut self) -> Vec<LinkEvent> {
        self.host.events().collect()
    }

    pub fn guest_events(&mut self) -> Vec<LinkEvent> {
        self.guest.events().collect()
    }
}

/// A hand-driven peer for feeding a controller exact message sequences.
pub struct ScriptedPeer {
    endpoint: MemoryRelayEndpoint,
    target: PeerId,
}

impl ScriptedPeer {
    #[must_use]
    pub fn new(relay: &MemoryRelay, name: &str, target: &str) -> Self {
        Self {
            endpoint: relay.connect(name),
            target: PeerId::new(target),
        }
    }

    pub fn send(&mut self, msg: Message) {
        self.endpoint.send_to(&msg, &self.target);
    }

    /// Everything the controller sent since the last call.
    pub fn drain(&mut self) -> Vec<Message> {
        self.endpoint
            .receive_all_messages()
            .into_iter()
            .map(|(_, msg)| msg)
            .collect()
    }

    /// This peer's EXCHANGE records for a singles layout.
    #[must_use]
    pub fn exchange(name: &str) -> [Message; 2] {
        [
            Message::DuelParty {
                roster: roster_of(name),
            },
            Message::DuelPlayerInfo(
                PlayerIdentity::new(name.to_uppercase(), 200)
                    .with_slots(&[OWN_SLOT], &[OPPONENT_SLOT]),
            ),
        ]
    }
}
