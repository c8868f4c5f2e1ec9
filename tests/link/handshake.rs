#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::sync::Arc;

use duel_link::telemetry::{CollectingObserver, ViolationKind};
use duel_link::{
    BattlerSlot, DiscardReason, HandshakeFlag, LinkEvent, MemoryRelay, Message, Outcome, Phase,
    PlayerIdentity, Role, SessionBuilder, StallKind, TerminationCause, Tick,
};

use crate::common::{
    roster_of, singles_controller, test_config, DuelPair, ScriptedPeer, SimStub, GUEST, HOST,
    HOST_SEED, OWN_SLOT,
};

#[test]
fn pair_reaches_active_and_shares_rosters() {
    let mut pair = DuelPair::new(test_config());
    let ticks = pair.run_until_active();
    assert!(ticks <= 3, "handshake took {} ticks", ticks);

    assert_eq!(pair.host.role(), Role::Host);
    assert_eq!(pair.guest.role(), Role::Guest);

    let (host_view, identity) = pair.host_sim.peer_roster.clone().unwrap();
    assert_eq!(host_view, roster_of(GUEST));
    assert_eq!(identity.name, "BLUE");
    let (guest_view, _) = pair.guest_sim.peer_roster.clone().unwrap();
    assert_eq!(guest_view, roster_of(HOST));

    // The guest adopts the host's seed; the host keeps its own.
    assert_eq!(pair.guest_sim.seed, HOST_SEED);
    assert_eq!(pair.host_sim.seed, HOST_SEED);

    let events = pair.guest_events();
    assert!(events.contains(&LinkEvent::Active { role: Role::Guest }));
}

#[test]
fn ready_before_exchange_still_reaches_active() {
    let relay = MemoryRelay::new();
    let mut guest = singles_controller(GUEST, HOST, false, test_config(), relay.connect(GUEST));
    let mut host = ScriptedPeer::new(&relay, HOST, GUEST);
    let mut sim = SimStub::new(&[OWN_SLOT], 0);

    host.send(Message::DuelReady);
    assert_eq!(guest.tick(&mut sim), Phase::Handshake);
    assert!(guest.handshake_state().contains(HandshakeFlag::PeerReady));
    assert!(!guest.handshake_state().contains(HandshakeFlag::ReadySent));
    assert!(sim.peer_roster.is_none());

    for msg in ScriptedPeer::exchange(HOST) {
        host.send(msg);
    }
    host.send(Message::DuelSeed { seed: 99 });
    assert_eq!(guest.tick(&mut sim), Phase::Active);
    assert_eq!(sim.seed, 99);
    assert!(sim.peer_roster.is_some());

    let readies = host
        .drain()
        .into_iter()
        .filter(|msg| *msg == Message::DuelReady)
        .count();
    assert_eq!(readies, 1);
}

#[test]
fn guest_is_not_ready_without_the_seed() {
    let relay = MemoryRelay::new();
    let mut guest = singles_controller(GUEST, HOST, false, test_config(), relay.connect(GUEST));
    let mut host = ScriptedPeer::new(&relay, HOST, GUEST);
    let mut sim = SimStub::new(&[OWN_SLOT], 0);

    for msg in ScriptedPeer::exchange(HOST) {
        host.send(msg);
    }
    host.send(Message::DuelReady);
    for _ in 0..5 {
        assert_eq!(guest.tick(&mut sim), Phase::Handshake);
    }
    assert!(!host.drain().contains(&Message::DuelReady));

    host.send(Message::DuelSeed { seed: 5 });
    assert_eq!(guest.tick(&mut sim), Phase::Active);
}

#[test]
fn replayed_handshake_messages_change_nothing() {
    let relay = MemoryRelay::new();
    let mut guest = singles_controller(GUEST, HOST, false, test_config(), relay.connect(GUEST));
    let mut host = ScriptedPeer::new(&relay, HOST, GUEST);
    let mut sim = SimStub::new(&[OWN_SLOT], 0);

    for msg in ScriptedPeer::exchange(HOST) {
        host.send(msg);
    }
    host.send(Message::DuelSeed { seed: 42 });
    host.send(Message::DuelReady);
    assert_eq!(guest.tick(&mut sim), Phase::Active);
    let state = guest.handshake_state();
    guest.events().for_each(drop);

    for msg in ScriptedPeer::exchange(HOST) {
        host.send(msg);
    }
    host.send(Message::DuelSeed { seed: 1 });
    host.send(Message::DuelReady);
    assert_eq!(guest.tick(&mut sim), Phase::Active);

    assert_eq!(sim.seed, 42);
    assert_eq!(guest.handshake_state(), state);
    let duplicates = guest
        .events()
        .filter(|event| {
            matches!(
                event,
                LinkEvent::MessageDiscarded {
                    reason: DiscardReason::DuplicateMessage,
                    ..
                }
            )
        })
        .count();
    assert_eq!(duplicates, 4);
    assert_eq!(guest.stats().duplicates_discarded, 4);
}

#[test]
fn silent_peer_times_out_the_handshake() {
    let relay = MemoryRelay::new();
    let config = test_config();
    let mut guest = singles_controller(GUEST, HOST, false, config, relay.connect(GUEST));
    let mut sim = SimStub::new(&[OWN_SLOT], 0);
    let window = config.timings().handshake_timeout;

    while guest.tick(&mut sim) == Phase::Handshake {}
    // Fires one tick after the window, never earlier.
    assert_eq!(guest.current_tick(), Tick::new(window + 1));
    assert_eq!(
        guest.termination_cause(),
        Some(TerminationCause::HandshakeTimeout)
    );

    let mut guard = 0;
    while guest.tick(&mut sim) != Phase::Closed {
        guard += 1;
        assert!(guard < 1_000, "session never closed");
    }
    assert_eq!(guest.final_outcome(), Some(Outcome::Aborted));

    let events: Vec<_> = guest.events().collect();
    assert!(events.contains(&LinkEvent::StallDetected {
        kind: StallKind::Handshake,
        idle_ticks: window + 1,
    }));
    assert_eq!(
        events.last(),
        Some(&LinkEvent::Closed {
            outcome: Outcome::Aborted,
            cause: TerminationCause::HandshakeTimeout,
        })
    );
    assert_eq!(sim.forfeits.len(), config.forfeit_repeat_ticks as usize);
    assert!(sim.peer_roster.is_none());
}

#[test]
fn mismatched_slot_layout_is_rejected() {
    let relay = MemoryRelay::new();
    let observer = Arc::new(CollectingObserver::new());
    let mut guest = SessionBuilder::new()
        .with_local_peer(GUEST)
        .with_remote_peer(HOST)
        .with_identity(PlayerIdentity::new("BLUE", 1))
        .with_local_slots(&[OWN_SLOT])
        .with_remote_slots(&[BattlerSlot::new(1)])
        .with_config(test_config())
        .with_violation_observer(observer.clone())
        .start_session(relay.connect(GUEST))
        .unwrap();
    let mut host = ScriptedPeer::new(&relay, HOST, GUEST);
    let mut sim = SimStub::new(&[OWN_SLOT], 0);

    // A doubles layout against our singles.
    host.send(Message::DuelPlayerInfo(
        PlayerIdentity::new("RED", 2).with_slots(
            &[BattlerSlot::new(0), BattlerSlot::new(2)],
            &[BattlerSlot::new(1), BattlerSlot::new(3)],
        ),
    ));
    assert_eq!(guest.tick(&mut sim), Phase::Ending);
    assert_eq!(
        guest.termination_cause(),
        Some(TerminationCause::HandshakeRejected)
    );
    assert!(observer.has_violation(ViolationKind::Handshake));
    assert!(!guest.handshake_state().contains(HandshakeFlag::PeerIdentity));
}

#[test]
fn handshake_records_after_a_rejection_are_not_duplicates() {
    let relay = MemoryRelay::new();
    let mut guest = singles_controller(GUEST, HOST, false, test_config(), relay.connect(GUEST));
    let mut host = ScriptedPeer::new(&relay, HOST, GUEST);
    let mut sim = SimStub::new(&[OWN_SLOT], 0);

    host.send(Message::DuelParty {
        roster: roster_of(HOST),
    });
    host.send(Message::DuelPlayerInfo(PlayerIdentity::new("RED", 2).with_slots(
        &[BattlerSlot::new(0), BattlerSlot::new(2)],
        &[BattlerSlot::new(1), BattlerSlot::new(3)],
    )));
    assert_eq!(guest.tick(&mut sim), Phase::Ending);
    guest.events().for_each(drop);

    // The roster was applied before the rejection; readiness never was.
    host.send(Message::DuelParty {
        roster: roster_of(HOST),
    });
    host.send(Message::DuelReady);
    guest.tick(&mut sim);

    let discards: Vec<_> = guest
        .events()
        .filter_map(|event| match event {
            LinkEvent::MessageDiscarded { kind, reason } => Some((kind, reason)),
            _ => None,
        })
        .collect();
    assert_eq!(
        discards,
        vec![
            ("duel_party", DiscardReason::DuplicateMessage),
            ("duel_ready", DiscardReason::NotActive),
        ]
    );
    assert_eq!(guest.stats().duplicates_discarded, 1);
}
