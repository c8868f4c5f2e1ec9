#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::sync::Arc;

use duel_link::telemetry::{CollectingObserver, ViolationKind};
use duel_link::{
    LinkEvent, MemoryRelay, Message, Outcome, PeerId, Phase, PlayerIdentity,
    SessionBuilder, TerminationCause,
};

use crate::common::{
    test_config, DuelPair, ScriptedPeer, SimStub, GUEST, HOST, OPPONENT_SLOT, OWN_SLOT,
};

#[test]
fn host_win_forces_guest_mid_turn_to_lose() {
    let config = test_config();
    let mut pair = DuelPair::new(config);
    pair.run_until_active();
    pair.play_turn(b"slash", b"swords-dance");

    // The guest is waiting on a buffer when the host's simulation declares the win.
    pair.guest_sim.produce(OWN_SLOT, b"recover");
    pair.host_sim.finish(Outcome::Win);
    let ticks = pair.run_until_closed();
    assert!(ticks <= config.timings().safety_timeout);

    assert_eq!(pair.host.final_outcome(), Some(Outcome::Win));
    assert_eq!(pair.guest.final_outcome(), Some(Outcome::Lose));
    assert_eq!(
        pair.host.termination_cause(),
        Some(TerminationCause::LocalOutcome)
    );
    assert_eq!(
        pair.guest.termination_cause(),
        Some(TerminationCause::PeerOutcome)
    );

    // Only the losing guest is driven through its forfeit path.
    assert!(pair.host_sim.forfeits.is_empty());
    assert_eq!(
        pair.guest_sim.forfeits,
        vec![OWN_SLOT; config.forfeit_repeat_ticks as usize]
    );
    assert_eq!(pair.guest_sim.outcome, Some(Outcome::Lose));

    let events = pair.guest_events();
    assert!(events.contains(&LinkEvent::TerminationStarted {
        cause: TerminationCause::PeerOutcome
    }));
    assert!(events.contains(&LinkEvent::OutcomeDecided {
        outcome: Outcome::Lose
    }));
}

#[test]
fn guest_disconnect_aborts_the_host_within_bounds() {
    let config = test_config();
    let mut pair = DuelPair::new(config);
    pair.run_until_active();
    pair.play_turn(b"ember", b"bubble");

    assert!(pair.relay.disconnect(&PeerId::new(GUEST)));

    let mut ticks = 0;
    while pair.host.tick(&mut pair.host_sim) != Phase::Closed {
        ticks += 1;
        assert!(
            ticks <= config.timings().safety_timeout,
            "host did not close within the safety timeout"
        );
    }
    assert_eq!(pair.host.final_outcome(), Some(Outcome::Aborted));
    assert_eq!(
        pair.host.termination_cause(),
        Some(TerminationCause::PeerDisconnected)
    );
    // The host's own battler forfeits so its simulation reaches the end screen.
    assert!(pair.host_sim.forfeits.iter().all(|slot| *slot == OWN_SLOT));
    assert!(pair.host.events().any(|event| event
        == LinkEvent::Closed {
            outcome: Outcome::Aborted,
            cause: TerminationCause::PeerDisconnected,
        }));
}

#[test]
fn disconnect_after_the_outcome_keeps_it() {
    let mut pair = DuelPair::new(test_config());
    pair.run_until_active();
    pair.host_sim.finish(Outcome::Draw);
    pair.tick();
    assert_eq!(pair.host.phase(), Phase::Ending);

    pair.relay.disconnect(&PeerId::new(GUEST));
    while pair.host.tick(&mut pair.host_sim) != Phase::Closed {}
    assert_eq!(pair.host.final_outcome(), Some(Outcome::Draw));
}

#[test]
fn conflicting_reports_resolve_in_favour_of_the_host() {
    let relay = MemoryRelay::new();
    let observer = Arc::new(CollectingObserver::new());
    let mut host = SessionBuilder::new()
        .with_local_peer(HOST)
        .with_remote_peer(GUEST)
        .as_initiator(true)
        .with_identity(PlayerIdentity::new("RED", 1))
        .with_local_slots(&[OWN_SLOT])
        .with_remote_slots(&[OPPONENT_SLOT])
        .with_config(test_config())
        .with_violation_observer(observer.clone())
        .start_session(relay.connect(HOST))
        .unwrap();
    let mut guest = ScriptedPeer::new(&relay, GUEST, HOST);
    let mut sim = SimStub::new(&[OWN_SLOT], 1);

    for msg in ScriptedPeer::exchange(GUEST) {
        guest.send(msg);
    }
    guest.send(Message::DuelReady);
    assert_eq!(host.tick(&mut sim), Phase::Active);

    // Both claim the win; the host captured its own before the guest's claim arrives.
    sim.finish(Outcome::Win);
    assert_eq!(host.tick(&mut sim), Phase::Ending);
    guest.send(Message::DuelEnd {
        outcome: Outcome::Win,
    });
    assert_eq!(host.tick(&mut sim), Phase::Closed);

    assert_eq!(host.final_outcome(), Some(Outcome::Win));
    assert!(observer.has_violation(ViolationKind::Outcome));
    assert!(guest.drain().contains(&Message::DuelEnd {
        outcome: Outcome::Win
    }));
}

#[test]
fn guest_adopts_the_host_outcome_when_they_disagree() {
    let mut pair = DuelPair::new(test_config());
    pair.run_until_active();
    pair.host.report_local_outcome(Outcome::Win).unwrap();
    pair.guest.report_local_outcome(Outcome::Win).unwrap();

    // The guest's claim goes out first.
    pair.guest.tick(&mut pair.guest_sim);
    pair.run_until_closed();

    assert_eq!(pair.host.final_outcome(), Some(Outcome::Win));
    assert_eq!(pair.guest.final_outcome(), Some(Outcome::Lose));
    let guest_events = pair.guest_events();
    assert!(guest_events.contains(&LinkEvent::OutcomeDecided {
        outcome: Outcome::Lose
    }));
    assert!(guest_events.contains(&LinkEvent::Closed {
        outcome: Outcome::Lose,
        cause: TerminationCause::LocalOutcome,
    }));
}

#[test]
fn agreeing_reports_close_both_sides_without_forfeits() {
    let mut pair = DuelPair::new(test_config());
    pair.run_until_active();
    pair.play_turn(b"hyper-beam", b"splash");

    pair.host.report_local_outcome(Outcome::Win).unwrap();
    pair.guest.report_local_outcome(Outcome::Lose).unwrap();
    pair.run_until_closed();

    assert_eq!(pair.host.final_outcome(), Some(Outcome::Win));
    assert_eq!(pair.guest.final_outcome(), Some(Outcome::Lose));
    assert!(pair.host_sim.forfeits.is_empty());
    assert!(pair.guest_sim.forfeits.is_empty());
    assert!(pair.guest_events().contains(&LinkEvent::Closed {
        outcome: Outcome::Lose,
        cause: TerminationCause::LocalOutcome,
    }));
}
