#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use duel_link::{
    ChaosConfig, ChaosTransport, LinkConfig, LinkEvent, MemoryRelay, Outcome, Phase, StallKind,
    TerminationCause,
};
use web_time::Duration;

use crate::common::{
    singles_controller, test_config, DuelPair, SimStub, GUEST, HOST, HOST_SEED, MAX_TICKS,
    OWN_SLOT,
};

/// Ticks the host alone until it leaves `phase`, returning the tick it left on.
fn run_host_while(pair: &mut DuelPair, phase: Phase) -> duel_link::Tick {
    let mut guard = 0;
    while pair.host.tick(&mut pair.host_sim) == phase {
        guard += 1;
        assert!(guard < MAX_TICKS, "host stuck in {:?}", phase);
    }
    pair.host.current_tick()
}

#[test]
fn relay_stall_fires_one_tick_after_threshold() {
    let config = test_config();
    let mut pair = DuelPair::new(config);
    pair.run_until_active();
    let active_since = pair.host.stats().active_since.unwrap();

    // Both peers keep pinging but nobody produces a buffer.
    pair.run_until(|p| p.host.phase() != Phase::Active);
    let threshold = config.timings().relay_timeout;
    assert_eq!(pair.host.current_tick(), active_since + (threshold + 1));
    assert_eq!(pair.host.termination_cause(), Some(TerminationCause::RelayStall));
    assert!(pair.host.stats().pings_sent > 0);
    assert!(pair.host.stats().last_ping_rtt.is_some());

    let events = pair.host_events();
    assert!(events.contains(&LinkEvent::StallDetected {
        kind: StallKind::Relay,
        idle_ticks: threshold + 1,
    }));

    pair.run_until_closed();
    assert_eq!(pair.host.final_outcome(), Some(Outcome::Aborted));
    assert_eq!(pair.guest.final_outcome(), Some(Outcome::Aborted));
    assert_eq!(
        pair.guest.termination_cause(),
        Some(TerminationCause::PeerOutcome)
    );
}

#[test]
fn frozen_peer_trips_liveness() {
    let config = LinkConfig {
        relay_timeout: Duration::from_secs(10),
        liveness_timeout: Duration::from_secs(1),
        ..test_config()
    };
    let mut pair = DuelPair::new(config);
    pair.run_until_active();
    let last_heard = pair.host.stats().active_since.unwrap();

    // The guest stops ticking altogether.
    let fired_at = run_host_while(&mut pair, Phase::Active);
    let threshold = config.timings().liveness_timeout;
    assert_eq!(fired_at, last_heard + (threshold + 1));
    assert_eq!(
        pair.host.termination_cause(),
        Some(TerminationCause::LivenessLoss)
    );

    let closed_at = run_host_while(&mut pair, Phase::Ending);
    assert!(closed_at.since(fired_at) <= config.timings().safety_timeout);
    assert_eq!(pair.host.final_outcome(), Some(Outcome::Aborted));
    assert!(pair.host.events().any(|event| event
        == LinkEvent::Closed {
            outcome: Outcome::Aborted,
            cause: TerminationCause::LivenessLoss,
        }));
}

#[test]
fn relay_that_goes_quiet_is_detected() {
    let config = LinkConfig {
        relay_timeout: Duration::from_secs(10),
        liveness_timeout: Duration::from_secs(1),
        ..test_config()
    };
    let relay = MemoryRelay::new();
    let transport = ChaosTransport::new(relay.connect(HOST), ChaosConfig::silent_after(30));
    let mut host = singles_controller(HOST, GUEST, true, config, transport);
    let mut guest = singles_controller(GUEST, HOST, false, config, relay.connect(GUEST));
    let mut host_sim = SimStub::new(&[OWN_SLOT], HOST_SEED);
    let mut guest_sim = SimStub::new(&[OWN_SLOT], 0);

    let mut guard = 0;
    while host.phase() != Phase::Closed || guest.phase() != Phase::Closed {
        host.tick(&mut host_sim);
        guest.tick(&mut guest_sim);
        guard += 1;
        assert!(guard < MAX_TICKS, "sessions never closed");
    }
    assert_eq!(
        host.termination_cause(),
        Some(TerminationCause::LivenessLoss)
    );
    assert_eq!(
        guest.termination_cause(),
        Some(TerminationCause::LivenessLoss)
    );
    assert_eq!(host.final_outcome(), Some(Outcome::Aborted));
    assert_eq!(guest.final_outcome(), Some(Outcome::Aborted));
}

#[test]
fn safety_timeout_closes_when_the_simulation_never_ends() {
    let config = test_config();
    let mut pair = DuelPair::new(config);
    pair.host_sim.finish_on_forfeit = false;
    pair.run_until_active();

    let started = run_host_while(&mut pair, Phase::Active);
    let closed = run_host_while(&mut pair, Phase::Ending);
    let safety = config.timings().safety_timeout;
    // The bound is inclusive: closed on the tick the timeout runs out, never later.
    assert!(closed.since(started) <= safety, "closed after {} ticks", closed.since(started));
    assert_eq!(closed, started + safety);
    assert_eq!(pair.host.final_outcome(), Some(Outcome::Aborted));
    assert_eq!(
        pair.host.stats().forfeit_injections,
        u64::from(config.forfeit_repeat_ticks)
    );
    assert!(pair.host.events().any(|event| event
        == LinkEvent::Closed {
            outcome: Outcome::Aborted,
            cause: TerminationCause::SafetyTimeout,
        }));
}
