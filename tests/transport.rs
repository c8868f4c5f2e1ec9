//! Transport integration tests.
//!
//! Full sessions over the transports shipped with the crate:
//! - `StreamTransport` over a real loopback TCP connection
//! - `ChaosTransport` wrapping the in-process relay with latency, jitter and duplication

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

#[path = "common/mod.rs"]
mod common;

use std::net::TcpListener;
use std::thread;

use duel_link::{
    ChaosConfig, ChaosTransport, LinkController, MemoryRelay, Outcome, Phase, StreamTransport,
};
use serial_test::serial;
use web_time::Duration;

use common::{
    init_tracing, singles_controller, test_config, SimStub, GUEST, HOST, HOST_SEED, MAX_TICKS,
    OPPONENT_SLOT, OWN_SLOT,
};

/// Ticks both controllers until `done` holds, sleeping `pause` between ticks.
fn drive(
    host: &mut LinkController,
    host_sim: &mut SimStub,
    guest: &mut LinkController,
    guest_sim: &mut SimStub,
    pause: Duration,
    mut done: impl FnMut(&LinkController, &SimStub, &LinkController, &SimStub) -> bool,
) {
    let mut ticks = 0;
    while !done(host, host_sim, guest, guest_sim) {
        host.tick(host_sim);
        guest.tick(guest_sim);
        ticks += 1;
        assert!(
            ticks < MAX_TICKS,
            "condition not reached (host {:?}, guest {:?})",
            host.phase(),
            guest.phase()
        );
        if !pause.is_zero() {
            thread::sleep(pause);
        }
    }
}

#[test]
#[serial]
fn full_duel_over_loopback_tcp() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let guest_transport = StreamTransport::connect_tcp(addr, GUEST).unwrap();
    let (accepted, _) = listener.accept().unwrap();
    let host_transport = StreamTransport::from_tcp(accepted, HOST).unwrap();

    let config = test_config();
    let mut host = singles_controller(HOST, GUEST, true, config, host_transport);
    let mut guest = singles_controller(GUEST, HOST, false, config, guest_transport);
    let mut host_sim = SimStub::new(&[OWN_SLOT], HOST_SEED);
    let mut guest_sim = SimStub::new(&[OWN_SLOT], 0);
    let pause = Duration::from_millis(1);

    drive(
        &mut host,
        &mut host_sim,
        &mut guest,
        &mut guest_sim,
        pause,
        |h, _, g, _| h.phase() == Phase::Active && g.phase() == Phase::Active,
    );
    assert_eq!(guest_sim.seed, HOST_SEED);

    host_sim.produce(OWN_SLOT, b"quick-attack");
    guest_sim.produce(OWN_SLOT, b"tail-whip");
    drive(
        &mut host,
        &mut host_sim,
        &mut guest,
        &mut guest_sim,
        pause,
        |_, hs, _, gs| hs.is_unblocked(OPPONENT_SLOT) && gs.is_unblocked(OPPONENT_SLOT),
    );
    assert_eq!(
        host_sim.consume(OPPONENT_SLOT).as_deref(),
        Some(&b"tail-whip"[..])
    );
    assert_eq!(
        guest_sim.consume(OPPONENT_SLOT).as_deref(),
        Some(&b"quick-attack"[..])
    );

    guest_sim.finish(Outcome::Win);
    drive(
        &mut host,
        &mut host_sim,
        &mut guest,
        &mut guest_sim,
        pause,
        |h, _, g, _| h.phase() == Phase::Closed && g.phase() == Phase::Closed,
    );
    assert_eq!(guest.final_outcome(), Some(Outcome::Win));
    assert_eq!(host.final_outcome(), Some(Outcome::Lose));
    assert_eq!(host_sim.outcome, Some(Outcome::Lose));
}

#[test]
fn congested_relay_still_settles_the_duel() {
    let relay = MemoryRelay::new();
    let config = test_config();
    let host_transport =
        ChaosTransport::new(relay.connect(HOST), ChaosConfig::congested().with_seed(7));
    let guest_transport =
        ChaosTransport::new(relay.connect(GUEST), ChaosConfig::congested().with_seed(8));
    let mut host = singles_controller(HOST, GUEST, true, config, host_transport);
    let mut guest = singles_controller(GUEST, HOST, false, config, guest_transport);
    let mut host_sim = SimStub::new(&[OWN_SLOT], HOST_SEED);
    let mut guest_sim = SimStub::new(&[OWN_SLOT], 0);

    for turn in 0u8..4 {
        host_sim.produce(OWN_SLOT, &[b'h', turn]);
        guest_sim.produce(OWN_SLOT, &[b'g', turn]);
        drive(
            &mut host,
            &mut host_sim,
            &mut guest,
            &mut guest_sim,
            Duration::ZERO,
            |_, hs, _, gs| hs.is_unblocked(OPPONENT_SLOT) && gs.is_unblocked(OPPONENT_SLOT),
        );
        assert_eq!(host_sim.consume(OPPONENT_SLOT), Some(vec![b'g', turn]));
        assert_eq!(guest_sim.consume(OPPONENT_SLOT), Some(vec![b'h', turn]));
    }
    // Duplicated copies never turn into extra injections.
    assert_eq!(host_sim.injections(), 4);
    assert_eq!(guest_sim.injections(), 4);
    assert!(guest.stats().duplicates_discarded > 0 || host.stats().duplicates_discarded > 0);

    host_sim.finish(Outcome::Win);
    drive(
        &mut host,
        &mut host_sim,
        &mut guest,
        &mut guest_sim,
        Duration::ZERO,
        |h, _, g, _| h.phase() == Phase::Closed && g.phase() == Phase::Closed,
    );
    assert_eq!(host.final_outcome(), Some(Outcome::Win));
    assert_eq!(guest.final_outcome(), Some(Outcome::Lose));
}
