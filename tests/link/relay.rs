#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use duel_link::{
    BattlerSlot, DiscardReason, LinkController, LinkEvent, MemoryRelay, Message, Phase,
    StageTag, TurnContext,
};

use crate::common::{
    singles_controller, test_config, DuelPair, ScriptedPeer, SimStub, GUEST, HOST, OPPONENT_SLOT,
    OWN_SLOT,
};

/// A guest controller that completed its handshake against a scripted host.
fn active_guest() -> (LinkController, ScriptedPeer, SimStub) {
    let relay = MemoryRelay::new();
    let mut guest = singles_controller(GUEST, HOST, false, test_config(), relay.connect(GUEST));
    let mut host = ScriptedPeer::new(&relay, HOST, GUEST);
    let mut sim = SimStub::new(&[OWN_SLOT], 0);

    for msg in ScriptedPeer::exchange(HOST) {
        host.send(msg);
    }
    host.send(Message::DuelSeed { seed: 3 });
    host.send(Message::DuelReady);
    assert_eq!(guest.tick(&mut sim), Phase::Active);
    host.drain();
    guest.events().for_each(drop);
    (guest, host, sim)
}

fn host_buffer(seq: u32, bytes: &[u8]) -> Message {
    Message::DuelBufferCmd {
        battler_slot: OWN_SLOT,
        seq,
        buffer: bytes.to_vec(),
        turn_context: None,
    }
}

fn acks(messages: &[Message]) -> Vec<(BattlerSlot, u32)> {
    messages
        .iter()
        .filter_map(|msg| match msg {
            Message::DuelBufferAck { battler_slot, seq } => Some((*battler_slot, *seq)),
            _ => None,
        })
        .collect()
}

#[test]
fn buffers_cross_and_rounds_advance_the_stage() {
    let mut pair = DuelPair::new(test_config());
    pair.run_until_active();

    pair.play_turn(b"host-move-1", b"guest-move-1");
    pair.run_until(|p| p.host.session().stage() == 1 && p.guest.session().stage() == 1);
    pair.run_until(|p| p.host.peer_stage() == Some(1) && p.guest.peer_stage() == Some(1));
    assert_eq!(pair.host.outstanding_buffers(), 0);
    assert_eq!(pair.guest.outstanding_buffers(), 0);

    pair.play_turn(b"host-move-2", b"guest-move-2");
    pair.run_until(|p| p.host.session().stage() == 2 && p.guest.session().stage() == 2);

    assert_eq!(pair.host.stats().buffers_captured, 2);
    assert_eq!(pair.guest.stats().buffers_injected, 2);
    assert!(pair.guest_events().contains(&LinkEvent::PeerStage {
        stage: StageTag::Number(1)
    }));
}

#[test]
fn host_turn_context_is_remapped_for_the_guest() {
    let mut pair = DuelPair::new(test_config());
    pair.run_until_active();

    pair.host_sim.turn_context = TurnContext {
        attacker: OWN_SLOT,
        target: OPPONENT_SLOT,
        absent_mask: 0b10,
        active_effect: 7,
    };
    pair.play_turn(b"tackle", b"growl");

    assert_eq!(
        pair.guest_sim.contexts_written,
        vec![TurnContext {
            attacker: OPPONENT_SLOT,
            target: OWN_SLOT,
            absent_mask: 0b01,
            active_effect: 7,
        }]
    );
    assert!(pair.host_sim.contexts_written.is_empty());
}

#[test]
fn triple_retransmission_injects_once() {
    let (mut guest, mut host, mut sim) = active_guest();

    for _ in 0..3 {
        host.send(host_buffer(1, b"thunderbolt"));
    }
    guest.tick(&mut sim);

    assert_eq!(sim.injections(), 1);
    assert!(sim.is_unblocked(OPPONENT_SLOT));
    assert_eq!(guest.stats().buffers_injected, 1);
    assert_eq!(guest.stats().duplicates_discarded, 2);
    // Every copy is acknowledged so the host stops resending.
    assert_eq!(acks(&host.drain()), vec![(OWN_SLOT, 1); 3]);

    let injected: Vec<_> = guest
        .events()
        .filter(|event| matches!(event, LinkEvent::BufferInjected { .. }))
        .collect();
    assert_eq!(
        injected,
        vec![LinkEvent::BufferInjected {
            slot: OPPONENT_SLOT,
            seq: 1
        }]
    );
}

#[test]
fn late_copy_after_consumption_is_not_reinjected() {
    let (mut guest, mut host, mut sim) = active_guest();

    host.send(host_buffer(1, b"surf"));
    guest.tick(&mut sim);
    assert_eq!(sim.consume(OPPONENT_SLOT), Some(b"surf".to_vec()));

    host.send(host_buffer(1, b"surf"));
    guest.tick(&mut sim);
    assert_eq!(sim.injections(), 1);
    assert!(!sim.is_unblocked(OPPONENT_SLOT));
}

#[test]
fn newer_buffer_waits_until_the_previous_one_is_consumed() {
    let (mut guest, mut host, mut sim) = active_guest();

    host.send(host_buffer(1, b"first"));
    guest.tick(&mut sim);
    host.drain();

    host.send(host_buffer(2, b"second"));
    guest.tick(&mut sim);
    assert_eq!(guest.stats().stale_discarded, 1);
    assert!(acks(&host.drain()).is_empty());
    assert!(guest.events().any(|event| event
        == LinkEvent::MessageDiscarded {
            kind: "duel_buffer_cmd",
            reason: DiscardReason::StaleBufferDelivery,
        }));

    assert_eq!(sim.consume(OPPONENT_SLOT), Some(b"first".to_vec()));
    host.send(host_buffer(2, b"second"));
    guest.tick(&mut sim);
    assert_eq!(sim.injections(), 2);
    assert_eq!(acks(&host.drain()), vec![(OWN_SLOT, 2)]);
}

#[test]
fn injected_buffer_is_rewritten_while_the_pipeline_waits() {
    let (mut guest, mut host, mut sim) = active_guest();
    let refresh = u64::from(test_config().inbound_refresh_ticks);

    host.send(host_buffer(1, b"psychic"));
    for _ in 0..refresh + 3 {
        guest.tick(&mut sim);
    }
    let writes = sim
        .writes
        .iter()
        .filter(|(slot, bytes)| *slot == OPPONENT_SLOT && bytes == b"psychic")
        .count();
    assert_eq!(writes as u64, 1 + refresh);
    assert_eq!(sim.injections(), 1);
}

#[test]
fn buffers_sent_before_go_are_applied_on_activation() {
    let relay = MemoryRelay::new();
    let mut guest = singles_controller(GUEST, HOST, false, test_config(), relay.connect(GUEST));
    let mut host = ScriptedPeer::new(&relay, HOST, GUEST);
    let mut sim = SimStub::new(&[OWN_SLOT], 0);

    for msg in ScriptedPeer::exchange(HOST) {
        host.send(msg);
    }
    host.send(Message::DuelSeed { seed: 3 });
    host.send(host_buffer(1, b"early"));
    host.send(Message::DuelReady);

    assert_eq!(guest.tick(&mut sim), Phase::Active);
    assert_eq!(sim.injections(), 1);
    assert_eq!(sim.consume(OPPONENT_SLOT), Some(b"early".to_vec()));
}

#[test]
fn buffer_for_a_slot_the_peer_does_not_control_is_dropped() {
    let (mut guest, mut host, mut sim) = active_guest();

    host.send(Message::DuelBufferCmd {
        battler_slot: OPPONENT_SLOT,
        seq: 1,
        buffer: b"spoof".to_vec(),
        turn_context: None,
    });
    guest.tick(&mut sim);

    assert_eq!(sim.injections(), 0);
    assert!(guest.events().any(|event| event
        == LinkEvent::MessageDiscarded {
            kind: "duel_buffer_cmd",
            reason: DiscardReason::UnknownSlot,
        }));
}

#[test]
fn host_ignores_turn_context_from_the_guest() {
    let relay = MemoryRelay::new();
    let mut host = singles_controller(HOST, GUEST, true, test_config(), relay.connect(HOST));
    let mut guest = ScriptedPeer::new(&relay, GUEST, HOST);
    let mut sim = SimStub::new(&[OWN_SLOT], 11);

    for msg in ScriptedPeer::exchange(GUEST) {
        guest.send(msg);
    }
    guest.send(Message::DuelReady);
    assert_eq!(host.tick(&mut sim), Phase::Active);

    guest.send(Message::DuelBufferResp {
        battler_slot: OWN_SLOT,
        seq: 1,
        buffer: b"counter".to_vec(),
        turn_context: Some(TurnContext::default()),
    });
    host.tick(&mut sim);

    assert_eq!(sim.injections(), 1);
    assert!(sim.contexts_written.is_empty());
    assert!(host.events().any(|event| event
        == LinkEvent::MessageDiscarded {
            kind: "turn_context",
            reason: DiscardReason::UnexpectedContext,
        }));
}

#[test]
fn unacknowledged_buffer_is_resent_every_tick() {
    let (mut guest, mut host, mut sim) = active_guest();

    sim.produce(OWN_SLOT, b"protect");
    for _ in 0..3 {
        guest.tick(&mut sim);
    }
    let resp = host
        .drain()
        .into_iter()
        .filter(|msg| matches!(msg, Message::DuelBufferResp { seq: 1, .. }))
        .count();
    assert_eq!(resp, 3);
    assert_eq!(guest.stats().retransmissions, 2);
    assert_eq!(guest.outstanding_buffers(), 1);

    host.send(Message::DuelBufferAck {
        battler_slot: OWN_SLOT,
        seq: 1,
    });
    guest.tick(&mut sim);
    assert_eq!(guest.outstanding_buffers(), 0);
    guest.tick(&mut sim);
    assert!(!host
        .drain()
        .iter()
        .any(|msg| matches!(msg, Message::DuelBufferResp { .. })));
}

#[test]
fn buffers_sent_in_the_wrong_direction_are_refused() {
    let (mut guest, mut host, mut sim) = active_guest();
    host.send(Message::DuelBufferResp {
        battler_slot: OWN_SLOT,
        seq: 1,
        buffer: b"reversed".to_vec(),
        turn_context: None,
    });
    guest.tick(&mut sim);
    assert_eq!(sim.injections(), 0);
    assert!(acks(&host.drain()).is_empty());
    assert!(guest.events().any(|event| event
        == LinkEvent::MessageDiscarded {
            kind: "duel_buffer_resp",
            reason: DiscardReason::WrongDirection,
        }));

    let relay = MemoryRelay::new();
    let mut host = singles_controller(HOST, GUEST, true, test_config(), relay.connect(HOST));
    let mut guest = ScriptedPeer::new(&relay, GUEST, HOST);
    let mut sim = SimStub::new(&[OWN_SLOT], 11);
    for msg in ScriptedPeer::exchange(GUEST) {
        guest.send(msg);
    }
    guest.send(Message::DuelReady);
    assert_eq!(host.tick(&mut sim), Phase::Active);

    guest.send(host_buffer(1, b"usurper"));
    host.tick(&mut sim);
    assert_eq!(sim.injections(), 0);
    assert!(host.events().any(|event| event
        == LinkEvent::MessageDiscarded {
            kind: "duel_buffer_cmd",
            reason: DiscardReason::WrongDirection,
        }));
}
