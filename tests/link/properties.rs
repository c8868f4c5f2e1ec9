//! Property-based tests for the link's pure rules.
//!
//! # Properties Tested
//!
//! - Outcome mirroring is an involution; `Draw` and `Aborted` are fixed points
//! - Outcome arbitration always leaves the guest holding the mirror of the host's result
//! - A sequence log accepts each sequence number at most once, in increasing order
//! - A stall threshold fires exactly when the idle time exceeds it, and stays fired
//! - The line decoder yields the same messages however the byte stream is split
//! - Absentee masks swap the two singles slots and drop everything else

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use duel_link::link::stall::stall_fires;
use duel_link::network::codec::{encode_line, LineDecoder};
use duel_link::{
    arbitrate_outcome, BattlerSlot, Message, Outcome, PlayerIdentity, Role, SequenceLog,
    SequenceVerdict, SlotMap, Tick,
};
use proptest::prelude::*;

// ============================================================================
// Strategies
// ============================================================================

fn outcome_strategy() -> impl Strategy<Value = Outcome> {
    prop_oneof![
        Just(Outcome::Win),
        Just(Outcome::Lose),
        Just(Outcome::Draw),
        Just(Outcome::Aborted),
    ]
}

/// Short sequences over a small range so repeats and reordering are common.
fn delivery_strategy() -> impl Strategy<Value = Vec<u32>> {
    prop::collection::vec(1u32..20, 0..60)
}

fn message_strategy() -> impl Strategy<Value = Message> {
    prop_oneof![
        Just(Message::DuelReady),
        any::<u32>().prop_map(|seed| Message::DuelSeed { seed }),
        any::<u32>().prop_map(|nonce| Message::DuelPing { nonce }),
        (0u8..4, 1u32..1000, prop::collection::vec(any::<u8>(), 0..64)).prop_map(
            |(slot, seq, buffer)| Message::DuelBufferCmd {
                battler_slot: BattlerSlot::new(slot),
                seq,
                buffer,
                turn_context: None,
            }
        ),
        outcome_strategy().prop_map(|outcome| Message::DuelEnd { outcome }),
    ]
}

// ============================================================================
// Outcome rules
// ============================================================================

proptest! {
    #[test]
    fn prop_mirroring_is_an_involution(outcome in outcome_strategy()) {
        prop_assert_eq!(outcome.mirrored().mirrored(), outcome);
        if matches!(outcome, Outcome::Draw | Outcome::Aborted) {
            prop_assert_eq!(outcome.mirrored(), outcome);
        } else {
            prop_assert_ne!(outcome.mirrored(), outcome);
        }
    }

    #[test]
    fn prop_arbitration_converges_on_the_host(
        host_local in outcome_strategy(),
        guest_local in outcome_strategy(),
    ) {
        let host_final = arbitrate_outcome(Role::Host, host_local, guest_local);
        let guest_final = arbitrate_outcome(Role::Guest, guest_local, host_local);
        prop_assert_eq!(host_final, host_local);
        prop_assert_eq!(guest_final, host_final.mirrored());
    }
}

// ============================================================================
// Sequence log
// ============================================================================

proptest! {
    #[test]
    fn prop_each_sequence_is_applied_at_most_once(deliveries in delivery_strategy()) {
        let slot = BattlerSlot::new(1);
        let mut log = SequenceLog::default();
        let mut applied = Vec::new();

        for seq in &deliveries {
            match log.check(slot, *seq) {
                SequenceVerdict::Fresh => {
                    log.record(slot, *seq);
                    applied.push(*seq);
                },
                SequenceVerdict::Duplicate { last_applied } => {
                    prop_assert!(*seq <= last_applied);
                },
            }
        }

        prop_assert!(applied.windows(2).all(|pair| pair[0] < pair[1]));
        prop_assert_eq!(log.last_applied(slot), deliveries.iter().copied().max());
    }

    #[test]
    fn prop_slots_are_tracked_independently(
        first in delivery_strategy(),
        second in delivery_strategy(),
    ) {
        let a = BattlerSlot::new(1);
        let b = BattlerSlot::new(3);
        let mut log = SequenceLog::default();
        for seq in &first {
            log.record(a, *seq);
        }
        for seq in &second {
            log.record(b, *seq);
        }
        prop_assert_eq!(log.last_applied(a), first.iter().copied().max());
        prop_assert_eq!(log.last_applied(b), second.iter().copied().max());
    }
}

// ============================================================================
// Stall thresholds
// ============================================================================

proptest! {
    #[test]
    fn prop_stall_fires_only_past_the_threshold(
        last in 0u64..10_000,
        idle in 0u64..10_000,
        threshold in 0u64..5_000,
    ) {
        let last_tick = Tick::new(last);
        let now = last_tick + idle;
        prop_assert_eq!(stall_fires(last_tick, now, threshold), idle > threshold);
        // Earliest firing tick is `last + threshold + 1`.
        prop_assert!(!stall_fires(last_tick, last_tick + threshold, threshold));
        prop_assert!(stall_fires(last_tick, last_tick + (threshold + 1), threshold));
    }

    #[test]
    fn prop_fired_stall_stays_fired(
        last in 0u64..10_000,
        threshold in 0u64..5_000,
        later in 0u64..5_000,
    ) {
        let last_tick = Tick::new(last);
        let fired = last_tick + (threshold + 1);
        prop_assert!(stall_fires(last_tick, fired + later, threshold));
    }
}

// ============================================================================
// Line codec
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_decoder_ignores_chunk_boundaries(
        messages in prop::collection::vec(message_strategy(), 1..12),
        chunk in 1usize..48,
    ) {
        let stream: Vec<u8> = messages
            .iter()
            .flat_map(|msg| encode_line(msg).unwrap().into_bytes())
            .collect();

        let mut decoder = LineDecoder::new();
        let mut decoded = Vec::new();
        for piece in stream.chunks(chunk) {
            decoder.push(piece);
            while let Some(result) = decoder.next_message::<Message>() {
                decoded.push(result.unwrap());
            }
        }
        prop_assert_eq!(decoded, messages);
        prop_assert_eq!(decoder.buffered(), 0);
    }
}

// ============================================================================
// Slot translation
// ============================================================================

proptest! {
    #[test]
    fn prop_singles_masks_swap_and_drop_unknown_bits(mask in any::<u8>()) {
        let local = [BattlerSlot::new(0)];
        let remote = [BattlerSlot::new(1)];
        let peer = PlayerIdentity::new("BLUE", 9).with_slots(&local, &remote);
        let map = SlotMap::negotiate(&local, &remote, &peer).unwrap();

        let remapped = map.remap_mask(mask);
        prop_assert_eq!(remapped & !0b11, 0);
        prop_assert_eq!(remapped & 0b01 != 0, mask & 0b10 != 0);
        prop_assert_eq!(remapped & 0b10 != 0, mask & 0b01 != 0);
        prop_assert_eq!(map.remap_mask(remapped), mask & 0b11);
    }
}
