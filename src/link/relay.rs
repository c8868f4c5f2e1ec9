//! Command buffer relay.
//!
//! Outbound, every local slot's generation marker is watched; when it advances, the buffer is
//! captured with `seq = generation` and re-sent every tick until the peer acknowledges it. A
//! slot that captures again before its last buffer was acknowledged queues the new one behind
//! it, so no buffer is skipped even if the peer refused the earlier one as stale.
//!
//! Inbound, every peer buffer goes through one [`SequenceLog`] check. A sequence number at or
//! below the last applied one is a duplicate (discarded, re-acknowledged). A buffer for a slot
//! whose pipeline is still unblocked is stale (discarded, not acknowledged, so the peer keeps
//! retrying). Anything else is injected: turn context first, then the bytes, then the unblock.

use std::collections::VecDeque;

use smallvec::SmallVec;

use crate::link::role::Role;
use crate::link::slot_map::SlotMap;
use crate::network::messages::{Message, TurnContext};
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::{report_violation, BattlerSlot, SimulationMemory, Tick};

/// Unacknowledged buffers kept per local slot. Past this the oldest is dropped.
pub const MAX_QUEUED_PER_SLOT: usize = 8;

/// A captured command buffer. Immutable once sent.
#[derive(Clone, PartialEq, Eq)]
pub struct CommandBuffer {
    /// Slot in the sender's numbering.
    pub slot: BattlerSlot,
    /// The sender's generation marker.
    pub seq: u32,
    /// Raw bytes.
    pub bytes: Vec<u8>,
    /// Turn context, host buffers only.
    pub turn_context: Option<TurnContext>,
}

impl CommandBuffer {
    /// Builds the wire message for a buffer sent by `role`.
    #[must_use]
    pub fn to_message(&self, role: Role) -> Message {
        match role {
            Role::Host => Message::DuelBufferCmd {
                battler_slot: self.slot,
                seq: self.seq,
                buffer: self.bytes.clone(),
                turn_context: self.turn_context,
            },
            Role::Guest => Message::DuelBufferResp {
                battler_slot: self.slot,
                seq: self.seq,
                buffer: self.bytes.clone(),
                turn_context: None,
            },
        }
    }
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            slot,
            seq,
            bytes,
            turn_context,
        } = self;

        f.debug_struct("CommandBuffer")
            .field("slot", slot)
            .field("seq", seq)
            .field("bytes", &BytesDebug(bytes))
            .field("turn_context", turn_context)
            .finish()
    }
}

struct BytesDebug<'a>(&'a [u8]);

impl std::fmt::Debug for BytesDebug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("0x")?;
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Result of checking a sequence number against the log.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SequenceVerdict {
    /// Newer than anything applied for the slot.
    Fresh,
    /// At or below the last applied sequence number.
    Duplicate {
        /// The last applied sequence number.
        last_applied: u32,
    },
}

/// Last applied sequence number per slot of the session's single peer.
///
/// ```
/// use duel_link::{BattlerSlot, SequenceLog, SequenceVerdict};
///
/// let mut log = SequenceLog::default();
/// let slot = BattlerSlot::new(1);
/// assert_eq!(log.check(slot, 1), SequenceVerdict::Fresh);
/// log.record(slot, 1);
/// assert_eq!(log.check(slot, 1), SequenceVerdict::Duplicate { last_applied: 1 });
/// assert_eq!(log.check(slot, 2), SequenceVerdict::Fresh);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceLog {
    entries: SmallVec<[(BattlerSlot, u32); 2]>,
}

impl SequenceLog {
    /// Classifies `seq` for `slot`.
    #[must_use]
    pub fn check(&self, slot: BattlerSlot, seq: u32) -> SequenceVerdict {
        match self.last_applied(slot) {
            Some(last_applied) if seq <= last_applied => {
                SequenceVerdict::Duplicate { last_applied }
            },
            _ => SequenceVerdict::Fresh,
        }
    }

    /// Records `seq` as applied for `slot`. Older values never overwrite newer ones.
    pub fn record(&mut self, slot: BattlerSlot, seq: u32) {
        match self.entries.iter_mut().find(|(s, _)| *s == slot) {
            Some((_, last)) => *last = (*last).max(seq),
            None => self.entries.push((slot, seq)),
        }
    }

    /// The last applied sequence number for `slot`, if any.
    #[must_use]
    pub fn last_applied(&self, slot: BattlerSlot) -> Option<u32> {
        self.entries
            .iter()
            .find(|(s, _)| *s == slot)
            .map(|(_, seq)| *seq)
    }
}

/// What happened to a peer buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InboundVerdict {
    /// The buffer was written and the slot unblocked.
    Injected {
        /// Local slot the buffer went into.
        slot: BattlerSlot,
        /// How the turn context was handled.
        context: ContextHandling,
    },
    /// Already applied; acknowledge again.
    Duplicate,
    /// The slot's pipeline is still unblocked; the peer will retry.
    Stale,
    /// The slot is not one the peer controls.
    UnknownSlot,
    /// The buffer is longer than allowed.
    Oversized,
}

/// What happened to the turn context attached to an injected buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ContextHandling {
    /// No context attached.
    Absent,
    /// Context remapped and written ahead of the buffer.
    Written,
    /// We host, so the guest's context was ignored.
    IgnoredFromGuest,
    /// The context names slots outside the layout and was not written.
    Unmappable,
}

#[derive(Debug, Clone)]
struct Outstanding {
    buffer: CommandBuffer,
    sends: u32,
}

#[derive(Debug, Clone)]
struct Refresh {
    slot: BattlerSlot,
    bytes: Vec<u8>,
    injected_at: Tick,
    remaining: u64,
}

/// Outbound capture and retransmission plus inbound injection for one session.
#[derive(Debug, Clone)]
pub struct BufferRelay {
    role: Role,
    slot_map: SlotMap,
    /// `(local slot, last captured generation)`.
    captured: SmallVec<[(BattlerSlot, u32); 2]>,
    /// Unacknowledged buffers per local slot, oldest first. Only the oldest is on the wire.
    outstanding: SmallVec<[VecDeque<Outstanding>; 2]>,
    log: SequenceLog,
    refresh: Vec<Refresh>,
    refresh_ticks: u64,
    max_buffer_len: usize,
    acked_since_round: bool,
    applied_since_round: bool,
}

impl BufferRelay {
    /// Creates a relay for `local_slots`. Generation markers start at 0; the first buffer a
    /// simulation produces is generation 1.
    #[must_use]
    pub fn new(
        role: Role,
        local_slots: &[BattlerSlot],
        slot_map: SlotMap,
        refresh_ticks: u64,
        max_buffer_len: usize,
    ) -> Self {
        Self {
            role,
            slot_map,
            captured: local_slots.iter().map(|slot| (*slot, 0)).collect(),
            outstanding: local_slots.iter().map(|_| VecDeque::new()).collect(),
            log: SequenceLog::default(),
            refresh: Vec::new(),
            refresh_ticks,
            max_buffer_len,
            acked_since_round: false,
            applied_since_round: false,
        }
    }

    /// The inbound sequence log.
    #[must_use]
    pub fn sequence_log(&self) -> &SequenceLog {
        &self.log
    }

    /// The negotiated slot map.
    #[must_use]
    pub fn slot_map(&self) -> &SlotMap {
        &self.slot_map
    }

    /// Number of captured buffers still waiting for an acknowledgement.
    #[must_use]
    pub fn outstanding_count(&self) -> usize {
        self.outstanding.iter().map(VecDeque::len).sum()
    }

    /// Reads every local generation marker and captures buffers that advanced.
    ///
    /// Returns the captured `(slot, seq)` pairs. A marker that advanced without a readable
    /// buffer is skipped and returned as `Err(slot)` so the caller can report it.
    pub fn capture<S: SimulationMemory + ?Sized>(
        &mut self,
        sim: &S,
    ) -> SmallVec<[Result<(BattlerSlot, u32), BattlerSlot>; 2]> {
        let mut results = SmallVec::new();
        for (index, (slot, last)) in self.captured.iter_mut().enumerate() {
            let generation = sim.read_generation(*slot);
            if generation <= *last {
                continue;
            }
            *last = generation;
            let Some(bytes) = sim.read_outgoing_buffer(*slot) else {
                results.push(Err(*slot));
                continue;
            };
            let turn_context = self.role.is_host().then(|| sim.read_turn_context());
            let Some(queue) = self.outstanding.get_mut(index) else {
                continue;
            };
            if queue.len() >= MAX_QUEUED_PER_SLOT {
                if let Some(dropped) = queue.pop_front() {
                    report_violation!(
                        ViolationSeverity::Error,
                        ViolationKind::BufferRelay,
                        "slot {} dropped unacknowledged buffer {} after {} sends",
                        slot,
                        dropped.buffer.seq,
                        dropped.sends
                    );
                }
            }
            if !queue.is_empty() {
                tracing::debug!(
                    slot = %slot,
                    seq = generation,
                    queued = queue.len(),
                    "buffer queued behind unacknowledged ones"
                );
            }
            queue.push_back(Outstanding {
                buffer: CommandBuffer {
                    slot: *slot,
                    seq: generation,
                    bytes,
                    turn_context,
                },
                sends: 0,
            });
            results.push(Ok((*slot, generation)));
        }
        results
    }

    /// Queues the oldest outstanding buffer of every slot. Later ones wait so the peer sees
    /// them in sequence order. Returns how many were retransmissions.
    pub fn transmit(&mut self, outbox: &mut Vec<Message>) -> u32 {
        let mut retransmissions = 0;
        for pending in self.outstanding.iter_mut().filter_map(VecDeque::front_mut) {
            if pending.sends > 0 {
                retransmissions += 1;
            }
            pending.sends = pending.sends.saturating_add(1);
            outbox.push(pending.buffer.to_message(self.role));
        }
        retransmissions
    }

    /// Handles an acknowledgement naming one of our slots. Clears every queued buffer up to
    /// `seq` and returns `true` if there was one.
    pub fn on_ack(&mut self, slot: BattlerSlot, seq: u32) -> bool {
        let Some(index) = self.captured.iter().position(|(s, _)| *s == slot) else {
            return false;
        };
        let Some(queue) = self.outstanding.get_mut(index) else {
            return false;
        };
        let before = queue.len();
        while queue.front().is_some_and(|pending| pending.buffer.seq <= seq) {
            queue.pop_front();
        }
        let cleared = queue.len() < before;
        if cleared {
            tracing::trace!(slot = %slot, seq, remaining = queue.len(), "buffer acknowledged");
            self.acked_since_round = true;
        }
        cleared
    }

    /// Applies a peer buffer. `peer_slot` is in the peer's numbering.
    pub fn on_buffer<S: SimulationMemory + ?Sized>(
        &mut self,
        peer_slot: BattlerSlot,
        seq: u32,
        bytes: &[u8],
        turn_context: Option<&TurnContext>,
        sim: &mut S,
        now: Tick,
    ) -> InboundVerdict {
        let Some(slot) = self.slot_map.peer_controlled_to_local(peer_slot) else {
            return InboundVerdict::UnknownSlot;
        };
        if bytes.len() > self.max_buffer_len {
            return InboundVerdict::Oversized;
        }
        if let SequenceVerdict::Duplicate { .. } = self.log.check(slot, seq) {
            return InboundVerdict::Duplicate;
        }
        if sim.is_pipeline_unblocked(slot) {
            return InboundVerdict::Stale;
        }

        let context = match (turn_context, self.role) {
            (None, _) => ContextHandling::Absent,
            (Some(_), Role::Host) => ContextHandling::IgnoredFromGuest,
            (Some(peer_context), Role::Guest) => match self.slot_map.remap_context(peer_context) {
                Some(local_context) => {
                    sim.write_turn_context(&local_context);
                    ContextHandling::Written
                },
                None => ContextHandling::Unmappable,
            },
        };
        sim.write_incoming_buffer(slot, bytes);
        sim.unblock_pipeline(slot);
        self.log.record(slot, seq);
        self.applied_since_round = true;

        self.refresh.retain(|r| r.slot != slot);
        if self.refresh_ticks > 0 {
            self.refresh.push(Refresh {
                slot,
                bytes: bytes.to_vec(),
                injected_at: now,
                remaining: self.refresh_ticks,
            });
        }
        tracing::trace!(slot = %slot, seq, ?context, "peer buffer injected");
        InboundVerdict::Injected { slot, context }
    }

    /// Re-writes recently injected buffers while their pipelines stay unblocked. Buffers
    /// injected during `now` are left alone until the next tick.
    pub fn refresh_inbound<S: SimulationMemory + ?Sized>(&mut self, sim: &mut S, now: Tick) {
        self.refresh.retain_mut(|entry| {
            if entry.injected_at >= now {
                return true;
            }
            if entry.remaining == 0 || !sim.is_pipeline_unblocked(entry.slot) {
                return false;
            }
            sim.write_incoming_buffer(entry.slot, &entry.bytes);
            entry.remaining -= 1;
            entry.remaining > 0
        });
    }

    /// Returns `true` (once) when a round has completed: every local buffer acknowledged, at
    /// least one acknowledgement and at least one peer buffer applied since the last round.
    pub fn take_completed_round(&mut self) -> bool {
        if self.acked_since_round && self.applied_since_round && self.outstanding_count() == 0 {
            self.acked_since_round = false;
            self.applied_since_round = false;
            return true;
        }
        false
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
    use crate::network::messages::PlayerIdentity;
    use crate::Outcome;

    #[derive(Default)]
    struct RelaySim {
        generation: u32,
        outgoing: Vec<u8>,
        context: TurnContext,
        unblocked: bool,
        writes: Vec<Vec<u8>>,
        contexts: Vec<TurnContext>,
        unblocks: u32,
    }

    impl SimulationMemory for RelaySim {
        fn read_outgoing_buffer(&self, _slot: BattlerSlot) -> Option<Vec<u8>> {
            (!self.outgoing.is_empty()).then(|| self.outgoing.clone())
        }
        fn write_incoming_buffer(&mut self, _slot: BattlerSlot, bytes: &[u8]) {
            self.writes.push(bytes.to_vec());
        }
        fn read_generation(&self, _slot: BattlerSlot) -> u32 {
            self.generation
        }
        fn read_turn_context(&self) -> TurnContext {
            self.context
        }
        fn write_turn_context(&mut self, context: &TurnContext) {
            self.contexts.push(*context);
        }
        fn is_pipeline_unblocked(&self, _slot: BattlerSlot) -> bool {
            self.unblocked
        }
        fn unblock_pipeline(&mut self, _slot: BattlerSlot) {
            self.unblocked = true;
            self.unblocks += 1;
        }
        fn read_match_outcome(&self) -> Option<Outcome> {
            None
        }
        fn inject_forfeit(&mut self, _slot: BattlerSlot) {}
        fn read_rng_seed(&self) -> u32 {
            0
        }
        fn write_rng_seed(&mut self, _seed: u32) {}
        fn write_peer_roster(&mut self, _roster: &[u8], _identity: &PlayerIdentity) {}
    }

    const LOCAL: [BattlerSlot; 1] = [BattlerSlot::new(0)];
    const REMOTE: [BattlerSlot; 1] = [BattlerSlot::new(1)];

    fn relay(role: Role, refresh: u64) -> BufferRelay {
        let peer = PlayerIdentity::new("BLUE", 2).with_slots(&LOCAL, &REMOTE);
        let map = SlotMap::negotiate(&LOCAL, &REMOTE, &peer).unwrap();
        BufferRelay::new(role, &LOCAL, map, refresh, 64)
    }

    #[test]
    fn capture_only_on_generation_advance() {
        let mut relay = relay(Role::Host, 0);
        let mut sim = RelaySim {
            outgoing: vec![7],
            ..RelaySim::default()
        };
        assert!(relay.capture(&sim).is_empty());

        sim.generation = 1;
        let captured = relay.capture(&sim);
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0], Ok((BattlerSlot::new(0), 1)));
        assert!(relay.capture(&sim).is_empty());
        assert_eq!(relay.outstanding_count(), 1);
    }

    #[test]
    fn host_attaches_context_and_guest_does_not() {
        let context = TurnContext {
            attacker: BattlerSlot::new(0),
            target: BattlerSlot::new(1),
            absent_mask: 0,
            active_effect: 3,
        };
        let sim = RelaySim {
            generation: 1,
            outgoing: vec![1],
            context,
            ..RelaySim::default()
        };

        let mut host = relay(Role::Host, 0);
        host.capture(&sim);
        let mut outbox = Vec::new();
        host.transmit(&mut outbox);
        assert!(matches!(
            outbox[0],
            Message::DuelBufferCmd {
                turn_context: Some(_),
                ..
            }
        ));

        let mut guest = relay(Role::Guest, 0);
        guest.capture(&sim);
        outbox.clear();
        guest.transmit(&mut outbox);
        assert!(matches!(
            outbox[0],
            Message::DuelBufferResp {
                turn_context: None,
                ..
            }
        ));
    }

    #[test]
    fn retransmits_until_acked() {
        let mut relay = relay(Role::Guest, 0);
        let sim = RelaySim {
            generation: 4,
            outgoing: vec![1],
            ..RelaySim::default()
        };
        relay.capture(&sim);
        let mut outbox = Vec::new();
        assert_eq!(relay.transmit(&mut outbox), 0);
        assert_eq!(relay.transmit(&mut outbox), 1);
        assert_eq!(outbox.len(), 2);

        assert!(!relay.on_ack(BattlerSlot::new(0), 3));
        assert!(relay.on_ack(BattlerSlot::new(0), 4));
        assert!(!relay.on_ack(BattlerSlot::new(0), 4));
        outbox.clear();
        relay.transmit(&mut outbox);
        assert!(outbox.is_empty());
    }

    #[test]
    fn later_captures_wait_behind_the_unacknowledged_one() {
        let mut relay = relay(Role::Guest, 0);
        let mut sim = RelaySim {
            generation: 1,
            outgoing: vec![1],
            ..RelaySim::default()
        };
        relay.capture(&sim);
        sim.generation = 2;
        sim.outgoing = vec![2];
        relay.capture(&sim);
        assert_eq!(relay.outstanding_count(), 2);

        let mut outbox = Vec::new();
        relay.transmit(&mut outbox);
        assert!(matches!(outbox[..], [Message::DuelBufferResp { seq: 1, .. }]));

        assert!(relay.on_ack(BattlerSlot::new(0), 1));
        outbox.clear();
        relay.transmit(&mut outbox);
        assert!(matches!(outbox[..], [Message::DuelBufferResp { seq: 2, .. }]));
        assert_eq!(relay.outstanding_count(), 1);
    }

    #[test]
    fn ack_clears_everything_up_to_its_sequence() {
        let mut relay = relay(Role::Host, 0);
        let mut sim = RelaySim {
            outgoing: vec![1],
            ..RelaySim::default()
        };
        for generation in 1..=3 {
            sim.generation = generation;
            relay.capture(&sim);
        }
        assert!(relay.on_ack(BattlerSlot::new(0), 2));
        assert_eq!(relay.outstanding_count(), 1);
        assert!(relay.on_ack(BattlerSlot::new(0), 3));
        assert_eq!(relay.outstanding_count(), 0);
    }

    #[test]
    fn queue_drops_the_oldest_past_its_limit() {
        let mut relay = relay(Role::Guest, 0);
        let mut sim = RelaySim {
            outgoing: vec![1],
            ..RelaySim::default()
        };
        for generation in 1..=(MAX_QUEUED_PER_SLOT as u32 + 2) {
            sim.generation = generation;
            relay.capture(&sim);
        }
        assert_eq!(relay.outstanding_count(), MAX_QUEUED_PER_SLOT);
        let mut outbox = Vec::new();
        relay.transmit(&mut outbox);
        assert!(matches!(outbox[..], [Message::DuelBufferResp { seq: 3, .. }]));
    }

    #[test]
    fn inbound_buffer_is_injected_once() {
        let mut relay = relay(Role::Guest, 0);
        let mut sim = RelaySim::default();
        let context = TurnContext {
            attacker: BattlerSlot::new(0),
            target: BattlerSlot::new(1),
            absent_mask: 0,
            active_effect: 0,
        };

        let verdict = relay.on_buffer(
            BattlerSlot::new(0),
            1,
            &[5, 5],
            Some(&context),
            &mut sim,
            Tick::new(1),
        );
        assert_eq!(
            verdict,
            InboundVerdict::Injected {
                slot: BattlerSlot::new(1),
                context: ContextHandling::Written,
            }
        );
        assert_eq!(sim.contexts[0].attacker, BattlerSlot::new(1));

        for _ in 0..2 {
            let again = relay.on_buffer(BattlerSlot::new(0), 1, &[5, 5], None, &mut sim, Tick::new(1));
            assert_eq!(again, InboundVerdict::Duplicate);
        }
        assert_eq!(sim.unblocks, 1);
        assert_eq!(sim.writes.len(), 1);
    }

    #[test]
    fn newer_buffer_for_unblocked_slot_is_stale() {
        let mut relay = relay(Role::Guest, 0);
        let mut sim = RelaySim::default();
        relay.on_buffer(BattlerSlot::new(0), 1, &[1], None, &mut sim, Tick::new(1));
        let verdict = relay.on_buffer(BattlerSlot::new(0), 2, &[2], None, &mut sim, Tick::new(2));
        assert_eq!(verdict, InboundVerdict::Stale);
        assert_eq!(relay.sequence_log().last_applied(BattlerSlot::new(1)), Some(1));
    }

    #[test]
    fn host_ignores_guest_context() {
        let mut relay = relay(Role::Host, 0);
        let mut sim = RelaySim::default();
        let verdict = relay.on_buffer(
            BattlerSlot::new(0),
            1,
            &[1],
            Some(&TurnContext::default()),
            &mut sim,
            Tick::new(1),
        );
        assert_eq!(
            verdict,
            InboundVerdict::Injected {
                slot: BattlerSlot::new(1),
                context: ContextHandling::IgnoredFromGuest,
            }
        );
        assert!(sim.contexts.is_empty());
    }

    #[test]
    fn unknown_and_oversized_buffers_are_refused() {
        let mut relay = relay(Role::Guest, 0);
        let mut sim = RelaySim::default();
        assert_eq!(
            relay.on_buffer(BattlerSlot::new(1), 1, &[1], None, &mut sim, Tick::new(1)),
            InboundVerdict::UnknownSlot
        );
        assert_eq!(
            relay.on_buffer(BattlerSlot::new(0), 1, &[0; 65], None, &mut sim, Tick::new(1)),
            InboundVerdict::Oversized
        );
        assert!(sim.writes.is_empty());
    }

    #[test]
    fn refresh_rewrites_without_unblocking_again() {
        let mut relay = relay(Role::Guest, 2);
        let mut sim = RelaySim::default();
        relay.on_buffer(BattlerSlot::new(0), 1, &[9], None, &mut sim, Tick::new(1));

        relay.refresh_inbound(&mut sim, Tick::new(1));
        assert_eq!(sim.writes.len(), 1);
        relay.refresh_inbound(&mut sim, Tick::new(2));
        relay.refresh_inbound(&mut sim, Tick::new(3));
        relay.refresh_inbound(&mut sim, Tick::new(4));
        assert_eq!(sim.writes.len(), 3);
        assert_eq!(sim.unblocks, 1);
    }

    #[test]
    fn refresh_stops_once_the_slot_blocks() {
        let mut relay = relay(Role::Guest, 5);
        let mut sim = RelaySim::default();
        relay.on_buffer(BattlerSlot::new(0), 1, &[9], None, &mut sim, Tick::new(1));
        sim.unblocked = false;
        relay.refresh_inbound(&mut sim, Tick::new(2));
        assert_eq!(sim.writes.len(), 1);
    }

    #[test]
    fn round_completes_after_ack_and_apply() {
        let mut relay = relay(Role::Guest, 0);
        let mut sim = RelaySim {
            generation: 1,
            outgoing: vec![1],
            ..RelaySim::default()
        };
        relay.capture(&sim);
        assert!(!relay.take_completed_round());
        relay.on_buffer(BattlerSlot::new(0), 1, &[1], None, &mut sim, Tick::new(1));
        assert!(!relay.take_completed_round());
        relay.on_ack(BattlerSlot::new(0), 1);
        assert!(relay.take_completed_round());
        assert!(!relay.take_completed_round());
    }
}
