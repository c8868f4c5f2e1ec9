//! Battle simulation stub.
//!
//! `SimStub` behaves like a simulation whose command pipelines block until a peer buffer is
//! written and unblocked, and which produces one outgoing buffer per slot whenever the test
//! calls [`SimStub::produce`].

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::needless_pass_by_ref_mut,
    clippy::use_self,
    dead_code
)]

use std::collections::{BTreeMap, BTreeSet};

use duel_link::{BattlerSlot, Outcome, PlayerIdentity, SimulationMemory, TurnContext};

#[derive(Debug, Clone)]
pub struct SimStub {
    local_slots: Vec<BattlerSlot>,
    generations: BTreeMap<BattlerSlot, u32>,
    outgoing: BTreeMap<BattlerSlot, Vec<u8>>,
    unblocked: BTreeSet<BattlerSlot>,
    /// Every `write_incoming_buffer` call, refreshes included.
    pub writes: Vec<(BattlerSlot, Vec<u8>)>,
    /// Every `unblock_pipeline` call.
    pub unblocks: Vec<BattlerSlot>,
    /// Every turn context written by the controller.
    pub contexts_written: Vec<TurnContext>,
    /// What `read_turn_context` returns.
    pub turn_context: TurnContext,
    pub outcome: Option<Outcome>,
    pub forfeits: Vec<BattlerSlot>,
    /// Whether a forfeit ends the match in the simulation.
    pub finish_on_forfeit: bool,
    pub seed: u32,
    pub peer_roster: Option<(Vec<u8>, PlayerIdentity)>,
}

impl SimStub {
    #[must_use]
    pub fn new(local_slots: &[BattlerSlot], seed: u32) -> Self {
        Self {
            local_slots: local_slots.to_vec(),
            generations: BTreeMap::new(),
            outgoing: BTreeMap::new(),
            unblocked: BTreeSet::new(),
            writes: Vec::new(),
            unblocks: Vec::new(),
            contexts_written: Vec::new(),
            turn_context: TurnContext::default(),
            outcome: None,
            forfeits: Vec::new(),
            finish_on_forfeit: true,
            seed,
            peer_roster: None,
        }
    }

    /// Produces a new outgoing buffer for `slot`, advancing its generation marker.
    pub fn produce(&mut self, slot: BattlerSlot, bytes: &[u8]) -> u32 {
        let generation = self.generations.entry(slot).or_insert(0);
        *generation += 1;
        self.outgoing.insert(slot, bytes.to_vec());
        *generation
    }

    /// Consumes the injected buffer for `slot`, blocking its pipeline again.
    pub fn consume(&mut self, slot: BattlerSlot) -> Option<Vec<u8>> {
        if !self.unblocked.remove(&slot) {
            return None;
        }
        self.writes
            .iter()
            .rev()
            .find(|(s, _)| *s == slot)
            .map(|(_, bytes)| bytes.clone())
    }

    #[must_use]
    pub fn is_unblocked(&self, slot: BattlerSlot) -> bool {
        self.unblocked.contains(&slot)
    }

    /// Number of peer buffers that actually unblocked a pipeline.
    #[must_use]
    pub fn injections(&self) -> usize {
        self.unblocks.len()
    }

    pub fn finish(&mut self, outcome: Outcome) {
        self.outcome = Some(outcome);
    }
}

impl SimulationMemory for SimStub {
    fn read_outgoing_buffer(&self, slot: BattlerSlot) -> Option<Vec<u8>> {
        self.outgoing.get(&slot).cloned()
    }

    fn write_incoming_buffer(&mut self, slot: BattlerSlot, bytes: &[u8]) {
        self.writes.push((slot, bytes.to_vec()));
    }

    fn read_generation(&self, slot: BattlerSlot) -> u32 {
        self.generations.get(&slot).copied().unwrap_or(0)
    }

    fn read_turn_context(&self) -> TurnContext {
        self.turn_context
    }

    fn write_turn_context(&mut self, context: &TurnContext) {
        self.contexts_written.push(*context);
    }

    fn is_pipeline_unblocked(&self, slot: BattlerSlot) -> bool {
        self.unblocked.contains(&slot)
    }

    fn unblock_pipeline(&mut self, slot: BattlerSlot) {
        self.unblocked.insert(slot);
        self.unblocks.push(slot);
    }

    fn read_match_outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    fn inject_forfeit(&mut self, slot: BattlerSlot) {
        self.forfeits.push(slot);
        if self.finish_on_forfeit && self.outcome.is_none() {
            let outcome = if self.local_slots.contains(&slot) {
                Outcome::Lose
            } else {
                Outcome::Win
            };
            self.outcome = Some(outcome);
        }
    }

    fn read_rng_seed(&self) -> u32 {
        self.seed
    }

    fn write_rng_seed(&mut self, seed: u32) {
        self.seed = seed;
    }

    fn write_peer_roster(&mut self, roster: &[u8], identity: &PlayerIdentity) {
        self.peer_roster = Some((roster.to_vec(), identity.clone()));
    }
}
