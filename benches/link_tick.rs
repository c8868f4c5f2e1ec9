//! Benchmarks for the per-tick link work
//!
//! Run with: cargo bench --bench link_tick
//!
//! The controller ticks once per simulation step (60 times/second by default), so an idle tick
//! and a full turn exchange are the hot paths. The codec is measured on its own because every
//! message crosses it twice.

// Allow benchmark-specific patterns
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use duel_link::network::codec::{encode_line, LineDecoder};
use duel_link::{
    BattlerSlot, LinkController, MemoryRelay, Message, Outcome, Phase, PlayerIdentity,
    SessionBuilder, SimulationMemory, TurnContext,
};
use std::hint::black_box;

const OWN: BattlerSlot = BattlerSlot::new(0);
const OPPONENT: BattlerSlot = BattlerSlot::new(1);

/// Minimal single-battler simulation.
#[derive(Default)]
struct BenchSim {
    outgoing: Option<Vec<u8>>,
    generation: u32,
    incoming: Vec<u8>,
    unblocked: bool,
}

impl BenchSim {
    fn produce(&mut self, bytes: &[u8]) {
        self.outgoing = Some(bytes.to_vec());
        self.generation = self.generation.wrapping_add(1);
    }
}

impl SimulationMemory for BenchSim {
    fn read_outgoing_buffer(&self, slot: BattlerSlot) -> Option<Vec<u8>> {
        (slot == OWN).then(|| self.outgoing.clone()).flatten()
    }

    fn write_incoming_buffer(&mut self, _slot: BattlerSlot, bytes: &[u8]) {
        self.incoming.clear();
        self.incoming.extend_from_slice(bytes);
    }

    fn read_generation(&self, _slot: BattlerSlot) -> u32 {
        self.generation
    }

    fn read_turn_context(&self) -> TurnContext {
        TurnContext::default()
    }

    fn write_turn_context(&mut self, _context: &TurnContext) {}

    fn is_pipeline_unblocked(&self, _slot: BattlerSlot) -> bool {
        self.unblocked
    }

    fn unblock_pipeline(&mut self, _slot: BattlerSlot) {
        self.unblocked = true;
    }

    fn read_match_outcome(&self) -> Option<Outcome> {
        None
    }

    fn inject_forfeit(&mut self, _slot: BattlerSlot) {}

    fn read_rng_seed(&self) -> u32 {
        0x5EED
    }

    fn write_rng_seed(&mut self, _seed: u32) {}

    fn write_peer_roster(&mut self, _roster: &[u8], _identity: &PlayerIdentity) {}
}

fn controller(relay: &MemoryRelay, local: &str, remote: &str, initiator: bool) -> LinkController {
    SessionBuilder::new()
        .with_local_peer(local)
        .with_remote_peer(remote)
        .as_initiator(initiator)
        .with_identity(PlayerIdentity::new(local.to_uppercase(), 1))
        .with_local_slots(&[OWN])
        .with_remote_slots(&[OPPONENT])
        .start_session(relay.connect(local))
        .unwrap()
}

/// An active host/guest pair over an in-process relay.
fn active_pair() -> (LinkController, BenchSim, LinkController, BenchSim) {
    let relay = MemoryRelay::new();
    let mut host = controller(&relay, "red", "blue", true);
    let mut guest = controller(&relay, "blue", "red", false);
    let mut host_sim = BenchSim::default();
    let mut guest_sim = BenchSim::default();
    while host.phase() != Phase::Active || guest.phase() != Phase::Active {
        host.tick(&mut host_sim);
        guest.tick(&mut guest_sim);
    }
    (host, host_sim, guest, guest_sim)
}

/// Benchmark idle ticking of an active pair (pings and stall checks only)
///
/// Each batch starts from a fresh pair so the relay stall never fires mid-measurement.
fn bench_idle_ticks(c: &mut Criterion) {
    const IDLE_TICKS: usize = 100;

    c.bench_function("LinkController/idle_100_ticks", |b| {
        b.iter_batched(
            active_pair,
            |(mut host, mut host_sim, mut guest, mut guest_sim)| {
                for _ in 0..IDLE_TICKS {
                    black_box(host.tick(&mut host_sim));
                    black_box(guest.tick(&mut guest_sim));
                }
                (host, guest)
            },
            BatchSize::SmallInput,
        );
    });
}

/// Benchmark a complete turn: both sides produce a buffer and tick until each is injected
fn bench_turn_exchange(c: &mut Criterion) {
    let mut group = c.benchmark_group("LinkController/turn");

    for size in [16usize, 256] {
        let payload = vec![0xA5u8; size];
        group.throughput(Throughput::Bytes(size as u64 * 2));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            let (mut host, mut host_sim, mut guest, mut guest_sim) = active_pair();
            b.iter(|| {
                host_sim.unblocked = false;
                guest_sim.unblocked = false;
                host_sim.produce(payload);
                guest_sim.produce(payload);
                while !host_sim.unblocked || !guest_sim.unblocked {
                    host.tick(&mut host_sim);
                    guest.tick(&mut guest_sim);
                }
                host.events().for_each(drop);
                guest.events().for_each(drop);
                black_box(&guest_sim.incoming);
            });
        });
    }

    group.finish();
}

/// Benchmark encoding and decoding one buffer message
fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");

    for size in [16usize, 256, 1024] {
        let msg = Message::DuelBufferCmd {
            battler_slot: OWN,
            seq: 42,
            buffer: vec![0x3Cu8; size],
            turn_context: Some(TurnContext::default()),
        };
        let line = encode_line(&msg).unwrap();
        group.throughput(Throughput::Bytes(line.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", size), &msg, |b, msg| {
            b.iter(|| black_box(encode_line(black_box(msg)).unwrap()));
        });

        group.bench_with_input(BenchmarkId::new("decode", size), &line, |b, line| {
            b.iter(|| {
                let mut decoder = LineDecoder::new();
                decoder.push(black_box(line.as_bytes()));
                black_box(decoder.next_message::<Message>().unwrap().unwrap())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_idle_ticks, bench_turn_exchange, bench_codec);
criterion_main!(benches);
