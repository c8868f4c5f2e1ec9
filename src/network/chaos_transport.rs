//! A relay transport wrapper for fault injection testing.
//!
//! [`ChaosTransport`] wraps any [`RelayTransport`] and degrades it: inbound messages are held
//! back for a number of receive polls, outbound messages may be duplicated or lost, and the
//! link can go silent after a given number of polls. Delays are counted in receive polls rather
//! than wall time, so a controller ticking once per poll sees the same schedule on every run.
//!
//! Delayed messages keep their relative order. Latency and duplication stay within the
//! transport contract (in-order, unbounded latency); loss and silence deliberately break it
//! to exercise retransmission and stall detection.
//!
//! # Example
//!
//! ```
//! use duel_link::{ChaosConfig, ChaosTransport, MemoryRelay, Message, PeerId, RelayTransport};
//!
//! let relay = MemoryRelay::new();
//! let mut red = relay.connect("red");
//! let mut blue = ChaosTransport::new(relay.connect("blue"), ChaosConfig::delayed(2));
//!
//! red.send_to(&Message::DuelReady, &PeerId::new("blue"));
//! assert!(blue.receive_all_messages().is_empty());
//! assert!(blue.receive_all_messages().is_empty());
//! assert_eq!(blue.receive_all_messages().len(), 1);
//! ```

use std::collections::VecDeque;

use crate::network::messages::Message;
use crate::rng::FaultRng;
use crate::{PeerId, RelayTransport};

/// Configuration for [`ChaosTransport`].
///
/// All counts default to zero and all rates to 0.0 (no effect).
#[derive(Debug, Clone, PartialEq)]
pub struct ChaosConfig {
    /// Receive polls every inbound message is held back (default: 0).
    pub latency_polls: u32,

    /// Extra random delay, uniform in `0..=jitter_polls` (default: 0).
    /// Jitter never reorders messages.
    pub jitter_polls: u32,

    /// Probability of sending an outbound message twice (0.0 - 1.0).
    pub duplication_rate: f64,

    /// Probability of dropping an outbound message (0.0 - 1.0).
    pub send_loss_rate: f64,

    /// Probability of dropping an inbound message (0.0 - 1.0).
    pub receive_loss_rate: f64,

    /// After this many receive polls the link drops everything in both directions.
    pub silent_after_polls: Option<u64>,

    /// Seed for the fault schedule.
    pub seed: u64,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            latency_polls: 0,
            jitter_polls: 0,
            duplication_rate: 0.0,
            send_loss_rate: 0.0,
            receive_loss_rate: 0.0,
            silent_after_polls: None,
            seed: 0,
        }
    }
}

impl ChaosConfig {
    /// No faults at all.
    #[must_use]
    pub fn passthrough() -> Self {
        Self::default()
    }

    /// Constant inbound delay.
    #[must_use]
    pub fn delayed(latency_polls: u32) -> Self {
        Self {
            latency_polls,
            ..Self::default()
        }
    }

    /// Inbound delay with jitter.
    #[must_use]
    pub fn jittery(latency_polls: u32, jitter_polls: u32) -> Self {
        Self {
            latency_polls,
            jitter_polls,
            ..Self::default()
        }
    }

    /// Duplicates outbound messages with the given probability.
    #[must_use]
    pub fn duplicating(rate: f64) -> Self {
        Self {
            duplication_rate: rate,
            ..Self::default()
        }
    }

    /// Drops messages in both directions with the given probability.
    #[must_use]
    pub fn lossy(rate: f64) -> Self {
        Self {
            send_loss_rate: rate,
            receive_loss_rate: rate,
            ..Self::default()
        }
    }

    /// Works normally for `polls` receive polls, then goes silent.
    #[must_use]
    pub fn silent_after(polls: u64) -> Self {
        Self {
            silent_after_polls: Some(polls),
            ..Self::default()
        }
    }

    /// A relay that is slow and unreliable but never drops anything.
    #[must_use]
    pub fn congested() -> Self {
        Self {
            latency_polls: 3,
            jitter_polls: 4,
            duplication_rate: 0.2,
            ..Self::default()
        }
    }

    /// Returns this config with a different seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Counters kept by a [`ChaosTransport`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChaosStats {
    /// Messages handed to `send_to`.
    pub messages_sent: u64,
    /// Outbound messages dropped.
    pub messages_dropped_send: u64,
    /// Outbound messages sent twice.
    pub messages_duplicated: u64,
    /// Messages delivered by `receive_all_messages`.
    pub messages_received: u64,
    /// Inbound messages dropped.
    pub messages_dropped_receive: u64,
    /// Messages swallowed while the link was silent.
    pub messages_silenced: u64,
}

#[derive(Debug)]
struct InFlight {
    from: PeerId,
    msg: Message,
    deliver_at: u64,
}

/// A transport wrapper that injects configurable relay faults.
///
/// When the `sync-send` feature is enabled, `ChaosTransport` implements the
/// `Send + Sync` flavour of [`RelayTransport`] if the inner transport does.
#[derive(Debug)]
pub struct ChaosTransport<T> {
    inner: T,
    config: ChaosConfig,
    rng: FaultRng,
    polls: u64,
    in_flight: VecDeque<InFlight>,
    stats: ChaosStats,
}

impl<T: RelayTransport> ChaosTransport<T> {
    /// Wraps `inner` using `config`.
    pub fn new(inner: T, config: ChaosConfig) -> Self {
        Self {
            inner,
            rng: FaultRng::seeded(config.seed),
            config,
            polls: 0,
            in_flight: VecDeque::new(),
            stats: ChaosStats::default(),
        }
    }

    /// Returns a reference to the inner transport.
    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Returns a mutable reference to the inner transport.
    pub fn inner_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consumes the wrapper. Messages still in flight are lost.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Returns the current configuration.
    pub fn config(&self) -> &ChaosConfig {
        &self.config
    }

    /// Replaces the configuration. The fault schedule keeps its current state.
    pub fn set_config(&mut self, config: ChaosConfig) {
        self.config = config;
    }

    /// Returns the fault counters.
    pub fn stats(&self) -> ChaosStats {
        self.stats
    }

    /// Resets the fault counters.
    pub fn reset_stats(&mut self) {
        self.stats = ChaosStats::default();
    }

    /// Number of inbound messages held back.
    pub fn messages_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn is_silent(&self) -> bool {
        self.config
            .silent_after_polls
            .is_some_and(|limit| self.polls >= limit)
    }

    fn roll(&mut self, rate: f64) -> bool {
        self.rng.chance(rate)
    }

    fn delivery_poll(&mut self) -> u64 {
        let jitter = if self.config.jitter_polls > 0 {
            self.rng.up_to(self.config.jitter_polls)
        } else {
            0
        };
        let due = self
            .polls
            .saturating_add(u64::from(self.config.latency_polls))
            .saturating_add(u64::from(jitter));
        // Never overtake a message queued earlier.
        self.in_flight
            .back()
            .map_or(due, |last| due.max(last.deliver_at))
    }

    fn chaos_send(&mut self, msg: &Message, peer: &PeerId) {
        self.stats.messages_sent += 1;
        if self.is_silent() {
            self.stats.messages_silenced += 1;
            return;
        }
        if self.roll(self.config.send_loss_rate) {
            self.stats.messages_dropped_send += 1;
            tracing::trace!(kind = msg.kind(), "chaos dropped outbound message");
            return;
        }
        self.inner.send_to(msg, peer);
        if self.roll(self.config.duplication_rate) {
            self.stats.messages_duplicated += 1;
            self.inner.send_to(msg, peer);
        }
    }

    fn chaos_receive(&mut self) -> Vec<(PeerId, Message)> {
        let incoming = self.inner.receive_all_messages();
        if self.is_silent() {
            self.polls += 1;
            self.stats.messages_silenced += (incoming.len() + self.in_flight.len()) as u64;
            self.in_flight.clear();
            return Vec::new();
        }

        for (from, msg) in incoming {
            if self.roll(self.config.receive_loss_rate) {
                self.stats.messages_dropped_receive += 1;
                continue;
            }
            let deliver_at = self.delivery_poll();
            self.in_flight.push_back(InFlight {
                from,
                msg,
                deliver_at,
            });
        }

        let mut ready = Vec::new();
        while self
            .in_flight
            .front()
            .is_some_and(|next| next.deliver_at <= self.polls)
        {
            if let Some(next) = self.in_flight.pop_front() {
                ready.push((next.from, next.msg));
            }
        }
        self.polls += 1;
        self.stats.messages_received += ready.len() as u64;
        ready
    }
}

#[cfg(feature = "sync-send")]
impl<T> RelayTransport for ChaosTransport<T>
where
    T: RelayTransport + Send + Sync,
{
    fn send_to(&mut self, msg: &Message, peer: &PeerId) {
        self.chaos_send(msg, peer);
    }

    fn receive_all_messages(&mut self) -> Vec<(PeerId, Message)> {
        self.chaos_receive()
    }
}

#[cfg(not(feature = "sync-send"))]
impl<T> RelayTransport for ChaosTransport<T>
where
    T: RelayTransport,
{
    fn send_to(&mut self, msg: &Message, peer: &PeerId) {
        self.chaos_send(msg, peer);
    }

    fn receive_all_messages(&mut self) -> Vec<(PeerId, Message)> {
        self.chaos_receive()
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

    /// Records sends and hands out queued messages on receive.
    #[derive(Default)]
    struct RecordingTransport {
        sent: Vec<(PeerId, Message)>,
        inbound: Vec<(PeerId, Message)>,
    }

    impl RelayTransport for RecordingTransport {
        fn send_to(&mut self, msg: &Message, peer: &PeerId) {
            self.sent.push((peer.clone(), msg.clone()));
        }

        fn receive_all_messages(&mut self) -> Vec<(PeerId, Message)> {
            std::mem::take(&mut self.inbound)
        }
    }

    fn ping(nonce: u32) -> (PeerId, Message) {
        (PeerId::new("red"), Message::DuelPing { nonce })
    }

    fn nonces(messages: &[(PeerId, Message)]) -> Vec<u32> {
        messages
            .iter()
            .map(|(_, msg)| match msg {
                Message::DuelPing { nonce } => *nonce,
                other => panic!("unexpected {:?}", other),
            })
            .collect()
    }

    #[test]
    fn passthrough_changes_nothing() {
        let mut chaos = ChaosTransport::new(RecordingTransport::default(), ChaosConfig::passthrough());
        chaos.inner_mut().inbound.push(ping(1));
        assert_eq!(nonces(&chaos.receive_all_messages()), [1]);

        chaos.send_to(&Message::DuelReady, &PeerId::new("red"));
        assert_eq!(chaos.inner().sent.len(), 1);
        assert_eq!(chaos.stats().messages_sent, 1);
        assert_eq!(chaos.stats().messages_received, 1);
    }

    #[test]
    fn jitter_never_reorders() {
        let config = ChaosConfig::jittery(1, 5).with_seed(7);
        let mut chaos = ChaosTransport::new(RecordingTransport::default(), config);
        let mut delivered = Vec::new();
        for nonce in 0..40 {
            chaos.inner_mut().inbound.push(ping(nonce));
            delivered.extend(nonces(&chaos.receive_all_messages()));
        }
        for _ in 0..10 {
            delivered.extend(nonces(&chaos.receive_all_messages()));
        }
        assert_eq!(delivered, (0..40).collect::<Vec<_>>());
        assert_eq!(chaos.messages_in_flight(), 0);
    }

    #[test]
    fn full_duplication_sends_everything_twice() {
        let mut chaos =
            ChaosTransport::new(RecordingTransport::default(), ChaosConfig::duplicating(1.0));
        chaos.send_to(&Message::DuelReady, &PeerId::new("red"));
        assert_eq!(chaos.inner().sent.len(), 2);
        assert_eq!(chaos.stats().messages_duplicated, 1);
    }

    #[test]
    fn silence_swallows_both_directions() {
        let mut chaos =
            ChaosTransport::new(RecordingTransport::default(), ChaosConfig::silent_after(1));
        chaos.inner_mut().inbound.push(ping(1));
        assert_eq!(chaos.receive_all_messages().len(), 1);

        chaos.inner_mut().inbound.push(ping(2));
        assert!(chaos.receive_all_messages().is_empty());
        chaos.send_to(&Message::DuelReady, &PeerId::new("red"));
        assert!(chaos.inner().sent.is_empty());
        assert_eq!(chaos.stats().messages_silenced, 2);
    }

    #[test]
    fn same_seed_same_schedule() {
        let run = |seed| {
            let config = ChaosConfig::lossy(0.5).with_seed(seed);
            let mut chaos = ChaosTransport::new(RecordingTransport::default(), config);
            for nonce in 0..64 {
                chaos.send_to(&Message::DuelPing { nonce }, &PeerId::new("red"));
            }
            chaos.into_inner().sent
        };
        assert_eq!(run(3), run(3));
    }
}
