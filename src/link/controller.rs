//! The per-peer link state machine.
//!
//! A [`LinkController`] owns one [`DuelSession`] and everything that acts on it. Each call to
//! [`LinkController::tick`] runs the same pipeline:
//!
//! 1. drain the transport and dispatch every message,
//! 2. run the work of the current phase (handshake polling, buffer relay and stall checks,
//!    or forced termination),
//! 3. flush everything queued for the peer.
//!
//! Nothing inside a tick blocks. The simulation is only touched from here, once per tick.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::link::handshake::{HandshakeCoordinator, HandshakeInput};
use crate::link::outcome::{DisconnectEffect, OutcomeSynchronizer, PeerEndEffect};
use crate::link::relay::{BufferRelay, ContextHandling, InboundVerdict};
use crate::link::role::Role;
use crate::link::session::{DuelSession, Phase};
use crate::link::stall::{ForcedTermination, StallKind, StallMonitor};
use crate::network::messages::{Message, PlayerIdentity, SlotList, StageTag, TurnContext};
use crate::sessions::config::{LinkConfig, LinkTimings};
use crate::sessions::event_drain::EventDrain;
use crate::sessions::link_stats::LinkStats;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{
    report_violation_to, BattlerSlot, DiscardReason, HandshakeState, InvalidRequestKind,
    LinkError, LinkEvent, Outcome, PeerId, RelayTransport, SimulationMemory, TerminationCause,
    Tick,
};

/// Buffers and acknowledgements that may arrive before GO are held up to this many.
const MAX_HELD_MESSAGES: usize = 64;

#[derive(Debug)]
struct Termination {
    /// `false` if the session never became active, so the simulation has no match to end.
    match_started: bool,
    driver: ForcedTermination,
}

/// Everything [`LinkController::new`] needs. Assembled by the
/// [`SessionBuilder`](crate::SessionBuilder).
pub(crate) struct ControllerParts {
    pub(crate) local_peer: PeerId,
    pub(crate) remote_peer: PeerId,
    pub(crate) role: Role,
    pub(crate) roster: Vec<u8>,
    pub(crate) identity: PlayerIdentity,
    pub(crate) local_slots: SlotList,
    pub(crate) remote_slots: SlotList,
    pub(crate) config: LinkConfig,
    pub(crate) transport: Box<dyn RelayTransport>,
    pub(crate) violation_observer: Option<Arc<dyn ViolationObserver>>,
    pub(crate) event_queue_size: usize,
}

/// Drives one side of a linked duel.
///
/// Create one through [`SessionBuilder::start_session`](crate::SessionBuilder::start_session),
/// then call [`tick`](Self::tick) once per simulation step until it returns
/// [`Phase::Closed`]. Drain [`events`](Self::events) as often as convenient; the queue keeps
/// only the most recent events once it is full.
pub struct LinkController {
    session: DuelSession,
    transport: Box<dyn RelayTransport>,
    config: LinkConfig,
    timings: LinkTimings,
    local_slots: SlotList,
    remote_slots: SlotList,
    handshake: HandshakeCoordinator,
    reported_progress: u32,
    held: Vec<Message>,
    relay: Option<BufferRelay>,
    stall: StallMonitor,
    outcome: OutcomeSynchronizer,
    termination: Option<Termination>,
    peer_stage: Option<u32>,
    pending_ping: Option<(u32, Tick)>,
    outbox: Vec<Message>,
    event_queue: VecDeque<LinkEvent>,
    max_event_queue_size: usize,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
    stats: LinkStats,
    now: Tick,
}

impl std::fmt::Debug for LinkController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            session,
            transport: _,
            config,
            timings,
            local_slots,
            remote_slots,
            handshake,
            reported_progress,
            held,
            relay,
            stall,
            outcome,
            termination,
            peer_stage,
            pending_ping,
            outbox,
            event_queue,
            max_event_queue_size,
            violation_observer,
            stats,
            now,
        } = self;

        f.debug_struct("LinkController")
            .field("session", session)
            .field("config", config)
            .field("timings", timings)
            .field("local_slots", local_slots)
            .field("remote_slots", remote_slots)
            .field("handshake", handshake)
            .field("reported_progress", reported_progress)
            .field("held", &held.len())
            .field("relay", relay)
            .field("stall", stall)
            .field("outcome", outcome)
            .field("termination", termination)
            .field("peer_stage", peer_stage)
            .field("pending_ping", pending_ping)
            .field("outbox", &outbox.len())
            .field("event_queue", &event_queue.len())
            .field("max_event_queue_size", max_event_queue_size)
            .field("has_violation_observer", &violation_observer.is_some())
            .field("stats", stats)
            .field("now", now)
            .finish_non_exhaustive()
    }
}

impl LinkController {
    pub(crate) fn new(parts: ControllerParts) -> Self {
        let ControllerParts {
            local_peer,
            remote_peer,
            role,
            roster,
            identity,
            local_slots,
            remote_slots,
            config,
            transport,
            violation_observer,
            event_queue_size,
        } = parts;

        let timings = config.timings();
        let now = Tick::ZERO;
        tracing::info!(
            local = %local_peer,
            remote = %remote_peer,
            %role,
            "link session created"
        );
        let handshake =
            HandshakeCoordinator::begin(role, roster, identity, &local_slots, &remote_slots, now);

        Self {
            session: DuelSession::new(local_peer, remote_peer, role, now),
            transport,
            config,
            timings,
            local_slots,
            remote_slots,
            handshake,
            reported_progress: 0,
            held: Vec::new(),
            relay: None,
            stall: StallMonitor::new(&timings, now),
            outcome: OutcomeSynchronizer::new(role),
            termination: None,
            peer_stage: None,
            pending_ping: None,
            outbox: Vec::new(),
            event_queue: VecDeque::new(),
            max_event_queue_size: event_queue_size,
            violation_observer,
            stats: LinkStats::new(),
            now,
        }
    }

    /// Runs one step of the link and returns the phase the session is in afterwards.
    ///
    /// Call this once per simulation step. Calling it after the session closed is a no-op.
    pub fn tick<S: SimulationMemory + ?Sized>(&mut self, sim: &mut S) -> Phase {
        if self.session.is_closed() {
            return Phase::Closed;
        }
        self.now = self.now.next();

        for (from, msg) in self.transport.receive_all_messages() {
            self.handle_message(&from, msg, sim);
        }

        if self.session.phase() == Phase::Handshake {
            self.poll_handshake(sim);
        }
        if self.session.phase() == Phase::Active {
            self.poll_active(sim);
        }
        if self.session.phase() == Phase::Ending {
            self.poll_ending(sim);
        }

        self.flush();
        self.session.phase()
    }

    /// Reports the local match outcome explicitly instead of waiting for
    /// [`SimulationMemory::read_match_outcome`]. The session moves to [`Phase::Ending`] and the
    /// outcome goes out as `duel_end` on the next tick.
    ///
    /// # Errors
    /// - Returns [`InvalidRequestKind::SessionClosed`] if the session already closed.
    /// - Returns [`InvalidRequestKind::OutcomeAlreadyReported`] if an outcome was already
    ///   captured, including one mirrored from the peer or an abort.
    pub fn report_local_outcome(&mut self, outcome: Outcome) -> Result<(), LinkError> {
        if self.session.is_closed() {
            return Err(InvalidRequestKind::SessionClosed.into());
        }
        self.outcome.report_local(outcome, self.now)?;
        self.begin_termination(TerminationCause::LocalOutcome);
        Ok(())
    }

    /// Returns all events that happened since last queried for events. If the number of stored
    /// events exceeds the configured queue size, the oldest events were discarded.
    pub fn events(&mut self) -> EventDrain<'_> {
        EventDrain::from_drain(self.event_queue.drain(..))
    }

    /// The local role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.session.role()
    }

    /// The current phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.session.phase()
    }

    /// The session record.
    #[must_use]
    pub fn session(&self) -> &DuelSession {
        &self.session
    }

    /// Counters for this session.
    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    /// The last tick that ran, [`Tick::ZERO`] before the first.
    #[must_use]
    pub fn current_tick(&self) -> Tick {
        self.now
    }

    /// Handshake progress.
    #[must_use]
    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake.state()
    }

    /// The peer's identity record, once received.
    #[must_use]
    pub fn peer_identity(&self) -> Option<&PlayerIdentity> {
        self.handshake.peer_identity()
    }

    /// The local outcome, once captured. May still change on a guest while the session is
    /// ending if the host reports a contradicting result.
    #[must_use]
    pub fn local_outcome(&self) -> Option<Outcome> {
        self.outcome.local()
    }

    /// The local outcome after the session closed.
    #[must_use]
    pub fn final_outcome(&self) -> Option<Outcome> {
        if self.session.is_closed() {
            self.outcome.local()
        } else {
            None
        }
    }

    /// Why the session is ending, once it started to.
    #[must_use]
    pub fn termination_cause(&self) -> Option<TerminationCause> {
        self.termination.as_ref().map(|t| t.driver.cause())
    }

    /// The highest numeric stage the peer reported.
    #[must_use]
    pub fn peer_stage(&self) -> Option<u32> {
        self.peer_stage
    }

    /// Local buffers still waiting for the peer's acknowledgement.
    #[must_use]
    pub fn outstanding_buffers(&self) -> usize {
        self.relay.as_ref().map_or(0, BufferRelay::outstanding_count)
    }

    /// The configuration this session runs with.
    #[must_use]
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Returns the violation observer, if one was configured.
    #[must_use]
    pub fn violation_observer(&self) -> Option<&Arc<dyn ViolationObserver>> {
        self.violation_observer.as_ref()
    }

    // #################
    // #   INBOUND     #
    // #################

    fn handle_message<S: SimulationMemory + ?Sized>(
        &mut self,
        from: &PeerId,
        msg: Message,
        sim: &mut S,
    ) {
        self.stats.messages_received = self.stats.messages_received.saturating_add(1);

        // Departure notices come from the relay and are addressed by the peer they name.
        let misaddressed = match &msg {
            Message::DuelOpponentDisconnected { peer_id } => peer_id != self.session.remote_peer(),
            _ => from != self.session.remote_peer(),
        };
        if misaddressed {
            report_violation_to!(
                &self.violation_observer,
                self.now,
                ViolationSeverity::Warning,
                ViolationKind::WireProtocol,
                "{} from '{}', expected '{}'",
                msg.kind(),
                from,
                self.session.remote_peer()
            );
            self.discard(msg.kind(), DiscardReason::WrongPeer);
            return;
        }

        self.stall.note_inbound(self.now);
        tracing::trace!(kind = msg.kind(), tick = %self.now, "message received");

        match msg {
            Message::DuelParty { .. }
            | Message::DuelPlayerInfo(_)
            | Message::DuelSeed { .. }
            | Message::DuelReady => self.handle_handshake_message(&msg, sim),
            Message::DuelBufferCmd { .. }
            | Message::DuelBufferResp { .. }
            | Message::DuelBufferAck { .. } => self.handle_relay_message(msg, sim),
            Message::DuelStage { stage } => self.handle_peer_stage(stage),
            Message::DuelEnd { outcome } => self.handle_peer_end(outcome),
            Message::DuelOpponentDisconnected { .. } => self.handle_peer_disconnected(),
            Message::DuelPing { nonce } => self.outbox.push(Message::DuelPong { nonce }),
            Message::DuelPong { nonce } => self.handle_pong(nonce),
        }
    }

    fn handle_handshake_message<S: SimulationMemory + ?Sized>(
        &mut self,
        msg: &Message,
        sim: &mut S,
    ) {
        if self.session.phase() != Phase::Handshake {
            let reason = if self.handshake.has_applied(msg) {
                DiscardReason::DuplicateMessage
            } else {
                DiscardReason::NotActive
            };
            self.discard(msg.kind(), reason);
            return;
        }

        match self.handshake.on_message(msg, sim) {
            HandshakeInput::Applied(flag) => {
                tracing::debug!(?flag, tick = %self.now, "handshake step applied");
                self.note_handshake_progress();
            },
            HandshakeInput::Duplicate => {
                self.discard(msg.kind(), DiscardReason::DuplicateMessage);
            },
            HandshakeInput::Rejected(mismatch) => {
                report_violation_to!(
                    &self.violation_observer,
                    self.now,
                    ViolationSeverity::Error,
                    ViolationKind::Handshake,
                    "peer identity rejected: {}",
                    mismatch
                );
                self.begin_termination(TerminationCause::HandshakeRejected);
            },
            HandshakeInput::Unexpected => {
                report_violation_to!(
                    &self.violation_observer,
                    self.now,
                    ViolationSeverity::Warning,
                    ViolationKind::RoleAuthority,
                    "{} is not valid for a {}",
                    msg.kind(),
                    self.session.role()
                );
                self.stats.other_discarded = self.stats.other_discarded.saturating_add(1);
            },
        }
    }

    fn handle_relay_message<S: SimulationMemory + ?Sized>(&mut self, msg: Message, sim: &mut S) {
        let kind = msg.kind();
        let sender = match &msg {
            Message::DuelBufferCmd { .. } => Some(Role::Host),
            Message::DuelBufferResp { .. } => Some(Role::Guest),
            _ => None,
        };
        if sender.is_some_and(|role| role != self.session.remote_role()) {
            report_violation_to!(
                &self.violation_observer,
                self.now,
                ViolationSeverity::Warning,
                ViolationKind::RoleAuthority,
                "{} received from the {}",
                kind,
                self.session.remote_role()
            );
            self.discard(kind, DiscardReason::WrongDirection);
            return;
        }
        match self.session.phase() {
            Phase::Handshake => {
                if self.held.len() < MAX_HELD_MESSAGES {
                    tracing::trace!(kind, "holding relay message until GO");
                    self.held.push(msg);
                } else {
                    self.discard(kind, DiscardReason::NotActive);
                }
                return;
            },
            Phase::Active => {},
            Phase::Ending | Phase::Closed => {
                self.discard(kind, DiscardReason::NotActive);
                return;
            },
        }

        match msg {
            Message::DuelBufferCmd {
                battler_slot,
                seq,
                buffer,
                turn_context,
            }
            | Message::DuelBufferResp {
                battler_slot,
                seq,
                buffer,
                turn_context,
            } => self.handle_peer_buffer(kind, battler_slot, seq, &buffer, turn_context.as_ref(), sim),
            Message::DuelBufferAck { battler_slot, seq } => {
                let cleared = self
                    .relay
                    .as_mut()
                    .is_some_and(|relay| relay.on_ack(battler_slot, seq));
                if cleared {
                    self.stall.note_progress(self.now);
                }
            },
            _ => {},
        }
    }

    fn handle_peer_buffer<S: SimulationMemory + ?Sized>(
        &mut self,
        kind: &'static str,
        peer_slot: BattlerSlot,
        seq: u32,
        bytes: &[u8],
        turn_context: Option<&TurnContext>,
        sim: &mut S,
    ) {
        let now = self.now;
        let Some(relay) = self.relay.as_mut() else {
            self.discard(kind, DiscardReason::NotActive);
            return;
        };

        match relay.on_buffer(peer_slot, seq, bytes, turn_context, sim, now) {
            InboundVerdict::Injected { slot, context } => {
                self.outbox.push(Message::DuelBufferAck {
                    battler_slot: peer_slot,
                    seq,
                });
                self.stats.buffers_injected = self.stats.buffers_injected.saturating_add(1);
                self.stall.note_progress(now);
                self.push_event(LinkEvent::BufferInjected { slot, seq });
                match context {
                    ContextHandling::IgnoredFromGuest => {
                        report_violation_to!(
                            &self.violation_observer,
                            now,
                            ViolationSeverity::Warning,
                            ViolationKind::RoleAuthority,
                            "guest attached turn context to buffer {} for slot {}",
                            seq,
                            peer_slot
                        );
                        self.discard("turn_context", DiscardReason::UnexpectedContext);
                    },
                    ContextHandling::Unmappable => {
                        report_violation_to!(
                            &self.violation_observer,
                            now,
                            ViolationSeverity::Warning,
                            ViolationKind::BufferRelay,
                            "turn context with buffer {} names slots outside the layout",
                            seq
                        );
                    },
                    ContextHandling::Absent | ContextHandling::Written => {},
                }
            },
            InboundVerdict::Duplicate => {
                self.outbox.push(Message::DuelBufferAck {
                    battler_slot: peer_slot,
                    seq,
                });
                self.discard(kind, DiscardReason::DuplicateMessage);
            },
            InboundVerdict::Stale => self.discard(kind, DiscardReason::StaleBufferDelivery),
            InboundVerdict::UnknownSlot => {
                report_violation_to!(
                    &self.violation_observer,
                    now,
                    ViolationSeverity::Warning,
                    ViolationKind::BufferRelay,
                    "buffer {} for slot {} which the peer does not control",
                    seq,
                    peer_slot
                );
                self.discard(kind, DiscardReason::UnknownSlot);
            },
            InboundVerdict::Oversized => {
                report_violation_to!(
                    &self.violation_observer,
                    now,
                    ViolationSeverity::Warning,
                    ViolationKind::BufferRelay,
                    "buffer {} is {} bytes, limit is {}",
                    seq,
                    bytes.len(),
                    self.config.max_buffer_len
                );
                self.discard(kind, DiscardReason::OversizedBuffer);
            },
        }
    }

    fn handle_peer_stage(&mut self, stage: StageTag) {
        if let StageTag::Number(n) = stage {
            if self.peer_stage.is_some_and(|last| n <= last) {
                tracing::trace!(stage = n, "ignoring stage that does not advance");
                return;
            }
            self.peer_stage = Some(n);
        }
        self.push_event(LinkEvent::PeerStage { stage });
    }

    fn handle_peer_end(&mut self, peer: Outcome) {
        match self.outcome.on_peer_end(peer, self.now) {
            PeerEndEffect::Mirrored(local) => {
                tracing::info!(%peer, %local, tick = %self.now, "peer ended the match first");
                self.begin_termination(TerminationCause::PeerOutcome);
            },
            PeerEndEffect::Consistent => {
                tracing::debug!(%peer, "peer outcome agrees");
            },
            PeerEndEffect::Overridden { previous, adopted } => {
                report_violation_to!(
                    &self.violation_observer,
                    self.now,
                    ViolationSeverity::Warning,
                    ViolationKind::RoleAuthority,
                    "host reported {}; replacing local {} with {}",
                    peer,
                    previous,
                    adopted
                );
                self.push_event(LinkEvent::OutcomeDecided { outcome: adopted });
            },
            PeerEndEffect::HostKept { peer } => {
                report_violation_to!(
                    &self.violation_observer,
                    self.now,
                    ViolationSeverity::Error,
                    ViolationKind::Outcome,
                    "guest reported {}, contradicting local {}",
                    peer,
                    self.outcome.local().unwrap_or(Outcome::Aborted)
                );
            },
            PeerEndEffect::Duplicate => self.discard("duel_end", DiscardReason::DuplicateMessage),
        }
    }

    fn handle_peer_disconnected(&mut self) {
        match self.outcome.on_peer_disconnected(self.now) {
            DisconnectEffect::Aborted => {
                tracing::info!(
                    peer = %self.session.remote_peer(),
                    tick = %self.now,
                    "peer disconnected before an outcome was exchanged"
                );
                self.begin_termination(TerminationCause::PeerDisconnected);
            },
            DisconnectEffect::Stands(outcome) => {
                tracing::debug!(%outcome, "peer disconnected after the outcome was captured");
            },
        }
    }

    fn handle_pong(&mut self, nonce: u32) {
        match self.pending_ping {
            Some((pending, sent_at)) if pending == nonce => {
                let rtt = self.now.since(sent_at);
                tracing::trace!(nonce, rtt, "pong received");
                self.stats.last_ping_rtt = Some(rtt);
                self.pending_ping = None;
            },
            _ => tracing::trace!(nonce, "ignoring pong for an older ping"),
        }
    }

    // #################
    // #  PHASE WORK   #
    // #################

    fn poll_handshake<S: SimulationMemory + ?Sized>(&mut self, sim: &mut S) {
        self.handshake.poll(sim, &mut self.outbox);
        self.note_handshake_progress();

        if self.handshake.is_go() {
            self.activate(sim);
            return;
        }

        if self
            .handshake
            .is_expired(self.now, self.timings.handshake_timeout)
        {
            let idle_ticks = self.now.since(self.handshake.started_at());
            report_violation_to!(
                &self.violation_observer,
                self.now,
                ViolationSeverity::Warning,
                ViolationKind::Stall,
                "handshake incomplete after {} ticks ({}/{} steps)",
                idle_ticks,
                self.handshake.state().completed(),
                HandshakeState::TOTAL
            );
            self.push_event(LinkEvent::StallDetected {
                kind: StallKind::Handshake,
                idle_ticks,
            });
            self.begin_termination(TerminationCause::HandshakeTimeout);
        }
    }

    fn activate<S: SimulationMemory + ?Sized>(&mut self, sim: &mut S) {
        let Some(slot_map) = self.handshake.complete(sim) else {
            report_violation_to!(
                &self.violation_observer,
                self.now,
                ViolationSeverity::Critical,
                ViolationKind::InternalError,
                "handshake reached GO without a negotiated slot map"
            );
            self.begin_termination(TerminationCause::HandshakeRejected);
            return;
        };

        let role = self.session.role();
        self.relay = Some(BufferRelay::new(
            role,
            &self.local_slots,
            slot_map,
            self.timings.inbound_refresh,
            self.config.max_buffer_len,
        ));
        self.session.advance(Phase::Active, self.now);
        self.stall.restart(self.now);
        self.stats.active_since = Some(self.now);
        tracing::info!(%role, tick = %self.now, "link active");
        self.push_event(LinkEvent::Active { role });

        for msg in std::mem::take(&mut self.held) {
            self.handle_relay_message(msg, sim);
        }
    }

    fn poll_active<S: SimulationMemory + ?Sized>(&mut self, sim: &mut S) {
        let now = self.now;

        if let Some(outcome) = sim.read_match_outcome() {
            match self.outcome.report_local(outcome, now) {
                Ok(()) => {
                    self.begin_termination(TerminationCause::LocalOutcome);
                    return;
                },
                Err(kind) => tracing::trace!(%kind, "simulation outcome already captured"),
            }
        }

        let Some(relay) = self.relay.as_mut() else {
            return;
        };
        relay.refresh_inbound(sim, now);
        let captured = relay.capture(sim);
        let retransmissions = relay.transmit(&mut self.outbox);
        let round_completed = relay.take_completed_round();

        for result in captured {
            match result {
                Ok((slot, seq)) => {
                    tracing::trace!(slot = %slot, seq, "local buffer captured");
                    self.stats.buffers_captured = self.stats.buffers_captured.saturating_add(1);
                    self.stall.note_progress(now);
                },
                Err(slot) => {
                    report_violation_to!(
                        &self.violation_observer,
                        now,
                        ViolationSeverity::Warning,
                        ViolationKind::BufferRelay,
                        "generation advanced for slot {} without a readable buffer",
                        slot
                    );
                },
            }
        }
        self.stats.retransmissions = self
            .stats
            .retransmissions
            .saturating_add(u64::from(retransmissions));

        if round_completed {
            let stage = self.session.increment_stage();
            tracing::debug!(stage, tick = %now, "round completed");
            self.outbox.push(Message::DuelStage {
                stage: StageTag::Number(stage),
            });
        }

        if let Some(nonce) = self.stall.ping_due(now) {
            self.outbox.push(Message::DuelPing { nonce });
            self.stats.pings_sent = self.stats.pings_sent.saturating_add(1);
            self.pending_ping = Some((nonce, now));
        }

        if let Some((kind, idle_ticks)) = self.stall.check(self.session.phase(), now) {
            report_violation_to!(
                &self.violation_observer,
                now,
                ViolationSeverity::Warning,
                ViolationKind::Stall,
                "{} stall after {} idle ticks",
                kind,
                idle_ticks
            );
            self.push_event(LinkEvent::StallDetected { kind, idle_ticks });
            self.begin_termination(kind.cause());
        }
    }

    fn poll_ending<S: SimulationMemory + ?Sized>(&mut self, sim: &mut S) {
        let now = self.now;
        let Some(termination) = self.termination.as_mut() else {
            return;
        };

        let driver = &mut termination.driver;
        let injected = driver.inject(sim);
        self.stats.forfeit_injections = self.stats.forfeit_injections.saturating_add(injected);

        let cause = driver.cause();
        if driver.safety_expired(now, self.timings.safety_timeout) {
            report_violation_to!(
                &self.violation_observer,
                now,
                ViolationSeverity::Error,
                ViolationKind::Stall,
                "safety timeout closed a session ending with {}",
                cause
            );
            self.close(TerminationCause::SafetyTimeout);
            return;
        }

        // A locally reported outcome means the simulation already took its match-end pathway.
        let sim_done = driver.is_drained()
            && (cause == TerminationCause::LocalOutcome
                || !termination.match_started
                || sim.read_match_outcome().is_some());
        let peer_done =
            self.outcome.is_settled() || self.outcome.linger_expired(now, self.timings.linger);
        if sim_done && peer_done {
            self.close(cause);
        }
    }

    // #################
    // #  TRANSITIONS  #
    // #################

    fn note_handshake_progress(&mut self) {
        let completed = self.handshake.state().completed();
        if completed > self.reported_progress {
            self.reported_progress = completed;
            self.push_event(LinkEvent::HandshakeProgress {
                completed,
                total: HandshakeState::TOTAL,
            });
        }
    }

    fn begin_termination(&mut self, cause: TerminationCause) {
        if self.termination.is_some() || self.session.phase() >= Phase::Ending {
            return;
        }
        let now = self.now;
        self.outcome.abort(now);
        let outcome = self.outcome.local().unwrap_or(Outcome::Aborted);
        self.session.advance(Phase::Ending, now);

        let driver = if cause == TerminationCause::LocalOutcome {
            ForcedTermination::start(cause, &[], 0, now)
        } else {
            let slots = self.forfeit_slots(outcome);
            ForcedTermination::start(cause, &slots, self.timings.forfeit_repeat, now)
        };
        self.termination = Some(Termination {
            match_started: self.relay.is_some(),
            driver,
        });
        self.held.clear();

        tracing::info!(%cause, %outcome, tick = %now, "termination started");
        self.push_event(LinkEvent::TerminationStarted { cause });
        self.push_event(LinkEvent::OutcomeDecided { outcome });
    }

    /// The winner's opponent forfeits; on any other outcome the local battlers do.
    fn forfeit_slots(&self, outcome: Outcome) -> SlotList {
        match outcome {
            Outcome::Win => self.remote_slots.clone(),
            Outcome::Lose | Outcome::Draw | Outcome::Aborted => self.local_slots.clone(),
        }
    }

    fn close(&mut self, cause: TerminationCause) {
        let outcome = self.outcome.local().unwrap_or(Outcome::Aborted);
        if !self.session.advance(Phase::Closed, self.now) {
            return;
        }
        tracing::info!(
            %cause,
            %outcome,
            tick = %self.now,
            stats = %self.stats,
            "session closed"
        );
        self.push_event(LinkEvent::Closed { outcome, cause });
    }

    // #################
    // #   OUTBOUND    #
    // #################

    fn flush(&mut self) {
        if let Some(end) = self.outcome.take_end_message() {
            self.outbox.push(end);
        }
        for msg in self.outbox.drain(..) {
            self.transport.send_to(&msg, self.session.remote_peer());
            self.stats.messages_sent = self.stats.messages_sent.saturating_add(1);
        }
    }

    fn discard(&mut self, kind: &'static str, reason: DiscardReason) {
        let counter = match reason {
            DiscardReason::DuplicateMessage => &mut self.stats.duplicates_discarded,
            DiscardReason::StaleBufferDelivery => &mut self.stats.stale_discarded,
            DiscardReason::UnknownSlot
            | DiscardReason::WrongPeer
            | DiscardReason::UnexpectedContext
            | DiscardReason::NotActive
            | DiscardReason::OversizedBuffer
            | DiscardReason::WrongDirection => &mut self.stats.other_discarded,
        };
        *counter = counter.saturating_add(1);
        tracing::debug!(kind, %reason, tick = %self.now, "message discarded");
        self.push_event(LinkEvent::MessageDiscarded { kind, reason });
    }

    fn push_event(&mut self, event: LinkEvent) {
        self.event_queue.push_back(event);
        // Drop the oldest events once the queue is over capacity.
        while self.event_queue.len() > self.max_event_queue_size {
            self.event_queue.pop_front();
        }
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
    use crate::network::memory_relay::MemoryRelay;
    use crate::telemetry::CollectingObserver;
    use crate::SessionBuilder;

    #[derive(Default)]
    struct QuietSim {
        outcome: Option<Outcome>,
        forfeits: u32,
        roster: Option<Vec<u8>>,
    }

    impl SimulationMemory for QuietSim {
        fn read_outgoing_buffer(&self, _slot: BattlerSlot) -> Option<Vec<u8>> {
            None
        }
        fn write_incoming_buffer(&mut self, _slot: BattlerSlot, _bytes: &[u8]) {}
        fn read_generation(&self, _slot: BattlerSlot) -> u32 {
            0
        }
        fn read_turn_context(&self) -> TurnContext {
            TurnContext::default()
        }
        fn write_turn_context(&mut self, _context: &TurnContext) {}
        fn is_pipeline_unblocked(&self, _slot: BattlerSlot) -> bool {
            false
        }
        fn unblock_pipeline(&mut self, _slot: BattlerSlot) {}
        fn read_match_outcome(&self) -> Option<Outcome> {
            self.outcome
        }
        fn inject_forfeit(&mut self, _slot: BattlerSlot) {
            self.forfeits += 1;
            self.outcome.get_or_insert(Outcome::Lose);
        }
        fn read_rng_seed(&self) -> u32 {
            7
        }
        fn write_rng_seed(&mut self, _seed: u32) {}
        fn write_peer_roster(&mut self, roster: &[u8], _identity: &PlayerIdentity) {
            self.roster = Some(roster.to_vec());
        }
    }

    fn controller(
        relay: &MemoryRelay,
        local: &str,
        remote: &str,
        initiator: bool,
        observer: Option<Arc<CollectingObserver>>,
    ) -> LinkController {
        let mut builder = SessionBuilder::new()
            .with_local_peer(local)
            .with_remote_peer(remote)
            .as_initiator(initiator)
            .with_roster(vec![1, 2, 3])
            .with_identity(PlayerIdentity::new(local.to_uppercase(), 1))
            .with_local_slots(&[BattlerSlot::new(0)])
            .with_remote_slots(&[BattlerSlot::new(1)]);
        if let Some(observer) = observer {
            builder = builder.with_violation_observer(observer);
        }
        builder.start_session(relay.connect(local)).unwrap()
    }

    fn run_until_active(host: &mut LinkController, guest: &mut LinkController) -> (QuietSim, QuietSim) {
        let mut host_sim = QuietSim::default();
        let mut guest_sim = QuietSim::default();
        for _ in 0..10 {
            host.tick(&mut host_sim);
            guest.tick(&mut guest_sim);
        }
        (host_sim, guest_sim)
    }

    #[test]
    fn handshake_reaches_active_and_writes_rosters() {
        let relay = MemoryRelay::new();
        let mut host = controller(&relay, "red", "blue", true, None);
        let mut guest = controller(&relay, "blue", "red", false, None);
        let (host_sim, guest_sim) = run_until_active(&mut host, &mut guest);

        assert_eq!(host.phase(), Phase::Active);
        assert_eq!(guest.phase(), Phase::Active);
        assert_eq!(host_sim.roster, Some(vec![1, 2, 3]));
        assert_eq!(guest_sim.roster, Some(vec![1, 2, 3]));
        assert_eq!(guest.peer_identity().map(|p| p.name.as_str()), Some("RED"));

        let events: Vec<_> = host.events().collect();
        assert!(events.contains(&LinkEvent::Active { role: Role::Host }));
        assert!(events.contains(&LinkEvent::HandshakeProgress {
            completed: HandshakeState::TOTAL,
            total: HandshakeState::TOTAL,
        }));
    }

    #[test]
    fn messages_from_strangers_are_discarded() {
        let relay = MemoryRelay::new();
        let observer = Arc::new(CollectingObserver::new());
        let mut host = controller(&relay, "red", "blue", true, Some(observer.clone()));
        let mut stranger = relay.connect("green");
        stranger.send_to(&Message::DuelReady, &PeerId::new("red"));

        host.tick(&mut QuietSim::default());
        assert!(host.events().any(|e| e
            == LinkEvent::MessageDiscarded {
                kind: "duel_ready",
                reason: DiscardReason::WrongPeer,
            }));
        assert!(observer.has_violation(ViolationKind::WireProtocol));
        assert!(!host.handshake_state().contains(crate::HandshakeFlag::PeerReady));
    }

    #[test]
    fn disconnect_notices_are_honoured_only_for_the_remote_peer() {
        let relay = MemoryRelay::new();
        let mut host = controller(&relay, "red", "blue", true, None);
        let mut guest = controller(&relay, "blue", "red", false, None);
        let (mut host_sim, _) = run_until_active(&mut host, &mut guest);
        host.events().for_each(drop);

        let mut notifier = relay.connect("lobby");
        notifier.send_to(
            &Message::DuelOpponentDisconnected {
                peer_id: PeerId::new("green"),
            },
            &PeerId::new("red"),
        );
        host.tick(&mut host_sim);
        assert_eq!(host.phase(), Phase::Active);
        assert!(host.events().any(|e| e
            == LinkEvent::MessageDiscarded {
                kind: "duel_opponent_disconnected",
                reason: DiscardReason::WrongPeer,
            }));

        notifier.send_to(
            &Message::DuelOpponentDisconnected {
                peer_id: PeerId::new("blue"),
            },
            &PeerId::new("red"),
        );
        host.tick(&mut host_sim);
        assert_eq!(host.phase(), Phase::Ending);
        assert_eq!(
            host.termination_cause(),
            Some(TerminationCause::PeerDisconnected)
        );
        assert_eq!(host.local_outcome(), Some(Outcome::Aborted));
    }

    #[test]
    fn reporting_twice_is_rejected() {
        let relay = MemoryRelay::new();
        let mut host = controller(&relay, "red", "blue", true, None);
        host.report_local_outcome(Outcome::Win).unwrap();
        assert_eq!(host.phase(), Phase::Ending);
        assert_eq!(
            host.report_local_outcome(Outcome::Lose),
            Err(LinkError::InvalidRequest {
                kind: InvalidRequestKind::OutcomeAlreadyReported {
                    captured: Outcome::Win
                }
            })
        );
    }

    #[test]
    fn local_outcome_closes_after_linger_without_peer() {
        let relay = MemoryRelay::new();
        let mut host = controller(&relay, "red", "blue", true, None);
        let mut sim = QuietSim::default();
        host.report_local_outcome(Outcome::Draw).unwrap();

        let linger = host.config().timings().linger;
        let mut ticks = 0;
        while host.tick(&mut sim) != Phase::Closed {
            ticks += 1;
            assert!(ticks <= linger + 1, "session did not close after linger");
        }
        assert_eq!(host.final_outcome(), Some(Outcome::Draw));
        assert_eq!(sim.forfeits, 0);
        assert_eq!(
            host.report_local_outcome(Outcome::Win),
            Err(LinkError::InvalidRequest {
                kind: InvalidRequestKind::SessionClosed
            })
        );
    }

    #[test]
    fn event_queue_keeps_the_newest_events() {
        let relay = MemoryRelay::new();
        let mut host = SessionBuilder::new()
            .with_local_peer("red")
            .with_remote_peer("blue")
            .as_initiator(true)
            .with_identity(PlayerIdentity::new("RED", 1))
            .with_local_slots(&[BattlerSlot::new(0)])
            .with_remote_slots(&[BattlerSlot::new(1)])
            .with_event_queue_size(10)
            .unwrap()
            .start_session(relay.connect("red"))
            .unwrap();
        let mut stranger = relay.connect("green");
        for _ in 0..25 {
            stranger.send_to(&Message::DuelReady, &PeerId::new("red"));
        }
        host.tick(&mut QuietSim::default());
        assert_eq!(host.events().len(), 10);
        assert_eq!(host.stats().other_discarded, 25);
    }

    #[test]
    fn debug_output_omits_the_transport() {
        let relay = MemoryRelay::new();
        let host = controller(&relay, "red", "blue", true, None);
        let debug = format!("{:?}", host);
        assert!(debug.contains("LinkController"));
        assert!(debug.contains("has_violation_observer: false"));
    }
}
