//! Construction and validation of link sessions.

use std::sync::Arc;

use crate::{
    error::InvalidRequestKind,
    link::controller::{ControllerParts, LinkController},
    link::role::assign_role,
    network::messages::{PlayerIdentity, SlotList},
    sessions::config::LinkConfig,
    telemetry::ViolationObserver,
    BattlerSlot, LinkError, PeerId, RelayTransport,
};

/// Default event queue size.
/// Events older than this threshold may be dropped if not polled.
const DEFAULT_EVENT_QUEUE_SIZE: usize = 100;
/// Smallest event queue a session may be built with.
const MIN_EVENT_QUEUE_SIZE: usize = 10;

/// The [`SessionBuilder`] builds a [`LinkController`].
///
/// After setting all appropriate values, use [`SessionBuilder::start_session`] to consume the
/// builder and start the handshake.
#[must_use = "SessionBuilder must be consumed by calling start_session"]
pub struct SessionBuilder {
    local_peer: Option<PeerId>,
    remote_peer: Option<PeerId>,
    initiator: bool,
    roster: Vec<u8>,
    identity: Option<PlayerIdentity>,
    local_slots: SlotList,
    remote_slots: SlotList,
    config: LinkConfig,
    /// Optional observer for protocol violations.
    violation_observer: Option<Arc<dyn ViolationObserver>>,
    /// Maximum number of events to queue before oldest are dropped.
    event_queue_size: usize,
}

impl std::fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        // The compiler will error if a new field is added but not handled here.
        let Self {
            local_peer,
            remote_peer,
            initiator,
            roster,
            identity,
            local_slots,
            remote_slots,
            config,
            violation_observer,
            event_queue_size,
        } = self;

        f.debug_struct("SessionBuilder")
            .field("local_peer", local_peer)
            .field("remote_peer", remote_peer)
            .field("initiator", initiator)
            .field("roster_len", &roster.len())
            .field("identity", identity)
            .field("local_slots", local_slots)
            .field("remote_slots", remote_slots)
            .field("config", config)
            .field("has_violation_observer", &violation_observer.is_some())
            .field("event_queue_size", event_queue_size)
            .finish()
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBuilder {
    /// Construct a new builder with all values set to their defaults.
    pub fn new() -> Self {
        Self {
            local_peer: None,
            remote_peer: None,
            initiator: false,
            roster: Vec::new(),
            identity: None,
            local_slots: SlotList::new(),
            remote_slots: SlotList::new(),
            config: LinkConfig::default(),
            violation_observer: None,
            event_queue_size: DEFAULT_EVENT_QUEUE_SIZE,
        }
    }

    /// Sets the identity under which the relay knows this peer.
    pub fn with_local_peer(mut self, peer: impl Into<PeerId>) -> Self {
        self.local_peer = Some(peer.into());
        self
    }

    /// Sets the identity of the opponent. Messages from anyone else are discarded.
    pub fn with_remote_peer(mut self, peer: impl Into<PeerId>) -> Self {
        self.remote_peer = Some(peer.into());
        self
    }

    /// Marks this peer as the one that initiated the session. The initiator becomes the
    /// [`Host`](crate::Role::Host). Default is `false`.
    pub fn as_initiator(mut self, initiator: bool) -> Self {
        self.initiator = initiator;
        self
    }

    /// Sets the roster bytes sent in `duel_party`. Opaque to the link.
    pub fn with_roster(mut self, roster: Vec<u8>) -> Self {
        self.roster = roster;
        self
    }

    /// Sets the identity record sent in `duel_player_info`. Its battler slot lists are filled
    /// in from [`with_local_slots`](Self::with_local_slots) and
    /// [`with_remote_slots`](Self::with_remote_slots) when the session starts.
    pub fn with_identity(mut self, identity: PlayerIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Sets the battler slots this peer controls, in the local simulation's numbering.
    pub fn with_local_slots(mut self, slots: &[BattlerSlot]) -> Self {
        self.local_slots = slots.iter().copied().collect();
        self
    }

    /// Sets the battler slots the opponent controls, in the local simulation's numbering.
    pub fn with_remote_slots(mut self, slots: &[BattlerSlot]) -> Self {
        self.remote_slots = slots.iter().copied().collect();
        self
    }

    /// Sets the timeouts and limits of the session. Validated in
    /// [`start_session`](Self::start_session).
    ///
    /// # Example
    ///
    /// ```
    /// use duel_link::{LinkConfig, SessionBuilder};
    ///
    /// let builder = SessionBuilder::new().with_config(LinkConfig::high_latency());
    /// ```
    pub fn with_config(mut self, config: LinkConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the maximum number of events to queue before the oldest are dropped.
    ///
    /// Default: 100.
    ///
    /// # Errors
    /// - Returns [`InvalidRequest`] if the size is below 10.
    ///
    /// [`InvalidRequest`]: LinkError::InvalidRequest
    pub fn with_event_queue_size(mut self, size: usize) -> Result<Self, LinkError> {
        if size < MIN_EVENT_QUEUE_SIZE {
            return Err(InvalidRequestKind::ConfigValueOutOfRange {
                field: "event_queue_size",
                min: MIN_EVENT_QUEUE_SIZE as u64,
                max: u64::MAX,
                actual: size as u64,
            }
            .into());
        }
        self.event_queue_size = size;
        Ok(self)
    }

    /// Sets a custom observer for protocol violations.
    ///
    /// When a violation occurs during session operation (guest-originated turn context,
    /// contradicting outcomes, stalls), it will be reported to this observer. This enables
    /// programmatic monitoring, custom logging, or test assertions.
    ///
    /// If no observer is set, violations are logged via the `tracing` crate by default.
    ///
    /// # Example
    ///
    /// ```
    /// use duel_link::{SessionBuilder, telemetry::CollectingObserver};
    /// use std::sync::Arc;
    ///
    /// let observer = Arc::new(CollectingObserver::new());
    /// let builder = SessionBuilder::new().with_violation_observer(observer.clone());
    ///
    /// // After session operations, check for violations
    /// assert!(observer.violations().is_empty());
    /// ```
    pub fn with_violation_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.violation_observer = Some(observer);
        self
    }

    /// Consumes the builder to construct a [`LinkController`]. The handshake starts with the
    /// first [`tick`](LinkController::tick).
    ///
    /// # Errors
    /// - Returns [`InvalidRequest`] if a peer identity, the identity record or the local slots
    ///   are missing, if both peers share an identity, if a slot is out of range or listed
    ///   twice, or if the configuration does not validate.
    ///
    /// [`InvalidRequest`]: LinkError::InvalidRequest
    pub fn start_session(
        self,
        transport: impl RelayTransport + 'static,
    ) -> Result<LinkController, LinkError> {
        let local_peer = self
            .local_peer
            .ok_or(InvalidRequestKind::MissingField { field: "local_peer" })?;
        let remote_peer = self
            .remote_peer
            .ok_or(InvalidRequestKind::MissingField {
                field: "remote_peer",
            })?;
        if local_peer == remote_peer {
            return Err(InvalidRequestKind::SamePeer { peer: local_peer }.into());
        }
        let identity = self
            .identity
            .ok_or(InvalidRequestKind::MissingField { field: "identity" })?;
        if self.local_slots.is_empty() {
            return Err(InvalidRequestKind::MissingField {
                field: "local_slots",
            }
            .into());
        }
        if self.remote_slots.is_empty() {
            return Err(InvalidRequestKind::MissingField {
                field: "remote_slots",
            }
            .into());
        }
        validate_slots(&self.local_slots, &self.remote_slots)?;
        self.config.validate()?;

        let role = assign_role(self.initiator);
        let identity = identity.with_slots(&self.local_slots, &self.remote_slots);

        Ok(LinkController::new(ControllerParts {
            local_peer,
            remote_peer,
            role,
            roster: self.roster,
            identity,
            local_slots: self.local_slots,
            remote_slots: self.remote_slots,
            config: self.config,
            transport: Box::new(transport),
            violation_observer: self.violation_observer,
            event_queue_size: self.event_queue_size,
        }))
    }
}

/// Every slot must fit an absentee mask and appear once across both lists.
fn validate_slots(local: &[BattlerSlot], remote: &[BattlerSlot]) -> Result<(), InvalidRequestKind> {
    let mut seen = 0u8;
    for slot in local.iter().chain(remote) {
        let bit = slot
            .mask_bit()
            .ok_or(InvalidRequestKind::InvalidSlot { slot: *slot })?;
        if seen & bit != 0 {
            return Err(InvalidRequestKind::DuplicateSlot { slot: *slot });
        }
        seen |= bit;
    }
    Ok(())
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
    use crate::Role;
    use web_time::Duration;

    fn complete() -> SessionBuilder {
        SessionBuilder::new()
            .with_local_peer("red")
            .with_remote_peer("blue")
            .with_identity(PlayerIdentity::new("RED", 1))
            .with_local_slots(&[BattlerSlot::new(0)])
            .with_remote_slots(&[BattlerSlot::new(1)])
    }

    fn start(builder: SessionBuilder) -> Result<LinkController, LinkError> {
        let relay = MemoryRelay::new();
        builder.start_session(relay.connect("red"))
    }

    #[test]
    fn complete_builder_starts_a_guest_by_default() {
        let controller = start(complete()).unwrap();
        assert_eq!(controller.role(), Role::Guest);
        assert_eq!(controller.session().remote_peer(), &PeerId::new("blue"));
    }

    #[test]
    fn initiator_hosts() {
        let controller = start(complete().as_initiator(true)).unwrap();
        assert!(controller.role().is_host());
    }

    #[test]
    fn missing_fields_are_reported() {
        let err = start(SessionBuilder::new().with_remote_peer("blue")).unwrap_err();
        assert_eq!(
            err,
            LinkError::InvalidRequest {
                kind: InvalidRequestKind::MissingField { field: "local_peer" }
            }
        );

        let err = start(complete().with_local_slots(&[])).unwrap_err();
        assert_eq!(
            err,
            LinkError::InvalidRequest {
                kind: InvalidRequestKind::MissingField {
                    field: "local_slots"
                }
            }
        );
    }

    #[test]
    fn same_peer_is_rejected() {
        let err = start(complete().with_remote_peer("red")).unwrap_err();
        assert!(matches!(
            err,
            LinkError::InvalidRequest {
                kind: InvalidRequestKind::SamePeer { .. }
            }
        ));
    }

    #[test]
    fn slots_are_validated() {
        let err = start(complete().with_remote_slots(&[BattlerSlot::new(0)])).unwrap_err();
        assert_eq!(
            err,
            LinkError::InvalidRequest {
                kind: InvalidRequestKind::DuplicateSlot {
                    slot: BattlerSlot::new(0)
                }
            }
        );

        let err = start(complete().with_remote_slots(&[BattlerSlot::new(8)])).unwrap_err();
        assert_eq!(
            err,
            LinkError::InvalidRequest {
                kind: InvalidRequestKind::InvalidSlot {
                    slot: BattlerSlot::new(8)
                }
            }
        );
    }

    #[test]
    fn config_is_validated() {
        let config = LinkConfig {
            ping_interval: Duration::from_secs(10),
            ..LinkConfig::default()
        };
        assert!(start(complete().with_config(config)).is_err());
    }

    #[test]
    fn tiny_event_queue_is_rejected() {
        assert!(SessionBuilder::new().with_event_queue_size(9).is_err());
        assert!(SessionBuilder::new().with_event_queue_size(10).is_ok());
    }

    #[test]
    fn doubles_layout_starts() {
        let controller = start(
            complete()
                .with_local_slots(&[BattlerSlot::new(0), BattlerSlot::new(2)])
                .with_remote_slots(&[BattlerSlot::new(1), BattlerSlot::new(3)]),
        )
        .unwrap();
        assert_eq!(controller.session().stage(), 0);
        assert_eq!(controller.phase(), crate::Phase::Handshake);
    }

    #[test]
    fn debug_reports_observer_presence() {
        let debug = format!("{:?}", complete());
        assert!(debug.contains("SessionBuilder"));
        assert!(debug.contains("has_violation_observer: false"));
    }
}
