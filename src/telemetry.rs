//! Structured reports of link anomalies.
//!
//! The controller never turns a protocol anomaly into an `Err`: it discards, ignores or
//! terminates and carries on. Each anomaly is still reported as a [`LinkViolation`] so it can
//! be logged, collected in tests or forwarded to monitoring through a [`ViolationObserver`].
//! Without a custom observer, reports go to [`TracingObserver`].
//!
//! ```
//! use std::sync::Arc;
//! use duel_link::telemetry::{CollectingObserver, ViolationKind};
//!
//! let observer = Arc::new(CollectingObserver::new());
//! // hand `observer.clone()` to SessionBuilder::with_violation_observer, run the session...
//! assert!(!observer.has_violation(ViolationKind::Handshake));
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::Tick;

/// How bad a violation is, from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    /// Recovered without side effects, e.g. a guest-supplied turn context was ignored.
    Warning,
    /// Recovered, but the session degraded, e.g. the peers disagreed about the outcome.
    Error,
    /// An internal invariant broke. The two simulations may have diverged.
    Critical,
}

impl ViolationSeverity {
    /// Returns a string representation suitable for logging.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The part of the link a violation came from.
///
/// New kinds may be added, so matches need a wildcard arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ViolationKind {
    /// EXCHANGE/READY anomalies, such as a peer slot layout that cannot be paired with ours.
    Handshake,
    /// Buffers naming unknown slots, oversized buffers, generations without a buffer.
    BufferRelay,
    /// A guest acted as host: turn context or a seed from the wrong side.
    RoleAuthority,
    /// A stall threshold or the safety timeout fired.
    Stall,
    /// The two peers reported outcomes that do not mirror each other.
    Outcome,
    /// Undecodable or misaddressed traffic.
    WireProtocol,
    /// Transport I/O failures.
    Transport,
    /// A configuration constraint was violated.
    Configuration,
    /// A bug in this crate.
    InternalError,
}

impl ViolationKind {
    /// Returns a string representation suitable for logging.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Handshake => "handshake",
            Self::BufferRelay => "buffer_relay",
            Self::RoleAuthority => "role_authority",
            Self::Stall => "stall",
            Self::Outcome => "outcome",
            Self::WireProtocol => "wire_protocol",
            Self::Transport => "transport",
            Self::Configuration => "configuration",
            Self::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reported anomaly.
///
/// ```
/// use duel_link::telemetry::{LinkViolation, ViolationKind, ViolationSeverity};
/// use duel_link::Tick;
///
/// let violation = LinkViolation::new(
///     ViolationSeverity::Warning,
///     ViolationKind::BufferRelay,
///     "buffer for a slot the peer does not control",
///     "relay.rs:42",
/// )
/// .at_tick(Tick::new(100))
/// .with_detail("slot", 7);
///
/// let json = violation.to_json().unwrap();
/// assert!(json.contains(r#""kind":"buffer_relay""#));
/// assert!(json.contains(r#""tick":100"#));
/// assert!(json.contains(r#""slot":"7""#));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct LinkViolation {
    /// How bad it is.
    pub severity: ViolationSeverity,
    /// Where it came from.
    pub kind: ViolationKind,
    /// What happened.
    pub message: String,
    /// `file:line` of the report.
    pub location: &'static str,
    /// Controller tick of the report, when known.
    pub tick: Option<Tick>,
    /// Extra key/value details.
    pub details: BTreeMap<&'static str, String>,
}

impl LinkViolation {
    /// Creates a violation without a tick or details.
    #[must_use]
    pub fn new(
        severity: ViolationSeverity,
        kind: ViolationKind,
        message: impl Into<String>,
        location: &'static str,
    ) -> Self {
        Self {
            severity,
            kind,
            message: message.into(),
            location,
            tick: None,
            details: BTreeMap::new(),
        }
    }

    /// Stamps the controller tick.
    #[must_use]
    pub fn at_tick(mut self, tick: Tick) -> Self {
        self.tick = Some(tick);
        self
    }

    /// Adds a detail. A repeated key replaces the earlier value.
    #[must_use]
    pub fn with_detail(mut self, key: &'static str, value: impl std::fmt::Display) -> Self {
        self.details.insert(key, value.to_string());
        self
    }

    /// Serializes the violation as one line of JSON.
    #[must_use]
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

impl std::fmt::Display for LinkViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}/{}] {}", self.severity, self.kind, self.message)?;
        match self.tick {
            Some(tick) => write!(f, " (tick {}, {})", tick, self.location)?,
            None => write!(f, " ({})", self.location)?,
        }
        for (key, value) in &self.details {
            write!(f, " {key}={value}")?;
        }
        Ok(())
    }
}

/// Receives violations as they are reported.
///
/// Called from inside [`LinkController::tick`](crate::LinkController::tick), so keep it quick.
///
/// ```
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use duel_link::telemetry::{LinkViolation, ViolationObserver};
///
/// #[derive(Default)]
/// struct Counter(AtomicUsize);
///
/// impl ViolationObserver for Counter {
///     fn on_violation(&self, _violation: &LinkViolation) {
///         self.0.fetch_add(1, Ordering::Relaxed);
///     }
/// }
/// ```
#[cfg(feature = "sync-send")]
pub trait ViolationObserver: Send + Sync {
    /// Handles one violation.
    fn on_violation(&self, violation: &LinkViolation);
}

/// Receives violations as they are reported.
///
/// Called from inside [`LinkController::tick`](crate::LinkController::tick), so keep it quick.
#[cfg(not(feature = "sync-send"))]
pub trait ViolationObserver {
    /// Handles one violation.
    fn on_violation(&self, violation: &LinkViolation);
}

/// Logs violations through `tracing`: warnings at `WARN`, errors and critical reports at
/// `ERROR`. Severity, kind, location, tick and details are structured fields.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ViolationObserver for TracingObserver {
    fn on_violation(&self, violation: &LinkViolation) {
        let LinkViolation {
            severity,
            kind,
            message,
            location,
            tick,
            details,
        } = violation;
        let tick = tick.map(Tick::as_u64);

        if *severity == ViolationSeverity::Warning {
            tracing::warn!(
                severity = severity.as_str(),
                kind = kind.as_str(),
                location,
                tick,
                ?details,
                "{}",
                message
            );
        } else {
            tracing::error!(
                severity = severity.as_str(),
                kind = kind.as_str(),
                location,
                tick,
                ?details,
                "{}",
                message
            );
        }
    }
}

/// Keeps every violation it sees. Meant for tests.
///
/// ```
/// use duel_link::telemetry::{
///     CollectingObserver, LinkViolation, ViolationKind, ViolationObserver, ViolationSeverity,
/// };
///
/// let observer = CollectingObserver::new();
/// observer.on_violation(&LinkViolation::new(
///     ViolationSeverity::Warning,
///     ViolationKind::RoleAuthority,
///     "guest sent a seed",
///     "handshake.rs:1",
/// ));
/// assert_eq!(observer.len(), 1);
/// assert!(observer.has_violation(ViolationKind::RoleAuthority));
/// ```
#[derive(Debug, Default)]
pub struct CollectingObserver {
    seen: Mutex<Vec<LinkViolation>>,
}

impl CollectingObserver {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of everything collected so far, oldest first.
    #[must_use]
    pub fn violations(&self) -> Vec<LinkViolation> {
        self.seen.lock().clone()
    }

    /// Number of collected violations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    /// Returns `true` if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }

    /// Returns `true` if a violation of `kind` was collected.
    #[must_use]
    pub fn has_violation(&self, kind: ViolationKind) -> bool {
        self.seen.lock().iter().any(|v| v.kind == kind)
    }

    /// Returns the highest severity collected, if any.
    #[must_use]
    pub fn worst_severity(&self) -> Option<ViolationSeverity> {
        self.seen.lock().iter().map(|v| v.severity).max()
    }

    /// Forgets everything collected so far.
    pub fn clear(&self) {
        self.seen.lock().clear();
    }
}

impl ViolationObserver for CollectingObserver {
    fn on_violation(&self, violation: &LinkViolation) {
        self.seen.lock().push(violation.clone());
    }
}

/// Delivers `violation` to `observer`, or to [`TracingObserver`] when there is none.
pub fn report_to_observer<O: ViolationObserver + ?Sized>(
    observer: Option<&Arc<O>>,
    violation: &LinkViolation,
) {
    match observer {
        Some(observer) => observer.on_violation(violation),
        None => TracingObserver.on_violation(violation),
    }
}

/// Reports a violation through [`TracingObserver`], recording the call site.
///
/// Used by code that has no session observer at hand (codec, transports).
///
/// ```
/// use duel_link::report_violation;
/// use duel_link::telemetry::{ViolationKind, ViolationSeverity};
///
/// let len = 70_000;
/// report_violation!(
///     ViolationSeverity::Warning,
///     ViolationKind::WireProtocol,
///     "dropping a {} byte line",
///     len
/// );
/// ```
#[macro_export]
macro_rules! report_violation {
    ($severity:expr, $kind:expr, $($fmt:tt)+) => {{
        use $crate::telemetry::ViolationObserver as _;
        $crate::telemetry::TracingObserver.on_violation(&$crate::telemetry::LinkViolation::new(
            $severity,
            $kind,
            format!($($fmt)+),
            concat!(file!(), ":", line!()),
        ));
    }};
}

/// Reports a violation to an `&Option<Arc<dyn ViolationObserver>>`, stamped with `tick`.
///
/// ```
/// use std::sync::Arc;
/// use duel_link::report_violation_to;
/// use duel_link::telemetry::{
///     CollectingObserver, ViolationKind, ViolationObserver, ViolationSeverity,
/// };
/// use duel_link::Tick;
///
/// let collector = Arc::new(CollectingObserver::new());
/// let observer: Option<Arc<dyn ViolationObserver>> = Some(collector.clone());
/// report_violation_to!(
///     &observer,
///     Tick::new(42),
///     ViolationSeverity::Warning,
///     ViolationKind::RoleAuthority,
///     "seed {} sent by the guest",
///     7
/// );
/// assert_eq!(collector.violations()[0].tick, Some(Tick::new(42)));
/// ```
#[macro_export]
macro_rules! report_violation_to {
    ($observer:expr, $tick:expr, $severity:expr, $kind:expr, $($fmt:tt)+) => {{
        let violation = $crate::telemetry::LinkViolation::new(
            $severity,
            $kind,
            format!($($fmt)+),
            concat!(file!(), ":", line!()),
        )
        .at_tick($tick);
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};
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

    fn warning(kind: ViolationKind) -> LinkViolation {
        LinkViolation::new(ViolationSeverity::Warning, kind, "x", "test.rs:1")
    }

    #[test]
    fn severities_are_ordered() {
        assert!(ViolationSeverity::Warning < ViolationSeverity::Error);
        assert!(ViolationSeverity::Error < ViolationSeverity::Critical);
    }

    #[test]
    fn display_includes_tick_and_details() {
        let violation = LinkViolation::new(
            ViolationSeverity::Error,
            ViolationKind::Outcome,
            "contradicting outcomes",
            "outcome.rs:10",
        )
        .at_tick(Tick::new(50))
        .with_detail("peer", "win")
        .with_detail("local", "win");

        assert_eq!(
            violation.to_string(),
            "[error/outcome] contradicting outcomes (tick 50, outcome.rs:10) local=win peer=win"
        );
    }

    #[test]
    fn json_without_tick_is_null() {
        let json = LinkViolation::new(
            ViolationSeverity::Critical,
            ViolationKind::InternalError,
            "boom",
            "test.rs:1",
        )
        .to_json()
        .unwrap();
        assert!(json.contains(r#""tick":null"#));
        assert!(json.contains(r#""severity":"critical""#));
        assert!(json.contains(r#""details":{}"#));
    }

    #[test]
    fn collector_tracks_kinds_and_severity() {
        let observer = CollectingObserver::new();
        assert!(observer.is_empty());
        assert_eq!(observer.worst_severity(), None);

        observer.on_violation(&warning(ViolationKind::Handshake));
        observer.on_violation(&LinkViolation::new(
            ViolationSeverity::Error,
            ViolationKind::Outcome,
            "y",
            "test.rs:2",
        ));

        assert_eq!(observer.len(), 2);
        assert!(observer.has_violation(ViolationKind::Handshake));
        assert!(!observer.has_violation(ViolationKind::Stall));
        assert_eq!(observer.worst_severity(), Some(ViolationSeverity::Error));

        observer.clear();
        assert!(observer.is_empty());
    }

    #[test]
    fn missing_observer_falls_back_to_tracing() {
        let observer = Arc::new(CollectingObserver::new());
        report_to_observer(Some(&observer), &warning(ViolationKind::Stall));
        report_to_observer(None::<&Arc<CollectingObserver>>, &warning(ViolationKind::Stall));
        assert_eq!(observer.len(), 1);
    }

    #[test]
    fn report_violation_to_records_call_site_and_tick() {
        let collector = Arc::new(CollectingObserver::new());
        let observer: Option<Arc<dyn ViolationObserver>> = Some(collector.clone());
        report_violation_to!(
            &observer,
            Tick::new(9),
            ViolationSeverity::Error,
            ViolationKind::Outcome,
            "peer claims {}",
            "win"
        );
        report_violation_to!(
            &observer,
            Tick::new(10),
            ViolationSeverity::Warning,
            ViolationKind::Stall,
            "no arguments"
        );

        let violations = collector.violations();
        assert_eq!(violations.len(), 2);
        assert_eq!(violations[0].tick, Some(Tick::new(9)));
        assert_eq!(violations[0].message, "peer claims win");
        assert!(violations[0].location.starts_with("src/telemetry.rs:"));
        assert_eq!(violations[1].message, "no arguments");
    }
}
