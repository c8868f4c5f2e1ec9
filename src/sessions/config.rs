//! Configuration for link sessions.
//!
//! All deadlines are configured as wall-clock [`Duration`]s and converted once into ticks with
//! [`LinkConfig::tick_rate`]. The controller itself only ever compares tick counts.
//!
//! # Example
//!
//! ```
//! use duel_link::LinkConfig;
//! use web_time::Duration;
//!
//! // Players on a slow relay: give them more room before the stall monitor fires
//! let config = LinkConfig {
//!     relay_timeout: Duration::from_secs(20),
//!     liveness_timeout: Duration::from_secs(30),
//!     ..LinkConfig::default()
//! };
//! assert!(config.validate().is_ok());
//!
//! let timings = config.timings();
//! assert_eq!(timings.relay_timeout, 1200);
//! ```

use web_time::Duration;

use crate::error::{InvalidRequestKind, LinkError};

/// Timeouts and repetition counts for a link session.
///
/// # Example
///
/// ```
/// use duel_link::LinkConfig;
/// use web_time::Duration;
///
/// // A simulation stepping at 30 Hz
/// let config = LinkConfig {
///     tick_rate: 30,
///     ..LinkConfig::default()
/// };
/// assert_eq!(config.timings().ping_interval, 30);
///
/// // Presets cover the common cases
/// let lan = LinkConfig::lan();
/// assert!(lan.relay_timeout < LinkConfig::default().relay_timeout);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "LinkConfig has no effect unless passed to SessionBuilder::with_config()"]
pub struct LinkConfig {
    /// Number of [`tick`](crate::LinkController::tick) calls per second.
    ///
    /// Default: 60
    pub tick_rate: u32,

    /// How long the peer may take to complete EXCHANGE and READY.
    ///
    /// Default: 12s
    pub handshake_timeout: Duration,

    /// How long the session may go without relay progress while active. Progress is a newly
    /// captured local buffer, an injected peer buffer or a received acknowledgement.
    ///
    /// Default: 10s
    pub relay_timeout: Duration,

    /// How long the session may go without any inbound message.
    ///
    /// Default: 15s
    pub liveness_timeout: Duration,

    /// Interval between `duel_ping` messages.
    ///
    /// Default: 1s
    pub ping_interval: Duration,

    /// Number of ticks a forfeit command is injected after forced termination starts.
    ///
    /// Default: 30
    pub forfeit_repeat_ticks: u32,

    /// Hard limit on the `Ending` phase. When it expires the session closes no matter what the
    /// simulation is doing.
    ///
    /// Default: 60s
    pub safety_timeout: Duration,

    /// Number of ticks an injected peer buffer is re-written into the inbound slot while the
    /// pipeline stays unblocked. 0 writes it exactly once.
    ///
    /// Default: 3
    pub inbound_refresh_ticks: u32,

    /// How long to wait for the peer's outcome after the local one is known.
    ///
    /// Default: 1s
    pub linger: Duration,

    /// Largest command buffer accepted from the peer, in bytes.
    ///
    /// Default: 512
    pub max_buffer_len: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            tick_rate: 60,
            handshake_timeout: Duration::from_secs(12),
            relay_timeout: Duration::from_secs(10),
            liveness_timeout: Duration::from_secs(15),
            ping_interval: Duration::from_secs(1),
            forfeit_repeat_ticks: 30,
            safety_timeout: Duration::from_secs(60),
            inbound_refresh_ticks: 3,
            linger: Duration::from_secs(1),
            max_buffer_len: 512,
        }
    }
}

impl LinkConfig {
    /// Creates a new `LinkConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration preset for peers on the same local network.
    ///
    /// Detects dead peers quickly and closes faster.
    pub fn lan() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(6),
            relay_timeout: Duration::from_secs(5),
            liveness_timeout: Duration::from_secs(6),
            ping_interval: Duration::from_millis(500),
            safety_timeout: Duration::from_secs(20),
            linger: Duration::from_millis(500),
            ..Self::default()
        }
    }

    /// Configuration preset for relays with high or variable latency.
    pub fn high_latency() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            relay_timeout: Duration::from_secs(20),
            liveness_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(2),
            safety_timeout: Duration::from_secs(120),
            inbound_refresh_ticks: 6,
            linger: Duration::from_secs(3),
            ..Self::default()
        }
    }

    /// Configuration preset for players who take a long time to pick their commands.
    ///
    /// The relay timeout covers the time a human spends on the command menu, so it is
    /// stretched the most. Liveness stays tight so a vanished peer is still caught.
    pub fn patient() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(60),
            relay_timeout: Duration::from_secs(90),
            liveness_timeout: Duration::from_secs(30),
            safety_timeout: Duration::from_secs(180),
            ..Self::default()
        }
    }

    /// Configuration preset for tests and bots: short timeouts everywhere.
    pub fn strict() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            relay_timeout: Duration::from_secs(3),
            liveness_timeout: Duration::from_secs(4),
            ping_interval: Duration::from_millis(250),
            forfeit_repeat_ticks: 15,
            safety_timeout: Duration::from_secs(10),
            linger: Duration::from_millis(250),
            ..Self::default()
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `LinkError::InvalidRequest` if any value is out of range, or if
    /// `liveness_timeout` is shorter than two ping intervals, or if the safety timeout does
    /// not leave room for all forfeit repetitions.
    pub fn validate(&self) -> Result<(), LinkError> {
        check_range("tick_rate", u64::from(self.tick_rate), 1, 1000)?;
        check_duration("handshake_timeout", self.handshake_timeout, 100, 600_000)?;
        check_duration("relay_timeout", self.relay_timeout, 100, 600_000)?;
        check_duration("liveness_timeout", self.liveness_timeout, 100, 600_000)?;
        check_duration("ping_interval", self.ping_interval, 10, 60_000)?;
        check_range(
            "forfeit_repeat_ticks",
            u64::from(self.forfeit_repeat_ticks),
            1,
            10_000,
        )?;
        check_duration("safety_timeout", self.safety_timeout, 1_000, 3_600_000)?;
        check_range(
            "inbound_refresh_ticks",
            u64::from(self.inbound_refresh_ticks),
            0,
            1_000,
        )?;
        check_duration("linger", self.linger, 0, 60_000)?;
        check_range("max_buffer_len", self.max_buffer_len as u64, 1, 65_536)?;

        if self.liveness_timeout < self.ping_interval.saturating_mul(2) {
            return Err(InvalidRequestKind::InconsistentConfig {
                field: "liveness_timeout",
                constraint: "must be at least twice ping_interval",
            }
            .into());
        }

        let timings = self.timings();
        if timings.safety_timeout <= u64::from(self.forfeit_repeat_ticks) {
            return Err(InvalidRequestKind::InconsistentConfig {
                field: "safety_timeout",
                constraint: "must span more ticks than forfeit_repeat_ticks",
            }
            .into());
        }

        Ok(())
    }

    /// Converts every deadline into ticks at [`tick_rate`](Self::tick_rate).
    ///
    /// Conversions round up, and every deadline except `linger` is at least one tick.
    #[must_use]
    pub fn timings(&self) -> LinkTimings {
        let rate = self.tick_rate.max(1);
        LinkTimings {
            handshake_timeout: to_ticks(self.handshake_timeout, rate).max(1),
            relay_timeout: to_ticks(self.relay_timeout, rate).max(1),
            liveness_timeout: to_ticks(self.liveness_timeout, rate).max(1),
            ping_interval: to_ticks(self.ping_interval, rate).max(1),
            forfeit_repeat: u64::from(self.forfeit_repeat_ticks),
            safety_timeout: to_ticks(self.safety_timeout, rate).max(1),
            inbound_refresh: u64::from(self.inbound_refresh_ticks),
            linger: to_ticks(self.linger, rate),
        }
    }
}

/// A [`LinkConfig`] with every deadline expressed in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTimings {
    /// Handshake window.
    pub handshake_timeout: u64,
    /// Relay stall threshold.
    pub relay_timeout: u64,
    /// Liveness threshold.
    pub liveness_timeout: u64,
    /// Ticks between pings.
    pub ping_interval: u64,
    /// Ticks of forfeit injection.
    pub forfeit_repeat: u64,
    /// Ticks before a forced close.
    pub safety_timeout: u64,
    /// Ticks of inbound re-writes after an injection.
    pub inbound_refresh: u64,
    /// Ticks to wait for the peer outcome.
    pub linger: u64,
}

fn to_ticks(duration: Duration, tick_rate: u32) -> u64 {
    let millis = duration.as_millis().saturating_mul(u128::from(tick_rate));
    let ticks = millis.div_ceil(1000);
    u64::try_from(ticks).unwrap_or(u64::MAX)
}

fn check_duration(
    field: &'static str,
    value: Duration,
    min_ms: u64,
    max_ms: u64,
) -> Result<(), LinkError> {
    let actual_ms = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
    if actual_ms < min_ms || actual_ms > max_ms {
        return Err(InvalidRequestKind::DurationConfigOutOfRange {
            field,
            min_ms,
            max_ms,
            actual_ms,
        }
        .into());
    }
    Ok(())
}

fn check_range(field: &'static str, actual: u64, min: u64, max: u64) -> Result<(), LinkError> {
    if actual < min || actual > max {
        return Err(InvalidRequestKind::ConfigValueOutOfRange {
            field,
            min,
            max,
            actual,
        }
        .into());
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

    #[test]
    fn default_and_presets_are_valid() {
        for config in [
            LinkConfig::default(),
            LinkConfig::lan(),
            LinkConfig::high_latency(),
            LinkConfig::patient(),
            LinkConfig::strict(),
        ] {
            assert!(config.validate().is_ok(), "{:?}", config);
        }
    }

    #[test]
    fn default_timings_at_60hz() {
        let timings = LinkConfig::default().timings();
        assert_eq!(timings.handshake_timeout, 720);
        assert_eq!(timings.relay_timeout, 600);
        assert_eq!(timings.liveness_timeout, 900);
        assert_eq!(timings.ping_interval, 60);
        assert_eq!(timings.forfeit_repeat, 30);
        assert_eq!(timings.safety_timeout, 3600);
        assert_eq!(timings.inbound_refresh, 3);
        assert_eq!(timings.linger, 60);
    }

    #[test]
    fn conversion_rounds_up() {
        let config = LinkConfig {
            ping_interval: Duration::from_millis(10),
            linger: Duration::from_millis(1),
            ..LinkConfig::default()
        };
        let timings = config.timings();
        assert_eq!(timings.ping_interval, 1);
        assert_eq!(timings.linger, 1);
    }

    #[test]
    fn zero_linger_is_zero_ticks() {
        let config = LinkConfig {
            linger: Duration::ZERO,
            ..LinkConfig::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.timings().linger, 0);
    }

    #[test]
    fn rejects_out_of_range_duration() {
        let config = LinkConfig {
            relay_timeout: Duration::from_millis(5),
            ..LinkConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(
            err,
            LinkError::InvalidRequest {
                kind: InvalidRequestKind::DurationConfigOutOfRange {
                    field: "relay_timeout",
                    min_ms: 100,
                    max_ms: 600_000,
                    actual_ms: 5,
                }
            }
        );
    }

    #[test]
    fn rejects_zero_tick_rate() {
        let config = LinkConfig {
            tick_rate: 0,
            ..LinkConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(LinkError::InvalidRequest {
                kind: InvalidRequestKind::ConfigValueOutOfRange {
                    field: "tick_rate",
                    ..
                }
            })
        ));
    }

    #[test]
    fn rejects_liveness_shorter_than_two_pings() {
        let config = LinkConfig {
            ping_interval: Duration::from_secs(10),
            liveness_timeout: Duration::from_secs(15),
            ..LinkConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(LinkError::InvalidRequest {
                kind: InvalidRequestKind::InconsistentConfig {
                    field: "liveness_timeout",
                    ..
                }
            })
        ));
    }

    #[test]
    fn rejects_safety_timeout_shorter_than_forfeit_window() {
        let config = LinkConfig {
            tick_rate: 10,
            forfeit_repeat_ticks: 50,
            safety_timeout: Duration::from_secs(2),
            ..LinkConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(LinkError::InvalidRequest {
                kind: InvalidRequestKind::InconsistentConfig {
                    field: "safety_timeout",
                    ..
                }
            })
        ));
    }
}
