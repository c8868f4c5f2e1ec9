//! Error types returned by the Duel Link API.
//!
//! Protocol anomalies (duplicates, stale buffers, stalls) are never surfaced as errors: they
//! are recovered locally and reported through [`telemetry`](crate::telemetry). [`LinkError`]
//! covers API misuse, invalid configuration, codec failures and transport I/O.

use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::network::codec::CodecError;
use crate::{BattlerSlot, Outcome, PeerId};

/// This enum contains all error messages this library can return. Most API functions will generally return a [`Result<(), LinkError>`].
///
/// [`Result<(), LinkError>`]: std::result::Result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// You made an invalid request, usually by using wrong parameters for function calls.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        kind: InvalidRequestKind,
    },
    /// Encoding or decoding a wire message failed.
    Codec {
        /// The underlying codec failure.
        source: CodecError,
    },
    /// A transport operation failed.
    TransportError {
        /// A description of the transport error.
        context: String,
    },
}

/// Structured details for [`LinkError::InvalidRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidRequestKind {
    /// A duration setting is outside its allowed range.
    DurationConfigOutOfRange {
        /// Name of the offending field.
        field: &'static str,
        /// Smallest allowed value in milliseconds.
        min_ms: u64,
        /// Largest allowed value in milliseconds.
        max_ms: u64,
        /// The configured value in milliseconds.
        actual_ms: u64,
    },
    /// A numeric setting is outside its allowed range.
    ConfigValueOutOfRange {
        /// Name of the offending field.
        field: &'static str,
        /// Smallest allowed value.
        min: u64,
        /// Largest allowed value.
        max: u64,
        /// The configured value.
        actual: u64,
    },
    /// Two settings contradict each other.
    InconsistentConfig {
        /// Name of the offending field.
        field: &'static str,
        /// The relation that must hold.
        constraint: &'static str,
    },
    /// A required builder field was never set.
    MissingField {
        /// Name of the missing field.
        field: &'static str,
    },
    /// The local and remote peer share the same identity.
    SamePeer {
        /// The shared identity.
        peer: PeerId,
    },
    /// A battler slot does not fit in an absentee mask.
    InvalidSlot {
        /// The offending slot.
        slot: BattlerSlot,
    },
    /// A battler slot was listed twice, or as both local and remote.
    DuplicateSlot {
        /// The offending slot.
        slot: BattlerSlot,
    },
    /// The local outcome has already been captured for this session.
    OutcomeAlreadyReported {
        /// The outcome captured first.
        captured: Outcome,
    },
    /// The session is already closed.
    SessionClosed,
}

impl Display for InvalidRequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidRequestKind::DurationConfigOutOfRange {
                field,
                min_ms,
                max_ms,
                actual_ms,
            } => write!(
                f,
                "{} must be between {}ms and {}ms, got {}ms",
                field, min_ms, max_ms, actual_ms
            ),
            InvalidRequestKind::ConfigValueOutOfRange {
                field,
                min,
                max,
                actual,
            } => write!(
                f,
                "{} must be between {} and {}, got {}",
                field, min, max, actual
            ),
            InvalidRequestKind::InconsistentConfig { field, constraint } => {
                write!(f, "{} is inconsistent: {}", field, constraint)
            },
            InvalidRequestKind::MissingField { field } => {
                write!(f, "{} must be set before starting a session", field)
            },
            InvalidRequestKind::SamePeer { peer } => {
                write!(f, "local and remote peer are both '{}'", peer)
            },
            InvalidRequestKind::InvalidSlot { slot } => write!(
                f,
                "battler slot {} is out of range (max {})",
                slot,
                crate::MAX_BATTLER_SLOTS - 1
            ),
            InvalidRequestKind::DuplicateSlot { slot } => {
                write!(f, "battler slot {} is listed more than once", slot)
            },
            InvalidRequestKind::OutcomeAlreadyReported { captured } => {
                write!(f, "local outcome was already captured as '{}'", captured)
            },
            InvalidRequestKind::SessionClosed => write!(f, "the session is already closed"),
        }
    }
}

impl From<InvalidRequestKind> for LinkError {
    fn from(kind: InvalidRequestKind) -> Self {
        LinkError::InvalidRequest { kind }
    }
}

impl From<CodecError> for LinkError {
    fn from(source: CodecError) -> Self {
        LinkError::Codec { source }
    }
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::TransportError {
            context: format!("{:?}: {}", err.kind(), err),
        }
    }
}

impl Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::InvalidRequest { kind } => {
                write!(f, "Invalid Request: {}", kind)
            },
            LinkError::Codec { source } => {
                write!(f, "Codec error: {}", source)
            },
            LinkError::TransportError { context } => {
                write!(f, "Transport error: {}", context)
            },
        }
    }
}

impl Error for LinkError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            LinkError::Codec { source } => Some(source),
            LinkError::InvalidRequest { .. } | LinkError::TransportError { .. } => None,
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

    #[test]
    fn invalid_request_converts_from_kind() {
        let err: LinkError = InvalidRequestKind::SessionClosed.into();
        assert_eq!(
            err,
            LinkError::InvalidRequest {
                kind: InvalidRequestKind::SessionClosed
            }
        );
    }

    #[test]
    fn duration_out_of_range_display_mentions_field() {
        let err: LinkError = InvalidRequestKind::DurationConfigOutOfRange {
            field: "relay_timeout",
            min_ms: 100,
            max_ms: 600_000,
            actual_ms: 5,
        }
        .into();
        let text = err.to_string();
        assert!(text.contains("relay_timeout"));
        assert!(text.contains("5ms"));
    }

    #[test]
    fn io_error_becomes_transport_error() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let err = LinkError::from(io);
        assert!(matches!(err, LinkError::TransportError { ref context } if context.contains("BrokenPipe")));
    }

    #[test]
    fn codec_error_is_exposed_as_source() {
        let err = LinkError::from(CodecError::LineTooLong {
            len: 10,
            max: 5,
        });
        assert!(err.source().is_some());
    }

    #[test]
    fn outcome_already_reported_display() {
        let kind = InvalidRequestKind::OutcomeAlreadyReported {
            captured: Outcome::Win,
        };
        assert!(kind.to_string().contains("win"));
    }
}
