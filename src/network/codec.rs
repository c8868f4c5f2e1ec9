//! This module provides a centralized interface for encoding and decoding relay messages as
//! line-delimited JSON. Every record is a single line of UTF-8 JSON terminated by `\n`; the
//! JSON encoder never emits raw newlines, so a line boundary is always a record boundary.
//!
//! # Examples
//!
//! ```
//! use duel_link::network::codec::{decode_line, encode_line, LineDecoder};
//! use duel_link::Message;
//!
//! let line = encode_line(&Message::DuelReady).expect("encoding should succeed");
//! assert_eq!(line, "{\"type\":\"duel_ready\"}\n");
//!
//! let decoded: Message = decode_line(line.trim_end()).expect("decoding should succeed");
//! assert_eq!(decoded, Message::DuelReady);
//!
//! // Stream decoding copes with records split across reads.
//! let mut decoder = LineDecoder::new();
//! decoder.push(b"{\"type\":\"duel_re");
//! assert!(decoder.next_message::<Message>().is_none());
//! decoder.push(b"ady\"}\n");
//! assert_eq!(decoder.next_message::<Message>(), Some(Ok(Message::DuelReady)));
//! ```

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

/// Longest line accepted by [`LineDecoder`] before the line is dropped.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Represents what operation was being performed when a codec error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CodecOperation {
    /// Encoding a relay message.
    EncodeMessage,
    /// Decoding a relay message.
    DecodeMessage,
    /// Appending a line to an output buffer.
    AppendToBuffer,
}

impl fmt::Display for CodecOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeMessage => write!(f, "encoding relay message"),
            Self::DecodeMessage => write!(f, "decoding relay message"),
            Self::AppendToBuffer => write!(f, "appending to buffer"),
        }
    }
}

/// Errors that can occur during encoding or decoding.
///
/// Messages are stored as `String` because `serde_json` errors only expose their
/// diagnostics through `Display`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// The encoding operation failed.
    EncodeError {
        /// The underlying serde_json error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// The decoding operation failed.
    DecodeError {
        /// The underlying serde_json error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// A line exceeded the decoder's maximum length and was dropped.
    LineTooLong {
        /// Bytes seen before the line was dropped.
        len: usize,
        /// The configured maximum.
        max: usize,
    },
}

impl CodecError {
    /// Creates a new encode error with the given message and operation.
    pub fn encode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::EncodeError {
            message: message.into(),
            operation,
        }
    }

    /// Creates a new decode error with the given message and operation.
    pub fn decode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::DecodeError {
            message: message.into(),
            operation,
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeError { message, operation } => {
                write!(f, "encoding failed while {operation}: {message}")
            },
            Self::DecodeError { message, operation } => {
                write!(f, "decoding failed while {operation}: {message}")
            },
            Self::LineTooLong { len, max } => {
                write!(f, "line of at least {len} bytes exceeds the {max} byte limit")
            },
        }
    }
}

impl std::error::Error for CodecError {}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Encodes a value as one JSON line, including the trailing `\n`.
///
/// # Errors
///
/// Returns [`CodecError::EncodeError`] if serialization fails.
pub fn encode_line<T: Serialize>(value: &T) -> CodecResult<String> {
    let mut line = serde_json::to_string(value)
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::EncodeMessage))?;
    line.push('\n');
    Ok(line)
}

/// Appends a value as one JSON line to an existing buffer.
///
/// On error the buffer is left unchanged.
///
/// # Errors
///
/// Returns [`CodecError::EncodeError`] if serialization fails.
pub fn encode_line_into<T: Serialize>(value: &T, buffer: &mut Vec<u8>) -> CodecResult<()> {
    let start = buffer.len();
    if let Err(e) = serde_json::to_writer(&mut *buffer, value) {
        buffer.truncate(start);
        return Err(CodecError::encode(
            e.to_string(),
            CodecOperation::AppendToBuffer,
        ));
    }
    buffer.push(b'\n');
    Ok(())
}

/// Decodes one line (without its terminator) into a value.
///
/// # Errors
///
/// Returns [`CodecError::DecodeError`] if the line is not valid JSON for `T`.
pub fn decode_line<T: DeserializeOwned>(line: &str) -> CodecResult<T> {
    decode_bytes(line.as_bytes())
}

fn decode_bytes<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| CodecError::decode(e.to_string(), CodecOperation::DecodeMessage))
}

/// Incremental splitter for a byte stream of JSON lines.
///
/// Bytes are pushed as they arrive; complete lines are decoded on demand. Blank lines are
/// skipped. A line longer than the limit is reported once as [`CodecError::LineTooLong`] and
/// its remaining bytes are dropped up to the next `\n`.
#[derive(Debug, Clone)]
pub struct LineDecoder {
    pending: Vec<u8>,
    max_line_len: usize,
    discarding: bool,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl LineDecoder {
    /// Creates a decoder with the [`MAX_LINE_LEN`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_line_len(MAX_LINE_LEN)
    }

    /// Creates a decoder with a custom line limit.
    #[must_use]
    pub fn with_max_line_len(max_line_len: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_line_len,
            discarding: false,
        }
    }

    /// Appends received bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Returns the number of buffered bytes not yet consumed.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Decodes the next complete line, if there is one.
    ///
    /// Returns `None` when no complete line is buffered. A malformed line yields `Some(Err(_))`
    /// and is consumed, so the next call continues with the following line.
    pub fn next_message<T: DeserializeOwned>(&mut self) -> Option<CodecResult<T>> {
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                if self.discarding {
                    self.discarding = false;
                    continue;
                }
                if line.len() > self.max_line_len {
                    return Some(Err(CodecError::LineTooLong {
                        len: line.len(),
                        max: self.max_line_len,
                    }));
                }
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Some(decode_bytes(&line));
            }

            if self.pending.len() > self.max_line_len {
                let len = self.pending.len();
                self.pending.clear();
                if !self.discarding {
                    self.discarding = true;
                    return Some(Err(CodecError::LineTooLong {
                        len,
                        max: self.max_line_len,
                    }));
                }
            }
            return None;
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
    use crate::{BattlerSlot, Message, Outcome};

    #[test]
    fn encoded_line_ends_with_single_newline() {
        let line = encode_line(&Message::DuelEnd {
            outcome: Outcome::Win,
        })
        .unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn encode_into_appends_after_existing_bytes() {
        let mut buffer = b"prefix".to_vec();
        encode_line_into(&Message::DuelPing { nonce: 9 }, &mut buffer).unwrap();
        assert!(buffer.starts_with(b"prefix{"));
        assert_eq!(buffer.last(), Some(&b'\n'));
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let err = decode_line::<Message>(r#"{"type":"duel_teleport"}"#).unwrap_err();
        assert!(matches!(
            err,
            CodecError::DecodeError {
                operation: CodecOperation::DecodeMessage,
                ..
            }
        ));
    }

    #[test]
    fn decoder_yields_multiple_lines_from_one_push() {
        let mut decoder = LineDecoder::new();
        let mut bytes = Vec::new();
        encode_line_into(&Message::DuelReady, &mut bytes).unwrap();
        encode_line_into(
            &Message::DuelBufferAck {
                battler_slot: BattlerSlot::new(0),
                seq: 4,
            },
            &mut bytes,
        )
        .unwrap();
        decoder.push(&bytes);

        assert_eq!(decoder.next_message::<Message>(), Some(Ok(Message::DuelReady)));
        assert!(matches!(
            decoder.next_message::<Message>(),
            Some(Ok(Message::DuelBufferAck { seq: 4, .. }))
        ));
        assert_eq!(decoder.next_message::<Message>(), None);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn decoder_skips_blank_and_crlf_lines() {
        let mut decoder = LineDecoder::new();
        decoder.push(b"\r\n\n{\"type\":\"duel_ready\"}\r\n");
        assert_eq!(decoder.next_message::<Message>(), Some(Ok(Message::DuelReady)));
    }

    #[test]
    fn malformed_line_does_not_poison_the_stream() {
        let mut decoder = LineDecoder::new();
        decoder.push(b"not json\n{\"type\":\"duel_ready\"}\n");
        assert!(matches!(decoder.next_message::<Message>(), Some(Err(_))));
        assert_eq!(decoder.next_message::<Message>(), Some(Ok(Message::DuelReady)));
    }

    #[test]
    fn oversized_line_is_reported_once_and_skipped() {
        // Room for `{"type":"duel_ready"}` (21 bytes) but not for the junk.
        let mut decoder = LineDecoder::with_max_line_len(24);
        decoder.push(&[b'x'; 30]);
        assert_eq!(
            decoder.next_message::<Message>(),
            Some(Err(CodecError::LineTooLong { len: 30, max: 24 }))
        );
        decoder.push(&[b'x'; 30]);
        assert_eq!(decoder.next_message::<Message>(), None);
        decoder.push(b"xx\n{\"type\":\"duel_ready\"}\n");
        assert_eq!(decoder.next_message::<Message>(), Some(Ok(Message::DuelReady)));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn complete_line_over_the_limit_is_rejected() {
        let mut decoder = LineDecoder::with_max_line_len(16);
        decoder.push(b"{\"type\":\"duel_ready\"}\n{\"type\":\"duel_ready\"}\n");
        assert_eq!(
            decoder.next_message::<Message>(),
            Some(Err(CodecError::LineTooLong { len: 21, max: 16 }))
        );
    }

    #[test]
    fn codec_error_display_names_operation() {
        let err = CodecError::decode("eof", CodecOperation::DecodeMessage);
        assert_eq!(
            err.to_string(),
            "decoding failed while decoding relay message: eof"
        );
    }
}
