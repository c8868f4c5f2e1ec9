//! A [`RelayTransport`] over a non-blocking byte stream.
//!
//! Each relayed message travels as one JSON line wrapped in an envelope naming sender and
//! recipient:
//!
//! ```text
//! {"from":"red","to":"blue","message":{"type":"duel_ready"}}
//! ```
//!
//! The stream is expected to be non-blocking: reads that would block end the receive pass and
//! writes that would block leave the remainder queued for the next call. A blocking stream
//! also works, but then a tick waits on the stream.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};

use serde::{Deserialize, Serialize};

use crate::network::codec::{self, LineDecoder};
use crate::network::messages::Message;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::{report_violation, LinkError, PeerId, RelayTransport};

const RECV_CHUNK_SIZE: usize = 4096;

/// Default cap on bytes queued for a stream that keeps reporting `WouldBlock`.
pub const MAX_PENDING_OUTPUT: usize = codec::MAX_LINE_LEN * 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Envelope {
    from: PeerId,
    to: PeerId,
    message: Message,
}

/// Relay transport over any `Read + Write` stream, typically a [`TcpStream`] to a relay server.
pub struct StreamTransport<S> {
    stream: S,
    local_peer: PeerId,
    decoder: LineDecoder,
    write_buffer: Vec<u8>,
    max_pending_output: usize,
    recv_chunk: Vec<u8>,
    closed: bool,
}

impl<S> std::fmt::Debug for StreamTransport<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("local_peer", &self.local_peer)
            .field("buffered_in", &self.decoder.buffered())
            .field("buffered_out", &self.write_buffer.len())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl StreamTransport<TcpStream> {
    /// Connects to a relay at `addr` and switches the socket to non-blocking mode.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::TransportError`] if the connection or socket setup fails.
    pub fn connect_tcp(
        addr: impl ToSocketAddrs,
        local_peer: impl Into<PeerId>,
    ) -> Result<Self, LinkError> {
        let stream = TcpStream::connect(addr)?;
        Self::from_tcp(stream, local_peer)
    }

    /// Wraps an already connected socket, switching it to non-blocking mode.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::TransportError`] if the socket options cannot be set.
    pub fn from_tcp(stream: TcpStream, local_peer: impl Into<PeerId>) -> Result<Self, LinkError> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let transport = Self::new(stream, local_peer);
        tracing::debug!(peer = %transport.local_peer, "relay stream connected");
        Ok(transport)
    }
}

impl<S: Read + Write> StreamTransport<S> {
    /// Wraps `stream` for the peer `local_peer`.
    pub fn new(stream: S, local_peer: impl Into<PeerId>) -> Self {
        Self {
            stream,
            local_peer: local_peer.into(),
            decoder: LineDecoder::new(),
            write_buffer: Vec::new(),
            max_pending_output: MAX_PENDING_OUTPUT,
            recv_chunk: vec![0; RECV_CHUNK_SIZE],
            closed: false,
        }
    }

    /// Caps the bytes queued behind a blocked stream. Exceeding it closes the transport.
    #[must_use]
    pub fn with_max_pending_output(mut self, bytes: usize) -> Self {
        self.max_pending_output = bytes;
        self
    }

    /// Returns `true` once the stream reached end-of-file or failed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// The peer this transport sends as.
    #[must_use]
    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    /// Bytes queued because the stream would have blocked.
    #[must_use]
    pub fn pending_output(&self) -> usize {
        self.write_buffer.len()
    }

    /// Returns a reference to the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Returns a mutable reference to the underlying stream.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Consumes the transport, returning the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    fn queue_message(&mut self, msg: &Message, peer: &PeerId) {
        if self.closed {
            tracing::trace!(kind = msg.kind(), "relay stream closed, dropping message");
            return;
        }
        let envelope = Envelope {
            from: self.local_peer.clone(),
            to: peer.clone(),
            message: msg.clone(),
        };
        if let Err(err) = codec::encode_line_into(&envelope, &mut self.write_buffer) {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::WireProtocol,
                "failed to encode {}: {}",
                msg.kind(),
                err
            );
            return;
        }
        self.flush_pending();
        if self.write_buffer.len() > self.max_pending_output {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::Transport,
                "relay stream backlog of {} bytes exceeds {}",
                self.write_buffer.len(),
                self.max_pending_output
            );
            self.write_buffer.clear();
            self.closed = true;
        }
    }

    fn flush_pending(&mut self) {
        while !self.write_buffer.is_empty() && !self.closed {
            match self.stream.write(&self.write_buffer) {
                Ok(0) => self.close("relay stream stopped accepting bytes"),
                Ok(written) => {
                    self.write_buffer.drain(..written);
                },
                Err(err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == ErrorKind::Interrupted => {},
                Err(err) => self.fail("write", &err),
            }
        }
        if self.closed {
            return;
        }
        match self.stream.flush() {
            Ok(()) => {},
            Err(err) if err.kind() == ErrorKind::WouldBlock => {},
            Err(err) => self.fail("flush", &err),
        }
    }

    fn fill_decoder(&mut self) {
        while !self.closed {
            match self.stream.read(&mut self.recv_chunk) {
                Ok(0) => self.close("relay stream reached end of file"),
                Ok(read) => {
                    if let Some(bytes) = self.recv_chunk.get(..read) {
                        self.decoder.push(bytes);
                    }
                },
                Err(err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == ErrorKind::Interrupted => {},
                Err(err) => self.fail("read", &err),
            }
        }
    }

    fn drain_decoder(&mut self) -> Vec<(PeerId, Message)> {
        let mut received = Vec::new();
        while let Some(result) = self.decoder.next_message::<Envelope>() {
            match result {
                Ok(envelope) if envelope.to == self.local_peer => {
                    received.push((envelope.from, envelope.message));
                },
                Ok(envelope) => {
                    report_violation!(
                        ViolationSeverity::Warning,
                        ViolationKind::WireProtocol,
                        "relay delivered {} addressed to '{}' instead of '{}'",
                        envelope.message.kind(),
                        envelope.to,
                        self.local_peer
                    );
                },
                Err(err) => {
                    report_violation!(
                        ViolationSeverity::Warning,
                        ViolationKind::WireProtocol,
                        "undecodable relay line: {}",
                        err
                    );
                },
            }
        }
        received
    }

    fn receive_pending(&mut self) -> Vec<(PeerId, Message)> {
        self.flush_pending();
        self.fill_decoder();
        self.drain_decoder()
    }

    fn close(&mut self, reason: &str) {
        tracing::debug!(peer = %self.local_peer, reason, "relay stream closed");
        self.closed = true;
    }

    fn fail(&mut self, operation: &str, err: &std::io::Error) {
        report_violation!(
            ViolationSeverity::Error,
            ViolationKind::Transport,
            "relay stream {} failed ({:?}): {}",
            operation,
            err.kind(),
            err
        );
        self.closed = true;
    }
}

#[cfg(not(feature = "sync-send"))]
impl<S: Read + Write> RelayTransport for StreamTransport<S> {
    fn send_to(&mut self, msg: &Message, peer: &PeerId) {
        self.queue_message(msg, peer);
    }

    fn receive_all_messages(&mut self) -> Vec<(PeerId, Message)> {
        self.receive_pending()
    }
}

#[cfg(feature = "sync-send")]
impl<S: Read + Write + Send + Sync> RelayTransport for StreamTransport<S> {
    fn send_to(&mut self, msg: &Message, peer: &PeerId) {
        self.queue_message(msg, peer);
    }

    fn receive_all_messages(&mut self) -> Vec<(PeerId, Message)> {
        self.receive_pending()
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
    use crate::{BattlerSlot, Outcome};
    use std::collections::VecDeque;
    use std::io;

    /// Stream stub: reads from `inbound` until empty, then reports `WouldBlock`.
    /// Writes accept at most `write_limit` bytes per call.
    #[derive(Default)]
    struct PipeStub {
        inbound: VecDeque<u8>,
        outbound: Vec<u8>,
        write_limit: Option<usize>,
        blocked: bool,
        eof: bool,
    }

    impl Read for PipeStub {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.inbound.is_empty() {
                if self.eof {
                    return Ok(0);
                }
                return Err(io::Error::new(ErrorKind::WouldBlock, "empty"));
            }
            let n = buf.len().min(self.inbound.len());
            for (dst, src) in buf.iter_mut().zip(self.inbound.drain(..n)) {
                *dst = src;
            }
            Ok(n)
        }
    }

    impl Write for PipeStub {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.blocked {
                return Err(io::Error::new(ErrorKind::WouldBlock, "full"));
            }
            let n = self.write_limit.map_or(buf.len(), |limit| limit.min(buf.len()));
            self.outbound.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn feed(transport: &mut StreamTransport<PipeStub>, text: &str) {
        transport.get_mut().inbound.extend(text.as_bytes());
    }

    #[test]
    fn sends_enveloped_lines() {
        let mut transport = StreamTransport::new(PipeStub::default(), "blue");
        transport.send_to(&Message::DuelReady, &PeerId::new("red"));

        let written = String::from_utf8(transport.get_ref().outbound.clone()).unwrap();
        assert_eq!(
            written,
            "{\"from\":\"blue\",\"to\":\"red\",\"message\":{\"type\":\"duel_ready\"}}\n"
        );
    }

    #[test]
    fn partial_writes_are_completed_later() {
        let stub = PipeStub {
            blocked: true,
            ..PipeStub::default()
        };
        let mut transport = StreamTransport::new(stub, "blue");
        transport.send_to(
            &Message::DuelEnd {
                outcome: Outcome::Win,
            },
            &PeerId::new("red"),
        );
        assert!(transport.pending_output() > 0);
        assert!(transport.get_ref().outbound.is_empty());

        transport.get_mut().blocked = false;
        transport.get_mut().write_limit = Some(7);
        assert!(transport.receive_all_messages().is_empty());
        assert_eq!(transport.pending_output(), 0);
        assert!(transport.get_ref().outbound.ends_with(b"\n"));
        assert!(!transport.is_closed());
    }

    #[test]
    fn backlog_past_the_cap_closes_the_transport() {
        let stub = PipeStub {
            blocked: true,
            ..PipeStub::default()
        };
        let mut transport = StreamTransport::new(stub, "blue").with_max_pending_output(128);
        let red = PeerId::new("red");
        transport.send_to(&Message::DuelReady, &red);
        assert!(!transport.is_closed());
        let queued = transport.pending_output();
        assert!(queued > 0 && queued <= 128);

        for _ in 0..4 {
            transport.send_to(&Message::DuelReady, &red);
        }
        assert!(transport.is_closed());
        assert_eq!(transport.pending_output(), 0);

        transport.get_mut().blocked = false;
        assert!(transport.receive_all_messages().is_empty());
        assert!(transport.get_ref().outbound.is_empty());
    }

    #[test]
    fn receives_lines_split_across_reads() {
        let mut transport = StreamTransport::new(PipeStub::default(), "blue");
        feed(
            &mut transport,
            "{\"from\":\"red\",\"to\":\"blue\",\"message\":{\"type\":\"duel_buffer_ack\",",
        );
        assert!(transport.receive_all_messages().is_empty());

        feed(&mut transport, "\"battler_slot\":1,\"seq\":4}}\n");
        assert_eq!(
            transport.receive_all_messages(),
            vec![(
                PeerId::new("red"),
                Message::DuelBufferAck {
                    battler_slot: BattlerSlot::new(1),
                    seq: 4
                }
            )]
        );
    }

    #[test]
    fn misaddressed_and_garbled_lines_are_skipped() {
        let mut transport = StreamTransport::new(PipeStub::default(), "blue");
        feed(
            &mut transport,
            concat!(
                "{\"from\":\"red\",\"to\":\"green\",\"message\":{\"type\":\"duel_ready\"}}\n",
                "not json\n",
                "{\"from\":\"red\",\"to\":\"blue\",\"message\":{\"type\":\"duel_ready\"}}\n",
            ),
        );
        assert_eq!(
            transport.receive_all_messages(),
            vec![(PeerId::new("red"), Message::DuelReady)]
        );
    }

    #[test]
    fn end_of_file_closes_the_transport() {
        let stub = PipeStub {
            eof: true,
            ..PipeStub::default()
        };
        let mut transport = StreamTransport::new(stub, "blue");
        feed(
            &mut transport,
            "{\"from\":\"red\",\"to\":\"blue\",\"message\":{\"type\":\"duel_ready\"}}\n",
        );
        assert_eq!(transport.receive_all_messages().len(), 1);
        assert!(transport.is_closed());

        transport.send_to(&Message::DuelReady, &PeerId::new("red"));
        assert!(transport.get_ref().outbound.is_empty());
    }
}
