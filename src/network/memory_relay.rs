//! An in-process relay hub.
//!
//! [`MemoryRelay`] plays the part of the relay server for peers living in the same process:
//! tests, local hot-seat play and benchmarks. Every message is encoded with the line codec on
//! send and decoded on receive, so it exercises the same wire format as a networked relay.
//!
//! ```
//! use duel_link::{MemoryRelay, Message, PeerId, RelayTransport};
//!
//! let relay = MemoryRelay::new();
//! let mut red = relay.connect("red");
//! let mut blue = relay.connect("blue");
//!
//! red.send_to(&Message::DuelReady, &PeerId::new("blue"));
//! assert_eq!(
//!     blue.receive_all_messages(),
//!     vec![(PeerId::new("red"), Message::DuelReady)]
//! );
//!
//! // Departures are announced to everyone still connected.
//! relay.disconnect(&PeerId::new("red"));
//! let notices = blue.receive_all_messages();
//! assert_eq!(
//!     notices[0].1,
//!     Message::DuelOpponentDisconnected { peer_id: PeerId::new("red") }
//! );
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::network::codec;
use crate::network::messages::Message;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::{report_violation, PeerId, RelayTransport};

type Mailbox = VecDeque<(PeerId, String)>;

#[derive(Debug, Default)]
struct Hub {
    mailboxes: BTreeMap<PeerId, Mailbox>,
}

impl Hub {
    fn deliver(&mut self, from: &PeerId, to: &PeerId, line: String) -> bool {
        match self.mailboxes.get_mut(to) {
            Some(mailbox) => {
                mailbox.push_back((from.clone(), line));
                true
            },
            None => false,
        }
    }
}

/// Shared relay hub. Cloning yields another handle to the same hub.
#[derive(Debug, Clone, Default)]
pub struct MemoryRelay {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryRelay {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `peer` and returns its endpoint. Reconnecting a peer discards whatever was
    /// queued for it.
    pub fn connect(&self, peer: impl Into<PeerId>) -> MemoryRelayEndpoint {
        let peer = peer.into();
        self.hub
            .lock()
            .mailboxes
            .insert(peer.clone(), VecDeque::new());
        tracing::debug!(%peer, "peer connected to memory relay");
        MemoryRelayEndpoint {
            peer,
            hub: Arc::clone(&self.hub),
        }
    }

    /// Removes `peer` and sends `duel_opponent_disconnected` to every remaining peer.
    /// Returns `false` if the peer was not connected.
    pub fn disconnect(&self, peer: &PeerId) -> bool {
        let mut hub = self.hub.lock();
        if hub.mailboxes.remove(peer).is_none() {
            return false;
        }
        tracing::debug!(%peer, "peer left memory relay");

        let notice = Message::DuelOpponentDisconnected {
            peer_id: peer.clone(),
        };
        let line = match codec::encode_line(&notice) {
            Ok(line) => line,
            Err(err) => {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::WireProtocol,
                    "failed to encode disconnect notice: {}",
                    err
                );
                return true;
            },
        };
        for mailbox in hub.mailboxes.values_mut() {
            mailbox.push_back((peer.clone(), line.clone()));
        }
        true
    }

    /// Returns `true` if `peer` is connected.
    #[must_use]
    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.hub.lock().mailboxes.contains_key(peer)
    }

    /// Number of messages waiting for `peer`.
    #[must_use]
    pub fn pending(&self, peer: &PeerId) -> usize {
        self.hub.lock().mailboxes.get(peer).map_or(0, VecDeque::len)
    }
}

/// One peer's handle on a [`MemoryRelay`].
#[derive(Debug)]
pub struct MemoryRelayEndpoint {
    peer: PeerId,
    hub: Arc<Mutex<Hub>>,
}

impl MemoryRelayEndpoint {
    /// The peer this endpoint belongs to.
    #[must_use]
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }
}

impl RelayTransport for MemoryRelayEndpoint {
    fn send_to(&mut self, msg: &Message, peer: &PeerId) {
        let line = match codec::encode_line(msg) {
            Ok(line) => line,
            Err(err) => {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::WireProtocol,
                    "failed to encode {}: {}",
                    msg.kind(),
                    err
                );
                return;
            },
        };

        let mut hub = self.hub.lock();
        if !hub.mailboxes.contains_key(&self.peer) {
            tracing::trace!(from = %self.peer, "sender is no longer connected, dropping");
            return;
        }
        if !hub.deliver(&self.peer, peer, line) {
            tracing::trace!(to = %peer, kind = msg.kind(), "recipient not connected, dropping");
        }
    }

    fn receive_all_messages(&mut self) -> Vec<(PeerId, Message)> {
        let lines: Vec<_> = match self.hub.lock().mailboxes.get_mut(&self.peer) {
            Some(mailbox) => mailbox.drain(..).collect(),
            None => return Vec::new(),
        };

        let mut received = Vec::with_capacity(lines.len());
        for (from, line) in lines {
            match codec::decode_line::<Message>(&line) {
                Ok(msg) => received.push((from, msg)),
                Err(err) => {
                    report_violation!(
                        ViolationSeverity::Warning,
                        ViolationKind::WireProtocol,
                        "undecodable message from '{}': {}",
                        from,
                        err
                    );
                },
            }
        }
        received
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
    use crate::BattlerSlot;

    #[test]
    fn delivery_preserves_order() {
        let relay = MemoryRelay::new();
        let mut red = relay.connect("red");
        let mut blue = relay.connect("blue");
        let to_blue = PeerId::new("blue");

        for seq in 1..=3 {
            red.send_to(
                &Message::DuelBufferAck {
                    battler_slot: BattlerSlot::new(0),
                    seq,
                },
                &to_blue,
            );
        }
        assert_eq!(relay.pending(&to_blue), 3);

        let seqs: Vec<_> = blue
            .receive_all_messages()
            .into_iter()
            .map(|(_, msg)| match msg {
                Message::DuelBufferAck { seq, .. } => seq,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(seqs, [1, 2, 3]);
        assert!(blue.receive_all_messages().is_empty());
    }

    #[test]
    fn messages_to_unknown_peers_are_dropped() {
        let relay = MemoryRelay::new();
        let mut red = relay.connect("red");
        red.send_to(&Message::DuelReady, &PeerId::new("nobody"));
        assert_eq!(relay.pending(&PeerId::new("nobody")), 0);
    }

    #[test]
    fn disconnected_peers_stop_sending_and_receiving() {
        let relay = MemoryRelay::new();
        let mut red = relay.connect("red");
        let mut blue = relay.connect("blue");

        assert!(relay.disconnect(&PeerId::new("red")));
        assert!(!relay.disconnect(&PeerId::new("red")));
        assert!(!relay.is_connected(red.peer()));

        red.send_to(&Message::DuelReady, &PeerId::new("blue"));
        let received = blue.receive_all_messages();
        assert_eq!(received.len(), 1);
        assert_eq!(
            received[0],
            (
                PeerId::new("red"),
                Message::DuelOpponentDisconnected {
                    peer_id: PeerId::new("red")
                }
            )
        );
        assert!(red.receive_all_messages().is_empty());
    }
}
