//! Wire schema for everything the two peers (and the relay) say to each other.
//!
//! Every [`Message`] is one JSON object with a `type` tag in snake_case, for example
//! `{"type":"duel_ready"}` or `{"type":"duel_end","outcome":"win"}`.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{BattlerSlot, Outcome, PeerId};

/// Inline storage for per-player slot lists. Singles and doubles never spill to the heap.
pub type SlotList = SmallVec<[BattlerSlot; 2]>;

/// Trainer record exchanged in EXCHANGE via `duel_player_info`.
///
/// `battler_slots` lists the slots the sender controls and `opponent_slots` the slots it
/// assigns to its opponent, both in the sender's own numbering. The receiver uses them to
/// build a [`SlotMap`](crate::SlotMap).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerIdentity {
    /// Display name of the trainer.
    pub name: String,
    /// Trainer id as stored by the simulation.
    pub trainer_id: u32,
    /// Slots controlled by the sender, in the sender's numbering.
    #[serde(default)]
    pub battler_slots: SlotList,
    /// Slots of the sender's opponent, in the sender's numbering.
    #[serde(default)]
    pub opponent_slots: SlotList,
}

impl PlayerIdentity {
    /// Creates an identity without slot declarations.
    ///
    /// [`SessionBuilder`](crate::SessionBuilder) fills in the slots from its own
    /// `with_local_slots` / `with_remote_slots` before the handshake starts.
    #[must_use]
    pub fn new(name: impl Into<String>, trainer_id: u32) -> Self {
        Self {
            name: name.into(),
            trainer_id,
            battler_slots: SlotList::new(),
            opponent_slots: SlotList::new(),
        }
    }

    /// Returns a copy of this identity with the given slot layout.
    #[must_use]
    pub fn with_slots(mut self, local: &[BattlerSlot], remote: &[BattlerSlot]) -> Self {
        self.battler_slots = local.iter().copied().collect();
        self.opponent_slots = remote.iter().copied().collect();
        self
    }
}

/// Per-turn metadata the host writes ahead of a command buffer.
///
/// Slots and mask bits are in the numbering of whoever produced the value; the receiver remaps
/// them through its [`SlotMap`](crate::SlotMap) before writing.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TurnContext {
    /// Slot acting this turn.
    pub attacker: BattlerSlot,
    /// Slot targeted this turn.
    pub target: BattlerSlot,
    /// One bit per slot that is absent from the field.
    pub absent_mask: u8,
    /// Identifier of the effect currently resolving.
    pub active_effect: u16,
}

/// Symbolic stage names that may appear in `duel_stage` instead of a number.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageMarker {
    /// Still in the lobby / handshake.
    Lobby,
    /// Turns are being exchanged.
    Battle,
    /// The match is winding down.
    Ending,
}

/// The payload of `duel_stage`: either a round counter or a symbolic marker.
///
/// ```
/// use duel_link::{StageMarker, StageTag};
///
/// let numeric: StageTag = serde_json::from_str("4").unwrap();
/// assert_eq!(numeric, StageTag::Number(4));
/// let marker: StageTag = serde_json::from_str(r#""battle""#).unwrap();
/// assert_eq!(marker, StageTag::Marker(StageMarker::Battle));
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StageTag {
    /// Completed-round counter.
    Number(u32),
    /// Symbolic stage.
    Marker(StageMarker),
}

impl std::fmt::Display for StageTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageTag::Number(n) => write!(f, "{}", n),
            StageTag::Marker(StageMarker::Lobby) => f.write_str("lobby"),
            StageTag::Marker(StageMarker::Battle) => f.write_str("battle"),
            StageTag::Marker(StageMarker::Ending) => f.write_str("ending"),
        }
    }
}

/// A single relay message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// EXCHANGE: the sender's roster, opaque to the controller.
    DuelParty {
        /// Raw roster bytes.
        roster: Vec<u8>,
    },
    /// EXCHANGE: the sender's trainer record.
    DuelPlayerInfo(PlayerIdentity),
    /// READY: the sender has sent and received everything EXCHANGE needs.
    DuelReady,
    /// EXCHANGE (host only): the shared randomness seed.
    DuelSeed {
        /// Seed read from the host simulation.
        seed: u32,
    },
    /// A host command buffer, optionally carrying turn context.
    DuelBufferCmd {
        /// Slot in the sender's numbering.
        battler_slot: BattlerSlot,
        /// Sender's generation marker for this buffer.
        seq: u32,
        /// Raw buffer bytes.
        buffer: Vec<u8>,
        /// Turn context, host only.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        turn_context: Option<TurnContext>,
    },
    /// A guest command buffer.
    DuelBufferResp {
        /// Slot in the sender's numbering.
        battler_slot: BattlerSlot,
        /// Sender's generation marker for this buffer.
        seq: u32,
        /// Raw buffer bytes.
        buffer: Vec<u8>,
        /// Never sent by a well-behaved guest; decoded so a host can report it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        turn_context: Option<TurnContext>,
    },
    /// Acknowledges a buffer. `battler_slot` is in the numbering of the buffer's sender.
    DuelBufferAck {
        /// Slot as named by the buffer being acknowledged.
        battler_slot: BattlerSlot,
        /// Sequence number being acknowledged.
        seq: u32,
    },
    /// The sender moved to a new stage.
    DuelStage {
        /// The new stage.
        stage: StageTag,
    },
    /// The sender's match is over, from the sender's perspective.
    DuelEnd {
        /// The sender's outcome.
        outcome: Outcome,
    },
    /// Sent by the relay when a session participant drops.
    DuelOpponentDisconnected {
        /// The participant that left.
        peer_id: PeerId,
    },
    /// Liveness check.
    DuelPing {
        /// Echoed back in the pong.
        nonce: u32,
    },
    /// Answer to a `duel_ping`.
    DuelPong {
        /// Nonce of the ping being answered.
        nonce: u32,
    },
}

impl Message {
    /// Returns the wire name (the `type` tag) of this message.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Message::DuelParty { .. } => "duel_party",
            Message::DuelPlayerInfo(_) => "duel_player_info",
            Message::DuelReady => "duel_ready",
            Message::DuelSeed { .. } => "duel_seed",
            Message::DuelBufferCmd { .. } => "duel_buffer_cmd",
            Message::DuelBufferResp { .. } => "duel_buffer_resp",
            Message::DuelBufferAck { .. } => "duel_buffer_ack",
            Message::DuelStage { .. } => "duel_stage",
            Message::DuelEnd { .. } => "duel_end",
            Message::DuelOpponentDisconnected { .. } => "duel_opponent_disconnected",
            Message::DuelPing { .. } => "duel_ping",
            Message::DuelPong { .. } => "duel_pong",
        }
    }

    /// Returns `true` for messages that belong to the handshake.
    #[must_use]
    pub const fn is_handshake(&self) -> bool {
        matches!(
            self,
            Message::DuelParty { .. }
                | Message::DuelPlayerInfo(_)
                | Message::DuelReady
                | Message::DuelSeed { .. }
        )
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
    fn unit_variant_is_just_a_tag() {
        let json = serde_json::to_string(&Message::DuelReady).unwrap();
        assert_eq!(json, r#"{"type":"duel_ready"}"#);
    }

    #[test]
    fn player_info_fields_sit_next_to_the_tag() {
        let identity =
            PlayerIdentity::new("RED", 12345).with_slots(&[BattlerSlot::new(0)], &[BattlerSlot::new(1)]);
        let json = serde_json::to_string(&Message::DuelPlayerInfo(identity.clone())).unwrap();
        assert!(json.starts_with(r#"{"type":"duel_player_info","name":"RED","trainer_id":12345"#));
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Message::DuelPlayerInfo(identity));
    }

    #[test]
    fn identity_without_slots_still_decodes() {
        let back: Message =
            serde_json::from_str(r#"{"type":"duel_player_info","name":"BLUE","trainer_id":7}"#)
                .unwrap();
        match back {
            Message::DuelPlayerInfo(identity) => {
                assert_eq!(identity.name, "BLUE");
                assert!(identity.battler_slots.is_empty());
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn guest_buffer_omits_absent_turn_context() {
        let msg = Message::DuelBufferResp {
            battler_slot: BattlerSlot::new(0),
            seq: 3,
            buffer: vec![1, 2],
            turn_context: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"type":"duel_buffer_resp","battler_slot":0,"seq":3,"buffer":[1,2]}"#
        );
    }

    #[test]
    fn host_buffer_carries_turn_context() {
        let msg = Message::DuelBufferCmd {
            battler_slot: BattlerSlot::new(0),
            seq: 1,
            buffer: vec![9],
            turn_context: Some(TurnContext {
                attacker: BattlerSlot::new(0),
                target: BattlerSlot::new(1),
                absent_mask: 0b10,
                active_effect: 42,
            }),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""turn_context":{"attacker":0,"target":1,"absent_mask":2,"active_effect":42}"#));
    }

    #[test]
    fn stage_accepts_numbers_and_markers() {
        let numeric: Message = serde_json::from_str(r#"{"type":"duel_stage","stage":3}"#).unwrap();
        assert_eq!(
            numeric,
            Message::DuelStage {
                stage: StageTag::Number(3)
            }
        );
        let marker: Message =
            serde_json::from_str(r#"{"type":"duel_stage","stage":"ending"}"#).unwrap();
        assert_eq!(
            marker,
            Message::DuelStage {
                stage: StageTag::Marker(StageMarker::Ending)
            }
        );
        assert_eq!(StageTag::Marker(StageMarker::Lobby).to_string(), "lobby");
    }

    #[test]
    fn relay_disconnect_notice_decodes() {
        let msg: Message =
            serde_json::from_str(r#"{"type":"duel_opponent_disconnected","peer_id":"blue"}"#)
                .unwrap();
        assert_eq!(
            msg,
            Message::DuelOpponentDisconnected {
                peer_id: PeerId::new("blue")
            }
        );
        assert_eq!(msg.kind(), "duel_opponent_disconnected");
        assert!(!msg.is_handshake());
    }

    #[test]
    fn kind_matches_serialized_tag() {
        let samples = [
            Message::DuelParty { roster: vec![1] },
            Message::DuelReady,
            Message::DuelSeed { seed: 5 },
            Message::DuelBufferAck {
                battler_slot: BattlerSlot::new(1),
                seq: 2,
            },
            Message::DuelEnd {
                outcome: Outcome::Draw,
            },
            Message::DuelPing { nonce: 1 },
            Message::DuelPong { nonce: 1 },
        ];
        for msg in samples {
            let value: serde_json::Value = serde_json::to_value(&msg).unwrap();
            assert_eq!(value["type"], msg.kind());
        }
    }
}
