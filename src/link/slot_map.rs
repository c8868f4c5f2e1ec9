//! Translation between the peer's battler numbering and ours.
//!
//! Both simulations usually call their own battler slot 0. Each peer therefore declares, in its
//! identity record, which slots it controls and which it assigns to its opponent. The receiver
//! pairs them positionally with its own layout: the peer's `battler_slots[i]` is our
//! `remote[i]`, and the peer's `opponent_slots[i]` is our `local[i]`.

use smallvec::SmallVec;

use crate::network::messages::{PlayerIdentity, TurnContext};
use crate::BattlerSlot;

/// Why a peer's declared layout cannot be paired with ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotMismatch {
    /// Number of slots we expect the peer to control.
    pub expected_peer_slots: usize,
    /// Number of slots the peer claims to control.
    pub declared_peer_slots: usize,
    /// Number of slots we control.
    pub expected_opponent_slots: usize,
    /// Number of slots the peer assigns to us.
    pub declared_opponent_slots: usize,
}

impl std::fmt::Display for SlotMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "peer declares {}/{} slots, expected {}/{}",
            self.declared_peer_slots,
            self.declared_opponent_slots,
            self.expected_peer_slots,
            self.expected_opponent_slots
        )
    }
}

/// Bidirectional slot translation for one session.
///
/// ```
/// use duel_link::{BattlerSlot, PlayerIdentity, SlotMap};
///
/// // Both sides call themselves slot 0 and their opponent slot 1.
/// let ours = [BattlerSlot::new(0)];
/// let theirs = [BattlerSlot::new(1)];
/// let peer = PlayerIdentity::new("BLUE", 7).with_slots(&ours, &theirs);
///
/// let map = SlotMap::negotiate(&ours, &theirs, &peer).unwrap();
/// assert_eq!(map.to_local(BattlerSlot::new(0)), Some(BattlerSlot::new(1)));
/// assert_eq!(map.to_local(BattlerSlot::new(1)), Some(BattlerSlot::new(0)));
/// assert_eq!(map.to_local(BattlerSlot::new(5)), None);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotMap {
    /// `(peer numbering, local numbering)` pairs.
    pairs: SmallVec<[(BattlerSlot, BattlerSlot); 4]>,
    /// Subset of `pairs` naming slots the peer controls.
    peer_controlled: SmallVec<[BattlerSlot; 2]>,
}

impl SlotMap {
    /// Pairs the peer's declared layout with ours.
    ///
    /// # Errors
    ///
    /// Returns [`SlotMismatch`] when the slot counts on either side differ.
    pub fn negotiate(
        local_slots: &[BattlerSlot],
        remote_slots: &[BattlerSlot],
        peer: &PlayerIdentity,
    ) -> Result<Self, SlotMismatch> {
        if peer.battler_slots.len() != remote_slots.len()
            || peer.opponent_slots.len() != local_slots.len()
        {
            return Err(SlotMismatch {
                expected_peer_slots: remote_slots.len(),
                declared_peer_slots: peer.battler_slots.len(),
                expected_opponent_slots: local_slots.len(),
                declared_opponent_slots: peer.opponent_slots.len(),
            });
        }

        let mut pairs = SmallVec::new();
        pairs.extend(
            peer.battler_slots
                .iter()
                .copied()
                .zip(remote_slots.iter().copied()),
        );
        pairs.extend(
            peer.opponent_slots
                .iter()
                .copied()
                .zip(local_slots.iter().copied()),
        );
        Ok(Self {
            pairs,
            peer_controlled: remote_slots.iter().copied().collect(),
        })
    }

    /// Translates a slot named by the peer into our numbering.
    #[must_use]
    pub fn to_local(&self, peer_slot: BattlerSlot) -> Option<BattlerSlot> {
        self.pairs
            .iter()
            .find(|(peer, _)| *peer == peer_slot)
            .map(|(_, local)| *local)
    }

    /// Translates one of our slots into the peer's numbering.
    #[must_use]
    pub fn to_peer(&self, local_slot: BattlerSlot) -> Option<BattlerSlot> {
        self.pairs
            .iter()
            .find(|(_, local)| *local == local_slot)
            .map(|(peer, _)| *peer)
    }

    /// Translates a peer slot that the peer itself controls. Buffers may only name these.
    #[must_use]
    pub fn peer_controlled_to_local(&self, peer_slot: BattlerSlot) -> Option<BattlerSlot> {
        self.to_local(peer_slot)
            .filter(|local| self.peer_controlled.contains(local))
    }

    /// Rewrites an absentee mask from peer numbering to ours. Bits for unknown slots are dropped.
    #[must_use]
    pub fn remap_mask(&self, peer_mask: u8) -> u8 {
        self.pairs
            .iter()
            .filter(|(peer, _)| peer.mask_bit().is_some_and(|bit| peer_mask & bit != 0))
            .filter_map(|(_, local)| local.mask_bit())
            .fold(0, |mask, bit| mask | bit)
    }

    /// Rewrites a turn context from peer numbering to ours.
    ///
    /// Returns `None` when the attacker or target is not part of the negotiated layout.
    #[must_use]
    pub fn remap_context(&self, context: &TurnContext) -> Option<TurnContext> {
        Some(TurnContext {
            attacker: self.to_local(context.attacker)?,
            target: self.to_local(context.target)?,
            absent_mask: self.remap_mask(context.absent_mask),
            active_effect: context.active_effect,
        })
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

    fn slots(raw: &[u8]) -> Vec<BattlerSlot> {
        raw.iter().copied().map(BattlerSlot::new).collect()
    }

    fn mirrored_singles() -> SlotMap {
        let local = slots(&[0]);
        let remote = slots(&[1]);
        let peer = PlayerIdentity::new("BLUE", 1).with_slots(&local, &remote);
        SlotMap::negotiate(&local, &remote, &peer).unwrap()
    }

    #[test]
    fn singles_swap_zero_and_one() {
        let map = mirrored_singles();
        assert_eq!(map.to_local(BattlerSlot::new(0)), Some(BattlerSlot::new(1)));
        assert_eq!(map.to_peer(BattlerSlot::new(1)), Some(BattlerSlot::new(0)));
        assert_eq!(
            map.peer_controlled_to_local(BattlerSlot::new(0)),
            Some(BattlerSlot::new(1))
        );
        assert_eq!(map.peer_controlled_to_local(BattlerSlot::new(1)), None);
    }

    #[test]
    fn doubles_pair_positionally() {
        let local = slots(&[0, 2]);
        let remote = slots(&[1, 3]);
        let peer = PlayerIdentity::new("BLUE", 1).with_slots(&slots(&[0, 2]), &slots(&[1, 3]));
        let map = SlotMap::negotiate(&local, &remote, &peer).unwrap();

        assert_eq!(map.to_local(BattlerSlot::new(2)), Some(BattlerSlot::new(3)));
        assert_eq!(map.to_local(BattlerSlot::new(3)), Some(BattlerSlot::new(2)));
    }

    #[test]
    fn mismatched_counts_are_rejected() {
        let local = slots(&[0]);
        let remote = slots(&[1]);
        let peer = PlayerIdentity::new("BLUE", 1).with_slots(&slots(&[0, 2]), &slots(&[1]));
        let err = SlotMap::negotiate(&local, &remote, &peer).unwrap_err();
        assert_eq!(err.declared_peer_slots, 2);
        assert_eq!(err.expected_peer_slots, 1);
        assert!(err.to_string().contains("expected 1/1"));
    }

    #[test]
    fn mask_bits_follow_their_slots() {
        let map = mirrored_singles();
        assert_eq!(map.remap_mask(0b01), 0b10);
        assert_eq!(map.remap_mask(0b10), 0b01);
        assert_eq!(map.remap_mask(0b11), 0b11);
        // Slot 5 is not in the layout.
        assert_eq!(map.remap_mask(0b10_0000), 0);
    }

    #[test]
    fn context_is_remapped_or_rejected() {
        let map = mirrored_singles();
        let context = TurnContext {
            attacker: BattlerSlot::new(0),
            target: BattlerSlot::new(1),
            absent_mask: 0b10,
            active_effect: 77,
        };
        let local = map.remap_context(&context).unwrap();
        assert_eq!(local.attacker, BattlerSlot::new(1));
        assert_eq!(local.target, BattlerSlot::new(0));
        assert_eq!(local.absent_mask, 0b01);
        assert_eq!(local.active_effect, 77);

        let bogus = TurnContext {
            attacker: BattlerSlot::new(6),
            ..context
        };
        assert_eq!(map.remap_context(&bogus), None);
    }
}
