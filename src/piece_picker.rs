//! Rarest-first piece selection.
//!
//! [`PiecePicker`] only tracks two things: how many known peers have each
//! piece (its "availability"), and which pieces we still need. It hands out
//! piece indices in rarest-first order, which spreads demand evenly across
//! the swarm and keeps any single piece from being unobtainable because
//! every peer that had it left.

use crate::{error::PieceError, Bitfield, PieceIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Missing,
    /// A download has started for this piece; it's no longer a pick
    /// candidate for a fresh (non-endgame) request, but its availability
    /// count is still tracked.
    Requested,
    Verified,
}

/// Tracks piece availability across all connected peers and hands out the
/// next piece to request in rarest-first order.
pub(crate) struct PiecePicker {
    /// Per-piece state, indexed by piece index.
    pieces: Vec<State>,
    /// The number of peers known to have each piece, indexed by piece
    /// index. Used to implement rarest-first selection.
    availability: Vec<u32>,
}

impl PiecePicker {
    pub fn new(piece_count: usize) -> Self {
        Self {
            pieces: vec![State::Missing; piece_count],
            availability: vec![0; piece_count],
        }
    }

    /// Registers a peer's bitfield, bumping the availability count of every
    /// piece it has.
    ///
    /// Returns whether we're interested in this peer, i.e. whether it has
    /// at least one piece we're still missing.
    pub fn register_availability(
        &mut self,
        bitfield: &Bitfield,
    ) -> Result<bool, PieceError> {
        if bitfield.len() != self.pieces.len() {
            return Err(PieceError::InvalidBlockOffset {
                offset: bitfield.len() as u32,
                piece_len: self.pieces.len() as u32,
            });
        }
        let mut interested = false;
        for (index, has_piece) in bitfield.iter().enumerate() {
            if *has_piece {
                self.availability[index] += 1;
                if self.pieces[index] != State::Verified {
                    interested = true;
                }
            }
        }
        Ok(interested)
    }

    /// Registers that a single piece just became available from a peer,
    /// via a `Have` message rather than a full bitfield.
    pub fn register_have(&mut self, index: PieceIndex) -> bool {
        if let Some(count) = self.availability.get_mut(index) {
            *count += 1;
        }
        self.pieces.get(index).copied() != Some(State::Verified)
    }

    /// Removes a peer's contribution to piece availability, e.g. when it
    /// disconnects. `bitfield` should be the same one last registered for
    /// this peer.
    pub fn deregister_availability(&mut self, bitfield: &Bitfield) {
        for (index, has_piece) in bitfield.iter().enumerate() {
            if *has_piece {
                if let Some(count) = self.availability.get_mut(index) {
                    *count = count.saturating_sub(1);
                }
            }
        }
    }

    /// Picks the rarest `Missing` piece among the pieces this peer has,
    /// marking it `Requested`. Returns `None` if the peer has nothing left
    /// that we don't already have or aren't already downloading.
    pub fn pick_piece(&mut self, peer_bitfield: &Bitfield) -> Option<PieceIndex> {
        let peer_has: Vec<bool> = peer_bitfield.iter().map(|b| *b).collect();
        let best = self
            .pieces
            .iter()
            .enumerate()
            .filter(|(index, state)| {
                **state == State::Missing
                    && peer_has.get(*index).copied().unwrap_or(false)
            })
            .min_by_key(|(index, _)| (self.availability[*index], *index))
            .map(|(index, _)| index)?;
        self.pieces[best] = State::Requested;
        Some(best)
    }

    /// Marks a piece as verified (fully downloaded and hash-checked).
    pub fn received_piece(&mut self, index: PieceIndex) {
        if let Some(state) = self.pieces.get_mut(index) {
            *state = State::Verified;
        }
    }

    /// Resets a piece back to `Missing`, e.g. after a hash mismatch.
    pub fn reset_piece(&mut self, index: PieceIndex) {
        if let Some(state) = self.pieces.get_mut(index) {
            if *state != State::Verified {
                *state = State::Missing;
            }
        }
    }

    /// Seeds a piece as already verified, used when restoring from a
    /// checkpoint: the piece's bytes are trusted without re-downloading or
    /// re-hashing them.
    pub fn restore_verified(&mut self, index: PieceIndex) {
        if let Some(state) = self.pieces.get_mut(index) {
            *state = State::Verified;
        }
    }

    pub fn is_missing(&self, index: PieceIndex) -> bool {
        self.pieces.get(index) == Some(&State::Missing)
    }

    /// The number of pieces still missing or in progress (i.e. not yet
    /// verified). Used to detect whether endgame mode should engage.
    pub fn remaining_count(&self) -> usize {
        self.pieces
            .iter()
            .filter(|s| **s != State::Verified)
            .count()
    }

    pub fn verified_count(&self) -> usize {
        self.pieces.iter().filter(|s| **s == State::Verified).count()
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::prelude::{BitVec, Msb0};

    fn bitfield(bits: &[bool]) -> Bitfield {
        let mut bf: BitVec<Msb0, u8> = BitVec::with_capacity(bits.len());
        for b in bits {
            bf.push(*b);
        }
        bf
    }

    #[test]
    fn picks_the_rarest_piece_first() {
        let mut picker = PiecePicker::new(3);
        // piece 0 is common (two peers), piece 1 is rare (one peer)
        picker
            .register_availability(&bitfield(&[true, true, false]))
            .unwrap();
        picker
            .register_availability(&bitfield(&[true, false, false]))
            .unwrap();

        let peer_has_all = bitfield(&[true, true, false]);
        let picked = picker.pick_piece(&peer_has_all).unwrap();
        assert_eq!(picked, 1, "rarer piece 1 should be picked before piece 0");
    }

    #[test]
    fn does_not_pick_pieces_peer_lacks() {
        let mut picker = PiecePicker::new(2);
        picker
            .register_availability(&bitfield(&[true, true]))
            .unwrap();
        let peer_only_has_first = bitfield(&[true, false]);
        assert_eq!(picker.pick_piece(&peer_only_has_first), Some(0));
        assert_eq!(picker.pick_piece(&peer_only_has_first), None);
    }

    #[test]
    fn verified_piece_is_never_picked_again() {
        let mut picker = PiecePicker::new(1);
        picker.register_availability(&bitfield(&[true])).unwrap();
        let all = bitfield(&[true]);
        assert_eq!(picker.pick_piece(&all), Some(0));
        picker.received_piece(0);
        assert_eq!(picker.remaining_count(), 0);
        assert_eq!(picker.verified_count(), 1);
    }

    #[test]
    fn reset_after_failed_hash_makes_piece_pickable_again() {
        let mut picker = PiecePicker::new(1);
        picker.register_availability(&bitfield(&[true])).unwrap();
        let all = bitfield(&[true]);
        picker.pick_piece(&all);
        picker.reset_piece(0);
        assert_eq!(picker.pick_piece(&all), Some(0));
    }
}
