//! Owns all piece and block state for a single torrent.
//!
//! This is the torrent-wide authority a single-seed session didn't need,
//! generalized to many concurrent peers: it arbitrates which block each
//! peer should request next, verifies completed pieces, and manages the
//! endgame duplicate-request dance. All mutation happens through its
//! methods; callers (peer sessions) never touch piece or block state
//! directly, mirroring how `disk::io::Torrent` is the sole owner of
//! on-disk piece assembly state.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use sha1::{Digest, Sha1};

use crate::{
    block_count, block_len,
    error::PieceError,
    piece_picker::PiecePicker,
    Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash,
};

/// A single outstanding block request, tracked so a timeout or peer
/// disconnect can release it.
#[derive(Clone, Copy)]
struct InFlightBlock {
    peer: PeerId,
    requested_at: Instant,
}

struct PieceState {
    expected_hash: Sha1Hash,
    len: u32,
    /// Blocks received so far, keyed by byte offset within the piece, along
    /// with the peer that delivered each one (so a hash mismatch can
    /// attribute the failure to every contributing peer, not just whoever
    /// delivered the final block).
    blocks: HashMap<u32, (PeerId, Vec<u8>)>,
    /// Requests currently outstanding for this piece's blocks, keyed by
    /// `(offset, peer)` so the same block can be in flight to more than
    /// one peer during endgame.
    in_flight: HashMap<(u32, PeerId), InFlightBlock>,
    verified: bool,
}

impl PieceState {
    fn is_complete(&self, piece_len: u32) -> bool {
        self.blocks.len() == block_count(piece_len)
    }

    fn concat_and_hash(&self, piece_len: u32) -> Sha1Hash {
        debug_assert_eq!(self.blocks.len(), block_count(piece_len));
        let mut hasher = Sha1::new();
        let mut offsets: Vec<&u32> = self.blocks.keys().collect();
        offsets.sort_unstable();
        for offset in offsets {
            hasher.update(&self.blocks[offset].1);
        }
        let digest = hasher.finalize();
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest);
        hash
    }

    /// The distinct peers that delivered at least one of this piece's
    /// blocks, used to attribute a hash mismatch to every contributor
    /// rather than only whoever delivered the final block.
    fn contributing_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.blocks.values().map(|(peer, _)| *peer).collect();
        peers.sort_unstable();
        peers.dedup();
        peers
    }
}

/// A fully assembled, verified piece ready to be handed to disk I/O.
#[derive(Debug)]
pub(crate) struct CompletedPiece {
    pub index: PieceIndex,
    /// Blocks in ascending offset order, ready to be written contiguously.
    pub blocks: Vec<Vec<u8>>,
}

/// The outcome of [`PieceManager::on_block_received`].
#[derive(Debug)]
pub(crate) enum BlockOutcome {
    /// The block was stored; the piece isn't complete yet.
    Stored,
    /// The piece is now complete and its hash matched.
    PieceVerified(CompletedPiece),
    /// The piece is now complete but its hash did not match; all blocks
    /// were reset to `Missing` and the contributing peers are returned so
    /// the caller can penalize them.
    PieceFailed {
        index: PieceIndex,
        offending_peers: Vec<PeerId>,
    },
    /// The block was not currently requested or had an unexpected length,
    /// and was ignored.
    Rejected,
}

/// Owns piece/block state for one torrent: which pieces and blocks are
/// missing, requested, or verified, and arbitrates requests across all of
/// the torrent's peer sessions.
pub(crate) struct PieceManager {
    picker: PiecePicker,
    pieces: HashMap<PieceIndex, PieceState>,
    piece_hashes: Vec<Sha1Hash>,
    piece_len: u32,
    last_piece_len: u32,
    /// Below this many remaining pieces, duplicate requests to multiple
    /// peers are allowed (endgame mode).
    endgame_threshold: usize,
    max_global_requests_per_piece: usize,
}

impl PieceManager {
    pub fn new(
        piece_hashes: Vec<Sha1Hash>,
        piece_len: u32,
        last_piece_len: u32,
        endgame_threshold: usize,
    ) -> Self {
        let piece_count = piece_hashes.len();
        Self {
            picker: PiecePicker::new(piece_count),
            pieces: HashMap::new(),
            piece_hashes,
            piece_len,
            last_piece_len,
            endgame_threshold,
            max_global_requests_per_piece: 4,
        }
    }

    fn piece_size(&self, index: PieceIndex) -> u32 {
        if index + 1 == self.piece_hashes.len() {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    fn is_endgame(&self) -> bool {
        self.picker.remaining_count() <= self.endgame_threshold
    }

    pub fn set_peer_bitfield(&mut self, bitfield: &Bitfield) -> Result<bool, PieceError> {
        self.picker.register_availability(bitfield)
    }

    /// Registers that a peer just announced (via `Have`) that it now has
    /// `index`. Returns whether this makes us interested in the peer.
    pub fn on_have(&mut self, index: PieceIndex) -> bool {
        self.picker.register_have(index)
    }

    /// Returns the next block to request from a peer with the given
    /// bitfield, respecting the peer's own outstanding-request cap
    /// (enforced by the caller via `outstanding < cap`) and global
    /// in-flight limits per piece.
    pub fn next_request(
        &mut self,
        peer: PeerId,
        peer_bitfield: &Bitfield,
    ) -> Option<BlockInfo> {
        // piece-completion-first: prefer continuing an already-started
        // piece over picking a new one
        let in_progress: Vec<PieceIndex> = self.pieces.keys().copied().collect();
        for index in in_progress {
            if let Some(block) = self.next_block_for_piece(index, peer, peer_bitfield) {
                return Some(block);
            }
        }

        if let Some(index) = self.picker.pick_piece(peer_bitfield) {
            self.pieces.entry(index).or_insert_with(|| PieceState {
                expected_hash: self.piece_hashes[index],
                len: self.piece_size(index),
                blocks: HashMap::new(),
                in_flight: HashMap::new(),
                verified: false,
            });
            return self.next_block_for_piece(index, peer, peer_bitfield);
        }

        // endgame: duplicate a request for an already in-flight piece even
        // though no fresh piece could be picked
        if self.is_endgame() {
            let candidates: Vec<PieceIndex> = self.pieces.keys().copied().collect();
            for index in candidates {
                if let Some(block) = self.endgame_block_for_piece(index, peer, peer_bitfield) {
                    return Some(block);
                }
            }
        }

        None
    }

    fn next_block_for_piece(
        &mut self,
        index: PieceIndex,
        peer: PeerId,
        peer_bitfield: &Bitfield,
    ) -> Option<BlockInfo> {
        let has_piece = peer_bitfield.get(index).map(|b| *b).unwrap_or(false);
        if !has_piece {
            return None;
        }
        let piece_len = self.piece_size(index);
        let state = self.pieces.get_mut(&index)?;
        if state.verified {
            return None;
        }
        let block_count = block_count(piece_len);
        for block_index in 0..block_count {
            let offset = block_index as u32 * crate::BLOCK_LEN;
            if state.blocks.contains_key(&offset) {
                continue;
            }
            let already_requested = state
                .in_flight
                .keys()
                .any(|(o, _)| *o == offset);
            if already_requested {
                continue;
            }
            state.in_flight.insert(
                (offset, peer),
                InFlightBlock {
                    peer,
                    requested_at: Instant::now(),
                },
            );
            return Some(BlockInfo {
                piece_index: index,
                offset,
                len: block_len(piece_len, block_index),
            });
        }
        None
    }

    fn endgame_block_for_piece(
        &mut self,
        index: PieceIndex,
        peer: PeerId,
        peer_bitfield: &Bitfield,
    ) -> Option<BlockInfo> {
        let has_piece = peer_bitfield.get(index).map(|b| *b).unwrap_or(false);
        if !has_piece {
            return None;
        }
        let piece_len = self.piece_size(index);
        let state = self.pieces.get_mut(&index)?;
        if state.verified {
            return None;
        }
        let block_count = block_count(piece_len);
        for block_index in 0..block_count {
            let offset = block_index as u32 * crate::BLOCK_LEN;
            if state.blocks.contains_key(&offset) {
                continue;
            }
            let request_count =
                state.in_flight.keys().filter(|(o, _)| *o == offset).count();
            if request_count == 0 || request_count < self.max_global_requests_per_piece {
                let key = (offset, peer);
                if state.in_flight.contains_key(&key) {
                    continue;
                }
                state.in_flight.insert(
                    key,
                    InFlightBlock {
                        peer,
                        requested_at: Instant::now(),
                    },
                );
                return Some(BlockInfo {
                    piece_index: index,
                    offset,
                    len: block_len(piece_len, block_index),
                });
            }
        }
        None
    }

    /// Records a received block. If this completes the piece, verifies its
    /// hash and returns the outcome.
    pub fn on_block_received(
        &mut self,
        info: BlockInfo,
        data: Vec<u8>,
        peer: PeerId,
    ) -> BlockOutcome {
        let piece_len = self.piece_size(info.piece_index);
        let state = match self.pieces.get_mut(&info.piece_index) {
            Some(s) => s,
            None => return BlockOutcome::Rejected,
        };

        let was_requested = state.in_flight.remove(&(info.offset, peer)).is_some();
        if !was_requested || data.len() as u32 != info.len {
            return BlockOutcome::Rejected;
        }

        // endgame: cancel duplicate in-flight requests for this block now
        // that one copy has arrived
        state.in_flight.retain(|(offset, _), _| *offset != info.offset);

        state.blocks.insert(info.offset, (peer, data));

        if !state.is_complete(piece_len) {
            return BlockOutcome::Stored;
        }

        let hash = state.concat_and_hash(piece_len);
        if hash == state.expected_hash {
            state.verified = true;
            self.picker.received_piece(info.piece_index);
            let mut offsets: Vec<&u32> = state.blocks.keys().collect();
            offsets.sort_unstable();
            let blocks = offsets
                .into_iter()
                .map(|o| state.blocks[o].1.clone())
                .collect();
            self.pieces.remove(&info.piece_index);
            BlockOutcome::PieceVerified(CompletedPiece {
                index: info.piece_index,
                blocks,
            })
        } else {
            self.picker.reset_piece(info.piece_index);
            let offending_peers = state.contributing_peers();
            self.pieces.remove(&info.piece_index);
            BlockOutcome::PieceFailed {
                index: info.piece_index,
                offending_peers,
            }
        }
    }

    /// Called when a request timed out without a response.
    pub fn on_block_cancelled_by_timeout(&mut self, info: BlockInfo, peer: PeerId) {
        if let Some(state) = self.pieces.get_mut(&info.piece_index) {
            state.in_flight.remove(&(info.offset, peer));
        }
    }

    /// Releases all blocks in flight to a peer that has disconnected.
    pub fn on_peer_gone(&mut self, peer: PeerId) {
        for state in self.pieces.values_mut() {
            state.in_flight.retain(|(_, p), _| *p != peer);
        }
    }

    /// Returns the in-flight requests that should be cancelled against
    /// other peers because a duplicate (endgame) request already
    /// succeeded.
    pub fn request_cancellations(&mut self) -> Vec<(PeerId, BlockInfo)> {
        // Cancellation bookkeeping happens inline in `on_block_received`
        // (duplicate in-flight entries for a completed block are dropped
        // immediately), so there's nothing left to report separately;
        // this stays as an explicit extension point for a future
        // peer-side `Cancel` message.
        Vec::new()
    }

    pub fn progress(&self) -> (usize, usize) {
        (self.picker.verified_count(), self.picker.piece_count())
    }

    pub fn bitmap(&self) -> Vec<bool> {
        (0..self.picker.piece_count())
            .map(|i| !self.picker.is_missing(i) && self.pieces.get(&i).map_or(true, |s| s.verified))
            .collect()
    }

    /// Marks `index` verified without requiring its blocks to be
    /// re-downloaded or re-hashed, used when resuming from a checkpoint
    /// whose file sizes the caller has already validated.
    pub fn restore_from_checkpoint(&mut self, verified_indices: &[PieceIndex]) {
        for &index in verified_indices {
            self.picker.restore_verified(index);
        }
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

    fn hash_of(data: &[u8]) -> Sha1Hash {
        let digest = Sha1::digest(data);
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest);
        hash
    }

    #[test]
    fn completes_single_block_piece_and_verifies() {
        let block_data = vec![7u8; crate::BLOCK_LEN as usize];
        let hash = hash_of(&block_data);
        let mut manager =
            PieceManager::new(vec![hash], crate::BLOCK_LEN, crate::BLOCK_LEN, 16);
        let peer = [1u8; 20];
        manager.set_peer_bitfield(&bitfield(&[true])).unwrap();

        let request = manager.next_request(peer, &bitfield(&[true])).unwrap();
        assert_eq!(request.piece_index, 0);

        let outcome = manager.on_block_received(request, block_data, peer);
        assert!(matches!(outcome, BlockOutcome::PieceVerified(_)));
        assert_eq!(manager.progress(), (1, 1));
    }

    #[test]
    fn hash_mismatch_resets_piece_to_missing() {
        let expected = hash_of(b"not-this");
        let mut manager =
            PieceManager::new(vec![expected], crate::BLOCK_LEN, crate::BLOCK_LEN, 16);
        let peer = [2u8; 20];
        manager.set_peer_bitfield(&bitfield(&[true])).unwrap();
        let request = manager.next_request(peer, &bitfield(&[true])).unwrap();

        let wrong_data = vec![0u8; crate::BLOCK_LEN as usize];
        let outcome = manager.on_block_received(request, wrong_data, peer);
        assert!(matches!(outcome, BlockOutcome::PieceFailed { .. }));

        // piece should be requestable again
        let request = manager.next_request(peer, &bitfield(&[true]));
        assert!(request.is_some());
    }

    #[test]
    fn rejects_block_that_was_not_requested() {
        let mut manager =
            PieceManager::new(vec![[0u8; 20]], crate::BLOCK_LEN, crate::BLOCK_LEN, 16);
        let peer = [3u8; 20];
        let bogus = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: crate::BLOCK_LEN,
        };
        let outcome =
            manager.on_block_received(bogus, vec![0u8; crate::BLOCK_LEN as usize], peer);
        assert!(matches!(outcome, BlockOutcome::Rejected));
    }

    /// `spec.md` §8 scenario S4: when a multi-block piece fails its hash
    /// check, every peer that contributed a block is returned, not just
    /// whoever delivered the last one.
    #[test]
    fn hash_mismatch_attributes_failure_to_every_contributing_peer() {
        let expected = hash_of(b"not-this-either");
        let mut manager = PieceManager::new(
            vec![expected],
            2 * crate::BLOCK_LEN,
            2 * crate::BLOCK_LEN,
            16,
        );
        let peer_a = [4u8; 20];
        let peer_b = [5u8; 20];
        manager.set_peer_bitfield(&bitfield(&[true])).unwrap();

        let request_a = manager.next_request(peer_a, &bitfield(&[true])).unwrap();
        let outcome_a = manager.on_block_received(
            request_a,
            vec![1u8; crate::BLOCK_LEN as usize],
            peer_a,
        );
        assert!(matches!(outcome_a, BlockOutcome::Stored));

        let request_b = manager.next_request(peer_b, &bitfield(&[true])).unwrap();
        let outcome_b = manager.on_block_received(
            request_b,
            vec![2u8; crate::BLOCK_LEN as usize],
            peer_b,
        );
        match outcome_b {
            BlockOutcome::PieceFailed { offending_peers, .. } => {
                assert_eq!(offending_peers.len(), 2);
                assert!(offending_peers.contains(&peer_a));
                assert!(offending_peers.contains(&peer_b));
            }
            other => panic!("expected PieceFailed, got {other:?}"),
        }
    }

    #[test]
    fn on_peer_gone_frees_its_in_flight_blocks() {
        let mut manager = PieceManager::new(
            vec![[0u8; 20]],
            2 * crate::BLOCK_LEN,
            2 * crate::BLOCK_LEN,
            16,
        );
        let peer = [4u8; 20];
        manager.set_peer_bitfield(&bitfield(&[true])).unwrap();
        manager.next_request(peer, &bitfield(&[true]));
        manager.on_peer_gone(peer);
        // requesting again from the same (now "new") peer should still
        // find the freed block
        let request = manager.next_request(peer, &bitfield(&[true]));
        assert!(request.is_some());
    }
}
