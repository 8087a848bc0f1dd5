//! Piece selection and per-piece block bookkeeping.
//!
//! The picker tracks which pieces we have, which are being downloaded, and
//! how many peers have each piece. Block granularity bookkeeping for an
//! in-progress piece lives in [`PieceDownload`], owned by the peer session
//! that is downloading the piece.

use crate::{block_count, block_len, Bitfield, BlockInfo, PieceIndex, BLOCK_LEN};

/// The state of one block of an in-progress piece download.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BlockState {
    Free,
    Requested,
    Received,
}

/// Tracks the block requests of a single piece being downloaded.
pub(crate) struct PieceDownload {
    piece_index: PieceIndex,
    len: u32,
    blocks: Vec<BlockState>,
}

impl PieceDownload {
    pub fn new(piece_index: PieceIndex, len: u32) -> Self {
        Self {
            piece_index,
            len,
            blocks: vec![BlockState::Free; block_count(len)],
        }
    }

    pub fn piece_index(&self) -> PieceIndex {
        self.piece_index
    }

    /// Picks at most `count` free blocks to request, marking them requested
    /// and appending their infos to `out`.
    pub fn pick_blocks(&mut self, count: usize, out: &mut Vec<BlockInfo>) {
        let mut picked = 0;
        for (i, state) in self.blocks.iter_mut().enumerate() {
            if picked == count {
                break;
            }
            if *state == BlockState::Free {
                *state = BlockState::Requested;
                out.push(BlockInfo {
                    piece_index: self.piece_index,
                    offset: i as u32 * BLOCK_LEN,
                    len: block_len(self.len, i),
                });
                picked += 1;
            }
        }
    }

    /// Marks a block as downloaded.
    pub fn received_block(&mut self, block: BlockInfo) {
        debug_assert_eq!(block.piece_index, self.piece_index);
        let index = block.index_in_piece();
        debug_assert!(index < self.blocks.len());
        self.blocks[index] = BlockState::Received;
    }

    /// Frees a block whose request was rejected or cancelled so it can be
    /// picked again, here or by another peer session.
    pub fn return_block(&mut self, block: BlockInfo) {
        debug_assert_eq!(block.piece_index, self.piece_index);
        let index = block.index_in_piece();
        debug_assert!(index < self.blocks.len());
        if self.blocks[index] == BlockState::Requested {
            self.blocks[index] = BlockState::Free;
        }
    }

    /// The number of blocks not yet received.
    pub fn count_missing_blocks(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| **b != BlockState::Received)
            .count()
    }
}

/// Per-piece metadata the picker tracks.
#[derive(Clone, Copy, Debug, Default)]
struct Piece {
    /// The number of connected peers that have the piece.
    frequency: usize,
    /// Whether the piece is being downloaded by some peer session.
    is_pending: bool,
}

/// Picks the next most optimal piece to download. Shared by all of a
/// torrent's peer sessions.
pub(crate) struct PiecePicker {
    /// The pieces we have.
    own_pieces: Bitfield,
    pieces: Vec<Piece>,
}

impl PiecePicker {
    pub fn new(piece_count: usize) -> Self {
        let mut own_pieces = Bitfield::with_capacity(piece_count);
        own_pieces.resize(piece_count, false);
        Self {
            own_pieces,
            pieces: vec![Piece::default(); piece_count],
        }
    }

    pub fn own_pieces(&self) -> &Bitfield {
        &self.own_pieces
    }

    /// Whether we have every piece.
    pub fn is_seed(&self) -> bool {
        self.own_pieces.all()
    }

    /// Registers a peer's full piece availability. Returns whether the peer
    /// has any piece we still want, i.e. whether we are interested.
    pub fn register_availability(&mut self, pieces: &Bitfield) -> bool {
        debug_assert_eq!(pieces.len(), self.pieces.len());
        let mut interested = false;
        for (index, has_piece) in pieces.iter().enumerate() {
            if *has_piece {
                self.pieces[index].frequency += 1;
                if !self.own_pieces[index] {
                    interested = true;
                }
            }
        }
        interested
    }

    /// Registers that a peer announced one more piece. Returns whether this
    /// makes the peer interesting to us.
    pub fn register_piece_availability(&mut self, index: PieceIndex) -> bool {
        debug_assert!(index < self.pieces.len());
        self.pieces[index].frequency += 1;
        !self.own_pieces[index]
    }

    /// Picks the next piece to download from a peer with the given pieces,
    /// marking it pending. Returns `None` if the peer has nothing we want
    /// or everything it has is already being downloaded.
    pub fn pick_piece(&mut self, peer_pieces: &Bitfield) -> Option<PieceIndex> {
        debug_assert_eq!(peer_pieces.len(), self.pieces.len());
        for (index, has_piece) in peer_pieces.iter().enumerate() {
            if *has_piece
                && !self.own_pieces[index]
                && !self.pieces[index].is_pending
            {
                self.pieces[index].is_pending = true;
                return Some(index);
            }
        }
        None
    }

    /// Returns a pending piece into the pickable pool, e.g. when the session
    /// downloading it disconnected.
    pub fn unpick_piece(&mut self, index: PieceIndex) {
        debug_assert!(index < self.pieces.len());
        self.pieces[index].is_pending = false;
    }

    /// Records a fully downloaded and verified piece.
    pub fn received_piece(&mut self, index: PieceIndex) {
        debug_assert!(index < self.pieces.len());
        self.own_pieces.set(index, true);
        self.pieces[index].is_pending = false;
    }

    /// A piece failed its hash check (or its flush): forget it so it can be
    /// downloaded again.
    pub fn piece_failed(&mut self, index: PieceIndex) {
        debug_assert!(index < self.pieces.len());
        self.own_pieces.set(index, false);
        self.pieces[index].is_pending = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_set(n: usize) -> Bitfield {
        let mut b = Bitfield::with_capacity(n);
        b.resize(n, true);
        b
    }

    #[test]
    fn test_pick_and_receive() {
        let mut picker = PiecePicker::new(3);
        let peer_pieces = all_set(3);

        assert!(picker.register_availability(&peer_pieces));
        assert_eq!(picker.pick_piece(&peer_pieces), Some(0));
        // piece 0 is now pending so the next pick skips it
        assert_eq!(picker.pick_piece(&peer_pieces), Some(1));

        picker.received_piece(0);
        picker.received_piece(1);
        assert_eq!(picker.pick_piece(&peer_pieces), Some(2));
        picker.received_piece(2);
        assert!(picker.is_seed());
        assert_eq!(picker.pick_piece(&peer_pieces), None);
    }

    #[test]
    fn test_unpick_makes_piece_pickable_again() {
        let mut picker = PiecePicker::new(2);
        let peer_pieces = all_set(2);
        assert_eq!(picker.pick_piece(&peer_pieces), Some(0));
        picker.unpick_piece(0);
        assert_eq!(picker.pick_piece(&peer_pieces), Some(0));
    }

    #[test]
    fn test_piece_download_block_lifecycle() {
        let len = 2 * BLOCK_LEN + 100;
        let mut download = PieceDownload::new(0, len);
        assert_eq!(download.count_missing_blocks(), 3);

        let mut blocks = Vec::new();
        download.pick_blocks(2, &mut blocks);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].offset, 0);
        assert_eq!(blocks[1].offset, BLOCK_LEN);

        // a rejected block becomes pickable again
        download.return_block(blocks[1]);
        let mut repicked = Vec::new();
        download.pick_blocks(2, &mut repicked);
        assert_eq!(repicked[0].offset, BLOCK_LEN);
        // the last block is short
        assert_eq!(repicked[1].len, 100);

        download.received_block(blocks[0]);
        download.received_block(repicked[0]);
        download.received_block(repicked[1]);
        assert_eq!(download.count_missing_blocks(), 0);
    }
}
