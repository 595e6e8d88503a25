//! Bookkeeping of a single piece's blocks while the piece is being
//! downloaded.

use crate::{block_count, block_len, BlockInfo, PieceIndex};

/// The states a block of an in-progress piece goes through.
///
/// A block starts out free, is marked requested when handed to a peer
/// session, and received when its bytes arrived. Choking and disconnects
/// return requested blocks to free; a failed piece hash returns all of them.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum BlockState {
    Free,
    Requested,
    Received,
}

/// Tracks the state of a piece's blocks while the swarm downloads it.
///
/// The assembly buffer itself lives with the disk task; this type only owns
/// the request-side state the scheduler needs.
#[derive(Debug)]
pub(crate) struct PieceDownload {
    index: PieceIndex,
    len: u32,
    blocks: Vec<BlockState>,
}

impl PieceDownload {
    pub fn new(index: PieceIndex, len: u32) -> Self {
        Self {
            index,
            len,
            blocks: vec![BlockState::Free; block_count(len)],
        }
    }

    pub fn piece_index(&self) -> PieceIndex {
        self.index
    }

    /// Marks up to `count` free blocks as requested and appends their infos
    /// to `blocks`.
    pub fn pick_blocks(&mut self, count: usize, blocks: &mut Vec<BlockInfo>) {
        if count == 0 {
            return;
        }
        let mut picked = 0;
        let index = self.index;
        let len = self.len;
        for (block_index, state) in self.blocks.iter_mut().enumerate() {
            if picked == count {
                break;
            }
            if *state == BlockState::Free {
                *state = BlockState::Requested;
                blocks.push(BlockInfo {
                    piece_index: index,
                    offset: block_index as u32 * crate::BLOCK_LEN,
                    len: block_len(len, block_index),
                });
                picked += 1;
            }
        }
    }

    /// Returns the blocks currently out with some peer. In endgame these are
    /// the candidates for duplicate requests.
    pub fn requested_blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, state)| **state == BlockState::Requested)
            .map(move |(block_index, _)| self.block_info(block_index))
    }

    /// Marks a block as received. Returns false if the block wasn't in the
    /// requested state (e.g. it already arrived from another peer).
    pub fn received_block(&mut self, block: BlockInfo) -> bool {
        debug_assert_eq!(block.piece_index, self.index);
        let state = &mut self.blocks[block.index_in_piece()];
        if *state == BlockState::Requested {
            *state = BlockState::Received;
            true
        } else {
            false
        }
    }

    /// Returns a requested block to the free pool, e.g. when the requesting
    /// peer got choked or disconnected.
    pub fn free_block(&mut self, block: &BlockInfo) {
        debug_assert_eq!(block.piece_index, self.index);
        let state = &mut self.blocks[block.index_in_piece()];
        if *state == BlockState::Requested {
            *state = BlockState::Free;
        }
    }

    /// The number of blocks not yet received.
    pub fn count_missing_blocks(&self) -> usize {
        self.blocks
            .iter()
            .filter(|state| **state != BlockState::Received)
            .count()
    }

    /// True once every block of the piece has arrived.
    pub fn is_fully_received(&self) -> bool {
        self.count_missing_blocks() == 0
    }

    pub fn has_free_blocks(&self) -> bool {
        self.blocks.iter().any(|state| *state == BlockState::Free)
    }

    fn block_info(&self, block_index: usize) -> BlockInfo {
        BlockInfo {
            piece_index: self.index,
            offset: block_index as u32 * crate::BLOCK_LEN,
            len: block_len(self.len, block_index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCK_LEN;

    #[test]
    fn test_pick_blocks() {
        // a piece of two full blocks and a short last one
        let mut download = PieceDownload::new(3, 2 * BLOCK_LEN + 100);

        let mut blocks = Vec::new();
        download.pick_blocks(2, &mut blocks);
        assert_eq!(
            blocks,
            vec![
                BlockInfo {
                    piece_index: 3,
                    offset: 0,
                    len: BLOCK_LEN,
                },
                BlockInfo {
                    piece_index: 3,
                    offset: BLOCK_LEN,
                    len: BLOCK_LEN,
                },
            ]
        );

        // only the short block is left
        let mut blocks = Vec::new();
        download.pick_blocks(5, &mut blocks);
        assert_eq!(
            blocks,
            vec![BlockInfo {
                piece_index: 3,
                offset: 2 * BLOCK_LEN,
                len: 100,
            }]
        );
        assert!(!download.has_free_blocks());

        let mut blocks = Vec::new();
        download.pick_blocks(5, &mut blocks);
        assert!(blocks.is_empty());
    }

    #[test]
    fn test_received_and_freed_blocks() {
        let mut download = PieceDownload::new(0, 2 * BLOCK_LEN);
        let mut blocks = Vec::new();
        download.pick_blocks(2, &mut blocks);
        assert_eq!(download.count_missing_blocks(), 2);

        assert!(download.received_block(blocks[0]));
        // double receive is reported
        assert!(!download.received_block(blocks[0]));
        assert_eq!(download.count_missing_blocks(), 1);
        assert!(!download.is_fully_received());

        // the other block's peer got choked; the block becomes pickable again
        download.free_block(&blocks[1]);
        assert!(download.has_free_blocks());
        let mut repicked = Vec::new();
        download.pick_blocks(2, &mut repicked);
        assert_eq!(repicked, vec![blocks[1]]);

        assert!(download.received_block(blocks[1]));
        assert!(download.is_fully_received());

        // freeing a received block is a no-op
        download.free_block(&blocks[0]);
        assert!(download.is_fully_received());
    }

    #[test]
    fn test_requested_blocks_iter() {
        let mut download = PieceDownload::new(1, 2 * BLOCK_LEN);
        let mut blocks = Vec::new();
        download.pick_blocks(1, &mut blocks);
        let requested: Vec<_> = download.requested_blocks().collect();
        assert_eq!(requested, blocks);
    }
}
