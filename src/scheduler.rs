//! The per-torrent download scheduler.
//!
//! The scheduler is the single owner of the relation between blocks and the
//! peers downloading them: which blocks are still unrequested, which are out
//! with which peer, and which have arrived. Peer sessions only ever mutate
//! swarm state through it, behind the torrent's lock, so its invariants hold
//! under any interleaving of peer events.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use crate::{
    download::PieceDownload, piece_picker::PiecePicker,
    storage_info::StorageInfo, Bitfield, BlockInfo, PieceIndex,
};

/// Peers are identified within a torrent by their socket address; the
/// torrent's info hash is implied.
pub(crate) type PeerKey = SocketAddr;

/// Once at most this many pieces are missing the scheduler enters endgame
/// and hands the same block to multiple peers.
const ENDGAME_MISSING_PIECE_MAX: usize = 5;

/// The outcome of handing a received block to the scheduler.
#[derive(Debug, PartialEq)]
pub(crate) enum ReceivedBlock {
    /// The block was expected; it should be written to disk. Any listed
    /// duplicate holders were also expecting it and must be sent CANCEL for
    /// it.
    Accepted { cancels: Vec<PeerKey> },
    /// The block was not requested from this peer (late arrival after
    /// a cancel, or unsolicited). It is dropped without effect.
    Ignored,
}

#[derive(Debug)]
pub(crate) struct Scheduler {
    storage: StorageInfo,
    picker: PiecePicker,
    /// The pieces currently being downloaded.
    downloads: HashMap<PieceIndex, PieceDownload>,
    /// Per peer, the blocks we are waiting for from it.
    in_flight: HashMap<PeerKey, HashSet<BlockInfo>>,
    /// Per peer, the open pieces that peer's requests opened. Bounds how
    /// many pieces a single peer can hold open.
    opened: HashMap<PeerKey, HashSet<PieceIndex>>,
    max_in_flight: usize,
    max_pieces_per_peer: usize,
}

impl Scheduler {
    pub fn new(
        storage: StorageInfo,
        own: Bitfield,
        seed: u64,
        max_in_flight: usize,
        max_pieces_per_peer: usize,
    ) -> Self {
        debug_assert_eq!(own.len(), storage.piece_count);
        Self {
            storage,
            picker: PiecePicker::new(own, seed),
            downloads: HashMap::new(),
            in_flight: HashMap::new(),
            opened: HashMap::new(),
            max_in_flight,
            max_pieces_per_peer,
        }
    }

    pub fn own_pieces(&self) -> &Bitfield {
        self.picker.own_pieces()
    }

    pub fn missing_count(&self) -> usize {
        self.picker.missing_count()
    }

    pub fn is_complete(&self) -> bool {
        self.picker.is_complete()
    }

    /// True when few enough pieces remain that duplicate requests are
    /// allowed.
    pub fn is_endgame(&self) -> bool {
        self.picker.missing_count() <= ENDGAME_MISSING_PIECE_MAX
    }

    /// Records a fully verified, durably written piece. Returns endgame
    /// duplicates of the piece's blocks that are still out with peers; the
    /// caller sends a CANCEL for each.
    pub fn piece_verified(
        &mut self,
        index: PieceIndex,
    ) -> Vec<(PeerKey, BlockInfo)> {
        self.picker.received_piece(index);
        self.remove_download(index)
    }

    /// Resets a piece whose hash verification failed. Its blocks become
    /// pickable again on the next wake; any stray in-flight duplicates are
    /// returned for cancellation.
    pub fn piece_rejected(
        &mut self,
        index: PieceIndex,
    ) -> Vec<(PeerKey, BlockInfo)> {
        self.picker.clear_pending(index);
        self.remove_download(index)
    }

    fn remove_download(
        &mut self,
        index: PieceIndex,
    ) -> Vec<(PeerKey, BlockInfo)> {
        self.downloads.remove(&index);
        for opened in self.opened.values_mut() {
            opened.remove(&index);
        }
        let mut stray = Vec::new();
        for (peer, blocks) in self.in_flight.iter_mut() {
            blocks.retain(|block| {
                if block.piece_index == index {
                    stray.push((*peer, *block));
                    false
                } else {
                    true
                }
            });
        }
        stray
    }

    /// Registers a connected peer's full bitfield with the availability
    /// counts.
    pub fn peer_announced(&mut self, pieces: &Bitfield) {
        self.picker.register_peer_pieces(pieces);
    }

    /// Registers a HAVE announcement.
    pub fn peer_have(&mut self, index: PieceIndex) {
        self.picker.register_peer_have(index);
    }

    /// Removes a disconnected peer: its availability contribution and its
    /// in-flight blocks, which return to the queue.
    pub fn peer_gone(&mut self, peer: PeerKey, pieces: Option<&Bitfield>) {
        if let Some(pieces) = pieces {
            self.picker.unregister_peer_pieces(pieces);
        }
        self.cancel_peer(peer);
        self.in_flight.remove(&peer);
        self.opened.remove(&peer);
    }

    /// Returns every block in the peer's in-flight set to the queue, e.g.
    /// because the peer choked us. The peer stays registered.
    pub fn cancel_peer(&mut self, peer: PeerKey) {
        let blocks = match self.in_flight.get_mut(&peer) {
            Some(blocks) => std::mem::take(blocks),
            None => return,
        };
        for block in blocks {
            // in endgame another peer may still be downloading this block,
            // in which case it must not return to free
            let requested_elsewhere = self
                .in_flight
                .values()
                .any(|in_flight| in_flight.contains(&block));
            if !requested_elsewhere {
                if let Some(download) =
                    self.downloads.get_mut(&block.piece_index)
                {
                    download.free_block(&block);
                }
            }
        }
    }

    pub fn in_flight_count(&self, peer: &PeerKey) -> usize {
        self.in_flight.get(peer).map(HashSet::len).unwrap_or(0)
    }

    /// Yields the next blocks to request from a peer, up to the peer's
    /// remaining pipeline capacity.
    ///
    /// Selection first continues pieces that are already open, then opens at
    /// most one new piece per wake via the picker, and finally, in endgame,
    /// duplicates blocks that are out with other peers.
    pub fn request_blocks(
        &mut self,
        peer: PeerKey,
        remote: &Bitfield,
    ) -> Vec<BlockInfo> {
        let in_flight =
            self.in_flight.entry(peer).or_insert_with(HashSet::new);
        let mut capacity =
            self.max_in_flight.saturating_sub(in_flight.len());
        let mut blocks = Vec::new();
        if capacity == 0 {
            return blocks;
        }

        // continue open downloads the peer can serve; fewer in-progress
        // pieces beat starting fresh ones
        for (index, download) in self.downloads.iter_mut() {
            if capacity == 0 {
                break;
            }
            if !remote[*index] {
                continue;
            }
            let picked_from = blocks.len();
            download.pick_blocks(capacity, &mut blocks);
            capacity -= blocks.len() - picked_from;
        }

        // open at most one new piece per wake
        if capacity > 0 {
            let opened =
                self.opened.entry(peer).or_insert_with(HashSet::new);
            if opened.len() < self.max_pieces_per_peer {
                if let Some(index) = self.picker.pick(remote) {
                    self.picker.mark_pending(index);
                    opened.insert(index);
                    let mut download = PieceDownload::new(
                        index,
                        self.storage
                            .piece_len(index)
                            .expect("picked piece has valid index"),
                    );
                    let picked_from = blocks.len();
                    download.pick_blocks(capacity, &mut blocks);
                    capacity -= blocks.len() - picked_from;
                    self.downloads.insert(index, download);
                }
            }
        }

        // endgame: duplicate blocks that are out with other peers so the
        // last pieces don't hang on one slow link
        if capacity > 0 && self.is_endgame() {
            let in_flight = &self.in_flight[&peer];
            let mut duplicates = Vec::new();
            'downloads: for (index, download) in self.downloads.iter() {
                if !remote[*index] {
                    continue;
                }
                for block in download.requested_blocks() {
                    if capacity == 0 {
                        break 'downloads;
                    }
                    // skip blocks this very wake already picked and blocks
                    // this peer is downloading anyway
                    if !in_flight.contains(&block)
                        && !blocks.contains(&block)
                    {
                        duplicates.push(block);
                        capacity -= 1;
                    }
                }
            }
            blocks.extend(duplicates);
        }

        let in_flight = self
            .in_flight
            .get_mut(&peer)
            .expect("in-flight entry created above");
        for block in blocks.iter() {
            in_flight.insert(*block);
        }
        blocks
    }

    /// Records the arrival of a block from a peer, moving it out of the
    /// peer's in-flight set.
    pub fn received(
        &mut self,
        peer: PeerKey,
        block: BlockInfo,
    ) -> ReceivedBlock {
        let owned = self
            .in_flight
            .get_mut(&peer)
            .map(|blocks| blocks.remove(&block))
            .unwrap_or(false);
        if !owned {
            // late arrival is tolerated; the data was already accepted from
            // someone else or the request was canceled
            return ReceivedBlock::Ignored;
        }

        if let Some(download) = self.downloads.get_mut(&block.piece_index) {
            download.received_block(block);
        }

        // in endgame other peers may be downloading the same block; their
        // requests are wasted now, so cancel them
        let mut cancels = Vec::new();
        for (other, blocks) in self.in_flight.iter_mut() {
            if blocks.remove(&block) {
                cancels.push(*other);
            }
        }
        ReceivedBlock::Accepted { cancels }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use crate::{Bitfield, BLOCK_LEN};

    fn addr(port: u16) -> PeerKey {
        format!("10.0.0.1:{}", port).parse().unwrap()
    }

    // `piece_count` pieces of two full blocks each, except the last one,
    // which is a single 14464 byte block
    fn storage(piece_count: usize) -> StorageInfo {
        let total_len =
            (piece_count as u64 - 1) * (2 * BLOCK_LEN) as u64 + 14464;
        StorageInfo {
            piece_count,
            piece_len: 2 * BLOCK_LEN,
            last_piece_len: 14464,
            total_len,
            download_dir: PathBuf::from("/"),
            files: vec![crate::FileInfo {
                path: PathBuf::from("file"),
                len: total_len,
                torrent_offset: 0,
            }],
        }
    }

    fn scheduler(piece_count: usize) -> Scheduler {
        Scheduler::new(
            storage(piece_count),
            Bitfield::repeat(false, piece_count),
            0,
            15,
            10,
        )
    }

    fn full_bitfield(piece_count: usize) -> Bitfield {
        Bitfield::repeat(true, piece_count)
    }

    #[test]
    fn test_request_blocks_opens_one_piece_per_wake() {
        let mut scheduler = scheduler(3);
        let peer = addr(1);
        scheduler.peer_announced(&full_bitfield(3));

        let blocks = scheduler.request_blocks(peer, &full_bitfield(3));
        // one new piece is opened and fully split; capacity (15) exceeds any
        // piece's block count, so exactly one piece's blocks come back
        assert!(!blocks.is_empty());
        let piece = blocks[0].piece_index;
        assert!(blocks.iter().all(|b| b.piece_index == piece));
        assert_eq!(scheduler.in_flight_count(&peer), blocks.len());

        // the next wake opens the next piece
        let more = scheduler.request_blocks(peer, &full_bitfield(3));
        assert!(!more.is_empty());
        assert!(more.iter().all(|b| b.piece_index != piece));
        let second = more[0].piece_index;
        assert!(more.iter().all(|b| b.piece_index == second));
    }

    #[test]
    fn test_in_flight_bound_and_disjointness() {
        // 8 missing pieces keep the scheduler out of endgame
        let mut scheduler = Scheduler::new(
            storage(8),
            Bitfield::repeat(false, 8),
            0,
            3,
            10,
        );
        let a = addr(1);
        let b = addr(2);
        scheduler.peer_announced(&full_bitfield(8));
        scheduler.peer_announced(&full_bitfield(8));
        assert!(!scheduler.is_endgame());

        let blocks_a = scheduler.request_blocks(a, &full_bitfield(8));
        let blocks_b = scheduler.request_blocks(b, &full_bitfield(8));
        assert!(blocks_a.len() <= 3);
        assert!(blocks_b.len() <= 3);
        assert!(scheduler.in_flight_count(&a) <= 3);

        // outside endgame the in-flight sets are disjoint
        for block in blocks_a.iter() {
            assert!(!blocks_b.contains(block));
        }
    }

    #[test]
    fn test_choke_returns_blocks_to_queue() {
        let mut scheduler = scheduler(8);
        let a = addr(1);
        let b = addr(2);
        scheduler.peer_announced(&full_bitfield(8));

        let blocks_a = scheduler.request_blocks(a, &full_bitfield(8));
        assert!(!blocks_a.is_empty());

        // peer A choked us: its blocks return to the queue and the next
        // peer's wake picks them up again (same piece continued, not a new
        // open)
        scheduler.cancel_peer(a);
        assert_eq!(scheduler.in_flight_count(&a), 0);

        let blocks_b = scheduler.request_blocks(b, &full_bitfield(8));
        assert!(blocks_a.iter().all(|block| blocks_b.contains(block)));
    }

    #[test]
    fn test_received_block_and_ignored_late_arrival() {
        let mut scheduler = scheduler(8);
        let peer = addr(1);
        scheduler.peer_announced(&full_bitfield(8));

        let blocks = scheduler.request_blocks(peer, &full_bitfield(8));
        assert_eq!(
            scheduler.received(peer, blocks[0]),
            ReceivedBlock::Accepted { cancels: vec![] }
        );
        assert_eq!(scheduler.in_flight_count(&peer), blocks.len() - 1);

        // receiving it again is tolerated and changes nothing
        assert_eq!(
            scheduler.received(peer, blocks[0]),
            ReceivedBlock::Ignored
        );
        // a block we never requested is ignored too
        assert_eq!(
            scheduler.received(
                addr(9),
                BlockInfo {
                    piece_index: 0,
                    offset: 0,
                    len: BLOCK_LEN,
                }
            ),
            ReceivedBlock::Ignored
        );
    }

    #[test]
    fn test_hash_mismatch_reemits_blocks() {
        // everything but piece 0 is already ours, so the walk is
        // deterministic: piece 0 and its two 16 KiB blocks
        let mut own = Bitfield::repeat(true, 3);
        own.set(0, false);
        let mut scheduler =
            Scheduler::new(storage(3), own, 0, 15, 10);
        let peer = addr(1);
        scheduler.peer_announced(&full_bitfield(3));

        let mut blocks = scheduler.request_blocks(peer, &full_bitfield(3));
        blocks.sort();
        assert_eq!(blocks.len(), 2);
        assert!(blocks.iter().all(|b| b.piece_index == 0));
        for block in blocks.iter() {
            assert_eq!(
                scheduler.received(peer, *block),
                ReceivedBlock::Accepted { cancels: vec![] }
            );
        }

        // verification failed: the piece resets, its bit stays unset, and
        // the same two blocks are emitted again on the next wake
        scheduler.piece_rejected(0);
        assert!(!scheduler.own_pieces()[0]);

        let mut again = scheduler.request_blocks(peer, &full_bitfield(3));
        again.sort();
        assert_eq!(again, blocks);
    }

    #[test]
    fn test_endgame_duplicate_and_cancel() {
        // single missing piece: endgame from the start
        let mut scheduler = Scheduler::new(
            storage(3),
            {
                let mut own = Bitfield::repeat(true, 3);
                own.set(2, false);
                own
            },
            0,
            15,
            10,
        );
        let a = addr(1);
        let b = addr(2);
        scheduler.peer_announced(&full_bitfield(3));
        scheduler.peer_announced(&full_bitfield(3));
        assert!(scheduler.is_endgame());

        let blocks_a = scheduler.request_blocks(a, &full_bitfield(3));
        assert_eq!(blocks_a.len(), 1, "last piece has one 14464 byte block");

        // the second peer is handed the same block
        let blocks_b = scheduler.request_blocks(b, &full_bitfield(3));
        assert_eq!(blocks_b, blocks_a);

        // the first arrival wins; the other peer must be sent a CANCEL for
        // that exact block
        let received = scheduler.received(a, blocks_a[0]);
        assert_eq!(
            received,
            ReceivedBlock::Accepted { cancels: vec![b] }
        );
        assert_eq!(scheduler.in_flight_count(&b), 0);
    }

    #[test]
    fn test_peer_gone_returns_blocks() {
        let mut scheduler = scheduler(8);
        let a = addr(1);
        let b = addr(2);
        let pieces = full_bitfield(8);
        scheduler.peer_announced(&pieces);

        let blocks_a = scheduler.request_blocks(a, &pieces);
        scheduler.peer_gone(a, Some(&pieces));
        assert_eq!(scheduler.in_flight_count(&a), 0);

        // the blocks are downloadable again via another peer
        let blocks_b = scheduler.request_blocks(b, &pieces);
        assert!(blocks_a.iter().all(|block| blocks_b.contains(block)));
    }

    #[test]
    fn test_max_pieces_per_peer() {
        let mut scheduler = Scheduler::new(
            storage(8),
            Bitfield::repeat(false, 8),
            0,
            // plenty of in-flight capacity, but only one piece may be opened
            100,
            1,
        );
        let peer = addr(1);
        scheduler.peer_announced(&full_bitfield(8));

        let blocks = scheduler.request_blocks(peer, &full_bitfield(8));
        // would have capacity for all three pieces, but the per-peer open
        // piece cap stops after one
        let pieces: HashSet<_> =
            blocks.iter().map(|b| b.piece_index).collect();
        assert_eq!(pieces.len(), 1);
    }
}
