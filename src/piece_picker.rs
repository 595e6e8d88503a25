//! The piece picker decides which piece a torrent downloads next.
//!
//! The default strategy is rarest first: pieces held by the fewest currently
//! connected peers are opened first, so rare data spreads through the swarm.
//! Ties are broken pseudo-randomly with a per-session seed to avoid every
//! client in a fresh swarm converging on the same piece.

use crate::{Bitfield, PieceIndex};

#[derive(Debug)]
pub(crate) struct PiecePicker {
    /// The pieces we have, verified and durably on disk.
    own: Bitfield,
    /// The pieces currently opened for download. They are not picked again
    /// while open.
    pending: Bitfield,
    /// For each piece, the number of connected peers that have it.
    availability: Vec<usize>,
    /// Tie-break seed, fixed for the session.
    seed: u64,
}

impl PiecePicker {
    pub fn new(own: Bitfield, seed: u64) -> Self {
        let piece_count = own.len();
        Self {
            own,
            pending: Bitfield::repeat(false, piece_count),
            availability: vec![0; piece_count],
            seed,
        }
    }

    pub fn piece_count(&self) -> usize {
        self.own.len()
    }

    pub fn own_pieces(&self) -> &Bitfield {
        &self.own
    }

    /// The number of pieces not yet verified.
    pub fn missing_count(&self) -> usize {
        self.piece_count() - self.own.count_ones()
    }

    pub fn is_complete(&self) -> bool {
        self.missing_count() == 0
    }

    /// Registers a newly connected peer's pieces in the availability counts.
    pub fn register_peer_pieces(&mut self, pieces: &Bitfield) {
        debug_assert_eq!(pieces.len(), self.availability.len());
        for (count, have) in self.availability.iter_mut().zip(pieces.iter()) {
            if *have {
                *count += 1;
            }
        }
    }

    /// Registers a HAVE announcement of a connected peer.
    pub fn register_peer_have(&mut self, index: PieceIndex) {
        if let Some(count) = self.availability.get_mut(index) {
            *count += 1;
        }
    }

    /// Removes a disconnected peer's pieces from the availability counts.
    pub fn unregister_peer_pieces(&mut self, pieces: &Bitfield) {
        debug_assert_eq!(pieces.len(), self.availability.len());
        for (count, have) in self.availability.iter_mut().zip(pieces.iter()) {
            if *have {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Picks the rarest piece among those the remote has and that is neither
    /// ours nor already open. The piece is not marked open; the caller does
    /// that with [`Self::mark_pending`] once it commits to the download.
    pub fn pick(&self, remote: &Bitfield) -> Option<PieceIndex> {
        debug_assert_eq!(remote.len(), self.own.len());
        remote
            .iter()
            .enumerate()
            .filter(|(index, have)| {
                **have && !self.own[*index] && !self.pending[*index]
            })
            .map(|(index, _)| index)
            .min_by_key(|index| {
                (self.availability[*index], self.tie_break(*index))
            })
    }

    pub fn mark_pending(&mut self, index: PieceIndex) {
        debug_assert!(!self.pending[index]);
        self.pending.set(index, true);
    }

    /// Reopens a piece after a failed verification.
    pub fn clear_pending(&mut self, index: PieceIndex) {
        self.pending.set(index, false);
    }

    /// Records a fully verified piece.
    pub fn received_piece(&mut self, index: PieceIndex) {
        self.own.set(index, true);
        self.pending.set(index, false);
    }

    /// A cheap deterministic mix of the session seed and the piece index
    /// (splitmix64 finalizer).
    fn tie_break(&self, index: PieceIndex) -> u64 {
        let mut z = self.seed.wrapping_add(index as u64);
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_own(piece_count: usize) -> Bitfield {
        Bitfield::repeat(false, piece_count)
    }

    fn bitfield(bits: &[bool]) -> Bitfield {
        bits.iter().copied().collect()
    }

    #[test]
    fn test_rarest_first() {
        let mut picker = PiecePicker::new(empty_own(4), 42);

        // piece availability: [2, 1, 2, 0]
        picker.register_peer_pieces(&bitfield(&[true, true, true, false]));
        picker.register_peer_pieces(&bitfield(&[true, false, true, false]));

        // a peer that has everything should be asked for the rarest piece it
        // can provide among pieces someone actually has
        let seed_peer = bitfield(&[true, true, true, false]);
        assert_eq!(picker.pick(&seed_peer), Some(1));

        picker.mark_pending(1);
        // with piece 1 open, the remaining candidates tie at availability 2
        let picked = picker.pick(&seed_peer).unwrap();
        assert!(picked == 0 || picked == 2);

        picker.mark_pending(picked);
        let other = picker.pick(&seed_peer).unwrap();
        assert_ne!(other, picked);

        picker.mark_pending(other);
        assert_eq!(picker.pick(&seed_peer), None);
    }

    #[test]
    fn test_pick_ignores_own_pieces() {
        let mut own = empty_own(3);
        own.set(0, true);
        let mut picker = PiecePicker::new(own, 7);
        picker.register_peer_pieces(&bitfield(&[true, true, true]));

        let remote = bitfield(&[true, true, false]);
        assert_eq!(picker.pick(&remote), Some(1));
        picker.received_piece(1);
        assert_eq!(picker.pick(&remote), None);
        assert_eq!(picker.missing_count(), 1);
    }

    #[test]
    fn test_tie_break_is_deterministic_per_seed() {
        let mut picker_a = PiecePicker::new(empty_own(8), 1);
        let mut picker_b = PiecePicker::new(empty_own(8), 1);
        let remote = bitfield(&[true; 8]);
        picker_a.register_peer_pieces(&remote);
        picker_b.register_peer_pieces(&remote);
        // equal seeds agree
        assert_eq!(picker_a.pick(&remote), picker_b.pick(&remote));

        // different seeds spread choices; with 8 equal pieces at least one
        // of a handful of seeds should disagree with seed 1
        let base = picker_a.pick(&remote);
        let disagree = (2..10).any(|seed| {
            let mut picker = PiecePicker::new(empty_own(8), seed);
            picker.register_peer_pieces(&remote);
            picker.pick(&remote) != base
        });
        assert!(disagree);
    }

    #[test]
    fn test_availability_unregister() {
        let mut picker = PiecePicker::new(empty_own(2), 3);
        let pieces = bitfield(&[true, true]);
        picker.register_peer_pieces(&pieces);
        picker.register_peer_have(0);
        assert_eq!(picker.availability, vec![2, 1]);

        picker.unregister_peer_pieces(&pieces);
        assert_eq!(picker.availability, vec![1, 0]);
    }

    #[test]
    fn test_reject_reopens_piece() {
        let mut picker = PiecePicker::new(empty_own(1), 0);
        picker.register_peer_pieces(&bitfield(&[true]));
        let remote = bitfield(&[true]);

        assert_eq!(picker.pick(&remote), Some(0));
        picker.mark_pending(0);
        assert_eq!(picker.pick(&remote), None);

        // hash mismatch: the piece must become pickable again
        picker.clear_pending(0);
        assert_eq!(picker.pick(&remote), Some(0));
    }
}
