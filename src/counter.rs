//! Transfer accounting for a torrent.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing byte counter that can be bumped from any task.
#[derive(Debug, Default)]
pub(crate) struct Counter(AtomicU64);

impl Counter {
    pub fn new(initial: u64) -> Self {
        Self(AtomicU64::new(initial))
    }

    pub fn add(&self, bytes: u64) {
        self.0.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// The per-torrent transfer statistics reported to trackers.
///
/// Upload is counted in exactly one place: when a PIECE message has been
/// fully sent to a peer.
#[derive(Debug, Default)]
pub(crate) struct TorrentStats {
    pub uploaded: Counter,
    pub downloaded: Counter,
}

impl TorrentStats {
    pub fn new(uploaded: u64, downloaded: u64) -> Self {
        Self {
            uploaded: Counter::new(uploaded),
            downloaded: Counter::new(downloaded),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::default();
        counter.add(100);
        counter.add(42);
        assert_eq!(counter.total(), 142);

        let counter = Counter::new(7);
        counter.add(1);
        assert_eq!(counter.total(), 8);
    }
}
