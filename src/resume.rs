//! Saved session state: one small bencoded file per active torrent that
//! lets a restart resume where it left off.
//!
//! The format is versioned and written atomically (temp file + rename), so
//! a crash mid-write never corrupts the previous state.

use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use serde_bytes::ByteBuf;

use crate::{
    error::*,
    tracker::{encode_compact_peers, parse_compact_peers},
    Bitfield, Sha1Hash,
};

pub(crate) const RESUME_VERSION: u32 = 1;

/// Tracker related state carried across restarts.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub(crate) struct TrackerState {
    pub downloaded: u64,
    /// Announce interval of the last response, in seconds.
    pub interval: u64,
    /// Unix timestamp of the last successful announce.
    pub last_update_time: i64,
    pub min_interval: u64,
    #[serde(default)]
    pub tracker_id: String,
    pub uploaded: u64,
}

/// The per-torrent resume file.
///
/// Fields are declared in lexicographic order so serialization yields
/// canonical bencode.
#[derive(Debug, PartialEq, Deserialize, Serialize)]
pub(crate) struct ResumeData {
    /// The announce tiers, as trackers are not recoverable from the info
    /// dictionary.
    #[serde(default)]
    pub announce_list: Vec<Vec<String>>,
    /// The packed bitfield of verified pieces. Absent while the torrent has
    /// no metadata yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitfield: Option<ByteBuf>,
    /// The raw bencoded info dictionary, absent for magnet downloads whose
    /// metadata hasn't completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<ByteBuf>,
    pub info_hash: ByteBuf,
    /// Known peer addresses in compact form.
    pub peers: ByteBuf,
    pub tracker: TrackerState,
    pub version: u32,
}

impl ResumeData {
    pub fn new(
        info_hash: Sha1Hash,
        info: Option<Vec<u8>>,
        announce_list: Vec<Vec<String>>,
        bitfield: Option<&Bitfield>,
        peers: &[SocketAddr],
        tracker: TrackerState,
    ) -> Self {
        Self {
            announce_list,
            bitfield: bitfield
                .map(|b| ByteBuf::from(b.as_slice().to_vec())),
            info: info.map(ByteBuf::from),
            info_hash: ByteBuf::from(info_hash.to_vec()),
            peers: ByteBuf::from(encode_compact_peers(peers)),
            tracker,
            version: RESUME_VERSION,
        }
    }

    pub fn info_hash(&self) -> Option<Sha1Hash> {
        if self.info_hash.len() != 20 {
            return None;
        }
        let mut hash = [0; 20];
        hash.copy_from_slice(&self.info_hash);
        Some(hash)
    }

    /// The saved bitfield reinterpreted at the torrent's piece count.
    pub fn bitfield(&self, piece_count: usize) -> Option<Bitfield> {
        let packed = self.bitfield.as_ref()?;
        if packed.len() != (piece_count + 7) / 8 {
            log::warn!("Resume bitfield length does not match piece count");
            return None;
        }
        let mut bitfield = Bitfield::from_vec(packed.to_vec());
        bitfield.resize(piece_count, false);
        Some(bitfield)
    }

    pub fn peers(&self) -> Vec<SocketAddr> {
        parse_compact_peers(&self.peers)
    }

    /// The canonical resume file location for a torrent.
    pub fn path_for(active_dir: &Path, info_hash: &Sha1Hash) -> PathBuf {
        active_dir.join(format!("{}.resume", hex::encode(info_hash)))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let buf = fs::read(path)?;
        let resume: ResumeData = serde_bencode::from_bytes(&buf)?;
        if resume.version != RESUME_VERSION {
            return Err(Error::Corrupt("unsupported resume version"));
        }
        if resume.info_hash.len() != 20 {
            return Err(Error::Corrupt("malformed resume info hash"));
        }
        Ok(resume)
    }

    /// Writes the file atomically: the previous state survives a crash
    /// mid-write.
    pub fn save(&self, path: &Path) -> Result<()> {
        let buf = serde_bencode::to_bytes(self)?;
        let tmp_path = path.with_extension("resume.tmp");
        fs::write(&tmp_path, &buf)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> ResumeData {
        let mut bitfield = Bitfield::repeat(false, 11);
        bitfield.set(0, true);
        bitfield.set(10, true);
        ResumeData::new(
            [0x5a; 20],
            Some(b"d4:name4:teste".to_vec()),
            vec![vec!["http://t.example/ann".to_string()]],
            Some(&bitfield),
            &[
                "1.2.3.4:6881".parse().unwrap(),
                "10.0.0.1:51413".parse().unwrap(),
            ],
            TrackerState {
                downloaded: 1000,
                interval: 1800,
                last_update_time: 1_700_000_000,
                min_interval: 60,
                tracker_id: "xyz".to_string(),
                uploaded: 500,
            },
        )
    }

    #[test]
    fn test_roundtrip_is_lossless() {
        let dir = tempfile::tempdir().unwrap();
        let resume = sample();
        let path =
            ResumeData::path_for(dir.path(), &resume.info_hash().unwrap());
        resume.save(&path).unwrap();

        let loaded = ResumeData::load(&path).unwrap();
        assert_eq!(loaded, resume);
        assert_eq!(loaded.info_hash(), Some([0x5a; 20]));
        assert_eq!(loaded.peers().len(), 2);

        let bitfield = loaded.bitfield(11).unwrap();
        assert!(bitfield[0]);
        assert!(bitfield[10]);
        assert_eq!(bitfield.count_ones(), 2);

        // a wrong piece count refuses the bitfield instead of guessing
        assert!(loaded.bitfield(64).is_none());
    }

    #[test]
    fn test_unsupported_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut resume = sample();
        resume.version = 99;
        let path = dir.path().join("x.resume");
        resume.save(&path).unwrap();
        assert!(matches!(
            ResumeData::load(&path),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn test_save_replaces_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.resume");
        let first = sample();
        first.save(&path).unwrap();

        let mut second = sample();
        second.tracker.uploaded = 9999;
        second.save(&path).unwrap();

        let loaded = ResumeData::load(&path).unwrap();
        assert_eq!(loaded.tracker.uploaded, 9999);
        // no stray temp file left behind
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
