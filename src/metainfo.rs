//! Parsing of .torrent files and magnet URIs.

use std::path::PathBuf;

use sha1::{Digest, Sha1};
use url::Url;

use crate::{error::*, PieceIndex, Sha1Hash};

/// The parsed, immutable metadata of a torrent.
///
/// This is the single source of truth for everything derived from the
/// metainfo file: piece hashes, piece sizes, and the file layout of the
/// linearized torrent.
#[derive(Clone, Debug)]
pub struct Metainfo {
    /// The name of the torrent, which doubles as the single file's name or
    /// the archive's directory name.
    pub name: String,
    /// The SHA-1 of the bencoded info dictionary, as found in the file.
    pub info_hash: Sha1Hash,
    /// The exact bencoded bytes of the info dictionary. Kept verbatim so the
    /// hash can be recomputed, the metadata served over ut_metadata, and the
    /// torrent persisted, without relying on re-encoding.
    pub info_bytes: Vec<u8>,
    /// The concatenation of all pieces' SHA-1 hashes, 20 bytes each.
    pub pieces: Vec<u8>,
    /// The nominal piece length; the last piece may be shorter.
    pub piece_len: u32,
    /// The files of the torrent in their on-wire order. A single-file
    /// torrent has exactly one entry whose path is the torrent name.
    pub files: Vec<MetaFile>,
    /// Whether the torrent is a multi-file archive. Archives are downloaded
    /// into a directory named after the torrent.
    pub is_archive: bool,
    /// The announce tiers, in BEP-12 order. A lone `announce` key becomes
    /// a single single-URL tier.
    pub announce_list: Vec<Vec<String>>,
}

/// A file entry of the metainfo, before it is joined with a download
/// directory.
#[derive(Clone, Debug, PartialEq)]
pub struct MetaFile {
    /// Path relative to the download root (single file) or to the torrent's
    /// directory (archive).
    pub path: PathBuf,
    pub len: u64,
}

impl Metainfo {
    /// Parses a whole .torrent file.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let raw: RawMetainfo = serde_bencode::from_bytes(buf)?;
        let info_bytes = find_info_bytes(buf)?.to_vec();

        let mut announce_list = match raw.announce_list {
            Some(tiers) => {
                tiers.into_iter().filter(|t| !t.is_empty()).collect()
            }
            None => Vec::new(),
        };
        if announce_list.is_empty() {
            if let Some(announce) = raw.announce {
                announce_list.push(vec![announce]);
            }
        }

        Self::build(raw.info, info_bytes, announce_list)
    }

    /// Builds the metainfo from the raw bytes of an info dictionary, as
    /// obtained through the ut_metadata exchange. The caller has already
    /// verified the bytes hash to the torrent's info hash.
    pub fn from_info_bytes(
        info_bytes: Vec<u8>,
        announce_list: Vec<Vec<String>>,
    ) -> Result<Self> {
        let info: RawInfo = serde_bencode::from_bytes(&info_bytes)?;
        Self::build(info, info_bytes, announce_list)
    }

    fn build(
        info: RawInfo,
        info_bytes: Vec<u8>,
        announce_list: Vec<Vec<String>>,
    ) -> Result<Self> {
        if info.pieces.is_empty() || info.pieces.len() % 20 != 0 {
            return Err(Error::InvalidMetainfo("malformed piece hashes"));
        }
        if info.piece_length == 0 {
            return Err(Error::InvalidMetainfo("zero piece length"));
        }

        let info_hash = {
            let digest = Sha1::digest(&info_bytes);
            let mut hash = [0; 20];
            hash.copy_from_slice(&digest);
            hash
        };

        let (files, is_archive) = match (info.files, info.length) {
            (Some(entries), _) => {
                if entries.is_empty() {
                    return Err(Error::InvalidMetainfo("empty file list"));
                }
                let files = entries
                    .into_iter()
                    .map(|f| {
                        if f.path.is_empty() {
                            return Err(Error::InvalidMetainfo(
                                "file with empty path",
                            ));
                        }
                        Ok(MetaFile {
                            path: f.path.iter().collect(),
                            len: f.length,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                (files, true)
            }
            (None, Some(length)) => (
                vec![MetaFile {
                    path: PathBuf::from(&info.name),
                    len: length,
                }],
                false,
            ),
            (None, None) => {
                return Err(Error::InvalidMetainfo(
                    "neither length nor files present",
                ))
            }
        };

        let total_len: u64 = files.iter().map(|f| f.len).sum();
        let piece_count = (info.pieces.len() / 20) as u64;
        let min_len = (piece_count - 1) * u64::from(info.piece_length);
        if total_len <= min_len
            || total_len > piece_count * u64::from(info.piece_length)
        {
            return Err(Error::InvalidMetainfo(
                "file lengths inconsistent with piece count",
            ));
        }

        Ok(Self {
            name: info.name,
            info_hash,
            info_bytes,
            pieces: info.pieces,
            piece_len: info.piece_length,
            files,
            is_archive,
            announce_list,
        })
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len() / 20
    }

    /// Returns the expected hash of the piece at the index.
    ///
    /// # Panics
    ///
    /// Panics if the piece index is out of bounds.
    pub fn piece_hash(&self, index: PieceIndex) -> Sha1Hash {
        let mut hash = [0; 20];
        hash.copy_from_slice(&self.pieces[index * 20..index * 20 + 20]);
        hash
    }

    /// The sum of all file lengths.
    pub fn total_len(&self) -> u64 {
        self.files.iter().map(|f| f.len).sum()
    }
}

#[derive(Debug, Deserialize)]
struct RawMetainfo {
    info: RawInfo,
    #[serde(default)]
    announce: Option<String>,
    #[serde(default, rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
}

#[derive(Debug, Deserialize)]
struct RawInfo {
    name: String,
    #[serde(with = "serde_bytes")]
    pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    piece_length: u32,
    #[serde(default)]
    length: Option<u64>,
    #[serde(default)]
    files: Option<Vec<RawFile>>,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    path: Vec<String>,
    length: u64,
}

/// Locates the exact byte range of the `info` value within a bencoded
/// .torrent file.
///
/// Re-encoding a parsed info dictionary is not guaranteed to reproduce the
/// original bytes (unknown keys would be dropped), so the hash must be taken
/// over the file's own bytes. Bencode is self-delimiting, which makes
/// skipping values cheap.
fn find_info_bytes(buf: &[u8]) -> Result<&[u8]> {
    const ERR: Error = Error::InvalidMetainfo("no info dictionary");
    if buf.first() != Some(&b'd') {
        return Err(ERR);
    }
    let mut pos = 1;
    while buf.get(pos).ok_or(ERR)? != &b'e' {
        let key_start = pos;
        let key_end = bencode_value_end(buf, key_start)?;
        let value_end = bencode_value_end(buf, key_end)?;
        if &buf[key_start..key_end] == b"4:info" {
            return Ok(&buf[key_end..value_end]);
        }
        pos = value_end;
    }
    Err(ERR)
}

/// Returns the position one past the bencoded value starting at `pos`. Also
/// used to split the raw trailer off ut_metadata data messages.
pub(crate) fn bencode_value_end(buf: &[u8], pos: usize) -> Result<usize> {
    const ERR: Error = Error::InvalidMetainfo("truncated bencode");
    match buf.get(pos).ok_or(ERR)? {
        b'i' => {
            let end = buf[pos..]
                .iter()
                .position(|b| *b == b'e')
                .ok_or(ERR)?;
            Ok(pos + end + 1)
        }
        b'l' | b'd' => {
            // a dictionary body is an alternating sequence of keys and
            // values, and keys are themselves valid values, so both
            // containers can be skipped the same way
            let mut pos = pos + 1;
            while buf.get(pos).ok_or(ERR)? != &b'e' {
                pos = bencode_value_end(buf, pos)?;
            }
            Ok(pos + 1)
        }
        b'0'..=b'9' => {
            let colon = buf[pos..]
                .iter()
                .position(|b| *b == b':')
                .ok_or(ERR)?;
            let len: usize = std::str::from_utf8(&buf[pos..pos + colon])
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or(ERR)?;
            let end = pos + colon + 1 + len;
            if end > buf.len() {
                return Err(ERR);
            }
            Ok(end)
        }
        _ => Err(ERR),
    }
}

/// A parsed v1 BitTorrent magnet URI: the info hash plus optional display
/// name and trackers. The info dictionary itself is fetched from peers.
#[derive(Clone, Debug)]
pub struct Magnet {
    pub info_hash: Sha1Hash,
    pub name: Option<String>,
    pub trackers: Vec<String>,
}

impl Magnet {
    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri).map_err(|_| Error::InvalidMagnet)?;
        if url.scheme() != "magnet" {
            return Err(Error::InvalidMagnet);
        }

        let mut info_hash = None;
        let mut name = None;
        let mut trackers = Vec::new();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    let hex_hash = value
                        .strip_prefix("urn:btih:")
                        .ok_or(Error::InvalidMagnet)?;
                    let bytes = hex::decode(hex_hash)
                        .map_err(|_| Error::InvalidMagnet)?;
                    if bytes.len() != 20 {
                        return Err(Error::InvalidMagnet);
                    }
                    let mut hash = [0; 20];
                    hash.copy_from_slice(&bytes);
                    info_hash = Some(hash);
                }
                "dn" => name = Some(value.into_owned()),
                "tr" => trackers.push(value.into_owned()),
                _ => {}
            }
        }

        Ok(Self {
            info_hash: info_hash.ok_or(Error::InvalidMagnet)?,
            name,
            trackers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // A syntactically valid single-file torrent: 32 KiB piece length, 48 KiB
    // of content, 2 pieces.
    fn single_file_torrent() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce20:http://t.example/ann4:infod");
        buf.extend_from_slice(b"6:lengthi49152e4:name4:file");
        buf.extend_from_slice(b"12:piece lengthi32768e");
        buf.extend_from_slice(b"6:pieces40:");
        buf.extend_from_slice(&[0x11; 20]);
        buf.extend_from_slice(&[0x22; 20]);
        buf.extend_from_slice(b"ee");
        buf
    }

    #[test]
    fn test_parse_single_file() {
        let buf = single_file_torrent();
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(metainfo.name, "file");
        assert_eq!(metainfo.piece_count(), 2);
        assert_eq!(metainfo.piece_len, 32768);
        assert_eq!(metainfo.total_len(), 49152);
        assert!(!metainfo.is_archive);
        assert_eq!(
            metainfo.files,
            vec![MetaFile {
                path: PathBuf::from("file"),
                len: 49152,
            }]
        );
        assert_eq!(
            metainfo.announce_list,
            vec![vec!["http://t.example/ann".to_string()]]
        );
        assert_eq!(metainfo.piece_hash(0), [0x11; 20]);
        assert_eq!(metainfo.piece_hash(1), [0x22; 20]);
    }

    #[test]
    fn test_info_bytes_are_verbatim() {
        let buf = single_file_torrent();
        let metainfo = Metainfo::from_bytes(&buf).unwrap();

        // the extracted slice must be the info dict exactly as it appears in
        // the file, so the hash matches what other clients compute
        let start =
            buf.windows(6).position(|w| w == b"4:info").unwrap() + 6;
        assert_eq!(&metainfo.info_bytes[..], &buf[start..buf.len() - 1]);

        let digest = Sha1::digest(&metainfo.info_bytes);
        assert_eq!(&metainfo.info_hash[..], &digest[..]);

        // and re-parsing the extracted bytes yields the same torrent
        let reparsed = Metainfo::from_info_bytes(
            metainfo.info_bytes.clone(),
            metainfo.announce_list.clone(),
        )
        .unwrap();
        assert_eq!(reparsed.info_hash, metainfo.info_hash);
        assert_eq!(reparsed.files, metainfo.files);
    }

    #[test]
    fn test_parse_archive() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d4:infod");
        buf.extend_from_slice(b"5:filesl");
        buf.extend_from_slice(b"d6:lengthi16384e4:pathl1:a1:beee");
        buf.extend_from_slice(b"d6:lengthi100e4:pathl1:ceee");
        buf.extend_from_slice(b"e");
        buf.extend_from_slice(b"4:name3:dir");
        buf.extend_from_slice(b"12:piece lengthi16384e");
        buf.extend_from_slice(b"6:pieces40:");
        buf.extend_from_slice(&[0xab; 40]);
        buf.extend_from_slice(b"ee");

        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert!(metainfo.is_archive);
        assert_eq!(
            metainfo.files,
            vec![
                MetaFile {
                    path: PathBuf::from("a/b"),
                    len: 16384,
                },
                MetaFile {
                    path: PathBuf::from("c"),
                    len: 100,
                },
            ]
        );
        assert!(metainfo.announce_list.is_empty());
    }

    #[test]
    fn test_inconsistent_length_rejected() {
        // two piece hashes but only one piece worth of content
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d4:infod");
        buf.extend_from_slice(b"6:lengthi16384e4:name1:f");
        buf.extend_from_slice(b"12:piece lengthi16384e");
        buf.extend_from_slice(b"6:pieces40:");
        buf.extend_from_slice(&[0; 40]);
        buf.extend_from_slice(b"ee");
        assert!(matches!(
            Metainfo::from_bytes(&buf),
            Err(Error::InvalidMetainfo(_))
        ));
    }

    #[test]
    fn test_skip_value_nesting() {
        // "info" appearing as a nested key must not fool the scanner
        let buf =
            b"d3:extd4:infoi1ee4:infod6:lengthi1e4:name1:x12:piece \
              lengthi1e6:pieces20:aaaaaaaaaaaaaaaaaaaaee";
        let info = find_info_bytes(&buf[..]).unwrap();
        assert!(info.starts_with(b"d6:length"));
        assert!(info.ends_with(b"e"));
    }

    #[test]
    fn test_magnet() {
        let uri = "magnet:?xt=urn:btih:1111111111111111111111111111111111111111\
                   &dn=some%20name&tr=http%3A%2F%2Ft.example%2Fann";
        let magnet = Magnet::parse(uri).unwrap();
        assert_eq!(magnet.info_hash, [0x11; 20]);
        assert_eq!(magnet.name.as_deref(), Some("some name"));
        assert_eq!(magnet.trackers, vec!["http://t.example/ann".to_string()]);

        assert!(Magnet::parse("magnet:?dn=nohash").is_err());
        assert!(Magnet::parse("http://example.com").is_err());
        assert!(Magnet::parse("magnet:?xt=urn:btih:abcd").is_err());
    }
}
