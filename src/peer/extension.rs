//! The extension protocol handshake (BEP-10) and the metadata exchange
//! messages (BEP-9) carried over it.

use std::collections::BTreeMap;

use sha1::{Digest, Sha1};

use crate::{error::*, metainfo::bencode_value_end, Sha1Hash};

pub(crate) const UT_METADATA: &str = "ut_metadata";

/// The message id under which we expect to receive ut_metadata messages.
/// Communicated to the remote in our extended handshake.
pub(crate) const LOCAL_UT_METADATA_ID: u8 = 1;

/// Metadata is exchanged in pieces of this size; only the last piece may be
/// shorter.
pub(crate) const METADATA_PIECE_LEN: usize = 0x4000;

/// The payload of the extended handshake (extension message id 0).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct ExtendedHandshake {
    /// Maps the names of the sender's supported extensions to the message
    /// ids the sender wants to receive them under.
    #[serde(default)]
    pub m: BTreeMap<String, u8>,
    /// The size of the info dictionary, advertised when the sender has it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_size: Option<u32>,
    /// The sender's listen port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p: Option<u16>,
    /// Client name and version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,
}

impl ExtendedHandshake {
    /// Builds the handshake we advertise: ut_metadata support, our listen
    /// port, and the metadata size when the info dictionary is known.
    pub fn local(port: u16, metadata_size: Option<u32>) -> Self {
        let mut m = BTreeMap::new();
        m.insert(UT_METADATA.to_string(), LOCAL_UT_METADATA_ID);
        Self {
            m,
            metadata_size,
            p: Some(port),
            v: Some(format!("riptorrent {}", env!("CARGO_PKG_VERSION"))),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_bencode::to_bytes(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_bencode::from_bytes(payload)?)
    }

    /// The id the remote wants ut_metadata messages sent under, if it
    /// supports the extension at all.
    pub fn ut_metadata_id(&self) -> Option<u8> {
        self.m.get(UT_METADATA).copied()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MetadataHeader {
    msg_type: u8,
    piece: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    total_size: Option<u32>,
}

/// A ut_metadata message. The `Data` variant's payload rides as a raw
/// binary trailer after the bencoded header.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum MetadataMessage {
    Request { piece: u32 },
    Data { piece: u32, total_size: u32, data: Vec<u8> },
    Reject { piece: u32 },
}

impl MetadataMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let (header, trailer) = match self {
            Self::Request { piece } => (
                MetadataHeader {
                    msg_type: 0,
                    piece: *piece,
                    total_size: None,
                },
                None,
            ),
            Self::Data {
                piece,
                total_size,
                data,
            } => (
                MetadataHeader {
                    msg_type: 1,
                    piece: *piece,
                    total_size: Some(*total_size),
                },
                Some(data),
            ),
            Self::Reject { piece } => (
                MetadataHeader {
                    msg_type: 2,
                    piece: *piece,
                    total_size: None,
                },
                None,
            ),
        };
        let mut buf = serde_bencode::to_bytes(&header)?;
        if let Some(trailer) = trailer {
            buf.extend_from_slice(trailer);
        }
        Ok(buf)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        // the bencoded header is self-delimiting, anything after it is the
        // raw metadata piece of a data message
        let header_end = bencode_value_end(payload, 0)
            .map_err(|_| Error::Protocol("malformed ut_metadata header"))?;
        let header: MetadataHeader =
            serde_bencode::from_bytes(&payload[..header_end])?;
        let trailer = &payload[header_end..];

        match header.msg_type {
            0 => Ok(Self::Request {
                piece: header.piece,
            }),
            1 => Ok(Self::Data {
                piece: header.piece,
                total_size: header
                    .total_size
                    .ok_or(Error::Protocol("ut_metadata data without size"))?,
                data: trailer.to_vec(),
            }),
            2 => Ok(Self::Reject {
                piece: header.piece,
            }),
            _ => Err(Error::Protocol("unknown ut_metadata message type")),
        }
    }
}

/// Returns the bytes of a piece of the info dictionary, for serving
/// ut_metadata requests. `None` if the piece index is out of range.
pub(crate) fn metadata_piece(metadata: &[u8], piece: u32) -> Option<&[u8]> {
    let start = piece as usize * METADATA_PIECE_LEN;
    if start >= metadata.len() {
        return None;
    }
    let end = (start + METADATA_PIECE_LEN).min(metadata.len());
    Some(&metadata[start..end])
}

/// The in-progress download of a torrent's info dictionary from the swarm.
///
/// The size is unknown until some peer's extended handshake reveals it;
/// pieces can only be requested after that.
#[derive(Debug, Default)]
pub(crate) struct MetadataDownload {
    total_size: usize,
    pieces: Vec<Option<Vec<u8>>>,
}

impl MetadataDownload {
    /// Records the metadata size learned from a handshake. Sizes are only
    /// accepted once; a nonsensical size is rejected.
    pub fn set_size(&mut self, size: u32) -> bool {
        if size == 0 {
            return false;
        }
        if self.total_size != 0 {
            return self.total_size == size as usize;
        }
        self.total_size = size as usize;
        let piece_count =
            (self.total_size + METADATA_PIECE_LEN - 1) / METADATA_PIECE_LEN;
        self.pieces = vec![None; piece_count];
        true
    }

    pub fn size_known(&self) -> bool {
        self.total_size != 0
    }

    /// The length the piece at the index must have.
    fn piece_len(&self, piece: usize) -> usize {
        if piece + 1 == self.pieces.len() {
            self.total_size - piece * METADATA_PIECE_LEN
        } else {
            METADATA_PIECE_LEN
        }
    }

    /// Returns the next piece to request from a peer, if any is missing.
    pub fn next_missing(&self) -> Option<u32> {
        self.pieces
            .iter()
            .position(Option::is_none)
            .map(|piece| piece as u32)
    }

    /// Stores a received metadata piece. Pieces of the wrong size and out of
    /// range indices are ignored.
    pub fn add_piece(&mut self, piece: u32, data: Vec<u8>) {
        let piece = piece as usize;
        if piece >= self.pieces.len() || data.len() != self.piece_len(piece) {
            log::warn!("Ignoring invalid metadata piece {}", piece);
            return;
        }
        self.pieces[piece] = Some(data);
    }

    pub fn is_complete(&self) -> bool {
        self.size_known() && self.pieces.iter().all(Option::is_some)
    }

    /// Concatenates the downloaded pieces and verifies them against the
    /// torrent's info hash. On mismatch all pieces are discarded so the
    /// download starts over.
    pub fn assemble(&mut self, info_hash: &Sha1Hash) -> Option<Vec<u8>> {
        debug_assert!(self.is_complete());
        let mut metadata = Vec::with_capacity(self.total_size);
        for piece in self.pieces.iter() {
            metadata.extend_from_slice(piece.as_ref()?);
        }

        let digest = Sha1::digest(&metadata);
        if digest.as_slice() == info_hash {
            Some(metadata)
        } else {
            log::warn!("Downloaded metadata does not match info hash");
            for piece in self.pieces.iter_mut() {
                *piece = None;
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_extended_handshake_roundtrip() {
        let handshake = ExtendedHandshake::local(6889, Some(31234));
        let buf = handshake.encode().unwrap();
        let decoded = ExtendedHandshake::decode(&buf).unwrap();
        assert_eq!(decoded, handshake);
        assert_eq!(decoded.ut_metadata_id(), Some(LOCAL_UT_METADATA_ID));
        assert_eq!(decoded.p, Some(6889));
        assert_eq!(decoded.metadata_size, Some(31234));
    }

    #[test]
    fn test_extended_handshake_foreign_fields() {
        // a libtorrent style handshake with fields we don't model
        let buf = b"d1:md11:ut_metadatai3e6:ut_pexi1ee13:metadata_sizei100e\
                    4:reqqi250e1:v7:example6:yourip4:\x7f\x00\x00\x01e";
        let decoded = ExtendedHandshake::decode(&buf[..]).unwrap();
        assert_eq!(decoded.ut_metadata_id(), Some(3));
        assert_eq!(decoded.metadata_size, Some(100));
    }

    #[test]
    fn test_metadata_message_roundtrip() {
        let msg = MetadataMessage::Request { piece: 2 };
        assert_eq!(
            MetadataMessage::decode(&msg.encode().unwrap()).unwrap(),
            msg
        );

        let msg = MetadataMessage::Reject { piece: 0 };
        assert_eq!(
            MetadataMessage::decode(&msg.encode().unwrap()).unwrap(),
            msg
        );

        let msg = MetadataMessage::Data {
            piece: 1,
            total_size: METADATA_PIECE_LEN as u32 + 3,
            data: vec![b'x', b'e', b'e'],
        };
        let buf = msg.encode().unwrap();
        // the trailer is raw, not bencoded, even when it looks like bencode
        assert_eq!(MetadataMessage::decode(&buf).unwrap(), msg);
    }

    #[test]
    fn test_metadata_download() {
        let metadata: Vec<u8> =
            (0..METADATA_PIECE_LEN + 100).map(|i| i as u8).collect();
        let info_hash = {
            let digest = Sha1::digest(&metadata);
            let mut hash = [0; 20];
            hash.copy_from_slice(&digest);
            hash
        };

        let mut download = MetadataDownload::default();
        assert!(!download.size_known());
        assert_eq!(download.next_missing(), None);

        assert!(download.set_size(metadata.len() as u32));
        // conflicting sizes are rejected
        assert!(!download.set_size(1));

        assert_eq!(download.next_missing(), Some(0));
        // a piece of the wrong size is dropped
        download.add_piece(0, vec![0; 3]);
        assert_eq!(download.next_missing(), Some(0));

        download.add_piece(0, metadata[..METADATA_PIECE_LEN].to_vec());
        assert_eq!(download.next_missing(), Some(1));
        download.add_piece(1, metadata[METADATA_PIECE_LEN..].to_vec());
        assert!(download.is_complete());

        let assembled = download.assemble(&info_hash).unwrap();
        assert_eq!(assembled, metadata);
    }

    #[test]
    fn test_metadata_hash_mismatch_resets() {
        let mut download = MetadataDownload::default();
        assert!(download.set_size(4));
        download.add_piece(0, vec![1, 2, 3, 4]);
        assert!(download.is_complete());

        // wrong expected hash: pieces are discarded for a fresh attempt
        assert!(download.assemble(&[0; 20]).is_none());
        assert!(!download.is_complete());
        assert_eq!(download.next_missing(), Some(0));
    }

    #[test]
    fn test_metadata_piece_slicing() {
        let metadata: Vec<u8> =
            (0..METADATA_PIECE_LEN + 10).map(|i| i as u8).collect();
        assert_eq!(
            metadata_piece(&metadata, 0).unwrap().len(),
            METADATA_PIECE_LEN
        );
        assert_eq!(metadata_piece(&metadata, 1).unwrap().len(), 10);
        assert!(metadata_piece(&metadata, 2).is_none());
    }
}
