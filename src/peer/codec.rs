//! The framing of the BitTorrent wire protocol: the 68 byte handshake and
//! the length-prefixed peer messages, including the extension protocol
//! frame.

use std::{
    convert::TryFrom,
    io,
    io::{Error, ErrorKind},
};

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash};

/// The version 1 protocol string included in the handshake.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The reserved field of the handshake, one bit per advertised capability.
///
/// Trailing bits are allocated first, per the protocol's convention: the DHT
/// is the lowest bit of the last byte, the extension protocol is bit 0x10 of
/// byte 5.
pub(crate) type Reserved = [u8; 8];

const EXTENSION_PROTOCOL_BYTE: usize = 5;
const EXTENSION_PROTOCOL_MASK: u8 = 0x10;
const DHT_BYTE: usize = 7;
const DHT_MASK: u8 = 0x01;

/// Returns the reserved field we put in our handshakes.
pub(crate) fn local_reserved() -> Reserved {
    let mut reserved = [0; 8];
    reserved[EXTENSION_PROTOCOL_BYTE] |= EXTENSION_PROTOCOL_MASK;
    reserved[DHT_BYTE] |= DHT_MASK;
    reserved
}

/// The effective capability mask of a connection is what both sides
/// advertise.
pub(crate) fn merge_reserved(local: Reserved, remote: Reserved) -> Reserved {
    let mut merged = [0; 8];
    for (merged, (local, remote)) in
        merged.iter_mut().zip(local.iter().zip(remote.iter()))
    {
        *merged = local & remote;
    }
    merged
}

pub(crate) fn supports_extension_protocol(reserved: &Reserved) -> bool {
    reserved[EXTENSION_PROTOCOL_BYTE] & EXTENSION_PROTOCOL_MASK != 0
}

pub(crate) fn supports_dht(reserved: &Reserved) -> bool {
    reserved[DHT_BYTE] & DHT_MASK != 0
}

/// The handshake exchanged as the first message in both directions of a new
/// peer connection.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Handshake {
    /// The protocol string, which must equal [`PROTOCOL_STRING`].
    pub prot: [u8; 19],
    /// The capability bits of the sender.
    pub reserved: Reserved,
    /// The torrent's SHA-1 info hash.
    pub info_hash: Sha1Hash,
    /// The arbitrary 20 byte id of the sender.
    pub peer_id: PeerId,
}

impl Handshake {
    /// Creates a handshake advertising our own capabilities.
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: local_reserved(),
            info_hash,
            peer_id,
        }
    }

    /// The length of the handshake on the wire: 49 + 19 bytes.
    pub fn len(&self) -> usize {
        1 + 19 + 8 + 20 + 20
    }
}

/// The codec for the handshake phase of a connection. After the handshakes
/// are exchanged the connection is switched over to [`PeerCodec`], reusing
/// the buffers as the remote may have sent messages right after its
/// handshake.
pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> io::Result<()> {
        buf.reserve(handshake.len());
        let Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        } = handshake;
        buf.put_u8(prot.len() as u8);
        buf.extend_from_slice(&prot);
        buf.extend_from_slice(&reserved);
        buf.extend_from_slice(&info_hash);
        buf.extend_from_slice(&peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Handshake>> {
        if src.is_empty() {
            return Ok(None);
        }

        // peek at the protocol string length without consuming, as the rest
        // of the handshake may not have arrived yet
        let prot_len = src[0] as usize;
        if prot_len != PROTOCOL_STRING.len() {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "handshake has invalid protocol string length",
            ));
        }

        let payload_len = 1 + prot_len + 8 + 20 + 20;
        if src.len() < payload_len {
            return Ok(None);
        }

        let mut buf = src.split_to(payload_len);
        buf.advance(1);

        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "handshake has invalid protocol string",
            ));
        }
        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The ids of the defined peer messages. Any other id aborts the connection;
/// the keep-alive has no id as it is a bare zero length prefix.
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u8)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
    Port = 9,
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = io::Error;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        match id {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),
            4 => Ok(Self::Have),
            5 => Ok(Self::Bitfield),
            6 => Ok(Self::Request),
            7 => Ok(Self::Block),
            8 => Ok(Self::Cancel),
            9 => Ok(Self::Port),
            20 => Ok(Self::Extended),
            _ => Err(Error::new(
                ErrorKind::InvalidData,
                format!("unknown message id {}", id),
            )),
        }
    }
}

/// A peer message, after framing.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: PieceIndex,
    },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
    /// The UDP port of the sender's DHT node.
    Port(u16),
    /// An extension protocol frame: the extension's negotiated id (0 for the
    /// extended handshake) followed by its bencoded payload, which for some
    /// extensions carries a raw binary trailer.
    Extended {
        id: u8,
        payload: Vec<u8>,
    },
}

impl Message {
    /// Returns the id of the message, or `None` for the keep-alive.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have { .. } => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request(_) => Some(MessageId::Request),
            Self::Block { .. } => Some(MessageId::Block),
            Self::Cancel(_) => Some(MessageId::Cancel),
            Self::Port(_) => Some(MessageId::Port),
            Self::Extended { .. } => Some(MessageId::Extended),
        }
    }
}

pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> io::Result<()> {
        use Message::*;
        match msg {
            KeepAlive => {
                buf.put_u32(0);
            }
            Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Have { piece_index } => {
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Bitfield(bitfield) => {
                let data = bitfield.as_slice();
                buf.put_u32(1 + data.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(data);
            }
            Request(block) => {
                buf.put_u32(1 + 3 * 4);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Block {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(1 + 2 * 4 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.extend_from_slice(&data);
            }
            Cancel(block) => {
                buf.put_u32(1 + 3 * 4);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Port(port) => {
                buf.put_u32(1 + 2);
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(port);
            }
            Extended { id, payload } => {
                buf.put_u32(1 + 1 + payload.len() as u32);
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(id);
                buf.extend_from_slice(&payload);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Message>> {
        if src.len() < 4 {
            return Ok(None);
        }

        // peek at the length prefix without consuming it, as the rest of the
        // frame may still be in flight
        let msg_len =
            u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if src.len() < 4 + msg_len {
            // preallocate to reduce reallocations while the frame trickles in
            src.reserve(4 + msg_len - src.len());
            return Ok(None);
        }

        src.advance(4);
        if msg_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let mut frame = src.split_to(msg_len);
        let id = MessageId::try_from(frame.get_u8())?;
        let frame_err =
            |what| Error::new(ErrorKind::InvalidData, what);

        let msg = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                if frame.len() != 4 {
                    return Err(frame_err("invalid have length"));
                }
                Message::Have {
                    piece_index: frame.get_u32() as PieceIndex,
                }
            }
            MessageId::Bitfield => Message::Bitfield(Bitfield::from_vec(
                frame.as_ref().to_vec(),
            )),
            MessageId::Request => {
                if frame.len() != 12 {
                    return Err(frame_err("invalid request length"));
                }
                Message::Request(BlockInfo {
                    piece_index: frame.get_u32() as PieceIndex,
                    offset: frame.get_u32(),
                    len: frame.get_u32(),
                })
            }
            MessageId::Block => {
                if frame.len() < 8 {
                    return Err(frame_err("invalid piece length"));
                }
                let piece_index = frame.get_u32() as PieceIndex;
                let offset = frame.get_u32();
                Message::Block {
                    piece_index,
                    offset,
                    data: frame.as_ref().to_vec(),
                }
            }
            MessageId::Cancel => {
                if frame.len() != 12 {
                    return Err(frame_err("invalid cancel length"));
                }
                Message::Cancel(BlockInfo {
                    piece_index: frame.get_u32() as PieceIndex,
                    offset: frame.get_u32(),
                    len: frame.get_u32(),
                })
            }
            MessageId::Port => {
                if frame.len() != 2 {
                    return Err(frame_err("invalid port length"));
                }
                Message::Port(frame.get_u16())
            }
            MessageId::Extended => {
                if frame.is_empty() {
                    return Err(frame_err("empty extended message"));
                }
                Message::Extended {
                    id: frame.get_u8(),
                    payload: frame.as_ref().to_vec(),
                }
            }
        };

        Ok(Some(msg))
    }
}
