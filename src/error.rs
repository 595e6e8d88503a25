//! The error types returned by the engine and its parts.

use std::fmt;

use crate::PieceIndex;

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

/// The error type returned by the torrent engine.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The metainfo file or a bencoded message could not be parsed.
    Bencode(serde_bencode::Error),
    /// A message channel to another part of the engine was closed. This only
    /// happens during (or due to an error causing) shutdown.
    Channel,
    /// Persisted state (resume file, DHT identity) could not be used. This
    /// is fatal for the piece of state in question.
    Corrupt(&'static str),
    /// The DHT node rejected or could not process a message.
    Dht(String),
    /// Holds global IO related errors.
    Io(std::io::Error),
    /// The magnet URI could not be parsed or is not a v1 BitTorrent magnet.
    InvalidMagnet,
    /// The .torrent file is missing required fields or is inconsistent.
    InvalidMetainfo(&'static str),
    /// The peer's handshake advertised a torrent we don't serve.
    InvalidPeerInfoHash,
    /// An invalid piece index was used.
    InvalidPieceIndex(PieceIndex),
    /// An invalid torrent id was used.
    InvalidTorrentId,
    /// The remote peer violated the wire protocol.
    Protocol(&'static str),
    /// An operation did not complete within its deadline.
    Timeout,
    /// The tracker responded with a failure reason, or its response could not
    /// be interpreted.
    Tracker(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bencode(e) => write!(f, "bencode error: {}", e),
            Self::Channel => write!(f, "channel to engine task closed"),
            Self::Corrupt(s) => write!(f, "corrupt persisted state: {}", s),
            Self::Dht(s) => write!(f, "dht error: {}", s),
            Self::Io(e) => write!(f, "{}", e),
            Self::InvalidMagnet => write!(f, "invalid magnet URI"),
            Self::InvalidMetainfo(s) => write!(f, "invalid metainfo: {}", s),
            Self::InvalidPeerInfoHash => {
                write!(f, "peer handshake contained unknown info hash")
            }
            Self::InvalidPieceIndex(index) => {
                write!(f, "invalid piece index: {}", index)
            }
            Self::InvalidTorrentId => write!(f, "invalid torrent id"),
            Self::Protocol(s) => write!(f, "protocol violation: {}", s),
            Self::Timeout => write!(f, "operation timed out"),
            Self::Tracker(s) => write!(f, "tracker error: {}", s),
        }
    }
}

impl std::error::Error for Error {}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Self::Bencode(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<tokio::time::Elapsed> for Error {
    fn from(_: tokio::time::Elapsed) -> Self {
        Self::Timeout
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::Channel
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::Channel
    }
}
