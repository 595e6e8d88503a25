//! Error types of the disk task. These stay local to disk alerts so that
//! a failed disk operation never tears down the disk task itself.

use std::fmt;

/// The error type returned when a torrent could not be allocated on disk.
#[derive(Debug)]
pub(crate) enum NewTorrentError {
    /// The torrent is already being tracked by the disk task.
    AlreadyExists,
    Io(std::io::Error),
}

impl fmt::Display for NewTorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyExists => write!(f, "torrent already allocated"),
            Self::Io(e) => write!(f, "{}", e),
        }
    }
}

impl From<std::io::Error> for NewTorrentError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// The error type returned when a block could not be written to disk.
#[derive(Debug)]
pub(crate) enum WriteError {
    /// The block doesn't fit the torrent's piece layout.
    InvalidBlock,
    Io(std::io::Error),
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidBlock => write!(f, "invalid block"),
            Self::Io(e) => write!(f, "{}", e),
        }
    }
}

impl From<std::io::Error> for WriteError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// The error type returned when a block could not be served from disk.
#[derive(Debug)]
pub(crate) enum ReadError {
    /// The block doesn't fit the torrent's piece layout.
    InvalidBlock,
    /// The piece's bytes on disk no longer match its expected hash.
    Corrupt,
    Io(std::io::Error),
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidBlock => write!(f, "invalid block"),
            Self::Corrupt => write!(f, "piece on disk is corrupt"),
            Self::Io(e) => write!(f, "{}", e),
        }
    }
}

impl From<std::io::Error> for ReadError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
