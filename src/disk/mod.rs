//! The disk task: piece assembly, hash verification, persistence into the
//! file tree, and serving of verified blocks.
//!
//! All disk work of the engine is funneled through a single task, which
//! offloads hashing and file IO to the blocking thread pool and reports
//! results on per-torrent alert channels.

pub(crate) mod error;
mod io;

use tokio::{
    sync::{mpsc, oneshot},
    task,
};

use crate::{
    error::*, storage_info::StorageInfo, Bitfield, BlockInfo, PieceIndex,
    TorrentId,
};
use error::{NewTorrentError, ReadError, WriteError};

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;
type CommandReceiver = mpsc::UnboundedReceiver<Command>;

pub(crate) type TorrentAlertSender = mpsc::UnboundedSender<TorrentAlert>;
pub(crate) type TorrentAlertReceiver = mpsc::UnboundedReceiver<TorrentAlert>;

/// The commands the disk task accepts.
pub(crate) enum Command {
    /// Registers a torrent: creates its directory structure and remembers
    /// its piece hashes. Results and all later per-torrent alerts arrive on
    /// `alert_chan`.
    NewTorrent {
        id: TorrentId,
        storage_info: StorageInfo,
        piece_hashes: Vec<u8>,
        alert_chan: TorrentAlertSender,
    },
    /// Queues a downloaded block for assembly.
    WriteBlock {
        id: TorrentId,
        block_info: BlockInfo,
        data: Vec<u8>,
    },
    /// Reads a block to serve a remote request. The result is sent on the
    /// one-shot channel rather than the alert channel so the requesting peer
    /// session can await it directly.
    ReadBlock {
        id: TorrentId,
        block_info: BlockInfo,
        result_chan: oneshot::Sender<Result<Vec<u8>, ReadError>>,
    },
    /// Re-hashes everything the torrent already has on disk and reports the
    /// valid pieces.
    Validate { id: TorrentId },
    /// Drops a torrent's bookkeeping (its files stay on disk).
    RemoveTorrent { id: TorrentId },
    Shutdown,
}

/// The per-torrent notifications of the disk task.
#[derive(Debug)]
pub(crate) enum TorrentAlert {
    /// Whether allocation of the torrent succeeded.
    Allocated(Result<(), NewTorrentError>),
    /// A piece finished assembly: it was hashed and, if valid, durably
    /// written before this alert was sent.
    PieceCompleted(Result<PieceCompletion, WriteError>),
    /// Result of a requested validation pass.
    Validated { pieces: Bitfield },
}

#[derive(Debug)]
pub(crate) struct PieceCompletion {
    pub index: PieceIndex,
    pub is_valid: bool,
}

/// A cheaply cloneable handle through which the engine's tasks talk to the
/// disk task.
#[derive(Clone)]
pub(crate) struct DiskHandle(CommandSender);

impl DiskHandle {
    pub fn allocate_new_torrent(
        &self,
        id: TorrentId,
        storage_info: StorageInfo,
        piece_hashes: Vec<u8>,
        alert_chan: TorrentAlertSender,
    ) -> Result<()> {
        self.0
            .send(Command::NewTorrent {
                id,
                storage_info,
                piece_hashes,
                alert_chan,
            })
            .map_err(Error::from)
    }

    pub fn write_block(
        &self,
        id: TorrentId,
        block_info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        self.0
            .send(Command::WriteBlock {
                id,
                block_info,
                data,
            })
            .map_err(Error::from)
    }

    pub fn read_block(
        &self,
        id: TorrentId,
        block_info: BlockInfo,
        result_chan: oneshot::Sender<Result<Vec<u8>, ReadError>>,
    ) -> Result<()> {
        self.0
            .send(Command::ReadBlock {
                id,
                block_info,
                result_chan,
            })
            .map_err(Error::from)
    }

    pub fn validate(&self, id: TorrentId) -> Result<()> {
        self.0.send(Command::Validate { id }).map_err(Error::from)
    }

    pub fn remove_torrent(&self, id: TorrentId) -> Result<()> {
        self.0
            .send(Command::RemoveTorrent { id })
            .map_err(Error::from)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.0.send(Command::Shutdown).map_err(Error::from)
    }
}

/// Spawns the disk task, returning its join handle and the command handle.
pub(crate) fn spawn(
    piece_cache_capacity: usize,
    piece_cache_ttl: std::time::Duration,
) -> (task::JoinHandle<Result<()>>, DiskHandle) {
    log::info!("Spawning disk IO task");
    let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
    let mut disk = io::Disk::new(cmd_port, piece_cache_capacity, piece_cache_ttl);
    let join_handle = task::spawn(async move { disk.start().await });
    (join_handle, DiskHandle(cmd_chan))
}
