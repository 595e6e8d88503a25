use {
    lru::LruCache,
    nix::sys::uio::{pread, pwrite},
    sha1::{Digest, Sha1},
    std::{
        collections::{BTreeMap, HashMap},
        fs::{self, File, OpenOptions},
        io,
        os::unix::io::AsRawFd,
        path::{Path, PathBuf},
        sync::Arc,
        time::{Duration, Instant},
    },
    tokio::{sync::oneshot, task},
};

use {
    super::{
        error::*, Command, CommandReceiver, PieceCompletion, TorrentAlert,
        TorrentAlertSender,
    },
    crate::{
        block_count, error::Result, storage_info::StorageInfo, Bitfield,
        BlockInfo, PieceIndex, Sha1Hash, TorrentId,
    },
};

/// The entity responsible for saving downloaded file blocks to disk,
/// verifying whether downloaded pieces are valid, and serving blocks back to
/// the swarm.
pub(super) struct Disk {
    /// Each torrent in engine has a corresponding entry in this hashmap.
    torrents: HashMap<TorrentId, Torrent>,
    /// Port on which disk IO commands are received.
    cmd_port: CommandReceiver,
    piece_cache_capacity: usize,
    piece_cache_ttl: Duration,
}

impl Disk {
    pub(super) fn new(
        cmd_port: CommandReceiver,
        piece_cache_capacity: usize,
        piece_cache_ttl: Duration,
    ) -> Self {
        Self {
            torrents: HashMap::new(),
            cmd_port,
            piece_cache_capacity,
            piece_cache_ttl,
        }
    }

    /// Starts the disk event loop which is run until shutdown or an
    /// unrecoverable error occurs (e.g. mpsc channel failure).
    pub(super) async fn start(&mut self) -> Result<()> {
        log::info!("Starting disk IO event loop");
        while let Some(cmd) = self.cmd_port.recv().await {
            match cmd {
                Command::NewTorrent {
                    id,
                    storage_info,
                    piece_hashes,
                    alert_chan,
                } => {
                    self.new_torrent(id, storage_info, piece_hashes, alert_chan);
                }
                Command::WriteBlock {
                    id,
                    block_info,
                    data,
                } => {
                    self.write_block(id, block_info, data).await;
                }
                Command::ReadBlock {
                    id,
                    block_info,
                    result_chan,
                } => {
                    self.read_block(id, block_info, result_chan).await;
                }
                Command::Validate { id } => {
                    self.validate(id);
                }
                Command::RemoveTorrent { id } => {
                    if self.torrents.remove(&id).is_none() {
                        log::warn!("Removing unknown torrent {}", id);
                    }
                }
                Command::Shutdown => {
                    log::info!("Shutting down disk event loop");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Sets up a torrent's bookkeeping and creates its download directory.
    ///
    /// NOTE: Do _NOT_ propagate failure, we don't want to kill the disk task
    /// due to disk IO errors: we just log and notify the torrent.
    fn new_torrent(
        &mut self,
        id: TorrentId,
        storage_info: StorageInfo,
        piece_hashes: Vec<u8>,
        alert_chan: TorrentAlertSender,
    ) {
        if self.torrents.contains_key(&id) {
            log::warn!("Torrent {} already allocated", id);
            let _ = alert_chan.send(TorrentAlert::Allocated(Err(
                NewTorrentError::AlreadyExists,
            )));
            return;
        }
        debug_assert_eq!(piece_hashes.len(), 20 * storage_info.piece_count);

        // the files themselves are created at their full declared length on
        // first touch; here only the download root is prepared
        let result = fs::create_dir_all(&storage_info.download_dir)
            .map_err(NewTorrentError::Io);
        let is_ok = result.is_ok();
        let _ = alert_chan.send(TorrentAlert::Allocated(result));
        if !is_ok {
            return;
        }

        log::info!("Torrent {} allocated at {:?}", id, storage_info.download_dir);
        self.torrents.insert(
            id,
            Torrent {
                storage: Arc::new(storage_info),
                piece_hashes,
                alert_chan,
                write_buf: HashMap::new(),
                cache: LruCache::new(self.piece_cache_capacity.max(1)),
                cache_ttl: self.piece_cache_ttl,
                stats: Stats::default(),
            },
        );
    }

    async fn write_block(
        &mut self,
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    ) {
        log::trace!("Saving torrent {} block {:?} to disk", id, info);
        match self.torrents.get_mut(&id) {
            Some(torrent) => torrent.write_block(info, data).await,
            None => log::warn!("Torrent {} not found", id),
        }
    }

    async fn read_block(
        &mut self,
        id: TorrentId,
        info: BlockInfo,
        result_chan: oneshot::Sender<std::result::Result<Vec<u8>, ReadError>>,
    ) {
        match self.torrents.get_mut(&id) {
            Some(torrent) => torrent.read_block(info, result_chan).await,
            None => {
                log::warn!("Torrent {} not found", id);
                let _ = result_chan.send(Err(ReadError::InvalidBlock));
            }
        }
    }

    /// Spawns a validation pass over everything the torrent has on disk. The
    /// result arrives on the torrent's alert channel; the disk loop keeps
    /// serving other commands meanwhile.
    fn validate(&self, id: TorrentId) {
        let torrent = match self.torrents.get(&id) {
            Some(torrent) => torrent,
            None => {
                log::warn!("Torrent {} not found", id);
                return;
            }
        };
        log::info!("Validating torrent {} files", id);

        let storage = Arc::clone(&torrent.storage);
        let piece_hashes = torrent.piece_hashes.clone();
        let alert_chan = torrent.alert_chan.clone();
        task::spawn(async move {
            let pieces = task::spawn_blocking(move || {
                validate_torrent(&storage, &piece_hashes)
            })
            .await
            .expect("validation task panicked");
            let _ = alert_chan.send(TorrentAlert::Validated { pieces });
        });
    }
}

/// Torrent information related to disk IO.
///
/// Contains the in-progress pieces (i.e. the write buffer), metadata about
/// the torrent's piece and file layout, and the cache of recently verified
/// pieces used to serve requests.
struct Torrent {
    /// All information concerning this torrent's storage.
    storage: Arc<StorageInfo>,
    /// The concatenation of all expected piece hashes.
    piece_hashes: Vec<u8>,
    /// The channel used to alert a torrent that a block has been written to
    /// disk and/or a piece was completed, or validated.
    alert_chan: TorrentAlertSender,
    /// The in-progress piece downloads and disk writes. This is the torrent's
    /// disk write buffer. Each piece is mapped to its index for faster
    /// lookups.
    write_buf: HashMap<PieceIndex, Piece>,
    /// Verified pieces kept around briefly to serve requests without
    /// re-reading from disk.
    cache: LruCache<PieceIndex, CachedPiece>,
    cache_ttl: Duration,
    /// Disk IO statistics.
    stats: Stats,
}

impl Torrent {
    async fn write_block(&mut self, info: BlockInfo, data: Vec<u8>) {
        log::trace!("Saving block {:?} to disk", info);

        if !self.is_valid_block(&info) || info.len as usize != data.len() {
            log::warn!("Invalid block {:?}", info);
            let _ = self.alert_chan.send(TorrentAlert::PieceCompleted(Err(
                WriteError::InvalidBlock,
            )));
            return;
        }

        let piece_index = info.piece_index;
        let mut expected_hash = [0; 20];
        expected_hash.copy_from_slice(
            &self.piece_hashes[piece_index * 20..piece_index * 20 + 20],
        );
        let piece_len = self
            .storage
            .piece_len(piece_index)
            .expect("block index validated above");
        let piece = self.write_buf.entry(piece_index).or_insert_with(|| {
            log::trace!("Creating piece {} write buffer", piece_index);
            Piece {
                expected_hash,
                len: piece_len,
                blocks: BTreeMap::new(),
            }
        });

        piece.enqueue_block(info.offset, data);

        // if the piece has all its blocks, it means we can hash it and save
        // it to disk and clear its write buffer
        if piece.is_complete() {
            let piece = self
                .write_buf
                .remove(&piece_index)
                .expect("inserted above");
            let storage = Arc::clone(&self.storage);

            // don't block the reactor with the potentially expensive hashing
            // and sync file writing
            let write_result = task::spawn_blocking(move || {
                let data = piece.assemble();
                let is_valid = piece.matches_hash(&data);
                if is_valid {
                    write_piece(&storage, piece_index, &data)?;
                    Ok((true, Some(data)))
                } else {
                    Ok((false, None))
                }
            })
            .await
            // our code doesn't panic in the task so until better strategies
            // are devised, unwrap here
            .expect("disk IO write task panicked");

            // We don't error out on disk write failure as we don't want to
            // kill the disk task due to disk IO errors (which may happen
            // from time to time). We alert the torrent of the failure and
            // return normally.
            match write_result {
                Ok((is_valid, data)) => {
                    if is_valid {
                        log::debug!("Piece {} is valid", piece_index);
                        self.stats.write_count += 1;
                        if let Some(data) = data {
                            self.cache.put(
                                piece_index,
                                CachedPiece {
                                    data: Arc::new(data),
                                    cached_at: Instant::now(),
                                },
                            );
                        }
                    } else {
                        log::warn!("Piece {} is NOT valid", piece_index);
                    }
                    let _ = self.alert_chan.send(TorrentAlert::PieceCompleted(
                        Ok(PieceCompletion {
                            index: piece_index,
                            is_valid,
                        }),
                    ));
                }
                Err(e) => {
                    log::warn!("Disk write error: {}", e);
                    self.stats.write_failure_count += 1;
                    let _ = self
                        .alert_chan
                        .send(TorrentAlert::PieceCompleted(Err(e)));
                }
            }
        }
    }

    async fn read_block(
        &mut self,
        info: BlockInfo,
        result_chan: oneshot::Sender<std::result::Result<Vec<u8>, ReadError>>,
    ) {
        if !self.is_valid_block(&info) {
            let _ = result_chan.send(Err(ReadError::InvalidBlock));
            return;
        }

        let piece_index = info.piece_index;
        if let Some(data) = self.cached_piece(piece_index) {
            let block = block_slice(&data, &info);
            let _ = result_chan.send(Ok(block));
            return;
        }

        // cache miss: load and re-verify the whole piece from disk via the
        // inverse file mapping
        let storage = Arc::clone(&self.storage);
        let mut expected_hash = [0; 20];
        expected_hash.copy_from_slice(
            &self.piece_hashes[piece_index * 20..piece_index * 20 + 20],
        );
        let read_result = task::spawn_blocking(move || {
            let data = read_piece(&storage, piece_index)?;
            let digest = Sha1::digest(&data);
            if digest.as_slice() != expected_hash {
                return Err(ReadError::Corrupt);
            }
            Ok(data)
        })
        .await
        .expect("disk IO read task panicked");

        match read_result {
            Ok(data) => {
                self.stats.read_count += 1;
                let data = Arc::new(data);
                self.cache.put(
                    piece_index,
                    CachedPiece {
                        data: Arc::clone(&data),
                        cached_at: Instant::now(),
                    },
                );
                let _ = result_chan.send(Ok(block_slice(&data, &info)));
            }
            Err(e) => {
                log::warn!("Failed to read piece {}: {}", piece_index, e);
                let _ = result_chan.send(Err(e));
            }
        }
    }

    /// Returns a fresh cached copy of the piece, evicting it if its TTL
    /// expired.
    fn cached_piece(&mut self, index: PieceIndex) -> Option<Arc<Vec<u8>>> {
        let fresh = match self.cache.get(&index) {
            Some(cached) => cached.cached_at.elapsed() <= self.cache_ttl,
            None => return None,
        };
        if fresh {
            self.cache.get(&index).map(|c| Arc::clone(&c.data))
        } else {
            self.cache.pop(&index);
            None
        }
    }

    fn is_valid_block(&self, info: &BlockInfo) -> bool {
        if info.piece_index >= self.storage.piece_count {
            return false;
        }
        let piece_len = self
            .storage
            .piece_len(info.piece_index)
            .expect("piece index checked above");
        info.len > 0 && info.offset + info.len <= piece_len
    }
}

struct CachedPiece {
    data: Arc<Vec<u8>>,
    cached_at: Instant,
}

#[derive(Default)]
struct Stats {
    /// The number of pieces successfully written to disk.
    write_count: u64,
    /// The number of times we failed to write to disk.
    write_failure_count: usize,
    /// The number of pieces read back from disk to serve requests.
    read_count: u64,
}

/// An in-progress piece download that keeps in memory the so far downloaded
/// blocks and the expected hash of the piece.
struct Piece {
    /// The expected hash of the whole piece.
    expected_hash: Sha1Hash,
    /// The length of the piece, in bytes.
    len: u32,
    /// The so far downloaded blocks, mapped to their offset within the
    /// piece. A BTreeMap keeps keys sorted, which matters when assembling
    /// the piece for hashing.
    blocks: BTreeMap<u32, Vec<u8>>,
}

impl Piece {
    /// Places a block into the piece's write buffer if it's not already
    /// there.
    fn enqueue_block(&mut self, offset: u32, data: Vec<u8>) {
        if self.blocks.contains_key(&offset) {
            log::warn!("Duplicate piece block at offset {}", offset);
        } else {
            self.blocks.insert(offset, data);
        }
    }

    /// Returns true if the piece has all its blocks in its write buffer.
    fn is_complete(&self) -> bool {
        self.blocks.len() == block_count(self.len)
    }

    /// Builds the piece's contiguous bytes from its blocks.
    fn assemble(&self) -> Vec<u8> {
        debug_assert!(self.is_complete());
        let mut buf = vec![0; self.len as usize];
        for (offset, block) in self.blocks.iter() {
            let offset = *offset as usize;
            buf[offset..offset + block.len()].copy_from_slice(block);
        }
        buf
    }

    /// Compares the piece's assembled bytes against the expected hash.
    ///
    /// # Important
    ///
    /// This is computationally expensive and should be executed on a thread
    /// pool and not the executor.
    fn matches_hash(&self, data: &[u8]) -> bool {
        let digest = Sha1::digest(data);
        log::debug!("Piece hash: {:x}", digest);
        digest.as_slice() == self.expected_hash
    }
}

fn block_slice(piece: &[u8], info: &BlockInfo) -> Vec<u8> {
    let offset = info.offset as usize;
    piece[offset..offset + info.len as usize].to_vec()
}

fn nix_to_io(e: nix::Error) -> io::Error {
    match e.as_errno() {
        Some(errno) => io::Error::from_raw_os_error(errno as i32),
        None => io::Error::new(io::ErrorKind::Other, e),
    }
}

/// Positional write of the whole buffer; IO syscalls are not guaranteed to
/// write the whole input in one go.
fn pwrite_all(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    while !buf.is_empty() {
        let write_count = pwrite(file.as_raw_fd(), buf, offset as i64)
            .map_err(nix_to_io)?;
        if write_count == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        buf = &buf[write_count..];
        offset += write_count as u64;
    }
    Ok(())
}

/// Positional read filling the whole buffer.
fn pread_exact(
    file: &File,
    mut buf: &mut [u8],
    mut offset: u64,
) -> io::Result<()> {
    while !buf.is_empty() {
        let read_count = pread(file.as_raw_fd(), buf, offset as i64)
            .map_err(nix_to_io)?;
        if read_count == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        let rest = buf;
        buf = &mut rest[read_count..];
        offset += read_count as u64;
    }
    Ok(())
}

/// Opens a file of the torrent for writing, creating it at its full declared
/// length on first touch.
fn ensure_file(path: &Path, len: u64) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;
    if file.metadata()?.len() < len {
        file.set_len(len)?;
    }
    Ok(file)
}

/// Splices a verified piece into the files it overlaps with.
///
/// # Important
///
/// This performs sync IO and is thus potentially blocking and should be
/// executed on a thread pool and not the executor.
fn write_piece(
    storage: &StorageInfo,
    index: PieceIndex,
    data: &[u8],
) -> std::result::Result<(), WriteError> {
    let slices = storage
        .piece_slices(index)
        .map_err(|_| WriteError::InvalidBlock)?;
    let mut cursor = 0usize;
    for (file_index, slice) in slices {
        let file_info = &storage.files[file_index];
        let path = storage.download_dir.join(&file_info.path);
        let file = ensure_file(&path, file_info.len).map_err(|e| {
            log::warn!("Failed to open file {:?}: {}", path, e);
            WriteError::Io(e)
        })?;
        let chunk = &data[cursor..cursor + slice.len as usize];
        pwrite_all(&file, chunk, slice.offset).map_err(|e| {
            log::warn!("File {:?} write error: {}", path, e);
            WriteError::Io(e)
        })?;
        cursor += slice.len as usize;
    }
    debug_assert_eq!(cursor, data.len());
    Ok(())
}

/// Reads a whole piece from the files it overlaps with.
///
/// # Important
///
/// This performs sync IO and is thus potentially blocking and should be
/// executed on a thread pool and not the executor.
fn read_piece(
    storage: &StorageInfo,
    index: PieceIndex,
) -> std::result::Result<Vec<u8>, ReadError> {
    let piece_len = storage
        .piece_len(index)
        .map_err(|_| ReadError::InvalidBlock)? as usize;
    let slices = storage
        .piece_slices(index)
        .map_err(|_| ReadError::InvalidBlock)?;
    let mut buf = vec![0; piece_len];
    let mut cursor = 0usize;
    for (file_index, slice) in slices {
        let file_info = &storage.files[file_index];
        let path = storage.download_dir.join(&file_info.path);
        let file = File::open(&path)?;
        pread_exact(
            &file,
            &mut buf[cursor..cursor + slice.len as usize],
            slice.offset,
        )?;
        cursor += slice.len as usize;
    }
    Ok(buf)
}

/// Re-hashes a torrent's on-disk bytes, returning the bitfield of pieces
/// that are present and valid. Missing files simply leave their pieces'
/// bits unset.
///
/// # Important
///
/// This performs sync IO and hashing over the whole download and must run
/// on the blocking pool.
fn validate_torrent(storage: &StorageInfo, piece_hashes: &[u8]) -> Bitfield {
    let mut pieces = Bitfield::repeat(false, storage.piece_count);
    for index in 0..storage.piece_count {
        let data = match read_piece(storage, index) {
            Ok(data) => data,
            Err(_) => continue,
        };
        let digest = Sha1::digest(&data);
        if digest.as_slice() == &piece_hashes[index * 20..index * 20 + 20] {
            pieces.set(index, true);
        }
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{disk, FileInfo, BLOCK_LEN};

    // Torrent of 3 single-block pieces (16384, 16384, 8192 bytes) split
    // unevenly across two files.
    fn test_storage(download_dir: PathBuf) -> (StorageInfo, Vec<Vec<u8>>, Vec<u8>) {
        let piece_lens = [BLOCK_LEN, BLOCK_LEN, BLOCK_LEN / 2];
        let total_len: u64 =
            piece_lens.iter().map(|len| *len as u64).sum();
        let pieces: Vec<Vec<u8>> = piece_lens
            .iter()
            .enumerate()
            .map(|(index, len)| {
                (0..*len).map(|i| (i as u8) ^ (index as u8)).collect()
            })
            .collect();
        let mut piece_hashes = Vec::new();
        for piece in pieces.iter() {
            piece_hashes.extend_from_slice(&Sha1::digest(piece));
        }
        let storage = StorageInfo {
            piece_count: 3,
            piece_len: BLOCK_LEN,
            last_piece_len: BLOCK_LEN / 2,
            total_len,
            download_dir,
            files: vec![
                FileInfo {
                    path: PathBuf::from("a"),
                    len: 20_000,
                    torrent_offset: 0,
                },
                FileInfo {
                    path: PathBuf::from("sub/b"),
                    len: total_len - 20_000,
                    torrent_offset: 20_000,
                },
            ],
        };
        (storage, pieces, piece_hashes)
    }

    #[tokio::test]
    async fn test_write_verify_read_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, pieces, piece_hashes) =
            test_storage(dir.path().join("download"));

        let (_join, handle) =
            disk::spawn(100, Duration::from_secs(15));
        let (alert_chan, mut alert_port) =
            tokio::sync::mpsc::unbounded_channel();
        handle
            .allocate_new_torrent(0, storage.clone(), piece_hashes, alert_chan)
            .unwrap();
        match alert_port.recv().await.unwrap() {
            TorrentAlert::Allocated(result) => assert!(result.is_ok()),
            alert => panic!("unexpected alert {:?}", alert),
        }

        // write all three pieces; piece 1 with a corrupted byte first
        let mut bad_piece = pieces[1].clone();
        bad_piece[100] ^= 0xff;
        let infos: Vec<BlockInfo> = pieces
            .iter()
            .enumerate()
            .map(|(index, data)| BlockInfo {
                piece_index: index,
                offset: 0,
                len: data.len() as u32,
            })
            .collect();

        handle.write_block(0, infos[0], pieces[0].clone()).unwrap();
        handle.write_block(0, infos[1], bad_piece).unwrap();
        handle.write_block(0, infos[2], pieces[2].clone()).unwrap();

        let mut valid = Vec::new();
        let mut invalid = Vec::new();
        for _ in 0..3 {
            match alert_port.recv().await.unwrap() {
                TorrentAlert::PieceCompleted(Ok(completion)) => {
                    if completion.is_valid {
                        valid.push(completion.index);
                    } else {
                        invalid.push(completion.index);
                    }
                }
                alert => panic!("unexpected alert {:?}", alert),
            }
        }
        valid.sort();
        assert_eq!(valid, vec![0, 2]);
        assert_eq!(invalid, vec![1]);

        // retry piece 1 with the correct bytes
        handle.write_block(0, infos[1], pieces[1].clone()).unwrap();
        match alert_port.recv().await.unwrap() {
            TorrentAlert::PieceCompleted(Ok(completion)) => {
                assert_eq!(completion.index, 1);
                assert!(completion.is_valid);
            }
            alert => panic!("unexpected alert {:?}", alert),
        }

        // serve a block of piece 2 back (from cache or disk)
        let (result_chan, result_port) = oneshot::channel();
        handle
            .read_block(
                0,
                BlockInfo {
                    piece_index: 2,
                    offset: 1024,
                    len: 2048,
                },
                result_chan,
            )
            .unwrap();
        let block = result_port.await.unwrap().unwrap();
        assert_eq!(block, &pieces[2][1024..1024 + 2048]);

        // an out of bounds request is refused
        let (result_chan, result_port) = oneshot::channel();
        handle
            .read_block(
                0,
                BlockInfo {
                    piece_index: 2,
                    offset: BLOCK_LEN / 2 - 10,
                    len: 100,
                },
                result_chan,
            )
            .unwrap();
        assert!(result_port.await.unwrap().is_err());

        handle.shutdown().unwrap();
    }

    #[tokio::test]
    async fn test_validation_marks_exactly_valid_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, pieces, piece_hashes) =
            test_storage(dir.path().join("download"));

        // lay the full content down on disk by hand
        let all: Vec<u8> =
            pieces.iter().flatten().copied().collect();
        fs::create_dir_all(storage.download_dir.join("sub")).unwrap();
        fs::write(storage.download_dir.join("a"), &all[..20_000]).unwrap();
        fs::write(storage.download_dir.join("sub/b"), &all[20_000..])
            .unwrap();

        let (_join, handle) = disk::spawn(100, Duration::from_secs(15));
        let (alert_chan, mut alert_port) =
            tokio::sync::mpsc::unbounded_channel();
        handle
            .allocate_new_torrent(
                0,
                storage.clone(),
                piece_hashes.clone(),
                alert_chan,
            )
            .unwrap();
        match alert_port.recv().await.unwrap() {
            TorrentAlert::Allocated(result) => assert!(result.is_ok()),
            alert => panic!("unexpected alert {:?}", alert),
        }

        handle.validate(0).unwrap();
        match alert_port.recv().await.unwrap() {
            TorrentAlert::Validated { pieces } => {
                assert_eq!(pieces.count_ones(), 3);
            }
            alert => panic!("unexpected alert {:?}", alert),
        }

        // flip one byte inside piece 1 (piece 1 covers torrent bytes
        // 16384..32768, which live in both files; byte 21000 is in file b)
        let path = storage.download_dir.join("sub/b");
        let mut content = fs::read(&path).unwrap();
        content[21_000 - 20_000] ^= 0xff;
        fs::write(&path, content).unwrap();

        handle.validate(0).unwrap();
        match alert_port.recv().await.unwrap() {
            TorrentAlert::Validated { pieces } => {
                // exactly the piece containing the mutated byte is cleared
                assert!(pieces[0]);
                assert!(!pieces[1]);
                assert!(pieces[2]);
            }
            alert => panic!("unexpected alert {:?}", alert),
        }

        handle.shutdown().unwrap();
    }
}
