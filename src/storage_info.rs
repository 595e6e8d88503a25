//! The torrent's storage layout: how the linearized stream of pieces maps
//! onto the files of the download.
//!
//! Files are laid out back to back in torrent order, so every piece covers
//! one contiguous run of files, and each file holds a clamped sub-range of
//! the piece's bytes. All write, read and validation paths go through
//! [`StorageInfo::piece_slices`].

use std::{ops::Range, path::PathBuf};

use crate::{error::*, metainfo::Metainfo, FileIndex, PieceIndex};

/// Information about a torrent's file.
#[derive(Clone, Debug, PartialEq)]
pub struct FileInfo {
    /// The file's path relative to the torrent's download root.
    pub path: PathBuf,
    /// The file's length, in bytes.
    pub len: u64,
    /// Where the file's first byte sits in the linearized torrent.
    pub torrent_offset: u64,
}

impl FileInfo {
    /// One past the file's last byte in the torrent.
    fn torrent_end_offset(&self) -> u64 {
        self.torrent_offset + self.len
    }

    /// Clamps a torrent byte range to this file: the part of the range the
    /// file holds, as an in-file slice. The slice is empty when the range
    /// misses the file (or the file itself is empty).
    fn overlap(&self, bytes: &Range<u64>) -> FileSlice {
        let from = bytes.start.max(self.torrent_offset);
        let to = bytes.end.min(self.torrent_end_offset());
        if to <= from {
            return FileSlice { offset: 0, len: 0 };
        }
        FileSlice {
            offset: from - self.torrent_offset,
            len: to - from,
        }
    }
}

/// A range of bytes within a single file, relative to the file's start.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct FileSlice {
    pub offset: u64,
    pub len: u64,
}

/// Information about a torrent's storage details, such as the piece count
/// and length, download length, the file layout, etc.
#[derive(Clone, Debug)]
pub(crate) struct StorageInfo {
    /// The number of pieces in the torrent.
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The length of the last piece in torrent, which may differ from the
    /// normal piece length if the download size is not an exact multiple of
    /// the piece length.
    pub last_piece_len: u32,
    /// The sum of the lengths of all files in the torrent.
    pub total_len: u64,
    /// The download destination directory of the torrent.
    ///
    /// A single file torrent is placed directly in it, while an archive is
    /// downloaded into a subdirectory named after the torrent, so that a
    /// multi-file torrent doesn't scatter its entries across the download
    /// directory.
    pub download_dir: PathBuf,
    /// The torrent's files in on-wire order, with their offsets in the
    /// linearized torrent. Never empty.
    pub files: Vec<FileInfo>,
}

impl StorageInfo {
    /// Extracts storage related information from the torrent metainfo.
    pub fn new(metainfo: &Metainfo, download_dir: PathBuf) -> Self {
        let piece_count = metainfo.piece_count();
        let total_len = metainfo.total_len();
        let piece_len = metainfo.piece_len;
        let last_piece_len =
            total_len - piece_len as u64 * (piece_count - 1) as u64;
        let last_piece_len = last_piece_len as u32;

        let download_dir = if metainfo.is_archive {
            download_dir.join(&metainfo.name)
        } else {
            download_dir
        };

        // lay the files out back to back to get their torrent offsets
        let mut torrent_offset = 0;
        let files = metainfo
            .files
            .iter()
            .map(|f| {
                let file = FileInfo {
                    path: f.path.clone(),
                    len: f.len,
                    torrent_offset,
                };
                torrent_offset += f.len;
                file
            })
            .collect();

        Self {
            piece_count,
            piece_len,
            last_piece_len,
            total_len,
            download_dir,
            files,
        }
    }

    /// Returns the length of the piece at the given index.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        if index + 1 == self.piece_count {
            Ok(self.last_piece_len)
        } else if index + 1 < self.piece_count {
            Ok(self.piece_len)
        } else {
            log::error!("Piece {} out of bounds for torrent: {:?}", index, self);
            Err(Error::InvalidPieceIndex(index))
        }
    }

    /// The piece's byte range in the linearized torrent.
    fn piece_byte_range(&self, index: PieceIndex) -> Result<Range<u64>> {
        let start = index as u64 * u64::from(self.piece_len);
        Ok(start..start + u64::from(self.piece_len(index)?))
    }

    /// Returns, for each file holding part of the piece, the in-file slice
    /// of the piece's bytes, in torrent order. The slices concatenate to
    /// exactly the piece; empty files inside the span contribute nothing
    /// and are left out.
    pub fn piece_slices(
        &self,
        index: PieceIndex,
    ) -> Result<Vec<(FileIndex, FileSlice)>> {
        let bytes = self.piece_byte_range(index)?;
        let mut slices = Vec::new();
        for file_index in self.files_intersecting_bytes(&bytes) {
            let slice = self.files[file_index].overlap(&bytes);
            if slice.len > 0 {
                slices.push((file_index, slice));
            }
        }
        debug_assert_eq!(
            slices.iter().map(|(_, slice)| slice.len).sum::<u64>(),
            bytes.end - bytes.start,
        );
        Ok(slices)
    }

    /// The indices of the files overlapping the byte range.
    ///
    /// Because the files tile the torrent without gaps, the overlap is
    /// always a single contiguous run: it begins at the first file that
    /// reaches past the range's start and stops before the first file that
    /// begins at or after the range's end.
    fn files_intersecting_bytes(&self, bytes: &Range<u64>) -> Range<FileIndex> {
        let start = self
            .files
            .iter()
            .position(|file| file.torrent_end_offset() > bytes.start)
            .unwrap_or(self.files.len());
        let run_len = self.files[start..]
            .iter()
            .take_while(|file| file.torrent_offset < bytes.end)
            .count();
        start..start + run_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::MetaFile;

    // The single-file shape of the two-peer download walk: an 80 KiB file
    // with 32 KiB pieces, giving pieces of 32768, 32768 and 14464 bytes.
    fn single_file() -> StorageInfo {
        StorageInfo {
            piece_count: 3,
            piece_len: 32 * 1024,
            last_piece_len: 14464,
            total_len: 80 * 1024,
            download_dir: PathBuf::from("/dl"),
            files: vec![FileInfo {
                path: PathBuf::from("payload.bin"),
                len: 80 * 1024,
                torrent_offset: 0,
            }],
        }
    }

    // An archive with piece length 10 over files of 4, 13, 0, 3 and 12
    // bytes (32 total, so pieces of 10, 10, 10 and 2). Piece boundaries
    // fall inside files, exactly between files, and across an empty file:
    //
    //   file    0: bytes  0..4
    //   file    1: bytes  4..17
    //   file    2: empty, at 17
    //   file    3: bytes 17..20
    //   file    4: bytes 20..32
    fn archive() -> StorageInfo {
        let lens = [4u64, 13, 0, 3, 12];
        let mut torrent_offset = 0;
        let files = lens
            .iter()
            .enumerate()
            .map(|(i, len)| {
                let file = FileInfo {
                    path: PathBuf::from(format!("f{}", i)),
                    len: *len,
                    torrent_offset,
                };
                torrent_offset += len;
                file
            })
            .collect();
        StorageInfo {
            piece_count: 4,
            piece_len: 10,
            last_piece_len: 2,
            total_len: 32,
            download_dir: PathBuf::from("/dl/archive"),
            files,
        }
    }

    #[test]
    fn test_piece_len_with_short_last_piece() {
        let info = single_file();
        assert_eq!(info.piece_len(0).unwrap(), 32 * 1024);
        assert_eq!(info.piece_len(1).unwrap(), 32 * 1024);
        assert_eq!(info.piece_len(2).unwrap(), 14464);
        assert!(matches!(
            info.piece_len(3),
            Err(Error::InvalidPieceIndex(3))
        ));
    }

    #[test]
    fn test_overlap_clamps_to_the_file() {
        let file = FileInfo {
            path: PathBuf::from("f"),
            len: 13,
            torrent_offset: 4,
        };

        // a range fully inside the file maps through unclamped
        assert_eq!(
            file.overlap(&(6..9)),
            FileSlice { offset: 2, len: 3 }
        );
        // a range spilling over both ends is clamped to the file
        assert_eq!(
            file.overlap(&(0..32)),
            FileSlice { offset: 0, len: 13 }
        );
        // a range reaching only the first byte
        assert_eq!(
            file.overlap(&(0..5)),
            FileSlice { offset: 0, len: 1 }
        );
        // ranges before, after, and empty files all yield empty slices
        assert_eq!(file.overlap(&(0..4)), FileSlice { offset: 0, len: 0 });
        assert_eq!(
            file.overlap(&(17..20)),
            FileSlice { offset: 0, len: 0 }
        );
        let empty = FileInfo {
            path: PathBuf::from("e"),
            len: 0,
            torrent_offset: 17,
        };
        assert_eq!(
            empty.overlap(&(10..20)),
            FileSlice { offset: 0, len: 0 }
        );
    }

    #[test]
    fn test_file_runs_are_contiguous() {
        let info = archive();

        // within one file
        assert_eq!(info.files_intersecting_bytes(&(5..9)), 1..2);
        // across a file boundary
        assert_eq!(info.files_intersecting_bytes(&(2..6)), 0..2);
        // the run around the empty file spans its neighbors (the empty
        // file lies inside the run but holds nothing)
        assert_eq!(info.files_intersecting_bytes(&(16..21)), 1..5);
        // the whole torrent
        assert_eq!(info.files_intersecting_bytes(&(0..32)), 0..5);
        // an empty range touches nothing, nor does one past the end
        assert_eq!(info.files_intersecting_bytes(&(4..4)), 1..1);
        assert_eq!(info.files_intersecting_bytes(&(32..40)), 5..5);
    }

    #[test]
    fn test_piece_slices_tile_every_piece() {
        let info = archive();

        // piece 0 (bytes 0..10): the first file and the head of the second
        assert_eq!(
            info.piece_slices(0).unwrap(),
            vec![
                (0, FileSlice { offset: 0, len: 4 }),
                (1, FileSlice { offset: 0, len: 6 }),
            ]
        );
        // piece 1 (bytes 10..20): tail of file 1, then file 3; the empty
        // file 2 between them is skipped
        assert_eq!(
            info.piece_slices(1).unwrap(),
            vec![
                (1, FileSlice { offset: 6, len: 7 }),
                (3, FileSlice { offset: 0, len: 3 }),
            ]
        );
        // pieces 2 and 3 (bytes 20..30 and 30..32) both land in file 4
        assert_eq!(
            info.piece_slices(2).unwrap(),
            vec![(4, FileSlice { offset: 0, len: 10 })]
        );
        assert_eq!(
            info.piece_slices(3).unwrap(),
            vec![(4, FileSlice { offset: 10, len: 2 })]
        );

        // every piece's slices add up to that piece's length
        for index in 0..info.piece_count {
            let total: u64 = info
                .piece_slices(index)
                .unwrap()
                .iter()
                .map(|(_, slice)| slice.len)
                .sum();
            assert_eq!(total, u64::from(info.piece_len(index).unwrap()));
        }

        assert!(info.piece_slices(4).is_err());
    }

    #[test]
    fn test_single_file_slices() {
        let info = single_file();
        // the short last piece starts at 64 KiB within the only file
        assert_eq!(
            info.piece_slices(2).unwrap(),
            vec![(
                0,
                FileSlice {
                    offset: 64 * 1024,
                    len: 14464,
                }
            )]
        );
    }

    #[test]
    fn test_new_computes_offsets_and_archive_dir() {
        let metainfo = Metainfo {
            name: "bundle".to_string(),
            info_hash: [0; 20],
            info_bytes: Vec::new(),
            // two pieces of 6 bytes, 12 bytes of content
            pieces: vec![0; 40],
            piece_len: 6,
            files: vec![
                MetaFile {
                    path: PathBuf::from("a"),
                    len: 7,
                },
                MetaFile {
                    path: PathBuf::from("sub/b"),
                    len: 5,
                },
            ],
            is_archive: true,
            announce_list: Vec::new(),
        };

        let info = StorageInfo::new(&metainfo, PathBuf::from("/dl"));
        // archives download into a directory named after the torrent
        assert_eq!(info.download_dir, PathBuf::from("/dl/bundle"));
        assert_eq!(info.piece_count, 2);
        assert_eq!(info.last_piece_len, 6);
        assert_eq!(info.files[0].torrent_offset, 0);
        assert_eq!(info.files[1].torrent_offset, 7);

        // a single file stays directly in the download directory
        let metainfo = Metainfo {
            is_archive: false,
            files: vec![MetaFile {
                path: PathBuf::from("bundle"),
                len: 12,
            }],
            ..metainfo
        };
        let info = StorageInfo::new(&metainfo, PathBuf::from("/dl"));
        assert_eq!(info.download_dir, PathBuf::from("/dl"));
        assert_eq!(info.total_len, 12);
    }
}
