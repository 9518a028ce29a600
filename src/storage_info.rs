//! Per-torrent storage bookkeeping: piece lengths, file layout, and the
//! mapping between piece indices and the files they overlap.
//!
//! The piece store's `reassemble` and the inventory's per-piece length
//! lookups both depend on it.

use std::{ops::Range, path::PathBuf};

use crate::{error::Error, metainfo::Metainfo, FileIndex, PieceIndex};

/// Information about a torrent's file.
#[derive(Clone, Debug, PartialEq)]
pub struct FileInfo {
    /// The file's relative path from the download directory.
    pub path: PathBuf,
    /// The file's length, in bytes.
    pub len: u64,
    /// The byte offset of the file within the torrent, when all files in the
    /// torrent are viewed as a single contiguous byte array. Always 0 for a
    /// single file torrent.
    pub torrent_offset: u64,
}

impl FileInfo {
    /// Returns a range representing the file's first and one-past-the-last
    /// byte offsets in the torrent.
    pub fn byte_range(&self) -> Range<u64> {
        self.torrent_offset..self.torrent_end_offset()
    }

    /// Returns the file's one-past-the-last byte offset in the torrent.
    pub fn torrent_end_offset(&self) -> u64 {
        self.torrent_offset + self.len
    }

    /// Returns the slice in file that overlaps with the range starting at
    /// `torrent_offset` and extending `len` bytes (clamped to the file's
    /// length).
    ///
    /// # Panics
    ///
    /// Panics if `torrent_offset` falls outside the file's byte range: that
    /// would indicate a bug in the caller's file/piece bookkeeping, not a
    /// condition produced by untrusted input.
    pub fn get_slice(&self, torrent_offset: u64, len: u64) -> FileSlice {
        assert!(
            torrent_offset >= self.torrent_offset,
            "torrent offset must be larger than file offset"
        );
        let torrent_end_offset = self.torrent_end_offset();
        assert!(
            torrent_offset < torrent_end_offset,
            "torrent offset must be smaller than file end offset"
        );

        FileSlice {
            offset: torrent_offset - self.torrent_offset,
            len: len.min(torrent_end_offset - torrent_offset),
        }
    }
}

/// Represents the location of a range of bytes within a file.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FileSlice {
    /// The byte offset in file, relative to the file's start.
    pub offset: u64,
    /// The length of the slice, in bytes.
    pub len: u64,
}

/// Storage-layer details about a torrent derived from its metainfo: piece
/// count and length, total download length, and file layout.
#[derive(Clone, Debug)]
pub struct StorageInfo {
    /// The number of pieces in the torrent.
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The length of the last piece, which may be shorter than `piece_len`.
    pub last_piece_len: u32,
    /// The sum of the lengths of all files in the torrent.
    pub total_len: u64,
    /// The paths and lengths of the torrent's files.
    pub structure: FsStructure,
}

impl StorageInfo {
    /// Extracts storage-related information from the torrent metainfo,
    /// rooting relative file paths at `download_dir` (joined with the
    /// torrent's own name for multi-file archives, so that a torrent with
    /// several top-level entries doesn't scatter them across the download
    /// directory).
    pub fn new(metainfo: &Metainfo, download_dir: impl Into<PathBuf>) -> Self {
        let download_dir = download_dir.into();
        let piece_count = metainfo.piece_count();
        let total_len = metainfo.total_length();
        let piece_len = metainfo.info.piece_length;
        let last_piece_len =
            total_len - piece_len as u64 * (piece_count.max(1) - 1) as u64;
        let last_piece_len = last_piece_len as u32;

        let structure = match &metainfo.info.files {
            None => FsStructure::File(FileInfo {
                path: download_dir.join(&metainfo.info.name),
                len: total_len,
                torrent_offset: 0,
            }),
            Some(files) => {
                let root = download_dir.join(&metainfo.info.name);
                let mut torrent_offset = 0;
                let files = files
                    .iter()
                    .map(|f| {
                        let info = FileInfo {
                            path: root.join(f.path.iter().collect::<PathBuf>()),
                            len: f.length as u64,
                            torrent_offset,
                        };
                        torrent_offset += info.len;
                        info
                    })
                    .collect();
                FsStructure::Archive { files }
            }
        };

        Self {
            piece_count,
            piece_len,
            last_piece_len,
            total_len,
            structure,
        }
    }

    /// Returns the zero-based indices of the files that intersect with the
    /// piece at `index`.
    pub fn files_intersecting_piece(
        &self,
        index: PieceIndex,
    ) -> Result<Range<FileIndex>, Error> {
        let piece_offset = index as u64 * self.piece_len as u64;
        let piece_end = piece_offset + self.piece_len(index)? as u64;
        Ok(self.structure.files_intersecting_bytes(piece_offset..piece_end))
    }

    /// Returns the length of the piece at the given index.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32, Error> {
        if self.piece_count == 0 {
            return Err(Error::InvalidPieceIndex(index));
        }
        if index == self.piece_count - 1 {
            Ok(self.last_piece_len)
        } else if index < self.piece_count - 1 {
            Ok(self.piece_len)
        } else {
            Err(Error::InvalidPieceIndex(index))
        }
    }
}

/// The file system structure of the download.
#[derive(Clone, Debug)]
pub enum FsStructure {
    /// A single file download.
    File(FileInfo),
    /// Multiple files, possibly nested in subdirectories.
    Archive {
        /// A flattened list of all files in the archive, in torrent order.
        files: Vec<FileInfo>,
    },
}

impl FsStructure {
    /// Returns true if the download is for an archive (multiple files).
    pub fn is_archive(&self) -> bool {
        matches!(self, Self::Archive { .. })
    }

    /// Returns the files that overlap the given left-inclusive,
    /// right-exclusive range of torrent-relative byte offsets.
    pub fn files_intersecting_bytes(
        &self,
        byte_range: Range<u64>,
    ) -> Range<FileIndex> {
        match self {
            Self::File(_) => 0..1,
            Self::Archive { files } => {
                let first_matching_index = match files
                    .iter()
                    .enumerate()
                    .find(|(_, file)| file.byte_range().contains(&byte_range.start))
                    .map(|(index, _)| index)
                {
                    Some(index) => index,
                    None => return 0..0,
                };

                let mut file_range = first_matching_index..first_matching_index + 1;

                for (index, file) in
                    files.iter().enumerate().skip(first_matching_index + 1)
                {
                    if !byte_range.contains(&file.torrent_offset) {
                        break;
                    }
                    file_range.end = index + 1;
                }

                file_range
            }
        }
    }
}
