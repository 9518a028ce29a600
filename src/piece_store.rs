//! The on-disk layout of in-progress and completed pieces.
//!
//! Each piece is held in its own `piece_XXXXX.bin` file, named by the
//! piece's index, under a staging directory separate from the final
//! download layout. A piece is written with the classic write-then-rename
//! trick: the bytes land in a `.tmp` sibling first, and only the atomic
//! rename makes them visible under the real name, so a crash mid-write
//! never leaves a partial piece file that looks complete. On load, a piece
//! file whose length doesn't match the piece's expected length (zero bytes,
//! or truncated) is treated as though the piece were never saved at all,
//! rather than as a corrupt file needing repair: the session just
//! re-requests it.
//!
//! `reassemble` is the one operation that crosses from the piece-indexed
//! staging layout into the torrent's real file layout, using
//! [`crate::storage_info::StorageInfo`] to know which bytes of which piece
//! belong to which file.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;

use crate::error::Error;
use crate::storage_info::{FileInfo, FsStructure, StorageInfo};
use crate::{Bitfield, PieceIndex};

/// Owns the staging directory that holds one file per piece while a torrent
/// is in progress, and knows how to fold those pieces into the torrent's
/// real file layout once the download is complete.
pub struct PieceStore {
    pieces_dir: PathBuf,
    storage: StorageInfo,
}

impl PieceStore {
    /// Opens (creating if necessary) the piece staging directory.
    pub fn new(storage: StorageInfo, pieces_dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let pieces_dir = pieces_dir.into();
        fs::create_dir_all(&pieces_dir).map_err(|e| Error::Store(e.to_string()))?;
        Ok(Self { pieces_dir, storage })
    }

    /// A reference to the torrent's storage layout, for callers (the
    /// inventory) that need piece lengths without duplicating the lookup.
    pub fn storage(&self) -> &StorageInfo {
        &self.storage
    }

    fn piece_path(&self, index: PieceIndex) -> PathBuf {
        self.pieces_dir.join(format!("piece_{index:05}.bin"))
    }

    fn tmp_path(&self, index: PieceIndex) -> PathBuf {
        self.pieces_dir.join(format!("piece_{index:05}.bin.tmp"))
    }

    /// Whether a complete piece is present on disk: the file exists and its
    /// length matches the piece's expected length exactly. A shorter or
    /// longer file is not "present" for this purpose.
    pub fn has_piece(&self, index: PieceIndex) -> Result<bool, Error> {
        let expected_len = self.storage.piece_len(index)? as u64;
        match fs::metadata(self.piece_path(index)) {
            Ok(meta) => Ok(meta.len() == expected_len),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Store(e.to_string())),
        }
    }

    /// Scans the staging directory and builds a bitfield of which pieces
    /// are already present and intact, for resuming a partial download.
    pub fn inventory_on_disk(&self) -> Result<Bitfield, Error> {
        let mut bits = Bitfield::repeat(false, self.storage.piece_count);
        for index in 0..self.storage.piece_count {
            if self.has_piece(index)? {
                bits.set(index, true);
            }
        }
        Ok(bits)
    }

    /// Writes a verified piece's bytes to disk, atomically.
    pub fn save(&self, index: PieceIndex, data: &[u8]) -> Result<(), Error> {
        let tmp_path = self.tmp_path(index);
        fs::write(&tmp_path, data).map_err(|e| Error::Store(e.to_string()))?;
        fs::rename(&tmp_path, self.piece_path(index)).map_err(|e| Error::Store(e.to_string()))?;
        Ok(())
    }

    /// Loads a piece's bytes, or `None` if it isn't present and intact
    /// (see [`Self::has_piece`]).
    pub fn load(&self, index: PieceIndex) -> Result<Option<Vec<u8>>, Error> {
        if !self.has_piece(index)? {
            return Ok(None);
        }
        let data = fs::read(self.piece_path(index)).map_err(|e| Error::Store(e.to_string()))?;
        Ok(Some(data))
    }

    fn file_info(&self, index: usize) -> &FileInfo {
        match &self.storage.structure {
            FsStructure::File(file) => {
                debug_assert_eq!(index, 0);
                file
            }
            FsStructure::Archive { files } => &files[index],
        }
    }

    /// Writes every piece currently in the staging directory out to the
    /// torrent's real file layout, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Fails if a piece required to cover the torrent's full length is
    /// missing from the staging directory: reassembly is only meant to be
    /// called once the inventory reports the download complete.
    pub fn reassemble(&self) -> Result<(), Error> {
        let mut open_files: HashMap<PathBuf, File> = HashMap::new();
        for index in 0..self.storage.piece_count {
            let data = self
                .load(index)?
                .ok_or_else(|| Error::Store(format!("piece {index} missing from store during reassembly")))?;
            let piece_offset = index as u64 * self.storage.piece_len as u64;
            let piece_end = piece_offset + data.len() as u64;

            for file_index in self.storage.files_intersecting_piece(index)? {
                let file = self.file_info(file_index);
                let overlap_start = piece_offset.max(file.torrent_offset);
                let overlap_end = piece_end.min(file.torrent_end_offset());
                if overlap_start >= overlap_end {
                    continue;
                }
                let slice = file.get_slice(overlap_start, overlap_end - overlap_start);
                let data_start = (overlap_start - piece_offset) as usize;
                let data_end = (overlap_end - piece_offset) as usize;

                if !open_files.contains_key(&file.path) {
                    if let Some(parent) = file.path.parent() {
                        fs::create_dir_all(parent).map_err(|e| Error::Store(e.to_string()))?;
                    }
                    let handle = OpenOptions::new()
                        .create(true)
                        .write(true)
                        .open(&file.path)
                        .map_err(|e| Error::Store(e.to_string()))?;
                    open_files.insert(file.path.clone(), handle);
                }
                let handle = open_files.get_mut(&file.path).expect("just inserted");
                handle
                    .seek(SeekFrom::Start(slice.offset))
                    .map_err(|e| Error::Store(e.to_string()))?;
                handle
                    .write_all(&data[data_start..data_end])
                    .map_err(|e| Error::Store(e.to_string()))?;
            }
        }
        Ok(())
    }
}
