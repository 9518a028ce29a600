//! The metainfo descriptor consumed (not owned) by this crate.
//!
//! Bencode decoding is, per the design, an external collaborator's
//! responsibility; the `Metainfo`/`Info`/`File` shapes and the
//! `from_bytes`/`info_hash` convenience methods below exist only so that
//! tests and examples in this crate can construct realistic fixtures
//! without a separate decoder crate in the dev-dependency graph.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::Sha1Hash;

#[derive(Debug, Clone, Deserialize)]
pub struct Metainfo {
    pub info: Info,
}

impl Metainfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self, serde_bencode::Error> {
        serde_bencode::from_bytes(buf)
    }

    /// The infohash is the SHA-1 of the bencoded `info` subdictionary.
    pub fn info_hash(&self) -> Result<Sha1Hash, serde_bencode::Error> {
        let encoded = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&encoded);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// The total length of the torrent's content, in bytes, across all
    /// files.
    pub fn total_length(&self) -> u64 {
        match &self.info.files {
            Some(files) => files.iter().map(|f| f.length as u64).sum(),
            None => self.info.length.unwrap_or(0),
        }
    }

    /// The number of pieces, derived from the length of the concatenated
    /// piece-hash table.
    pub fn piece_count(&self) -> usize {
        self.info.pieces.len() / 20
    }

    /// The individual 20-byte SHA-1 digests, one per piece, in order.
    pub fn piece_hashes(&self) -> Vec<Sha1Hash> {
        self.info
            .pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    pub piece_length: u32,
    pub length: Option<u64>,
    pub files: Option<Vec<File>>,
    pub private: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: i64,
}
