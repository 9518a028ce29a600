//! A leech-only BitTorrent v1 peer-session engine.
//!
//! This crate implements the peer-facing core of a BitTorrent client: the
//! wire codec ([`wire`]), the shared piece bookkeeping ([`inventory`]), the
//! piece-assembly/verification pipeline ([`verifier`]), the on-disk piece
//! layout ([`piece_store`]), the per-connection state machine
//! ([`peer::session`]) and the supervisor that fans out connections to many
//! peers in parallel ([`supervisor`]).
//!
//! Bencode metainfo decoding and tracker announce traffic are treated as
//! external collaborators: callers provide an already-parsed
//! [`metainfo::Metainfo`] and an already-resolved peer list.

#![recursion_limit = "256"]

pub mod conf;
pub mod error;
pub mod inventory;
pub mod metainfo;
pub mod peer;
pub mod piece_store;
pub mod progress;
pub mod storage_info;
pub mod supervisor;
pub mod verifier;
pub mod wire;

use bitvec::prelude::{BitVec, Msb0};

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, but in
/// the source we use `usize` to be consistent with other index types.
pub type PieceIndex = usize;

/// The type of a file's index within a torrent's (possibly multi-file)
/// structure.
pub type FileIndex = usize;

/// A 20-byte peer identifier, opaque beyond its length.
///
/// Guidelines for choosing a peer ID: <http://bittorrent.org/beps/bep_0020.html>.
pub type PeerId = [u8; 20];

/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// The bitfield represents the piece availability of a peer.
///
/// It is a compact bool vector ordered most significant bit to least
/// significant bit, i.e. the first highest bit represents the first piece,
/// the second highest bit the second piece, and so on (e.g. `0b1100_0001`
/// means the peer has pieces 0, 1 and 7). A truthy value at a piece's
/// position means the peer has the piece.
pub type Bitfield = BitVec<u8, Msb0>;

/// The fixed request size used throughout the engine (except possibly for
/// the last block of a piece): the widely used and accepted 16 KiB.
pub const BLOCK_LEN: u32 = 0x4000;

/// A block is a fixed size chunk of a piece, which in turn is a fixed size
/// chunk of a torrent. Downloading happens at this block granularity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub piece_index: PieceIndex,
    /// The zero-based byte offset into the piece.
    pub offset: u32,
    /// The block's length in bytes. Always [`BLOCK_LEN`] except possibly for
    /// the last block of a piece.
    pub len: u32,
}

/// Returns the length of the block at `index` within a piece of length
/// `piece_len`, assuming the canonical [`BLOCK_LEN`] block size.
///
/// # Panics
///
/// Panics if `index * BLOCK_LEN` would exceed `piece_len`: this is a
/// programmer error, never a condition produced by untrusted input, since
/// callers only ever iterate indices `0..block_count(piece_len)`.
pub(crate) fn block_len(piece_len: u32, index: usize) -> u32 {
    let block_offset = index as u32 * BLOCK_LEN;
    assert!(piece_len > block_offset, "block index out of range for piece");
    std::cmp::min(piece_len - block_offset, BLOCK_LEN)
}

/// Returns the number of blocks in a piece of the given length.
pub(crate) fn block_count(piece_len: u32) -> usize {
    // all but the last piece are a multiple of the block length, but the
    // last piece may be shorter, so round up before dividing
    (piece_len as usize + (BLOCK_LEN as usize - 1)) / BLOCK_LEN as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK_LEN_MULTIPLE_PIECE_LEN: u32 = 2 * BLOCK_LEN;
    const OVERLAP: u32 = 234;
    const UNEVEN_PIECE_LEN: u32 = 2 * BLOCK_LEN + OVERLAP;

    #[test]
    fn test_block_len() {
        assert_eq!(block_len(BLOCK_LEN_MULTIPLE_PIECE_LEN, 0), BLOCK_LEN);
        assert_eq!(block_len(BLOCK_LEN_MULTIPLE_PIECE_LEN, 1), BLOCK_LEN);

        assert_eq!(block_len(UNEVEN_PIECE_LEN, 0), BLOCK_LEN);
        assert_eq!(block_len(UNEVEN_PIECE_LEN, 1), BLOCK_LEN);
        assert_eq!(block_len(UNEVEN_PIECE_LEN, 2), OVERLAP);
    }

    #[test]
    #[should_panic]
    fn test_block_len_invalid_index_panics() {
        block_len(BLOCK_LEN_MULTIPLE_PIECE_LEN, 2);
    }

    #[test]
    fn test_block_count() {
        assert_eq!(block_count(BLOCK_LEN_MULTIPLE_PIECE_LEN), 2);
        assert_eq!(block_count(UNEVEN_PIECE_LEN), 3);
    }
}
