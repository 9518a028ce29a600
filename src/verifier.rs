//! Piece verification: hashing an assembled piece's bytes against the
//! torrent's expected digest.
//!
//! Deliberately pure and I/O-free, like the wire parser: it takes bytes
//! already assembled in memory and a digest already known to the caller,
//! and returns a verdict. Callers (the inventory's commit path) decide what
//! to do with that verdict — write it to disk, release the piece, escalate
//! a corruption suspicion — verification itself has no opinion on any of
//! that.

use sha1::{Digest, Sha1};

use crate::{PieceIndex, Sha1Hash};

/// The outcome of attempting to verify a piece's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The assembled bytes hash to the expected digest.
    Ok,
    /// The assembled bytes are the wrong length for this piece: verification
    /// was not even attempted, since a short or long buffer can never be a
    /// legitimate match.
    WrongLength { expected: usize, actual: usize },
    /// The assembled bytes are the right length but hash to something else.
    HashMismatch,
}

/// Hashes `data` and compares it against `expected_hash`, first checking
/// that `data` is exactly `expected_len` bytes.
pub fn verify(piece_index: PieceIndex, data: &[u8], expected_len: usize, expected_hash: &Sha1Hash) -> Verdict {
    let _ = piece_index;
    if data.len() != expected_len {
        return Verdict::WrongLength { expected: expected_len, actual: data.len() };
    }
    let digest = Sha1::digest(data);
    if digest.as_slice() == expected_hash {
        Verdict::Ok
    } else {
        Verdict::HashMismatch
    }
}
