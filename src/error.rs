//! The error taxonomy of the engine.
//!
//! Session-local kinds ([`Error::Network`], [`Error::HandshakeMismatch`],
//! [`Error::Protocol`]) are caught at the session boundary and converted into
//! a `Failed` outcome rather than propagated; [`Error::HashMismatch`] causes
//! the affected piece to be released back to the unassigned pool, with
//! repeated mismatches escalating to [`Error::CorruptionSuspected`];
//! [`Error::Store`] and [`Error::NoPeersSucceeded`] propagate to the caller.

use crate::PieceIndex;

/// The crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A socket failed to connect, timed out, or failed on read/write at a
    /// fatal boundary. Session-local: the session retires and its claimed
    /// pieces are released.
    #[error("network error connecting to peer: {0}")]
    Network(#[from] std::io::Error),

    /// The TCP connect itself did not complete within the configured
    /// timeout. Kept distinct from a generic [`Error::Network`] so logs can
    /// tell a slow/unreachable peer apart from one that actively refused or
    /// reset the connection.
    #[error("connecting to peer timed out")]
    ConnectTimeout,

    /// The peer did not complete its handshake within the configured
    /// timeout.
    #[error("peer handshake timed out")]
    HandshakeTimeout,

    /// The peer's handshake had a malformed protocol prefix.
    #[error("peer handshake has malformed protocol string")]
    MalformedHandshake,

    /// The peer's handshake carried an infohash different from ours.
    /// Session-fatal.
    #[error("peer handshake infohash does not match ours")]
    HandshakeMismatch,

    /// A framing-level sanity violation: a declared frame length exceeding
    /// the configured cap, or a PIECE payload shorter than the minimum 8
    /// bytes. Session-fatal.
    #[error("protocol framing error: {0}")]
    Protocol(String),

    /// The peer sent a BITFIELD whose length is inconsistent with the
    /// number of pieces in the torrent (padding bits beyond the piece count
    /// are non-zero, or the byte count is wrong).
    #[error("peer sent a malformed bitfield")]
    MalformedBitfield,

    /// The peer sent a typed message before sending (or instead of) the
    /// expected initial BITFIELD.
    #[error("peer sent a message before its bitfield")]
    BitfieldNotFirst,

    /// A piece's assembled bytes did not hash to the expected digest. The
    /// piece is released to the unassigned pool; this is not by itself
    /// fatal for the download.
    #[error("piece {0} failed hash verification")]
    HashMismatch(PieceIndex),

    /// The same piece index has now mismatched its hash
    /// `hash_mismatch_abort_threshold` times in a row across all sessions:
    /// the torrent's pieces are presumed corrupt at the source and the
    /// download aborts.
    #[error("piece {0} failed hash verification {1} times in a row, aborting")]
    CorruptionSuspected(PieceIndex, u32),

    /// A piece store filesystem operation failed. Fatal for the download.
    #[error("piece store error: {0}")]
    Store(String),

    /// Every peer in the supplied list retired before any piece completed.
    #[error("no peer in the supplied list yielded a successful session")]
    NoPeersSucceeded,

    /// The caller asked for a piece index out of range for this torrent.
    #[error("piece index {0} is out of range")]
    InvalidPieceIndex(PieceIndex),
}
