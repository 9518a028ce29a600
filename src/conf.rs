//! This module defines types used to configure the engine and its parts.
//!
//! Every timeout and limit named in the design (connect/handshake timeouts,
//! the per-session pipeline depth, the supervisor's batching policy, the
//! hash-mismatch abort threshold) lives here with its documented default, so
//! that the algorithm bodies elsewhere never hardcode a magic number.

use std::time::Duration;

use crate::PeerId;

/// The default client id announced in handshakes.
pub const DEFAULT_CLIENT_ID: &PeerId = b"-BT0001-000000000000";

/// The global configuration for the engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub session: SessionConf,
    pub supervisor: SupervisorConf,
}

impl Conf {
    /// Returns the configuration with reasonable defaults and a freshly
    /// generated client id (see [`crate::peer::session::generate_peer_id`]).
    pub fn new(client_id: PeerId) -> Self {
        Self {
            engine: EngineConf { client_id },
            session: SessionConf::default(),
            supervisor: SupervisorConf::default(),
        }
    }
}

impl Default for Conf {
    fn default() -> Self {
        Self::new(*DEFAULT_CLIENT_ID)
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Copy, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to peers.
    pub client_id: PeerId,
}

/// Per-peer-session configuration: the timeouts and pipeline depth that
/// govern a single connection's state machine.
#[derive(Clone, Copy, Debug)]
pub struct SessionConf {
    /// How long to wait for the TCP connect to succeed.
    pub connect_timeout: Duration,
    /// How long to wait for the peer's handshake after we've sent ours.
    pub handshake_timeout: Duration,
    /// How long a read may remain idle before it is looped back on (not
    /// fatal by itself, provided other sessions are still making progress).
    pub read_idle_timeout: Duration,
    /// How often a keep-alive (zero-length frame) is sent during idleness.
    pub keepalive_interval: Duration,
    /// The maximum number of pieces this session keeps claimed and
    /// in-flight at once (one block outstanding per piece, pipelined across
    /// pieces).
    pub max_pipelined_pieces: usize,
    /// Bound on the declared length of an incoming frame, expressed as
    /// `piece_len + this margin`, above which the frame is rejected as a
    /// protocol error rather than buffered.
    pub max_frame_overhead: u32,
    /// How long cancellation is given to drain in-flight I/O before the
    /// session's socket is forced closed.
    pub cancellation_grace_period: Duration,
}

impl Default for SessionConf {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            read_idle_timeout: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(120),
            max_pipelined_pieces: 15,
            max_frame_overhead: 13,
            cancellation_grace_period: Duration::from_secs(2),
        }
    }
}

/// Configuration for the [`crate::supervisor`]'s batching policy (spec
/// §4.6).
#[derive(Clone, Copy, Debug)]
pub struct SupervisorConf {
    /// The number of peers started together in one batch.
    pub batch_size: usize,
    /// The maximum number of batches attempted before giving up.
    pub max_batches: usize,
    /// How long a freshly started batch is given to prove at least one
    /// session is live before the next batch is launched.
    pub probe_window: Duration,
    /// The number of consecutive hash mismatches on the same piece index,
    /// across all sessions, that causes the download to abort with
    /// `CorruptionSuspected`.
    pub hash_mismatch_abort_threshold: u32,
}

impl Default for SupervisorConf {
    fn default() -> Self {
        Self {
            batch_size: 3,
            max_batches: 3,
            probe_window: Duration::from_secs(10),
            hash_mismatch_abort_threshold: 3,
        }
    }
}
