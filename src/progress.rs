//! The structured progress sink the core exposes in place of logging to a
//! terminal: piece completions, session opens, and session failures, as a
//! channel of events a driver can consume however it likes (print them,
//! fold them into a progress bar, ignore them entirely).
//!
//! An `UnboundedSender` the core holds a clone of and the driver reads
//! from, rather than a trait object the core would have to be generic
//! over.

use crate::{PeerId, PieceIndex};

/// One observable event in a download's lifetime.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// A piece was verified and persisted.
    PieceCompleted { piece_index: PieceIndex },
    /// A session reached the `Active` state (handshake and bitfield
    /// exchange both succeeded).
    SessionOpened { peer_id: PeerId },
    /// A session retired with a failure.
    SessionFailed { peer_id: Option<PeerId>, reason: String },
}

/// The sending half held by the core; cloned once per session.
pub type ProgressSink = tokio::sync::mpsc::UnboundedSender<ProgressEvent>;

/// Sends an event if a sink was supplied, discarding the error (and logging
/// at debug level) if the receiving end has already been dropped: a driver
/// that isn't listening for progress is not a reason to fail a download.
pub fn notify(sink: Option<&ProgressSink>, event: ProgressEvent) {
    if let Some(sink) = sink {
        if sink.send(event).is_err() {
            log::debug!("progress sink dropped, discarding event");
        }
    }
}
