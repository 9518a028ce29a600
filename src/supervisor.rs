//! The session supervisor: fans connections out across a peer list in
//! batches, keeps whichever batch first proves itself live, and
//! reassembles the output once every piece has landed.
//!
//! Owns cancellation for the whole run: a batch that proves dead within its
//! probe window is simply never waited on further (its tasks run to their
//! own natural completion), and a fatal [`Error::CorruptionSuspected`] from
//! any session aborts every other session the supervisor still knows about
//! via [`tokio::task::JoinHandle::abort`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::conf::Conf;
use crate::error::Error;
use crate::inventory::PieceInventory;
use crate::metainfo::Metainfo;
use crate::peer::session;
use crate::piece_store::PieceStore;
use crate::progress::ProgressSink;
use crate::storage_info::StorageInfo;

/// What a run ended with: every piece landed, or some subset did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The torrent's output files have been written in full.
    Complete,
    /// The run ended (peer list exhausted, or all sessions otherwise
    /// retired) before every piece completed. The driver decides whether
    /// this is worth a retry with a fresh peer list.
    Partial { completed: usize, total: usize },
}

/// Drives an entire download: seeds the inventory from whatever is already
/// on disk, then works through `peers` in batches until the torrent
/// completes or every batch has been exhausted.
pub async fn run(
    peers: Vec<SocketAddr>,
    info_hash: crate::Sha1Hash,
    metainfo: &Metainfo,
    download_dir: impl Into<PathBuf>,
    pieces_dir: impl Into<PathBuf>,
    conf: &Conf,
    progress: Option<ProgressSink>,
) -> Result<Outcome, Error> {
    let storage = StorageInfo::new(metainfo, download_dir);
    let piece_count = storage.piece_count;
    let store = Arc::new(PieceStore::new(storage, pieces_dir)?);

    let completed_on_disk = store.inventory_on_disk()?;
    let seeded = completed_on_disk.count_ones();
    log::info!("seeded {seeded}/{piece_count} pieces already present on disk");
    let inventory = Arc::new(PieceInventory::new(piece_count, completed_on_disk));
    let piece_hashes = Arc::new(metainfo.piece_hashes());

    let mut live_handles: Vec<JoinHandle<Result<(), Error>>> = Vec::new();
    let mut any_batch_live = false;

    for batch in peers.chunks(conf.supervisor.batch_size).take(conf.supervisor.max_batches) {
        log::info!("starting a batch of {} peers", batch.len());
        let mut batch_handles = Vec::with_capacity(batch.len());
        for &addr in batch {
            batch_handles.push(spawn_session(
                addr,
                info_hash,
                piece_count,
                Arc::clone(&piece_hashes),
                conf,
                Arc::clone(&inventory),
                Arc::clone(&store),
                progress.clone(),
            ));
        }

        tokio::time::sleep(conf.supervisor.probe_window).await;

        let mut batch_live = false;
        let mut batch_live_handles = Vec::new();
        let mut corruption = None;
        for handle in batch_handles {
            if handle.is_finished() {
                match handle.await {
                    Ok(Ok(())) => batch_live = true,
                    Ok(Err(e @ Error::CorruptionSuspected(..))) => corruption = Some(e),
                    Ok(Err(e)) => log::warn!("peer session retired during probe window: {e}"),
                    Err(join_err) => log::warn!("peer session task did not run to completion: {join_err}"),
                }
            } else {
                batch_live = true;
                batch_live_handles.push(handle);
            }
        }

        if let Some(e) = corruption {
            for handle in live_handles.iter().chain(batch_live_handles.iter()) {
                handle.abort();
            }
            return Err(e);
        }

        live_handles.extend(batch_live_handles);

        if batch_live {
            any_batch_live = true;
            log::info!("batch proved live after {:?}, launching no further batches", conf.supervisor.probe_window);
            break;
        }
    }

    if !any_batch_live {
        return Err(Error::NoPeersSucceeded);
    }

    for handle in live_handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e @ Error::CorruptionSuspected(..))) => return Err(e),
            Ok(Err(e)) => log::warn!("peer session retired: {e}"),
            Err(join_err) => log::warn!("peer session task did not run to completion: {join_err}"),
        }
    }

    if inventory.is_done(piece_count) {
        store.reassemble()?;
        Ok(Outcome::Complete)
    } else {
        Ok(Outcome::Partial { completed: inventory.completed_count(), total: piece_count })
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_session(
    addr: SocketAddr,
    info_hash: crate::Sha1Hash,
    piece_count: usize,
    piece_hashes: Arc<Vec<crate::Sha1Hash>>,
    conf: &Conf,
    inventory: Arc<PieceInventory>,
    store: Arc<PieceStore>,
    progress: Option<ProgressSink>,
) -> JoinHandle<Result<(), Error>> {
    let self_peer_id = conf.engine.client_id;
    let session_conf = conf.session;
    let threshold = conf.supervisor.hash_mismatch_abort_threshold;
    tokio::spawn(async move {
        session::run(
            addr,
            info_hash,
            self_peer_id,
            piece_count,
            piece_hashes,
            session_conf,
            threshold,
            inventory,
            store,
            progress,
        )
        .await
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_respect_batch_size_and_max_batches() {
        let peers: Vec<SocketAddr> = (0..10)
            .map(|i| SocketAddr::from(([127, 0, 0, 1], 10000 + i as u16)))
            .collect();
        let batch_size = 3;
        let max_batches = 3;
        let batches: Vec<&[SocketAddr]> = peers.chunks(batch_size).take(max_batches).collect();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(batches[2].len(), 3);
        // a 4th batch of 1 peer exists in the list but is never reached.
        assert_eq!(peers.chunks(batch_size).count(), 4);
    }
}
