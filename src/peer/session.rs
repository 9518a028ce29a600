//! A single peer connection's state machine:
//! `Dialing -> Handshaking -> Awaiting-Bitfield -> Choked/Active -> Closing`,
//! with `Failed` reachable from anywhere. `Done`/`Failed(reason)` are
//! modeled the way every other fallible operation in this crate is:
//! `Ok(())` for `Done`, `Err(Error)` for `Failed(reason)`.
//!
//! The pipeline of claimed pieces is wrapped in [`Pipeline`], whose `Drop`
//! releases every still-held piece index back to the inventory. This is
//! what makes retirement-by-cancellation safe: whether the session returns
//! normally, returns an error, or is simply aborted by the supervisor after
//! its grace period, the claimed pieces are released exactly once, by the
//! same code path, with no explicit cleanup call required at any exit point.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, FramedParts};

use crate::conf::SessionConf;
use crate::error::Error;
use crate::inventory::{DepositOutcome, PieceInventory};
use crate::piece_store::PieceStore;
use crate::progress::{self, ProgressEvent, ProgressSink};
use crate::verifier::{self, Verdict};
use crate::wire::handshake::{decode_handshake, encode_handshake, HandshakeCodec};
use crate::wire::message::MessageCodec;
use crate::wire::Message;
use crate::{BlockInfo, Bitfield, PeerId, PieceIndex, Sha1Hash, BLOCK_LEN};

/// Generates a BEP 20 peer id: the fixed `-BT0001-` client prefix followed
/// by 12 random ASCII digits.
pub fn generate_peer_id() -> PeerId {
    let mut id = *b"-BT0001-000000000000";
    let mut rng = rand::thread_rng();
    for byte in id[8..].iter_mut() {
        *byte = b'0' + rng.gen_range(0..10);
    }
    id
}

struct PipelineSlot {
    piece_index: PieceIndex,
    piece_len: u32,
    next_offset: u32,
    awaiting_offset: Option<u32>,
}

/// The set of pieces this session currently has claimed from the
/// inventory. Releases every remaining claim back to the unassigned pool
/// when dropped, regardless of why the session is going away.
struct Pipeline {
    inventory: Arc<PieceInventory>,
    slots: Vec<PipelineSlot>,
}

impl Pipeline {
    fn new(inventory: Arc<PieceInventory>) -> Self {
        Self { inventory, slots: Vec::new() }
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    fn slot_for(&mut self, piece_index: PieceIndex) -> Option<&mut PipelineSlot> {
        self.slots.iter_mut().find(|s| s.piece_index == piece_index)
    }

    fn remove(&mut self, piece_index: PieceIndex) {
        self.slots.retain(|s| s.piece_index != piece_index);
    }

    /// Claims as many new pieces as needed to bring the pipeline up to
    /// `target_len`, given what the peer has.
    fn refill(&mut self, peer_bitfield: &Bitfield, target_len: usize, piece_len_of: impl Fn(PieceIndex) -> u32) {
        let need = target_len.saturating_sub(self.len());
        if need == 0 {
            return;
        }
        for piece_index in self.inventory.claim_next(peer_bitfield, need) {
            self.slots.push(PipelineSlot {
                piece_index,
                piece_len: piece_len_of(piece_index),
                next_offset: 0,
                awaiting_offset: None,
            });
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        for slot in self.slots.drain(..) {
            self.inventory.release(slot.piece_index);
        }
    }
}

/// Runs a single peer session to completion: connects, shakes hands,
/// exchanges messages, and drives the pipeline until every piece is
/// complete or the session retires.
///
/// Returns `Ok(())` for `Done`, `Err(e)` for `Failed(e)`.
#[allow(clippy::too_many_arguments)]
pub async fn run(
    peer_addr: SocketAddr,
    info_hash: Sha1Hash,
    self_peer_id: PeerId,
    piece_count: usize,
    piece_hashes: Arc<Vec<Sha1Hash>>,
    conf: SessionConf,
    hash_mismatch_abort_threshold: u32,
    inventory: Arc<PieceInventory>,
    store: Arc<PieceStore>,
    progress: Option<ProgressSink>,
) -> Result<(), Error> {
    log::debug!("dialing {peer_addr}");
    let socket = tokio::time::timeout(conf.connect_timeout, TcpStream::connect(peer_addr))
        .await
        .map_err(|_| Error::ConnectTimeout)??;

    let storage = store.storage();
    let max_frame_len = storage.piece_len + conf.max_frame_overhead;
    let (mut framed, peer_id) =
        handshake(socket, &info_hash, &self_peer_id, conf.handshake_timeout, max_frame_len, piece_count).await?;
    log::info!("peer {peer_addr} handshake ok, peer_id={:?}", hex::encode(peer_id));

    framed.send(Message::Interested).await?;

    let mut peer_choking = true;
    let mut peer_bitfield = Bitfield::repeat(false, piece_count);
    let mut bitfield_received = false;
    let mut pipeline = Pipeline::new(Arc::clone(&inventory));

    let mut keepalive = tokio::time::interval(conf.keepalive_interval);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    keepalive.tick().await; // first tick fires immediately; consume it

    let outcome: Result<(), Error> = 'session: loop {
        if inventory.is_done(piece_count) {
            break Ok(());
        }

        tokio::select! {
            _ = keepalive.tick() => {
                if let Err(e) = framed.send(Message::KeepAlive).await {
                    break Err(e);
                }
            }
            next = tokio::time::timeout(conf.read_idle_timeout, framed.next()) => {
                let message = match next {
                    Err(_elapsed) => {
                        log::trace!("peer {peer_addr} idle for {:?}, looping back", conf.read_idle_timeout);
                        continue 'session;
                    }
                    Ok(None) => break Ok(()),
                    Ok(Some(Err(e))) => break Err(e),
                    Ok(Some(Ok(message))) => message,
                };

                if !bitfield_received {
                    match message {
                        Message::Bitfield(bits) => {
                            peer_bitfield = bits;
                            bitfield_received = true;
                            progress::notify(progress.as_ref(), ProgressEvent::SessionOpened { peer_id });
                            continue 'session;
                        }
                        Message::KeepAlive => continue 'session,
                        _ => break Err(Error::BitfieldNotFirst),
                    }
                }

                match message {
                    Message::KeepAlive => {}
                    Message::Choke => {
                        peer_choking = true;
                        // abandon every outstanding REQUEST's bookkeeping: a
                        // choking peer will not answer them, so the next
                        // UNCHOKE must re-request from the next unfilled
                        // offset rather than waiting forever on these.
                        for slot in pipeline.slots.iter_mut() {
                            slot.awaiting_offset = None;
                        }
                    }
                    Message::Unchoke => {
                        peer_choking = false;
                        pipeline.refill(&peer_bitfield, conf.max_pipelined_pieces, |i| {
                            storage.piece_len(i).unwrap_or(storage.piece_len)
                        });
                        if let Err(e) = issue_pending_requests(&mut framed, &mut pipeline).await {
                            break Err(e);
                        }
                    }
                    Message::Interested | Message::NotInterested => {
                        // leech-only core never serves pieces; nothing to do.
                    }
                    Message::Have { piece_index } => {
                        if piece_index < peer_bitfield.len() {
                            peer_bitfield.set(piece_index, true);
                        }
                    }
                    Message::Bitfield(bits) => {
                        // a peer is not required to send this only once; fold
                        // in any newly-announced pieces.
                        for i in 0..bits.len().min(peer_bitfield.len()) {
                            if bits[i] {
                                peer_bitfield.set(i, true);
                            }
                        }
                    }
                    Message::Request(_) | Message::Cancel(_) => {
                        // leech-only core serves nothing; ignored.
                    }
                    Message::Piece { piece_index, offset, data } => {
                        let expected_piece_len = match storage.piece_len(piece_index) {
                            Ok(len) => len,
                            Err(_) => {
                                break 'session Err(Error::Protocol(format!(
                                    "peer sent a piece message for out-of-range piece index {piece_index}"
                                )));
                            }
                        };
                        if offset as u64 + data.len() as u64 > expected_piece_len as u64 {
                            break 'session Err(Error::Protocol(format!(
                                "peer sent block offset {offset} len {} exceeding piece {piece_index}'s length {expected_piece_len}",
                                data.len()
                            )));
                        }

                        let outcome = inventory.deposit_block(piece_index, offset, data, expected_piece_len);
                        match outcome {
                            DepositOutcome::Stale | DepositOutcome::Duplicate | DepositOutcome::OutOfBounds => {
                                if let Some(slot) = pipeline.slot_for(piece_index) {
                                    if slot.awaiting_offset == Some(offset) {
                                        slot.awaiting_offset = None;
                                    }
                                }
                            }
                            DepositOutcome::Accepted => {
                                let mut just_completed = false;
                                if let Some(slot) = pipeline.slot_for(piece_index) {
                                    if slot.awaiting_offset == Some(offset) {
                                        slot.awaiting_offset = None;
                                    }
                                    let block_index = (offset / BLOCK_LEN) as usize;
                                    let len = crate::block_len(slot.piece_len, block_index);
                                    slot.next_offset = slot.next_offset.max(offset + len);
                                    just_completed = inventory.is_assembly_complete(piece_index, slot.piece_len);
                                }

                                if just_completed {
                                    if let Err(e) = complete_piece(
                                        piece_index,
                                        &piece_hashes,
                                        &inventory,
                                        &store,
                                        progress.as_ref(),
                                        hash_mismatch_abort_threshold,
                                    ) {
                                        break 'session Err(e);
                                    }
                                    pipeline.remove(piece_index);
                                    if !peer_choking {
                                        pipeline.refill(&peer_bitfield, conf.max_pipelined_pieces, |i| {
                                            storage.piece_len(i).unwrap_or(storage.piece_len)
                                        });
                                    }
                                }
                            }
                        }
                        if !peer_choking {
                            if let Err(e) = issue_pending_requests(&mut framed, &mut pipeline).await {
                                break 'session Err(e);
                            }
                        }
                    }
                }
            }
        }
    };

    match &outcome {
        Ok(()) => log::info!("session with {peer_addr} finished cleanly"),
        Err(e) => {
            log::warn!("session with {peer_addr} failed: {e}");
            progress::notify(progress.as_ref(), ProgressEvent::SessionFailed {
                peer_id: Some(peer_id),
                reason: e.to_string(),
            });
        }
    }
    outcome
}

/// Issues a REQUEST for every pipeline slot that doesn't already have one
/// outstanding and isn't yet complete.
async fn issue_pending_requests(
    framed: &mut Framed<TcpStream, MessageCodec>,
    pipeline: &mut Pipeline,
) -> Result<(), Error> {
    for slot in pipeline.slots.iter_mut() {
        if slot.awaiting_offset.is_some() {
            continue;
        }
        if slot.next_offset >= slot.piece_len {
            continue;
        }
        let block_index = (slot.next_offset / BLOCK_LEN) as usize;
        let len = crate::block_len(slot.piece_len, block_index);
        let request = BlockInfo { piece_index: slot.piece_index, offset: slot.next_offset, len };
        framed.send(Message::Request(request)).await?;
        slot.awaiting_offset = Some(slot.next_offset);
    }
    Ok(())
}

/// Verifies and persists a just-completed piece, updating the shared
/// cross-session hash-mismatch counter and aborting the whole run with
/// [`Error::CorruptionSuspected`] once the configured threshold is reached.
fn complete_piece(
    piece_index: PieceIndex,
    piece_hashes: &[Sha1Hash],
    inventory: &PieceInventory,
    store: &PieceStore,
    progress: Option<&ProgressSink>,
    hash_mismatch_abort_threshold: u32,
) -> Result<(), Error> {
    let bytes = inventory
        .assembled_bytes(piece_index)
        .expect("assembly must exist for a piece this session still has claimed");
    let expected_hash = &piece_hashes[piece_index];
    let expected_len = store.storage().piece_len(piece_index).unwrap_or(bytes.len() as u32) as usize;

    match verifier::verify(piece_index, &bytes, expected_len, expected_hash) {
        Verdict::Ok => {
            store.save(piece_index, &bytes)?;
            inventory.commit_complete(piece_index, bytes);
            progress::notify(progress, ProgressEvent::PieceCompleted { piece_index });
            Ok(())
        }
        Verdict::HashMismatch | Verdict::WrongLength { .. } => {
            inventory.release(piece_index);
            let count = inventory.record_hash_mismatch(piece_index);
            log::warn!("piece {piece_index} failed verification ({count} consecutive mismatches)");
            if count >= hash_mismatch_abort_threshold {
                Err(Error::CorruptionSuspected(piece_index, count))
            } else {
                Ok(())
            }
        }
    }
}

/// Exchanges the 68-byte handshake and upgrades the connection to the
/// message codec, carrying over any bytes the peer already sent ahead of
/// our read (it is legal, if unusual, for a peer to pipeline its BITFIELD
/// right after the handshake).
async fn handshake(
    socket: TcpStream,
    info_hash: &Sha1Hash,
    self_peer_id: &PeerId,
    handshake_timeout: Duration,
    max_frame_len: u32,
    piece_count: usize,
) -> Result<(Framed<TcpStream, MessageCodec>, PeerId), Error> {
    let mut framed = Framed::new(socket, HandshakeCodec);
    framed
        .send(encode_handshake(info_hash, self_peer_id))
        .await
        .map_err(Error::Network)?;

    let buf = tokio::time::timeout(handshake_timeout, framed.next())
        .await
        .map_err(|_| Error::HandshakeTimeout)?
        .ok_or_else(|| Error::Network(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "peer closed during handshake")))?
        .map_err(Error::Network)?;

    let peer_id = decode_handshake(&buf, info_hash)?;

    let old_parts = framed.into_parts();
    let mut new_parts = FramedParts::new(old_parts.io, MessageCodec::new(max_frame_len, piece_count));
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;
    Ok((Framed::from_parts(new_parts), peer_id))
}
