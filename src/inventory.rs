//! The piece inventory: the single piece of shared mutable state all peer
//! sessions coordinate through.
//!
//! Sessions never observe each other directly; every cross-session effect
//! (which piece is whose, which blocks have landed, which pieces are done)
//! flows through [`PieceInventory`]'s atomic operations. It is guarded by a
//! plain [`std::sync::Mutex`] rather than `tokio::sync::Mutex` on purpose:
//! a `std` `MutexGuard` is not `Send`, so the compiler itself rejects any
//! attempt to hold the lock across an `.await` point. The invariant "no
//! session holds the inventory lock across an I/O suspension" is therefore
//! enforced by the type system, not by code review.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use crate::{Bitfield, PieceIndex};

/// The outcome of depositing a received block into a piece's assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepositOutcome {
    /// The block was new and has been recorded.
    Accepted,
    /// This offset was already recorded for this piece; the new bytes were
    /// discarded.
    Duplicate,
    /// The piece is not (or no longer) in flight, most likely because
    /// another session already completed it. The block is dropped.
    Stale,
    /// `offset + bytes.len()` exceeds the piece's length. The block is
    /// dropped rather than stored, per the invariant that a stored block
    /// never extends past its piece's end.
    OutOfBounds,
}

/// The in-progress state of one piece being assembled from blocks: a
/// sparse map of `offset -> bytes` plus the set of offsets a session has
/// requested but not yet received.
#[derive(Debug, Default)]
pub struct PerPieceAssembly {
    blocks: BTreeMap<u32, Vec<u8>>,
    requested: HashSet<u32>,
}

impl PerPieceAssembly {
    /// Records `bytes` at `offset`, rejecting it outright if
    /// `offset + bytes.len()` would exceed `piece_len` rather than storing a
    /// block that overruns the piece.
    fn deposit(&mut self, offset: u32, bytes: Vec<u8>, piece_len: u32) -> DepositOutcome {
        if offset as u64 + bytes.len() as u64 > piece_len as u64 {
            return DepositOutcome::OutOfBounds;
        }
        if self.blocks.contains_key(&offset) {
            return DepositOutcome::Duplicate;
        }
        self.requested.remove(&offset);
        self.blocks.insert(offset, bytes);
        DepositOutcome::Accepted
    }

    /// True iff the recorded blocks form a contiguous, zero-gap cover of at
    /// least `piece_len` bytes starting at offset 0. Blocks are stored
    /// keyed by offset, so a gap shows up as a jump past the running
    /// expected offset.
    fn is_complete(&self, piece_len: u32) -> bool {
        let mut expected_offset = 0u32;
        for (&offset, bytes) in &self.blocks {
            if offset != expected_offset {
                return false;
            }
            expected_offset += bytes.len() as u32;
        }
        expected_offset >= piece_len
    }

    fn assembled_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.blocks.values().map(Vec::len).sum());
        for bytes in self.blocks.values() {
            out.extend_from_slice(bytes);
        }
        out
    }
}

struct InventoryState {
    piece_count: usize,
    completed: Bitfield,
    in_flight: HashSet<PieceIndex>,
    assemblies: BTreeMap<PieceIndex, PerPieceAssembly>,
    /// Consecutive hash-check failures recorded against a piece, across
    /// every session that has ever held it. Reset the moment the piece
    /// commits successfully.
    hash_mismatches: HashMap<PieceIndex, u32>,
}

/// The shared set of completed/in-flight/assembling pieces, coordinating
/// every peer session in a run.
///
/// `completed ∩ in_flight = ∅` always, and a piece index is in `in_flight`
/// iff it has an entry in `assemblies`: both invariants are maintained by
/// every mutating method below, never by a caller.
pub struct PieceInventory {
    state: Mutex<InventoryState>,
}

impl PieceInventory {
    /// Creates the inventory, seeding `completed` from pieces already
    /// verified on disk from a prior run.
    pub fn new(piece_count: usize, completed_on_disk: Bitfield) -> Self {
        debug_assert_eq!(completed_on_disk.len(), piece_count);
        Self {
            state: Mutex::new(InventoryState {
                piece_count,
                completed: completed_on_disk,
                in_flight: HashSet::new(),
                assemblies: BTreeMap::new(),
                hash_mismatches: HashMap::new(),
            }),
        }
    }

    /// Claims up to `max_claims` pieces the peer (per `peer_bitfield`) has,
    /// that are neither completed nor already in flight, in ascending
    /// index order. Each claimed index gets a fresh, empty assembly.
    pub fn claim_next(&self, peer_bitfield: &Bitfield, max_claims: usize) -> Vec<PieceIndex> {
        let mut state = self.state.lock().unwrap();
        let mut claimed = Vec::with_capacity(max_claims);
        for index in 0..state.piece_count {
            if claimed.len() >= max_claims {
                break;
            }
            if !peer_bitfield.get(index).map(|bit| *bit).unwrap_or(false) {
                continue;
            }
            if state.completed[index] || state.in_flight.contains(&index) {
                continue;
            }
            state.in_flight.insert(index);
            state.assemblies.insert(index, PerPieceAssembly::default());
            claimed.push(index);
        }
        claimed
    }

    /// Records a received block, rejecting it as [`DepositOutcome::OutOfBounds`]
    /// if `offset + bytes.len()` would exceed `piece_len`. See
    /// [`DepositOutcome`] for every possible result.
    pub fn deposit_block(&self, piece_index: PieceIndex, offset: u32, bytes: Vec<u8>, piece_len: u32) -> DepositOutcome {
        let mut state = self.state.lock().unwrap();
        if !state.in_flight.contains(&piece_index) {
            return DepositOutcome::Stale;
        }
        let assembly = state
            .assemblies
            .get_mut(&piece_index)
            .expect("in_flight implies a live assembly entry");
        assembly.deposit(offset, bytes, piece_len)
    }

    /// True iff the piece's assembly forms a complete, contiguous cover of
    /// `piece_len` bytes.
    pub fn is_assembly_complete(&self, piece_index: PieceIndex, piece_len: u32) -> bool {
        let state = self.state.lock().unwrap();
        state.assemblies.get(&piece_index).map(|a| a.is_complete(piece_len)).unwrap_or(false)
    }

    /// Returns the piece's assembled bytes in offset order, or `None` if
    /// the piece isn't currently in flight.
    pub fn assembled_bytes(&self, piece_index: PieceIndex) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        state.assemblies.get(&piece_index).map(|a| a.assembled_bytes())
    }

    /// Marks an offset within a piece as having an outstanding request, so
    /// a session can avoid asking twice for the same block across its own
    /// pipeline.
    pub fn mark_requested(&self, piece_index: PieceIndex, offset: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some(assembly) = state.assemblies.get_mut(&piece_index) {
            assembly.requested.insert(offset);
        }
    }

    /// Clears an offset's requested flag (a CHOKE abandoned it, or it was
    /// fulfilled).
    pub fn unmark_requested(&self, piece_index: PieceIndex, offset: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some(assembly) = state.assemblies.get_mut(&piece_index) {
            assembly.requested.remove(&offset);
        }
    }

    /// Whether `offset` within `piece_index` currently has an outstanding
    /// request recorded against it.
    pub fn is_requested(&self, piece_index: PieceIndex, offset: u32) -> bool {
        let state = self.state.lock().unwrap();
        state.assemblies.get(&piece_index).map(|a| a.requested.contains(&offset)).unwrap_or(false)
    }

    /// Moves a piece from in-flight to completed, dropping its assembly.
    /// `piece_bytes` is accepted (mirroring the contract) but not retained:
    /// callers have already handed the same bytes to the piece store.
    pub fn commit_complete(&self, piece_index: PieceIndex, piece_bytes: Vec<u8>) {
        drop(piece_bytes);
        let mut state = self.state.lock().unwrap();
        state.in_flight.remove(&piece_index);
        state.assemblies.remove(&piece_index);
        state.completed.set(piece_index, true);
        state.hash_mismatches.remove(&piece_index);
    }

    /// Returns a piece to the unassigned pool: used when the session
    /// holding it retires, or when its hash check failed.
    pub fn release(&self, piece_index: PieceIndex) {
        let mut state = self.state.lock().unwrap();
        state.in_flight.remove(&piece_index);
        state.assemblies.remove(&piece_index);
    }

    /// Records a failed hash check against `piece_index` and returns the
    /// running count of *consecutive* failures seen for it across every
    /// session that has attempted it. A successful commit resets the count
    /// to zero via [`Self::commit_complete`]; this is how the core notices
    /// a piece that keeps failing no matter who serves it, rather than one
    /// session having a bad day.
    pub fn record_hash_mismatch(&self, piece_index: PieceIndex) -> u32 {
        let mut state = self.state.lock().unwrap();
        let count = state.hash_mismatches.entry(piece_index).or_insert(0);
        *count += 1;
        *count
    }

    /// Clears a piece's recorded mismatch streak without marking it
    /// complete, e.g. if a driver decides to retry it under close watch.
    pub fn clear_hash_mismatch(&self, piece_index: PieceIndex) {
        self.state.lock().unwrap().hash_mismatches.remove(&piece_index);
    }

    /// The number of pieces verified and persisted so far.
    pub fn completed_count(&self) -> usize {
        self.state.lock().unwrap().completed.count_ones()
    }

    /// True once every piece in the torrent is completed.
    pub fn is_done(&self, piece_count: usize) -> bool {
        self.completed_count() >= piece_count
    }

    /// A snapshot of which pieces are completed, e.g. for a session to
    /// decide whether it has anything left to offer a peer.
    pub fn completed_snapshot(&self) -> Bitfield {
        self.state.lock().unwrap().completed.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitfield_of(piece_count: usize, set: &[usize]) -> Bitfield {
        let mut bits = Bitfield::repeat(false, piece_count);
        for &i in set {
            bits.set(i, true);
        }
        bits
    }

    #[test]
    fn claim_next_returns_ascending_unclaimed_indices_the_peer_has() {
        let inventory = PieceInventory::new(4, Bitfield::repeat(false, 4));
        let peer_has = bitfield_of(4, &[0, 2, 3]);
        let claimed = inventory.claim_next(&peer_has, 10);
        assert_eq!(claimed, vec![0, 2, 3]);
    }

    #[test]
    fn claim_next_skips_completed_and_in_flight_pieces() {
        let inventory = PieceInventory::new(3, bitfield_of(3, &[0]));
        let peer_has = bitfield_of(3, &[0, 1, 2]);
        let first = inventory.claim_next(&peer_has, 10);
        assert_eq!(first, vec![1, 2]);
        let second = inventory.claim_next(&peer_has, 10);
        assert!(second.is_empty());
    }

    #[test]
    fn claim_next_respects_the_caller_budget() {
        let inventory = PieceInventory::new(5, Bitfield::repeat(false, 5));
        let peer_has = bitfield_of(5, &[0, 1, 2, 3, 4]);
        let claimed = inventory.claim_next(&peer_has, 2);
        assert_eq!(claimed, vec![0, 1]);
    }

    #[test]
    fn deposit_is_stale_when_piece_not_in_flight() {
        let inventory = PieceInventory::new(2, Bitfield::repeat(false, 2));
        let outcome = inventory.deposit_block(0, 0, vec![1, 2, 3], 10);
        assert_eq!(outcome, DepositOutcome::Stale);
    }

    #[test]
    fn deposit_flags_duplicate_offsets() {
        let inventory = PieceInventory::new(1, Bitfield::repeat(false, 1));
        let peer_has = bitfield_of(1, &[0]);
        inventory.claim_next(&peer_has, 10);
        assert_eq!(inventory.deposit_block(0, 0, vec![1, 2, 3], 10), DepositOutcome::Accepted);
        assert_eq!(inventory.deposit_block(0, 0, vec![9, 9, 9], 10), DepositOutcome::Duplicate);
    }

    #[test]
    fn deposit_rejects_a_block_extending_past_the_piece_length() {
        let inventory = PieceInventory::new(1, Bitfield::repeat(false, 1));
        let peer_has = bitfield_of(1, &[0]);
        inventory.claim_next(&peer_has, 10);
        // offset 8 + len 4 = 12, past a 10-byte piece.
        let outcome = inventory.deposit_block(0, 8, vec![0u8; 4], 10);
        assert_eq!(outcome, DepositOutcome::OutOfBounds);
        // the out-of-bounds bytes must not have been stored.
        assert_eq!(inventory.assembled_bytes(0), Some(Vec::new()));
    }

    #[test]
    fn assembly_completes_once_blocks_cover_the_piece_contiguously() {
        let inventory = PieceInventory::new(1, Bitfield::repeat(false, 1));
        let peer_has = bitfield_of(1, &[0]);
        inventory.claim_next(&peer_has, 10);
        inventory.deposit_block(0, 0, vec![0u8; 4], 10);
        assert!(!inventory.is_assembly_complete(0, 10));
        inventory.deposit_block(0, 4, vec![0u8; 4], 10);
        assert!(!inventory.is_assembly_complete(0, 10));
        // last, shorter tail block (tolerance for the final piece)
        inventory.deposit_block(0, 8, vec![0u8; 2], 10);
        assert!(inventory.is_assembly_complete(0, 10));
    }

    #[test]
    fn assembly_with_a_gap_is_never_complete() {
        let inventory = PieceInventory::new(1, Bitfield::repeat(false, 1));
        let peer_has = bitfield_of(1, &[0]);
        inventory.claim_next(&peer_has, 10);
        inventory.deposit_block(0, 0, vec![0u8; 4], 10);
        inventory.deposit_block(0, 8, vec![0u8; 2], 10);
        assert!(!inventory.is_assembly_complete(0, 10));
    }

    #[test]
    fn commit_complete_moves_piece_out_of_in_flight() {
        let inventory = PieceInventory::new(1, Bitfield::repeat(false, 1));
        let peer_has = bitfield_of(1, &[0]);
        inventory.claim_next(&peer_has, 10);
        inventory.deposit_block(0, 0, vec![0u8; 4], 4);
        let bytes = inventory.assembled_bytes(0).unwrap();
        inventory.commit_complete(0, bytes);
        assert_eq!(inventory.completed_count(), 1);
        assert!(inventory.is_done(1));
        // claiming again must not re-offer a completed piece
        assert!(inventory.claim_next(&peer_has, 10).is_empty());
    }

    #[test]
    fn release_returns_a_piece_to_the_unassigned_pool() {
        let inventory = PieceInventory::new(1, Bitfield::repeat(false, 1));
        let peer_has = bitfield_of(1, &[0]);
        inventory.claim_next(&peer_has, 10);
        inventory.deposit_block(0, 0, vec![0u8; 4], 4);
        inventory.release(0);
        assert_eq!(inventory.claim_next(&peer_has, 10), vec![0]);
        // the assembly was dropped along with the release
        assert!(!inventory.is_assembly_complete(0, 4));
    }

    #[test]
    fn two_peers_with_disjoint_bitfields_never_claim_the_same_piece() {
        let inventory = PieceInventory::new(4, Bitfield::repeat(false, 4));
        let peer_a = bitfield_of(4, &[0, 2]);
        let peer_b = bitfield_of(4, &[1, 3]);
        let claimed_a = inventory.claim_next(&peer_a, 10);
        let claimed_b = inventory.claim_next(&peer_b, 10);
        assert_eq!(claimed_a, vec![0, 2]);
        assert_eq!(claimed_b, vec![1, 3]);
    }

    #[test]
    fn hash_mismatch_count_accumulates_and_resets_on_success() {
        let inventory = PieceInventory::new(1, Bitfield::repeat(false, 1));
        assert_eq!(inventory.record_hash_mismatch(0), 1);
        assert_eq!(inventory.record_hash_mismatch(0), 2);
        assert_eq!(inventory.record_hash_mismatch(0), 3);

        let peer_has = bitfield_of(1, &[0]);
        inventory.claim_next(&peer_has, 10);
        inventory.deposit_block(0, 0, vec![0u8; 4], 4);
        let bytes = inventory.assembled_bytes(0).unwrap();
        inventory.commit_complete(0, bytes);

        // a fresh streak starts from zero after the piece lands.
        assert_eq!(inventory.record_hash_mismatch(0), 1);
    }

    #[test]
    fn claim_next_is_consistent_under_concurrent_callers() {
        use std::sync::Arc;
        use std::thread;

        let inventory = Arc::new(PieceInventory::new(100, Bitfield::repeat(false, 100)));
        let peer_has = Arc::new(Bitfield::repeat(true, 100));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let inventory = Arc::clone(&inventory);
                let peer_has = Arc::clone(&peer_has);
                thread::spawn(move || inventory.claim_next(&peer_has, 20))
            })
            .collect();

        let mut all_claimed: Vec<usize> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all_claimed.sort_unstable();
        let unique_count = all_claimed.len();
        all_claimed.dedup();
        assert_eq!(all_claimed.len(), unique_count, "no piece index claimed twice");
    }
}
