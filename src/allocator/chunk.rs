//! A single chunk's local id bookkeeping.

use crate::types::{ChunkId, ChunkState, LocalId, PodId, ResourceId, CHUNK_SIZE};
use std::collections::BTreeSet;

/// One 1024-id partition of the resource id space.
///
/// Free ids are a stack with a membership mask beside it, so both allocation
/// and duplicate-release detection are O(1). Ids still waiting for scan
/// validation are tracked the same way.
#[derive(Debug, Clone)]
pub struct Chunk {
    id: ChunkId,
    owner: PodId,
    state: ChunkState,
    free_ids: Vec<LocalId>,
    is_free: Vec<bool>,
    alloc_ids: BTreeSet<LocalId>,
    scan_ids: Vec<LocalId>,
    is_pending: Vec<bool>,
    pending: usize,
}

impl Chunk {
    fn empty(id: ChunkId, owner: PodId, state: ChunkState) -> Self {
        Self {
            id,
            owner,
            state,
            free_ids: Vec::with_capacity(CHUNK_SIZE),
            is_free: vec![false; CHUNK_SIZE],
            alloc_ids: BTreeSet::new(),
            scan_ids: Vec::new(),
            is_pending: vec![false; CHUNK_SIZE],
            pending: 0,
        }
    }

    /// A freshly created chunk: owned, every id free.
    pub fn new_owned(id: ChunkId, owner: PodId) -> Self {
        let mut chunk = Self::empty(id, owner, ChunkState::Owned);
        // Pushed in reverse so allocation hands out local id 0 first.
        for local in (0..CHUNK_SIZE as LocalId).rev() {
            chunk.push_free(local);
        }
        chunk
    }

    /// A reclaimed chunk: every id must be validated before use.
    pub fn new_scanning(id: ChunkId, owner: PodId) -> Self {
        let mut chunk = Self::empty(id, owner, ChunkState::Scanning);
        chunk.scan_ids = (0..CHUNK_SIZE as LocalId).rev().collect();
        chunk.is_pending = vec![true; CHUNK_SIZE];
        chunk.pending = CHUNK_SIZE;
        chunk
    }

    pub fn id(&self) -> ChunkId {
        self.id
    }

    pub fn owner(&self) -> &PodId {
        &self.owner
    }

    pub fn state(&self) -> ChunkState {
        self.state
    }

    /// Number of ids ready for allocation.
    pub fn free_count(&self) -> usize {
        self.free_ids.len()
    }

    /// Number of ids handed out or confirmed in use by the scan.
    pub fn allocated_count(&self) -> usize {
        CHUNK_SIZE - self.free_ids.len() - self.pending
    }

    /// Ids the scan found still in use.
    pub fn alloc_ids(&self) -> &BTreeSet<LocalId> {
        &self.alloc_ids
    }

    /// Ids not yet validated.
    pub fn pending_scan_count(&self) -> usize {
        self.pending
    }

    /// Pop a free id. Only owned chunks hand out ids.
    pub fn allocate(&mut self) -> Option<ResourceId> {
        if self.state != ChunkState::Owned {
            return None;
        }
        let local = self.free_ids.pop()?;
        self.is_free[local as usize] = false;
        Some(ResourceId::new(self.id, local))
    }

    /// Return an id to the free stack.
    ///
    /// Returns `false` if it was already free. A pending scan for the id is
    /// dropped: a released id is known to be free.
    pub fn release(&mut self, local: LocalId) -> bool {
        if self.is_free[local as usize] {
            return false;
        }
        if self.is_pending[local as usize] {
            self.is_pending[local as usize] = false;
            self.pending -= 1;
        }
        self.alloc_ids.remove(&local);
        self.push_free(local);
        true
    }

    /// Take the next id that still needs validation.
    ///
    /// The id is no longer pending once returned; report the verdict with
    /// [`record_scan`](Self::record_scan).
    pub fn next_scan_candidate(&mut self) -> Option<LocalId> {
        while let Some(local) = self.scan_ids.pop() {
            if self.is_pending[local as usize] {
                self.is_pending[local as usize] = false;
                self.pending -= 1;
                return Some(local);
            }
        }
        None
    }

    /// Record the validator's verdict for a scanned id.
    ///
    /// If the id was released while the validator ran, the release stands.
    pub fn record_scan(&mut self, local: LocalId, in_use: bool) {
        if self.is_free[local as usize] {
            return;
        }
        if in_use {
            self.alloc_ids.insert(local);
        } else {
            self.push_free(local);
        }
    }

    /// Whether every id has been validated or released.
    pub fn scan_complete(&self) -> bool {
        self.pending == 0
    }

    /// Treat every pending id as free without validation.
    pub fn trust_pending(&mut self) {
        while let Some(local) = self.next_scan_candidate() {
            self.record_scan(local, false);
        }
    }

    /// Make the chunk usable for allocation.
    pub fn finish_scan(&mut self) {
        self.scan_ids.clear();
        self.state = ChunkState::Owned;
    }

    fn push_free(&mut self, local: LocalId) {
        self.is_free[local as usize] = true;
        self.free_ids.push(local);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod() -> PodId {
        PodId::new("amf-0", "10.0.0.1")
    }

    #[test]
    fn test_new_owned_chunk() {
        let mut chunk = Chunk::new_owned(7, pod());
        assert_eq!(chunk.state(), ChunkState::Owned);
        assert_eq!(chunk.free_count(), CHUNK_SIZE);

        let id = chunk.allocate().unwrap();
        assert_eq!(id.as_i32(), 7168);
        assert_eq!(chunk.allocated_count(), 1);
    }

    #[test]
    fn test_exhaust_chunk() {
        let mut chunk = Chunk::new_owned(1, pod());
        let mut seen = BTreeSet::new();
        while let Some(id) = chunk.allocate() {
            assert_eq!(id.chunk_id(), 1);
            assert!(seen.insert(id.local_id()));
        }
        assert_eq!(seen.len(), CHUNK_SIZE);
        assert_eq!(chunk.free_count(), 0);
    }

    #[test]
    fn test_duplicate_release_is_noop() {
        let mut chunk = Chunk::new_owned(1, pod());
        let id = chunk.allocate().unwrap();

        assert!(chunk.release(id.local_id()));
        assert!(!chunk.release(id.local_id()));
        assert_eq!(chunk.free_count(), CHUNK_SIZE);
        // Never allocated either.
        assert!(!chunk.release(500));
    }

    #[test]
    fn test_scanning_chunk_does_not_allocate() {
        let mut chunk = Chunk::new_scanning(3, pod());
        assert_eq!(chunk.state(), ChunkState::Scanning);
        assert_eq!(chunk.pending_scan_count(), CHUNK_SIZE);
        assert!(chunk.allocate().is_none());
    }

    #[test]
    fn test_scan_records_verdicts() {
        let mut chunk = Chunk::new_scanning(3, pod());
        let first = chunk.next_scan_candidate().unwrap();
        assert_eq!(first, 0);
        chunk.record_scan(first, true);

        let second = chunk.next_scan_candidate().unwrap();
        chunk.record_scan(second, false);

        assert!(chunk.alloc_ids().contains(&first));
        assert_eq!(chunk.free_count(), 1);
        assert_eq!(chunk.pending_scan_count(), CHUNK_SIZE - 2);
    }

    #[test]
    fn test_release_during_scan_skips_validation() {
        let mut chunk = Chunk::new_scanning(3, pod());
        assert!(chunk.release(10));
        assert_eq!(chunk.pending_scan_count(), CHUNK_SIZE - 1);

        let mut scanned = 0;
        while let Some(local) = chunk.next_scan_candidate() {
            assert_ne!(local, 10);
            chunk.record_scan(local, false);
            scanned += 1;
        }
        assert_eq!(scanned, CHUNK_SIZE - 1);
        assert!(chunk.scan_complete());
        assert_eq!(chunk.free_count(), CHUNK_SIZE);
    }

    #[test]
    fn test_release_while_validating_wins() {
        let mut chunk = Chunk::new_scanning(3, pod());
        let local = chunk.next_scan_candidate().unwrap();
        assert!(chunk.release(local));
        chunk.record_scan(local, true);

        assert!(!chunk.alloc_ids().contains(&local));
        assert_eq!(chunk.free_count(), 1);
    }

    #[test]
    fn test_release_of_in_use_id_after_scan() {
        let mut chunk = Chunk::new_scanning(3, pod());
        while let Some(local) = chunk.next_scan_candidate() {
            chunk.record_scan(local, local == 0);
        }
        chunk.finish_scan();
        assert_eq!(chunk.state(), ChunkState::Owned);
        assert_eq!(chunk.free_count(), CHUNK_SIZE - 1);

        assert!(chunk.release(0));
        assert!(chunk.alloc_ids().is_empty());
        assert_eq!(chunk.free_count(), CHUNK_SIZE);
    }

    #[test]
    fn test_trust_pending() {
        let mut chunk = Chunk::new_scanning(3, pod());
        chunk.trust_pending();
        assert!(chunk.scan_complete());
        assert_eq!(chunk.free_count(), CHUNK_SIZE);
    }
}
