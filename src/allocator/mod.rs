//! Local id allocation over the chunks this pod owns.
//!
//! Two tables are kept: chunks that are `Owned` (usable for allocation) and
//! chunks that were reclaimed and are still `Scanning`. A chunk moves from the
//! second to the first only once its scan completes.
//!
//! ```text
//!   ChunkAcquirer ──insert_owned──▶ owned ◀──promote── scanning ◀──begin_scan── OwnershipClaimer
//!                                     │                    │
//!                          allocate / release        release only
//! ```
//!
//! Each chunk sits behind its own mutex; the table locks are only held long
//! enough to clone a chunk handle.

mod chunk;

pub use chunk::Chunk;

use crate::error::{Error, Result};
use crate::types::{ChunkId, ChunkState, PodId, ResourceId};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Shared handle to one chunk.
pub type ChunkHandle = Arc<Mutex<Chunk>>;

/// Local allocation state of one DRSM instance.
#[derive(Debug, Default)]
pub struct ChunkAllocator {
    owned: RwLock<BTreeMap<ChunkId, ChunkHandle>>,
    scanning: RwLock<BTreeMap<ChunkId, ChunkHandle>>,
}

/// Counters over the local tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub owned_chunks: usize,
    pub scanning_chunks: usize,
    pub free_ids: usize,
    pub allocated_ids: usize,
}

impl ChunkAllocator {
    /// Create an allocator with no chunks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id from any owned chunk with free capacity.
    ///
    /// `None` means every owned chunk is exhausted and a new chunk is needed.
    pub fn allocate(&self) -> Option<ResourceId> {
        let owned = self.owned.read();
        owned.values().find_map(|chunk| chunk.lock().allocate())
    }

    /// Return an id to its chunk.
    ///
    /// Releasing an id that is already free is a no-op. Ids of chunks that
    /// are neither owned nor being scanned here are rejected.
    pub fn release(&self, id: ResourceId) -> Result<()> {
        let chunk_id = id.chunk_id();
        let handle = self
            .owned
            .read()
            .get(&chunk_id)
            .cloned()
            .or_else(|| self.scanning.read().get(&chunk_id).cloned())
            .ok_or(Error::UnknownId(id.as_i32()))?;

        if !handle.lock().release(id.local_id()) {
            debug!(id = id.as_i32(), "Id already free, ignoring release");
        }
        Ok(())
    }

    /// Register a freshly created chunk.
    pub fn insert_owned(&self, chunk: Chunk) -> ChunkHandle {
        let id = chunk.id();
        let handle = Arc::new(Mutex::new(chunk));
        self.owned.write().insert(id, handle.clone());
        handle
    }

    /// Register a reclaimed chunk whose ids must be validated before use.
    ///
    /// A previous (cancelled) scan of the same chunk is replaced.
    pub fn begin_scan(&self, chunk_id: ChunkId, owner: PodId) -> ChunkHandle {
        let handle = Arc::new(Mutex::new(Chunk::new_scanning(chunk_id, owner)));
        self.scanning.write().insert(chunk_id, handle.clone());
        handle
    }

    /// Move a scanned chunk to the owned table.
    ///
    /// Returns `false` if the chunk is not being scanned or still has
    /// pending ids.
    pub fn promote(&self, chunk_id: ChunkId) -> bool {
        let mut scanning = self.scanning.write();
        let Some(handle) = scanning.get(&chunk_id).cloned() else {
            return false;
        };
        {
            let mut chunk = handle.lock();
            if !chunk.scan_complete() {
                return false;
            }
            chunk.finish_scan();
        }
        scanning.remove(&chunk_id);
        drop(scanning);

        self.owned.write().insert(chunk_id, handle);
        true
    }

    /// Drop a chunk from both tables. Returns the state it was in.
    pub fn evict(&self, chunk_id: ChunkId) -> Option<ChunkState> {
        if self.owned.write().remove(&chunk_id).is_some() {
            return Some(ChunkState::Owned);
        }
        self.scanning
            .write()
            .remove(&chunk_id)
            .map(|_| ChunkState::Scanning)
    }

    /// Local state of a chunk, if this pod holds it.
    pub fn state(&self, chunk_id: ChunkId) -> Option<ChunkState> {
        if self.owned.read().contains_key(&chunk_id) {
            Some(ChunkState::Owned)
        } else if self.scanning.read().contains_key(&chunk_id) {
            Some(ChunkState::Scanning)
        } else {
            None
        }
    }

    /// Whether this pod holds the chunk in either table.
    pub fn contains(&self, chunk_id: ChunkId) -> bool {
        self.state(chunk_id).is_some()
    }

    /// Handle of a chunk being scanned.
    pub fn scanning_chunk(&self, chunk_id: ChunkId) -> Option<ChunkHandle> {
        self.scanning.read().get(&chunk_id).cloned()
    }

    /// Handle of an owned chunk.
    pub fn owned_chunk(&self, chunk_id: ChunkId) -> Option<ChunkHandle> {
        self.owned.read().get(&chunk_id).cloned()
    }

    /// Ids of owned chunks, ascending.
    pub fn owned_chunk_ids(&self) -> Vec<ChunkId> {
        self.owned.read().keys().copied().collect()
    }

    /// Ids of chunks being scanned, ascending.
    pub fn scanning_chunk_ids(&self) -> Vec<ChunkId> {
        self.scanning.read().keys().copied().collect()
    }

    /// Counters over both tables.
    pub fn stats(&self) -> AllocatorStats {
        let owned = self.owned.read();
        let scanning = self.scanning.read();
        let mut stats = AllocatorStats {
            owned_chunks: owned.len(),
            scanning_chunks: scanning.len(),
            ..Default::default()
        };
        for chunk in owned.values() {
            let chunk = chunk.lock();
            stats.free_ids += chunk.free_count();
            stats.allocated_ids += chunk.allocated_count();
        }
        stats
    }
}
