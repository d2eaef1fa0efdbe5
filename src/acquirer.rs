//! Creation of new chunks.
//!
//! A pod whose owned chunks are exhausted probes random chunk numbers and
//! claims the first one it can insert into the shared store. The store's
//! insert-if-absent is the only arbiter between pods racing for the same
//! number; the local view only saves round-trips.

use crate::allocator::{Chunk, ChunkHandle};
use crate::context::DrsmContext;
use crate::error::{Error, Result};
use crate::store::{ChunkRecord, Document};
use crate::types::ChunkId;
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Creates chunks on behalf of the allocation API.
#[derive(Debug)]
pub struct ChunkAcquirer {
    ctx: Arc<DrsmContext>,
    /// Serializes creation so concurrent exhaustion claims one chunk.
    creating: tokio::sync::Mutex<()>,
}

impl ChunkAcquirer {
    pub fn new(ctx: Arc<DrsmContext>) -> Self {
        Self {
            ctx,
            creating: tokio::sync::Mutex::new(()),
        }
    }

    /// Take the creation lock. Callers should retry local allocation after
    /// acquiring it, since another caller may have just created a chunk.
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.creating.lock().await
    }

    /// Create a new chunk owned by this pod and register it locally.
    ///
    /// Fails with [`Error::NoIdsAvailable`] once the attempt limit is reached
    /// or every chunk number is already known.
    pub async fn create_chunk(&self) -> Result<ChunkHandle> {
        let ctx = &self.ctx;
        if ctx.is_demux() {
            return Err(Error::DemuxModeForbidden);
        }

        let range = ctx.config.chunk_range();
        let limit = ctx.config.chunk_attempt_limit();

        for attempt in 1..=limit {
            if ctx.view.chunk_count() >= range as usize {
                warn!(range, "Every chunk is taken, no ids available");
                return Err(Error::NoIdsAvailable);
            }

            let candidate: ChunkId = rand::rng().random_range(0..range);
            if ctx.view.contains_chunk(candidate) || ctx.allocator.contains(candidate) {
                continue;
            }

            let record = ChunkRecord {
                chunk_id: candidate,
                owner: ctx.pod_id.clone(),
            };
            let inserted = ctx
                .store
                .insert_if_absent(&ctx.pool_name, Document::Chunk(record))
                .await?;
            if !inserted {
                debug!(chunk_id = candidate, attempt, "Chunk already taken, retrying");
                continue;
            }

            let handle = ctx
                .allocator
                .insert_owned(Chunk::new_owned(candidate, ctx.pod_id.clone()));
            ctx.view.register_chunk(candidate, ctx.pod_id.clone());
            info!(chunk_id = candidate, attempt, "Chunk created");
            return Ok(handle);
        }

        warn!(limit, "Chunk creation attempts exhausted");
        Err(Error::NoIdsAvailable)
    }
}
