//! Ownership claims on chunks of dead pods.
//!
//! Every surviving pod races for each orphaned chunk with a compare-and-update
//! that only matches while the chunk still names the dead pod. The store
//! picks exactly one winner; losers see a filter mismatch.

use crate::context::DrsmContext;
use crate::error::Error;
use crate::scan::ChunkScanner;
use crate::store::{ChunkFilter, ChunkUpdate, StoreResult};
use crate::types::ChunkId;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outcome of one claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Won,
    Lost,
    Failed,
    Skipped,
}

/// Races for chunks whose owner went down.
#[derive(Clone)]
pub struct OwnershipClaimer {
    ctx: Arc<DrsmContext>,
    scanner: ChunkScanner,
}

impl OwnershipClaimer {
    pub fn new(ctx: Arc<DrsmContext>, scanner: ChunkScanner) -> Self {
        Self { ctx, scanner }
    }

    /// Spawn one claim task per chunk of `dead_pod`.
    pub fn claim_all(
        &self,
        dead_pod: &str,
        chunks: impl IntoIterator<Item = ChunkId>,
    ) -> Vec<JoinHandle<ClaimOutcome>> {
        chunks
            .into_iter()
            .map(|chunk_id| {
                let claimer = self.clone();
                let dead_pod = dead_pod.to_string();
                tokio::spawn(async move { claimer.claim(chunk_id, &dead_pod).await })
            })
            .collect()
    }

    /// Try to take over `chunk_id` from `dead_pod`.
    ///
    /// Store errors are retried after `feed_retry_backoff`: the dead pod is
    /// already gone from the view, so no later event would bring the chunk
    /// back. Only shutdown ends a failing claim, with `Failed`.
    pub async fn claim(&self, chunk_id: ChunkId, dead_pod: &str) -> ClaimOutcome {
        let ctx = &self.ctx;
        if ctx.is_demux() {
            debug!(chunk_id, "Demux mode, not claiming");
            return ClaimOutcome::Skipped;
        }

        let backoff = ctx.config.feed_retry_backoff;
        loop {
            match self.try_claim(chunk_id, dead_pod).await {
                Ok(outcome) => return outcome,
                Err(e) => {
                    warn!(chunk_id, error = %e, ?backoff, "Claim failed, retrying");
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => return ClaimOutcome::Failed,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }

    async fn try_claim(&self, chunk_id: ChunkId, dead_pod: &str) -> StoreResult<ClaimOutcome> {
        let ctx = &self.ctx;
        let filter = ChunkFilter {
            chunk_id,
            owner_name: dead_pod.to_string(),
        };
        let update = ChunkUpdate {
            owner: ctx.pod_id.clone(),
        };

        if ctx
            .store
            .compare_and_update(&ctx.pool_name, &filter, &update)
            .await?
        {
            ctx.view.reassign_chunk(chunk_id, ctx.pod_id.clone());
            info!(chunk_id, from = dead_pod, "Claim won");
            self.scanner.start(chunk_id);
            Ok(ClaimOutcome::Won)
        } else {
            let err = Error::ClaimLost { chunk_id };
            debug!(chunk_id, error = %err, "Chunk taken by another pod");
            Ok(ClaimOutcome::Lost)
        }
    }
}
