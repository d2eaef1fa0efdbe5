//! Change-feed consumer keeping the global view current.
//!
//! ```text
//!   watch ──▶ (first open) resync ──▶ apply events in order ──▶ closed / error
//!     ▲                                                              │
//!     └──────────────────────── backoff ◀───────────────────────────┘
//! ```
//!
//! The feed is opened before the resync query runs, so anything committed in
//! between is still delivered; applying a document twice is harmless.

use crate::context::DrsmContext;
use crate::liveness::FailureDetector;
use crate::store::{ChangeEvent, ChangeStream, DocumentKind, StoreResult};
use crate::types::{ChunkId, PodId};
use crate::view::ViewChange;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Single consumer of the store's change feed.
pub struct FeedConsumer {
    ctx: Arc<DrsmContext>,
    detector: FailureDetector,
}

impl FeedConsumer {
    pub fn new(ctx: Arc<DrsmContext>, detector: FailureDetector) -> Self {
        Self { ctx, detector }
    }

    /// Consume the feed until shutdown, reopening it after failures.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let ctx = self.ctx.clone();
        let backoff = ctx.config.feed_retry_backoff;
        let mut synced = false;

        loop {
            match ctx.store.watch(&ctx.pool_name).await {
                Ok(stream) => {
                    if !synced {
                        match self.resync().await {
                            Ok(documents) => {
                                info!(
                                    documents,
                                    chunks = ctx.view.chunk_count(),
                                    pods = ctx.view.pod_count(),
                                    "Global view synchronized"
                                );
                                synced = true;
                                self.evict_reassigned_chunks();
                            }
                            Err(e) => {
                                warn!(error = %e, ?backoff, "Resync failed, reopening feed");
                            }
                        }
                    }
                    if synced {
                        debug!("Change feed opened");
                        if !self.consume(stream).await {
                            break;
                        }
                        warn!(?backoff, "Change feed closed, reopening");
                    }
                }
                Err(e) => {
                    warn!(error = %e, ?backoff, "Failed to open change feed");
                }
            }

            tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
        }
        debug!("Feed consumer stopped");
    }

    /// Load every chunk and keepalive record into the view.
    async fn resync(&self) -> StoreResult<usize> {
        let ctx = &self.ctx;
        let pods = ctx
            .store
            .find_many(&ctx.pool_name, DocumentKind::Keepalive)
            .await?;
        let chunks = ctx
            .store
            .find_many(&ctx.pool_name, DocumentKind::Chunk)
            .await?;

        for document in pods.iter().chain(chunks.iter()) {
            ctx.view.apply_document(document);
        }
        Ok(pods.len() + chunks.len())
    }

    /// Apply events until the stream ends. Returns `false` on shutdown.
    async fn consume(&self, mut stream: ChangeStream) -> bool {
        loop {
            tokio::select! {
                _ = self.ctx.cancel.cancelled() => return false,
                event = stream.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => return true,
                },
            }
        }
    }

    /// Apply one event and act on what it changed.
    pub async fn handle_event(&self, event: ChangeEvent) {
        let ctx = &self.ctx;
        match ctx.view.apply(&event) {
            ViewChange::None => {}
            ViewChange::PodDeleted { pod_name } => {
                self.detector.on_pod_deleted(&pod_name).await;
            }
            ViewChange::ChunkReassigned { chunk_id, from, to } => {
                if to.pod_name != ctx.pod_id.pod_name {
                    self.evict(chunk_id, from.as_ref(), &to);
                }
            }
        }
    }

    /// Drop held chunks the synchronized view records under another pod.
    ///
    /// Chunks can be created or claimed before the first resync; a takeover
    /// in that window never reaches us as an event.
    fn evict_reassigned_chunks(&self) {
        let ctx = &self.ctx;
        let held = ctx
            .allocator
            .owned_chunk_ids()
            .into_iter()
            .chain(ctx.allocator.scanning_chunk_ids());
        for chunk_id in held {
            if let Some(owner) = ctx.view.owner_of(chunk_id) {
                if owner.pod_name != ctx.pod_id.pod_name {
                    self.evict(chunk_id, Some(&ctx.pod_id), &owner);
                }
            }
        }
    }

    fn evict(&self, chunk_id: ChunkId, from: Option<&PodId>, to: &PodId) {
        if let Some(state) = self.ctx.allocator.evict(chunk_id) {
            self.ctx.scans.cancel(chunk_id);
            warn!(
                chunk_id,
                %state,
                from = ?from.map(|p| &p.pod_name),
                to = %to,
                "Chunk taken over by another pod, evicted locally"
            );
        }
    }
}
