//! Keepalive publishing.

use crate::context::DrsmContext;
use crate::store::{Document, KeepaliveRecord, EXPIRE_AT_FIELD};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Refreshes this pod's keepalive record until shutdown.
pub struct LivenessPublisher {
    ctx: Arc<DrsmContext>,
}

impl LivenessPublisher {
    pub fn new(ctx: Arc<DrsmContext>) -> Self {
        Self { ctx }
    }

    /// Start publishing. Returns `None` in demux mode, which never writes.
    pub fn spawn(self) -> Option<JoinHandle<()>> {
        if self.ctx.is_demux() {
            debug!("Demux mode, not publishing keepalives");
            return None;
        }
        Some(tokio::spawn(self.run()))
    }

    async fn run(self) {
        let ctx = self.ctx;
        match ctx
            .store
            .create_ttl_index(&ctx.pool_name, EXPIRE_AT_FIELD, Duration::ZERO)
            .await
        {
            Ok(created) => debug!(created, "TTL index on {}", EXPIRE_AT_FIELD),
            Err(e) => warn!(error = %e, "Failed to create TTL index"),
        }

        info!(
            pod = %ctx.pod_id,
            interval = ?ctx.config.keepalive_interval,
            ttl = ?ctx.config.keepalive_ttl,
            "Liveness publisher started"
        );

        let mut ticker = tokio::time::interval(ctx.config.keepalive_interval);
        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    debug!("Liveness publisher stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let record = KeepaliveRecord::new(ctx.pod_id.clone(), ctx.config.keepalive_ttl);
            if let Err(e) = ctx
                .store
                .upsert(&ctx.pool_name, Document::Keepalive(record))
                .await
            {
                warn!(error = %e, "Failed to publish keepalive");
            }
        }
    }
}
