//! Pod-down detection.

use crate::claim::OwnershipClaimer;
use crate::context::DrsmContext;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Receiving end of the pod-down queue.
pub type PodDownReceiver = mpsc::Receiver<String>;

/// Turns keepalive deletions into claim work.
#[derive(Debug, Clone)]
pub struct FailureDetector {
    ctx: Arc<DrsmContext>,
    pod_down_tx: mpsc::Sender<String>,
}

impl FailureDetector {
    /// Create a detector and the queue its consumer drains.
    pub fn new(ctx: Arc<DrsmContext>) -> (Self, PodDownReceiver) {
        let (pod_down_tx, pod_down_rx) = mpsc::channel(ctx.config.pod_down_queue_capacity);
        (Self { ctx, pod_down_tx }, pod_down_rx)
    }

    /// Handle a deleted keepalive record.
    ///
    /// Returns `true` if the pod was queued. Waits while the queue is full.
    pub async fn on_pod_deleted(&self, pod_name: &str) -> bool {
        if pod_name == self.ctx.pod_id.pod_name {
            warn!(pod = pod_name, "Own keepalive record expired");
            return false;
        }
        if !self.ctx.view.contains_pod(pod_name) {
            debug!(pod = pod_name, "Delete for unknown pod, ignoring");
            return false;
        }

        info!(pod = pod_name, "Pod down detected");
        self.pod_down_tx.send(pod_name.to_string()).await.is_ok()
    }

    /// Drain the queue until shutdown: forget each dead pod and race for its
    /// chunks.
    pub fn spawn_consumer(
        ctx: Arc<DrsmContext>,
        mut pod_down_rx: PodDownReceiver,
        claimer: OwnershipClaimer,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let pod_name = tokio::select! {
                    _ = ctx.cancel.cancelled() => break,
                    next = pod_down_rx.recv() => match next {
                        Some(pod_name) => pod_name,
                        None => break,
                    },
                };

                let Some(record) = ctx.view.remove_pod(&pod_name) else {
                    debug!(pod = %pod_name, "Pod already removed");
                    continue;
                };
                if record.owned_chunks.is_empty() {
                    debug!(pod = %pod_name, "Dead pod owned no chunks");
                    continue;
                }

                info!(
                    pod = %pod_name,
                    chunks = record.owned_chunks.len(),
                    "Claiming chunks of dead pod"
                );
                claimer.claim_all(&pod_name, record.owned_chunks);
            }
            debug!("Failure detector stopped");
        })
    }
}
