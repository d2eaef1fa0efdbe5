//! State shared by every component of one DRSM instance.

use crate::allocator::ChunkAllocator;
use crate::config::{DrsmConfig, DrsmMode};
use crate::scan::ScanRegistry;
use crate::store::ResourceStore;
use crate::types::PodId;
use crate::view::GlobalView;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything the background tasks and the public API work on.
#[derive(Debug)]
pub struct DrsmContext {
    /// Name of the shared pool, used as the store collection.
    pub pool_name: String,
    pub pod_id: PodId,
    pub config: DrsmConfig,
    pub store: Arc<dyn ResourceStore>,
    pub view: GlobalView,
    pub allocator: ChunkAllocator,
    pub scans: ScanRegistry,
    /// Parent token of every background task.
    pub cancel: CancellationToken,
}

impl DrsmContext {
    pub fn new(
        pool_name: impl Into<String>,
        pod_id: PodId,
        store: Arc<dyn ResourceStore>,
        config: DrsmConfig,
    ) -> Self {
        Self {
            pool_name: pool_name.into(),
            view: GlobalView::new(pod_id.pod_name.clone()),
            pod_id,
            config,
            store,
            allocator: ChunkAllocator::new(),
            scans: ScanRegistry::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn is_demux(&self) -> bool {
        self.config.mode == DrsmMode::Demux
    }
}
