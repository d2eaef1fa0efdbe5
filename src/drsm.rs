//! The public DRSM instance.

use crate::acquirer::ChunkAcquirer;
use crate::claim::OwnershipClaimer;
use crate::config::{DrsmConfig, DrsmMode};
use crate::context::DrsmContext;
use crate::error::{Error, Result};
use crate::feed::FeedConsumer;
use crate::ipam::{InMemoryIpam, Ipam};
use crate::liveness::{FailureDetector, LivenessPublisher};
use crate::scan::{ChunkScanner, ScanPolicy};
use crate::store::ResourceStore;
use crate::types::{ChunkId, ChunkState, DrsmStats, PodId, ResourceId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One participant in a shared resource pool.
///
/// Allocation and release are served from local state. Chunk creation is
/// the only path that talks to the store synchronously, and only when every
/// owned chunk is exhausted.
pub struct Drsm {
    ctx: Arc<DrsmContext>,

    acquirer: ChunkAcquirer,

    /// IPAM collaborator for `acquire_ip` / `release_ip`.
    ipam: Arc<dyn Ipam>,

    /// Pool name -> canonical CIDR registered with the IPAM.
    ip_prefixes: HashMap<String, String>,

    /// Background tasks, joined on shutdown.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drsm {
    /// Join the pool `pool_name` as `pod_id`.
    ///
    /// IP pools in the configuration are served by an [`InMemoryIpam`].
    pub async fn init(
        pool_name: impl Into<String>,
        pod_id: PodId,
        store: Arc<dyn ResourceStore>,
        config: DrsmConfig,
    ) -> Result<Self> {
        Self::init_with_ipam(pool_name, pod_id, store, config, Arc::new(InMemoryIpam::new())).await
    }

    /// Join the pool with an explicit IPAM collaborator.
    ///
    /// This will:
    /// 1. Validate the configuration
    /// 2. Register the configured IP pools (client mode only)
    /// 3. Start the change-feed consumer, which resyncs the global view
    /// 4. Start the failure detector
    /// 5. Start publishing keepalives (client mode only)
    pub async fn init_with_ipam(
        pool_name: impl Into<String>,
        pod_id: PodId,
        store: Arc<dyn ResourceStore>,
        config: DrsmConfig,
        ipam: Arc<dyn Ipam>,
    ) -> Result<Self> {
        config.validate()?;
        let pool_name = pool_name.into();
        if pod_id.pod_name.is_empty() {
            return Err(Error::Config("pod name must not be empty".into()));
        }

        info!(
            pool = %pool_name,
            pod = %pod_id,
            mode = ?config.mode,
            res_id_size = config.res_id_size,
            "Starting DRSM"
        );
        if config.mode == DrsmMode::Client && matches!(config.scan_policy, ScanPolicy::Quarantine) {
            warn!("No resource validator configured, chunks reclaimed from dead pods will be quarantined");
        }

        let mut ip_prefixes = HashMap::new();
        if config.mode == DrsmMode::Client {
            for (name, cidr) in &config.ip_pools {
                let canonical = ipam.new_prefix(cidr).await?;
                info!(pool = %name, cidr = %canonical, "IP pool registered");
                ip_prefixes.insert(name.clone(), canonical);
            }
        }

        let ctx = Arc::new(DrsmContext::new(pool_name, pod_id, store, config));
        let scanner = ChunkScanner::new(ctx.clone());
        let claimer = OwnershipClaimer::new(ctx.clone(), scanner);
        let (detector, pod_down_rx) = FailureDetector::new(ctx.clone());

        let mut tasks = vec![
            FeedConsumer::new(ctx.clone(), detector).spawn(),
            FailureDetector::spawn_consumer(ctx.clone(), pod_down_rx, claimer),
        ];
        if let Some(publisher) = LivenessPublisher::new(ctx.clone()).spawn() {
            tasks.push(publisher);
        }

        Ok(Self {
            acquirer: ChunkAcquirer::new(ctx.clone()),
            ctx,
            ipam,
            ip_prefixes,
            tasks: Mutex::new(tasks),
        })
    }

    /// This instance's identity.
    pub fn pod_id(&self) -> &PodId {
        &self.ctx.pod_id
    }

    /// Operating mode.
    pub fn mode(&self) -> DrsmMode {
        self.ctx.config.mode
    }

    /// Allocate a resource id unique across the pool.
    pub async fn allocate_id(&self) -> Result<ResourceId> {
        self.ensure_client()?;
        if let Some(id) = self.ctx.allocator.allocate() {
            return Ok(id);
        }

        let _creating = self.acquirer.lock().await;
        loop {
            if let Some(id) = self.ctx.allocator.allocate() {
                return Ok(id);
            }
            // Callers outside the lock may drain the new chunk before we
            // take from it.
            let chunk = self.acquirer.create_chunk().await?;
            if let Some(id) = chunk.lock().allocate() {
                return Ok(id);
            };
        }
    }

    /// Return an id allocated by this instance.
    ///
    /// Releasing an id that is already free is a no-op.
    pub fn release_id(&self, id: ResourceId) -> Result<()> {
        self.ensure_client()?;
        self.ctx.allocator.release(id)
    }

    /// Owner of the chunk `id` belongs to, per the global view.
    pub fn find_owner(&self, id: ResourceId) -> Result<PodId> {
        self.ctx
            .view
            .owner_of(id.chunk_id())
            .ok_or(Error::UnknownId(id.as_i32()))
    }

    /// Take an address from the named IP pool.
    pub async fn acquire_ip(&self, pool: &str) -> Result<String> {
        self.ensure_client()?;
        let cidr = self.prefix_of(pool)?;
        let ip = self.ipam.acquire_ip(cidr).await?;
        debug!(pool, %ip, "IP acquired");
        Ok(ip)
    }

    /// Return an address to the named IP pool.
    pub async fn release_ip(&self, pool: &str, ip: &str) -> Result<()> {
        self.ensure_client()?;
        let cidr = self.prefix_of(pool)?;
        self.ipam.release_ip(cidr, ip).await?;
        debug!(pool, ip, "IP released");
        Ok(())
    }

    /// State of a chunk as seen from this instance.
    pub fn chunk_state(&self, chunk_id: ChunkId) -> ChunkState {
        if let Some(state) = self.ctx.allocator.state(chunk_id) {
            return state;
        }
        match self.ctx.view.chunk_state(chunk_id) {
            // Recorded under our name but not held locally, e.g. left over
            // from an earlier run with the same pod name.
            ChunkState::Owned => ChunkState::Orphan,
            state => state,
        }
    }

    /// Chunks whose owner has no live keepalive in the view.
    pub fn orphaned_chunks(&self) -> Vec<ChunkId> {
        self.ctx.view.orphaned_chunks()
    }

    /// Snapshot of local and cluster-wide counters.
    pub fn stats(&self) -> DrsmStats {
        let local = self.ctx.allocator.stats();
        DrsmStats {
            owned_chunks: local.owned_chunks,
            scanning_chunks: local.scanning_chunks,
            free_ids: local.free_ids,
            allocated_ids: local.allocated_ids,
            known_chunks: self.ctx.view.chunk_count(),
            known_pods: self.ctx.view.pod_count(),
        }
    }

    /// Stop the scan of a reclaimed chunk. The chunk stays unusable.
    pub fn cancel_scan(&self, chunk_id: ChunkId) -> bool {
        let cancelled = self.ctx.scans.cancel(chunk_id);
        if cancelled {
            info!(chunk_id, "Scan cancelled on request");
        }
        cancelled
    }

    /// Stop every background task and wait for them to finish.
    pub async fn shutdown(&self) {
        info!(pod = %self.ctx.pod_id, "Shutting down DRSM");
        self.ctx.scans.cancel_all();
        self.ctx.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task failed");
            }
        }
    }

    fn ensure_client(&self) -> Result<()> {
        match self.ctx.config.mode {
            DrsmMode::Client => Ok(()),
            DrsmMode::Demux => Err(Error::DemuxModeForbidden),
        }
    }

    fn prefix_of(&self, pool: &str) -> Result<&str> {
        self.ip_prefixes
            .get(pool)
            .map(String::as_str)
            .ok_or_else(|| Error::IpPoolNotFound(pool.to_string()))
    }
}

impl Drop for Drsm {
    fn drop(&mut self) {
        self.ctx.cancel.cancel();
    }
}

impl std::fmt::Debug for Drsm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drsm")
            .field("pool", &self.ctx.pool_name)
            .field("pod", &self.ctx.pod_id)
            .field("mode", &self.ctx.config.mode)
            .finish()
    }
}
