//! Configuration types for a DRSM instance.

use crate::error::{Error, Result};
use crate::scan::{ResourceValidator, ScanPolicy};
use crate::types::{ChunkId, LOCAL_ID_BITS};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Default resource id width in bits: 14-bit chunk space x 10-bit local space.
pub const DEFAULT_RES_ID_SIZE: u32 = 24;

/// Operating mode of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrsmMode {
    /// Participates in allocation, liveness and claims.
    #[default]
    Client,

    /// View-only: maintains the global view for owner lookups, never writes.
    Demux,
}

/// Main configuration for a DRSM instance.
#[derive(Debug, Clone)]
pub struct DrsmConfig {
    /// Width of a resource id in bits (chunk bits + 10 local bits).
    pub res_id_size: u32,

    /// Operating mode.
    pub mode: DrsmMode,

    /// What to do with the ids of a chunk reclaimed from a dead pod.
    pub scan_policy: ScanPolicy,

    /// How often this pod refreshes its keepalive record.
    pub keepalive_interval: Duration,

    /// How far in the future each keepalive record expires.
    /// Must be strictly greater than `keepalive_interval`.
    pub keepalive_ttl: Duration,

    /// Delay between scan ticks of a reclaimed chunk.
    pub scan_interval: Duration,

    /// Ids validated per scan tick.
    pub scan_batch_size: usize,

    /// Delay before reopening a failed or terminated change feed.
    pub feed_retry_backoff: Duration,

    /// Capacity of the pod-down notification queue.
    pub pod_down_queue_capacity: usize,

    /// Upper bound on chunk creation attempts. `None` derives it from the
    /// chunk range.
    pub max_chunk_attempts: Option<usize>,

    /// IP pools handed to the IPAM collaborator (pool name -> CIDR).
    pub ip_pools: HashMap<String, String>,
}

impl Default for DrsmConfig {
    fn default() -> Self {
        Self {
            res_id_size: DEFAULT_RES_ID_SIZE,
            mode: DrsmMode::Client,
            scan_policy: ScanPolicy::Quarantine,
            keepalive_interval: Duration::from_secs(5),
            keepalive_ttl: Duration::from_secs(20),
            scan_interval: Duration::from_secs(5),
            scan_batch_size: 1,
            feed_retry_backoff: Duration::from_secs(5),
            pod_down_queue_capacity: 10,
            max_chunk_attempts: None,
            ip_pools: HashMap::new(),
        }
    }
}

impl DrsmConfig {
    /// Create a new client-mode configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a demux-mode (view-only) configuration.
    pub fn demux() -> Self {
        Self {
            mode: DrsmMode::Demux,
            ..Default::default()
        }
    }

    /// Set the resource id width in bits.
    pub fn with_res_id_size(mut self, bits: u32) -> Self {
        self.res_id_size = bits;
        self
    }

    /// Set the operating mode.
    pub fn with_mode(mut self, mode: DrsmMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the scan policy for reclaimed chunks.
    pub fn with_scan_policy(mut self, policy: ScanPolicy) -> Self {
        self.scan_policy = policy;
        self
    }

    /// Validate reclaimed ids through `validator`.
    pub fn with_validator(mut self, validator: impl ResourceValidator) -> Self {
        self.scan_policy = ScanPolicy::Validate(Arc::new(validator));
        self
    }

    /// Set keepalive publish interval and record expiry.
    pub fn with_keepalive(mut self, interval: Duration, ttl: Duration) -> Self {
        self.keepalive_interval = interval;
        self.keepalive_ttl = ttl;
        self
    }

    /// Set the scan tick interval.
    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    /// Set how many ids are validated per scan tick.
    pub fn with_scan_batch_size(mut self, batch: usize) -> Self {
        self.scan_batch_size = batch;
        self
    }

    /// Set the change feed reopen backoff.
    pub fn with_feed_retry_backoff(mut self, backoff: Duration) -> Self {
        self.feed_retry_backoff = backoff;
        self
    }

    /// Set the pod-down queue capacity.
    pub fn with_pod_down_queue_capacity(mut self, capacity: usize) -> Self {
        self.pod_down_queue_capacity = capacity;
        self
    }

    /// Cap chunk creation attempts.
    pub fn with_max_chunk_attempts(mut self, attempts: usize) -> Self {
        self.max_chunk_attempts = Some(attempts);
        self
    }

    /// Register an IP pool.
    pub fn with_ip_pool(mut self, name: impl Into<String>, cidr: impl Into<String>) -> Self {
        self.ip_pools.insert(name.into(), cidr.into());
        self
    }

    /// Number of chunk ids: `2^(res_id_size - 10)`.
    pub fn chunk_range(&self) -> ChunkId {
        1u32 << (self.res_id_size - LOCAL_ID_BITS)
    }

    /// Effective cap on chunk creation attempts.
    pub fn chunk_attempt_limit(&self) -> usize {
        self.max_chunk_attempts
            .unwrap_or_else(|| (self.chunk_range() as usize).saturating_mul(4).max(64))
    }

    /// Check the configuration for values the protocol cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.res_id_size <= LOCAL_ID_BITS || self.res_id_size > 32 {
            return Err(Error::Config(format!(
                "res_id_size must be in {}..=32, got {}",
                LOCAL_ID_BITS + 1,
                self.res_id_size
            )));
        }
        if self.keepalive_interval.is_zero() {
            return Err(Error::Config("keepalive_interval must be non-zero".into()));
        }
        if self.keepalive_interval >= self.keepalive_ttl {
            return Err(Error::Config(format!(
                "keepalive_interval ({:?}) must be less than keepalive_ttl ({:?})",
                self.keepalive_interval, self.keepalive_ttl
            )));
        }
        if self.scan_interval.is_zero() || self.scan_batch_size == 0 {
            return Err(Error::Config(
                "scan_interval and scan_batch_size must be non-zero".into(),
            ));
        }
        if self.pod_down_queue_capacity == 0 {
            return Err(Error::Config("pod_down_queue_capacity must be non-zero".into()));
        }
        if self.max_chunk_attempts == Some(0) {
            return Err(Error::Config("max_chunk_attempts must be non-zero".into()));
        }
        Ok(())
    }
}
