//! Re-validation of chunks reclaimed from dead pods.
//!
//! The shared store only records which pod owns a chunk, never which of its
//! ids are in use. After winning a claim, the new owner asks the application
//! about every id before serving the chunk. What happens without a validator
//! is an explicit [`ScanPolicy`] choice.

use crate::allocator::ChunkHandle;
use crate::context::DrsmContext;
use crate::types::{ChunkId, ResourceId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Application callback that tells whether a resource id is still held.
pub trait ResourceValidator: Send + Sync + 'static {
    /// Returns `true` if `id` is still in use somewhere and must not be
    /// handed out again.
    fn is_in_use(&self, id: ResourceId) -> bool;
}

impl<F> ResourceValidator for F
where
    F: Fn(ResourceId) -> bool + Send + Sync + 'static,
{
    fn is_in_use(&self, id: ResourceId) -> bool {
        self(id)
    }
}

/// How a reclaimed chunk is made usable again.
#[derive(Clone, Default)]
pub enum ScanPolicy {
    /// Ask the validator about every id, one scan tick at a time.
    Validate(Arc<dyn ResourceValidator>),

    /// Assume every id of a reclaimed chunk is free.
    TrustImmediately,

    /// Never serve reclaimed chunks.
    #[default]
    Quarantine,
}

impl fmt::Debug for ScanPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanPolicy::Validate(_) => f.write_str("Validate(..)"),
            ScanPolicy::TrustImmediately => f.write_str("TrustImmediately"),
            ScanPolicy::Quarantine => f.write_str("Quarantine"),
        }
    }
}

#[derive(Debug)]
struct ScanEntry {
    generation: u64,
    token: CancellationToken,
}

/// Cancellation handles of running scans.
#[derive(Debug, Default)]
pub struct ScanRegistry {
    scans: Mutex<HashMap<ChunkId, ScanEntry>>,
    next_generation: AtomicU64,
}

impl ScanRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a scan, cancelling any earlier scan of the same chunk.
    /// Returns the generation to hand back to [`finish`](Self::finish).
    pub fn register(&self, chunk_id: ChunkId, token: CancellationToken) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let entry = ScanEntry { generation, token };
        if let Some(previous) = self.scans.lock().insert(chunk_id, entry) {
            previous.token.cancel();
        }
        generation
    }

    /// Stop the scan of `chunk_id`. Returns `false` if none was running.
    pub fn cancel(&self, chunk_id: ChunkId) -> bool {
        match self.scans.lock().remove(&chunk_id) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Forget a scan that finished on its own. A newer scan of the same
    /// chunk is left alone.
    pub fn finish(&self, chunk_id: ChunkId, generation: u64) {
        let mut scans = self.scans.lock();
        if scans.get(&chunk_id).is_some_and(|e| e.generation == generation) {
            scans.remove(&chunk_id);
        }
    }

    /// Stop every scan.
    pub fn cancel_all(&self) {
        for (_, entry) in self.scans.lock().drain() {
            entry.token.cancel();
        }
    }

    /// Chunks with a running scan.
    pub fn active(&self) -> Vec<ChunkId> {
        let mut ids: Vec<ChunkId> = self.scans.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

struct ScanTask {
    chunk_id: ChunkId,
    generation: u64,
    handle: ChunkHandle,
    validator: Arc<dyn ResourceValidator>,
    token: CancellationToken,
}

/// Drives the scan of reclaimed chunks.
#[derive(Clone)]
pub struct ChunkScanner {
    ctx: Arc<DrsmContext>,
}

impl ChunkScanner {
    pub fn new(ctx: Arc<DrsmContext>) -> Self {
        Self { ctx }
    }

    /// Begin scanning a chunk this pod just claimed.
    ///
    /// Returns the scan task when the policy needs one.
    pub fn start(&self, chunk_id: ChunkId) -> Option<JoinHandle<()>> {
        let ctx = &self.ctx;
        if ctx.is_demux() {
            debug!(chunk_id, "Demux mode, not scanning");
            return None;
        }

        let handle = ctx.allocator.begin_scan(chunk_id, ctx.pod_id.clone());
        match &ctx.config.scan_policy {
            ScanPolicy::TrustImmediately => {
                handle.lock().trust_pending();
                if ctx.allocator.promote(chunk_id) {
                    info!(chunk_id, "Reclaimed chunk trusted without scan");
                }
                None
            }
            ScanPolicy::Quarantine => {
                warn!(
                    chunk_id,
                    "No resource validator configured, reclaimed chunk will not be served"
                );
                None
            }
            ScanPolicy::Validate(validator) => {
                let token = ctx.cancel.child_token();
                let generation = ctx.scans.register(chunk_id, token.clone());
                info!(chunk_id, "Scan started");
                Some(tokio::spawn(Self::run(
                    ctx.clone(),
                    ScanTask {
                        chunk_id,
                        generation,
                        handle,
                        validator: validator.clone(),
                        token,
                    },
                )))
            }
        }
    }

    async fn run(ctx: Arc<DrsmContext>, task: ScanTask) {
        let ScanTask {
            chunk_id,
            generation,
            handle,
            validator,
            token,
        } = task;
        let mut ticker = tokio::time::interval(ctx.config.scan_interval);
        let batch = ctx.config.scan_batch_size;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!(chunk_id, "Scan cancelled");
                    return;
                }
                _ = ticker.tick() => {}
            }

            for _ in 0..batch {
                let candidate = handle.lock().next_scan_candidate();
                let Some(local) = candidate else {
                    break;
                };
                let in_use = validator.is_in_use(ResourceId::new(chunk_id, local));
                handle.lock().record_scan(local, in_use);
            }

            if handle.lock().scan_complete() {
                ctx.scans.finish(chunk_id, generation);
                if token.is_cancelled() {
                    return;
                }
                if ctx.allocator.promote(chunk_id) {
                    let in_use = handle.lock().alloc_ids().len();
                    info!(chunk_id, in_use, "Scan complete, chunk available");
                } else {
                    debug!(chunk_id, "Scanned chunk no longer held");
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_validator() {
        let validator = |id: ResourceId| id.local_id() == 0;
        assert!(validator.is_in_use(ResourceId::new(7, 0)));
        assert!(!validator.is_in_use(ResourceId::new(7, 1)));
    }

    #[test]
    fn test_policy_debug() {
        let policy = ScanPolicy::Validate(Arc::new(|_id: ResourceId| false));
        assert_eq!(format!("{:?}", policy), "Validate(..)");
        assert_eq!(format!("{:?}", ScanPolicy::default()), "Quarantine");
    }

    #[test]
    fn test_registry_cancel() {
        let registry = ScanRegistry::new();
        let first = CancellationToken::new();
        registry.register(3, first.clone());
        assert_eq!(registry.active(), vec![3]);

        let second = CancellationToken::new();
        registry.register(3, second.clone());
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());

        assert!(registry.cancel(3));
        assert!(second.is_cancelled());
        assert!(!registry.cancel(3));
    }

    #[test]
    fn test_registry_finish_ignores_stale_generation() {
        let registry = ScanRegistry::new();
        let old = registry.register(3, CancellationToken::new());
        let new = registry.register(3, CancellationToken::new());

        registry.finish(3, old);
        assert_eq!(registry.active(), vec![3]);
        registry.finish(3, new);
        assert!(registry.active().is_empty());
    }

    #[test]
    fn test_registry_cancel_all() {
        let registry = ScanRegistry::new();
        let a = CancellationToken::new();
        let b = CancellationToken::new();
        registry.register(1, a.clone());
        registry.register(2, b.clone());

        registry.cancel_all();
        assert!(a.is_cancelled() && b.is_cancelled());
        assert!(registry.active().is_empty());
    }
}
