//! Cluster-wide view of chunk ownership and pod liveness.
//!
//! The view is a cache of the shared store, built from a startup resync and
//! kept current by the change feed. It may be stale between feed events;
//! every cross-reference (chunk -> owner, pod -> owned chunks) is updated
//! under a single lock so readers never see one side without the other.

use crate::store::{ChangeEvent, Document, KeepaliveRecord, UpdatedFields};
use crate::types::{ChunkId, ChunkState, PodId};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// What the view knows about one pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRecord {
    pub pod_id: PodId,
    /// When a keepalive from this pod was last observed.
    pub last_seen: Option<SystemTime>,
    /// Expiry carried by the last observed keepalive.
    pub expires_at: Option<SystemTime>,
    /// Whether a keepalive record for this pod is known to exist.
    pub alive: bool,
    pub owned_chunks: BTreeSet<ChunkId>,
}

impl PodRecord {
    fn new(pod_id: PodId) -> Self {
        Self {
            pod_id,
            last_seen: None,
            expires_at: None,
            alive: false,
            owned_chunks: BTreeSet::new(),
        }
    }

    fn touch(&mut self, expire_at_ms: u64) {
        self.last_seen = Some(SystemTime::now());
        self.expires_at = Some(UNIX_EPOCH + Duration::from_millis(expire_at_ms));
        self.alive = true;
    }
}

/// What a change event did to the view, for the caller to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewChange {
    /// Nothing the caller needs to react to.
    None,
    /// A pod's keepalive record was deleted.
    PodDeleted { pod_name: String },
    /// A chunk moved from one owner to another.
    ChunkReassigned {
        chunk_id: ChunkId,
        from: Option<PodId>,
        to: PodId,
    },
}

#[derive(Debug, Default)]
struct ViewInner {
    chunks: HashMap<ChunkId, PodId>,
    pods: HashMap<String, PodRecord>,
}

impl ViewInner {
    fn pod_entry(&mut self, pod_id: &PodId) -> &mut PodRecord {
        let record = self
            .pods
            .entry(pod_id.pod_name.clone())
            .or_insert_with(|| PodRecord::new(pod_id.clone()));
        if record.pod_id.pod_ip.is_empty() && !pod_id.pod_ip.is_empty() {
            record.pod_id.pod_ip = pod_id.pod_ip.clone();
        }
        record
    }

    /// Point `chunk_id` at `owner`, fixing both pod records. Returns the
    /// previous owner.
    fn set_owner(&mut self, chunk_id: ChunkId, owner: PodId) -> Option<PodId> {
        let previous = self.chunks.insert(chunk_id, owner.clone());
        if let Some(prev) = &previous {
            if prev.pod_name != owner.pod_name {
                if let Some(record) = self.pods.get_mut(&prev.pod_name) {
                    record.owned_chunks.remove(&chunk_id);
                }
            }
        }
        self.pod_entry(&owner).owned_chunks.insert(chunk_id);
        previous
    }
}

/// Cluster-wide chunk and pod tables.
#[derive(Debug)]
pub struct GlobalView {
    self_name: String,
    inner: RwLock<ViewInner>,
}

impl GlobalView {
    /// Create an empty view for the pod named `self_name`.
    pub fn new(self_name: impl Into<String>) -> Self {
        Self {
            self_name: self_name.into(),
            inner: RwLock::new(ViewInner::default()),
        }
    }

    /// Apply one change-feed event.
    pub fn apply(&self, event: &ChangeEvent) -> ViewChange {
        match event {
            ChangeEvent::Insert { document, .. } => {
                self.apply_document(document);
                ViewChange::None
            }
            ChangeEvent::Update { key, fields } => self.apply_update(key, fields),
            ChangeEvent::Delete { key } => match crate::store::parse_chunk_key(key) {
                Some(chunk_id) => {
                    self.remove_chunk(chunk_id);
                    ViewChange::None
                }
                None => ViewChange::PodDeleted {
                    pod_name: key.clone(),
                },
            },
        }
    }

    /// Register a document seen on the feed or returned by a resync.
    pub fn apply_document(&self, document: &Document) {
        match document {
            Document::Keepalive(record) => self.register_keepalive(record),
            Document::Chunk(record) => {
                self.register_chunk(record.chunk_id, record.owner.clone());
            }
        }
    }

    fn apply_update(&self, key: &str, fields: &UpdatedFields) -> ViewChange {
        if let Some(chunk_id) = crate::store::parse_chunk_key(key) {
            let Some(owner) = fields.owner.clone() else {
                return ViewChange::None;
            };
            let from = self.inner.write().set_owner(chunk_id, owner.clone());
            if from.as_ref().map(|p| &p.pod_name) == Some(&owner.pod_name) {
                return ViewChange::None;
            }
            debug!(chunk_id, to = %owner, "Chunk owner changed");
            return ViewChange::ChunkReassigned {
                chunk_id,
                from,
                to: owner,
            };
        }

        if let Some(expire_at_ms) = fields.expire_at_ms {
            self.inner
                .write()
                .pods
                .entry(key.to_string())
                .or_insert_with(|| PodRecord::new(PodId::new(key, "")))
                .touch(expire_at_ms);
        }
        ViewChange::None
    }

    /// Register or refresh a pod from its keepalive record.
    pub fn register_keepalive(&self, record: &KeepaliveRecord) {
        let mut inner = self.inner.write();
        let is_new = !inner.pods.contains_key(&record.pod.pod_name);
        inner.pod_entry(&record.pod).touch(record.expire_at_ms);
        if is_new {
            info!(pod = %record.pod, "Pod joined");
        }
    }

    /// Register a chunk with its owner.
    pub fn register_chunk(&self, chunk_id: ChunkId, owner: PodId) {
        self.inner.write().set_owner(chunk_id, owner);
    }

    /// Re-point a chunk to a new owner. Returns the previous owner.
    pub fn reassign_chunk(&self, chunk_id: ChunkId, owner: PodId) -> Option<PodId> {
        self.inner.write().set_owner(chunk_id, owner)
    }

    /// Forget a chunk.
    pub fn remove_chunk(&self, chunk_id: ChunkId) -> Option<PodId> {
        let mut inner = self.inner.write();
        let owner = inner.chunks.remove(&chunk_id)?;
        if let Some(record) = inner.pods.get_mut(&owner.pod_name) {
            record.owned_chunks.remove(&chunk_id);
        }
        Some(owner)
    }

    /// Forget a pod, returning its record. Its chunks stay in the chunk table
    /// (still pointing at the dead owner) until someone claims them.
    pub fn remove_pod(&self, pod_name: &str) -> Option<PodRecord> {
        self.inner.write().pods.remove(pod_name)
    }

    /// Owner of a chunk.
    pub fn owner_of(&self, chunk_id: ChunkId) -> Option<PodId> {
        self.inner.read().chunks.get(&chunk_id).cloned()
    }

    /// Whether the chunk is known cluster-wide.
    pub fn contains_chunk(&self, chunk_id: ChunkId) -> bool {
        self.inner.read().chunks.contains_key(&chunk_id)
    }

    /// Record of a pod.
    pub fn pod(&self, pod_name: &str) -> Option<PodRecord> {
        self.inner.read().pods.get(pod_name).cloned()
    }

    /// Whether the pod is known.
    pub fn contains_pod(&self, pod_name: &str) -> bool {
        self.inner.read().pods.contains_key(pod_name)
    }

    /// Chunks the view attributes to `pod_name`.
    pub fn chunks_of(&self, pod_name: &str) -> BTreeSet<ChunkId> {
        self.inner
            .read()
            .pods
            .get(pod_name)
            .map(|r| r.owned_chunks.clone())
            .unwrap_or_default()
    }

    /// Cluster-level state of a chunk as seen from this pod. Local states
    /// (`Owned`, `Scanning`) are the allocator's business; here a chunk owned
    /// by this pod reports `Owned`.
    pub fn chunk_state(&self, chunk_id: ChunkId) -> ChunkState {
        let inner = self.inner.read();
        match inner.chunks.get(&chunk_id) {
            None => ChunkState::Invalid,
            Some(owner) if owner.pod_name == self.self_name => ChunkState::Owned,
            Some(owner) => match inner.pods.get(&owner.pod_name) {
                Some(record) if record.alive => ChunkState::PeerOwned,
                _ => ChunkState::Orphan,
            },
        }
    }

    /// Chunks whose owner has no live keepalive in the view.
    pub fn orphaned_chunks(&self) -> Vec<ChunkId> {
        let inner = self.inner.read();
        let mut orphans: Vec<ChunkId> = inner
            .chunks
            .iter()
            .filter(|(_, owner)| owner.pod_name != self.self_name)
            .filter(|(_, owner)| !inner.pods.get(&owner.pod_name).is_some_and(|r| r.alive))
            .map(|(id, _)| *id)
            .collect();
        orphans.sort_unstable();
        orphans
    }

    /// Number of known chunks.
    pub fn chunk_count(&self) -> usize {
        self.inner.read().chunks.len()
    }

    /// Number of known pods.
    pub fn pod_count(&self) -> usize {
        self.inner.read().pods.len()
    }
}
