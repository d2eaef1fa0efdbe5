//! Shared store abstraction.
//!
//! The store is the single source of truth for chunk ownership and pod
//! liveness. DRSM needs only a handful of capabilities from it:
//!
//! - **insert-if-absent**: only one pod can ever create a given chunk record
//! - **compare-and-update**: atomic, filter-qualified owner transfer
//! - **upsert**: keepalive refresh
//! - **TTL index**: keepalive records disappear on their own when not refreshed
//! - **change feed**: ordered insert/update/delete notifications
//! - **find-many**: full resync at startup
//!
//! # Persisted records
//!
//! ```text
//! keepalive  key = <podName>       {type: "keepalive", podName, podIp, expireAt}
//! chunk      key = "chunk-<id>"    {type: "chunk", chunkId, podName, podIp}
//! ```
//!
//! [`InMemoryStore`] implements the trait for tests and single-host demos.

mod memory;

pub use memory::{InMemoryStore, StoreOpCounts};

use crate::error::StoreError;
use crate::types::{ChunkId, PodId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Receiving half of a change feed. The feed has terminated when `recv`
/// returns `None`.
pub type ChangeStream = mpsc::UnboundedReceiver<ChangeEvent>;

/// Name of the TTL-indexed timestamp field of keepalive records.
pub const EXPIRE_AT_FIELD: &str = "expireAt";

const CHUNK_KEY_PREFIX: &str = "chunk-";

/// Document key of a chunk record.
pub fn chunk_key(chunk_id: ChunkId) -> String {
    format!("{}{}", CHUNK_KEY_PREFIX, chunk_id)
}

/// Parse a chunk record key. Returns `None` for any other key (pod keys).
pub fn parse_chunk_key(key: &str) -> Option<ChunkId> {
    key.strip_prefix(CHUNK_KEY_PREFIX)?.parse().ok()
}

/// Whether `key` names a chunk record.
pub fn is_chunk_key(key: &str) -> bool {
    parse_chunk_key(key).is_some()
}

/// Milliseconds since the Unix epoch.
pub fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Liveness marker one pod refreshes for itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepaliveRecord {
    #[serde(flatten)]
    pub pod: PodId,
    /// Absolute expiry in milliseconds since the Unix epoch.
    #[serde(rename = "expireAt")]
    pub expire_at_ms: u64,
}

impl KeepaliveRecord {
    /// Create a record for `pod` that expires `ttl` from now.
    pub fn new(pod: PodId, ttl: Duration) -> Self {
        Self {
            pod,
            expire_at_ms: unix_millis(SystemTime::now() + ttl),
        }
    }

    /// Expiry as a [`SystemTime`].
    pub fn expires_at(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.expire_at_ms)
    }
}

/// Ownership record of one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    #[serde(rename = "chunkId")]
    pub chunk_id: ChunkId,
    #[serde(flatten)]
    pub owner: PodId,
}

/// A document in the shared collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Document {
    Keepalive(KeepaliveRecord),
    Chunk(ChunkRecord),
}

impl Document {
    /// The document's primary key.
    pub fn key(&self) -> String {
        match self {
            Document::Keepalive(k) => k.pod.pod_name.clone(),
            Document::Chunk(c) => chunk_key(c.chunk_id),
        }
    }

    /// The kind of this document.
    pub fn kind(&self) -> DocumentKind {
        match self {
            Document::Keepalive(_) => DocumentKind::Keepalive,
            Document::Chunk(_) => DocumentKind::Chunk,
        }
    }
}

/// Selector for [`ResourceStore::find_many`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    Keepalive,
    Chunk,
}

/// Fields changed by an update, as reported on the change feed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdatedFields {
    /// New chunk owner.
    pub owner: Option<PodId>,
    /// New keepalive expiry.
    pub expire_at_ms: Option<u64>,
}

/// One change-feed notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A document was created.
    Insert { key: String, document: Document },
    /// Some fields of an existing document changed.
    Update { key: String, fields: UpdatedFields },
    /// A document was removed (by TTL expiry or explicitly). Only the key is
    /// known.
    Delete { key: String },
}

impl ChangeEvent {
    /// Key of the affected document.
    pub fn key(&self) -> &str {
        match self {
            ChangeEvent::Insert { key, .. }
            | ChangeEvent::Update { key, .. }
            | ChangeEvent::Delete { key } => key,
        }
    }
}

/// Filter of a chunk compare-and-update: the chunk record must still name
/// `owner_name` as its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFilter {
    pub chunk_id: ChunkId,
    pub owner_name: String,
}

/// Update applied by a chunk compare-and-update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkUpdate {
    pub owner: PodId,
}

/// Capabilities DRSM needs from the shared persistent store.
///
/// `collection` is the shared pool name; every DRSM instance of one pool uses
/// the same collection.
#[async_trait]
pub trait ResourceStore: Send + Sync + std::fmt::Debug {
    /// Insert `document` unless a document with the same key exists.
    /// Returns `false` when the key was already taken.
    async fn insert_if_absent(&self, collection: &str, document: Document) -> StoreResult<bool>;

    /// Atomically apply `update` to the chunk record if `filter` still holds.
    /// Returns `false` on a filter mismatch (or a missing record).
    async fn compare_and_update(
        &self,
        collection: &str,
        filter: &ChunkFilter,
        update: &ChunkUpdate,
    ) -> StoreResult<bool>;

    /// Insert or replace `document`.
    async fn upsert(&self, collection: &str, document: Document) -> StoreResult<()>;

    /// Make documents expire `expire_after` past the timestamp in `field`.
    /// Returns `false` if the index already existed.
    async fn create_ttl_index(
        &self,
        collection: &str,
        field: &str,
        expire_after: Duration,
    ) -> StoreResult<bool>;

    /// Subscribe to changes made after this call.
    async fn watch(&self, collection: &str) -> StoreResult<ChangeStream>;

    /// All documents of `kind`.
    async fn find_many(&self, collection: &str, kind: DocumentKind) -> StoreResult<Vec<Document>>;
}
