//! Core types used throughout the resource state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Chunk number, the high bits of a [`ResourceId`].
pub type ChunkId = u32;

/// Offset of an id inside its chunk, the low [`LOCAL_ID_BITS`] bits.
pub type LocalId = u16;

/// Number of low bits that address an id inside a chunk.
pub const LOCAL_ID_BITS: u32 = 10;

/// Number of ids in one chunk.
pub const CHUNK_SIZE: usize = 1 << LOCAL_ID_BITS;

/// Mask selecting the local part of a resource id.
pub const LOCAL_ID_MASK: i32 = (CHUNK_SIZE as i32) - 1;

/// A globally unique resource identifier: `(chunk_id << 10) | local_id`.
///
/// Decoding the chunk is pure arithmetic. Finding the owning pod needs the
/// global view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(i32);

impl ResourceId {
    /// Compose an id from its chunk and local parts.
    pub fn new(chunk_id: ChunkId, local_id: LocalId) -> Self {
        debug_assert!((local_id as usize) < CHUNK_SIZE);
        Self(((chunk_id as i32) << LOCAL_ID_BITS) | (local_id as i32 & LOCAL_ID_MASK))
    }

    /// The chunk this id belongs to.
    pub fn chunk_id(self) -> ChunkId {
        (self.0 as u32) >> LOCAL_ID_BITS
    }

    /// The offset of this id inside its chunk.
    pub fn local_id(self) -> LocalId {
        (self.0 & LOCAL_ID_MASK) as LocalId
    }

    /// The raw integer value handed to applications.
    pub fn as_i32(self) -> i32 {
        self.0
    }
}

impl From<i32> for ResourceId {
    fn from(raw: i32) -> Self {
        Self(raw)
    }
}

impl From<ResourceId> for i32 {
    fn from(id: ResourceId) -> Self {
        id.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one replica.
///
/// `pod_name` is the primary key: it is unique for the lifetime of the replica.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PodId {
    #[serde(rename = "podName")]
    pub pod_name: String,
    #[serde(rename = "podIp")]
    pub pod_ip: String,
}

impl PodId {
    /// Create a new PodId.
    pub fn new(pod_name: impl Into<String>, pod_ip: impl Into<String>) -> Self {
        Self {
            pod_name: pod_name.into(),
            pod_ip: pod_ip.into(),
        }
    }

    /// Build the identity from the platform-assigned `HOSTNAME` and `POD_IP`.
    pub fn from_env() -> Option<Self> {
        let name = std::env::var("HOSTNAME").ok().filter(|n| !n.is_empty())?;
        let ip = std::env::var("POD_IP").unwrap_or_default();
        Some(Self::new(name, ip))
    }
}

impl fmt::Display for PodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.pod_ip.is_empty() {
            write!(f, "{}", self.pod_name)
        } else {
            write!(f, "{}({})", self.pod_name, self.pod_ip)
        }
    }
}

/// State of a chunk as seen from one pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// Unused placeholder.
    Invalid,
    /// Owned by this pod and usable for allocation.
    Owned,
    /// Owned by another live pod.
    PeerOwned,
    /// Owner's keepalive is gone and nobody has claimed it yet.
    Orphan,
    /// Claimed by this pod, ids still being validated.
    Scanning,
}

impl fmt::Display for ChunkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChunkState::Invalid => "invalid",
            ChunkState::Owned => "owned",
            ChunkState::PeerOwned => "peer-owned",
            ChunkState::Orphan => "orphan",
            ChunkState::Scanning => "scanning",
        };
        f.write_str(s)
    }
}

/// Snapshot of an instance's local allocation state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrsmStats {
    /// Chunks owned and usable for allocation.
    pub owned_chunks: usize,
    /// Chunks claimed but still being scanned.
    pub scanning_chunks: usize,
    /// Free ids across owned chunks.
    pub free_ids: usize,
    /// Ids handed out (or confirmed in use) across owned chunks.
    pub allocated_ids: usize,
    /// Chunks known cluster-wide.
    pub known_chunks: usize,
    /// Pods known cluster-wide.
    pub known_pods: usize,
}
