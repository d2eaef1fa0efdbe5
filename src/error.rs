//! Error types for the resource state machine.

use crate::types::ChunkId;
use thiserror::Error;

/// Result type alias for DRSM operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for DRSM.
#[derive(Error, Debug)]
pub enum Error {
    /// The instance runs in demux (view-only) mode.
    #[error("operation not permitted in demux mode")]
    DemuxModeForbidden,

    /// The chunk space is fully allocated cluster-wide.
    #[error("no resource ids available")]
    NoIdsAvailable,

    /// The id does not belong to any chunk known here.
    #[error("unknown resource id: {0}")]
    UnknownId(i32),

    /// Another pod changed the chunk owner first.
    ///
    /// Internal: losing the claim race is expected and never surfaced to callers.
    #[error("claim lost for chunk {chunk_id}")]
    ClaimLost { chunk_id: ChunkId },

    /// The backing store rejected or failed an operation.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// No IP pool with this name was configured.
    #[error("ip pool not found: {0}")]
    IpPoolNotFound(String),

    /// The IPAM collaborator failed.
    #[error("ipam error: {0}")]
    Ipam(#[from] IpamError),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors reported by a [`ResourceStore`](crate::store::ResourceStore).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The change feed could not be opened.
    #[error("change feed unavailable: {0}")]
    FeedUnavailable(String),

    /// A document could not be encoded or decoded.
    #[error("malformed document {key}: {reason}")]
    Malformed { key: String, reason: String },

    /// Any other backend failure.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Errors reported by an [`Ipam`](crate::ipam::Ipam) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IpamError {
    /// The CIDR could not be parsed or describes an empty range.
    #[error("invalid prefix: {0}")]
    InvalidPrefix(String),

    /// The prefix was never registered.
    #[error("prefix not registered: {0}")]
    UnknownPrefix(String),

    /// All addresses of the prefix are in use.
    #[error("no address available in {0}")]
    Exhausted(String),

    /// The address is not allocated from this prefix.
    #[error("address {ip} not allocated from {cidr}")]
    NotAllocated { cidr: String, ip: String },

    /// The address could not be parsed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

impl Error {
    /// Whether the caller made a request that can never succeed as-is.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Error::DemuxModeForbidden | Error::UnknownId(_) | Error::IpPoolNotFound(_)
        )
    }
}
