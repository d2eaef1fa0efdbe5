//! Distributed resource state machine.
//!
//! Lets any number of replicas ("pods") hand out globally unique small
//! integer ids, and IP addresses, without a central allocator. The only
//! coordination medium is a shared persistent store:
//!
//! - **Chunked ownership**: the id space is split into 1024-id chunks; a pod
//!   owns whole chunks and allocates inside them without talking to anyone
//! - **Liveness by TTL**: each pod refreshes a keepalive record the store
//!   expires on its own
//! - **Claim race**: when a keepalive disappears, survivors race with
//!   compare-and-update for the dead pod's chunks
//! - **Scan**: the winner re-validates every id of a reclaimed chunk before
//!   serving it
//!
//! # Example
//!
//! ```rust,no_run
//! use drsm::{Drsm, DrsmConfig, InMemoryStore, PodId, ResourceId};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(InMemoryStore::new());
//!
//!     // Tell DRSM how to check whether an id of a reclaimed chunk is in use.
//!     let config = DrsmConfig::new().with_validator(|_id: ResourceId| false);
//!
//!     let drsm = Drsm::init("ngapid", PodId::new("amf-0", "10.0.0.1"), store, config).await?;
//!
//!     let id = drsm.allocate_id().await?;
//!     println!("allocated {} owned by {}", id, drsm.find_owner(id)?);
//!     drsm.release_id(id)?;
//!
//!     drsm.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                  Drsm API                   │
//! │  • allocate_id / release_id                 │
//! │  • find_owner                               │
//! │  • acquire_ip / release_ip                  │
//! └─────────────────────────────────────────────┘
//!        │                  │                │
//!        ▼                  ▼                ▼
//! ┌────────────────┐ ┌────────────────┐ ┌──────────┐
//! │ ChunkAllocator │ │   GlobalView   │ │   Ipam   │
//! │ ChunkAcquirer  │ │ (feed-driven)  │ └──────────┘
//! └────────────────┘ └────────────────┘
//!        ▲                  │ pod down
//!        │ scan             ▼
//! ┌────────────────┐ ┌──────────────────┐
//! │  ChunkScanner  │◀│ OwnershipClaimer │
//! └────────────────┘ └──────────────────┘
//!                           │
//!                           ▼
//!               ┌──────────────────────┐
//!               │    ResourceStore     │
//!               └──────────────────────┘
//! ```
//!
//! # Consistency Model
//!
//! - **Allocation**: ids are unique as long as chunk ownership in the store
//!   is; the store's insert-if-absent and compare-and-update are the only
//!   arbiters
//! - **Owner lookups**: served from the global view, which may lag the store
//! - **Reclaimed chunks**: never served before every id has been validated,
//!   unless [`ScanPolicy::TrustImmediately`] is configured
//!
//! # Modes
//!
//! A [`DrsmMode::Demux`] instance only follows the change feed to answer
//! [`Drsm::find_owner`]. It never writes to the store.

pub mod acquirer;
pub mod allocator;
pub mod claim;
pub mod config;
pub mod context;
pub mod drsm;
pub mod error;
pub mod feed;
pub mod ipam;
pub mod liveness;
pub mod scan;
pub mod store;
pub mod types;
pub mod view;

#[cfg(test)]
mod testing;

pub use config::{DrsmConfig, DrsmMode, DEFAULT_RES_ID_SIZE};
pub use drsm::Drsm;
pub use error::{Error, IpamError, Result, StoreError};
pub use ipam::{InMemoryIpam, Ipam};
pub use scan::{ResourceValidator, ScanPolicy};
pub use store::{ChangeEvent, Document, DocumentKind, InMemoryStore, ResourceStore};
pub use types::{ChunkId, ChunkState, DrsmStats, LocalId, PodId, ResourceId, CHUNK_SIZE};
