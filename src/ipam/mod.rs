//! IP address pools.
//!
//! DRSM does not manage addresses itself. It resolves a configured pool name
//! to a CIDR prefix and forwards acquire/release to an [`Ipam`]
//! implementation.

mod memory;

pub use memory::InMemoryIpam;

use crate::error::IpamError;
use async_trait::async_trait;

/// Result type for IPAM operations.
pub type IpamResult<T> = std::result::Result<T, IpamError>;

/// Address allocation over CIDR prefixes.
#[async_trait]
pub trait Ipam: Send + Sync + std::fmt::Debug {
    /// Register a prefix. Returns its canonical CIDR, which is what the other
    /// calls expect. Registering a prefix twice is not an error.
    async fn new_prefix(&self, cidr: &str) -> IpamResult<String>;

    /// Hand out a free address of `cidr`.
    async fn acquire_ip(&self, cidr: &str) -> IpamResult<String>;

    /// Return an address to `cidr`.
    async fn release_ip(&self, cidr: &str, ip: &str) -> IpamResult<()>;
}
