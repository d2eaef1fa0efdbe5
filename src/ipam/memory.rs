//! In-process IPv4 prefix allocation.

use super::{Ipam, IpamResult};
use crate::error::IpamError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::Ipv4Addr;
use tracing::debug;

/// Parsed IPv4 prefix with its usable host range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Prefix {
    network: u32,
    len: u8,
}

impl Prefix {
    fn parse(cidr: &str) -> IpamResult<Self> {
        let invalid = || IpamError::InvalidPrefix(cidr.to_string());
        let (addr, len) = cidr.trim().split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let len: u8 = len.parse().map_err(|_| invalid())?;
        // Network and broadcast are never handed out, so /31 and /32 have
        // nothing to offer.
        if len > 30 {
            return Err(invalid());
        }
        let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
        Ok(Self {
            network: u32::from(addr) & mask,
            len,
        })
    }

    fn broadcast(&self) -> u32 {
        self.network | (u32::MAX >> self.len)
    }

    fn first_host(&self) -> u32 {
        self.network + 1
    }

    fn last_host(&self) -> u32 {
        self.broadcast() - 1
    }

    fn contains_host(&self, addr: u32) -> bool {
        addr >= self.first_host() && addr <= self.last_host()
    }

    fn cidr(&self) -> String {
        format!("{}/{}", Ipv4Addr::from(self.network), self.len)
    }
}

/// Allocation state of one prefix.
///
/// Never-used addresses are handed out first; released ones are reused only
/// after the range is exhausted, lowest first.
#[derive(Debug)]
struct PrefixPool {
    prefix: Prefix,
    next: Option<u32>,
    released: BTreeSet<u32>,
    in_use: HashSet<u32>,
}

impl PrefixPool {
    fn new(prefix: Prefix) -> Self {
        Self {
            prefix,
            next: Some(prefix.first_host()),
            released: BTreeSet::new(),
            in_use: HashSet::new(),
        }
    }

    fn acquire(&mut self) -> Option<u32> {
        let addr = match self.next {
            Some(addr) => {
                self.next = (addr < self.prefix.last_host()).then(|| addr + 1);
                addr
            }
            None => self.released.pop_first()?,
        };
        self.in_use.insert(addr);
        Some(addr)
    }

    fn release(&mut self, addr: u32) -> bool {
        if !self.in_use.remove(&addr) {
            return false;
        }
        self.released.insert(addr);
        true
    }
}

/// [`Ipam`] keeping every prefix in process memory.
#[derive(Debug, Default)]
pub struct InMemoryIpam {
    pools: Mutex<HashMap<String, PrefixPool>>,
}

impl InMemoryIpam {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of addresses currently handed out from `cidr`.
    pub fn in_use(&self, cidr: &str) -> usize {
        let Ok(prefix) = Prefix::parse(cidr) else {
            return 0;
        };
        self.pools
            .lock()
            .get(&prefix.cidr())
            .map_or(0, |p| p.in_use.len())
    }
}

#[async_trait]
impl Ipam for InMemoryIpam {
    async fn new_prefix(&self, cidr: &str) -> IpamResult<String> {
        let prefix = Prefix::parse(cidr)?;
        let key = prefix.cidr();
        self.pools
            .lock()
            .entry(key.clone())
            .or_insert_with(|| PrefixPool::new(prefix));
        debug!(cidr = %key, "Prefix registered");
        Ok(key)
    }

    async fn acquire_ip(&self, cidr: &str) -> IpamResult<String> {
        let key = Prefix::parse(cidr)?.cidr();
        let mut pools = self.pools.lock();
        let pool = pools
            .get_mut(&key)
            .ok_or_else(|| IpamError::UnknownPrefix(key.clone()))?;
        let addr = pool.acquire().ok_or(IpamError::Exhausted(key))?;
        Ok(Ipv4Addr::from(addr).to_string())
    }

    async fn release_ip(&self, cidr: &str, ip: &str) -> IpamResult<()> {
        let key = Prefix::parse(cidr)?.cidr();
        let addr: Ipv4Addr = ip
            .trim()
            .parse()
            .map_err(|_| IpamError::InvalidAddress(ip.to_string()))?;
        let addr = u32::from(addr);

        let mut pools = self.pools.lock();
        let pool = pools
            .get_mut(&key)
            .ok_or_else(|| IpamError::UnknownPrefix(key.clone()))?;
        if !pool.prefix.contains_host(addr) || !pool.release(addr) {
            return Err(IpamError::NotAllocated {
                cidr: key,
                ip: ip.to_string(),
            });
        }
        Ok(())
    }
}
