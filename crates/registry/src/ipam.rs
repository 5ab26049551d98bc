//! IPv4 lease allocation inside the mesh prefix.

use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::Bytes;
use cidr::{Ipv4Cidr, Ipv6Cidr};
use ember_storage::{keys, Storage};
use tracing::debug;

use crate::{MeshState, RegistryError};

/// A configured `id → prefix` assignment, pre-populated at bootstrap.
///
/// Static leases are held by the allocator forever: the prefix is never
/// handed out to another node even if the named id never joins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticLease {
    pub id: String,
    pub prefix: Ipv4Cidr,
}

/// Allocator for `/32` leases under `/registry/ipam/`.
#[derive(Debug, Clone)]
pub struct Ipam<S> {
    storage: S,
}

impl<S: Storage> Ipam<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// Acquire a lease for `id`, idempotently.
    ///
    /// If `id` already holds a lease it is returned unchanged; otherwise the
    /// lowest free host address in the mesh IPv4 prefix is allocated,
    /// skipping every address currently held or statically reserved.
    pub async fn acquire(&self, id: &str) -> Result<Ipv4Cidr, RegistryError> {
        match self.get(id).await {
            Ok(existing) => return Ok(existing),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let prefix = MeshState::new(self.storage.clone()).get_ipv4_prefix().await?;
        let held = self.held_addresses().await?;

        let network = u32::from(prefix.first_address());
        let host_bits = 32 - u32::from(prefix.network_length());
        let size: u64 = 1u64 << host_bits;

        // Skip the network and broadcast addresses.
        for offset in 1..size.saturating_sub(1) {
            let candidate = Ipv4Addr::from(network + offset as u32);
            if held.contains(&candidate) {
                continue;
            }
            let lease = Ipv4Cidr::new(candidate, 32)
                .map_err(|e| RegistryError::InvalidPrefix(e.to_string()))?;
            self.put(id, lease).await?;
            debug!(%id, %lease, "allocated ipv4 lease");
            return Ok(lease);
        }

        Err(RegistryError::PoolExhausted)
    }

    /// The lease held by `id`, if any.
    pub async fn get(&self, id: &str) -> Result<Ipv4Cidr, RegistryError> {
        let value = self.storage.get(&keys::ipam_key(id)).await?;
        parse_lease(&value)
    }

    /// Release the lease held by `id`.
    pub async fn release(&self, id: &str) -> Result<(), RegistryError> {
        self.storage.delete(&keys::ipam_key(id)).await?;
        Ok(())
    }

    /// Write configured static assignments into the lease map.
    pub async fn preload(&self, statics: &[StaticLease]) -> Result<(), RegistryError> {
        for lease in statics {
            self.put(&lease.id, lease.prefix).await?;
        }
        Ok(())
    }

    async fn held_addresses(&self) -> Result<HashSet<Ipv4Addr>, RegistryError> {
        let entries = self.storage.list(keys::IPAM_PREFIX).await?;
        let mut held = HashSet::with_capacity(entries.len());
        for (_, value) in &entries {
            held.insert(parse_lease(value)?.first_address());
        }
        Ok(held)
    }

    async fn put(&self, id: &str, lease: Ipv4Cidr) -> Result<(), RegistryError> {
        self.storage
            .put(&keys::ipam_key(id), Bytes::from(lease.to_string()))
            .await?;
        Ok(())
    }
}

fn parse_lease(value: &Bytes) -> Result<Ipv4Cidr, RegistryError> {
    let raw = std::str::from_utf8(value)
        .map_err(|e| RegistryError::InvalidRecord(e.to_string()))?;
    raw.parse()
        .map_err(|e| RegistryError::InvalidPrefix(format!("{raw}: {e}")))
}

/// A uniformly random `/128` host address inside `prefix`.
pub fn random_ipv6_host(prefix: Ipv6Cidr) -> Result<Ipv6Cidr, RegistryError> {
    let network = u128::from(prefix.first_address());
    let host_bits = 128 - u32::from(prefix.network_length());
    let mask = if host_bits == 128 {
        u128::MAX
    } else {
        (1u128 << host_bits) - 1
    };
    let host = rand::random::<u128>() & mask;
    let addr = Ipv6Addr::from(network | host);
    Ipv6Cidr::new(addr, 128).map_err(|e| RegistryError::InvalidPrefix(e.to_string()))
}
