//! Mesh-wide settings: address prefixes and the mesh domain.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;
use cidr::{Ipv4Cidr, Ipv6Cidr};
use ember_storage::{keys, Storage};

use crate::{Peers, RegistryError};

/// The three well-known settings written once at cluster bootstrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshSettings {
    /// Mesh-wide IPv4 CIDR.
    pub ipv4_prefix: Ipv4Cidr,
    /// Mesh-wide IPv6 ULA prefix.
    pub ipv6_prefix: Ipv6Cidr,
    /// DNS suffix for the mesh.
    pub domain: String,
}

/// Accessor for mesh-wide settings under `/registry/meshstate/`.
///
/// Values are stored as plain strings; prefixes are parsed on read.
#[derive(Debug, Clone)]
pub struct MeshState<S> {
    storage: S,
}

impl<S: Storage> MeshState<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub async fn get_ipv4_prefix(&self) -> Result<Ipv4Cidr, RegistryError> {
        let raw = self.get_string(keys::IPV4_PREFIX_KEY).await?;
        raw.parse()
            .map_err(|e| RegistryError::InvalidPrefix(format!("{raw}: {e}")))
    }

    pub async fn get_ipv6_prefix(&self) -> Result<Ipv6Cidr, RegistryError> {
        let raw = self.get_string(keys::IPV6_PREFIX_KEY).await?;
        raw.parse()
            .map_err(|e| RegistryError::InvalidPrefix(format!("{raw}: {e}")))
    }

    pub async fn get_mesh_domain(&self) -> Result<String, RegistryError> {
        self.get_string(keys::MESH_DOMAIN_KEY).await
    }

    /// Write all three settings. Called once when the cluster bootstraps.
    pub async fn bootstrap(&self, settings: &MeshSettings) -> Result<(), RegistryError> {
        self.storage
            .put(
                keys::IPV4_PREFIX_KEY,
                Bytes::from(settings.ipv4_prefix.to_string()),
            )
            .await?;
        self.storage
            .put(
                keys::IPV6_PREFIX_KEY,
                Bytes::from(settings.ipv6_prefix.to_string()),
            )
            .await?;
        self.storage
            .put(keys::MESH_DOMAIN_KEY, Bytes::from(settings.domain.clone()))
            .await?;
        Ok(())
    }

    /// Public control RPC addresses of every node with a primary endpoint,
    /// keyed by node id.
    pub async fn list_public_rpc_addrs(
        &self,
    ) -> Result<HashMap<String, SocketAddr>, RegistryError> {
        let nodes = Peers::new(self.storage.clone()).list_public().await?;
        let mut out = HashMap::with_capacity(nodes.len());
        for node in nodes {
            if let Some(endpoint) = node.primary_endpoint {
                out.insert(node.id, SocketAddr::new(endpoint, node.rpc_port));
            }
        }
        Ok(out)
    }

    /// Public control RPC addresses excluding `node_id`.
    pub async fn list_peer_public_rpc_addrs(
        &self,
        node_id: &str,
    ) -> Result<HashMap<String, SocketAddr>, RegistryError> {
        let mut addrs = self.list_public_rpc_addrs().await?;
        addrs.remove(node_id);
        Ok(addrs)
    }

    /// Overlay (in-mesh) control RPC addresses excluding `node_id`, IPv4
    /// preferred when the peer holds a lease.
    pub async fn list_peer_private_rpc_addrs(
        &self,
        node_id: &str,
    ) -> Result<HashMap<String, SocketAddr>, RegistryError> {
        let nodes = Peers::new(self.storage.clone()).list_excluding(node_id).await?;
        let mut out = HashMap::with_capacity(nodes.len());
        for node in nodes {
            let addr = match node.overlay_v4_addr() {
                Some(v4) => IpAddr::V4(v4),
                None => IpAddr::V6(node.overlay_v6_addr()),
            };
            out.insert(node.id, SocketAddr::new(addr, node.rpc_port));
        }
        Ok(out)
    }

    async fn get_string(&self, key: &str) -> Result<String, RegistryError> {
        let value = self.storage.get(key).await?;
        String::from_utf8(value.to_vec()).map_err(|e| RegistryError::InvalidRecord(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_storage::MemoryStorage;

    #[tokio::test]
    async fn test_bootstrap_and_read_back() {
        let state = MeshState::new(MemoryStorage::new());
        let settings = MeshSettings {
            ipv4_prefix: "172.16.0.0/16".parse().unwrap(),
            ipv6_prefix: "fd00::/48".parse().unwrap(),
            domain: "ember.internal".to_string(),
        };
        state.bootstrap(&settings).await.unwrap();

        assert_eq!(state.get_ipv4_prefix().await.unwrap(), settings.ipv4_prefix);
        assert_eq!(state.get_ipv6_prefix().await.unwrap(), settings.ipv6_prefix);
        assert_eq!(state.get_mesh_domain().await.unwrap(), "ember.internal");
    }

    #[tokio::test]
    async fn test_unbootstrapped_state_is_not_found() {
        let state: MeshState<MemoryStorage> = MeshState::new(MemoryStorage::new());
        assert!(state.get_ipv4_prefix().await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_rpc_address_listings() {
        let storage = MemoryStorage::new();
        let peers = Peers::new(storage.clone());

        let mut public = crate::CreatePeerOptions {
            id: "gateway".to_string(),
            public_key: crate::PublicKey::from_bytes([1u8; 32]),
            primary_endpoint: Some("203.0.113.9".parse().unwrap()),
            endpoints: Vec::new(),
            rpc_port: 8443,
            consensus_port: 9443,
            tunnel_port: 51820,
            overlay_v6: "fd00::9/128".parse().unwrap(),
        };
        peers.create(public.clone()).await.unwrap();

        public.id = "hidden".to_string();
        public.primary_endpoint = None;
        public.overlay_v6 = "fd00::a/128".parse().unwrap();
        peers.create(public).await.unwrap();

        let state = MeshState::new(storage);
        let addrs = state.list_public_rpc_addrs().await.unwrap();
        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs["gateway"], "203.0.113.9:8443".parse().unwrap());

        let excluded = state.list_peer_public_rpc_addrs("gateway").await.unwrap();
        assert!(excluded.is_empty());

        let private = state.list_peer_private_rpc_addrs("gateway").await.unwrap();
        assert_eq!(private.len(), 1);
        assert_eq!(private["hidden"], "[fd00::a]:8443".parse().unwrap());
    }
}
