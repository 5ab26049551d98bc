//! Mesh store configuration.

use std::net::IpAddr;

use cidr::{Ipv4Cidr, Ipv6Cidr};
use ember_registry::{PublicKey, StaticLease};

/// Settings for forming a brand-new mesh.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Whether this node may form a new cluster.
    pub enabled: bool,
    /// Mesh-wide IPv4 CIDR.
    pub ipv4_prefix: Ipv4Cidr,
    /// Mesh-wide IPv6 ULA prefix.
    pub ipv6_prefix: Ipv6Cidr,
    /// DNS suffix for the mesh.
    pub mesh_domain: String,
    /// Configured `id → prefix` IPv4 assignments, held forever.
    pub static_leases: Vec<StaticLease>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ipv4_prefix: Ipv4Cidr::new(std::net::Ipv4Addr::new(172, 16, 0, 0), 16)
                .expect("valid default prefix"),
            ipv6_prefix: Ipv6Cidr::new(std::net::Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 0), 48)
                .expect("valid default prefix"),
            mesh_domain: "ember.internal".to_string(),
            static_leases: Vec::new(),
        }
    }
}

/// Configuration for a [`crate::MeshStore`].
#[derive(Debug, Clone)]
pub struct MeshStoreConfig {
    /// This node's unique, immutable id.
    pub node_id: String,
    /// This node's tunnel public key.
    pub public_key: PublicKey,
    /// Publicly routable address, when the node has one.
    pub primary_endpoint: Option<IpAddr>,
    /// Additional candidate addresses.
    pub endpoints: Vec<IpAddr>,
    /// Control RPC port.
    pub rpc_port: u16,
    /// Replication transport port.
    pub consensus_port: u16,
    /// Encrypted tunnel port.
    pub tunnel_port: u16,
    /// Consecutive failed heartbeats before the leader purges a peer.
    /// Zero disables the purge.
    pub heartbeat_purge_threshold: u32,
    /// New-mesh settings; ignored unless this node bootstraps.
    pub bootstrap: BootstrapConfig,
}

impl MeshStoreConfig {
    pub fn new(node_id: impl Into<String>, public_key: PublicKey) -> Self {
        Self {
            node_id: node_id.into(),
            public_key,
            primary_endpoint: None,
            endpoints: Vec::new(),
            rpc_port: 8443,
            consensus_port: 9443,
            tunnel_port: 51820,
            heartbeat_purge_threshold: 0,
            bootstrap: BootstrapConfig::default(),
        }
    }
}
