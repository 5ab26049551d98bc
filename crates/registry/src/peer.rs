//! The node record and its wire rendering.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use cidr::{Ipv4Cidr, Ipv6Cidr};
use serde::{Deserialize, Serialize};

use crate::RegistryError;

/// A node's 32-byte public key for the encrypted tunnel, rendered as hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse a hex-encoded 32-byte key.
    pub fn parse(s: &str) -> Result<Self, RegistryError> {
        let bytes = hex::decode(s)
            .map_err(|e| RegistryError::InvalidRecord(format!("public key: {e}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| RegistryError::InvalidRecord("public key must be 32 bytes".to_string()))?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl TryFrom<String> for PublicKey {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s).map_err(|e| e.to_string())
    }
}

impl From<PublicKey> for String {
    fn from(key: PublicKey) -> Self {
        key.to_string()
    }
}

/// A registered mesh node.
///
/// `overlay_v6` is assigned at first join and never changes for the lifetime
/// of the id. `overlay_v4` is present only when the node requested an IPv4
/// lease. The record encodes deterministically (fixed field order) so
/// consensus snapshots are reproducible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Unique, caller-chosen, immutable id.
    pub id: String,
    /// Current public key for the encrypted tunnel.
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
    /// Overlay IPv4 lease (/32), when assigned.
    pub overlay_v4: Option<Ipv4Cidr>,
    /// Overlay IPv6 address (/128) inside the mesh ULA prefix.
    pub overlay_v6: Ipv6Cidr,
    /// Last-heartbeat timestamp, unix seconds.
    pub updated_at: u64,
}

impl Peer {
    /// The bare overlay IPv4 address, when leased.
    pub fn overlay_v4_addr(&self) -> Option<Ipv4Addr> {
        self.overlay_v4.map(|cidr| cidr.first_address())
    }

    /// The bare overlay IPv6 address.
    pub fn overlay_v6_addr(&self) -> Ipv6Addr {
        self.overlay_v6.first_address()
    }

    /// The consensus transport address for this node.
    ///
    /// IPv4 is preferred when a lease exists, unless the node asked for IPv6
    /// replication. A single IPv4-only node currently forces IPv4 per-join
    /// rather than mesh-wide; the toggle is deliberate.
    pub fn consensus_addr(&self, prefer_v6: bool) -> String {
        match self.overlay_v4_addr() {
            Some(v4) if !prefer_v6 => {
                SocketAddr::new(IpAddr::V4(v4), self.consensus_port).to_string()
            }
            _ => SocketAddr::new(IpAddr::V6(self.overlay_v6_addr()), self.consensus_port)
                .to_string(),
        }
    }

    /// Render for a join response, with endpoints joined to the tunnel port.
    pub fn wire(&self) -> WirePeer {
        WirePeer {
            id: self.id.clone(),
            public_key: self.public_key.to_string(),
            primary_endpoint: self
                .primary_endpoint
                .map(|ip| SocketAddr::new(ip, self.tunnel_port).to_string()),
            endpoints: self
                .endpoints
                .iter()
                .map(|ip| SocketAddr::new(*ip, self.tunnel_port).to_string())
                .collect(),
            address_v4: self.overlay_v4,
            address_v6: self.overlay_v6,
        }
    }
}

/// Fields for registering a new peer.
#[derive(Debug, Clone)]
pub struct CreatePeerOptions {
    pub id: String,
    pub public_key: PublicKey,
    pub primary_endpoint: Option<IpAddr>,
    pub endpoints: Vec<IpAddr>,
    pub rpc_port: u16,
    pub consensus_port: u16,
    pub tunnel_port: u16,
    pub overlay_v6: Ipv6Cidr,
}

/// A peer as rendered in join responses: everything another node needs to
/// program its tunnel interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePeer {
    pub id: String,
    pub public_key: String,
    /// `ip:tunnel_port`, absent when the peer has no public endpoint.
    pub primary_endpoint: Option<String>,
    pub endpoints: Vec<String>,
    pub address_v4: Option<Ipv4Cidr>,
    pub address_v6: Ipv6Cidr,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_peer() -> Peer {
        Peer {
            id: "a".to_string(),
            public_key: PublicKey::from_bytes([7u8; 32]),
            primary_endpoint: Some("203.0.113.10".parse().unwrap()),
            endpoints: vec!["2001:db8::10".parse().unwrap()],
            rpc_port: 8443,
            consensus_port: 9443,
            tunnel_port: 51820,
            overlay_v4: Some("172.16.0.1/32".parse().unwrap()),
            overlay_v6: "fd00::1/128".parse().unwrap(),
            updated_at: 0,
        }
    }

    #[test]
    fn test_public_key_round_trip() {
        let key = PublicKey::from_bytes([42u8; 32]);
        let parsed = PublicKey::parse(&key.to_string()).unwrap();
        assert_eq!(key, parsed);
    }

    #[test]
    fn test_public_key_rejects_wrong_length() {
        assert!(PublicKey::parse("abcd").is_err());
        assert!(PublicKey::parse("not hex at all").is_err());
    }

    #[test]
    fn test_consensus_addr_prefers_ipv4() {
        let peer = test_peer();
        assert_eq!(peer.consensus_addr(false), "172.16.0.1:9443");
        assert_eq!(peer.consensus_addr(true), "[fd00::1]:9443");
    }

    #[test]
    fn test_consensus_addr_without_lease_uses_ipv6() {
        let mut peer = test_peer();
        peer.overlay_v4 = None;
        assert_eq!(peer.consensus_addr(false), "[fd00::1]:9443");
    }

    #[test]
    fn test_wire_rendering_joins_tunnel_port() {
        let wire = test_peer().wire();
        assert_eq!(wire.primary_endpoint.as_deref(), Some("203.0.113.10:51820"));
        assert_eq!(wire.endpoints, vec!["[2001:db8::10]:51820".to_string()]);
    }

    #[test]
    fn test_record_encoding_is_stable() {
        let a = serde_json::to_vec(&test_peer()).unwrap();
        let b = serde_json::to_vec(&test_peer()).unwrap();
        assert_eq!(a, b);
    }
}
