//! Typed accessors over the replicated mesh registry.
//!
//! Each accessor is a thin wrapper over [`ember_storage::Storage`]: peers,
//! IPv4 leases, network ACLs, routes, and the three mesh-wide settings.
//! Reads serve from the local replica; mutations inherit the storage layer's
//! leader-only semantics.

mod ipam;
mod networking;
mod peer;
mod peers;
mod state;

use ember_storage::StorageError;

pub use ipam::{random_ipv6_host, Ipam, StaticLease};
pub use networking::{
    is_system_acl, AclAction, NetworkAcl, Networking, Route, BOOTSTRAP_NODES_ACL, VOTERS_ACL,
};
pub use peer::{CreatePeerOptions, Peer, PublicKey, WirePeer};
pub use peers::Peers;
pub use state::{MeshSettings, MeshState};

/// Errors from registry accessors.
///
/// Storage errors pass through unchanged; the service layer maps them to
/// RPC codes at the boundary.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Underlying storage failure, including `NotLeader` and `NotFound`.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A stored record failed to decode.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// A prefix or address argument is malformed or out of range.
    #[error("invalid prefix: {0}")]
    InvalidPrefix(String),

    /// No free address remains in the mesh IPv4 prefix.
    #[error("ipv4 address pool exhausted")]
    PoolExhausted,

    /// An id or object name is malformed.
    #[error("invalid name: {0}")]
    InvalidName(String),
}

impl RegistryError {
    /// Whether this error is a lookup miss.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Storage(StorageError::NotFound))
    }
}
