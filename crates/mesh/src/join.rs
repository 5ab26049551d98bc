//! The admission service: join and leave.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use cidr::Ipv6Cidr;
use ember_registry::{random_ipv6_host, CreatePeerOptions, Peer, PublicKey, WirePeer};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::reconciler::PeerReconciler;
use crate::watchers::MeshWatchers;
use crate::{MeshStore, ServiceError};

const DEFERRED_REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

/// Admission request from a joining node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Caller-chosen unique node id.
    pub id: String,
    /// Hex-encoded 32-byte tunnel public key.
    pub public_key: String,
    /// Publicly routable address, if the node has one.
    pub primary_endpoint: Option<String>,
    /// Additional candidate addresses.
    pub endpoints: Vec<String>,
    pub rpc_port: u16,
    pub consensus_port: u16,
    pub tunnel_port: u16,
    /// Request an overlay IPv4 lease.
    pub assign_ipv4: bool,
    /// Use IPv6 for the replication transport even when a lease exists.
    pub prefer_consensus_ipv6: bool,
    /// Join as a voting member rather than a non-voter.
    pub as_voter: bool,
}

/// Admission response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    /// The IPv4 lease, when one was requested.
    pub address_ipv4: Option<String>,
    /// The node's overlay IPv6 address.
    pub network_ipv6: String,
    /// Current peer topology, excluding the joiner.
    pub peers: Vec<WirePeer>,
}

/// Leave request; removes the node from the group and the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveRequest {
    pub id: String,
}

/// Leader-only admission endpoint.
#[derive(Debug, Clone)]
pub struct JoinService<R, W> {
    store: MeshStore<R, W>,
    /// Mesh IPv6 prefix, resolved lazily on first join.
    ipv6_prefix: Arc<Mutex<Option<Ipv6Cidr>>>,
}

impl<R: PeerReconciler, W: MeshWatchers> JoinService<R, W> {
    pub fn new(store: MeshStore<R, W>) -> Self {
        Self {
            store,
            ipv6_prefix: Arc::new(Mutex::new(None)),
        }
    }

    /// Admit a node to the mesh.
    ///
    /// Idempotent: repeating a join with identical fields leaves identical
    /// state and returns an equivalent response. Concurrent joins serialize
    /// through the consensus log.
    pub async fn join(&self, req: JoinRequest) -> Result<JoinResponse, ServiceError> {
        if !self.store.is_leader() {
            return Err(ServiceError::not_leader());
        }

        // Validate inputs before touching any state.
        if req.id.is_empty() {
            return Err(ServiceError::InvalidArgument("node id required".to_string()));
        }
        let public_key = PublicKey::parse(&req.public_key)
            .map_err(|e| ServiceError::InvalidArgument(format!("invalid public key: {e}")))?;
        let primary_endpoint = match &req.primary_endpoint {
            Some(raw) => Some(raw.parse::<IpAddr>().map_err(|e| {
                ServiceError::InvalidArgument(format!("invalid primary endpoint {raw}: {e}"))
            })?),
            None => None,
        };
        let mut endpoints = Vec::with_capacity(req.endpoints.len());
        for raw in &req.endpoints {
            endpoints.push(raw.parse::<IpAddr>().map_err(|e| {
                ServiceError::InvalidArgument(format!("invalid endpoint {raw}: {e}"))
            })?);
        }

        let ipv6_prefix = self.resolve_ipv6_prefix().await?;
        let peers = self.store.peers();

        // Upsert the node record.
        let mut peer = match peers.get(&req.id).await {
            Ok(mut existing) => {
                info!(id = %req.id, "peer already exists, checking for updates");
                let mut changed = false;
                if existing.public_key != public_key {
                    existing.public_key = public_key;
                    changed = true;
                }
                if existing.rpc_port != req.rpc_port {
                    existing.rpc_port = req.rpc_port;
                    changed = true;
                }
                if existing.consensus_port != req.consensus_port {
                    existing.consensus_port = req.consensus_port;
                    changed = true;
                }
                if existing.tunnel_port != req.tunnel_port {
                    existing.tunnel_port = req.tunnel_port;
                    changed = true;
                }
                if primary_endpoint.is_some() && existing.primary_endpoint != primary_endpoint {
                    existing.primary_endpoint = primary_endpoint;
                    changed = true;
                }
                if existing.endpoints != endpoints {
                    existing.endpoints = endpoints.clone();
                    changed = true;
                }
                if changed {
                    peers
                        .update(&existing)
                        .await
                        .map_err(|e| ServiceError::Internal(e.to_string()))?
                } else {
                    existing
                }
            }
            Err(e) if e.is_not_found() => {
                info!(id = %req.id, "registering new peer");
                let overlay_v6 = random_ipv6_host(ipv6_prefix)
                    .map_err(|e| ServiceError::Internal(e.to_string()))?;
                peers
                    .create(CreatePeerOptions {
                        id: req.id.clone(),
                        public_key,
                        primary_endpoint,
                        endpoints: endpoints.clone(),
                        rpc_port: req.rpc_port,
                        consensus_port: req.consensus_port,
                        tunnel_port: req.tunnel_port,
                        overlay_v6,
                    })
                    .await
                    .map_err(|e| ServiceError::Internal(e.to_string()))?
            }
            Err(e) => return Err(ServiceError::Internal(e.to_string())),
        };

        // Allocate the IPv4 lease, idempotently.
        let mut address_ipv4 = None;
        if req.assign_ipv4 {
            let lease = self
                .store
                .ipam()
                .acquire(&req.id)
                .await
                .map_err(|e| ServiceError::Internal(format!("failed to assign IPv4: {e}")))?;
            info!(id = %req.id, %lease, "assigned IPv4 address to peer");
            if peer.overlay_v4 != Some(lease) {
                peer.overlay_v4 = Some(lease);
                peer = peers
                    .update(&peer)
                    .await
                    .map_err(|e| ServiceError::Internal(e.to_string()))?;
            }
            address_ipv4 = Some(lease.to_string());
        }

        // Pick the replication transport address and admit the node.
        let consensus_addr = peer.consensus_addr(req.prefer_consensus_ipv6);
        let engine = self.store.engine();
        if req.as_voter {
            info!(id = %req.id, %consensus_addr, "adding voter to cluster");
            engine
                .add_voter(&req.id, &consensus_addr)
                .await
                .map_err(|e| ServiceError::Internal(format!("failed to add voter: {e}")))?;
        } else {
            info!(id = %req.id, %consensus_addr, "adding non-voter to cluster");
            engine
                .add_non_voter(&req.id, &consensus_addr)
                .await
                .map_err(|e| ServiceError::Internal(format!("failed to add non-voter: {e}")))?;
        }

        // Converge the tunnel peer table off the request path. The observer
        // will also converge it, so a miss here only delays things.
        let reconciler = self.store.reconciler().clone();
        tokio::spawn(async move {
            match tokio::time::timeout(DEFERRED_REFRESH_TIMEOUT, reconciler.refresh_peers()).await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "deferred peer table refresh failed"),
                Err(_) => warn!("deferred peer table refresh timed out"),
            }
        });

        let topology = peers
            .list_excluding(&req.id)
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))?;

        Ok(JoinResponse {
            address_ipv4,
            network_ipv6: peer.overlay_v6.to_string(),
            peers: topology.iter().map(Peer::wire).collect(),
        })
    }

    /// Remove a node from the consensus group and delete its registry state.
    pub async fn leave(&self, req: LeaveRequest) -> Result<(), ServiceError> {
        if !self.store.is_leader() {
            return Err(ServiceError::not_leader());
        }
        if req.id.is_empty() {
            return Err(ServiceError::InvalidArgument("node id required".to_string()));
        }

        info!(id = %req.id, "removing node from mesh");
        self.store
            .engine()
            .remove_server(&req.id, false)
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        self.store
            .ipam()
            .release(&req.id)
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        self.store
            .peers()
            .delete(&req.id)
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn resolve_ipv6_prefix(&self) -> Result<Ipv6Cidr, ServiceError> {
        if let Some(prefix) = *self.ipv6_prefix.lock() {
            return Ok(prefix);
        }
        let prefix = self
            .store
            .mesh_state()
            .get_ipv6_prefix()
            .await
            .map_err(|e| ServiceError::Internal(format!("failed to get IPv6 prefix: {e}")))?;
        *self.ipv6_prefix.lock() = Some(prefix);
        Ok(prefix)
    }
}
