//! The mesh store: consensus engine + registry + observer, bound together.

use std::sync::Arc;
use std::time::Duration;

use ember_consensus::{ConsensusEngine, ConsensusStorage, EngineConfig, RaftRouter};
use ember_registry::{
    random_ipv6_host, AclAction, CreatePeerOptions, Ipam, MeshSettings, MeshState, NetworkAcl,
    Networking, Peers, BOOTSTRAP_NODES_ACL,
};
use tracing::info;

use crate::observer;
use crate::reconciler::PeerReconciler;
use crate::watchers::{ClusterStatus, MeshWatchers};
use crate::{MeshStoreConfig, ServiceError};

const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(10);

/// The mesh control-plane state for one node.
///
/// Owns the consensus engine and the observer that reconciles consensus
/// events into registry updates, peer-table refreshes, and watcher events.
/// Cloning shares all underlying state.
#[derive(Debug, Clone)]
pub struct MeshStore<R, W> {
    config: Arc<MeshStoreConfig>,
    engine: ConsensusEngine,
    storage: ConsensusStorage,
    reconciler: R,
    watchers: W,
}

impl<R: PeerReconciler, W: MeshWatchers> MeshStore<R, W> {
    /// Create the store, register with `router`, and install the observer.
    ///
    /// The node participates in nothing until it either
    /// [`bootstrap`](Self::bootstrap)s a new mesh or is admitted by a leader
    /// through the join service.
    pub async fn open(
        config: MeshStoreConfig,
        router: RaftRouter,
        reconciler: R,
        watchers: W,
    ) -> Result<Self, ServiceError> {
        let listen_addr = format!("[::]:{}", config.consensus_port);
        let engine = ConsensusEngine::new(EngineConfig::new(&config.node_id, listen_addr), router)
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        let storage = engine.storage();

        let store = Self {
            config: Arc::new(config),
            engine,
            storage,
            reconciler,
            watchers,
        };

        observer::spawn(
            store.config.node_id.clone(),
            store.config.heartbeat_purge_threshold,
            store.engine.clone(),
            store.storage.clone(),
            store.reconciler.clone(),
            store.watchers.clone(),
        );

        Ok(store)
    }

    /// Form a new single-node mesh: initialize consensus, write the mesh
    /// settings, pre-populate static leases, and register this node.
    pub async fn bootstrap(&self) -> Result<(), ServiceError> {
        let bootstrap = &self.config.bootstrap;
        if !bootstrap.enabled {
            return Err(ServiceError::FailedPrecondition(
                "bootstrap is not enabled for this node".to_string(),
            ));
        }

        self.engine
            .bootstrap()
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        self.engine
            .wait_for_leader(BOOTSTRAP_TIMEOUT)
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))?;

        self.mesh_state()
            .bootstrap(&MeshSettings {
                ipv4_prefix: bootstrap.ipv4_prefix,
                ipv6_prefix: bootstrap.ipv6_prefix,
                domain: bootstrap.mesh_domain.clone(),
            })
            .await?;
        self.ipam().preload(&bootstrap.static_leases).await?;

        let lease = self.ipam().acquire(&self.config.node_id).await?;
        let overlay_v6 = random_ipv6_host(bootstrap.ipv6_prefix)?;

        let peers = self.peers();
        let mut peer = peers
            .create(CreatePeerOptions {
                id: self.config.node_id.clone(),
                public_key: self.config.public_key,
                primary_endpoint: self.config.primary_endpoint,
                endpoints: self.config.endpoints.clone(),
                rpc_port: self.config.rpc_port,
                consensus_port: self.config.consensus_port,
                tunnel_port: self.config.tunnel_port,
                overlay_v6,
            })
            .await?;
        peer.overlay_v4 = Some(lease);
        peers.update(&peer).await?;

        // The bootstrap set is mutually reachable from the start.
        self.networking()
            .put_acl(&NetworkAcl {
                name: BOOTSTRAP_NODES_ACL.to_string(),
                priority: 0,
                action: AclAction::Accept,
                source_nodes: vec![self.config.node_id.clone()],
                destination_nodes: vec!["*".to_string()],
                source_cidrs: Vec::new(),
                destination_cidrs: Vec::new(),
            })
            .await?;

        info!(
            id = %self.config.node_id,
            %lease,
            ipv6 = %peer.overlay_v6,
            "mesh bootstrap complete"
        );
        Ok(())
    }

    /// This node's configuration.
    pub fn config(&self) -> &MeshStoreConfig {
        &self.config
    }

    /// The consensus engine.
    pub fn engine(&self) -> &ConsensusEngine {
        &self.engine
    }

    /// The consensus-backed storage.
    pub fn storage(&self) -> &ConsensusStorage {
        &self.storage
    }

    /// The peer-table reconciler this store drives.
    pub fn reconciler(&self) -> &R {
        &self.reconciler
    }

    /// The plugin watcher set.
    pub fn watchers(&self) -> &W {
        &self.watchers
    }

    /// Whether this node currently leads the consensus group.
    pub fn is_leader(&self) -> bool {
        self.engine.is_leader()
    }

    /// `id`'s role in the consensus group, as visible from this replica.
    pub fn cluster_status(&self, id: &str) -> ClusterStatus {
        if self.engine.current_leader().as_deref() == Some(id) {
            return ClusterStatus::Leader;
        }
        let (voters, learners) = self.engine.membership();
        if voters.contains(id) {
            ClusterStatus::Voter
        } else if learners.contains(id) {
            ClusterStatus::NonVoter
        } else {
            ClusterStatus::Unknown
        }
    }

    /// Typed peer accessor.
    pub fn peers(&self) -> Peers<ConsensusStorage> {
        Peers::new(self.storage.clone())
    }

    /// IPv4 lease allocator.
    pub fn ipam(&self) -> Ipam<ConsensusStorage> {
        Ipam::new(self.storage.clone())
    }

    /// Mesh-wide settings accessor.
    pub fn mesh_state(&self) -> MeshState<ConsensusStorage> {
        MeshState::new(self.storage.clone())
    }

    /// ACL and route accessor.
    pub fn networking(&self) -> Networking<ConsensusStorage> {
        Networking::new(self.storage.clone())
    }

    /// Stop the engine and leave the router.
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        self.engine
            .shutdown()
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))
    }
}
