//! The consensus engine: raft lifecycle, membership mutation, observations.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use openraft::error::{ClientWriteError, RaftError};
use openraft::{BasicNode, ChangeMembers, Raft};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use crate::router::{spawn_inbox, RouterNetworkFactory};
use crate::{
    ConsensusStorage, EngineError, MemoryRaftStorage, Observation, ObservationHub, RaftRouter,
    RegistryCommand, Suffrage, TypeConfig,
};

/// Configuration for a [`ConsensusEngine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// This node's caller-chosen, immutable id.
    pub id: String,
    /// Transport address (`host:port`) advertised to the consensus group.
    pub addr: String,
    /// Leader heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Election timeout lower bound in milliseconds.
    pub election_timeout_min_ms: u64,
    /// Election timeout upper bound in milliseconds.
    pub election_timeout_max_ms: u64,
}

impl EngineConfig {
    pub fn new(id: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            addr: addr.into(),
            heartbeat_interval_ms: 100,
            election_timeout_min_ms: 200,
            election_timeout_max_ms: 400,
        }
    }
}

/// Leader-based consensus engine over the registry log.
///
/// Cloning is cheap; all clones share the same raft instance, materialized
/// view, and observation hub.
#[derive(Clone)]
pub struct ConsensusEngine {
    id: String,
    addr: String,
    raft: Raft<TypeConfig>,
    store: MemoryRaftStorage,
    hub: Arc<ObservationHub>,
    router: RaftRouter,
}

impl ConsensusEngine {
    /// Create an engine and register its mailbox with `router`.
    ///
    /// The engine is idle until [`bootstrap`](Self::bootstrap) forms a new
    /// cluster or an existing leader admits it via
    /// [`add_voter`](Self::add_voter) / [`add_non_voter`](Self::add_non_voter).
    pub async fn new(config: EngineConfig, router: RaftRouter) -> Result<Self, EngineError> {
        let raft_config = openraft::Config {
            cluster_name: "ember".to_string(),
            heartbeat_interval: config.heartbeat_interval_ms,
            election_timeout_min: config.election_timeout_min_ms,
            election_timeout_max: config.election_timeout_max_ms,
            ..Default::default()
        };
        let raft_config = Arc::new(
            raft_config
                .validate()
                .map_err(|e| EngineError::InvalidOperation(format!("raft config: {e}")))?,
        );

        let store = MemoryRaftStorage::default();
        let hub = Arc::new(ObservationHub::new());
        let network = RouterNetworkFactory::new(router.clone(), hub.clone());

        let raft = Raft::new(
            config.id.clone(),
            raft_config,
            network,
            store.clone(),
            store.clone(),
        )
        .await
        .map_err(|e| EngineError::Raft(format!("failed to create raft instance: {e}")))?;

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        router.register(&config.id, inbox_tx);
        spawn_inbox(raft.clone(), inbox_rx);
        spawn_metrics_watcher(raft.clone(), hub.clone());

        Ok(Self {
            id: config.id,
            addr: config.addr,
            raft,
            store,
            hub,
            router,
        })
    }

    /// This node's id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// This node's advertised transport address.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Form a new single-node cluster with this node as the sole voter.
    pub async fn bootstrap(&self) -> Result<(), EngineError> {
        info!(id = %self.id, "bootstrapping single-node cluster");
        let members = BTreeMap::from([(
            self.id.clone(),
            BasicNode {
                addr: self.addr.clone(),
            },
        )]);
        self.raft
            .initialize(members)
            .await
            .map_err(|e| EngineError::Raft(format!("failed to initialize cluster: {e}")))?;
        Ok(())
    }

    /// Whether this node currently holds leadership.
    pub fn is_leader(&self) -> bool {
        let metrics = self.raft.metrics();
        let metrics = metrics.borrow();
        metrics.current_leader.as_deref() == Some(self.id.as_str())
    }

    /// The current leader's id, if one is known.
    pub fn current_leader(&self) -> Option<String> {
        self.raft.metrics().borrow().current_leader.clone()
    }

    /// Block until a leader is elected or `timeout` elapses.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<(), EngineError> {
        self.raft
            .wait(Some(timeout))
            .metrics(|m| m.current_leader.is_some(), "leader elected")
            .await
            .map_err(|e| EngineError::Raft(e.to_string()))?;
        Ok(())
    }

    /// Current `(voters, non-voters)` of the consensus group.
    pub fn membership(&self) -> (BTreeSet<String>, BTreeSet<String>) {
        let metrics = self.raft.metrics();
        let metrics = metrics.borrow();
        let membership = metrics.membership_config.membership();
        (
            membership.voter_ids().collect(),
            membership.learner_ids().collect(),
        )
    }

    /// Propose a registry mutation through the log.
    ///
    /// Returns the applied log index. Fails with [`EngineError::NotLeader`]
    /// on a follower.
    pub async fn propose(&self, command: RegistryCommand) -> Result<u64, EngineError> {
        let response = self
            .raft
            .client_write(command)
            .await
            .map_err(map_write_error)?;
        if let Some(error) = response.data.error {
            return Err(EngineError::InvalidOperation(error));
        }
        Ok(response.log_id.index)
    }

    /// Admit `id` as a voting member reachable at `addr`.
    ///
    /// The node is first added as a learner so it can catch up, then promoted
    /// in a joint membership change.
    pub async fn add_voter(&self, id: &str, addr: &str) -> Result<(), EngineError> {
        let (voters, _) = self.membership();
        if voters.contains(id) {
            debug!(peer = %id, "already a voter");
            return Ok(());
        }

        info!(peer = %id, %addr, "adding voter to consensus group");
        let node = BasicNode {
            addr: addr.to_string(),
        };
        self.raft
            .add_learner(id.to_string(), node, true)
            .await
            .map_err(map_write_error)?;

        let (mut voters, _) = self.membership();
        voters.insert(id.to_string());
        self.raft
            .change_membership(voters, false)
            .await
            .map_err(map_write_error)?;
        Ok(())
    }

    /// Admit `id` as a non-voting (replicating) member reachable at `addr`.
    pub async fn add_non_voter(&self, id: &str, addr: &str) -> Result<(), EngineError> {
        let (voters, learners) = self.membership();
        if voters.contains(id) || learners.contains(id) {
            debug!(peer = %id, "already a member");
            return Ok(());
        }

        info!(peer = %id, %addr, "adding non-voter to consensus group");
        let node = BasicNode {
            addr: addr.to_string(),
        };
        self.raft
            .add_learner(id.to_string(), node, true)
            .await
            .map_err(map_write_error)?;
        Ok(())
    }

    /// Remove `id` from the consensus group.
    ///
    /// Without `force`, removing a node that is not a member is an error;
    /// with it, the removal is a no-op. The heartbeat purge forces.
    pub async fn remove_server(&self, id: &str, force: bool) -> Result<(), EngineError> {
        info!(peer = %id, force, "removing server from consensus group");
        let (voters, learners) = self.membership();

        if !force && !voters.contains(id) && !learners.contains(id) {
            return Err(EngineError::InvalidOperation(format!(
                "{id} is not a member of the consensus group"
            )));
        }

        if voters.contains(id) {
            if voters.len() == 1 {
                return Err(EngineError::InvalidOperation(
                    "cannot remove the last voter".to_string(),
                ));
            }
            let mut remaining = voters;
            remaining.remove(id);
            self.raft
                .change_membership(remaining, false)
                .await
                .map_err(map_write_error)?;
        }

        let (_, learners) = self.membership();
        if learners.contains(id) {
            let nodes = BTreeSet::from([id.to_string()]);
            self.raft
                .change_membership(ChangeMembers::RemoveNodes(nodes), false)
                .await
                .map_err(map_write_error)?;
        }
        Ok(())
    }

    /// Subscribe to the observation stream.
    pub fn observe(&self) -> broadcast::Receiver<Observation> {
        self.hub.observe()
    }

    /// The engine's observation hub. The replication transport reports
    /// heartbeat state here; tests inject observations through it.
    pub fn hub(&self) -> &ObservationHub {
        &self.hub
    }

    /// The consensus-backed [`ember_storage::Storage`] over this engine.
    pub fn storage(&self) -> ConsensusStorage {
        ConsensusStorage::new(self.clone())
    }

    pub(crate) fn view(&self) -> &ember_storage::MemoryStorage {
        self.store.view()
    }

    /// Leave the router and stop the raft instance.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.router.deregister(&self.id);
        self.raft
            .shutdown()
            .await
            .map_err(|e| EngineError::Raft(format!("raft shutdown failed: {e}")))?;
        Ok(())
    }
}

impl std::fmt::Debug for ConsensusEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusEngine")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

fn map_write_error(
    error: RaftError<TypeConfig, ClientWriteError<TypeConfig>>,
) -> EngineError {
    match error {
        RaftError::APIError(ClientWriteError::ForwardToLeader(forward)) => {
            EngineError::NotLeader {
                leader: forward.leader_id,
            }
        }
        other => EngineError::Raft(other.to_string()),
    }
}

/// Diff raft metrics into [`Observation`]s.
///
/// Runs until the raft instance shuts down. The current state is diffed
/// before the first wait so a bootstrap membership is observed too.
fn spawn_metrics_watcher(
    raft: Raft<TypeConfig>,
    hub: Arc<ObservationHub>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut rx = raft.metrics();
        let mut last_leader: Option<String> = None;
        let mut last_voters: BTreeSet<String> = BTreeSet::new();
        let mut last_learners: BTreeSet<String> = BTreeSet::new();

        loop {
            let (leader, voters, learners) = {
                let metrics = rx.borrow();
                let membership = metrics.membership_config.membership();
                (
                    metrics.current_leader.clone(),
                    membership.voter_ids().collect::<BTreeSet<String>>(),
                    membership.learner_ids().collect::<BTreeSet<String>>(),
                )
            };

            if leader != last_leader {
                if let Some(leader) = &leader {
                    debug!(%leader, "observed leadership change");
                    hub.emit(Observation::LeaderChange {
                        leader: leader.clone(),
                    });
                }
                last_leader = leader;
            }

            for id in voters.difference(&last_voters) {
                hub.emit(Observation::PeerChange {
                    id: id.clone(),
                    suffrage: Suffrage::Voter,
                    removed: false,
                });
            }
            for id in learners.difference(&last_learners) {
                // A promotion is reported as a voter change, not a new learner.
                if !last_voters.contains(id) && !voters.contains(id) {
                    hub.emit(Observation::PeerChange {
                        id: id.clone(),
                        suffrage: Suffrage::NonVoter,
                        removed: false,
                    });
                }
            }
            for id in last_voters.difference(&voters) {
                if !learners.contains(id) {
                    hub.emit(Observation::PeerChange {
                        id: id.clone(),
                        suffrage: Suffrage::Voter,
                        removed: true,
                    });
                }
            }
            for id in last_learners.difference(&learners) {
                if !voters.contains(id) && !last_voters.contains(id) {
                    hub.emit(Observation::PeerChange {
                        id: id.clone(),
                        suffrage: Suffrage::NonVoter,
                        removed: true,
                    });
                }
            }

            last_voters = voters;
            last_learners = learners;

            if rx.changed().await.is_err() {
                break;
            }
        }
    })
}
