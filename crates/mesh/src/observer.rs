//! Consensus observer: reconciles engine events into registry updates,
//! peer-table refreshes, and watcher events.

use std::collections::HashMap;
use std::time::Duration;

use ember_consensus::{ConsensusEngine, ConsensusStorage, Observation, Suffrage};
use ember_registry::Peers;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::reconciler::PeerReconciler;
use crate::watchers::{ClusterStatus, MeshEvent, MeshEventKind, MeshWatchers};

/// Bound on any blocking call made from the observer task.
const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Consume the engine's observation stream until it closes.
///
/// Observer errors are logged, never propagated back to the engine. The
/// `failed_heartbeats` counters are process-local by design: each replica
/// tracks its own view of connectivity, and only the leader acts on it.
pub(crate) fn spawn<R, W>(
    node_id: String,
    purge_threshold: u32,
    engine: ConsensusEngine,
    storage: ConsensusStorage,
    reconciler: R,
    watchers: W,
) -> tokio::task::JoinHandle<()>
where
    R: PeerReconciler,
    W: MeshWatchers,
{
    tokio::spawn(async move {
        let mut observations = engine.observe();
        let mut failed_heartbeats: HashMap<String, u32> = HashMap::new();

        loop {
            let observation = match observations.recv().await {
                Ok(observation) => observation,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "observer lagged behind the observation stream");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            debug!(?observation, "received observation");

            match observation {
                Observation::FailedHeartbeat { id } => {
                    handle_failed_heartbeat(
                        &id,
                        purge_threshold,
                        &mut failed_heartbeats,
                        &engine,
                        &storage,
                    )
                    .await;
                }
                Observation::ResumedHeartbeat { id } => {
                    if purge_threshold > 0 {
                        failed_heartbeats.remove(&id);
                    }
                }
                Observation::PeerChange {
                    id,
                    suffrage,
                    removed,
                } => {
                    if id == node_id {
                        continue;
                    }
                    handle_peer_change(&id, suffrage, removed, &storage, &reconciler, &watchers)
                        .await;
                }
                Observation::LeaderChange { leader } => {
                    handle_leader_change(&leader, &storage, &watchers).await;
                }
            }
        }
    })
}

async fn handle_failed_heartbeat(
    id: &str,
    purge_threshold: u32,
    failed_heartbeats: &mut HashMap<String, u32>,
    engine: &ConsensusEngine,
    storage: &ConsensusStorage,
) {
    if purge_threshold == 0 {
        return;
    }
    let counter = failed_heartbeats.entry(id.to_string()).or_insert(0);
    *counter += 1;
    debug!(peer = %id, count = *counter, "failed heartbeat");

    if *counter >= purge_threshold && engine.is_leader() {
        info!(peer = %id, "failed heartbeat threshold reached, removing peer");
        // The counter survives any failure here so the next event retries.
        if let Err(e) = engine.remove_server(id, true).await {
            warn!(peer = %id, error = %e, "failed to remove peer from consensus group");
            return;
        }
        if let Err(e) = Peers::new(storage.clone()).delete(id).await {
            warn!(peer = %id, error = %e, "failed to remove peer from registry");
            return;
        }
        failed_heartbeats.remove(id);
    }
}

async fn handle_peer_change<R, W>(
    id: &str,
    suffrage: Suffrage,
    removed: bool,
    storage: &ConsensusStorage,
    reconciler: &R,
    watchers: &W,
) where
    R: PeerReconciler,
    W: MeshWatchers,
{
    match tokio::time::timeout(CALL_TIMEOUT, reconciler.refresh_peers()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "peer table refresh failed"),
        Err(_) => warn!("peer table refresh timed out"),
    }

    if !watchers.has_watchers() {
        return;
    }
    let lookup = tokio::time::timeout(CALL_TIMEOUT, Peers::new(storage.clone()).get(id)).await;
    let node = match lookup {
        Ok(Ok(node)) => node,
        Ok(Err(e)) => {
            warn!(peer = %id, error = %e, "failed to look up peer, cannot emit event");
            return;
        }
        Err(_) => {
            warn!(peer = %id, "peer lookup timed out, cannot emit event");
            return;
        }
    };

    let (kind, status) = if removed {
        (MeshEventKind::NodeLeave, ClusterStatus::Unknown)
    } else {
        let status = match suffrage {
            Suffrage::Voter => ClusterStatus::Voter,
            Suffrage::NonVoter => ClusterStatus::NonVoter,
        };
        (MeshEventKind::NodeJoin, status)
    };
    watchers.emit(MeshEvent { kind, node, status });
}

async fn handle_leader_change<W: MeshWatchers>(
    leader: &str,
    storage: &ConsensusStorage,
    watchers: &W,
) {
    if !watchers.has_watchers() {
        return;
    }
    let lookup = tokio::time::timeout(CALL_TIMEOUT, Peers::new(storage.clone()).get(leader)).await;
    let node = match lookup {
        Ok(Ok(node)) => node,
        Ok(Err(e)) => {
            // On a fresh cluster the leader's record may not exist yet.
            debug!(%leader, error = %e, "failed to look up leader, cannot emit event");
            return;
        }
        Err(_) => {
            warn!(%leader, "leader lookup timed out, cannot emit event");
            return;
        }
    };
    watchers.emit(MeshEvent {
        kind: MeshEventKind::LeaderChange,
        node,
        status: ClusterStatus::Leader,
    });
}
