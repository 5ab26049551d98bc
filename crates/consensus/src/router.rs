//! In-process replication transport.
//!
//! Raft RPCs between engines in the same process ride per-node mailboxes
//! registered in a shared [`RaftRouter`]. Any reliable byte-stream transport
//! can replace it without touching the engine; the router is the canonical
//! transport for tests and embedded deployments, and the `host:port`
//! transport address travels as [`openraft::BasicNode`] metadata.
//!
//! Delivery failures on the append-entries path double as the heartbeat
//! suspicion signal: the per-target network reports them to the engine's
//! [`ObservationHub`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use openraft::error::{InstallSnapshotError, RPCError, RaftError};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::{BasicNode, Raft};
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::{ObservationHub, TypeConfig};

const RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// An inbound raft RPC with its reply channel.
pub(crate) enum Inbound {
    Vote(
        VoteRequest<TypeConfig>,
        oneshot::Sender<Result<VoteResponse<TypeConfig>, String>>,
    ),
    AppendEntries(
        AppendEntriesRequest<TypeConfig>,
        oneshot::Sender<Result<AppendEntriesResponse<TypeConfig>, String>>,
    ),
    InstallSnapshot(
        InstallSnapshotRequest<TypeConfig>,
        oneshot::Sender<Result<InstallSnapshotResponse<TypeConfig>, String>>,
    ),
}

/// Shared registry of per-node raft mailboxes.
#[derive(Clone, Default)]
pub struct RaftRouter {
    inner: Arc<RwLock<HashMap<String, mpsc::UnboundedSender<Inbound>>>>,
}

impl RaftRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, id: &str, tx: mpsc::UnboundedSender<Inbound>) {
        self.inner.write().insert(id.to_string(), tx);
    }

    pub(crate) fn deregister(&self, id: &str) {
        self.inner.write().remove(id);
    }

    fn sender(&self, id: &str) -> Option<mpsc::UnboundedSender<Inbound>> {
        self.inner.read().get(id).cloned()
    }
}

impl std::fmt::Debug for RaftRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftRouter")
            .field("nodes", &self.inner.read().len())
            .finish()
    }
}

/// Drain `rx`, dispatching inbound RPCs into the local raft instance.
pub(crate) fn spawn_inbox(
    raft: Raft<TypeConfig>,
    mut rx: mpsc::UnboundedReceiver<Inbound>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(inbound) = rx.recv().await {
            match inbound {
                Inbound::Vote(rpc, reply) => {
                    let result = raft.vote(rpc).await.map_err(|e| e.to_string());
                    let _ = reply.send(result);
                }
                Inbound::AppendEntries(rpc, reply) => {
                    let result = raft.append_entries(rpc).await.map_err(|e| e.to_string());
                    let _ = reply.send(result);
                }
                Inbound::InstallSnapshot(rpc, reply) => {
                    let result = raft.install_snapshot(rpc).await.map_err(|e| e.to_string());
                    let _ = reply.send(result);
                }
            }
        }
    })
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct RouterError(String);

/// Factory handing out per-target [`RouterNetwork`] instances.
pub(crate) struct RouterNetworkFactory {
    router: RaftRouter,
    hub: Arc<ObservationHub>,
}

impl RouterNetworkFactory {
    pub(crate) fn new(router: RaftRouter, hub: Arc<ObservationHub>) -> Self {
        Self { router, hub }
    }
}

impl RaftNetworkFactory<TypeConfig> for RouterNetworkFactory {
    type Network = RouterNetwork;

    async fn new_client(&mut self, target: String, _node: &BasicNode) -> Self::Network {
        RouterNetwork {
            router: self.router.clone(),
            hub: self.hub.clone(),
            target,
        }
    }
}

/// Raft network bound to a single target node.
pub(crate) struct RouterNetwork {
    router: RaftRouter,
    hub: Arc<ObservationHub>,
    target: String,
}

impl RouterNetwork {
    async fn call<Req, Resp>(
        &self,
        request: Req,
        wrap: impl FnOnce(Req, oneshot::Sender<Result<Resp, String>>) -> Inbound,
    ) -> Result<Resp, RouterError> {
        let tx = self
            .router
            .sender(&self.target)
            .ok_or_else(|| RouterError(format!("no route to {}", self.target)))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(wrap(request, reply_tx))
            .map_err(|_| RouterError(format!("mailbox closed for {}", self.target)))?;

        match tokio::time::timeout(RPC_TIMEOUT, reply_rx).await {
            Ok(Ok(Ok(response))) => Ok(response),
            Ok(Ok(Err(e))) => Err(RouterError(e)),
            Ok(Err(_)) => Err(RouterError(format!("{} dropped the request", self.target))),
            Err(_) => Err(RouterError(format!("rpc to {} timed out", self.target))),
        }
    }
}

impl RaftNetwork<TypeConfig> for RouterNetwork {
    async fn vote(
        &mut self,
        rpc: VoteRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<VoteResponse<TypeConfig>, RPCError<TypeConfig, RaftError<TypeConfig>>> {
        debug!(target = %self.target, "sending vote request");
        self.call(rpc, Inbound::Vote)
            .await
            .map_err(|e| RPCError::Network(openraft::error::NetworkError::new(&e)))
    }

    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<TypeConfig>, RPCError<TypeConfig, RaftError<TypeConfig>>>
    {
        match self.call(rpc, Inbound::AppendEntries).await {
            Ok(response) => {
                self.hub.report_reachable(&self.target);
                Ok(response)
            }
            Err(e) => {
                warn!(target = %self.target, error = %e, "append entries delivery failed");
                self.hub.report_unreachable(&self.target);
                Err(RPCError::Network(openraft::error::NetworkError::new(&e)))
            }
        }
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<TypeConfig>,
        RPCError<TypeConfig, RaftError<TypeConfig, InstallSnapshotError>>,
    > {
        debug!(target = %self.target, "sending install snapshot request");
        self.call(rpc, Inbound::InstallSnapshot)
            .await
            .map_err(|e| RPCError::Network(openraft::error::NetworkError::new(&e)))
    }
}
