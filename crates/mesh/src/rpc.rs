//! Framed control RPC.
//!
//! Requests and responses are postcard-encoded enums over length-delimited
//! frames, so the same server logic runs over a TCP listener on the RPC port
//! or over any other reliable byte stream — including a campfire stream,
//! which is how a bootstrapping node speaks the join RPC before it has an
//! overlay address.

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

use ember_campfire::proxy::{
    SignalMessage, TunnelProxyClient, TunnelProxyServer, NEGOTIATION_TIMEOUT,
};

use crate::rbac::RbacEvaluator;
use crate::reconciler::PeerReconciler;
use crate::watchers::MeshWatchers;
use crate::{
    AdminService, Code, JoinRequest, JoinResponse, JoinService, LeaveRequest, MeshStore,
    ServiceError,
};

/// A control-plane request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcRequest {
    Join(JoinRequest),
    Leave(LeaveRequest),
    DeleteNetworkAcl { name: String },
    DeleteRoute { name: String },
    /// Open a tunnel data-channel negotiation on this connection.
    StartDataChannel { node_id: String },
}

/// A control-plane response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcResponse {
    Join(JoinResponse),
    Empty,
    Signal(SignalMessage),
    Error { code: Code, message: String },
}

fn error_response(error: &ServiceError) -> RpcResponse {
    RpcResponse::Error {
        code: error.code(),
        message: error.to_string(),
    }
}

fn encode<T: Serialize>(value: &T) -> std::io::Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(std::io::Error::other)
}

/// Serves the admission, admin, and data-channel surfaces.
#[derive(Debug, Clone)]
pub struct RpcServer<R, W, E> {
    store: MeshStore<R, W>,
    join: JoinService<R, W>,
    admin: AdminService<R, W, E>,
}

impl<R, W, E> RpcServer<R, W, E>
where
    R: PeerReconciler,
    W: MeshWatchers,
    E: RbacEvaluator,
{
    pub fn new(store: MeshStore<R, W>, rbac: E) -> Self {
        Self {
            join: JoinService::new(store.clone()),
            admin: AdminService::new(store.clone(), rbac),
            store,
        }
    }

    /// Accept and serve connections until the task is dropped.
    pub async fn serve_listener(self, listener: TcpListener) {
        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "rpc accept failed");
                    continue;
                }
            };
            debug!(%remote, "rpc connection");
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve_stream(stream).await {
                    debug!(%remote, error = %e, "rpc connection ended");
                }
            });
        }
    }

    /// Serve one connection over any reliable byte stream.
    pub async fn serve_stream<IO>(&self, io: IO) -> std::io::Result<()>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut framed = Framed::new(io, LengthDelimitedCodec::new());

        while let Some(frame) = framed.next().await {
            let frame = frame?;
            let request: RpcRequest = match postcard::from_bytes(&frame) {
                Ok(request) => request,
                Err(e) => {
                    let response = error_response(&ServiceError::InvalidArgument(format!(
                        "undecodable request: {e}"
                    )));
                    framed.send(encode(&response)?.into()).await?;
                    continue;
                }
            };

            let response = match request {
                RpcRequest::Join(req) => match self.join.join(req).await {
                    Ok(resp) => RpcResponse::Join(resp),
                    Err(e) => error_response(&e),
                },
                RpcRequest::Leave(req) => match self.join.leave(req).await {
                    Ok(()) => RpcResponse::Empty,
                    Err(e) => error_response(&e),
                },
                RpcRequest::DeleteNetworkAcl { name } => {
                    match self.admin.delete_network_acl(&name).await {
                        Ok(()) => RpcResponse::Empty,
                        Err(e) => error_response(&e),
                    }
                }
                RpcRequest::DeleteRoute { name } => match self.admin.delete_route(&name).await {
                    Ok(()) => RpcResponse::Empty,
                    Err(e) => error_response(&e),
                },
                RpcRequest::StartDataChannel { node_id } => {
                    debug!(%node_id, "starting data channel negotiation");
                    self.negotiate_data_channel(&mut framed).await?;
                    continue;
                }
            };
            framed.send(encode(&response)?.into()).await?;
        }
        Ok(())
    }

    /// Run the server side of the offer/answer exchange on this connection.
    ///
    /// Frames during negotiation carry bare [`SignalMessage`]s; normal RPC
    /// framing resumes afterwards.
    async fn negotiate_data_channel<IO>(
        &self,
        framed: &mut Framed<IO, LengthDelimitedCodec>,
    ) -> std::io::Result<()>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let proxy = match TunnelProxyServer::new(self.store.config().tunnel_port).await {
            Ok(proxy) => proxy,
            Err(e) => {
                let response = error_response(&ServiceError::Internal(e.to_string()));
                framed.send(encode(&response)?.into()).await?;
                return Ok(());
            }
        };

        let offer = RpcResponse::Signal(SignalMessage::Offer(proxy.offer().to_vec()));
        framed.send(encode(&offer)?.into()).await?;

        let negotiation = async {
            loop {
                let established = tokio::select! {
                    () = proxy.established() => true,
                    frame = framed.next() => {
                        let Some(frame) = frame else { return Ok(false) };
                        match postcard::from_bytes::<SignalMessage>(&frame?) {
                            Ok(SignalMessage::Answer(payload)) => {
                                if let Err(e) = proxy.answer(&payload) {
                                    warn!(error = %e, "bad data channel answer");
                                    return Ok(false);
                                }
                            }
                            Ok(SignalMessage::Candidate(candidate)) => {
                                if let Err(e) = proxy.add_candidate(&candidate) {
                                    warn!(error = %e, "bad data channel candidate");
                                }
                            }
                            Ok(other) => debug!(?other, "ignoring negotiation frame"),
                            Err(e) => {
                                warn!(error = %e, "undecodable negotiation frame");
                                return Ok(false);
                            }
                        }
                        false
                    }
                };
                if established {
                    framed
                        .send(encode(&SignalMessage::Established)?.into())
                        .await?;
                    return Ok::<_, std::io::Error>(true);
                }
            }
        };

        match tokio::time::timeout(NEGOTIATION_TIMEOUT, negotiation).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => {
                proxy.close().await;
                Ok(())
            }
            Ok(Err(e)) => {
                proxy.close().await;
                Err(e)
            }
            Err(_) => {
                warn!("data channel negotiation timed out");
                proxy.close().await;
                Ok(())
            }
        }
    }
}

/// Client for the control RPC, usable over any byte stream.
pub struct RpcClient<IO> {
    framed: Framed<IO, LengthDelimitedCodec>,
}

impl RpcClient<TcpStream> {
    /// Connect to a node's RPC port.
    pub async fn connect(addr: impl ToSocketAddrs) -> std::io::Result<Self> {
        Ok(Self::new(TcpStream::connect(addr).await?))
    }
}

impl<IO: AsyncRead + AsyncWrite + Unpin + Send> RpcClient<IO> {
    /// Wrap an established byte stream, e.g. a campfire stream.
    pub fn new(io: IO) -> Self {
        Self {
            framed: Framed::new(io, LengthDelimitedCodec::new()),
        }
    }

    pub async fn join(&mut self, request: JoinRequest) -> Result<JoinResponse, ServiceError> {
        match self.call(RpcRequest::Join(request)).await? {
            RpcResponse::Join(response) => Ok(response),
            other => Err(unexpected(other)),
        }
    }

    pub async fn leave(&mut self, request: LeaveRequest) -> Result<(), ServiceError> {
        match self.call(RpcRequest::Leave(request)).await? {
            RpcResponse::Empty => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn delete_network_acl(&mut self, name: &str) -> Result<(), ServiceError> {
        let request = RpcRequest::DeleteNetworkAcl {
            name: name.to_string(),
        };
        match self.call(request).await? {
            RpcResponse::Empty => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn delete_route(&mut self, name: &str) -> Result<(), ServiceError> {
        let request = RpcRequest::DeleteRoute {
            name: name.to_string(),
        };
        match self.call(request).await? {
            RpcResponse::Empty => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Negotiate a tunnel data channel with the serving node.
    ///
    /// On success the returned proxy bridges `127.0.0.1:tunnel_port` through
    /// the channel, and its local address is the endpoint the tunnel
    /// interface should use for the proxied peer.
    pub async fn start_data_channel(
        &mut self,
        node_id: &str,
        tunnel_port: u16,
    ) -> Result<TunnelProxyClient, ServiceError> {
        let negotiation = self.negotiate_data_channel(node_id, tunnel_port);
        match tokio::time::timeout(NEGOTIATION_TIMEOUT, negotiation).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::Internal(
                "timed out waiting for data channel to open".to_string(),
            )),
        }
    }

    async fn negotiate_data_channel(
        &mut self,
        node_id: &str,
        tunnel_port: u16,
    ) -> Result<TunnelProxyClient, ServiceError> {
        let request = RpcRequest::StartDataChannel {
            node_id: node_id.to_string(),
        };
        let offer = match self.call(request).await? {
            RpcResponse::Signal(SignalMessage::Offer(offer)) => offer,
            other => return Err(unexpected(other)),
        };

        let (proxy, answer) = TunnelProxyClient::connect(&offer, tunnel_port)
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))?;

        self.send_signal(&SignalMessage::Answer(answer)).await?;
        loop {
            let frame = self
                .framed
                .next()
                .await
                .ok_or_else(|| {
                    ServiceError::Internal("connection closed during negotiation".to_string())
                })?
                .map_err(|e| ServiceError::Internal(e.to_string()))?;
            match postcard::from_bytes::<SignalMessage>(&frame) {
                Ok(SignalMessage::Established) => return Ok(proxy),
                Ok(SignalMessage::Candidate(candidate)) => {
                    debug!(%candidate, "received data channel candidate");
                }
                Ok(other) => debug!(?other, "ignoring negotiation frame"),
                Err(e) => return Err(ServiceError::Internal(e.to_string())),
            }
        }
    }

    async fn send_signal(&mut self, signal: &SignalMessage) -> Result<(), ServiceError> {
        let bytes =
            postcard::to_allocvec(signal).map_err(|e| ServiceError::Internal(e.to_string()))?;
        self.framed
            .send(bytes.into())
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))
    }

    async fn call(&mut self, request: RpcRequest) -> Result<RpcResponse, ServiceError> {
        let bytes =
            postcard::to_allocvec(&request).map_err(|e| ServiceError::Internal(e.to_string()))?;
        self.framed
            .send(bytes.into())
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))?;

        let frame = self
            .framed
            .next()
            .await
            .ok_or_else(|| ServiceError::Internal("connection closed".to_string()))?
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        let response: RpcResponse =
            postcard::from_bytes(&frame).map_err(|e| ServiceError::Internal(e.to_string()))?;

        if let RpcResponse::Error { code, message } = response {
            return Err(ServiceError::from_code(code, message));
        }
        Ok(response)
    }
}

fn unexpected(response: RpcResponse) -> ServiceError {
    ServiceError::Internal(format!("unexpected response: {response:?}"))
}
