//! Tunnel data-channel proxy.
//!
//! When two peers cannot reach each other directly on the tunnel port, a
//! local UDP socket on each side is bridged through a negotiated data
//! channel. The offer/answer (and optional candidate) exchange is mediated
//! by the control RPC stream; the channel itself is a direct QUIC stream.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use iroh::endpoint::{RecvStream, SendStream};
use iroh::{Endpoint, EndpointAddr};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::CampfireError;

/// ALPN for tunnel proxy channels.
pub const TUNNEL_ALPN: &[u8] = b"ember/tunnel/0";

/// Default copy buffer for each proxy direction.
pub const DEFAULT_PROXY_BUFFER: usize = 1024 * 1024;

/// Overall deadline for the offer/answer exchange to produce a channel.
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(15);

/// Stream preamble written by the dialing side before traffic flows.
const CHANNEL_PREAMBLE: &[u8; 8] = b"embertun";

/// Negotiation frames carried over the control stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SignalMessage {
    /// Server's session description: its serialized endpoint address.
    Offer(Vec<u8>),
    /// Client's session description.
    Answer(Vec<u8>),
    /// An additional candidate address, streamed as discovered.
    Candidate(String),
    /// The channel is connected; negotiation is over.
    Established,
}

/// Server side of a tunnel proxy: offers a channel that bridges to the local
/// tunnel socket on `target_port`.
pub struct TunnelProxyServer {
    endpoint: Endpoint,
    offer: Vec<u8>,
    ready: watch::Receiver<bool>,
    closed: watch::Receiver<bool>,
}

impl TunnelProxyServer {
    /// Create the proxy and compute its offer.
    ///
    /// The first matching connection is bridged to `127.0.0.1:target_port`;
    /// the proxy terminates when either direction sees EOF or a closed
    /// connection.
    pub async fn new(target_port: u16) -> Result<Self, CampfireError> {
        let endpoint = Endpoint::builder()
            .alpns(vec![TUNNEL_ALPN.to_vec()])
            .bind()
            .await
            .map_err(|e| CampfireError::Connect(e.to_string()))?;
        let offer = postcard::to_allocvec(&endpoint.addr())
            .map_err(|e| CampfireError::Encoding(e.to_string()))?;

        let (ready_tx, ready) = watch::channel(false);
        let (closed_tx, closed) = watch::channel(false);

        let accept_endpoint = endpoint.clone();
        tokio::spawn(async move {
            let Some(incoming) = accept_endpoint.accept().await else {
                let _ = closed_tx.send(true);
                return;
            };
            let conn = match incoming.accept() {
                Ok(connecting) => match connecting.await {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(error = %e, "tunnel channel setup failed");
                        let _ = closed_tx.send(true);
                        return;
                    }
                },
                Err(e) => {
                    error!(error = %e, "tunnel channel refused");
                    let _ = closed_tx.send(true);
                    return;
                }
            };
            let (send, mut recv) = match conn.accept_bi().await {
                Ok(streams) => streams,
                Err(e) => {
                    error!(error = %e, "failed to accept tunnel stream");
                    let _ = closed_tx.send(true);
                    return;
                }
            };

            let mut preamble = [0u8; CHANNEL_PREAMBLE.len()];
            match recv.read_exact(&mut preamble).await {
                Ok(()) if &preamble == CHANNEL_PREAMBLE => {}
                _ => {
                    warn!("tunnel channel preamble mismatch, dropping");
                    let _ = closed_tx.send(true);
                    return;
                }
            }

            debug!("server side tunnel channel opened");
            let _ = ready_tx.send(true);
            bridge_udp(send, recv, target_port, DEFAULT_PROXY_BUFFER).await;
            let _ = closed_tx.send(true);
        });

        Ok(Self {
            endpoint,
            offer,
            ready,
            closed,
        })
    }

    /// The offer to send to the peer.
    pub fn offer(&self) -> &[u8] {
        &self.offer
    }

    /// Apply the peer's answer.
    ///
    /// With a QUIC substrate the client dials us, so the answer only needs
    /// to decode; it is kept for parity with the negotiation contract.
    pub fn answer(&self, payload: &[u8]) -> Result<(), CampfireError> {
        let addr: EndpointAddr = postcard::from_bytes(payload)
            .map_err(|e| CampfireError::Encoding(e.to_string()))?;
        debug!(?addr, "received tunnel channel answer");
        Ok(())
    }

    /// Record an additional candidate address from the peer.
    pub fn add_candidate(&self, candidate: &str) -> Result<(), CampfireError> {
        let addr: SocketAddr = candidate
            .parse()
            .map_err(|e| CampfireError::Encoding(format!("candidate {candidate}: {e}")))?;
        debug!(%addr, "received tunnel channel candidate");
        Ok(())
    }

    /// Resolves once the channel is connected.
    pub async fn established(&self) {
        wait_flag(self.ready.clone()).await;
    }

    /// Resolves once the proxy has terminated.
    pub async fn closed(&self) {
        wait_flag(self.closed.clone()).await;
    }

    /// Tear the proxy down. Idempotent.
    pub async fn close(&self) {
        self.endpoint.close().await;
    }
}

/// Client side of a tunnel proxy.
pub struct TunnelProxyClient {
    endpoint: Endpoint,
    local_addr: SocketAddr,
    closed: watch::Receiver<bool>,
}

impl TunnelProxyClient {
    /// Dial the channel described by `offer` and bridge it to a fresh local
    /// UDP socket pointed at `127.0.0.1:tunnel_port`.
    ///
    /// Returns the proxy and the answer payload for the negotiation stream.
    pub async fn connect(
        offer: &[u8],
        tunnel_port: u16,
    ) -> Result<(Self, Vec<u8>), CampfireError> {
        let server_addr: EndpointAddr = postcard::from_bytes(offer)
            .map_err(|e| CampfireError::Encoding(e.to_string()))?;

        let endpoint = Endpoint::builder()
            .alpns(vec![TUNNEL_ALPN.to_vec()])
            .bind()
            .await
            .map_err(|e| CampfireError::Connect(e.to_string()))?;
        let answer = postcard::to_allocvec(&endpoint.addr())
            .map_err(|e| CampfireError::Encoding(e.to_string()))?;

        let conn = endpoint
            .connect(server_addr, TUNNEL_ALPN)
            .await
            .map_err(|e| CampfireError::Connect(e.to_string()))?;
        let (mut send, recv) = conn
            .open_bi()
            .await
            .map_err(|e| CampfireError::Connect(e.to_string()))?;
        send.write_all(CHANNEL_PREAMBLE)
            .await
            .map_err(|e| CampfireError::Connect(e.to_string()))?;
        send.flush()
            .await
            .map_err(|e| CampfireError::Connect(e.to_string()))?;

        let socket = UdpSocket::bind(("127.0.0.1", 0)).await?;
        socket.connect(("127.0.0.1", tunnel_port)).await?;
        let local_addr = socket.local_addr()?;

        let (closed_tx, closed) = watch::channel(false);
        tokio::spawn(async move {
            // The connection must outlive the bridge.
            let _conn = conn;
            debug!("client side tunnel channel opened");
            bridge_socket(send, recv, socket, DEFAULT_PROXY_BUFFER).await;
            let _ = closed_tx.send(true);
        });

        Ok((
            Self {
                endpoint,
                local_addr,
                closed,
            },
            answer,
        ))
    }

    /// The local UDP address the tunnel interface should use as its
    /// endpoint for the proxied peer.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Resolves once the proxy has terminated.
    pub async fn closed(&self) {
        wait_flag(self.closed.clone()).await;
    }

    /// Tear the proxy down. Idempotent.
    pub async fn close(&self) {
        self.endpoint.close().await;
    }
}

async fn wait_flag(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            break;
        }
    }
}

async fn bridge_udp(send: SendStream, recv: RecvStream, target_port: u16, buffer_size: usize) {
    let socket = match UdpSocket::bind(("127.0.0.1", 0)).await {
        Ok(socket) => socket,
        Err(e) => {
            error!(error = %e, "failed to bind proxy socket");
            return;
        }
    };
    if let Err(e) = socket.connect(("127.0.0.1", target_port)).await {
        error!(error = %e, target_port, "failed to dial tunnel socket");
        return;
    }
    bridge_socket(send, recv, socket, buffer_size).await;
}

/// Run both copy directions until either side closes, then tear down both.
async fn bridge_socket(
    mut send: SendStream,
    mut recv: RecvStream,
    socket: UdpSocket,
    buffer_size: usize,
) {
    let socket = Arc::new(socket);

    let outbound_socket = socket.clone();
    let to_channel = tokio::spawn(async move {
        let mut buf = vec![0u8; buffer_size];
        loop {
            let n = match outbound_socket.recv(&mut buf).await {
                Ok(n) => n,
                Err(_) => break,
            };
            if send.write_all(&buf[..n]).await.is_err() {
                break;
            }
            if send.flush().await.is_err() {
                break;
            }
        }
        debug!("proxy from local to channel stopped");
    });

    let mut buf = vec![0u8; buffer_size];
    loop {
        match AsyncReadExt::read(&mut recv, &mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if socket.send(&buf[..n]).await.is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    debug!("proxy from channel to local stopped");
    to_channel.abort();
}
