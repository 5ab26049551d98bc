//! Keeper and guest sessions.
//!
//! A session moves through `Dialing → Negotiating → Open → Closing → Closed`,
//! with `Failed` terminal on error. The keeper side can additionally reach
//! `Expired` when the epoch rolls over with no live connections.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};

use futures::{SinkExt, StreamExt};
use iroh::endpoint::{Connection, RecvStream, SendStream};
use iroh::{Endpoint, EndpointAddr};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::location::{current_epoch, CampfireLocation};
use crate::relay::{decode, encode, RelayMessage, Secret};
use crate::CampfireError;

/// ALPN for campfire data channels.
pub const CAMPFIRE_ALPN: &[u8] = b"ember/campfire/0";

/// Overall deadline to reach `Open`.
const SETUP_TIMEOUT: Duration = Duration::from_secs(15);

const EPOCH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Dialing,
    Negotiating,
    Open,
    Closing,
    Closed,
    /// Keeper only: the epoch rolled with no live connections.
    Expired,
    Failed(String),
}

/// Options for waiting at or joining a campfire.
#[derive(Debug, Clone)]
pub struct CampfireOptions {
    /// The pre-shared key.
    pub psk: Vec<u8>,
    /// Candidate public relays.
    pub relays: Vec<String>,
}

impl From<crate::CampfireUri> for CampfireOptions {
    fn from(uri: crate::CampfireUri) -> Self {
        Self {
            psk: uri.psk,
            relays: vec![uri.relay],
        }
    }
}

struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A reliable, ordered, bidirectional byte stream to one peer.
///
/// Holds the underlying connection (and, on the guest side, the endpoint)
/// so the channel survives as long as the stream does.
pub struct CampfireStream {
    send: SendStream,
    recv: RecvStream,
    _conn: Connection,
    _endpoint: Option<Endpoint>,
    _live: Option<LiveGuard>,
}

impl CampfireStream {
    fn new(
        send: SendStream,
        recv: RecvStream,
        conn: Connection,
        endpoint: Option<Endpoint>,
        live: Option<Arc<AtomicUsize>>,
    ) -> Self {
        Self {
            send,
            recv,
            _conn: conn,
            _endpoint: endpoint,
            _live: live.map(LiveGuard),
        }
    }
}

impl AsyncRead for CampfireStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.recv).poll_read(cx, buf)
    }
}

impl AsyncWrite for CampfireStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.send).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.send).poll_shutdown(cx)
    }
}

/// The camp keeper: announced at the relay, accepting guests.
pub struct CampfireKeeper {
    endpoint: Endpoint,
    secret: Secret,
    state: Arc<Mutex<SessionState>>,
    errors: mpsc::UnboundedReceiver<CampfireError>,
    expired: watch::Receiver<bool>,
    live: Arc<AtomicUsize>,
}

/// Wait at the campfire derived from `opts`.
///
/// Announces at the derived relay and returns a keeper whose
/// [`accept`](CampfireKeeper::accept) yields one stream per arriving guest.
pub async fn wait(opts: CampfireOptions) -> Result<CampfireKeeper, CampfireError> {
    let location = CampfireLocation::find(&opts.psk, &opts.relays)?;
    let origin_epoch = current_epoch(SystemTime::now());
    debug!(relay = %location.relay, secret = %hex::encode(location.secret), "waiting at campfire");

    let endpoint = Endpoint::builder()
        .alpns(vec![CAMPFIRE_ALPN.to_vec()])
        .bind()
        .await
        .map_err(|e| CampfireError::Connect(e.to_string()))?;
    let payload = postcard::to_allocvec(&endpoint.addr())
        .map_err(|e| CampfireError::Encoding(e.to_string()))?;

    let relay_stream = TcpStream::connect(location.relay_host()).await?;
    let mut framed = Framed::new(relay_stream, LengthDelimitedCodec::new());
    framed
        .send(
            encode(&RelayMessage::Announce {
                secret: location.secret,
            })?
            .into(),
        )
        .await?;

    let state = Arc::new(Mutex::new(SessionState::Open));
    let live = Arc::new(AtomicUsize::new(0));
    let (errors_tx, errors_rx) = mpsc::unbounded_channel();
    let (expired_tx, expired_rx) = watch::channel(false);

    let keeper_state = state.clone();
    let keeper_live = live.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(EPOCH_CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                frame = framed.next() => {
                    match frame {
                        Some(Ok(frame)) => match decode(&frame) {
                            Ok(RelayMessage::Offer { secret, .. }) => {
                                debug!("answering campfire offer");
                                let answer = RelayMessage::Answer {
                                    secret,
                                    payload: payload.clone(),
                                };
                                let encoded = match encode(&answer) {
                                    Ok(encoded) => encoded,
                                    Err(e) => {
                                        let _ = errors_tx.send(CampfireError::Encoding(e.to_string()));
                                        continue;
                                    }
                                };
                                if let Err(e) = framed.send(encoded.into()).await {
                                    let _ = errors_tx.send(CampfireError::Relay(e.to_string()));
                                    break;
                                }
                            }
                            Ok(other) => debug!(?other, "ignoring unexpected relay frame"),
                            Err(e) => {
                                let _ = errors_tx.send(CampfireError::Relay(e.to_string()));
                            }
                        },
                        Some(Err(e)) => {
                            let _ = errors_tx.send(CampfireError::Relay(e.to_string()));
                            break;
                        }
                        None => {
                            // The relay dropped the listener.
                            if keeper_live.load(Ordering::SeqCst) == 0 {
                                *keeper_state.lock() = SessionState::Expired;
                                let _ = expired_tx.send(true);
                            }
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if current_epoch(SystemTime::now()) != origin_epoch
                        && keeper_live.load(Ordering::SeqCst) == 0
                    {
                        *keeper_state.lock() = SessionState::Expired;
                        let _ = expired_tx.send(true);
                        break;
                    }
                }
            }
        }
    });

    Ok(CampfireKeeper {
        endpoint,
        secret: location.secret,
        state,
        errors: errors_rx,
        expired: expired_rx,
        live,
    })
}

impl CampfireKeeper {
    /// The session's current state.
    pub fn state(&self) -> SessionState {
        self.state.lock().clone()
    }

    /// Accept the next guest, yielding one byte stream per connection.
    ///
    /// Connections with the wrong ALPN or a wrong secret are dropped and the
    /// wait continues.
    pub async fn accept(&mut self) -> Result<CampfireStream, CampfireError> {
        loop {
            let incoming = self
                .endpoint
                .accept()
                .await
                .ok_or(CampfireError::Closed)?;
            let conn = match incoming.accept() {
                Ok(connecting) => match connecting.await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "campfire connection failed during setup");
                        continue;
                    }
                },
                Err(e) => {
                    warn!(error = %e, "campfire connection refused");
                    continue;
                }
            };

            let alpn = conn.alpn();
            if alpn.as_deref() != Some(CAMPFIRE_ALPN) {
                warn!(?alpn, "unexpected ALPN, dropping connection");
                continue;
            }

            let (send, mut recv) = match conn.accept_bi().await {
                Ok(streams) => streams,
                Err(e) => {
                    warn!(error = %e, "failed to accept stream");
                    continue;
                }
            };

            let mut presented = [0u8; 32];
            let handshake =
                tokio::time::timeout(SETUP_TIMEOUT, recv.read_exact(&mut presented)).await;
            match handshake {
                Ok(Ok(())) if presented == self.secret => {}
                Ok(_) => {
                    warn!("guest presented a wrong secret, dropping connection");
                    continue;
                }
                Err(_) => {
                    warn!("guest handshake timed out, dropping connection");
                    continue;
                }
            }

            self.live.fetch_add(1, Ordering::SeqCst);
            *self.state.lock() = SessionState::Open;
            return Ok(CampfireStream::new(
                send,
                recv,
                conn,
                None,
                Some(self.live.clone()),
            ));
        }
    }

    /// Session-level errors that could not be returned from a call.
    pub async fn next_error(&mut self) -> Option<CampfireError> {
        self.errors.recv().await
    }

    /// Resolves when the epoch rolls over with no live connections.
    pub async fn expired(&mut self) {
        while !*self.expired.borrow() {
            if self.expired.changed().await.is_err() {
                break;
            }
        }
    }

    /// Whether the keeper has expired.
    pub fn is_expired(&self) -> bool {
        *self.expired.borrow()
    }

    /// Tear the session down. Safe to call more than once.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock();
            if matches!(*state, SessionState::Closed) {
                return;
            }
            *state = SessionState::Closing;
        }
        self.endpoint.close().await;
        *self.state.lock() = SessionState::Closed;
    }
}

/// Join the campfire derived from `opts` and return a stream to the keeper.
///
/// The whole exchange — relay signalling, QUIC connect, secret handshake —
/// must finish inside the 15 second setup deadline.
pub async fn join(opts: CampfireOptions) -> Result<CampfireStream, CampfireError> {
    match tokio::time::timeout(SETUP_TIMEOUT, join_inner(opts)).await {
        Ok(result) => result,
        Err(_) => Err(CampfireError::TimedOut),
    }
}

async fn join_inner(opts: CampfireOptions) -> Result<CampfireStream, CampfireError> {
    let location = CampfireLocation::find(&opts.psk, &opts.relays)?;
    debug!(relay = %location.relay, "joining campfire");

    let endpoint = Endpoint::builder()
        .alpns(vec![CAMPFIRE_ALPN.to_vec()])
        .bind()
        .await
        .map_err(|e| CampfireError::Connect(e.to_string()))?;
    let payload = postcard::to_allocvec(&endpoint.addr())
        .map_err(|e| CampfireError::Encoding(e.to_string()))?;

    // Dialing: post the offer at the derived location.
    let relay_stream = TcpStream::connect(location.relay_host()).await?;
    let mut framed = Framed::new(relay_stream, LengthDelimitedCodec::new());
    framed
        .send(
            encode(&RelayMessage::Offer {
                secret: location.secret,
                payload,
            })?
            .into(),
        )
        .await?;

    // Negotiating: wait for the keeper's answer.
    let frame = framed
        .next()
        .await
        .ok_or_else(|| CampfireError::Relay("relay closed before answering".to_string()))??;
    let keeper_addr: EndpointAddr = match decode(&frame)? {
        RelayMessage::Answer { payload, .. } => postcard::from_bytes(&payload)
            .map_err(|e| CampfireError::Encoding(e.to_string()))?,
        RelayMessage::NoCampfire { .. } => return Err(CampfireError::NoCampfire),
        other => {
            return Err(CampfireError::Relay(format!(
                "unexpected relay frame: {other:?}"
            )))
        }
    };

    // The relay's part is done; the data channel is direct.
    let conn = endpoint
        .connect(keeper_addr, CAMPFIRE_ALPN)
        .await
        .map_err(|e| CampfireError::Connect(e.to_string()))?;
    let (mut send, recv) = conn
        .open_bi()
        .await
        .map_err(|e| CampfireError::Connect(e.to_string()))?;

    tokio::io::AsyncWriteExt::write_all(&mut send, &location.secret)
        .await
        .map_err(|e| CampfireError::Handshake(e.to_string()))?;
    tokio::io::AsyncWriteExt::flush(&mut send)
        .await
        .map_err(|e| CampfireError::Handshake(e.to_string()))?;

    Ok(CampfireStream::new(send, recv, conn, Some(endpoint), None))
}
