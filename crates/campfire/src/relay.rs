//! Signalling relay.
//!
//! The relay matches camp keepers and guests by rendezvous secret and
//! forwards their session descriptions. It never sees session traffic; the
//! data channel is negotiated end to end and flows peer to peer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

/// A 32-byte rendezvous secret.
pub type Secret = [u8; 32];

/// Frames exchanged with the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RelayMessage {
    /// Keeper registration: wait for offers under `secret`.
    Announce { secret: Secret },
    /// Guest offer: a serialized session description for the keeper.
    Offer { secret: Secret, payload: Vec<u8> },
    /// Keeper answer, forwarded to every guest waiting under `secret`.
    Answer { secret: Secret, payload: Vec<u8> },
    /// Nobody is announced under the offered secret.
    NoCampfire { secret: Secret },
}

#[derive(Default)]
struct RelayState {
    keepers: HashMap<Secret, mpsc::UnboundedSender<RelayMessage>>,
    waiting: HashMap<Secret, Vec<mpsc::UnboundedSender<RelayMessage>>>,
}

/// A public signalling relay.
///
/// One relay serves any number of campfires concurrently; sessions are keyed
/// only by secret. A keeper disconnect clears its key, so guests arriving
/// afterwards get [`RelayMessage::NoCampfire`].
pub struct RelayServer {
    listener: TcpListener,
    state: Arc<Mutex<RelayState>>,
}

impl RelayServer {
    /// Bind the relay to `addr`.
    pub async fn bind(addr: impl ToSocketAddrs) -> std::io::Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(addr).await?,
            state: Arc::new(Mutex::new(RelayState::default())),
        })
    }

    /// The bound address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and serve connections until the task is dropped.
    pub async fn run(self) {
        loop {
            let (stream, remote) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "relay accept failed");
                    continue;
                }
            };
            debug!(%remote, "relay connection");
            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, state).await {
                    debug!(%remote, error = %e, "relay connection ended");
                }
            });
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    state: Arc<Mutex<RelayState>>,
) -> Result<(), std::io::Error> {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    let first = match framed.next().await {
        Some(frame) => decode(&frame?)?,
        None => return Ok(()),
    };

    match first {
        RelayMessage::Announce { secret } => serve_keeper(framed, secret, state).await,
        RelayMessage::Offer { secret, payload } => {
            serve_guest(framed, secret, payload, state).await
        }
        other => {
            debug!(?other, "unexpected first frame, dropping connection");
            Ok(())
        }
    }
}

/// Keeper side: forward incoming offers, fan answers out to waiting guests.
async fn serve_keeper(
    mut framed: Framed<TcpStream, LengthDelimitedCodec>,
    secret: Secret,
    state: Arc<Mutex<RelayState>>,
) -> Result<(), std::io::Error> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    state.lock().keepers.insert(secret, tx);

    let result = async {
        loop {
            tokio::select! {
                forwarded = rx.recv() => {
                    match forwarded {
                        Some(message) => framed.send(encode(&message)?.into()).await?,
                        None => break,
                    }
                }
                frame = framed.next() => {
                    let Some(frame) = frame else { break };
                    if let RelayMessage::Answer { secret, payload } = decode(&frame?)? {
                        let guests = state.lock().waiting.remove(&secret).unwrap_or_default();
                        for guest in guests {
                            let _ = guest.send(RelayMessage::Answer {
                                secret,
                                payload: payload.clone(),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }
    .await;

    state.lock().keepers.remove(&secret);
    state.lock().waiting.remove(&secret);
    result
}

/// Guest side: forward the offer, deliver one answer, done.
async fn serve_guest(
    mut framed: Framed<TcpStream, LengthDelimitedCodec>,
    secret: Secret,
    payload: Vec<u8>,
    state: Arc<Mutex<RelayState>>,
) -> Result<(), std::io::Error> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let keeper = {
        let mut state = state.lock();
        match state.keepers.get(&secret).cloned() {
            Some(keeper) => {
                state.waiting.entry(secret).or_default().push(tx);
                Some(keeper)
            }
            None => None,
        }
    };

    let Some(keeper) = keeper else {
        framed
            .send(encode(&RelayMessage::NoCampfire { secret })?.into())
            .await?;
        return Ok(());
    };

    if keeper
        .send(RelayMessage::Offer { secret, payload })
        .is_err()
    {
        framed
            .send(encode(&RelayMessage::NoCampfire { secret })?.into())
            .await?;
        return Ok(());
    }

    if let Some(answer) = rx.recv().await {
        framed.send(encode(&answer)?.into()).await?;
    }
    Ok(())
}

pub(crate) fn encode(message: &RelayMessage) -> Result<Vec<u8>, std::io::Error> {
    postcard::to_allocvec(message).map_err(std::io::Error::other)
}

pub(crate) fn decode(frame: &[u8]) -> Result<RelayMessage, std::io::Error> {
    postcard::from_bytes(frame).map_err(std::io::Error::other)
}
