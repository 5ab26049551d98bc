//! The "camp fire" rendezvous protocol.
//!
//! Two or more nodes sharing a pre-shared key independently derive the same
//! meeting point — a relay plus an opaque secret — for the current time
//! epoch, exchange session descriptions through that relay, and establish a
//! direct QUIC data channel. The relay only carries signalling; once
//! connected, traffic flows peer to peer.
//!
//! A campfire is used two ways: as a bootstrap transport (speak the join RPC
//! over the stream before the tunnel exists) and as a NAT-traversing
//! fallback for the encrypted tunnel itself (see [`proxy`]).

mod location;
pub mod proxy;
mod relay;
mod session;

pub use location::{current_epoch, CampfireLocation, CampfireUri, EPOCH};
pub use relay::{RelayMessage, RelayServer, Secret};
pub use session::{
    join, wait, CampfireKeeper, CampfireOptions, CampfireStream, SessionState, CAMPFIRE_ALPN,
};

/// Errors from rendezvous and data-channel setup.
///
/// No error is silently swallowed: session-level failures that cannot be
/// returned from a call are delivered on the keeper's error channel.
#[derive(Debug, thiserror::Error)]
pub enum CampfireError {
    /// The relay list is empty.
    #[error("at least one relay is required")]
    NoRelays,

    /// The pre-shared key is empty.
    #[error("a pre-shared key is required")]
    EmptyPsk,

    /// A `camp://` URI failed to parse.
    #[error("invalid campfire uri: {0}")]
    InvalidUri(String),

    /// Signalling through the relay failed.
    #[error("relay error: {0}")]
    Relay(String),

    /// QUIC endpoint or connection failure.
    #[error("connect error: {0}")]
    Connect(String),

    /// The peer failed the secret handshake.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Nobody is waiting at the derived location.
    #[error("no campfire at this location")]
    NoCampfire,

    /// Session setup missed its deadline.
    #[error("timed out establishing the session")]
    TimedOut,

    /// The session is closed.
    #[error("session closed")]
    Closed,

    /// Payload encoding or decoding failure.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Socket-level failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
