//! Key/value storage abstraction for the mesh registry.
//!
//! Every piece of replicated mesh state (nodes, IPAM leases, ACLs, routes,
//! mesh-wide settings) lives under a reserved key prefix in a single
//! hierarchical keyspace. The [`Storage`] trait is the only way the rest of
//! the system touches that keyspace; the consensus crate provides the
//! log-backed implementation, and [`MemoryStorage`] provides the local map
//! that doubles as the state machine's materialized view.

pub mod keys;
mod memory;

use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

pub use memory::MemoryStorage;

/// Errors surfaced at the storage boundary.
///
/// Mutations on a non-leader replica fail with [`StorageError::NotLeader`],
/// carrying a hint to the current leader when one is known. Callers are
/// expected to retry against the hinted node.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    /// Mutation attempted on a follower.
    #[error("not the leader (current leader: {leader:?})")]
    NotLeader {
        /// The current leader's node id, if known.
        leader: Option<String>,
    },

    /// Lookup miss on an expected record.
    #[error("key not found")]
    NotFound,

    /// Malformed or out-of-keyspace key.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Record encoding or decoding failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Transient consensus or storage unavailability; retry with backoff.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Unrecoverable failure; the node should log and exit.
    #[error("fatal storage error: {0}")]
    Fatal(String),
}

/// The kind of mutation a watch event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOp {
    /// A key was created or its value replaced.
    Put,
    /// A key was removed.
    Delete,
}

/// A single observed mutation of the keyspace.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    /// The affected key.
    pub key: String,
    /// The value before the mutation, if the key existed.
    pub old: Option<Bytes>,
    /// The value after the mutation, absent for deletes.
    pub new: Option<Bytes>,
    /// Whether this was a put or a delete.
    pub op: WatchOp,
}

/// A prefix-filtered subscription to keyspace mutations.
///
/// Events are delivered in commit order per replica. A lagging subscriber
/// loses the oldest buffered events rather than blocking writers.
pub struct Subscription {
    prefix: String,
    rx: broadcast::Receiver<WatchEvent>,
}

impl Subscription {
    pub fn new(prefix: impl Into<String>, rx: broadcast::Receiver<WatchEvent>) -> Self {
        Self {
            prefix: prefix.into(),
            rx,
        }
    }

    /// Receive the next event under the subscribed prefix.
    ///
    /// Returns `None` once the storage side has been dropped. Events lost to
    /// lag are skipped.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.key.starts_with(&self.prefix) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// A key/value store over the mesh registry keyspace.
///
/// Writes are linearizable with respect to the consensus log: a successful
/// `put` is durable once acknowledged. Reads serve from the local replica.
#[async_trait]
pub trait Storage: Clone + Debug + Send + Sync + 'static {
    /// Fetch the value at `key`, or [`StorageError::NotFound`].
    async fn get(&self, key: &str) -> Result<Bytes, StorageError>;

    /// Write `value` at `key`, creating or replacing it.
    async fn put(&self, key: &str, value: Bytes) -> Result<(), StorageError>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// All `(key, value)` pairs under `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Bytes)>, StorageError>;

    /// Subscribe to mutations under `prefix`.
    fn subscribe(&self, prefix: &str) -> Subscription;
}
