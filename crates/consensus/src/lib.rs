//! Consensus engine for the mesh registry.
//!
//! The registry keyspace is replicated through an openraft log. Committed
//! entries are applied to an in-process materialized view
//! ([`ember_storage::MemoryStorage`]), so every replica can serve reads
//! locally while writes flow through the leader. The [`ConsensusEngine`]
//! wraps the raft instance with the membership operations the mesh needs
//! (voter/non-voter admission, forced removal) and publishes an observation
//! stream of leadership, membership, and heartbeat events.

pub mod engine;
mod error;
mod observation;
pub mod router;
mod storage;
mod store;

use std::io::Cursor;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use engine::{ConsensusEngine, EngineConfig};
pub use error::EngineError;
pub use observation::{Observation, ObservationHub, Suffrage};
pub use router::RaftRouter;
pub use storage::ConsensusStorage;
pub use store::MemoryRaftStorage;

openraft::declare_raft_types!(
    /// Raft type configuration for the registry log.
    pub TypeConfig:
        D = RegistryCommand,
        R = RegistryResponse,
        NodeId = String,
        Node = openraft::BasicNode,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = openraft::TokioRuntime,
);

/// A mutation of the registry keyspace, replicated through the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RegistryCommand {
    /// Create or replace the value at `key`.
    Put {
        /// Registry key.
        key: String,
        /// Serialized record.
        value: Bytes,
    },

    /// Remove the value at `key`.
    Delete {
        /// Registry key.
        key: String,
    },
}

/// Response from applying a registry command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryResponse {
    /// Log index the command was applied at.
    pub index: u64,
    /// Error message if the command was rejected by the state machine.
    pub error: Option<String>,
}
