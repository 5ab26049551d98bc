//! Error types for the consensus engine.

/// Errors surfaced by [`crate::ConsensusEngine`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Operation requires leadership; carries a hint to the current leader.
    #[error("not the leader (current leader: {leader:?})")]
    NotLeader {
        /// The current leader's node id, if known.
        leader: Option<String>,
    },

    /// Underlying raft failure.
    #[error("raft error: {0}")]
    Raft(String),

    /// Operation is not valid in the current cluster state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The engine has been shut down.
    #[error("engine is shut down")]
    Shutdown,
}
