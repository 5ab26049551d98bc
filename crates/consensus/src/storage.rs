//! Consensus-backed implementation of the registry [`Storage`] trait.

use async_trait::async_trait;
use bytes::Bytes;
use ember_storage::{Storage, StorageError, Subscription};

use crate::{ConsensusEngine, EngineError, RegistryCommand};

/// [`Storage`] over a [`ConsensusEngine`].
///
/// Reads and watches serve from the local materialized view; mutations
/// propose through the log and therefore fail with
/// [`StorageError::NotLeader`] on a follower.
#[derive(Clone, Debug)]
pub struct ConsensusStorage {
    engine: ConsensusEngine,
}

impl ConsensusStorage {
    pub fn new(engine: ConsensusEngine) -> Self {
        Self { engine }
    }

    /// The engine backing this storage.
    pub fn engine(&self) -> &ConsensusEngine {
        &self.engine
    }
}

fn map_engine_error(error: EngineError) -> StorageError {
    match error {
        EngineError::NotLeader { leader } => StorageError::NotLeader { leader },
        EngineError::InvalidOperation(message) => StorageError::InvalidKey(message),
        EngineError::Raft(message) => StorageError::Unavailable(message),
        EngineError::Shutdown => StorageError::Unavailable("engine is shut down".to_string()),
    }
}

#[async_trait]
impl Storage for ConsensusStorage {
    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        self.engine.view().get(key).await
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<(), StorageError> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey("empty key".to_string()));
        }
        self.engine
            .propose(RegistryCommand::Put {
                key: key.to_string(),
                value,
            })
            .await
            .map_err(map_engine_error)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.engine
            .propose(RegistryCommand::Delete {
                key: key.to_string(),
            })
            .await
            .map_err(map_engine_error)?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Bytes)>, StorageError> {
        self.engine.view().list(prefix).await
    }

    fn subscribe(&self, prefix: &str) -> Subscription {
        self.engine.view().subscribe(prefix)
    }
}
