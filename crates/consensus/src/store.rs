//! In-memory raft log storage and registry state machine.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::sync::Arc;

use bytes::Bytes;
use ember_storage::{MemoryStorage, Storage};
use openraft::entry::RaftEntry;
use openraft::storage::{IOFlushed, LogState, RaftLogStorage, RaftStateMachine, Snapshot};
use openraft::{
    Entry, EntryPayload, LogId, RaftLogReader, RaftSnapshotBuilder, SnapshotMeta, StorageError,
    StoredMembership, Vote,
};
use tokio::sync::RwLock;

use crate::{RegistryCommand, RegistryResponse, TypeConfig};

/// In-memory log store and state machine for the registry log.
///
/// Committed commands are applied to a [`MemoryStorage`] materialized view,
/// which replicas read from and watch. Snapshots serialize the full view;
/// installing one replaces the view wholesale without emitting watch events.
#[derive(Debug, Clone)]
pub struct MemoryRaftStorage {
    /// Current vote state.
    vote: Arc<RwLock<Option<Vote<TypeConfig>>>>,
    /// Log entries by index.
    log: Arc<RwLock<BTreeMap<u64, Entry<TypeConfig>>>>,
    /// Applied-state bookkeeping.
    applied: Arc<RwLock<AppliedState>>,
    /// Last purged log id.
    last_purged: Arc<RwLock<Option<LogId<TypeConfig>>>>,
    /// Materialized registry view.
    view: MemoryStorage,
}

#[derive(Debug, Default)]
struct AppliedState {
    last_applied_log: Option<LogId<TypeConfig>>,
    last_membership: StoredMembership<TypeConfig>,
}

/// Snapshot builder for [`MemoryRaftStorage`].
pub struct RegistrySnapshotBuilder {
    last_applied: Option<LogId<TypeConfig>>,
    last_membership: StoredMembership<TypeConfig>,
    view: MemoryStorage,
}

impl MemoryRaftStorage {
    pub fn new(view: MemoryStorage) -> Self {
        Self {
            vote: Arc::new(RwLock::new(None)),
            log: Arc::new(RwLock::new(BTreeMap::new())),
            applied: Arc::new(RwLock::new(AppliedState::default())),
            last_purged: Arc::new(RwLock::new(None)),
            view,
        }
    }

    /// The materialized view this store applies committed entries to.
    pub fn view(&self) -> &MemoryStorage {
        &self.view
    }

    fn snapshot_id(last_applied: Option<&LogId<TypeConfig>>) -> String {
        format!("snapshot-{}", last_applied.map_or(0, |id| id.index))
    }

    fn encode_view(view: &MemoryStorage) -> Vec<u8> {
        // BTreeMap ordering keeps the encoding deterministic.
        serde_json::to_vec(&view.dump()).unwrap_or_default()
    }
}

impl Default for MemoryRaftStorage {
    fn default() -> Self {
        Self::new(MemoryStorage::new())
    }
}

impl RaftLogReader<TypeConfig> for MemoryRaftStorage {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + Send>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<TypeConfig>> {
        let log = self.log.read().await;
        Ok(log.range(range).map(|(_, entry)| entry.clone()).collect())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<TypeConfig>>, StorageError<TypeConfig>> {
        Ok(self.vote.read().await.clone())
    }
}

impl RaftLogStorage<TypeConfig> for MemoryRaftStorage {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<TypeConfig>> {
        let log = self.log.read().await;
        let last_purged_log_id = self.last_purged.read().await.clone();
        let last_log_id = log
            .values()
            .last()
            .map(|entry| entry.log_id().clone())
            .or_else(|| last_purged_log_id.clone());

        Ok(LogState {
            last_purged_log_id,
            last_log_id,
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(&mut self, vote: &Vote<TypeConfig>) -> Result<(), StorageError<TypeConfig>> {
        *self.vote.write().await = Some(vote.clone());
        Ok(())
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: IOFlushed<TypeConfig>,
    ) -> Result<(), StorageError<TypeConfig>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
    {
        let mut log = self.log.write().await;
        for entry in entries {
            log.insert(entry.log_id().index, entry);
        }
        callback.io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(
        &mut self,
        log_id: LogId<TypeConfig>,
    ) -> Result<(), StorageError<TypeConfig>> {
        let mut log = self.log.write().await;
        let to_remove: Vec<u64> = log.range(log_id.index..).map(|(&i, _)| i).collect();
        for index in to_remove {
            log.remove(&index);
        }
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId<TypeConfig>) -> Result<(), StorageError<TypeConfig>> {
        let mut log = self.log.write().await;
        let to_remove: Vec<u64> = log.range(..=log_id.index).map(|(&i, _)| i).collect();
        for index in to_remove {
            log.remove(&index);
        }
        *self.last_purged.write().await = Some(log_id);
        Ok(())
    }
}

impl RaftStateMachine<TypeConfig> for MemoryRaftStorage {
    type SnapshotBuilder = RegistrySnapshotBuilder;

    async fn applied_state(
        &mut self,
    ) -> Result<
        (Option<LogId<TypeConfig>>, StoredMembership<TypeConfig>),
        StorageError<TypeConfig>,
    > {
        let applied = self.applied.read().await;
        Ok((
            applied.last_applied_log.clone(),
            applied.last_membership.clone(),
        ))
    }

    async fn apply<I>(
        &mut self,
        entries: I,
    ) -> Result<Vec<RegistryResponse>, StorageError<TypeConfig>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
        I::IntoIter: Send,
    {
        let mut responses = Vec::new();
        let mut applied = self.applied.write().await;

        for entry in entries {
            let log_id = entry.log_id().clone();
            applied.last_applied_log = Some(log_id.clone());

            match entry.payload {
                EntryPayload::Blank => {
                    responses.push(RegistryResponse {
                        index: log_id.index,
                        error: None,
                    });
                }
                EntryPayload::Normal(command) => {
                    let result = match &command {
                        RegistryCommand::Put { key, value } => {
                            self.view.put(key, value.clone()).await
                        }
                        RegistryCommand::Delete { key } => self.view.delete(key).await,
                    };
                    responses.push(RegistryResponse {
                        index: log_id.index,
                        error: result.err().map(|e| e.to_string()),
                    });
                }
                EntryPayload::Membership(membership) => {
                    applied.last_membership =
                        StoredMembership::new(Some(log_id.clone()), membership);
                    responses.push(RegistryResponse {
                        index: log_id.index,
                        error: None,
                    });
                }
            }
        }

        Ok(responses)
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Cursor<Vec<u8>>, StorageError<TypeConfig>> {
        Ok(Cursor::new(Vec::new()))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<TypeConfig>,
        snapshot: Cursor<Vec<u8>>,
    ) -> Result<(), StorageError<TypeConfig>> {
        let mut applied = self.applied.write().await;
        applied.last_applied_log = meta.last_log_id.clone();
        applied.last_membership = meta.last_membership.clone();

        if !snapshot.get_ref().is_empty() {
            let entries: BTreeMap<String, Bytes> = serde_json::from_slice(snapshot.get_ref())
                .map_err(|e| StorageError::read_snapshot(None, &e))?;
            self.view.reset_to(entries);
        }

        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<TypeConfig>> {
        let applied = self.applied.read().await;
        let meta = SnapshotMeta {
            last_log_id: applied.last_applied_log.clone(),
            last_membership: applied.last_membership.clone(),
            snapshot_id: Self::snapshot_id(applied.last_applied_log.as_ref()),
        };

        Ok(Some(Snapshot {
            meta,
            snapshot: Cursor::new(Self::encode_view(&self.view)),
        }))
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        let applied = self.applied.read().await;
        RegistrySnapshotBuilder {
            last_applied: applied.last_applied_log.clone(),
            last_membership: applied.last_membership.clone(),
            view: self.view.clone(),
        }
    }
}

impl RaftSnapshotBuilder<TypeConfig> for RegistrySnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<TypeConfig>> {
        let meta = SnapshotMeta {
            last_log_id: self.last_applied.clone(),
            last_membership: self.last_membership.clone(),
            snapshot_id: MemoryRaftStorage::snapshot_id(self.last_applied.as_ref()),
        };

        Ok(Snapshot {
            meta,
            snapshot: Cursor::new(MemoryRaftStorage::encode_view(&self.view)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_snapshot_round_trip_restores_view() {
        let mut storage = MemoryRaftStorage::default();
        storage
            .view()
            .put("/registry/meshstate/meshdomain", Bytes::from_static(b"ember.internal"))
            .await
            .unwrap();
        storage
            .view()
            .put("/registry/nodes/a", Bytes::from_static(b"record"))
            .await
            .unwrap();

        let snapshot = storage.get_current_snapshot().await.unwrap().unwrap();
        assert!(!snapshot.snapshot.get_ref().is_empty());

        let mut restored = MemoryRaftStorage::default();
        restored
            .install_snapshot(&snapshot.meta, snapshot.snapshot)
            .await
            .unwrap();

        let domain = restored.view().get("/registry/meshstate/meshdomain").await.unwrap();
        assert_eq!(domain, Bytes::from_static(b"ember.internal"));
        assert_eq!(restored.view().len(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_encoding_is_deterministic() {
        let a = MemoryRaftStorage::default();
        let b = MemoryRaftStorage::default();
        for store in [&a, &b] {
            store.view().put("/registry/nodes/x", Bytes::from_static(b"1")).await.unwrap();
            store.view().put("/registry/nodes/y", Bytes::from_static(b"2")).await.unwrap();
        }

        assert_eq!(
            MemoryRaftStorage::encode_view(a.view()),
            MemoryRaftStorage::encode_view(b.view()),
        );
    }
}
