use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::{Storage, StorageError, Subscription, WatchEvent, WatchOp};

const WATCH_CHANNEL_CAPACITY: usize = 1024;

/// In-process implementation of [`Storage`] over a sorted map.
///
/// `MemoryStorage` is always-leader: every write succeeds locally. It backs
/// unit tests directly, and the consensus state machine embeds one as its
/// materialized view, applying committed log entries through [`Storage::put`]
/// and [`Storage::delete`] so watchers observe mutations in log order.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Inner>,
}

struct Inner {
    map: RwLock<BTreeMap<String, Bytes>>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for Inner {
    fn default() -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            map: RwLock::new(BTreeMap::new()),
            events,
        }
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.inner.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.map.read().is_empty()
    }

    /// Replace the entire contents with `snapshot`, without emitting watch
    /// events. Used when installing a consensus snapshot.
    pub fn reset_to(&self, snapshot: BTreeMap<String, Bytes>) {
        *self.inner.map.write() = snapshot;
    }

    /// A copy of the full map, for snapshot construction.
    pub fn dump(&self) -> BTreeMap<String, Bytes> {
        self.inner.map.read().clone()
    }

    fn emit(&self, event: WatchEvent) {
        // A send error only means there are no subscribers right now.
        let _ = self.inner.events.send(event);
    }
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("len", &self.len())
            .finish()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        self.inner
            .map
            .read()
            .get(key)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<(), StorageError> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey("empty key".to_string()));
        }
        let old = self.inner.map.write().insert(key.to_string(), value.clone());
        self.emit(WatchEvent {
            key: key.to_string(),
            old,
            new: Some(value),
            op: WatchOp::Put,
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let old = self.inner.map.write().remove(key);
        if let Some(old) = old {
            self.emit(WatchEvent {
                key: key.to_string(),
                old: Some(old),
                new: None,
                op: WatchOp::Delete,
            });
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Bytes)>, StorageError> {
        let map = self.inner.map.read();
        Ok(map
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn subscribe(&self, prefix: &str) -> Subscription {
        Subscription::new(prefix, self.inner.events.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStorage::new();
        store
            .put("/registry/nodes/a", Bytes::from_static(b"record"))
            .await
            .unwrap();

        let value = store.get("/registry/nodes/a").await.unwrap();
        assert_eq!(value, Bytes::from_static(b"record"));

        store.delete("/registry/nodes/a").await.unwrap();
        assert!(matches!(
            store.get("/registry/nodes/a").await,
            Err(StorageError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let store = MemoryStorage::new();
        store.delete("/registry/nodes/ghost").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_is_prefix_scoped_and_sorted() {
        let store = MemoryStorage::new();
        store.put("/registry/nodes/b", Bytes::from_static(b"2")).await.unwrap();
        store.put("/registry/nodes/a", Bytes::from_static(b"1")).await.unwrap();
        store.put("/registry/ipam/a", Bytes::from_static(b"x")).await.unwrap();

        let nodes = store.list("/registry/nodes/").await.unwrap();
        let keys: Vec<_> = nodes.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["/registry/nodes/a", "/registry/nodes/b"]);
    }

    #[tokio::test]
    async fn test_watch_sees_put_and_delete_in_order() {
        let store = MemoryStorage::new();
        let mut sub = store.subscribe("/registry/nodes/");

        store.put("/registry/nodes/a", Bytes::from_static(b"1")).await.unwrap();
        store.put("/registry/ipam/a", Bytes::from_static(b"x")).await.unwrap();
        store.delete("/registry/nodes/a").await.unwrap();

        let first = sub.recv().await.unwrap();
        assert_eq!(first.key, "/registry/nodes/a");
        assert_eq!(first.op, WatchOp::Put);
        assert_eq!(first.old, None);

        // The ipam write is outside the subscribed prefix and is skipped.
        let second = sub.recv().await.unwrap();
        assert_eq!(second.op, WatchOp::Delete);
        assert_eq!(second.old, Some(Bytes::from_static(b"1")));
        assert_eq!(second.new, None);
    }

    #[tokio::test]
    async fn test_reset_to_replaces_without_events() {
        let store = MemoryStorage::new();
        let mut sub = store.subscribe("/");

        let mut snapshot = BTreeMap::new();
        snapshot.insert("/registry/meshstate/meshdomain".to_string(), Bytes::from_static(b"ember.internal"));
        store.reset_to(snapshot);

        assert_eq!(store.len(), 1);
        store.put("/marker", Bytes::from_static(b"1")).await.unwrap();
        // The first observable event is the marker, not the snapshot load.
        let event = sub.recv().await.unwrap();
        assert_eq!(event.key, "/marker");
    }
}
