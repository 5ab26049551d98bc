//! Peer accessor over the node keyspace.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use ember_storage::{keys, Storage};

use crate::{CreatePeerOptions, Peer, RegistryError};

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn decode(value: &Bytes) -> Result<Peer, RegistryError> {
    serde_json::from_slice(value).map_err(|e| RegistryError::InvalidRecord(e.to_string()))
}

fn encode(peer: &Peer) -> Result<Bytes, RegistryError> {
    serde_json::to_vec(peer)
        .map(Bytes::from)
        .map_err(|e| RegistryError::InvalidRecord(e.to_string()))
}

/// Typed accessor for node records under `/registry/nodes/`.
#[derive(Debug, Clone)]
pub struct Peers<S> {
    storage: S,
}

impl<S: Storage> Peers<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// Fetch the record for `id`.
    pub async fn get(&self, id: &str) -> Result<Peer, RegistryError> {
        let value = self.storage.get(&keys::node_key(id)).await?;
        decode(&value)
    }

    /// All registered peers, sorted by id.
    pub async fn list(&self) -> Result<Vec<Peer>, RegistryError> {
        let entries = self.storage.list(keys::NODES_PREFIX).await?;
        entries.iter().map(|(_, value)| decode(value)).collect()
    }

    /// Peers with a primary endpoint set.
    pub async fn list_public(&self) -> Result<Vec<Peer>, RegistryError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|peer| peer.primary_endpoint.is_some())
            .collect())
    }

    /// All peers except `exclude`, as sent to a joining node.
    pub async fn list_excluding(&self, exclude: &str) -> Result<Vec<Peer>, RegistryError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|peer| peer.id != exclude)
            .collect())
    }

    /// Register a new peer.
    pub async fn create(&self, opts: CreatePeerOptions) -> Result<Peer, RegistryError> {
        if !keys::valid_id(&opts.id) {
            return Err(RegistryError::InvalidName(opts.id));
        }
        let peer = Peer {
            id: opts.id,
            public_key: opts.public_key,
            primary_endpoint: opts.primary_endpoint,
            endpoints: opts.endpoints,
            rpc_port: opts.rpc_port,
            consensus_port: opts.consensus_port,
            tunnel_port: opts.tunnel_port,
            overlay_v4: None,
            overlay_v6: opts.overlay_v6,
            updated_at: now_unix(),
        };
        self.put(&peer).await?;
        Ok(peer)
    }

    /// Write back an updated record, refreshing its heartbeat timestamp.
    pub async fn update(&self, peer: &Peer) -> Result<Peer, RegistryError> {
        let mut peer = peer.clone();
        peer.updated_at = now_unix();
        self.put(&peer).await?;
        Ok(peer)
    }

    /// Remove the record for `id`.
    pub async fn delete(&self, id: &str) -> Result<(), RegistryError> {
        self.storage.delete(&keys::node_key(id)).await?;
        Ok(())
    }

    async fn put(&self, peer: &Peer) -> Result<(), RegistryError> {
        let value = encode(peer)?;
        self.storage.put(&keys::node_key(&peer.id), value).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PublicKey;
    use ember_storage::MemoryStorage;

    fn opts(id: &str) -> CreatePeerOptions {
        CreatePeerOptions {
            id: id.to_string(),
            public_key: PublicKey::from_bytes([1u8; 32]),
            primary_endpoint: None,
            endpoints: Vec::new(),
            rpc_port: 8443,
            consensus_port: 9443,
            tunnel_port: 51820,
            overlay_v6: "fd00::1/128".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_create_get_update_round_trip() {
        let peers = Peers::new(MemoryStorage::new());
        let created = peers.create(opts("a")).await.unwrap();

        let fetched = peers.get("a").await.unwrap();
        assert_eq!(created, fetched);

        let updated = peers.update(&fetched).await.unwrap();
        let refetched = peers.get("a").await.unwrap();
        assert_eq!(updated, refetched);

        // Identity update changes nothing but the heartbeat timestamp.
        assert_eq!(
            (fetched.id, fetched.public_key, fetched.overlay_v6),
            (refetched.id, refetched.public_key, refetched.overlay_v6),
        );
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let peers = Peers::new(MemoryStorage::new());
        let err = peers.get("ghost").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_list_public_filters_endpointless_nodes() {
        let peers = Peers::new(MemoryStorage::new());
        peers.create(opts("hidden")).await.unwrap();

        let mut public = opts("visible");
        public.primary_endpoint = Some("203.0.113.7".parse().unwrap());
        peers.create(public).await.unwrap();

        let listed = peers.list_public().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "visible");
    }

    #[tokio::test]
    async fn test_list_excluding_omits_the_joiner() {
        let peers = Peers::new(MemoryStorage::new());
        peers.create(opts("a")).await.unwrap();
        peers.create(opts("b")).await.unwrap();

        let listed = peers.list_excluding("b").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "a");
    }

    #[tokio::test]
    async fn test_create_rejects_bad_id() {
        let peers = Peers::new(MemoryStorage::new());
        assert!(peers.create(opts("")).await.is_err());
        assert!(peers.create(opts("a/b")).await.is_err());
    }
}
