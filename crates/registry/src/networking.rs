//! Network ACL and route records.

use bytes::Bytes;
use ember_storage::{keys, Storage};
use serde::{Deserialize, Serialize};

use crate::RegistryError;

/// ACL granting the bootstrap set mutual access; created at bootstrap.
pub const BOOTSTRAP_NODES_ACL: &str = "bootstrap-nodes";

/// ACL covering the voter group.
pub const VOTERS_ACL: &str = "voters";

/// Whether `name` is a system-reserved ACL that must not be deleted.
pub fn is_system_acl(name: &str) -> bool {
    matches!(name, BOOTSTRAP_NODES_ACL | VOTERS_ACL)
}

/// Verdict of a matching ACL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AclAction {
    Accept,
    Deny,
}

/// A named network policy object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAcl {
    pub name: String,
    /// Evaluation order; lower runs first.
    pub priority: i32,
    pub action: AclAction,
    pub source_nodes: Vec<String>,
    pub destination_nodes: Vec<String>,
    pub source_cidrs: Vec<String>,
    pub destination_cidrs: Vec<String>,
}

/// A named route advertised into the mesh by a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub name: String,
    /// The node advertising the route.
    pub node: String,
    pub destination_cidrs: Vec<String>,
    pub next_hop: Option<String>,
}

/// Accessor for ACLs and routes.
#[derive(Debug, Clone)]
pub struct Networking<S> {
    storage: S,
}

impl<S: Storage> Networking<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub async fn put_acl(&self, acl: &NetworkAcl) -> Result<(), RegistryError> {
        if !keys::valid_id(&acl.name) {
            return Err(RegistryError::InvalidName(acl.name.clone()));
        }
        let value = encode(acl)?;
        self.storage.put(&keys::acl_key(&acl.name), value).await?;
        Ok(())
    }

    pub async fn get_acl(&self, name: &str) -> Result<NetworkAcl, RegistryError> {
        let value = self.storage.get(&keys::acl_key(name)).await?;
        decode(&value)
    }

    pub async fn list_acls(&self) -> Result<Vec<NetworkAcl>, RegistryError> {
        let entries = self.storage.list(keys::ACLS_PREFIX).await?;
        entries.iter().map(|(_, value)| decode(value)).collect()
    }

    pub async fn delete_acl(&self, name: &str) -> Result<(), RegistryError> {
        self.storage.delete(&keys::acl_key(name)).await?;
        Ok(())
    }

    pub async fn put_route(&self, route: &Route) -> Result<(), RegistryError> {
        if !keys::valid_id(&route.name) {
            return Err(RegistryError::InvalidName(route.name.clone()));
        }
        let value = encode(route)?;
        self.storage
            .put(&keys::route_key(&route.name), value)
            .await?;
        Ok(())
    }

    pub async fn get_route(&self, name: &str) -> Result<Route, RegistryError> {
        let value = self.storage.get(&keys::route_key(name)).await?;
        decode(&value)
    }

    pub async fn list_routes(&self) -> Result<Vec<Route>, RegistryError> {
        let entries = self.storage.list(keys::ROUTES_PREFIX).await?;
        entries.iter().map(|(_, value)| decode(value)).collect()
    }

    pub async fn delete_route(&self, name: &str) -> Result<(), RegistryError> {
        self.storage.delete(&keys::route_key(name)).await?;
        Ok(())
    }
}

fn encode<T: Serialize>(record: &T) -> Result<Bytes, RegistryError> {
    serde_json::to_vec(record)
        .map(Bytes::from)
        .map_err(|e| RegistryError::InvalidRecord(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(value: &Bytes) -> Result<T, RegistryError> {
    serde_json::from_slice(value).map_err(|e| RegistryError::InvalidRecord(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_storage::MemoryStorage;

    fn acl(name: &str) -> NetworkAcl {
        NetworkAcl {
            name: name.to_string(),
            priority: 0,
            action: AclAction::Accept,
            source_nodes: vec!["*".to_string()],
            destination_nodes: vec!["*".to_string()],
            source_cidrs: Vec::new(),
            destination_cidrs: Vec::new(),
        }
    }

    #[test]
    fn test_system_acl_names() {
        assert!(is_system_acl("bootstrap-nodes"));
        assert!(is_system_acl("voters"));
        assert!(!is_system_acl("allow-dns"));
    }

    #[tokio::test]
    async fn test_acl_crud() {
        let networking = Networking::new(MemoryStorage::new());
        networking.put_acl(&acl("allow-dns")).await.unwrap();

        let fetched = networking.get_acl("allow-dns").await.unwrap();
        assert_eq!(fetched, acl("allow-dns"));

        networking.delete_acl("allow-dns").await.unwrap();
        assert!(networking.get_acl("allow-dns").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_route_crud() {
        let networking = Networking::new(MemoryStorage::new());
        let route = Route {
            name: "lan".to_string(),
            node: "gw".to_string(),
            destination_cidrs: vec!["192.168.1.0/24".to_string()],
            next_hop: None,
        };
        networking.put_route(&route).await.unwrap();
        assert_eq!(networking.get_route("lan").await.unwrap(), route);
        assert_eq!(networking.list_routes().await.unwrap().len(), 1);
    }
}
