//! Reserved key layout for the mesh registry.

/// Root of the replicated keyspace.
pub const REGISTRY_PREFIX: &str = "/registry";

/// Prefix for mesh-wide settings.
pub const MESH_STATE_PREFIX: &str = "/registry/meshstate";

/// The mesh-wide IPv4 CIDR.
pub const IPV4_PREFIX_KEY: &str = "/registry/meshstate/ipv4prefix";

/// The mesh-wide IPv6 ULA prefix.
pub const IPV6_PREFIX_KEY: &str = "/registry/meshstate/ipv6prefix";

/// The DNS suffix for the mesh.
pub const MESH_DOMAIN_KEY: &str = "/registry/meshstate/meshdomain";

/// Prefix for serialized node records.
pub const NODES_PREFIX: &str = "/registry/nodes/";

/// Prefix for IPv4 leases.
pub const IPAM_PREFIX: &str = "/registry/ipam/";

/// Prefix for network ACLs.
pub const ACLS_PREFIX: &str = "/registry/acls/";

/// Prefix for routes.
pub const ROUTES_PREFIX: &str = "/registry/routes/";

/// Key for the node record of `id`.
pub fn node_key(id: &str) -> String {
    format!("{NODES_PREFIX}{id}")
}

/// Key for the IPv4 lease of `id`.
pub fn ipam_key(id: &str) -> String {
    format!("{IPAM_PREFIX}{id}")
}

/// Key for the network ACL named `name`.
pub fn acl_key(name: &str) -> String {
    format!("{ACLS_PREFIX}{name}")
}

/// Key for the route named `name`.
pub fn route_key(name: &str) -> String {
    format!("{ROUTES_PREFIX}{name}")
}

/// Whether `id` is usable as a key segment: non-empty and slash-free.
pub fn valid_id(id: &str) -> bool {
    !id.is_empty() && !id.contains('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_construction() {
        assert_eq!(node_key("node-a"), "/registry/nodes/node-a");
        assert_eq!(ipam_key("node-a"), "/registry/ipam/node-a");
        assert_eq!(acl_key("allow-all"), "/registry/acls/allow-all");
        assert_eq!(route_key("default"), "/registry/routes/default");
    }

    #[test]
    fn test_valid_id() {
        assert!(valid_id("node-a"));
        assert!(!valid_id(""));
        assert!(!valid_id("a/b"));
    }
}
