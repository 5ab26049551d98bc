//! End-to-end tests for bootstrap, admission, purge, and the admin surface.

use std::time::Duration;

use ember_consensus::{Observation, RaftRouter};
use ember_mesh::rbac::{AllowAll, DenyAll};
use ember_mesh::rpc::{RpcClient, RpcServer};
use ember_mesh::{
    AdminService, BroadcastWatchers, ClusterStatus, JoinRequest, JoinService, LeaveRequest,
    MeshEventKind, MeshStore, MeshStoreConfig, RecordingReconciler, ServiceError,
};
use ember_registry::PublicKey;
use tracing_test::traced_test;

const WAIT: Duration = Duration::from_secs(5);

type TestStore = MeshStore<RecordingReconciler, BroadcastWatchers>;

fn key(seed: u8) -> PublicKey {
    PublicKey::from_bytes([seed; 32])
}

fn bootstrap_config(id: &str, seed: u8) -> MeshStoreConfig {
    let mut config = MeshStoreConfig::new(id, key(seed));
    config.primary_endpoint = Some("203.0.113.1".parse().unwrap());
    config.bootstrap.enabled = true;
    config
}

async fn bootstrap_node(router: &RaftRouter) -> (TestStore, RecordingReconciler, BroadcastWatchers)
{
    let reconciler = RecordingReconciler::new();
    let watchers = BroadcastWatchers::new();
    let store = MeshStore::open(
        bootstrap_config("a", 1),
        router.clone(),
        reconciler.clone(),
        watchers.clone(),
    )
    .await
    .expect("store should open");
    store.bootstrap().await.expect("bootstrap should succeed");
    (store, reconciler, watchers)
}

async fn member_node(router: &RaftRouter, id: &str, seed: u8) -> TestStore {
    let mut config = MeshStoreConfig::new(id, key(seed));
    config.primary_endpoint = Some("203.0.113.2".parse().unwrap());
    MeshStore::open(
        config,
        router.clone(),
        RecordingReconciler::new(),
        BroadcastWatchers::new(),
    )
    .await
    .expect("store should open")
}

fn join_request(id: &str, seed: u8) -> JoinRequest {
    JoinRequest {
        id: id.to_string(),
        public_key: key(seed).to_string(),
        primary_endpoint: Some("203.0.113.2".to_string()),
        endpoints: Vec::new(),
        rpc_port: 8443,
        consensus_port: 9443,
        tunnel_port: 51820,
        assign_ipv4: true,
        prefer_consensus_ipv6: false,
        as_voter: true,
    }
}

async fn eventually<F, Fut>(mut check: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
#[traced_test]
async fn test_single_node_bootstrap() {
    let router = RaftRouter::new();
    let (store, _, _) = bootstrap_node(&router).await;

    assert!(store.is_leader());
    assert_eq!(store.cluster_status("a"), ClusterStatus::Leader);

    let peers = store.peers().list().await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].id, "a");

    let lease = store.ipam().get("a").await.unwrap();
    assert_eq!(lease.to_string(), "172.16.0.1/32");

    let ipv6_prefix = store.mesh_state().get_ipv6_prefix().await.unwrap();
    assert!(ipv6_prefix.contains(&peers[0].overlay_v6_addr()));
    assert_eq!(
        store.mesh_state().get_mesh_domain().await.unwrap(),
        "ember.internal"
    );
}

#[tokio::test]
#[traced_test]
async fn test_join_as_voter() {
    let router = RaftRouter::new();
    let (a, _, _) = bootstrap_node(&router).await;
    let _b = member_node(&router, "b", 2).await;

    let service = JoinService::new(a.clone());
    let response = service.join(join_request("b", 2)).await.unwrap();

    assert!(response.address_ipv4.is_some());
    assert!(!response.network_ipv6.is_empty());
    assert_eq!(response.peers.len(), 1);
    assert_eq!(response.peers[0].id, "a");
    let endpoint = response.peers[0].primary_endpoint.as_deref().unwrap();
    assert_eq!(endpoint, "203.0.113.1:51820");

    let (voters, _) = a.engine().membership();
    assert!(voters.contains("a") && voters.contains("b"), "voters: {voters:?}");
}

#[tokio::test]
#[traced_test]
async fn test_join_is_idempotent() {
    let router = RaftRouter::new();
    let (a, _, _) = bootstrap_node(&router).await;
    let _b = member_node(&router, "b", 2).await;

    let service = JoinService::new(a.clone());
    let first = service.join(join_request("b", 2)).await.unwrap();
    let record_after_first = a.peers().get("b").await.unwrap();

    let second = service.join(join_request("b", 2)).await.unwrap();
    let record_after_second = a.peers().get("b").await.unwrap();

    assert_eq!(first.address_ipv4, second.address_ipv4);
    assert_eq!(first.network_ipv6, second.network_ipv6);
    assert_eq!(record_after_first.overlay_v6, record_after_second.overlay_v6);
    assert_eq!(record_after_first.overlay_v4, record_after_second.overlay_v4);
    assert_eq!(record_after_first.public_key, record_after_second.public_key);
}

#[tokio::test]
#[traced_test]
async fn test_join_without_ipv4_allocates_no_lease() {
    let router = RaftRouter::new();
    let (a, _, _) = bootstrap_node(&router).await;
    let _b = member_node(&router, "b", 2).await;

    let mut request = join_request("b", 2);
    request.assign_ipv4 = false;
    request.as_voter = false;

    let service = JoinService::new(a.clone());
    let response = service.join(request).await.unwrap();

    assert_eq!(response.address_ipv4, None);
    assert!(a.ipam().get("b").await.unwrap_err().is_not_found());

    // The record reflects the join after the RPC returns.
    let record = a.peers().get("b").await.unwrap();
    assert_eq!(record.tunnel_port, 51820);
    assert_eq!(record.overlay_v4, None);
}

#[tokio::test]
#[traced_test]
async fn test_join_validation_errors() {
    let router = RaftRouter::new();
    let (a, _, _) = bootstrap_node(&router).await;
    let service = JoinService::new(a.clone());

    let mut no_id = join_request("b", 2);
    no_id.id = String::new();
    assert!(matches!(
        service.join(no_id).await,
        Err(ServiceError::InvalidArgument(_))
    ));

    let mut bad_key = join_request("b", 2);
    bad_key.public_key = "not-a-key".to_string();
    assert!(matches!(
        service.join(bad_key).await,
        Err(ServiceError::InvalidArgument(_))
    ));

    let mut bad_endpoint = join_request("b", 2);
    bad_endpoint.primary_endpoint = Some("256.1.2.3".to_string());
    assert!(matches!(
        service.join(bad_endpoint).await,
        Err(ServiceError::InvalidArgument(_))
    ));
}

#[tokio::test]
#[traced_test]
async fn test_join_on_follower_is_failed_precondition() {
    let router = RaftRouter::new();
    let (a, _, _) = bootstrap_node(&router).await;
    let b = member_node(&router, "b", 2).await;

    JoinService::new(a.clone())
        .join(join_request("b", 2))
        .await
        .unwrap();
    assert!(
        eventually(|| async { b.engine().current_leader().is_some() }, WAIT).await,
        "follower never learned the leader"
    );

    let result = JoinService::new(b.clone()).join(join_request("c", 3)).await;
    assert!(matches!(result, Err(ServiceError::FailedPrecondition(_))));
}

#[tokio::test]
#[traced_test]
async fn test_heartbeat_purge_on_leader() {
    let router = RaftRouter::new();
    let reconciler = RecordingReconciler::new();
    let watchers = BroadcastWatchers::new();
    let mut config = bootstrap_config("a", 1);
    config.heartbeat_purge_threshold = 3;
    let a: TestStore = MeshStore::open(config, router.clone(), reconciler.clone(), watchers)
        .await
        .unwrap();
    a.bootstrap().await.unwrap();
    let _b = member_node(&router, "b", 2).await;

    JoinService::new(a.clone())
        .join(join_request("b", 2))
        .await
        .unwrap();
    let refreshes_before_purge = reconciler.refresh_count();

    for _ in 0..3 {
        a.engine().hub().emit(Observation::FailedHeartbeat {
            id: "b".to_string(),
        });
    }

    let purged = eventually(
        || async { a.peers().get("b").await.is_err() },
        WAIT,
    )
    .await;
    assert!(purged, "peer b was never purged");

    let (voters, learners) = a.engine().membership();
    assert!(voters.contains("a"));
    assert!(!voters.contains("b") && !learners.contains("b"));

    // Removal produced another peer-table refresh via the observer.
    let refreshed = eventually(
        || async { reconciler.refresh_count() > refreshes_before_purge },
        WAIT,
    )
    .await;
    assert!(refreshed, "peer table was never refreshed after the purge");
}

#[tokio::test]
#[traced_test]
async fn test_purge_does_not_fire_below_threshold() {
    let router = RaftRouter::new();
    let reconciler = RecordingReconciler::new();
    let mut config = bootstrap_config("a", 1);
    config.heartbeat_purge_threshold = 3;
    let a: TestStore = MeshStore::open(
        config,
        router.clone(),
        reconciler,
        BroadcastWatchers::new(),
    )
    .await
    .unwrap();
    a.bootstrap().await.unwrap();
    let _b = member_node(&router, "b", 2).await;

    JoinService::new(a.clone())
        .join(join_request("b", 2))
        .await
        .unwrap();

    a.engine().hub().emit(Observation::FailedHeartbeat {
        id: "b".to_string(),
    });
    a.engine().hub().emit(Observation::FailedHeartbeat {
        id: "b".to_string(),
    });
    // A resume clears the counter, so two more failures stay below threshold.
    a.engine().hub().emit(Observation::ResumedHeartbeat {
        id: "b".to_string(),
    });
    a.engine().hub().emit(Observation::FailedHeartbeat {
        id: "b".to_string(),
    });
    a.engine().hub().emit(Observation::FailedHeartbeat {
        id: "b".to_string(),
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(a.peers().get("b").await.is_ok(), "peer b should survive");
}

#[tokio::test]
#[traced_test]
async fn test_delete_reserved_acl_is_rejected() {
    let router = RaftRouter::new();
    let (a, _, _) = bootstrap_node(&router).await;
    let admin = AdminService::new(a.clone(), AllowAll);

    let result = admin.delete_network_acl("bootstrap-nodes").await;
    assert!(matches!(result, Err(ServiceError::InvalidArgument(_))));

    // Storage untouched.
    assert!(a.networking().get_acl("bootstrap-nodes").await.is_ok());
}

#[tokio::test]
#[traced_test]
async fn test_admin_authorization_and_deletion() {
    let router = RaftRouter::new();
    let (a, _, _) = bootstrap_node(&router).await;

    let denied = AdminService::new(a.clone(), DenyAll);
    assert!(matches!(
        denied.delete_network_acl("anything").await,
        Err(ServiceError::PermissionDenied(_))
    ));

    let admin = AdminService::new(a.clone(), AllowAll);
    assert!(matches!(
        admin.delete_network_acl("").await,
        Err(ServiceError::InvalidArgument(_))
    ));

    // Deleting an unreserved ACL goes through.
    let acl = ember_registry::NetworkAcl {
        name: "allow-dns".to_string(),
        priority: 10,
        action: ember_registry::AclAction::Accept,
        source_nodes: vec!["*".to_string()],
        destination_nodes: vec!["*".to_string()],
        source_cidrs: Vec::new(),
        destination_cidrs: Vec::new(),
    };
    a.networking().put_acl(&acl).await.unwrap();
    admin.delete_network_acl("allow-dns").await.unwrap();
    assert!(a.networking().get_acl("allow-dns").await.is_err());
}

#[tokio::test]
#[traced_test]
async fn test_leader_change_event_carries_leader_status() {
    let router = RaftRouter::new();
    let (a, _, watchers) = bootstrap_node(&router).await;
    let mut events = watchers.subscribe();

    a.engine().hub().emit(Observation::LeaderChange {
        leader: "a".to_string(),
    });

    let event = tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if event.kind == MeshEventKind::LeaderChange {
                return event;
            }
        }
    })
    .await
    .expect("no leader change event");

    assert_eq!(event.node.id, "a");
    assert_eq!(event.status, ClusterStatus::Leader);
}

#[tokio::test]
#[traced_test]
async fn test_node_join_event_emitted_to_watchers() {
    let router = RaftRouter::new();
    let (a, _, watchers) = bootstrap_node(&router).await;
    let mut events = watchers.subscribe();
    let _b = member_node(&router, "b", 2).await;

    JoinService::new(a.clone())
        .join(join_request("b", 2))
        .await
        .unwrap();

    let event = tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if event.kind == MeshEventKind::NodeJoin && event.node.id == "b" {
                return event;
            }
        }
    })
    .await
    .expect("no node join event");
    assert!(matches!(
        event.status,
        ClusterStatus::Voter | ClusterStatus::NonVoter
    ));
}

#[tokio::test]
#[traced_test]
async fn test_leave_removes_node_and_lease() {
    let router = RaftRouter::new();
    let (a, _, _) = bootstrap_node(&router).await;
    let _b = member_node(&router, "b", 2).await;

    let service = JoinService::new(a.clone());
    service.join(join_request("b", 2)).await.unwrap();

    service
        .leave(LeaveRequest {
            id: "b".to_string(),
        })
        .await
        .unwrap();

    assert!(a.peers().get("b").await.unwrap_err().is_not_found());
    assert!(a.ipam().get("b").await.unwrap_err().is_not_found());
    let (voters, _) = a.engine().membership();
    assert!(!voters.contains("b"));
}

#[tokio::test]
#[traced_test]
async fn test_join_rpc_over_campfire_bootstrap_stream() {
    use ember_campfire::{join as campfire_join, wait, CampfireOptions, RelayServer};

    let relay = RelayServer::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = relay.local_addr().unwrap().to_string();
    tokio::spawn(relay.run());

    let router = RaftRouter::new();
    let (a, _, _) = bootstrap_node(&router).await;
    let _b = member_node(&router, "b", 2).await;

    let options = CampfireOptions {
        psk: b"bootstrap-psk".to_vec(),
        relays: vec![relay_addr],
    };

    // The bootstrap node keeps the campfire and serves the join RPC over
    // each accepted stream.
    let server = RpcServer::new(a.clone(), AllowAll);
    let mut keeper = wait(options.clone()).await.unwrap();
    tokio::spawn(async move {
        let stream = keeper.accept().await.unwrap();
        let _ = server.serve_stream(stream).await;
    });

    // The joiner meets it with nothing but the PSK.
    let stream = tokio::time::timeout(WAIT, campfire_join(options))
        .await
        .expect("campfire join timed out")
        .unwrap();
    let mut client = RpcClient::new(stream);
    let response = tokio::time::timeout(WAIT, client.join(join_request("b", 2)))
        .await
        .expect("join rpc timed out")
        .unwrap();

    assert!(response.address_ipv4.is_some());
    assert_eq!(response.peers.len(), 1);
    let (voters, _) = a.engine().membership();
    assert!(voters.contains("b"));
}

#[tokio::test]
#[traced_test]
async fn test_rpc_join_over_byte_stream() {
    let router = RaftRouter::new();
    let (a, _, _) = bootstrap_node(&router).await;
    let _b = member_node(&router, "b", 2).await;

    let server = RpcServer::new(a.clone(), AllowAll);
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        let _ = server.serve_stream(server_io).await;
    });

    let mut client = RpcClient::new(client_io);
    let response = client.join(join_request("b", 2)).await.unwrap();
    assert_eq!(response.peers.len(), 1);

    // Reserved deletion comes back as a typed error over the wire.
    let err = client.delete_network_acl("voters").await.unwrap_err();
    assert!(matches!(err, ServiceError::InvalidArgument(_)));
}
