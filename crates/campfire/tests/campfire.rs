//! Rendezvous and data-channel integration tests over an in-process relay.

use std::time::Duration;

use ember_campfire::proxy::{TunnelProxyClient, TunnelProxyServer};
use ember_campfire::{
    join, wait, CampfireError, CampfireOptions, RelayServer, SessionState,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tracing_test::traced_test;

const WAIT: Duration = Duration::from_secs(15);

async fn start_relay() -> String {
    let relay = RelayServer::bind("127.0.0.1:0").await.unwrap();
    let addr = relay.local_addr().unwrap();
    tokio::spawn(relay.run());
    addr.to_string()
}

fn options(psk: &[u8], relay: &str) -> CampfireOptions {
    CampfireOptions {
        psk: psk.to_vec(),
        relays: vec![relay.to_string()],
    }
}

#[tokio::test]
#[traced_test]
async fn test_wait_then_join_meets_and_carries_traffic() {
    let relay = start_relay().await;

    let mut keeper = wait(options(b"hello", &relay)).await.unwrap();
    assert_eq!(keeper.state(), SessionState::Open);

    let keeper_side = tokio::spawn(async move {
        let mut stream = keeper.accept().await.unwrap();

        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        stream.write_all(b"pong").await.unwrap();
        stream.flush().await.unwrap();
        keeper
    });

    let mut guest = tokio::time::timeout(WAIT, join(options(b"hello", &relay)))
        .await
        .expect("join timed out")
        .expect("join failed");

    guest.write_all(b"ping").await.unwrap();
    guest.flush().await.unwrap();

    let mut buf = [0u8; 4];
    tokio::time::timeout(WAIT, guest.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .unwrap();
    assert_eq!(&buf, b"pong");

    let keeper = keeper_side.await.unwrap();
    keeper.close().await;
    assert_eq!(keeper.state(), SessionState::Closed);
    // Closing again is a no-op.
    keeper.close().await;
}

#[tokio::test]
#[traced_test]
async fn test_join_without_keeper_reports_no_campfire() {
    let relay = start_relay().await;
    let result = join(options(b"nobody-home", &relay)).await;
    assert!(matches!(result, Err(CampfireError::NoCampfire)));
}

#[tokio::test]
#[traced_test]
async fn test_peers_with_different_psks_do_not_meet() {
    let relay = start_relay().await;

    let _keeper = wait(options(b"psk-one", &relay)).await.unwrap();
    let result = join(options(b"psk-two", &relay)).await;
    assert!(matches!(result, Err(CampfireError::NoCampfire)));
}

#[tokio::test]
#[traced_test]
async fn test_keeper_accepts_multiple_guests() {
    let relay = start_relay().await;

    let mut keeper = wait(options(b"shared", &relay)).await.unwrap();
    let keeper_side = tokio::spawn(async move {
        for _ in 0..2 {
            let mut stream = keeper.accept().await.unwrap();
            tokio::spawn(async move {
                let mut buf = [0u8; 2];
                stream.read_exact(&mut buf).await.unwrap();
                stream.write_all(&buf).await.unwrap();
                stream.flush().await.unwrap();
            });
        }
    });

    for _ in 0..2 {
        let mut guest = join(options(b"shared", &relay)).await.unwrap();
        guest.write_all(b"hi").await.unwrap();
        guest.flush().await.unwrap();
        let mut buf = [0u8; 2];
        tokio::time::timeout(WAIT, guest.read_exact(&mut buf))
            .await
            .expect("echo timed out")
            .unwrap();
        assert_eq!(&buf, b"hi");
    }

    keeper_side.await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn test_tunnel_proxy_bridges_udp_both_ways() {
    // Stand-in tunnel sockets on both sides.
    let server_tunnel = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_tunnel_port = server_tunnel.local_addr().unwrap().port();
    let client_tunnel = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client_tunnel_port = client_tunnel.local_addr().unwrap().port();

    let server = TunnelProxyServer::new(server_tunnel_port).await.unwrap();
    let (client, answer) = TunnelProxyClient::connect(server.offer(), client_tunnel_port)
        .await
        .unwrap();
    server.answer(&answer).unwrap();

    tokio::time::timeout(WAIT, server.established())
        .await
        .expect("channel never established");

    // Client tunnel → proxy → channel → server tunnel.
    client_tunnel
        .send_to(b"ping", client.local_addr())
        .await
        .unwrap();
    let mut buf = [0u8; 16];
    let (n, from) = tokio::time::timeout(WAIT, server_tunnel.recv_from(&mut buf))
        .await
        .expect("ping never arrived")
        .unwrap();
    assert_eq!(&buf[..n], b"ping");

    // And back again.
    server_tunnel.send_to(b"pong", from).await.unwrap();
    let (n, _) = tokio::time::timeout(WAIT, client_tunnel.recv_from(&mut buf))
        .await
        .expect("pong never arrived")
        .unwrap();
    assert_eq!(&buf[..n], b"pong");

    client.close().await;
    server.close().await;
}
