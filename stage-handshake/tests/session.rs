//! End-to-end sessions over loopback.
//!
//! Each test starts a real [`ProtocolServer`] on an OS-chosen port and
//! drives it with [`ProtocolClient`] or with hand-built frames.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use stage_handshake::{
    messages::{DiscoveryReply, TransferAck, TransferPacket, GREETING},
    packet::{step, Frame},
    socket::Socket,
    ClientConfig, ListenerKind, ProtocolClient, ProtocolServer, ServerConfig,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn start_server(drop_rate: f64) -> ProtocolServer {
    init_logging();
    ProtocolServer::start(ServerConfig {
        drop_rate,
        ..ServerConfig::loopback()
    })
    .await
    .expect("start server")
}

fn fast_client(server: SocketAddr, client_id: u16) -> ProtocolClient {
    ProtocolClient::with_config(
        server,
        client_id,
        ClientConfig {
            ack_timeout: Duration::from_millis(100),
            ..ClientConfig::default()
        },
    )
}

async fn raw_socket() -> Socket {
    Socket::bind("127.0.0.1:0".parse().unwrap())
        .await
        .expect("bind raw socket")
}

/// Wait until only the discovery listener is left.
async fn settle(server: &ProtocolServer) {
    for _ in 0..100 {
        if server.active_listeners().len() == 1 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("listeners still open: {:?}", server.active_listeners());
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// One client walks all four stages and collects four distinct secrets.
#[tokio::test]
async fn full_session_yields_four_secrets() {
    let server = start_server(0.2).await;
    let client = fast_client(server.local_addr(), 592);

    let secrets = tokio::time::timeout(Duration::from_secs(10), client.run())
        .await
        .expect("session timed out")
        .expect("session failed");

    let labelled = secrets.labelled();
    assert_eq!(labelled.keys().copied().collect::<String>(), "abcd");
    let unique: HashSet<u32> = labelled.values().copied().collect();
    assert_eq!(unique.len(), 4);
    assert!(!unique.contains(&0));

    let registry = server.registry();
    for secret in unique {
        assert!(registry.is_expired(secret), "secret {secret} still active");
    }
    settle(&server).await;
    assert_eq!(registry.active_sessions(), 0);
    server.shutdown().await;
}

/// Stage C parameters drive stage D; every frame repeats the announced byte.
#[tokio::test]
async fn stages_can_be_driven_one_at_a_time() {
    let server = start_server(0.0).await;
    let client = fast_client(server.local_addr(), 7);

    let discovery = client.stage_a().await.unwrap();
    assert!((5..=10).contains(&discovery.packet_count));
    assert!((4..=40).contains(&discovery.chunk_len) && discovery.chunk_len % 4 == 0);
    assert!(server
        .active_listeners()
        .contains(&(discovery.udp_port, ListenerKind::Transfer)));

    let handoff = client.stage_b(&discovery).await.unwrap();
    assert!(server.registry().is_expired(discovery.secret));

    let bulk = client.stage_c(&handoff).await.unwrap();
    let params = *bulk.params();
    assert!((1..=10).contains(&params.repeat_count));
    assert!(params.bulk_payload().iter().all(|b| *b == params.expected_byte));
    assert!(server.registry().is_expired(handoff.secret));

    let d = client.stage_d(bulk).await.unwrap();
    assert_ne!(d, 0);
    assert!(server.registry().is_expired(params.secret));
    server.shutdown().await;
}

/// Fifty sessions in parallel never share a secret.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_clients_get_disjoint_secrets() {
    let server = start_server(0.2).await;
    let addr = server.local_addr();

    let handles: Vec<_> = (0..50u16)
        .map(|id| {
            let client = fast_client(addr, id);
            tokio::spawn(async move { client.run().await })
        })
        .collect();

    let mut all = HashSet::new();
    for handle in handles {
        let secrets = tokio::time::timeout(Duration::from_secs(30), handle)
            .await
            .expect("session timed out")
            .expect("client task panicked")
            .expect("session failed");
        for secret in secrets.labelled().into_values() {
            assert!(all.insert(secret), "secret {secret} issued twice");
        }
    }
    assert_eq!(all.len(), 200);

    settle(&server).await;
    server.shutdown().await;
}

/// With every id in the drop-once set, the first copy of a packet gets no
/// ack and the retransmission does.
#[tokio::test]
async fn drop_once_withholds_first_ack_on_the_wire() {
    let server = start_server(1.0).await;
    let sock = raw_socket().await;

    sock.send_to(&Frame::new(GREETING, 0, step::REQUEST, 11), server.local_addr())
        .await
        .unwrap();
    let (reply, _) = sock.recv_from().await.unwrap();
    let discovery = DiscoveryReply::parse(reply.payload()).unwrap();
    let transfer = SocketAddr::new(server.local_addr().ip(), discovery.udp_port);

    let packet = Frame::new(
        &TransferPacket {
            packet_id: 0,
            chunk_len: discovery.chunk_len,
        }
        .to_payload(),
        discovery.secret,
        step::REQUEST,
        11,
    );

    sock.send_to(&packet, transfer).await.unwrap();
    let first = tokio::time::timeout(Duration::from_millis(300), sock.recv_from()).await;
    assert!(first.is_err(), "first copy must not be acked");

    sock.send_to(&packet, transfer).await.unwrap();
    let (ack, from) = tokio::time::timeout(Duration::from_secs(1), sock.recv_from())
        .await
        .expect("retransmission must be acked")
        .unwrap();
    assert_eq!(from, transfer);
    assert_eq!(ack.stage(), step::RESPONSE);
    assert_eq!(ack.prev_secret(), discovery.secret);
    assert_eq!(TransferAck::parse(ack.payload()).unwrap().packet_id, 0);

    server.shutdown().await;
}

/// The client's retransmissions carry a session through a full drop set.
#[tokio::test]
async fn client_recovers_from_dropped_acks() {
    let server = start_server(1.0).await;
    let secrets = fast_client(server.local_addr(), 3).run().await.unwrap();
    assert_eq!(secrets.labelled().len(), 4);
    server.shutdown().await;
}

/// Garbage sent to the discovery port is ignored and harms nobody.
#[tokio::test]
async fn garbage_on_discovery_port_gets_no_reply() {
    let server = start_server(0.0).await;
    let sock = raw_socket().await;

    let mut overstated = Frame::new(b"hello world\0", 0, step::REQUEST, 1).encode();
    overstated[3] = 64;
    let datagrams: Vec<Vec<u8>> = vec![
        vec![1, 2, 3],
        vec![0; 13],
        overstated,
        Frame::new(b"hello world", 0, step::REQUEST, 1).encode(),
        Frame::new(GREETING, 9, step::REQUEST, 1).encode(),
        Frame::new(GREETING, 0, step::RESPONSE, 1).encode(),
    ];
    let std_sock = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    for d in &datagrams {
        std_sock.send_to(d, server.local_addr()).unwrap();
    }
    sock.send_to(&Frame::new(b"nope", 0, step::REQUEST, 1), server.local_addr())
        .await
        .unwrap();
    let reply = tokio::time::timeout(Duration::from_millis(300), sock.recv_from()).await;
    assert!(reply.is_err(), "garbage must not be answered");
    assert_eq!(server.active_listeners().len(), 1);

    let secrets = fast_client(server.local_addr(), 2).run().await.unwrap();
    assert_eq!(secrets.labelled().len(), 4);
    server.shutdown().await;
}

/// Shutdown closes half-finished sessions and releases every port.
#[tokio::test]
async fn shutdown_releases_every_listener() {
    let server = start_server(0.0).await;
    let mut secrets = Vec::new();
    for id in 0..3 {
        let discovery = fast_client(server.local_addr(), id).stage_a().await.unwrap();
        secrets.push(discovery.secret);
    }
    assert_eq!(server.active_listeners().len(), 4);

    let registry = server.registry().clone();
    server.shutdown().await;

    assert!(registry.listeners().is_empty());
    for secret in secrets {
        assert!(registry.is_expired(secret));
    }
    assert_eq!(registry.active_sessions(), 0);
}
