//! End-to-end tests running nodes over loopback TCP.

use crate::harness::{RawPeer, TestNode, EVENT_TIMEOUT};
use pickcluster_network::{
    Direction, Message, Ping, PeerId, PenaltyReason, ProtocolInfo, VersionMessage,
    PROTOCOL_VERSION,
};
use pickcluster_node::NodeEvent;
use std::time::Duration;
use tokio::net::TcpListener;

fn handshake_complete(event: &NodeEvent) -> Option<(PeerId, i32)> {
    match event {
        NodeEvent::HandshakeComplete { peer_id, version } => Some((*peer_id, *version)),
        _ => None,
    }
}

fn version_message(version: i32) -> Message {
    Message::Version(VersionMessage {
        version,
        user_agent: "/raw:0.1/".into(),
        nonce: 7,
        ..Default::default()
    })
}

#[tokio::test]
async fn test_handshake_negotiates_lower_version() {
    let mut a = TestNode::start(70015).await;
    let mut b = TestNode::start(70012).await;
    a.connect_to(&b);

    let (a_peer, a_version) = a.wait_for(handshake_complete).await;
    let (b_peer, b_version) = b.wait_for(handshake_complete).await;
    assert_eq!(a_version, 70012);
    assert_eq!(b_version, 70012);

    let a_peers = a.handle.peers().await.unwrap();
    assert_eq!(a_peers.len(), 1);
    assert_eq!(a_peers[0].id, a_peer);
    assert_eq!(a_peers[0].direction, Direction::Outbound);
    assert_eq!(a_peers[0].version, 70012);
    assert!(a_peers[0].user_agent.starts_with("/pickcluster:"));

    let b_peers = b.handle.peers().await.unwrap();
    assert_eq!(b_peers.len(), 1);
    assert_eq!(b_peers[0].id, b_peer);
    assert_eq!(b_peers[0].direction, Direction::Inbound);
    assert_eq!(b_peers[0].tolerance, 100);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_duplicate_version_disconnects_peer() {
    let mut a = TestNode::start(70015).await;
    let mut b = TestNode::start(70012).await;
    a.connect_to(&b);

    let (a_peer, _) = a.wait_for(handshake_complete).await;
    let (b_peer, _) = b.wait_for(handshake_complete).await;

    b.handle
        .send_message(b_peer, version_message(70012))
        .unwrap();

    let (reason, tolerance) = a
        .wait_for(|event| match event {
            NodeEvent::PeerPenalized {
                peer_id,
                reason,
                tolerance,
            } if *peer_id == a_peer => Some((*reason, *tolerance)),
            _ => None,
        })
        .await;
    assert_eq!(reason, PenaltyReason::DuplicateHandshake);
    assert_eq!(tolerance, 0);

    a.wait_for(|event| match event {
        NodeEvent::PeerDisconnected { peer_id } if *peer_id == a_peer => Some(()),
        _ => None,
    })
    .await;
    b.wait_for(|event| match event {
        NodeEvent::PeerDisconnected { peer_id } if *peer_id == b_peer => Some(()),
        _ => None,
    })
    .await;

    assert!(a.handle.peers().await.unwrap().is_empty());
    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_message_before_handshake_is_penalized() {
    let mut node = TestNode::start(PROTOCOL_VERSION).await;
    let mut raw = RawPeer::connect(node.addr(), ProtocolInfo::regtest(), PROTOCOL_VERSION).await;

    let peer = node
        .wait_for(|event| match event {
            NodeEvent::PeerConnected { peer_id, info } => {
                assert_eq!(info.direction, Direction::Inbound);
                Some(*peer_id)
            }
            _ => None,
        })
        .await;

    raw.send(&Message::Ping(Ping { nonce: 1 })).await.unwrap();
    let tolerance = node
        .wait_for(|event| match event {
            NodeEvent::PeerPenalized {
                peer_id,
                reason: PenaltyReason::UnexpectedMessage,
                tolerance,
            } if *peer_id == peer => Some(*tolerance),
            _ => None,
        })
        .await;
    assert_eq!(tolerance, 90);

    // Still connected; the handshake can proceed.
    raw.send(&version_message(PROTOCOL_VERSION)).await.unwrap();
    match raw.recv().await.unwrap() {
        Some(Message::Version(version)) => {
            assert_eq!(version.version, PROTOCOL_VERSION);
            assert!(version.user_agent.starts_with("/pickcluster:"));
        }
        other => panic!("expected version, got {other:?}"),
    }
    assert_eq!(raw.recv().await.unwrap(), Some(Message::Verack));

    let (id, version) = node.wait_for(handshake_complete).await;
    assert_eq!(id, peer);
    assert_eq!(version, PROTOCOL_VERSION);

    node.stop().await;
    raw.expect_closed(EVENT_TIMEOUT).await;
}

#[tokio::test]
async fn test_repeated_version_zero_is_penalized() {
    let mut node = TestNode::start(PROTOCOL_VERSION).await;
    let mut raw = RawPeer::connect(node.addr(), ProtocolInfo::regtest(), PROTOCOL_VERSION).await;

    raw.send(&version_message(0)).await.unwrap();
    assert!(matches!(raw.recv().await.unwrap(), Some(Message::Version(_))));
    assert_eq!(raw.recv().await.unwrap(), Some(Message::Verack));
    let (peer, version) = node.wait_for(handshake_complete).await;
    assert_eq!(version, 0);

    // A second version is a duplicate even though the first declared 0.
    raw.send(&version_message(0)).await.unwrap();
    let (reason, tolerance) = node
        .wait_for(|event| match event {
            NodeEvent::PeerPenalized {
                peer_id,
                reason,
                tolerance,
            } if *peer_id == peer => Some((*reason, *tolerance)),
            NodeEvent::HandshakeComplete { .. } => panic!("handshake completed twice"),
            _ => None,
        })
        .await;
    assert_eq!(reason, PenaltyReason::DuplicateHandshake);
    assert_eq!(tolerance, 0);
    raw.expect_closed(EVENT_TIMEOUT).await;

    node.stop().await;
}

#[tokio::test]
async fn test_verack_before_version_is_penalized() {
    let mut node = TestNode::start(PROTOCOL_VERSION).await;
    let mut raw = RawPeer::connect(node.addr(), ProtocolInfo::regtest(), PROTOCOL_VERSION).await;

    raw.send(&Message::Verack).await.unwrap();
    let reason = node
        .wait_for(|event| match event {
            NodeEvent::PeerPenalized { reason, .. } => Some(*reason),
            _ => None,
        })
        .await;
    assert_eq!(reason, PenaltyReason::UnexpectedMessage);

    node.stop().await;
}

#[tokio::test]
async fn test_ping_measures_latency() {
    let mut a = TestNode::start_with(70015, Duration::from_millis(100)).await;
    let mut b = TestNode::start(70015).await;
    a.connect_to(&b);

    let (peer, _) = a.wait_for(handshake_complete).await;
    b.wait_for(handshake_complete).await;

    let latency = tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            let peers = a.handle.peers().await.unwrap();
            if let Some(latency) = peers.iter().find(|p| p.id == peer).and_then(|p| p.latency) {
                return latency;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("no latency sample");
    assert!(latency < Duration::from_secs(30));

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_old_peer_gets_nonceless_ping() {
    let mut node = TestNode::start_with(PROTOCOL_VERSION, Duration::from_millis(100)).await;
    let mut raw = RawPeer::connect(node.addr(), ProtocolInfo::regtest(), 60000).await;

    raw.send(&version_message(60000)).await.unwrap();
    assert!(matches!(raw.recv().await.unwrap(), Some(Message::Version(_))));
    assert_eq!(raw.recv().await.unwrap(), Some(Message::Verack));

    let (_, version) = node.wait_for(handshake_complete).await;
    assert_eq!(version, 60000);

    // At 60000 the ping carries no payload, which decodes to nonce 0.
    let ping = tokio::time::timeout(EVENT_TIMEOUT, raw.recv())
        .await
        .expect("no ping")
        .unwrap();
    assert_eq!(ping, Some(Message::Ping(Ping { nonce: 0 })));

    node.stop().await;
}

#[tokio::test]
async fn test_connect_failure_is_reported() {
    let mut node = TestNode::start(PROTOCOL_VERSION).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    node.handle.connect("127.0.0.1", port).unwrap();
    let (host, failed_port) = node
        .wait_for(|event| match event {
            NodeEvent::ConnectFailed { hostname, port, .. } => Some((hostname.clone(), *port)),
            _ => None,
        })
        .await;
    assert_eq!(host, "127.0.0.1");
    assert_eq!(failed_port, port);
    assert!(node.handle.peers().await.unwrap().is_empty());

    node.stop().await;
}

#[tokio::test]
async fn test_disconnect_and_shutdown() {
    let mut a = TestNode::start(70015).await;
    let mut b = TestNode::start(70015).await;
    let c = TestNode::start(70015).await;
    a.connect_to(&b);
    a.connect_to(&c);

    let (first, _) = a.wait_for(handshake_complete).await;
    let (second, _) = a.wait_for(handshake_complete).await;
    assert_ne!(first, second);

    a.handle.disconnect(first).unwrap();
    a.wait_for(|event| match event {
        NodeEvent::PeerDisconnected { peer_id } if *peer_id == first => Some(()),
        _ => None,
    })
    .await;
    let remaining = a.handle.peers().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, second);

    // Stopping a node closes its remaining connections.
    a.stop().await;
    b.wait_for(|event| match event {
        NodeEvent::PeerDisconnected { .. } => Some(()),
        _ => None,
    })
    .await;

    b.stop().await;
    c.stop().await;
}
