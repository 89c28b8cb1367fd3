//! End-to-end handshake scenarios.

use super::*;
use crate::monitor::EventKind;
use crate::protocol::{DataBody, DataState, EnvelopeBody, MessageEnvelope, MessageId};
use crate::session::encode_frame;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[tokio::test]
async fn test_two_node_handshake() {
    let a = start_node().await;
    let b = start_node().await;

    connect_pair(&a, &b).await;

    // Each side sees exactly the other.
    let a_peers = a.peers();
    let b_peers = b.peers();
    assert_eq!(a_peers.len(), 1);
    assert_eq!(b_peers.len(), 1);
    assert_eq!(a_peers[0].peer_id, b.local_id());
    assert_eq!(b_peers[0].peer_id, a.local_id());

    // The peer record carries the peer's dialable service port.
    assert_eq!(a_peers[0].port, b.local_addr().unwrap().port());

    // Exactly one PeerConnected event per side.
    assert_eq!(a.events.count(EventKind::PeerConnected), 1);
    assert_eq!(b.events.count(EventKind::PeerConnected), 1);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_simultaneous_connect_settles_to_one_peer() {
    let a = start_node().await;
    let b = start_node().await;

    let a_port = a.local_addr().unwrap().port();
    let b_port = b.local_addr().unwrap().port();

    let (ra, rb) = tokio::join!(
        a.connect("127.0.0.1", b_port),
        b.connect("127.0.0.1", a_port)
    );
    ra.unwrap();
    rb.unwrap();

    assert!(
        wait_for(Duration::from_secs(2), || a.peer_count() == 1
            && b.peer_count() == 1)
        .await
    );

    // Let the losing session of the race finish closing.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(a.peer_count(), 1);
    assert_eq!(b.peer_count(), 1);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_unauthenticated_data_closes_session() {
    let node = start_node().await;
    let addr = node.local_addr().unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();

    // A data envelope before any handshake violates the auth gate.
    let envelope = MessageEnvelope::new(
        crate::identity::NodeId::from_bytes([7; 16]),
        EnvelopeBody::Data(DataBody::control(
            MessageId::generate(),
            1,
            0,
            DataState::Chunk,
        )),
    );
    stream.write_all(&encode_frame(&envelope)).await.unwrap();

    // The node closes the transport.
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("node should close the connection");
    assert_eq!(read.unwrap(), 0);

    assert!(
        wait_for(Duration::from_secs(1), || node
            .events
            .count(EventKind::PeerDisconnected)
            == 1)
        .await
    );
    assert_eq!(node.peer_count(), 0);

    node.stop().await;
}

#[tokio::test]
async fn test_stopped_peer_disconnect_observed() {
    let a = start_node().await;
    let b = start_node().await;
    connect_pair(&a, &b).await;

    b.stop().await;

    assert!(
        wait_for(Duration::from_secs(2), || a.peer_count() == 0).await,
        "peer should drop after remote shutdown"
    );
    assert!(a.events.count(EventKind::PeerDisconnected) >= 1);

    a.stop().await;
}
