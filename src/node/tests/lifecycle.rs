//! Node lifecycle: idempotent start/stop.

use super::*;
use crate::node::{NodeError, NodeState};

#[tokio::test]
async fn test_start_is_idempotent() {
    let node = Node::new(test_config()).unwrap();
    node.start().await.unwrap();
    assert_eq!(node.state(), NodeState::Running);
    let addr = node.local_addr().unwrap();

    // Second start is a no-op and keeps the same listener.
    node.start().await.unwrap();
    assert_eq!(node.state(), NodeState::Running);
    assert_eq!(node.local_addr(), Some(addr));

    node.stop().await;
    assert_eq!(node.state(), NodeState::Stopped);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let node = start_node().await;
    node.stop().await;
    node.stop().await;
    assert_eq!(node.state(), NodeState::Stopped);
}

#[tokio::test]
async fn test_stop_before_start_is_safe() {
    let node = Node::new(test_config()).unwrap();
    node.stop().await;
    assert_eq!(node.state(), NodeState::Created);

    node.start().await.unwrap();
    assert_eq!(node.state(), NodeState::Running);
    node.stop().await;
    assert_eq!(node.state(), NodeState::Stopped);
}

#[tokio::test]
async fn test_send_requires_running() {
    let node = Node::new(test_config()).unwrap();
    let target = crate::identity::NodeId::from_bytes([1; 16]);
    assert!(matches!(
        node.send(target, b"too early").await,
        Err(NodeError::NotRunning)
    ));
}

#[tokio::test]
async fn test_connect_requires_running() {
    let node = Node::new(test_config()).unwrap();
    assert!(matches!(
        node.connect("127.0.0.1", 1).await,
        Err(NodeError::NotRunning)
    ));
}

#[tokio::test]
async fn test_seeded_identity() {
    let mut config = test_config();
    config.node.identity_seed = Some("ab".repeat(32));
    let node_a = Node::new(config.clone()).unwrap();
    let node_b = Node::new(config).unwrap();
    assert_eq!(node_a.local_id(), node_b.local_id());
}
