//! Integration tests over real localhost sockets.

use super::*;
use crate::config::Config;
use std::time::Duration;

mod handshake;
mod lifecycle;
mod recovery;

/// Test configuration: loopback, kernel-assigned port, no discovery.
pub(super) fn test_config() -> Config {
    let mut config = Config::default();
    config.node.bind_addr = "127.0.0.1".into();
    config.node.service_port = 0;
    config.discovery.enabled = false;
    config
}

/// Create and start a node on a kernel-assigned port.
pub(super) async fn start_node() -> Node {
    let node = Node::new(test_config()).expect("node creation");
    node.start().await.expect("node start");
    node
}

/// Poll a condition until it holds or the timeout elapses.
pub(super) async fn wait_for<F: Fn() -> bool>(timeout: Duration, cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    cond()
}

/// Connect `a` to `b` and wait for mutual authentication.
pub(super) async fn connect_pair(a: &Node, b: &Node) {
    let addr = b.local_addr().expect("b bound");
    a.connect("127.0.0.1", addr.port()).await.expect("connect");
    assert!(
        wait_for(Duration::from_secs(2), || a.peer_count() == 1
            && b.peer_count() == 1)
        .await,
        "nodes failed to authenticate within 2s"
    );
}
