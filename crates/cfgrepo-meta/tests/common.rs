//! Common test utilities and fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cfgrepo_meta::{LocalNetwork, Node, NodeConfig, NodeId, RaftConfig};

/// Routes cluster logs to the test harness. Set `RUST_LOG` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Test configuration with sensible defaults for fast testing
pub struct TestConfig {
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub command_timeout: Duration,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: 60,
            election_timeout_max_ms: 120,
            heartbeat_interval_ms: 15,
            command_timeout: Duration::from_secs(5),
        }
    }
}

/// An in-process cluster of replicas connected by a [`LocalNetwork`].
pub struct TestCluster {
    pub network: Arc<LocalNetwork>,
    pub nodes: Vec<Node>,
}

impl TestCluster {
    /// Starts `size` replicas with IDs 1..=size.
    pub fn start(size: u64) -> Self {
        Self::start_with(size, TestConfig::default())
    }

    pub fn start_with(size: u64, config: TestConfig) -> Self {
        init_tracing();
        let network = LocalNetwork::new();
        let ids: Vec<NodeId> = (1..=size).map(NodeId::new).collect();
        let nodes = ids
            .iter()
            .map(|&id| {
                let inbox = network.register(id);
                let node_config = NodeConfig {
                    node_id: id,
                    peers: ids.iter().copied().filter(|&p| p != id).collect(),
                    raft: RaftConfig {
                        election_timeout_min_ms: config.election_timeout_min_ms,
                        election_timeout_max_ms: config.election_timeout_max_ms,
                        heartbeat_interval_ms: config.heartbeat_interval_ms,
                        ..RaftConfig::default()
                    },
                    command_timeout: config.command_timeout,
                    ..NodeConfig::default()
                };
                Node::start(node_config, network.clone(), inbox).unwrap()
            })
            .collect();
        Self { network, nodes }
    }

    pub fn node(&self, id: NodeId) -> &Node {
        self.nodes
            .iter()
            .find(|n| n.node_id() == id)
            .unwrap()
    }

    /// Waits until exactly one reachable node leads and every reachable
    /// node agrees on it. Nodes in `excluded` are ignored.
    pub async fn wait_for_leader_excluding(&self, excluded: &[NodeId]) -> NodeId {
        for _ in 0..400 {
            let live: Vec<&Node> = self
                .nodes
                .iter()
                .filter(|n| !excluded.contains(&n.node_id()))
                .collect();
            let leaders: Vec<NodeId> = live
                .iter()
                .filter(|n| n.is_leader())
                .map(|n| n.node_id())
                .collect();
            if let [leader] = leaders[..] {
                if live.iter().all(|n| n.status().leader == Some(leader)) {
                    return leader;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no stable leader elected");
    }

    pub async fn wait_for_leader(&self) -> NodeId {
        self.wait_for_leader_excluding(&[]).await
    }

    pub fn followers(&self, leader: NodeId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .map(|n| n.node_id())
            .filter(|&id| id != leader)
            .collect()
    }

    /// Polls `check` on every listed node until it holds everywhere.
    pub async fn wait_until<F>(&self, ids: &[NodeId], check: F)
    where
        F: Fn(&Node) -> bool,
    {
        for _ in 0..400 {
            if ids.iter().all(|&id| check(self.node(id))) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached on nodes {:?}", ids);
    }

    pub fn all_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.node_id()).collect()
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown().await;
        }
    }
}
