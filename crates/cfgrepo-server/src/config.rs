use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cfgrepo_meta::{NodeConfig, NodeId, RaftConfig, TcpNetworkConfig};
use cfgrepo_mirror::MirroringServicePluginConfig;
use serde::{Deserialize, Serialize};

/// Election and heartbeat timing of the replication group, and how
/// replicas reach each other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        let raft = RaftConfig::default();
        Self {
            election_timeout_min_ms: raft.election_timeout_min_ms,
            election_timeout_max_ms: raft.election_timeout_max_ms,
            heartbeat_interval_ms: raft.heartbeat_interval_ms,
            connect_timeout_ms: TcpNetworkConfig::default().connect_timeout_ms,
        }
    }
}

/// Another member of the replication group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: u64,
    /// `host:port` the peer listens on for replication traffic.
    pub addr: String,
}

impl PeerConfig {
    pub fn new(id: u64, addr: impl Into<String>) -> Self {
        Self {
            id,
            addr: addr.into(),
        }
    }
}

/// Configuration of one `cfgrepo` server process, which runs one member
/// of the replication group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub node_id: u64,
    /// `host:port` to accept replication traffic on.
    pub bind_addr: String,
    pub peers: Vec<PeerConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    /// Data directory of this member. Absent means in-memory storage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    /// Where remote Git repositories are cloned for mirroring. Defaults to
    /// `<data_dir>/git-cache`, else a directory under the system temp dir.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_cache_dir: Option<PathBuf>,
    pub log_level: String,
    pub replication: ReplicationConfig,
    pub command_timeout_ms: u64,
    pub repository_cache_capacity: usize,
    pub watch_timeout_ms: u64,
    pub dedup_window: usize,
    pub mirroring: MirroringServicePluginConfig,
    pub mirroring_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            bind_addr: String::from("127.0.0.1:36462"),
            peers: Vec::new(),
            zone: None,
            data_dir: None,
            git_cache_dir: None,
            log_level: String::from("info"),
            replication: ReplicationConfig::default(),
            command_timeout_ms: 10_000,
            repository_cache_capacity: 1024,
            watch_timeout_ms: 60_000,
            dedup_window: 4096,
            mirroring: MirroringServicePluginConfig::default(),
            mirroring_interval_secs: 60,
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ServerConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings no replica could run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_addr.rsplit_once(':').is_none() {
            anyhow::bail!("bind_addr must be host:port, got '{}'", self.bind_addr);
        }
        let mut ids: Vec<u64> = self.peers.iter().map(|p| p.id).collect();
        if ids.contains(&self.node_id) {
            anyhow::bail!("node {} is listed among its own peers", self.node_id);
        }
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.peers.len() {
            anyhow::bail!("duplicate peer IDs in {:?}", self.peers);
        }
        if let Some(peer) = self.peers.iter().find(|p| p.addr.rsplit_once(':').is_none()) {
            anyhow::bail!("peer {} address must be host:port, got '{}'", peer.id, peer.addr);
        }
        let r = &self.replication;
        if r.heartbeat_interval_ms == 0 || r.election_timeout_min_ms == 0 {
            anyhow::bail!("replication timings must be positive");
        }
        if r.election_timeout_min_ms > r.election_timeout_max_ms {
            anyhow::bail!(
                "election_timeout_min_ms ({}) exceeds election_timeout_max_ms ({})",
                r.election_timeout_min_ms,
                r.election_timeout_max_ms
            );
        }
        if r.heartbeat_interval_ms >= r.election_timeout_min_ms {
            anyhow::bail!("heartbeat_interval_ms must be below election_timeout_min_ms");
        }
        if self.mirroring_interval_secs == 0 {
            anyhow::bail!("mirroring_interval_secs must be positive");
        }
        self.mirroring.validate()?;
        Ok(())
    }

    /// Every replica of the group, this node first.
    pub fn members(&self) -> Vec<NodeId> {
        std::iter::once(self.node_id)
            .chain(self.peers.iter().map(|p| p.id))
            .map(NodeId::new)
            .collect()
    }

    /// Replication addresses of the other members.
    pub fn peer_addresses(&self) -> HashMap<NodeId, String> {
        self.peers
            .iter()
            .map(|p| (NodeId::new(p.id), p.addr.clone()))
            .collect()
    }

    /// Configuration of this process's replica.
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            node_id: NodeId::new(self.node_id),
            peers: self.peers.iter().map(|p| NodeId::new(p.id)).collect(),
            data_dir: self.data_dir.clone(),
            raft: RaftConfig {
                election_timeout_min_ms: self.replication.election_timeout_min_ms,
                election_timeout_max_ms: self.replication.election_timeout_max_ms,
                heartbeat_interval_ms: self.replication.heartbeat_interval_ms,
                ..RaftConfig::default()
            },
            command_timeout: Duration::from_millis(self.command_timeout_ms),
            watch_timeout: Duration::from_millis(self.watch_timeout_ms),
            cache_capacity: self.repository_cache_capacity,
            dedup_window: self.dedup_window,
        }
    }

    pub fn network_config(&self) -> TcpNetworkConfig {
        TcpNetworkConfig {
            connect_timeout_ms: self.replication.connect_timeout_ms,
            ..TcpNetworkConfig::default()
        }
    }

    pub fn mirroring_interval(&self) -> Duration {
        Duration::from_secs(self.mirroring_interval_secs)
    }

    pub fn git_cache_dir(&self) -> PathBuf {
        match (&self.git_cache_dir, &self.data_dir) {
            (Some(dir), _) => dir.clone(),
            (None, Some(data)) => data.join("git-cache"),
            (None, None) => std::env::temp_dir().join(format!("cfgrepo-git-{}", self.node_id)),
        }
    }
}
