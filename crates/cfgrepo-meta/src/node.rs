//! Replica assembly.
//!
//! A [`Node`] owns one replica's storage, projects, watches, consensus loop
//! and command executor. Reads go straight to local repositories; every
//! mutation goes through [`Node::execute`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::cache::{CacheConfig, CachingRepository, RepositoryCache};
use crate::command::{Command, CommandOutcome};
use crate::consensus::RaftConfig;
use crate::coordinator::{CoordinatorStatus, ReplicationCoordinator};
use crate::error::MetaError;
use crate::executor::{CommandApplier, CommandExecutor, DEFAULT_COMMAND_TIMEOUT, DEFAULT_DEDUP_WINDOW};
use crate::kvstore::{KvStore, MemoryKvStore};
use crate::network::{Inbox, Transport};
use crate::project::{ProjectContext, ProjectManager};
use crate::raft_log::RaftLogStore;
use crate::types::{NodeId, Revision};
use crate::wal_store::FileKvStore;
use crate::watch::{WatchHandle, WatchRegistry, WatchTarget};

/// Default bound on a watch when the caller gives none.
pub const DEFAULT_WATCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration for one replica.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// This replica's ID.
    pub node_id: NodeId,
    /// The other replicas.
    pub peers: Vec<NodeId>,
    /// Data directory for persistent storage (None = in-memory).
    pub data_dir: Option<PathBuf>,
    /// Election and heartbeat timing.
    pub raft: RaftConfig,
    /// How long a command may wait to be applied.
    pub command_timeout: Duration,
    /// Default bound on watches.
    pub watch_timeout: Duration,
    /// Cached query results per repository.
    pub cache_capacity: usize,
    /// Request IDs remembered for deduplication.
    pub dedup_window: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::new(1),
            peers: Vec::new(),
            data_dir: None,
            raft: RaftConfig::default(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            watch_timeout: DEFAULT_WATCH_TIMEOUT,
            cache_capacity: CacheConfig::default().capacity_per_repository,
            dedup_window: DEFAULT_DEDUP_WINDOW,
        }
    }
}

/// One running replica.
pub struct Node {
    config: NodeConfig,
    kv: Arc<dyn KvStore>,
    registry: Arc<WatchRegistry>,
    cache: Arc<RepositoryCache>,
    projects: Arc<ProjectManager>,
    coordinator: Arc<ReplicationCoordinator>,
    executor: CommandExecutor,
}

impl Node {
    /// Opens storage, reloads projects and starts replication.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        inbox: Inbox,
    ) -> Result<Self, MetaError> {
        let kv: Arc<dyn KvStore> = match &config.data_dir {
            Some(dir) => Arc::new(FileKvStore::open(dir)?),
            None => Arc::new(MemoryKvStore::new()),
        };

        let registry = Arc::new(WatchRegistry::new());
        let cache = Arc::new(RepositoryCache::new(CacheConfig {
            capacity_per_repository: config.cache_capacity,
        }));
        let projects = Arc::new(ProjectManager::new(ProjectContext {
            kv: kv.clone(),
            registry: registry.clone(),
            cache: cache.clone(),
        }));
        projects.open_existing()?;

        let applier = Arc::new(CommandApplier::new(
            projects.clone(),
            kv.clone(),
            config.dedup_window,
        )?);
        let raft = RaftConfig {
            node_id: config.node_id,
            peers: config.peers.clone(),
            ..config.raft.clone()
        };
        let coordinator = Arc::new(ReplicationCoordinator::start(
            raft,
            RaftLogStore::new(kv.clone()),
            applier,
            transport,
            inbox,
        )?);
        let executor = CommandExecutor::new(coordinator.clone(), config.command_timeout);

        tracing::info!(
            node_id = %config.node_id,
            persistent = config.data_dir.is_some(),
            projects = projects.list().len(),
            "node started"
        );

        Ok(Self {
            config,
            kv,
            registry,
            cache,
            projects,
            coordinator,
            executor,
        })
    }

    /// This replica's ID.
    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    /// The configuration the node was started with.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Local projects.
    pub fn projects(&self) -> &Arc<ProjectManager> {
        &self.projects
    }

    /// Local watch registry.
    pub fn watches(&self) -> &Arc<WatchRegistry> {
        &self.registry
    }

    /// Query result cache.
    pub fn cache(&self) -> &Arc<RepositoryCache> {
        &self.cache
    }

    /// Underlying key-value store.
    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    /// Command entry point.
    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    /// Consensus state.
    pub fn status(&self) -> CoordinatorStatus {
        self.coordinator.status()
    }

    /// Returns true if this replica leads.
    pub fn is_leader(&self) -> bool {
        self.coordinator.is_leader()
    }

    /// Starts an election now.
    pub fn campaign(&self) -> Result<(), MetaError> {
        self.coordinator.campaign()
    }

    /// Executes a mutation through replication.
    pub async fn execute(&self, command: Command) -> Result<CommandOutcome, MetaError> {
        self.executor.execute(command).await
    }

    /// Executes a mutation under a caller-chosen request ID, so a client
    /// can retry it safely, also across restarts of this replica.
    pub async fn execute_with_request_id(
        &self,
        request_id: Uuid,
        command: Command,
    ) -> Result<CommandOutcome, MetaError> {
        self.executor
            .execute_with_request_id(request_id, command)
            .await
    }

    /// A cached read view of a local repository.
    pub fn repository(&self, project: &str, repository: &str) -> Result<CachingRepository, MetaError> {
        self.projects.repository(project, repository)
    }

    /// Watches a local repository. `None` uses the configured default
    /// timeout.
    pub fn watch(
        &self,
        project: &str,
        repository: &str,
        target: WatchTarget,
        since: Revision,
        timeout: Option<Duration>,
    ) -> Result<WatchHandle, MetaError> {
        let repo = self.projects.get(project)?.repos().get(repository)?;
        self.registry.watch(
            &repo,
            target,
            since,
            Some(timeout.unwrap_or(self.config.watch_timeout)),
        )
    }

    /// Stops replication and closes every project.
    pub async fn shutdown(&self) {
        self.coordinator.shutdown().await;
        self.projects.close();
        tracing::info!(node_id = %self.config.node_id, "node stopped");
    }
}
