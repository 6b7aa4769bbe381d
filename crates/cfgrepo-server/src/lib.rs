#![warn(missing_docs)]

//! cfgrepo server: configuration, logging and process wiring of one
//! replica, its TCP replication transport and the mirroring scheduler.

/// Server configuration file.
#[allow(missing_docs)]
pub mod config;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use cfgrepo_meta::{MetaError, Node, NodeId, TcpNetwork};
use cfgrepo_mirror::{GitTransport, MetaRepoCredentialStore, MirrorError, MirroringScheduler};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub use config::{PeerConfig, ReplicationConfig, ServerConfig};

/// Errors raised while starting a server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The replication listener could not be bound.
    #[error("cannot listen on {addr}: {source}")]
    Listen {
        /// Configured bind address.
        addr: String,
        /// Cause.
        source: MetaError,
    },
    /// The replica could not start.
    #[error("replica {node_id} failed to start: {source}")]
    Replica {
        /// The failing replica.
        node_id: NodeId,
        /// Cause.
        source: MetaError,
    },
    /// The mirroring scheduler rejected its configuration.
    #[error("mirroring: {0}")]
    Mirroring(#[from] MirrorError),
}

/// Installs the global subscriber. `RUST_LOG` wins over `default_level`.
/// Later calls are ignored.
pub fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init();
}

/// A running server: this process's replica, the TCP transport it
/// replicates over, and its mirroring scheduler.
pub struct Server {
    config: ServerConfig,
    network: Arc<TcpNetwork>,
    node: Arc<Node>,
    scheduler: MirroringScheduler,
    token: CancellationToken,
    mirroring: JoinHandle<()>,
}

impl Server {
    /// Binds the replication listener, starts the replica and the
    /// mirroring loop.
    pub async fn start(config: ServerConfig, transport: Arc<dyn GitTransport>) -> Result<Self, ServerError> {
        config.mirroring.validate()?;
        let node_id = NodeId::new(config.node_id);
        let (network, inbox) = TcpNetwork::bind(
            node_id,
            &config.bind_addr,
            config.peer_addresses(),
            config.network_config(),
        )
        .await
        .map_err(|source| ServerError::Listen {
            addr: config.bind_addr.clone(),
            source,
        })?;

        let node = match Node::start(config.node_config(), network.clone(), inbox) {
            Ok(node) => Arc::new(node),
            Err(source) => {
                network.shutdown();
                return Err(ServerError::Replica { node_id, source });
            }
        };

        let credentials = Arc::new(MetaRepoCredentialStore::new(node.projects().clone()));
        let scheduler = match MirroringScheduler::new(
            node.clone(),
            config.mirroring.clone(),
            config.zone.clone(),
            transport,
            credentials,
        ) {
            Ok(scheduler) => scheduler,
            Err(e) => {
                node.shutdown().await;
                network.shutdown();
                return Err(e.into());
            }
        };

        let token = CancellationToken::new();
        let mirroring = tokio::spawn({
            let scheduler = scheduler.clone();
            let token = token.clone();
            let interval = config.mirroring_interval();
            async move { scheduler.run(interval, token).await }
        });

        tracing::info!(
            node_id = config.node_id,
            addr = %network.local_addr(),
            members = config.members().len(),
            zone = ?config.zone,
            "server started"
        );
        Ok(Self {
            config,
            network,
            node,
            scheduler,
            token,
            mirroring,
        })
    }

    /// The configuration the server was started with.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// This process's replica.
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// The transport the replica talks to its peers over.
    pub fn network(&self) -> &Arc<TcpNetwork> {
        &self.network
    }

    /// The address replication traffic is accepted on.
    pub fn local_addr(&self) -> SocketAddr {
        self.network.local_addr()
    }

    /// The replica's mirroring scheduler.
    pub fn scheduler(&self) -> &MirroringScheduler {
        &self.scheduler
    }

    /// Waits until the replica knows a leader, up to `timeout`.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<NodeId> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(leader) = self.node.status().leader {
                return Some(leader);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Stops mirroring, then the replica, then the transport.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.mirroring.await {
            tracing::error!(error = %e, "mirroring loop aborted");
        }
        self.node.shutdown().await;
        self.network.shutdown();
        tracing::info!(node_id = self.config.node_id, "server stopped");
    }
}
