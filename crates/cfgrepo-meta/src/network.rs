//! Peer-to-peer message transport for replication.
//!
//! The coordinator only needs a fire-and-forget `send`; delivery is
//! best-effort and Raft tolerates loss. [`LocalNetwork`] connects replicas
//! inside one process and can cut individual nodes off to simulate
//! partitions; [`crate::tcp::TcpNetwork`] connects replica processes.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::MetaError;
use crate::types::{NodeId, RaftMessage};

/// Messages exchanged between replicas.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// Consensus traffic.
    Raft(RaftMessage),
    /// A follower handing an encoded command to the leader.
    Forward {
        /// Request ID of the command
        request_id: Uuid,
        /// Encoded `ReplicatedCommand`
        payload: Vec<u8>,
    },
    /// The receiver of a forward is not the leader.
    ForwardRejected {
        /// Request ID of the rejected command
        request_id: Uuid,
        /// The leader the receiver knows of
        leader_hint: Option<NodeId>,
    },
}

/// A message with its sender.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    /// Sending node
    pub from: NodeId,
    /// Payload
    pub message: PeerMessage,
}

/// Receiving end handed to a coordinator.
pub type Inbox = mpsc::UnboundedReceiver<Envelope>;

/// Sends messages to peers.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends a message. Delivery is not guaranteed even on success.
    async fn send(&self, from: NodeId, to: NodeId, message: PeerMessage) -> Result<(), MetaError>;
}

/// In-process network connecting replicas through channels.
#[derive(Default)]
pub struct LocalNetwork {
    inboxes: DashMap<NodeId, mpsc::UnboundedSender<Envelope>>,
    isolated: RwLock<HashSet<NodeId>>,
}

impl LocalNetwork {
    /// Creates an empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attaches a node and returns its inbox. Re-registering replaces the
    /// previous inbox.
    pub fn register(&self, node: NodeId) -> Inbox {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.insert(node, tx);
        rx
    }

    /// Detaches a node.
    pub fn unregister(&self, node: NodeId) {
        self.inboxes.remove(&node);
    }

    /// Drops all traffic to and from a node.
    pub fn isolate(&self, node: NodeId) {
        tracing::info!(node = %node, "isolating node");
        self.isolated.write().insert(node);
    }

    /// Restores traffic to and from a node.
    pub fn heal(&self, node: NodeId) {
        tracing::info!(node = %node, "healing node");
        self.isolated.write().remove(&node);
    }

    /// Restores all traffic.
    pub fn heal_all(&self) {
        self.isolated.write().clear();
    }
}

#[async_trait]
impl Transport for LocalNetwork {
    async fn send(&self, from: NodeId, to: NodeId, message: PeerMessage) -> Result<(), MetaError> {
        {
            let isolated = self.isolated.read();
            if isolated.contains(&from) || isolated.contains(&to) {
                tracing::trace!(from = %from, to = %to, "dropping message across partition");
                return Ok(());
            }
        }
        let sender = self
            .inboxes
            .get(&to)
            .map(|s| s.value().clone())
            .ok_or_else(|| MetaError::Io(format!("peer {} is not reachable", to)))?;
        sender
            .send(Envelope { from, message })
            .map_err(|_| MetaError::Io(format!("peer {} has stopped", to)))
    }
}
