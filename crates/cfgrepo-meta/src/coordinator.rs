//! Drives a [`RaftNode`] with timers, peer messages and local submissions.
//!
//! One task owns the consensus state. Every step follows the same order:
//! mutate the Raft state, persist the resulting delta, send messages, then
//! apply newly committed entries to the state machine in log order. A
//! submitted command completes when this replica applies it, whether it was
//! proposed here or forwarded to the leader.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::command::{CommandOutcome, ReplicatedCommand};
use crate::consensus::{RaftConfig, RaftNode};
use crate::error::MetaError;
use crate::network::{Envelope, Inbox, PeerMessage, Transport};
use crate::raft_log::RaftLogStore;
use crate::types::{LogIndex, LogOp, NodeId, RaftMessage, RaftState, Term};

/// Applies committed commands. Called from the coordinator task, one entry
/// at a time, in log order.
pub trait StateMachine: Send + Sync + 'static {
    /// Applies the command committed at `index`.
    fn apply(&self, index: LogIndex, command: &ReplicatedCommand) -> Result<CommandOutcome, MetaError>;
}

/// Snapshot of a replica's consensus state.
#[derive(Clone, Debug, PartialEq)]
pub struct CoordinatorStatus {
    /// This replica
    pub node_id: NodeId,
    /// Role
    pub state: RaftState,
    /// Current term
    pub term: Term,
    /// Known leader
    pub leader: Option<NodeId>,
    /// Highest committed index
    pub commit_index: LogIndex,
    /// Highest applied index
    pub last_applied: LogIndex,
}

type Reply = oneshot::Sender<Result<CommandOutcome, MetaError>>;

enum Request {
    Submit {
        command: ReplicatedCommand,
        reply: Reply,
    },
    Campaign,
}

/// Handle to a running replica's consensus loop.
pub struct ReplicationCoordinator {
    node_id: NodeId,
    requests: mpsc::UnboundedSender<Request>,
    status: Arc<RwLock<CoordinatorStatus>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicationCoordinator {
    /// Restores durable state and starts the consensus loop.
    pub fn start(
        config: RaftConfig,
        log: RaftLogStore,
        state_machine: Arc<dyn StateMachine>,
        transport: Arc<dyn Transport>,
        inbox: Inbox,
    ) -> Result<Self, MetaError> {
        let durable = log.load()?;
        let mut raft = RaftNode::new(config.clone());
        raft.restore(durable.term, durable.voted_for, durable.entries, durable.applied);

        let status = Arc::new(RwLock::new(CoordinatorStatus {
            node_id: config.node_id,
            state: raft.state(),
            term: raft.current_term(),
            leader: raft.leader_id(),
            commit_index: raft.commit_index(),
            last_applied: raft.last_applied(),
        }));
        let shutdown = CancellationToken::new();
        let (requests, request_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            election_deadline: Instant::now() + election_timeout(&config),
            config: config.clone(),
            raft,
            log,
            state_machine,
            transport,
            status: status.clone(),
            waiters: HashMap::new(),
        };
        let task = tokio::spawn(driver.run(request_rx, inbox, shutdown.clone()));
        tracing::info!(node_id = %config.node_id, peers = ?config.peers, "replication coordinator started");

        Ok(Self {
            node_id: config.node_id,
            requests,
            status,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    /// This replica's ID.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Submits a command and waits until this replica applies it.
    pub async fn submit(&self, command: ReplicatedCommand) -> Result<CommandOutcome, MetaError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request::Submit { command, reply })
            .map_err(|_| MetaError::Shutdown)?;
        rx.await.map_err(|_| MetaError::Shutdown)?
    }

    /// Starts an election immediately instead of waiting for the timeout.
    pub fn campaign(&self) -> Result<(), MetaError> {
        self.requests
            .send(Request::Campaign)
            .map_err(|_| MetaError::Shutdown)
    }

    /// Current consensus state.
    pub fn status(&self) -> CoordinatorStatus {
        self.status.read().clone()
    }

    /// Current role.
    pub fn state(&self) -> RaftState {
        self.status.read().state
    }

    /// Highest committed log index.
    pub fn commit_index(&self) -> LogIndex {
        self.status.read().commit_index
    }

    /// Returns true if this replica currently leads.
    pub fn is_leader(&self) -> bool {
        self.status.read().state == RaftState::Leader
    }

    /// The leader this replica knows of.
    pub fn leader(&self) -> Option<NodeId> {
        self.status.read().leader
    }

    /// Stops the loop. Pending submissions fail with `Shutdown`.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(node_id = %self.node_id, error = %e, "coordinator task ended abnormally");
            }
        }
    }
}

impl Drop for ReplicationCoordinator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn election_timeout(config: &RaftConfig) -> Duration {
    let min = config.election_timeout_min_ms;
    let max = config.election_timeout_max_ms.max(min);
    Duration::from_millis(rand::thread_rng().gen_range(min..=max))
}

struct Driver {
    config: RaftConfig,
    raft: RaftNode,
    log: RaftLogStore,
    state_machine: Arc<dyn StateMachine>,
    transport: Arc<dyn Transport>,
    status: Arc<RwLock<CoordinatorStatus>>,
    waiters: HashMap<Uuid, Vec<Reply>>,
    election_deadline: Instant,
}

impl Driver {
    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut inbox: Inbox,
        shutdown: CancellationToken,
    ) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.heartbeat_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let step = tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(request) = requests.recv() => self.on_request(request).await,
                Some(envelope) = inbox.recv() => self.on_message(envelope).await,
                _ = ticker.tick() => self.on_tick().await,
            };
            if let Err(e) = step {
                tracing::error!(node_id = %self.config.node_id, error = %e, "replication stopped");
                break;
            }
            self.publish_status();
        }

        for (_, replies) in self.waiters.drain() {
            for reply in replies {
                let _ = reply.send(Err(MetaError::Shutdown));
            }
        }
        while let Ok(Request::Submit { reply, .. }) = requests.try_recv() {
            let _ = reply.send(Err(MetaError::Shutdown));
        }
        tracing::info!(node_id = %self.config.node_id, "replication coordinator stopped");
    }

    fn reset_election_deadline(&mut self) {
        self.election_deadline = Instant::now() + election_timeout(&self.config);
    }

    fn publish_status(&self) {
        let next = CoordinatorStatus {
            node_id: self.config.node_id,
            state: self.raft.state(),
            term: self.raft.current_term(),
            leader: self.raft.leader_id(),
            commit_index: self.raft.commit_index(),
            last_applied: self.raft.last_applied(),
        };
        let mut status = self.status.write();
        if status.state != next.state || status.leader != next.leader {
            tracing::info!(
                node_id = %next.node_id,
                state = ?next.state,
                term = %next.term,
                leader = ?next.leader,
                "consensus role changed"
            );
        }
        *status = next;
    }

    fn persist(&mut self) -> Result<(), MetaError> {
        let delta = self.raft.take_persist_delta();
        self.log.persist(&delta)
    }

    async fn send(&self, to: NodeId, message: PeerMessage) {
        if let Err(e) = self.transport.send(self.config.node_id, to, message).await {
            tracing::debug!(node_id = %self.config.node_id, to = %to, error = %e, "send failed");
        }
    }

    async fn send_raft(&self, messages: Vec<(NodeId, RaftMessage)>) {
        for (to, message) in messages {
            self.send(to, PeerMessage::Raft(message)).await;
        }
    }

    fn complete(&mut self, request_id: &Uuid, result: Result<CommandOutcome, MetaError>) {
        if let Some(replies) = self.waiters.remove(request_id) {
            for reply in replies {
                let _ = reply.send(result.clone());
            }
        }
    }

    async fn on_request(&mut self, request: Request) -> Result<(), MetaError> {
        match request {
            Request::Submit { command, reply } => {
                let request_id = command.request_id;
                if self.raft.is_leader() {
                    self.waiters.entry(request_id).or_default().push(reply);
                    self.propose(&command).await?;
                } else if let Some(leader) = self.raft.leader_id() {
                    let payload = command.encode()?;
                    self.waiters.entry(request_id).or_default().push(reply);
                    tracing::debug!(node_id = %self.config.node_id, leader = %leader, %request_id, "forwarding command to leader");
                    self.send(leader, PeerMessage::Forward { request_id, payload })
                        .await;
                } else {
                    let _ = reply.send(Err(MetaError::NotLeader { leader_hint: None }));
                }
                Ok(())
            }
            Request::Campaign => self.campaign().await,
        }
    }

    async fn propose(&mut self, command: &ReplicatedCommand) -> Result<(), MetaError> {
        let payload = command.encode()?;
        match self.raft.propose(LogOp::Command(payload)) {
            Ok((index, messages)) => {
                tracing::debug!(node_id = %self.config.node_id, index = %index, request_id = %command.request_id, "proposed command");
                self.persist()?;
                self.send_raft(messages).await;
                self.apply_committed()
            }
            Err(e) => {
                self.complete(&command.request_id, Err(e));
                Ok(())
            }
        }
    }

    async fn campaign(&mut self) -> Result<(), MetaError> {
        let request = self.raft.start_election();
        self.reset_election_deadline();
        self.persist()?;
        let peers = self.config.peers.clone();
        for peer in peers {
            self.send(peer, PeerMessage::Raft(request.clone())).await;
        }
        if self.raft.is_leader() {
            self.apply_committed()?;
        }
        Ok(())
    }

    async fn on_tick(&mut self) -> Result<(), MetaError> {
        self.waiters.retain(|_, replies| {
            replies.retain(|r| !r.is_closed());
            !replies.is_empty()
        });

        if self.raft.is_leader() {
            let heartbeats = self.raft.build_heartbeats();
            self.send_raft(heartbeats).await;
        } else if Instant::now() >= self.election_deadline {
            self.campaign().await?;
        }
        Ok(())
    }

    async fn on_message(&mut self, envelope: Envelope) -> Result<(), MetaError> {
        let from = envelope.from;
        match envelope.message {
            PeerMessage::Raft(RaftMessage::RequestVote(req)) => {
                let resp = self.raft.handle_request_vote(&req);
                if resp.vote_granted {
                    self.reset_election_deadline();
                }
                self.persist()?;
                self.send(from, PeerMessage::Raft(RaftMessage::RequestVoteResponse(resp)))
                    .await;
            }
            PeerMessage::Raft(RaftMessage::RequestVoteResponse(resp)) => {
                let won = self.raft.handle_vote_response(from, &resp);
                self.persist()?;
                if let Some(messages) = won {
                    self.send_raft(messages).await;
                    self.apply_committed()?;
                }
            }
            PeerMessage::Raft(RaftMessage::AppendEntries(req)) => {
                let resp = self.raft.handle_append_entries(&req);
                if resp.term == req.term {
                    self.reset_election_deadline();
                }
                self.persist()?;
                self.send(from, PeerMessage::Raft(RaftMessage::AppendEntriesResponse(resp)))
                    .await;
                self.apply_committed()?;
            }
            PeerMessage::Raft(RaftMessage::AppendEntriesResponse(resp)) => {
                let retry = self.raft.handle_append_response(from, &resp);
                self.persist()?;
                if let Some(message) = retry {
                    self.send(from, PeerMessage::Raft(message)).await;
                }
                self.apply_committed()?;
            }
            PeerMessage::Forward { request_id, payload } => {
                if !self.raft.is_leader() {
                    let leader_hint = self.raft.leader_id();
                    self.send(from, PeerMessage::ForwardRejected { request_id, leader_hint })
                        .await;
                    return Ok(());
                }
                match ReplicatedCommand::decode(&payload) {
                    Ok(command) => self.propose(&command).await?,
                    Err(e) => {
                        tracing::warn!(from = %from, %request_id, error = %e, "dropping undecodable forwarded command");
                    }
                }
            }
            PeerMessage::ForwardRejected { request_id, leader_hint } => {
                self.complete(&request_id, Err(MetaError::NotLeader { leader_hint }));
            }
        }
        Ok(())
    }

    fn apply_committed(&mut self) -> Result<(), MetaError> {
        for entry in self.raft.take_committed_entries() {
            if let LogOp::Command(payload) = &entry.op {
                match ReplicatedCommand::decode(payload) {
                    Ok(command) => {
                        let result = self.state_machine.apply(entry.index, &command);
                        if let Err(e) = &result {
                            tracing::debug!(
                                node_id = %self.config.node_id,
                                index = %entry.index,
                                kind = command.command.kind(),
                                target = %command.command.target(),
                                error = %e,
                                "command rejected at apply"
                            );
                        }
                        self.complete(&command.request_id, result);
                    }
                    Err(e) => tracing::error!(
                        node_id = %self.config.node_id,
                        index = %entry.index,
                        error = %e,
                        "skipping undecodable log entry"
                    ),
                }
            }
            self.log.save_applied(entry.index)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, CommandResult};
    use crate::kvstore::MemoryKvStore;
    use crate::network::LocalNetwork;
    use crate::types::Author;

    #[derive(Default)]
    struct Recording {
        applied: Mutex<Vec<(LogIndex, Uuid)>>,
    }

    impl StateMachine for Recording {
        fn apply(&self, index: LogIndex, command: &ReplicatedCommand) -> Result<CommandOutcome, MetaError> {
            self.applied.lock().push((index, command.request_id));
            Ok(CommandOutcome::Applied(CommandResult::ProjectCreated))
        }
    }

    fn single_node(kv: Arc<MemoryKvStore>, sm: Arc<Recording>) -> ReplicationCoordinator {
        let net = LocalNetwork::new();
        let inbox = net.register(NodeId::new(1));
        ReplicationCoordinator::start(
            RaftConfig {
                node_id: NodeId::new(1),
                election_timeout_min_ms: 20,
                election_timeout_max_ms: 40,
                heartbeat_interval_ms: 10,
                ..RaftConfig::default()
            },
            RaftLogStore::new(kv),
            sm,
            net,
            inbox,
        )
        .unwrap()
    }

    async fn wait_for_leader(coordinator: &ReplicationCoordinator) {
        for _ in 0..200 {
            if coordinator.is_leader() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no leader elected");
    }

    #[tokio::test]
    async fn test_single_node_elects_and_applies_in_order() {
        let sm = Arc::new(Recording::default());
        let coordinator = single_node(Arc::new(MemoryKvStore::new()), sm.clone());
        wait_for_leader(&coordinator).await;

        let mut ids = Vec::new();
        for name in ["a", "b", "c"] {
            let command = ReplicatedCommand::new(Command::create_project(Author::system(), name));
            ids.push(command.request_id);
            coordinator.submit(command).await.unwrap();
        }
        let applied: Vec<Uuid> = sm.applied.lock().iter().map(|(_, id)| *id).collect();
        assert_eq!(applied, ids);
        let indexes: Vec<LogIndex> = sm.applied.lock().iter().map(|(i, _)| *i).collect();
        assert!(indexes.windows(2).all(|w| w[0] < w[1]));
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_does_not_reapply() {
        let kv = Arc::new(MemoryKvStore::new());
        let first = Arc::new(Recording::default());
        let coordinator = single_node(kv.clone(), first.clone());
        wait_for_leader(&coordinator).await;
        coordinator
            .submit(ReplicatedCommand::new(Command::create_project(Author::system(), "a")))
            .await
            .unwrap();
        coordinator.shutdown().await;
        assert_eq!(first.applied.lock().len(), 1);

        let second = Arc::new(Recording::default());
        let coordinator = single_node(kv, second.clone());
        wait_for_leader(&coordinator).await;
        assert!(coordinator.status().term > Term::new(1));
        coordinator
            .submit(ReplicatedCommand::new(Command::create_project(Author::system(), "b")))
            .await
            .unwrap();
        assert_eq!(second.applied.lock().len(), 1);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let coordinator = single_node(
            Arc::new(MemoryKvStore::new()),
            Arc::new(Recording::default()),
        );
        coordinator.shutdown().await;
        let result = coordinator
            .submit(ReplicatedCommand::new(Command::create_project(Author::system(), "a")))
            .await;
        assert_eq!(result, Err(MetaError::Shutdown));
    }
}
