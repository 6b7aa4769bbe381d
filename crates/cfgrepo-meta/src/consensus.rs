//! Raft consensus state machine ordering replicated commands.
//!
//! This module is pure state: it never sleeps, sends or persists anything.
//! [`crate::coordinator`] drives it with timers and messages, persists the
//! changes reported by [`RaftNode::take_persist_delta`] and applies the
//! entries returned by [`RaftNode::take_committed_entries`].

use std::collections::{HashMap, HashSet};

use crate::error::MetaError;
use crate::types::*;

/// Upper bound on log entries carried by one AppendEntries message.
const MAX_ENTRIES_PER_APPEND: usize = 256;

/// Configuration for a Raft node.
#[derive(Clone, Debug)]
pub struct RaftConfig {
    /// This node's unique identifier.
    pub node_id: NodeId,
    /// Other nodes in the Raft group (excluding this node).
    pub peers: Vec<NodeId>,
    /// Minimum election timeout in milliseconds (default: 150).
    pub election_timeout_min_ms: u64,
    /// Maximum election timeout in milliseconds (default: 300).
    pub election_timeout_max_ms: u64,
    /// Heartbeat interval in milliseconds (default: 50).
    pub heartbeat_interval_ms: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::new(0),
            peers: Vec::new(),
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
        }
    }
}

/// Durable changes accumulated since the last call to
/// [`RaftNode::take_persist_delta`]. Must be persisted before any message
/// produced alongside them is sent.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PersistDelta {
    /// New term and vote, if either changed.
    pub hard_state: Option<(Term, Option<NodeId>)>,
    /// Every persisted entry at or after this index must be discarded.
    pub truncate_from: Option<LogIndex>,
    /// Entries to write after truncation.
    pub entries: Vec<LogEntry>,
}

impl PersistDelta {
    /// Returns true if nothing needs to be written.
    pub fn is_empty(&self) -> bool {
        self.hard_state.is_none() && self.truncate_from.is_none() && self.entries.is_empty()
    }
}

/// A Raft node implementing the consensus state machine.
pub struct RaftNode {
    config: RaftConfig,
    state: RaftState,
    current_term: Term,
    voted_for: Option<NodeId>,
    leader_id: Option<NodeId>,
    log: Vec<LogEntry>,
    commit_index: LogIndex,
    last_applied: LogIndex,
    next_index: HashMap<NodeId, LogIndex>,
    match_index: HashMap<NodeId, LogIndex>,
    votes_received: HashSet<NodeId>,
    hard_state_dirty: bool,
    dirty_from: Option<usize>,
}

impl RaftNode {
    /// Create a new Raft node starting as a Follower.
    pub fn new(config: RaftConfig) -> Self {
        tracing::debug!(
            node_id = %config.node_id,
            peers = ?config.peers,
            "creating new Raft node as Follower"
        );
        Self {
            config,
            state: RaftState::Follower,
            current_term: Term::new(0),
            voted_for: None,
            leader_id: None,
            log: Vec::new(),
            commit_index: LogIndex::ZERO,
            last_applied: LogIndex::ZERO,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes_received: HashSet::new(),
            hard_state_dirty: false,
            dirty_from: None,
        }
    }

    /// Reloads durable state after a restart. Entries up to `applied` were
    /// applied before the restart and are not returned again.
    pub fn restore(
        &mut self,
        term: Term,
        voted_for: Option<NodeId>,
        log: Vec<LogEntry>,
        applied: LogIndex,
    ) {
        let applied = std::cmp::min(applied, LogIndex::new(log.len() as u64));
        tracing::info!(
            node_id = %self.config.node_id,
            term = %term,
            log_len = log.len(),
            applied = %applied,
            "restored Raft state"
        );
        self.current_term = term;
        self.voted_for = voted_for;
        self.log = log;
        self.commit_index = applied;
        self.last_applied = applied;
    }

    /// This node's ID.
    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    /// Other members of the group.
    pub fn peers(&self) -> &[NodeId] {
        &self.config.peers
    }

    /// Get the current term.
    pub fn current_term(&self) -> Term {
        self.current_term
    }

    /// Get the current state.
    pub fn state(&self) -> RaftState {
        self.state
    }

    /// Returns true if this node is the leader.
    pub fn is_leader(&self) -> bool {
        self.state == RaftState::Leader
    }

    /// The leader of the current term, if known.
    pub fn leader_id(&self) -> Option<NodeId> {
        self.leader_id
    }

    /// Get the commit index.
    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    /// Get the last applied index.
    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// Get the node this node voted for in the current term.
    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    /// Get a specific log entry by index.
    pub fn log_entry(&self, index: LogIndex) -> Option<&LogEntry> {
        let idx = index.as_u64() as usize;
        if idx == 0 {
            None
        } else {
            self.log.get(idx - 1)
        }
    }

    /// Get the last log index.
    pub fn last_log_index(&self) -> LogIndex {
        LogIndex::new(self.log.len() as u64)
    }

    /// Get the term of the last log entry.
    pub fn last_log_term(&self) -> Term {
        self.log.last().map(|e| e.term).unwrap_or(Term::new(0))
    }

    fn majority(&self) -> usize {
        (self.config.peers.len() + 2) / 2
    }

    fn mark_dirty(&mut self, pos: usize) {
        self.dirty_from = Some(self.dirty_from.map_or(pos, |d| d.min(pos)));
    }

    fn append_local(&mut self, op: LogOp) -> LogIndex {
        let index = LogIndex::new(self.log.len() as u64 + 1);
        self.mark_dirty(self.log.len());
        self.log.push(LogEntry {
            index,
            term: self.current_term,
            op,
        });
        index
    }

    /// Start an election: transition to Candidate, increment term, vote for self.
    /// Returns the RequestVote message to broadcast to all peers. A node
    /// without peers wins immediately.
    pub fn start_election(&mut self) -> RaftMessage {
        tracing::info!(
            node_id = %self.config.node_id,
            term = %self.current_term,
            "starting election"
        );

        self.state = RaftState::Candidate;
        self.current_term = Term::new(self.current_term.as_u64() + 1);
        self.voted_for = Some(self.config.node_id);
        self.leader_id = None;
        self.hard_state_dirty = true;
        self.votes_received.clear();
        self.votes_received.insert(self.config.node_id);

        let request = VoteRequest {
            term: self.current_term,
            candidate_id: self.config.node_id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        };

        if self.votes_received.len() >= self.majority() {
            self.become_leader();
        }
        RaftMessage::RequestVote(request)
    }

    /// Handle a RequestVote message.
    pub fn handle_request_vote(&mut self, req: &VoteRequest) -> VoteResponse {
        tracing::debug!(
            node_id = %self.config.node_id,
            current_term = %self.current_term,
            candidate_term = %req.term,
            candidate_id = %req.candidate_id,
            "received RequestVote"
        );

        if req.term > self.current_term {
            tracing::info!(
                node_id = %self.config.node_id,
                old_term = %self.current_term,
                new_term = %req.term,
                "stepping down to follower due to higher term"
            );
            self.step_down(req.term);
        }

        let vote_granted = if req.term < self.current_term {
            false
        } else if let Some(voted_for) = self.voted_for {
            voted_for == req.candidate_id
        } else if !self.is_log_up_to_date(req.last_log_index, req.last_log_term) {
            tracing::debug!(
                node_id = %self.config.node_id,
                "rejecting vote: candidate log is not up to date"
            );
            false
        } else {
            tracing::info!(
                node_id = %self.config.node_id,
                candidate_id = %req.candidate_id,
                term = %req.term,
                "granting vote to candidate"
            );
            self.voted_for = Some(req.candidate_id);
            self.hard_state_dirty = true;
            true
        };

        VoteResponse {
            term: self.current_term,
            vote_granted,
        }
    }

    /// Handle a RequestVoteResponse. If the election is won, returns the
    /// initial AppendEntries messages for all peers.
    pub fn handle_vote_response(
        &mut self,
        from: NodeId,
        resp: &VoteResponse,
    ) -> Option<Vec<(NodeId, RaftMessage)>> {
        if resp.term > self.current_term {
            self.step_down(resp.term);
            return None;
        }
        if self.state != RaftState::Candidate || resp.term < self.current_term {
            return None;
        }

        if resp.vote_granted {
            self.votes_received.insert(from);
        }

        if self.votes_received.len() >= self.majority() {
            tracing::info!(
                node_id = %self.config.node_id,
                term = %self.current_term,
                votes = self.votes_received.len(),
                "won election, becoming Leader"
            );
            self.become_leader();
            Some(self.build_heartbeats())
        } else {
            None
        }
    }

    fn become_leader(&mut self) {
        self.state = RaftState::Leader;
        self.leader_id = Some(self.config.node_id);
        self.next_index.clear();
        self.match_index.clear();
        let next = LogIndex::new(self.last_log_index().as_u64() + 1);
        for peer in &self.config.peers {
            self.next_index.insert(*peer, next);
            self.match_index.insert(*peer, LogIndex::ZERO);
        }
        // Entries from earlier terms only commit behind an entry of this term.
        self.append_local(LogOp::Noop);
        self.try_advance_commit();
    }

    /// Propose a new operation. Only valid when Leader.
    /// Returns the entry's index and the AppendEntries messages for followers.
    pub fn propose(
        &mut self,
        op: LogOp,
    ) -> Result<(LogIndex, Vec<(NodeId, RaftMessage)>), MetaError> {
        if self.state != RaftState::Leader {
            return Err(MetaError::NotLeader {
                leader_hint: self.leader_id,
            });
        }

        let index = self.append_local(op);
        tracing::debug!(
            node_id = %self.config.node_id,
            term = %self.current_term,
            index = %index,
            "proposing new entry"
        );
        self.try_advance_commit();
        Ok((index, self.build_heartbeats()))
    }

    /// AppendEntries messages for every peer, carrying whatever each lacks.
    pub fn build_heartbeats(&self) -> Vec<(NodeId, RaftMessage)> {
        if self.state != RaftState::Leader {
            return Vec::new();
        }
        self.config
            .peers
            .iter()
            .map(|peer| (*peer, self.build_append_entries(*peer)))
            .collect()
    }

    /// Handle an AppendEntries message (as Follower/Candidate).
    pub fn handle_append_entries(&mut self, req: &AppendRequest) -> AppendResponse {
        if req.term > self.current_term {
            tracing::info!(
                node_id = %self.config.node_id,
                old_term = %self.current_term,
                new_term = %req.term,
                "stepping down to follower due to higher term in AppendEntries"
            );
            self.step_down(req.term);
        }

        if req.term < self.current_term {
            return AppendResponse {
                term: self.current_term,
                success: false,
                match_index: self.last_log_index(),
            };
        }

        if self.state != RaftState::Follower {
            tracing::info!(
                node_id = %self.config.node_id,
                leader_id = %req.leader_id,
                "becoming follower after receiving AppendEntries from valid leader"
            );
            self.state = RaftState::Follower;
        }
        if self.leader_id != Some(req.leader_id) {
            tracing::info!(node_id = %self.config.node_id, leader_id = %req.leader_id, term = %req.term, "following new leader");
            self.leader_id = Some(req.leader_id);
        }

        if req.prev_log_index.as_u64() > 0 {
            match self.log_entry(req.prev_log_index).map(|e| e.term) {
                None => {
                    return AppendResponse {
                        term: self.current_term,
                        success: false,
                        match_index: self.last_log_index(),
                    }
                }
                Some(term) if term != req.prev_log_term => {
                    tracing::debug!(
                        node_id = %self.config.node_id,
                        prev_log_index = %req.prev_log_index,
                        expected_term = %req.prev_log_term,
                        actual_term = %term,
                        "rejecting AppendEntries: prev_log_term mismatch"
                    );
                    return AppendResponse {
                        term: self.current_term,
                        success: false,
                        match_index: LogIndex::new(req.prev_log_index.as_u64() - 1),
                    };
                }
                Some(_) => {}
            }
        }

        let start = req.prev_log_index.as_u64() as usize;
        for (i, entry) in req.entries.iter().enumerate() {
            let pos = start + i;
            if pos < self.log.len() {
                if self.log[pos].term == entry.term {
                    continue;
                }
                tracing::debug!(
                    node_id = %self.config.node_id,
                    index = %entry.index,
                    "truncating conflicting log suffix"
                );
                self.log.truncate(pos);
            }
            self.mark_dirty(pos);
            self.log.push(entry.clone());
        }

        let last_new = LogIndex::new((start + req.entries.len()) as u64);
        if req.leader_commit > self.commit_index {
            let new_commit = std::cmp::min(req.leader_commit, last_new);
            if new_commit > self.commit_index {
                self.commit_index = new_commit;
            }
        }

        AppendResponse {
            term: self.current_term,
            success: true,
            match_index: last_new,
        }
    }

    /// Handle an AppendEntriesResponse (as Leader). Returns a retry message
    /// for the follower when its log did not match.
    pub fn handle_append_response(
        &mut self,
        from: NodeId,
        resp: &AppendResponse,
    ) -> Option<RaftMessage> {
        if resp.term > self.current_term {
            tracing::info!(
                node_id = %self.config.node_id,
                old_term = %self.current_term,
                new_term = %resp.term,
                "stepping down to follower due to higher term in AppendEntriesResponse"
            );
            self.step_down(resp.term);
            return None;
        }
        if self.state != RaftState::Leader || resp.term < self.current_term {
            return None;
        }

        if resp.success {
            let matched = self
                .match_index
                .get(&from)
                .copied()
                .unwrap_or(LogIndex::ZERO)
                .max(resp.match_index);
            self.match_index.insert(from, matched);
            self.next_index
                .insert(from, LogIndex::new(matched.as_u64() + 1));
            self.try_advance_commit();
            None
        } else {
            let current = self
                .next_index
                .get(&from)
                .copied()
                .unwrap_or(LogIndex::new(1));
            let lowered = current
                .as_u64()
                .saturating_sub(1)
                .min(resp.match_index.as_u64() + 1)
                .max(1);
            tracing::debug!(
                node_id = %self.config.node_id,
                from = %from,
                old_next = %current,
                new_next = lowered,
                "decrementing next_index for follower"
            );
            self.next_index.insert(from, LogIndex::new(lowered));
            Some(self.build_append_entries(from))
        }
    }

    /// Returns committed entries not yet handed out, in index order.
    pub fn take_committed_entries(&mut self) -> Vec<LogEntry> {
        let start = self.last_applied.as_u64() as usize;
        let end = std::cmp::min(self.commit_index.as_u64() as usize, self.log.len());

        if start < end {
            let entries: Vec<LogEntry> = self.log[start..end].to_vec();
            self.last_applied = LogIndex::new(end as u64);
            entries
        } else {
            Vec::new()
        }
    }

    /// Returns and clears the durable changes made since the last call.
    pub fn take_persist_delta(&mut self) -> PersistDelta {
        let hard_state = if std::mem::take(&mut self.hard_state_dirty) {
            Some((self.current_term, self.voted_for))
        } else {
            None
        };
        let (truncate_from, entries) = match self.dirty_from.take() {
            Some(pos) => (
                Some(LogIndex::new(pos as u64 + 1)),
                self.log.get(pos..).map(<[LogEntry]>::to_vec).unwrap_or_default(),
            ),
            None => (None, Vec::new()),
        };
        PersistDelta {
            hard_state,
            truncate_from,
            entries,
        }
    }

    /// Step down to follower for the given term (called when we see a higher term).
    fn step_down(&mut self, term: Term) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.hard_state_dirty = true;
        }
        self.state = RaftState::Follower;
        self.leader_id = None;
    }

    /// Build an AppendEntries message for a specific peer.
    fn build_append_entries(&self, peer: NodeId) -> RaftMessage {
        let next_idx = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(LogIndex::new(self.log.len() as u64 + 1));

        let prev_log_index = LogIndex::new(next_idx.as_u64().saturating_sub(1));
        let prev_log_term = self
            .log_entry(prev_log_index)
            .map(|e| e.term)
            .unwrap_or(Term::new(0));

        let start = prev_log_index.as_u64() as usize;
        let entries: Vec<LogEntry> = self
            .log
            .iter()
            .skip(start)
            .take(MAX_ENTRIES_PER_APPEND)
            .cloned()
            .collect();

        RaftMessage::AppendEntries(AppendRequest {
            term: self.current_term,
            leader_id: self.config.node_id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        })
    }

    /// Check if the candidate's log is at least as up-to-date as this node's log.
    fn is_log_up_to_date(&self, last_log_index: LogIndex, last_log_term: Term) -> bool {
        let my_last_term = self.last_log_term();
        last_log_term > my_last_term
            || (last_log_term == my_last_term && last_log_index >= self.last_log_index())
    }

    /// Advance the commit index to the highest current-term entry stored on
    /// a majority.
    fn try_advance_commit(&mut self) {
        if self.state != RaftState::Leader {
            return;
        }

        let majority = self.majority();
        let last_idx = self.last_log_index();
        for n in (self.commit_index.as_u64() + 1)..=last_idx.as_u64() {
            let idx = LogIndex::new(n);
            if self.log_entry(idx).map(|e| e.term) != Some(self.current_term) {
                continue;
            }

            let replication_count = 1 + self
                .config
                .peers
                .iter()
                .filter(|peer| self.match_index.get(peer).is_some_and(|m| *m >= idx))
                .count();

            if replication_count >= majority {
                self.commit_index = idx;
            }
        }
    }
}
