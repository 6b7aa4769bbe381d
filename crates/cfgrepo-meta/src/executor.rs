//! Command executor: validation, ordering through replication, and
//! exactly-once application.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::command::{Command, CommandOutcome, ReplicatedCommand};
use crate::coordinator::{ReplicationCoordinator, StateMachine};
use crate::error::MetaError;
use crate::kvstore::{BatchOp, KvStore};
use crate::project::ProjectManager;
use crate::types::LogIndex;

/// Default bound on waiting for a command to be applied.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
/// Default number of request IDs remembered for deduplication.
pub const DEFAULT_DEDUP_WINDOW: usize = 4096;

const PREFIX_DEDUP_ID: &[u8] = b"dedup/id/";
const PREFIX_DEDUP_SEQ: &[u8] = b"dedup/seq/";

fn id_key(request_id: &Uuid) -> Vec<u8> {
    let mut key = PREFIX_DEDUP_ID.to_vec();
    key.extend_from_slice(request_id.as_bytes());
    key
}

fn seq_key(seq: u64) -> Vec<u8> {
    let mut key = PREFIX_DEDUP_SEQ.to_vec();
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

/// Persisted outcome of one request ID.
#[derive(Debug, Serialize, Deserialize)]
struct AppliedRecord {
    seq: u64,
    result: Result<CommandOutcome, MetaError>,
}

struct DedupWindow {
    recent: LruCache<Uuid, Result<CommandOutcome, MetaError>>,
    next_seq: u64,
}

/// Applies committed commands to local projects, skipping request IDs it
/// has already applied.
///
/// The outcomes of the last `dedup_window` request IDs are stored next to
/// the projects, so a retry arriving after a restart still returns the
/// recorded outcome.
pub struct CommandApplier {
    projects: Arc<ProjectManager>,
    kv: Arc<dyn KvStore>,
    window: usize,
    state: Mutex<DedupWindow>,
}

impl CommandApplier {
    /// Creates an applier remembering the last `dedup_window` request IDs,
    /// reloading those already recorded in `kv`.
    pub fn new(
        projects: Arc<ProjectManager>,
        kv: Arc<dyn KvStore>,
        dedup_window: usize,
    ) -> Result<Self, MetaError> {
        let window = NonZeroUsize::new(dedup_window).unwrap_or(NonZeroUsize::MIN);
        let mut recent = LruCache::new(window);
        let mut next_seq = 0;

        let sequence = kv.scan_prefix(PREFIX_DEDUP_SEQ)?;
        let skip = sequence.len().saturating_sub(window.get());
        for (_, value) in sequence.into_iter().skip(skip) {
            let request_id = Uuid::from_slice(&value)
                .map_err(|e| MetaError::Serialization(e.to_string()))?;
            let Some(bytes) = kv.get(&id_key(&request_id))? else {
                continue;
            };
            let record: AppliedRecord = serde_json::from_slice(&bytes)?;
            next_seq = record.seq + 1;
            recent.put(request_id, record.result);
        }
        if !recent.is_empty() {
            tracing::debug!(
                request_ids = recent.len(),
                "reloaded deduplication window"
            );
        }

        Ok(Self {
            projects,
            kv,
            window: window.get(),
            state: Mutex::new(DedupWindow { recent, next_seq }),
        })
    }

    /// The projects commands are applied to.
    pub fn projects(&self) -> &Arc<ProjectManager> {
        &self.projects
    }

    /// Stores the outcome of `request_id` and drops the record that fell
    /// out of the window, in one batch.
    fn record(
        &self,
        state: &mut DedupWindow,
        request_id: Uuid,
        result: &Result<CommandOutcome, MetaError>,
    ) -> Result<(), MetaError> {
        let seq = state.next_seq;
        let record = AppliedRecord {
            seq,
            result: result.clone(),
        };
        let mut ops = vec![
            BatchOp::Put {
                key: id_key(&request_id),
                value: serde_json::to_vec(&record)?,
            },
            BatchOp::Put {
                key: seq_key(seq),
                value: request_id.as_bytes().to_vec(),
            },
        ];
        if let Some(expired) = seq.checked_sub(self.window as u64) {
            if let Some(old) = self.kv.get(&seq_key(expired))? {
                ops.push(BatchOp::Delete { key: seq_key(expired) });
                let mut old_id = PREFIX_DEDUP_ID.to_vec();
                old_id.extend_from_slice(&old);
                ops.push(BatchOp::Delete { key: old_id });
            }
        }
        self.kv.write_batch(ops)?;
        state.next_seq = seq + 1;
        Ok(())
    }
}

impl StateMachine for CommandApplier {
    fn apply(&self, index: LogIndex, command: &ReplicatedCommand) -> Result<CommandOutcome, MetaError> {
        let mut state = self.state.lock();
        // peek keeps eviction in insertion order, matching the stored window.
        if let Some(previous) = state.recent.peek(&command.request_id).cloned() {
            tracing::debug!(
                index = %index,
                request_id = %command.request_id,
                "duplicate request, returning recorded outcome"
            );
            return previous;
        }

        let result = command.command.apply(&self.projects);
        match &result {
            Ok(CommandOutcome::Applied(_)) => tracing::debug!(
                index = %index,
                kind = command.command.kind(),
                target = %command.command.target(),
                "applied command"
            ),
            Ok(CommandOutcome::Redundant) => tracing::debug!(
                index = %index,
                target = %command.command.target(),
                "redundant push"
            ),
            Ok(CommandOutcome::Conflict { head }) => tracing::debug!(
                index = %index,
                target = %command.command.target(),
                head = %head,
                "push conflicts with head"
            ),
            Err(_) => {}
        }
        if let Err(e) = self.record(&mut state, command.request_id, &result) {
            tracing::error!(
                index = %index,
                request_id = %command.request_id,
                error = %e,
                "failed to persist request outcome"
            );
        }
        state.recent.put(command.request_id, result.clone());
        result
    }
}

/// Entry point for all mutations on a replica.
pub struct CommandExecutor {
    coordinator: Arc<ReplicationCoordinator>,
    timeout: Duration,
}

impl CommandExecutor {
    /// Creates an executor waiting at most `timeout` per command.
    pub fn new(coordinator: Arc<ReplicationCoordinator>, timeout: Duration) -> Self {
        Self {
            coordinator,
            timeout,
        }
    }

    /// Returns true if commands submitted here are ordered locally.
    pub fn is_leader(&self) -> bool {
        self.coordinator.is_leader()
    }

    /// The replication layer.
    pub fn coordinator(&self) -> &Arc<ReplicationCoordinator> {
        &self.coordinator
    }

    /// Executes a command under a fresh request ID.
    pub async fn execute(&self, command: Command) -> Result<CommandOutcome, MetaError> {
        self.execute_with_request_id(Uuid::new_v4(), command).await
    }

    /// Executes a command under a caller-chosen request ID. Re-submitting
    /// the same ID returns the recorded outcome instead of applying twice.
    pub async fn execute_with_request_id(
        &self,
        request_id: Uuid,
        command: Command,
    ) -> Result<CommandOutcome, MetaError> {
        self.execute_with_timeout(request_id, command, self.timeout)
            .await
    }

    /// Executes a command, waiting at most `timeout` for it to be applied.
    ///
    /// A timeout does not withdraw the command: it may still be applied.
    pub async fn execute_with_timeout(
        &self,
        request_id: Uuid,
        command: Command,
        timeout: Duration,
    ) -> Result<CommandOutcome, MetaError> {
        command.validate()?;
        let kind = command.kind();
        let replicated = ReplicatedCommand {
            request_id,
            command,
        };
        match tokio::time::timeout(timeout, self.coordinator.submit(replicated)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(%request_id, kind, ?timeout, "command timed out");
                Err(MetaError::Timeout(timeout))
            }
        }
    }
}
