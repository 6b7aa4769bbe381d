//! Persistent Raft log store for crash-safe consensus state.
//!
//! Wraps a KvStore to persist the hard state (term, voted_for), the log
//! entries and the last applied index across restarts.

use std::sync::Arc;

use bincode::Options;

use crate::consensus::PersistDelta;
use crate::error::MetaError;
use crate::kvstore::{BatchOp, KvStore};
use crate::types::{LogEntry, LogIndex, NodeId, Term};

const KEY_TERM: &[u8] = b"raft/term";
const KEY_VOTED_FOR: &[u8] = b"raft/voted_for";
const KEY_APPLIED: &[u8] = b"raft/applied";
const PREFIX_LOG: &[u8] = b"raft/log/";

fn log_entry_key(index: LogIndex) -> Vec<u8> {
    let mut key = PREFIX_LOG.to_vec();
    key.extend_from_slice(&index.as_u64().to_be_bytes());
    key
}

fn read_u64(bytes: &[u8], what: &str) -> Result<u64, MetaError> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| MetaError::Storage(format!("invalid {} value", what)))?;
    Ok(u64::from_be_bytes(arr))
}

/// Everything a node needs to resume consensus after a restart.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DurableRaftState {
    /// Latest term seen
    pub term: Term,
    /// Vote cast in that term
    pub voted_for: Option<NodeId>,
    /// The log, in index order
    pub entries: Vec<LogEntry>,
    /// Last entry applied to the state machine
    pub applied: LogIndex,
}

/// Persistent storage for Raft state using any KvStore implementation.
pub struct RaftLogStore {
    kv: Arc<dyn KvStore>,
}

impl RaftLogStore {
    /// Creates a new Raft log store backed by the given KV store.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn serialize_entry(entry: &LogEntry) -> Result<Vec<u8>, MetaError> {
        Ok(bincode::DefaultOptions::new().serialize(entry)?)
    }

    fn deserialize_entry(bytes: &[u8]) -> Result<LogEntry, MetaError> {
        Ok(bincode::DefaultOptions::new().deserialize(bytes)?)
    }

    /// Writes a consensus delta in one batch: hard state, then truncation,
    /// then the new entries.
    pub fn persist(&self, delta: &PersistDelta) -> Result<(), MetaError> {
        if delta.is_empty() {
            return Ok(());
        }
        let mut ops = Vec::new();
        if let Some((term, voted_for)) = delta.hard_state {
            ops.push(BatchOp::Put {
                key: KEY_TERM.to_vec(),
                value: term.as_u64().to_be_bytes().to_vec(),
            });
            ops.push(match voted_for {
                Some(n) => BatchOp::Put {
                    key: KEY_VOTED_FOR.to_vec(),
                    value: n.as_u64().to_be_bytes().to_vec(),
                },
                None => BatchOp::Delete {
                    key: KEY_VOTED_FOR.to_vec(),
                },
            });
        }
        if let Some(from) = delta.truncate_from {
            let start_key = log_entry_key(from);
            let end_key = log_entry_key(LogIndex::new(u64::MAX));
            for (key, _) in self.kv.scan_range(&start_key, &end_key)? {
                ops.push(BatchOp::Delete { key });
            }
        }
        for entry in &delta.entries {
            ops.push(BatchOp::Put {
                key: log_entry_key(entry.index),
                value: Self::serialize_entry(entry)?,
            });
        }
        self.kv.write_batch(ops)
    }

    /// Records the last entry applied to the state machine.
    pub fn save_applied(&self, index: LogIndex) -> Result<(), MetaError> {
        self.kv
            .put(KEY_APPLIED.to_vec(), index.as_u64().to_be_bytes().to_vec())
    }

    /// Loads the current term. Returns Term(0) if not set.
    pub fn load_term(&self) -> Result<Term, MetaError> {
        match self.kv.get(KEY_TERM)? {
            Some(bytes) => Ok(Term::new(read_u64(&bytes, "term")?)),
            None => Ok(Term::new(0)),
        }
    }

    /// Loads the voted_for node. Returns None if not set.
    pub fn load_voted_for(&self) -> Result<Option<NodeId>, MetaError> {
        match self.kv.get(KEY_VOTED_FOR)? {
            Some(bytes) => Ok(Some(NodeId::new(read_u64(&bytes, "voted_for")?))),
            None => Ok(None),
        }
    }

    /// Loads the last applied index. Returns LogIndex::ZERO if not set.
    pub fn load_applied(&self) -> Result<LogIndex, MetaError> {
        match self.kv.get(KEY_APPLIED)? {
            Some(bytes) => Ok(LogIndex::new(read_u64(&bytes, "applied")?)),
            None => Ok(LogIndex::ZERO),
        }
    }

    /// Gets all log entries from start to end (inclusive).
    pub fn get_entries(&self, start: LogIndex, end: LogIndex) -> Result<Vec<LogEntry>, MetaError> {
        if start > end {
            return Ok(Vec::new());
        }
        let start_key = log_entry_key(start);
        let end_key = log_entry_key(LogIndex::new(end.as_u64().saturating_add(1)));
        self.kv
            .scan_range(&start_key, &end_key)?
            .iter()
            .map(|(_, value)| Self::deserialize_entry(value))
            .collect()
    }

    /// Loads everything needed to resume. The log must be dense from index 1.
    pub fn load(&self) -> Result<DurableRaftState, MetaError> {
        let mut entries = Vec::new();
        for (_, value) in self.kv.scan_prefix(PREFIX_LOG)? {
            let entry = Self::deserialize_entry(&value)?;
            let expected = entries.len() as u64 + 1;
            if entry.index.as_u64() != expected {
                return Err(MetaError::Storage(format!(
                    "raft log gap: expected index {}, found {}",
                    expected, entry.index
                )));
            }
            entries.push(entry);
        }
        Ok(DurableRaftState {
            term: self.load_term()?,
            voted_for: self.load_voted_for()?,
            entries,
            applied: self.load_applied()?,
        })
    }
}
