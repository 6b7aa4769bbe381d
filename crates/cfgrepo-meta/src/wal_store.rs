//! Persistent file-backed KV store with WAL and checkpoint support.
//!
//! Reads are served from an in-memory BTreeMap. Every write is appended to
//! the write-ahead log and synced before it becomes visible; a write batch
//! is a single WAL record, so a torn tail never exposes half a commit.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::MetaError;
use crate::kvstore::{apply_batch, scan_prefix_in, scan_range_in, BatchOp, Key, KvPair, KvStore, Value};

const WAL_FILENAME: &str = "wal.bin";
const CHECKPOINT_FILENAME: &str = "checkpoint.bin";

#[derive(Debug, Serialize, Deserialize)]
struct WalRecord {
    seq: u64,
    ops: Vec<BatchOp>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Checkpoint {
    seq: u64,
    entries: Vec<KvPair>,
}

struct WalWriter {
    file: File,
    seq: u64,
}

impl WalWriter {
    fn open(path: &Path, seq: u64) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(WalWriter { file, seq })
    }

    fn append(&mut self, ops: &[BatchOp]) -> Result<(), MetaError> {
        self.seq += 1;
        let record = WalRecord {
            seq: self.seq,
            ops: ops.to_vec(),
        };
        let encoded = bincode::serialize(&record)?;
        let len_bytes = (encoded.len() as u32).to_le_bytes();
        self.file.write_all(&len_bytes)?;
        self.file.write_all(&encoded)?;
        self.file.sync_all()?;
        Ok(())
    }

    fn truncate(&mut self) -> std::io::Result<()> {
        self.file.set_len(0)?;
        self.file.sync_all()
    }
}

/// Persistent file-backed KV store.
///
/// On open, loads the last checkpoint and replays the WAL records written
/// after it. A truncated final record (crash mid-append) is discarded.
pub struct FileKvStore {
    data: RwLock<BTreeMap<Key, Value>>,
    wal: Mutex<WalWriter>,
    dir: PathBuf,
}

impl FileKvStore {
    /// Opens or creates a store in the given directory.
    pub fn open(dir: &Path) -> Result<Self, MetaError> {
        fs::create_dir_all(dir)?;

        let mut data = BTreeMap::new();
        let checkpoint_seq = load_checkpoint(&dir.join(CHECKPOINT_FILENAME), &mut data)?;
        let seq = replay_wal(&dir.join(WAL_FILENAME), checkpoint_seq, &mut data)?;

        tracing::info!(
            dir = %dir.display(),
            keys = data.len(),
            seq,
            "opened file-backed KV store"
        );

        Ok(Self {
            data: RwLock::new(data),
            wal: Mutex::new(WalWriter::open(&dir.join(WAL_FILENAME), seq)?),
            dir: dir.to_path_buf(),
        })
    }

    /// Writes a checkpoint of the current state and truncates the WAL.
    pub fn checkpoint(&self) -> Result<(), MetaError> {
        let mut wal = self.wal.lock();
        let data = self.data.read();
        let checkpoint = Checkpoint {
            seq: wal.seq,
            entries: data.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        };
        let encoded = bincode::serialize(&checkpoint)?;

        let checkpoint_path = self.dir.join(CHECKPOINT_FILENAME);
        let mut tmp_path = checkpoint_path.clone();
        tmp_path.set_extension("tmp");
        {
            let mut tmp_file = File::create(&tmp_path)?;
            tmp_file.write_all(&encoded)?;
            tmp_file.sync_all()?;
        }
        fs::rename(&tmp_path, &checkpoint_path)?;
        wal.truncate()?;

        tracing::debug!(seq = checkpoint.seq, keys = data.len(), "wrote KV checkpoint");
        Ok(())
    }

    fn write(&self, ops: Vec<BatchOp>) -> Result<(), MetaError> {
        let mut wal = self.wal.lock();
        wal.append(&ops)?;
        apply_batch(&mut self.data.write(), ops);
        Ok(())
    }
}

fn load_checkpoint(path: &Path, data: &mut BTreeMap<Key, Value>) -> Result<u64, MetaError> {
    if !path.exists() {
        return Ok(0);
    }
    let mut contents = Vec::new();
    File::open(path)?.read_to_end(&mut contents)?;
    if contents.is_empty() {
        return Ok(0);
    }
    let checkpoint: Checkpoint = bincode::deserialize(&contents)
        .map_err(|e| MetaError::Storage(format!("failed to decode checkpoint: {}", e)))?;
    data.extend(checkpoint.entries);
    Ok(checkpoint.seq)
}

fn replay_wal(
    path: &Path,
    checkpoint_seq: u64,
    data: &mut BTreeMap<Key, Value>,
) -> Result<u64, MetaError> {
    if !path.exists() {
        return Ok(checkpoint_seq);
    }
    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut max_seq = checkpoint_seq;
    let mut valid_len = 0u64;
    loop {
        let mut len_buf = [0u8; 4];
        match file.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if valid_len + 4 + len as u64 > file_len {
            break;
        }
        let mut buf = vec![0u8; len];
        match file.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        valid_len += 4 + len as u64;
        let record: WalRecord = bincode::deserialize(&buf)
            .map_err(|e| MetaError::Storage(format!("failed to decode WAL record: {}", e)))?;
        if record.seq <= checkpoint_seq {
            continue;
        }
        max_seq = max_seq.max(record.seq);
        apply_batch(data, record.ops);
    }
    if valid_len < file_len {
        tracing::warn!(path = %path.display(), valid_len, "discarding torn WAL tail");
        OpenOptions::new().write(true).open(path)?.set_len(valid_len)?;
    }
    Ok(max_seq)
}

impl KvStore for FileKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Value>, MetaError> {
        Ok(self.data.read().get(key).cloned())
    }

    fn put(&self, key: Key, value: Value) -> Result<(), MetaError> {
        self.write(vec![BatchOp::Put { key, value }])
    }

    fn delete(&self, key: &[u8]) -> Result<(), MetaError> {
        self.write(vec![BatchOp::Delete { key: key.to_vec() }])
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, MetaError> {
        Ok(scan_prefix_in(&self.data.read(), prefix))
    }

    fn scan_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<KvPair>, MetaError> {
        Ok(scan_range_in(&self.data.read(), start, end))
    }

    fn contains_key(&self, key: &[u8]) -> Result<bool, MetaError> {
        Ok(self.data.read().contains_key(key))
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), MetaError> {
        if ops.is_empty() {
            return Ok(());
        }
        self.write(ops)
    }
}
