//! Embedded key-value store underneath repositories, project indexes and
//! the Raft log.
//!
//! All repository records for a replica live in one ordered keyspace. The
//! in-memory store serves tests and ephemeral nodes; the WAL-backed store
//! in [`crate::wal_store`] serves persistent nodes.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::MetaError;

/// Key type for the KV store.
pub type Key = Vec<u8>;
/// Value type for the KV store.
pub type Value = Vec<u8>;
/// A key-value pair.
pub type KvPair = (Key, Value);

/// Ordered key-value store.
pub trait KvStore: Send + Sync {
    /// Get a value by key. Returns None if the key doesn't exist.
    fn get(&self, key: &[u8]) -> Result<Option<Value>, MetaError>;

    /// Put a key-value pair. Overwrites any existing value.
    fn put(&self, key: Key, value: Value) -> Result<(), MetaError>;

    /// Delete a key. Returns Ok(()) even if the key didn't exist.
    fn delete(&self, key: &[u8]) -> Result<(), MetaError>;

    /// Scan all keys with the given prefix, returning (key, value) pairs in sorted order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, MetaError>;

    /// Scan a range of keys [start, end), returning (key, value) pairs in sorted order.
    fn scan_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<KvPair>, MetaError>;

    /// Returns true if the key exists.
    fn contains_key(&self, key: &[u8]) -> Result<bool, MetaError> {
        Ok(self.get(key)?.is_some())
    }

    /// Atomically write a batch of operations (puts and deletes).
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), MetaError>;
}

/// A single operation in a write batch.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum BatchOp {
    /// Put a key-value pair.
    Put {
        /// The key to insert or update.
        key: Vec<u8>,
        /// The value to store.
        value: Vec<u8>,
    },
    /// Delete a key.
    Delete {
        /// The key to delete.
        key: Vec<u8>,
    },
}

pub(crate) fn apply_batch(data: &mut BTreeMap<Key, Value>, ops: Vec<BatchOp>) {
    for op in ops {
        match op {
            BatchOp::Put { key, value } => {
                data.insert(key, value);
            }
            BatchOp::Delete { key } => {
                data.remove(&key);
            }
        }
    }
}

pub(crate) fn scan_prefix_in(data: &BTreeMap<Key, Value>, prefix: &[u8]) -> Vec<KvPair> {
    data.range::<Vec<u8>, _>(prefix.to_vec()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

pub(crate) fn scan_range_in(data: &BTreeMap<Key, Value>, start: &[u8], end: &[u8]) -> Vec<KvPair> {
    data.range::<Vec<u8>, _>((
        Bound::Included(start.to_vec()),
        Bound::Excluded(end.to_vec()),
    ))
    .map(|(k, v)| (k.clone(), v.clone()))
    .collect()
}

/// In-memory KV store backed by a BTreeMap. Does not persist across restarts.
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    data: Arc<RwLock<BTreeMap<Key, Value>>>,
}

impl MemoryKvStore {
    /// Creates a new empty in-memory KV store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns true if the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Value>, MetaError> {
        Ok(self.data.read().get(key).cloned())
    }

    fn put(&self, key: Key, value: Value) -> Result<(), MetaError> {
        self.data.write().insert(key, value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), MetaError> {
        self.data.write().remove(key);
        Ok(())
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
        apply_batch(&mut self.data.write(), ops);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let store = MemoryKvStore::new();
        store.put(b"key1".to_vec(), b"value1".to_vec()).unwrap();
        assert_eq!(store.get(b"key1").unwrap(), Some(b"value1".to_vec()));
        assert_eq!(store.get(b"key2").unwrap(), None);
        store.delete(b"key1").unwrap();
        assert!(!store.contains_key(b"key1").unwrap());
    }

    #[test]
    fn test_scan_prefix_stops_at_boundary() {
        let store = MemoryKvStore::new();
        store.put(b"repo/a".to_vec(), b"1".to_vec()).unwrap();
        store.put(b"repo/b".to_vec(), b"2".to_vec()).unwrap();
        store.put(b"repp".to_vec(), b"3".to_vec()).unwrap();

        let result = store.scan_prefix(b"repo/").unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].0, b"repo/a");
        assert_eq!(result[1].0, b"repo/b");
    }

    #[test]
    fn test_scan_range_is_half_open() {
        let store = MemoryKvStore::new();
        for i in 0u8..5 {
            store.put(vec![b'k', i], vec![i]).unwrap();
        }
        let result = store.scan_range(&[b'k', 1], &[b'k', 3]).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].1, vec![1]);
        assert_eq!(result[1].1, vec![2]);
    }

    #[test]
    fn test_write_batch() {
        let store = MemoryKvStore::new();
        store.put(b"gone".to_vec(), b"x".to_vec()).unwrap();
        store
            .write_batch(vec![
                BatchOp::Put {
                    key: b"a".to_vec(),
                    value: b"1".to_vec(),
                },
                BatchOp::Delete {
                    key: b"gone".to_vec(),
                },
            ])
            .unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get(b"gone").unwrap(), None);
        assert_eq!(store.len(), 1);
    }
}
