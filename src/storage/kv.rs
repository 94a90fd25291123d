//! Key-value store contract
//!
//! The coins database sits on top of any store that can answer point
//! lookups, hand out an ordered snapshot, and apply a batch of puts and
//! deletes atomically.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io;
use thiserror::Error;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

// =============================================================================
// Write Batch
// =============================================================================

/// A single operation inside a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// An ordered list of writes applied as one unit
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put(key.into(), value.into()));
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete(key.into()));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    /// Apply every operation to an ordered map, in insertion order
    pub fn apply_to(self, map: &mut BTreeMap<Vec<u8>, Vec<u8>>) {
        for op in self.ops {
            match op {
                BatchOp::Put(key, value) => {
                    map.insert(key, value);
                }
                BatchOp::Delete(key) => {
                    map.remove(&key);
                }
            }
        }
    }
}

// =============================================================================
// Key-Value Store
// =============================================================================

/// Ordered key-value storage with atomic batch writes
pub trait KeyValueStore: Send + Sync {
    /// Look up a single key
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Check whether a key is present
    fn contains(&self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.get(key)?.is_some())
    }

    /// Point-in-time copy of every entry whose key starts with `prefix`,
    /// in ascending key order
    fn snapshot(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;

    /// Apply all operations or none of them
    fn write_batch(&self, batch: WriteBatch) -> Result<(), StorageError>;

    /// Approximate size of the stored data in bytes
    fn size_estimate(&self) -> usize {
        0
    }
}

/// Collect the prefixed range of an ordered map
pub(crate) fn prefix_range(
    map: &BTreeMap<Vec<u8>, Vec<u8>>,
    prefix: &[u8],
) -> Vec<(Vec<u8>, Vec<u8>)> {
    map.range(prefix.to_vec()..)
        .take_while(|(key, _)| key.starts_with(prefix))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

pub(crate) fn map_size(map: &BTreeMap<Vec<u8>, Vec<u8>>) -> usize {
    map.iter().map(|(key, value)| key.len() + value.len()).sum()
}

/// Volatile store backed by an ordered map
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.map.read().get(key).cloned())
    }

    fn contains(&self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.map.read().contains_key(key))
    }

    fn snapshot(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        Ok(prefix_range(&self.map.read(), prefix))
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), StorageError> {
        batch.apply_to(&mut self.map.write());
        Ok(())
    }

    fn size_estimate(&self) -> usize {
        map_size(&self.map.read())
    }
}
