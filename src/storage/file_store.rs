//! File-backed key-value store
//!
//! Keeps the whole key space in memory and mirrors it to a JSON file.
//! Every batch is written to a temporary file and renamed over the live
//! file before the in-memory copy is replaced, so a crash at any point
//! leaves either the old or the new state on disk.

use crate::storage::kv::{map_size, prefix_range, KeyValueStore, StorageError, WriteBatch};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// File format version written into every snapshot
pub const STORE_FORMAT_VERSION: u32 = 1;

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub coins_file: String,
    pub backup_enabled: bool,
    pub max_backups: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".utxo_data"),
            coins_file: "chainstate.json".to_string(),
            backup_enabled: true,
            max_backups: 5,
        }
    }
}

/// Serialized form of the store
#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    /// Hex-encoded key to hex-encoded value
    entries: BTreeMap<String, String>,
}

/// Durable store persisted as a single JSON snapshot
pub struct FileStore {
    config: StorageConfig,
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl FileStore {
    /// Open the store, loading the existing snapshot if there is one
    pub fn open(config: StorageConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.data_dir)?;

        let path = config.data_dir.join(&config.coins_file);
        let map = if path.exists() {
            let map = load_snapshot(&path)?;
            log::info!("Loaded {} records from {}", map.len(), path.display());
            map
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            config,
            map: RwLock::new(map),
        })
    }

    /// Path of the live snapshot file
    pub fn path(&self) -> PathBuf {
        self.config.data_dir.join(&self.config.coins_file)
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        self.config
            .data_dir
            .join(format!("{}.backup.{}", self.config.coins_file, index))
    }

    fn temp_path(&self) -> PathBuf {
        self.config
            .data_dir
            .join(format!("{}.tmp", self.config.coins_file))
    }

    /// Write `map` to disk and atomically replace the live file
    fn persist(&self, map: &BTreeMap<Vec<u8>, Vec<u8>>) -> Result<(), StorageError> {
        let snapshot = StoreFile {
            version: STORE_FORMAT_VERSION,
            entries: map
                .iter()
                .map(|(key, value)| (hex::encode(key), hex::encode(value)))
                .collect(),
        };

        let temp_path = self.temp_path();
        {
            let file = fs::File::create(&temp_path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, &snapshot)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        let path = self.path();
        if self.config.backup_enabled && self.config.max_backups > 0 && path.exists() {
            self.rotate_backups()?;
            fs::copy(&path, self.backup_path(0))?;
        }

        // Atomic rename
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    /// Rotate backup files
    fn rotate_backups(&self) -> Result<(), StorageError> {
        let oldest = self.backup_path(self.config.max_backups - 1);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }

        for i in (0..self.config.max_backups - 1).rev() {
            let current = self.backup_path(i);
            if current.exists() {
                fs::rename(&current, self.backup_path(i + 1))?;
            }
        }

        Ok(())
    }

    /// List available backups, newest first
    pub fn list_backups(&self) -> Vec<usize> {
        (0..self.config.max_backups)
            .filter(|i| self.backup_path(*i).exists())
            .collect()
    }

    /// Replace the live state with the contents of a backup
    pub fn restore_backup(&self, backup_index: usize) -> Result<(), StorageError> {
        let backup_path = self.backup_path(backup_index);
        if !backup_path.exists() {
            return Err(StorageError::InvalidData(format!(
                "Backup {} not found",
                backup_index
            )));
        }

        let restored = load_snapshot(&backup_path)?;
        let mut map = self.map.write();
        self.persist(&restored)?;
        *map = restored;
        log::info!("Restored {} from backup {}", self.path().display(), backup_index);
        Ok(())
    }

    /// Get storage statistics
    pub fn stats(&self) -> Result<StorageStats, StorageError> {
        let path = self.path();
        let file_size = if path.exists() {
            fs::metadata(&path)?.len()
        } else {
            0
        };

        Ok(StorageStats {
            file_size,
            record_count: self.map.read().len(),
            backup_count: self.list_backups().len(),
            data_dir: self.config.data_dir.clone(),
        })
    }
}

impl KeyValueStore for FileStore {
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
        // Hold the write lock so readers never observe a state that is not on disk
        let mut map = self.map.write();
        let mut updated = map.clone();
        batch.apply_to(&mut updated);
        self.persist(&updated)?;
        *map = updated;
        Ok(())
    }

    fn size_estimate(&self) -> usize {
        map_size(&self.map.read())
    }
}

fn load_snapshot(path: &Path) -> Result<BTreeMap<Vec<u8>, Vec<u8>>, StorageError> {
    let file = fs::File::open(path)?;
    let snapshot: StoreFile = serde_json::from_reader(BufReader::new(file))?;

    if snapshot.version != STORE_FORMAT_VERSION {
        return Err(StorageError::InvalidData(format!(
            "unsupported store version {} in {}",
            snapshot.version,
            path.display()
        )));
    }

    snapshot
        .entries
        .into_iter()
        .map(|(key, value)| {
            let key = hex::decode(&key)
                .map_err(|e| StorageError::InvalidData(format!("bad key {:?}: {}", key, e)))?;
            let value = hex::decode(&value)
                .map_err(|e| StorageError::InvalidData(format!("bad value: {}", e)))?;
            Ok((key, value))
        })
        .collect()
}

/// Storage statistics
#[derive(Debug)]
pub struct StorageStats {
    pub file_size: u64,
    pub record_count: usize,
    pub backup_count: usize,
    pub data_dir: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config(dir: &Path) -> StorageConfig {
        StorageConfig {
            data_dir: dir.to_path_buf(),
            ..Default::default()
        }
    }

    fn put(store: &FileStore, key: &[u8], value: &[u8]) {
        let mut batch = WriteBatch::new();
        batch.put(key.to_vec(), value.to_vec());
        store.write_batch(batch).unwrap();
    }

    #[test]
    fn test_survives_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();

        {
            let store = FileStore::open(temp_config(temp_dir.path())).unwrap();
            put(&store, b"k1", b"v1");
            put(&store, b"k2", b"v2");

            let mut batch = WriteBatch::new();
            batch.delete(b"k1".to_vec());
            store.write_batch(batch).unwrap();
        }

        let store = FileStore::open(temp_config(temp_dir.path())).unwrap();
        assert_eq!(store.get(b"k1").unwrap(), None);
        assert_eq!(store.get(b"k2").unwrap(), Some(b"v2".to_vec()));
        assert!(store.stats().unwrap().file_size > 0);
    }

    #[test]
    fn test_failed_write_leaves_state_untouched() {
        let temp_dir = tempfile::tempdir().unwrap();
        let data_dir = temp_dir.path().join("store");
        let store = FileStore::open(temp_config(&data_dir)).unwrap();
        put(&store, b"k1", b"v1");

        // Removing the directory makes the temporary file impossible to create
        fs::remove_dir_all(&data_dir).unwrap();

        let mut batch = WriteBatch::new();
        batch.put(b"k1".to_vec(), b"changed".to_vec());
        batch.put(b"k2".to_vec(), b"new".to_vec());
        assert!(store.write_batch(batch).is_err());

        assert_eq!(store.get(b"k1").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(store.get(b"k2").unwrap(), None);
    }

    #[test]
    fn test_backup_rotation() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            data_dir: temp_dir.path().to_path_buf(),
            max_backups: 3,
            ..Default::default()
        };
        let store = FileStore::open(config).unwrap();

        for i in 0..5u8 {
            put(&store, b"counter", &[i]);
        }

        assert_eq!(store.list_backups(), vec![0, 1, 2]);

        // Backup 0 holds the state before the last write
        store.restore_backup(0).unwrap();
        assert_eq!(store.get(b"counter").unwrap(), Some(vec![3]));
    }

    #[test]
    fn test_backups_disabled() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            data_dir: temp_dir.path().to_path_buf(),
            backup_enabled: false,
            ..Default::default()
        };
        let store = FileStore::open(config).unwrap();
        put(&store, b"a", b"1");
        put(&store, b"a", b"2");

        assert!(store.list_backups().is_empty());
        assert!(store.restore_backup(0).is_err());
    }

    #[test]
    fn test_rejects_corrupt_snapshot() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = temp_config(temp_dir.path());
        fs::write(temp_dir.path().join(&config.coins_file), b"{not json").unwrap();

        assert!(matches!(
            FileStore::open(config),
            Err(StorageError::SerializationError(_))
        ));
    }
}
