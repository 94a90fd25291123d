//! Configuration
//!
//! Every setting has a default so a bare `ChainStateConfig::default()` is a
//! working setup. A JSON file may override any subset of fields.

use crate::storage::{StorageConfig, StorageError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Default tip cache budget (450 MiB)
pub const DEFAULT_MAX_CACHE_BYTES: usize = 450 * 1024 * 1024;

/// Cache sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Flush the tip cache at the next block boundary once its memory
    /// estimate exceeds this many bytes
    pub max_cache_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cache_bytes: DEFAULT_MAX_CACHE_BYTES,
        }
    }
}

/// Everything needed to open a chain state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainStateConfig {
    pub cache: CacheConfig,
    pub storage: StorageConfig,
}

impl ChainStateConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self, StorageError> {
        let data = fs::read_to_string(path)?;
        let config = serde_json::from_str(&data)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), StorageError> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
