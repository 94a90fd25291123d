//! UTXO Cache: a layered unspent-output set for a Bitcoin-style node
//!
//! This crate provides:
//! - A cache with DIRTY/FRESH tracking over any parent view
//! - Atomic flushes into a persistent coins database
//! - In-memory and file-backed key-value stores
//! - Block connect/disconnect with undo data and a size-based flush policy
//! - A watch-only wallet that reads balances through an injected view
//!
//! # Example
//!
//! ```rust
//! use utxo_cache::core::{Coin, OutPoint};
//! use utxo_cache::crypto::double_sha256;
//! use utxo_cache::storage::{CoinsView, CoinsViewCache, CoinsViewDB};
//!
//! let mut db = CoinsViewDB::in_memory();
//! let outpoint = OutPoint::new(double_sha256(b"tx"), 0);
//!
//! // Changes stay in the cache until it is flushed
//! let mut cache = CoinsViewCache::new(&mut db);
//! cache.add_coin(outpoint, Coin::new(5000, vec![0x51], 100, false), false).unwrap();
//! cache.flush().unwrap();
//! drop(cache);
//!
//! assert!(db.have_coin(&outpoint).unwrap());
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod crypto;
pub mod storage;
pub mod wallet;

// Re-export commonly used types
pub use config::{CacheConfig, ChainStateConfig};
pub use core::{Block, ChainState, Coin, OutPoint, Transaction};
pub use crypto::Hash256;
pub use storage::{CoinsError, CoinsView, CoinsViewCache, CoinsViewDB, CoinsViewMut};
pub use wallet::Wallet;
