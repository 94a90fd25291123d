//! UTXO storage
//!
//! - [`view`]: the read/write traits every layer implements
//! - [`utxo_cache`]: the dirty/fresh tracking cache
//! - [`coins_db`]: the persistent leaf
//! - [`kv`] and [`file_store`]: key-value stores underneath it
//! - [`codec`]: the on-disk key and value encoding

pub mod codec;
pub mod coins_db;
pub mod file_store;
pub mod kv;
pub mod utxo_cache;
pub mod view;

pub use coins_db::CoinsViewDB;
pub use file_store::{FileStore, StorageConfig, StorageStats};
pub use kv::{BatchOp, KeyValueStore, MemoryStore, StorageError, WriteBatch};
pub use utxo_cache::{
    access_by_txid, add_tx_coins, CacheStats, CoinsViewCache, ReadOnlyCache, MAX_OUTPUTS_PER_TX,
};
pub use view::{
    CoinsCursor, CoinsError, CoinsResult, CoinsStats, CoinsView, CoinsViewMut, EmptyView,
};
