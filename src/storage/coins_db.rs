//! Persistent coins database
//!
//! The bottom of every cache stack. Coins live in a [`KeyValueStore`] under
//! the keys produced by [`codec`](crate::storage::codec); the best block
//! hash is stored next to them and updated in the same batch.

use crate::core::{Coin, CoinState, CoinsMap, EntryFlags, OutPoint};
use crate::crypto::Hash256;
use crate::storage::codec::{self, BEST_BLOCK_KEY, COIN_PREFIX};
use crate::storage::file_store::{FileStore, StorageConfig};
use crate::storage::kv::{KeyValueStore, MemoryStore, StorageError, WriteBatch};
use crate::storage::view::{CoinsCursor, CoinsError, CoinsResult, CoinsView, CoinsViewMut};
use std::sync::Arc;

/// UTXO set persisted in a key-value store
///
/// Cloning is cheap and every clone shares the same store.
#[derive(Clone)]
pub struct CoinsViewDB {
    store: Arc<dyn KeyValueStore>,
}

impl CoinsViewDB {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// A database that lives only in memory
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Open (or create) a file-backed database
    pub fn open(config: StorageConfig) -> Result<Self, StorageError> {
        let store = FileStore::open(config)?;
        Ok(Self::new(Arc::new(store)))
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }
}

impl CoinsView for CoinsViewDB {
    fn get_coin(&self, outpoint: &OutPoint) -> CoinsResult<Option<Coin>> {
        let value = self.store.get(&codec::encode_key(outpoint))?;
        Ok(value.map(|bytes| codec::decode_coin(&bytes)).transpose()?)
    }

    fn have_coin(&self, outpoint: &OutPoint) -> CoinsResult<bool> {
        Ok(self.store.contains(&codec::encode_key(outpoint))?)
    }

    fn best_block(&self) -> CoinsResult<Hash256> {
        match self.store.get(BEST_BLOCK_KEY)? {
            Some(bytes) => Hash256::from_slice(&bytes)
                .map_err(|e| CoinsError::from(StorageError::Decode(format!("best block: {}", e)))),
            None => Ok(Hash256::ZERO),
        }
    }

    fn cursor(&self) -> CoinsResult<CoinsCursor<'_>> {
        let snapshot = self.store.snapshot(&[COIN_PREFIX])?;
        Ok(Box::new(snapshot.into_iter().map(|(key, value)| {
            let outpoint = codec::decode_key(&key)?;
            let coin = codec::decode_coin(&value)?;
            Ok((outpoint, coin))
        })))
    }

    fn estimate_size(&self) -> usize {
        self.store.size_estimate()
    }
}

impl CoinsViewMut for CoinsViewDB {
    fn batch_write(&mut self, changes: CoinsMap, best_block: Hash256) -> CoinsResult<()> {
        let mut batch = WriteBatch::new();
        let mut written = 0usize;
        let mut deleted = 0usize;

        for (outpoint, entry) in changes {
            if !entry.is_dirty() {
                continue;
            }
            let key = codec::encode_key(&outpoint);
            match entry.state {
                CoinState::Unspent(coin) => {
                    batch.put(key.to_vec(), codec::encode_coin(&coin));
                    written += 1;
                }
                // Never stored, so there is nothing to delete
                CoinState::Spent if entry.flags.contains(EntryFlags::FRESH) => {}
                CoinState::Spent => {
                    batch.delete(key.to_vec());
                    deleted += 1;
                }
            }
        }
        batch.put(BEST_BLOCK_KEY.to_vec(), best_block.as_bytes().to_vec());

        self.store.write_batch(batch)?;
        log::debug!(
            "Committed {} coins and {} deletions at best block {}",
            written,
            deleted,
            best_block
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CacheEntry;
    use crate::crypto::double_sha256;
    use crate::storage::view::CoinsStats;

    fn unspent(amount: i64) -> CacheEntry {
        CacheEntry::new(
            CoinState::Unspent(Coin::new(amount, vec![0x51], 10, false)),
            EntryFlags::DIRTY,
        )
    }

    #[test]
    fn test_write_and_read() {
        let mut db = CoinsViewDB::in_memory();
        let op = OutPoint::new(double_sha256(b"tx"), 0);

        let mut changes = CoinsMap::new();
        changes.insert(op, unspent(5000));
        db.batch_write(changes, double_sha256(b"block")).unwrap();

        assert!(db.have_coin(&op).unwrap());
        assert_eq!(db.get_coin(&op).unwrap().unwrap().amount, 5000);
        assert_eq!(db.best_block().unwrap(), double_sha256(b"block"));
    }

    #[test]
    fn test_delete_and_fresh_spent() {
        let mut db = CoinsViewDB::in_memory();
        let kept = OutPoint::new(double_sha256(b"kept"), 0);
        let removed = OutPoint::new(double_sha256(b"removed"), 0);

        let mut changes = CoinsMap::new();
        changes.insert(kept, unspent(1));
        changes.insert(removed, unspent(2));
        db.batch_write(changes, Hash256::ZERO).unwrap();

        let mut changes = CoinsMap::new();
        changes.insert(removed, CacheEntry::new(CoinState::Spent, EntryFlags::DIRTY));
        let ghost = OutPoint::new(double_sha256(b"ghost"), 0);
        changes.insert(
            ghost,
            CacheEntry::new(CoinState::Spent, EntryFlags::DIRTY | EntryFlags::FRESH),
        );
        // Clean entries are ignored
        changes.insert(
            OutPoint::new(double_sha256(b"clean"), 0),
            CacheEntry::clean(Coin::new(3, vec![], 1, false)),
        );
        db.batch_write(changes, Hash256::ZERO).unwrap();

        assert!(db.have_coin(&kept).unwrap());
        assert!(!db.have_coin(&removed).unwrap());
        assert!(!db.have_coin(&ghost).unwrap());
        assert_eq!(db.cursor().unwrap().count(), 1);
    }

    #[test]
    fn test_cursor_in_key_order() {
        let mut db = CoinsViewDB::in_memory();
        let high = OutPoint::new(Hash256([0xff; 32]), 0);
        let low_a = OutPoint::new(Hash256([0x01; 32]), 2);
        let low_b = OutPoint::new(Hash256([0x01; 32]), 300);

        let mut changes = CoinsMap::new();
        for op in [high, low_b, low_a] {
            changes.insert(op, unspent(10));
        }
        db.batch_write(changes, Hash256::ZERO).unwrap();

        let keys: Vec<OutPoint> = db.cursor().unwrap().map(|item| item.unwrap().0).collect();
        assert_eq!(keys, vec![low_a, low_b, high]);

        let stats = CoinsStats::compute(&db).unwrap();
        assert_eq!(stats.coin_count, 3);
        assert_eq!(stats.transaction_count, 2);
        assert_eq!(stats.total_amount, 30);
    }

    #[test]
    fn test_corrupt_value_reported() {
        let db = CoinsViewDB::in_memory();
        let op = OutPoint::new(double_sha256(b"tx"), 0);

        let mut batch = WriteBatch::new();
        batch.put(codec::encode_key(&op).to_vec(), vec![0xee, 0x00]);
        db.store().write_batch(batch).unwrap();

        assert!(db.get_coin(&op).is_err());
        assert!(db.cursor().unwrap().next().unwrap().is_err());
    }

    #[test]
    fn test_file_backed_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        let op = OutPoint::new(double_sha256(b"tx"), 1);

        {
            let mut db = CoinsViewDB::open(config.clone()).unwrap();
            let mut changes = CoinsMap::new();
            changes.insert(op, unspent(77));
            db.batch_write(changes, double_sha256(b"tip")).unwrap();
        }

        let db = CoinsViewDB::open(config).unwrap();
        assert_eq!(db.get_coin(&op).unwrap().unwrap().amount, 77);
        assert_eq!(db.best_block().unwrap(), double_sha256(b"tip"));
    }
}
