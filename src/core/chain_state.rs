//! Chain state
//!
//! Owns the long-lived tip cache over the coins database and applies whole
//! blocks to it. Each block is validated and applied in a child cache
//! stacked on the tip; only a fully valid block is flushed into the tip, so
//! a rejected block leaves no trace. The tip itself is flushed to disk at a
//! block boundary once it outgrows [`CacheConfig::max_cache_bytes`].

use crate::config::{CacheConfig, ChainStateConfig};
use crate::core::block::{Block, BlockError};
use crate::core::coin::Coin;
use crate::core::outpoint::OutPoint;
use crate::core::script::{ScriptError, ScriptVerifier};
use crate::core::transaction::{money_range, Transaction, COINBASE_MATURITY};
use crate::crypto::Hash256;
use crate::storage::{
    add_tx_coins, CacheStats, CoinsError, CoinsStats, CoinsView, CoinsViewCache, CoinsViewDB,
    StorageError,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Chain state errors
#[derive(Error, Debug)]
pub enum ChainStateError {
    #[error(transparent)]
    Coins(#[from] CoinsError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Invalid block: {0}")]
    Block(#[from] BlockError),
    #[error("Coinbase output {0} spent after {1} confirmations (need {})", COINBASE_MATURITY)]
    PrematureCoinbaseSpend(OutPoint, u32),
    #[error("Amounts of transaction {0} out of range")]
    ValueOutOfRange(Hash256),
    #[error("Transaction {0} spends less than it creates")]
    InputsBelowOutputs(Hash256),
    #[error("Script verification failed for input {1} of {0}: {2}")]
    Script(Hash256, usize, #[source] ScriptError),
    #[error("Best block mismatch: expected {expected}, got {found}")]
    BestBlockMismatch { expected: Hash256, found: Hash256 },
    #[error("Undo data does not match block {0}")]
    UndoMismatch(Hash256),
}

pub type ChainStateResult<T> = Result<T, ChainStateError>;

// =============================================================================
// Undo Data
// =============================================================================

/// Coins spent by a block, needed to disconnect it again
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockUndo {
    pub block_hash: Hash256,
    /// One list per non-coinbase transaction, one coin per input
    pub spent: Vec<Vec<Coin>>,
}

impl BlockUndo {
    pub fn new(block_hash: Hash256) -> Self {
        Self {
            block_hash,
            spent: Vec::new(),
        }
    }

    pub fn spent_count(&self) -> usize {
        self.spent.iter().map(Vec::len).sum()
    }
}

// =============================================================================
// Chain State
// =============================================================================

/// The UTXO set at the current tip
pub struct ChainState {
    tip: Mutex<CoinsViewCache<CoinsViewDB>>,
    config: CacheConfig,
}

impl ChainState {
    pub fn new(db: CoinsViewDB, config: CacheConfig) -> Self {
        Self {
            tip: Mutex::new(CoinsViewCache::new(db)),
            config,
        }
    }

    /// Open the file-backed coins database described by `config`
    pub fn open(config: &ChainStateConfig) -> ChainStateResult<Self> {
        let db = CoinsViewDB::open(config.storage.clone())?;
        let state = Self::new(db, config.cache.clone());
        log::info!(
            "Opened chain state at {} (best block {})",
            config.storage.data_dir.display(),
            state.best_block()?
        );
        Ok(state)
    }

    /// A chain state that lives only in memory
    pub fn in_memory(config: CacheConfig) -> Self {
        Self::new(CoinsViewDB::in_memory(), config)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Validate `block` at `height` and apply it to the tip.
    ///
    /// Returns the coins it spent. On any error the tip is unchanged. A failed
    /// implicit flush afterwards is not an error: the block stays applied in
    /// the tip cache.
    pub fn connect_block(
        &self,
        block: &Block,
        height: u32,
        verifier: &dyn ScriptVerifier,
    ) -> ChainStateResult<BlockUndo> {
        block.check()?;

        let mut tip = self.tip.lock();
        let best = tip.best_block()?;
        if best != block.header.previous_hash {
            return Err(ChainStateError::BestBlockMismatch {
                expected: best,
                found: block.header.previous_hash,
            });
        }

        let block_hash = block.hash();
        let mut undo = BlockUndo::new(block_hash);
        {
            let mut view = CoinsViewCache::new(&mut *tip);
            for tx in &block.transactions {
                if !tx.is_coinbase() {
                    undo.spent.push(spend_inputs(&mut view, tx, height, verifier)?);
                }
                add_tx_coins(&mut view, tx, height, false)?;
            }
            view.set_best_block(block_hash);
            view.flush()?;
        }

        flush_tip_if_needed(&mut tip, self.config.max_cache_bytes);
        log::info!(
            "Connected block {} at height {} ({} txs, {} inputs, cache {} bytes)",
            block_hash,
            height,
            block.tx_count(),
            undo.spent_count(),
            tip.dynamic_memory_usage()
        );
        Ok(undo)
    }

    /// Undo the effects of the tip block using its undo data.
    ///
    /// Like [`connect_block`](Self::connect_block), an error leaves the tip
    /// unchanged and a failed implicit flush is only logged.
    pub fn disconnect_block(&self, block: &Block, undo: &BlockUndo) -> ChainStateResult<()> {
        let block_hash = block.hash();
        if undo.block_hash != block_hash || undo.spent.len() + 1 != block.tx_count() {
            return Err(ChainStateError::UndoMismatch(block_hash));
        }

        let mut tip = self.tip.lock();
        let best = tip.best_block()?;
        if best != block_hash {
            return Err(ChainStateError::BestBlockMismatch {
                expected: best,
                found: block_hash,
            });
        }

        {
            let mut view = CoinsViewCache::new(&mut *tip);
            for (tx_index, tx) in block.transactions.iter().enumerate().rev() {
                let txid = tx.txid();
                for index in 0..tx.outputs.len() {
                    view.spend_coin(&OutPoint::new(txid, index as u32))?;
                }

                if tx_index == 0 {
                    continue;
                }
                let spent = &undo.spent[tx_index - 1];
                if spent.len() != tx.inputs.len() {
                    return Err(ChainStateError::UndoMismatch(block_hash));
                }
                for (input, coin) in tx.inputs.iter().zip(spent).rev() {
                    view.add_coin(input.prev_out, coin.clone(), true)?;
                }
            }
            view.set_best_block(block.header.previous_hash);
            view.flush()?;
        }

        flush_tip_if_needed(&mut tip, self.config.max_cache_bytes);
        log::info!(
            "Disconnected block {}, new tip {}",
            block_hash,
            block.header.previous_hash
        );
        Ok(())
    }

    /// Look up an unspent coin at the tip
    pub fn coin(&self, outpoint: &OutPoint) -> ChainStateResult<Option<Coin>> {
        Ok(self.tip.lock().peek_coin(outpoint)?)
    }

    pub fn best_block(&self) -> ChainStateResult<Hash256> {
        Ok(self.tip.lock().best_block()?)
    }

    /// Run `f` against a read-only view of the tip.
    ///
    /// Misses are answered by the database without populating the tip, and
    /// the lock is held only for the call.
    pub fn with_view<R>(&self, f: impl FnOnce(&dyn CoinsView) -> R) -> R {
        let tip = self.tip.lock();
        f(&tip.read_only())
    }

    /// Write the tip cache to disk
    pub fn flush(&self) -> ChainStateResult<()> {
        self.tip.lock().flush()?;
        Ok(())
    }

    /// Aggregate figures over the whole set, pending changes included
    pub fn stats(&self) -> ChainStateResult<CoinsStats> {
        Ok(CoinsStats::compute(&*self.tip.lock())?)
    }

    pub fn cache_usage(&self) -> usize {
        self.tip.lock().dynamic_memory_usage()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.tip.lock().stats()
    }

    /// Number of tip entries not yet written to disk
    pub fn pending_changes(&self) -> usize {
        self.tip.lock().dirty_count()
    }
}

/// Implicit flush at a block boundary.
///
/// The block is already part of the tip by now, so a failed write is only
/// logged; the changes stay in memory and the next flush retries them.
fn flush_tip_if_needed(tip: &mut CoinsViewCache<CoinsViewDB>, max_bytes: usize) {
    if let Err(e) = tip.flush_if_needed(max_bytes) {
        log::warn!(
            "Implicit flush failed, keeping {} pending changes in memory: {}",
            tip.dirty_count(),
            e
        );
    }
}

/// Check every input of `tx` against `view` and spend them
fn spend_inputs<P: CoinsView>(
    view: &mut CoinsViewCache<P>,
    tx: &Transaction,
    height: u32,
    verifier: &dyn ScriptVerifier,
) -> ChainStateResult<Vec<Coin>> {
    let txid = tx.txid();
    let mut input_total = 0i64;

    for (index, input) in tx.inputs.iter().enumerate() {
        let coin = view
            .get_coin(&input.prev_out)?
            .ok_or(CoinsError::MissingOutput(input.prev_out))?;

        if coin.is_coinbase {
            let depth = height.saturating_sub(coin.height);
            if depth < COINBASE_MATURITY {
                return Err(ChainStateError::PrematureCoinbaseSpend(input.prev_out, depth));
            }
        }

        input_total = input_total
            .checked_add(coin.amount)
            .filter(|total| money_range(coin.amount) && money_range(*total))
            .ok_or(ChainStateError::ValueOutOfRange(txid))?;

        verifier
            .verify(tx, index, &coin)
            .map_err(|e| ChainStateError::Script(txid, index, e))?;
    }

    let output_total = tx
        .total_output()
        .filter(|total| money_range(*total))
        .ok_or(ChainStateError::ValueOutOfRange(txid))?;
    if input_total < output_total {
        return Err(ChainStateError::InputsBelowOutputs(txid));
    }

    tx.inputs
        .iter()
        .map(|input| Ok(view.spend_coin(&input.prev_out)?))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::script::{AcceptAllScripts, MatchingScripts};
    use crate::core::TransactionBuilder;
    use crate::storage::{KeyValueStore, WriteBatch};
    use std::sync::Arc;

    const SCRIPT: &[u8] = &[0x51];

    /// Chain of `count` coinbase-only blocks; returns the blocks in order
    fn mine(state: &ChainState, count: u32) -> Vec<Block> {
        let mut blocks = Vec::new();
        for height in 0..count {
            let previous = state.best_block().unwrap();
            let block = Block::new(
                previous,
                vec![Transaction::coinbase(SCRIPT.to_vec(), 50, height)],
                height,
            );
            state.connect_block(&block, height, &AcceptAllScripts).unwrap();
            blocks.push(block);
        }
        blocks
    }

    fn spend(prev: OutPoint, amounts: &[i64]) -> Transaction {
        let mut builder = TransactionBuilder::new().add_input(prev);
        for amount in amounts {
            builder = builder.add_output(*amount, SCRIPT.to_vec());
        }
        let mut tx = builder.build();
        tx.inputs[0].script_sig = SCRIPT.to_vec();
        tx
    }

    fn snapshot(state: &ChainState) -> Vec<(OutPoint, Coin)> {
        state.with_view(|view| view.cursor().unwrap().map(|item| item.unwrap()).collect())
    }

    #[test]
    fn test_connect_creates_coinbase_coin() {
        let state = ChainState::in_memory(CacheConfig::default());
        let blocks = mine(&state, 1);

        let coinbase = &blocks[0].transactions[0];
        let coin = state.coin(&OutPoint::new(coinbase.txid(), 0)).unwrap().unwrap();
        assert!(coin.is_coinbase);
        assert_eq!(coin.height, 0);
        assert_eq!(state.best_block().unwrap(), blocks[0].hash());
    }

    #[test]
    fn test_connect_then_disconnect_restores_set() {
        let state = ChainState::in_memory(CacheConfig::default());
        let blocks = mine(&state, COINBASE_MATURITY + 1);
        let before = snapshot(&state);
        let tip = state.best_block().unwrap();

        let mature = OutPoint::new(blocks[0].transactions[0].txid(), 0);
        let first = spend(mature, &[30, 20]);
        // Spends an output created earlier in the same block
        let second = spend(OutPoint::new(first.txid(), 1), &[15]);
        let height = COINBASE_MATURITY + 1;
        let block = Block::new(
            tip,
            vec![
                Transaction::coinbase(SCRIPT.to_vec(), 50, height),
                first.clone(),
                second.clone(),
            ],
            height,
        );

        let undo = state.connect_block(&block, height, &MatchingScripts).unwrap();
        assert_eq!(undo.spent_count(), 2);
        assert!(state.coin(&mature).unwrap().is_none());
        assert!(state.coin(&OutPoint::new(first.txid(), 0)).unwrap().is_some());
        assert!(state.coin(&OutPoint::new(first.txid(), 1)).unwrap().is_none());
        assert!(state.coin(&OutPoint::new(second.txid(), 0)).unwrap().is_some());

        state.disconnect_block(&block, &undo).unwrap();
        assert_eq!(snapshot(&state), before);
        assert_eq!(state.best_block().unwrap(), tip);

        state.flush().unwrap();
        assert_eq!(snapshot(&state), before);
    }

    #[test]
    fn test_failed_block_leaves_tip_untouched() {
        let state = ChainState::in_memory(CacheConfig::default());
        let blocks = mine(&state, COINBASE_MATURITY + 1);
        let before = snapshot(&state);
        let pending = state.pending_changes();
        let tip = state.best_block().unwrap();
        let height = COINBASE_MATURITY + 1;

        let good = spend(OutPoint::new(blocks[0].transactions[0].txid(), 0), &[50]);
        let missing = spend(OutPoint::new(Hash256([9; 32]), 0), &[1]);
        let block = Block::new(
            tip,
            vec![Transaction::coinbase(SCRIPT.to_vec(), 50, height), good, missing],
            height,
        );

        assert!(matches!(
            state.connect_block(&block, height, &AcceptAllScripts),
            Err(ChainStateError::Coins(CoinsError::MissingOutput(_)))
        ));
        assert_eq!(snapshot(&state), before);
        assert_eq!(state.pending_changes(), pending);
        assert_eq!(state.best_block().unwrap(), tip);
    }

    #[test]
    fn test_rejects_immature_coinbase_spend() {
        let state = ChainState::in_memory(CacheConfig::default());
        let blocks = mine(&state, 10);
        let coinbase = OutPoint::new(blocks[0].transactions[0].txid(), 0);

        let block = Block::new(
            state.best_block().unwrap(),
            vec![
                Transaction::coinbase(SCRIPT.to_vec(), 50, 10),
                spend(coinbase, &[50]),
            ],
            10,
        );
        assert!(matches!(
            state.connect_block(&block, 10, &AcceptAllScripts),
            Err(ChainStateError::PrematureCoinbaseSpend(op, 10)) if op == coinbase
        ));
    }

    #[test]
    fn test_rejects_overspend_and_bad_script() {
        let state = ChainState::in_memory(CacheConfig::default());
        let blocks = mine(&state, COINBASE_MATURITY + 1);
        let mature = OutPoint::new(blocks[0].transactions[0].txid(), 0);
        let tip = state.best_block().unwrap();
        let height = COINBASE_MATURITY + 1;
        let coinbase = Transaction::coinbase(SCRIPT.to_vec(), 50, height);

        let overspend = Block::new(tip, vec![coinbase.clone(), spend(mature, &[51])], height);
        assert!(matches!(
            state.connect_block(&overspend, height, &AcceptAllScripts),
            Err(ChainStateError::InputsBelowOutputs(_))
        ));

        let mut unsigned = spend(mature, &[50]);
        unsigned.inputs[0].script_sig.clear();
        let bad_script = Block::new(tip, vec![coinbase, unsigned], height);
        assert!(matches!(
            state.connect_block(&bad_script, height, &MatchingScripts),
            Err(ChainStateError::Script(_, 0, ScriptError::Mismatch))
        ));
        assert!(state.coin(&mature).unwrap().is_some());
    }

    #[test]
    fn test_rejects_wrong_parent() {
        let state = ChainState::in_memory(CacheConfig::default());
        mine(&state, 2);

        let orphan = Block::new(
            Hash256([7; 32]),
            vec![Transaction::coinbase(SCRIPT.to_vec(), 50, 2)],
            2,
        );
        assert!(matches!(
            state.connect_block(&orphan, 2, &AcceptAllScripts),
            Err(ChainStateError::BestBlockMismatch { .. })
        ));

        let undo = BlockUndo::new(orphan.hash());
        assert!(matches!(
            state.disconnect_block(&orphan, &undo),
            Err(ChainStateError::BestBlockMismatch { .. })
        ));
    }

    #[test]
    fn test_tip_flushes_when_over_budget() {
        let state = ChainState::in_memory(CacheConfig { max_cache_bytes: 0 });
        mine(&state, 3);

        assert_eq!(state.cache_usage(), 0);
        assert_eq!(state.pending_changes(), 0);
        assert_eq!(state.stats().unwrap().coin_count, 3);
    }

    /// Store that reads as an empty database and refuses every write
    struct FullDisk;

    impl KeyValueStore for FullDisk {
        fn get(&self, _key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
            Ok(None)
        }

        fn snapshot(&self, _prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
            Ok(Vec::new())
        }

        fn write_batch(&self, _batch: WriteBatch) -> Result<(), StorageError> {
            Err(StorageError::InvalidData("disk full".to_string()))
        }
    }

    #[test]
    fn test_failed_implicit_flush_keeps_block() {
        let db = CoinsViewDB::new(Arc::new(FullDisk));
        let state = ChainState::new(db, CacheConfig { max_cache_bytes: 0 });
        let block = Block::new(
            Hash256::ZERO,
            vec![Transaction::coinbase(SCRIPT.to_vec(), 50, 0)],
            0,
        );
        let outpoint = OutPoint::new(block.transactions[0].txid(), 0);

        // The write to disk fails, but the block is connected in memory
        let undo = state.connect_block(&block, 0, &AcceptAllScripts).unwrap();
        assert_eq!(state.best_block().unwrap(), block.hash());
        assert!(state.coin(&outpoint).unwrap().is_some());
        assert_eq!(state.pending_changes(), 1);
        assert!(state.flush().is_err());

        // The undo data is still usable
        state.disconnect_block(&block, &undo).unwrap();
        assert!(state.coin(&outpoint).unwrap().is_none());
        assert!(state.best_block().unwrap().is_zero());
    }

    #[test]
    fn test_with_view_does_not_populate_tip() {
        let state = ChainState::in_memory(CacheConfig::default());
        let blocks = mine(&state, 2);
        state.flush().unwrap();
        assert_eq!(state.cache_usage(), 0);

        let outpoint = OutPoint::new(blocks[0].transactions[0].txid(), 0);
        let coin = state.with_view(|view| view.get_coin(&outpoint)).unwrap();
        assert_eq!(coin.map(|c| c.amount), Some(50));
        assert!(state.with_view(|view| view.have_coin(&outpoint)).unwrap());
        assert!(state
            .with_view(|view| view.get_coin(&OutPoint::new(Hash256([3; 32]), 0)))
            .unwrap()
            .is_none());

        assert_eq!(state.cache_usage(), 0);
        assert_eq!(state.stats().unwrap().coin_count, 2);
    }

    #[test]
    fn test_reopen_file_backed_state() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = ChainStateConfig::default();
        config.storage.data_dir = temp_dir.path().to_path_buf();

        let tip = {
            let state = ChainState::open(&config).unwrap();
            mine(&state, 3);
            state.flush().unwrap();
            state.best_block().unwrap()
        };

        let state = ChainState::open(&config).unwrap();
        assert_eq!(state.best_block().unwrap(), tip);
        let stats = state.stats().unwrap();
        assert_eq!(stats.coin_count, 3);
        assert_eq!(stats.total_amount, 150);
    }

    #[test]
    fn test_concurrent_readers() {
        let state = std::sync::Arc::new(ChainState::in_memory(CacheConfig::default()));
        let blocks = mine(&state, 5);
        let outpoints: Vec<OutPoint> = blocks
            .iter()
            .map(|block| OutPoint::new(block.transactions[0].txid(), 0))
            .collect();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let state = state.clone();
                let outpoints = outpoints.clone();
                std::thread::spawn(move || {
                    outpoints
                        .iter()
                        .filter(|op| state.coin(op).unwrap().is_some())
                        .count()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 5);
        }
    }
}
