//! Views over the UTXO set
//!
//! [`CoinsView`] is the read side shared by the persistent database and by
//! every cache layered on top of it. [`CoinsViewMut`] adds the single write
//! operation, an atomic batch. Keeping the two apart lets a throwaway cache
//! sit on a shared reference to another view with no way to flush into it.

use crate::core::{Coin, CoinsMap, OutPoint};
use crate::crypto::Hash256;
use crate::storage::StorageError;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by views and caches
#[derive(Error, Debug)]
pub enum CoinsError {
    #[error("Duplicate output: {0} is already unspent")]
    DuplicateOutput(OutPoint),
    #[error("Missing output: {0} has no unspent coin")]
    MissingOutput(OutPoint),
    #[error("FRESH flag misapplied to {0}, which is unspent in the parent")]
    FreshMisapplied(OutPoint),
    #[error("Backing store failure: {0}")]
    BackingStore(#[from] StorageError),
}

pub type CoinsResult<T> = Result<T, CoinsError>;

/// Single-pass iterator over a snapshot of a view, in outpoint order
pub type CoinsCursor<'a> = Box<dyn Iterator<Item = CoinsResult<(OutPoint, Coin)>> + 'a>;

// =============================================================================
// Traits
// =============================================================================

/// Read access to a UTXO set
pub trait CoinsView {
    /// Look up the unspent coin at `outpoint`
    fn get_coin(&self, outpoint: &OutPoint) -> CoinsResult<Option<Coin>>;

    /// Whether an unspent coin exists at `outpoint`
    fn have_coin(&self, outpoint: &OutPoint) -> CoinsResult<bool> {
        Ok(self.get_coin(outpoint)?.is_some())
    }

    /// Hash of the block this view represents; zero if none has been recorded
    fn best_block(&self) -> CoinsResult<Hash256>;

    /// Iterate every coin in the view
    fn cursor(&self) -> CoinsResult<CoinsCursor<'_>>;

    /// Approximate size of the backing storage in bytes
    fn estimate_size(&self) -> usize {
        0
    }
}

/// A view that accepts batched changes from a cache above it
pub trait CoinsViewMut: CoinsView {
    /// Apply every dirty entry of `changes` and record `best_block`.
    ///
    /// Either the whole batch is applied or the view is left unchanged.
    fn batch_write(&mut self, changes: CoinsMap, best_block: Hash256) -> CoinsResult<()>;
}

macro_rules! forward_coins_view {
    ($($ty:ty),*) => {$(
        impl<V: CoinsView + ?Sized> CoinsView for $ty {
            fn get_coin(&self, outpoint: &OutPoint) -> CoinsResult<Option<Coin>> {
                (**self).get_coin(outpoint)
            }

            fn have_coin(&self, outpoint: &OutPoint) -> CoinsResult<bool> {
                (**self).have_coin(outpoint)
            }

            fn best_block(&self) -> CoinsResult<Hash256> {
                (**self).best_block()
            }

            fn cursor(&self) -> CoinsResult<CoinsCursor<'_>> {
                (**self).cursor()
            }

            fn estimate_size(&self) -> usize {
                (**self).estimate_size()
            }
        }
    )*};
}

forward_coins_view!(&V, &mut V, Box<V>, Arc<V>);

impl<V: CoinsViewMut + ?Sized> CoinsViewMut for &mut V {
    fn batch_write(&mut self, changes: CoinsMap, best_block: Hash256) -> CoinsResult<()> {
        (**self).batch_write(changes, best_block)
    }
}

impl<V: CoinsViewMut + ?Sized> CoinsViewMut for Box<V> {
    fn batch_write(&mut self, changes: CoinsMap, best_block: Hash256) -> CoinsResult<()> {
        (**self).batch_write(changes, best_block)
    }
}

/// A view with no coins and no best block
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyView;

impl CoinsView for EmptyView {
    fn get_coin(&self, _outpoint: &OutPoint) -> CoinsResult<Option<Coin>> {
        Ok(None)
    }

    fn best_block(&self) -> CoinsResult<Hash256> {
        Ok(Hash256::ZERO)
    }

    fn cursor(&self) -> CoinsResult<CoinsCursor<'_>> {
        Ok(Box::new(std::iter::empty::<CoinsResult<(OutPoint, Coin)>>()))
    }
}

// =============================================================================
// Set Statistics
// =============================================================================

/// Aggregate figures over a whole UTXO set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoinsStats {
    pub best_block: Hash256,
    pub coin_count: u64,
    /// Sum of all unspent amounts
    pub total_amount: i128,
    /// Distinct transactions with at least one unspent output
    pub transaction_count: u64,
}

impl CoinsStats {
    /// Walk the full set once
    pub fn compute<V: CoinsView + ?Sized>(view: &V) -> CoinsResult<Self> {
        let mut stats = CoinsStats {
            best_block: view.best_block()?,
            ..Default::default()
        };
        let mut last_txid = None;

        for item in view.cursor()? {
            let (outpoint, coin) = item?;
            stats.coin_count += 1;
            stats.total_amount += i128::from(coin.amount);
            if last_txid != Some(outpoint.txid) {
                stats.transaction_count += 1;
                last_txid = Some(outpoint.txid);
            }
        }

        Ok(stats)
    }
}
