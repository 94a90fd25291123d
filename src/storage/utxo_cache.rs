//! UTXO cache layered over a parent view
//!
//! A [`CoinsViewCache`] holds the outputs validation has touched, tagged
//! with two flags:
//! - DIRTY: the entry differs from the parent and is written on flush
//! - FRESH: the parent has never seen the key, so spending it only needs
//!   to drop the local entry
//!
//! Reads fall through to the parent on a miss and materialize a clean
//! entry. Writes only touch the local map until [`CoinsViewCache::flush`]
//! hands every dirty entry to the parent in one atomic batch.
//!
//! The cache is not thread-safe; reads take `&self` but populate the map
//! through a `RefCell`. Callers serialize access with an external lock.

use crate::core::{
    CacheEntry, Coin, CoinState, CoinsMap, EntryFlags, OutPoint, Transaction,
};
use crate::crypto::Hash256;
use crate::storage::view::{CoinsCursor, CoinsError, CoinsResult, CoinsView, CoinsViewMut};
use std::cell::{Cell, RefCell};
use std::collections::hash_map::Entry;
use std::collections::BTreeMap;

// =============================================================================
// Constants
// =============================================================================

/// Upper bound on outputs scanned when looking a transaction up by txid
pub const MAX_OUTPUTS_PER_TX: u32 = 11_000;

// =============================================================================
// Cache Statistics
// =============================================================================

/// Cache performance statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub spends: u64,
    pub uncached: u64,
    pub flushes: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: CoinsMap,
    /// Running estimate of bytes held by `entries`
    usage: usize,
    stats: CacheStats,
}

impl CacheInner {
    /// Insert or replace an entry, returning the one it displaced
    fn insert(&mut self, outpoint: OutPoint, entry: CacheEntry) -> Option<CacheEntry> {
        self.usage += entry.memory_usage();
        let old = self.entries.insert(outpoint, entry)?;
        self.usage = self.usage.saturating_sub(old.memory_usage());
        Some(old)
    }

    fn remove(&mut self, outpoint: &OutPoint) -> Option<CacheEntry> {
        let entry = self.entries.remove(outpoint)?;
        self.usage = self.usage.saturating_sub(entry.memory_usage());
        Some(entry)
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.usage = 0;
    }
}

// =============================================================================
// Coins View Cache
// =============================================================================

/// In-memory overlay over a parent [`CoinsView`]
///
/// `P` is a handle to the parent, not the parent itself: `&V` for a
/// read-only throwaway layer, `&mut V` for a layer that can be flushed, or a
/// cheap clonable handle such as [`CoinsViewDB`](crate::storage::CoinsViewDB).
pub struct CoinsViewCache<P> {
    parent: P,
    inner: RefCell<CacheInner>,
    /// Best block to record on the next flush; fetched from the parent lazily
    best_block: Cell<Option<Hash256>>,
}

impl<P: CoinsView> CoinsViewCache<P> {
    /// Create an empty cache over `parent`
    pub fn new(parent: P) -> Self {
        Self {
            parent,
            inner: RefCell::new(CacheInner::default()),
            best_block: Cell::new(None),
        }
    }

    pub fn parent(&self) -> &P {
        &self.parent
    }

    /// Discard all uncommitted changes and give back the parent handle
    pub fn into_parent(self) -> P {
        self.parent
    }

    /// Make sure `outpoint` is held locally if any view knows about it.
    /// Returns whether a local entry exists afterwards.
    fn fetch(&mut self, outpoint: &OutPoint) -> CoinsResult<bool> {
        let inner = self.inner.get_mut();
        if inner.entries.contains_key(outpoint) {
            inner.stats.hits += 1;
            return Ok(true);
        }
        inner.stats.misses += 1;

        match self.parent.get_coin(outpoint)? {
            Some(coin) => {
                inner.insert(*outpoint, CacheEntry::clean(coin));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Look up a coin without populating the cache.
    ///
    /// Read-only callers that share this instance use this instead of
    /// [`CoinsView::get_coin`].
    pub fn peek_coin(&self, outpoint: &OutPoint) -> CoinsResult<Option<Coin>> {
        if let Some(entry) = self.inner.borrow().entries.get(outpoint) {
            return Ok(entry.coin().cloned());
        }
        self.parent.get_coin(outpoint)
    }

    /// Add a coin at `outpoint`.
    ///
    /// Unless `possible_overwrite` is set, the outpoint must not already hold
    /// an unspent coin. This is stricter than a purely local check: with no
    /// local entry, a coin the parent still holds is also rejected with
    /// [`CoinsError::DuplicateOutput`]. The same parent lookup decides
    /// whether the new entry is FRESH.
    pub fn add_coin(
        &mut self,
        outpoint: OutPoint,
        coin: Coin,
        possible_overwrite: bool,
    ) -> CoinsResult<()> {
        let inner = self.inner.get_mut();

        let fresh = match inner.entries.get(&outpoint) {
            Some(existing) => {
                if !existing.is_spent() && !possible_overwrite {
                    return Err(CoinsError::DuplicateOutput(outpoint));
                }
                existing.is_fresh()
            }
            None => {
                let in_parent = self.parent.have_coin(&outpoint)?;
                if in_parent && !possible_overwrite {
                    return Err(CoinsError::DuplicateOutput(outpoint));
                }
                !in_parent
            }
        };

        let flags = if fresh {
            EntryFlags::DIRTY | EntryFlags::FRESH
        } else {
            EntryFlags::DIRTY
        };
        inner.insert(outpoint, CacheEntry::new(CoinState::Unspent(coin), flags));
        inner.stats.inserts += 1;
        Ok(())
    }

    /// Spend the coin at `outpoint`, returning it.
    ///
    /// A FRESH coin is simply dropped; anything else is kept as a dirty
    /// spent marker so the flush deletes it from the parent.
    pub fn spend_coin(&mut self, outpoint: &OutPoint) -> CoinsResult<Coin> {
        if !self.fetch(outpoint)? {
            return Err(CoinsError::MissingOutput(*outpoint));
        }

        let inner = self.inner.get_mut();
        let fresh = match inner.entries.get(outpoint) {
            Some(entry) if !entry.is_spent() => entry.is_fresh(),
            _ => return Err(CoinsError::MissingOutput(*outpoint)),
        };

        let previous = if fresh {
            inner.remove(outpoint)
        } else {
            inner.insert(
                *outpoint,
                CacheEntry::new(CoinState::Spent, EntryFlags::DIRTY),
            )
        };
        inner.stats.spends += 1;

        match previous.map(|entry| entry.state) {
            Some(CoinState::Unspent(coin)) => Ok(coin),
            _ => Err(CoinsError::MissingOutput(*outpoint)),
        }
    }

    /// Drop a local entry that carries no pending change
    pub fn uncache(&mut self, outpoint: &OutPoint) -> bool {
        let inner = self.inner.get_mut();
        let removable = inner
            .entries
            .get(outpoint)
            .is_some_and(|entry| entry.flags.is_empty());
        if removable {
            inner.remove(outpoint);
            inner.stats.uncached += 1;
        }
        removable
    }

    /// Record the block the cache will represent after the next flush
    pub fn set_best_block(&mut self, hash: Hash256) {
        self.best_block.set(Some(hash));
    }

    /// Estimated bytes held by cached entries
    pub fn dynamic_memory_usage(&self) -> usize {
        self.inner.borrow().usage
    }

    /// Whether the memory estimate has crossed `max_bytes`
    pub fn needs_flush(&self, max_bytes: usize) -> bool {
        self.dynamic_memory_usage() > max_bytes
    }

    /// Number of locally held entries, spent markers included
    pub fn cache_size(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    /// Number of entries with pending changes
    pub fn dirty_count(&self) -> usize {
        self.inner
            .borrow()
            .entries
            .values()
            .filter(|entry| entry.is_dirty())
            .count()
    }

    /// Copy of the local entry for `outpoint`, if any
    pub fn cached_entry(&self, outpoint: &OutPoint) -> Option<CacheEntry> {
        self.inner.borrow().entries.get(outpoint).cloned()
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.borrow().stats.clone()
    }

    /// The change set a flush would hand to the parent
    fn pending_changes(&self) -> CoinsMap {
        self.inner
            .borrow()
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_dirty() && !(entry.is_spent() && entry.is_fresh()))
            .map(|(outpoint, entry)| (*outpoint, entry.clone()))
            .collect()
    }
}

impl<P: CoinsViewMut> CoinsViewCache<P> {
    /// Write every pending change to the parent and empty the cache.
    ///
    /// On failure the cache is left exactly as it was, so the flush can be
    /// retried.
    pub fn flush(&mut self) -> CoinsResult<()> {
        let count = self.write_to_parent()?;
        let inner = self.inner.get_mut();
        inner.clear();
        inner.stats.flushes += 1;
        log::debug!("Flushed {} changed coins to parent", count);
        Ok(())
    }

    /// Like [`flush`](Self::flush), but keep unspent entries as clean reads
    pub fn sync(&mut self) -> CoinsResult<()> {
        let count = self.write_to_parent()?;
        let inner = self.inner.get_mut();
        inner.entries.retain(|_, entry| !entry.is_spent());
        for entry in inner.entries.values_mut() {
            entry.flags = EntryFlags::empty();
        }
        inner.usage = inner.entries.values().map(CacheEntry::memory_usage).sum();
        inner.stats.flushes += 1;
        log::debug!(
            "Synced {} changed coins to parent, {} entries kept",
            count,
            inner.entries.len()
        );
        Ok(())
    }

    /// Flush only when the memory estimate has crossed `max_bytes`
    pub fn flush_if_needed(&mut self, max_bytes: usize) -> CoinsResult<bool> {
        if !self.needs_flush(max_bytes) {
            return Ok(false);
        }
        log::info!(
            "Cache usage {} bytes exceeds limit of {} bytes, flushing",
            self.dynamic_memory_usage(),
            max_bytes
        );
        self.flush()?;
        Ok(true)
    }

    fn write_to_parent(&mut self) -> CoinsResult<usize> {
        let best_block = self.best_block()?;
        let changes = self.pending_changes();
        let count = changes.len();

        if let Err(e) = self.parent.batch_write(changes, best_block) {
            log::warn!("Writing {} coins to parent failed: {}", count, e);
            return Err(e);
        }
        self.best_block.set(Some(best_block));
        Ok(count)
    }
}

impl<P: CoinsView> CoinsView for CoinsViewCache<P> {
    fn get_coin(&self, outpoint: &OutPoint) -> CoinsResult<Option<Coin>> {
        {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            if let Some(entry) = inner.entries.get(outpoint) {
                inner.stats.hits += 1;
                return Ok(entry.coin().cloned());
            }
            inner.stats.misses += 1;
        }

        let coin = self.parent.get_coin(outpoint)?;
        if let Some(coin) = &coin {
            self.inner
                .borrow_mut()
                .insert(*outpoint, CacheEntry::clean(coin.clone()));
        }
        Ok(coin)
    }

    fn have_coin(&self, outpoint: &OutPoint) -> CoinsResult<bool> {
        if let Some(entry) = self.inner.borrow().entries.get(outpoint) {
            return Ok(!entry.is_spent());
        }
        self.parent.have_coin(outpoint)
    }

    fn best_block(&self) -> CoinsResult<Hash256> {
        if let Some(hash) = self.best_block.get() {
            return Ok(hash);
        }
        let hash = self.parent.best_block()?;
        self.best_block.set(Some(hash));
        Ok(hash)
    }

    /// Snapshot of the parent's coins with local changes applied on top
    fn cursor(&self) -> CoinsResult<CoinsCursor<'_>> {
        let mut merged = BTreeMap::new();
        for item in self.parent.cursor()? {
            let (outpoint, coin) = item?;
            merged.insert(outpoint, coin);
        }

        for (outpoint, entry) in &self.inner.borrow().entries {
            match &entry.state {
                CoinState::Unspent(coin) => {
                    merged.insert(*outpoint, coin.clone());
                }
                CoinState::Spent => {
                    merged.remove(outpoint);
                }
            }
        }

        Ok(Box::new(merged.into_iter().map(Ok::<_, CoinsError>)))
    }

    fn estimate_size(&self) -> usize {
        self.parent.estimate_size()
    }
}

impl<P: CoinsView> CoinsViewMut for CoinsViewCache<P> {
    fn batch_write(&mut self, changes: CoinsMap, best_block: Hash256) -> CoinsResult<()> {
        let inner = self.inner.get_mut();

        // Validate first so a rejected batch changes nothing
        for (outpoint, child) in &changes {
            if child.is_dirty() && child.is_fresh() {
                let clashes = inner
                    .entries
                    .get(outpoint)
                    .is_some_and(|local| !local.is_spent());
                if clashes {
                    return Err(CoinsError::FreshMisapplied(*outpoint));
                }
            }
        }

        for (outpoint, child) in changes {
            if !child.is_dirty() {
                continue;
            }

            match inner.entries.entry(outpoint) {
                Entry::Vacant(slot) => {
                    // The child created and spent it; we never need to know
                    if child.is_fresh() && child.is_spent() {
                        continue;
                    }
                    let mut flags = EntryFlags::DIRTY;
                    if child.is_fresh() {
                        flags |= EntryFlags::FRESH;
                    }
                    let entry = CacheEntry::new(child.state, flags);
                    inner.usage += entry.memory_usage();
                    slot.insert(entry);
                }
                Entry::Occupied(mut slot) => {
                    if slot.get().is_fresh() && child.is_spent() {
                        let removed = slot.remove();
                        inner.usage = inner.usage.saturating_sub(removed.memory_usage());
                    } else {
                        let local = slot.get_mut();
                        inner.usage = inner.usage.saturating_sub(local.memory_usage());
                        local.state = child.state;
                        local.flags |= EntryFlags::DIRTY;
                        inner.usage += local.memory_usage();
                    }
                }
            }
        }

        self.best_block.set(Some(best_block));
        Ok(())
    }
}

// =============================================================================
// Read-Only Access
// =============================================================================

/// A view over a shared cache that never populates it.
///
/// Lookups go through [`CoinsViewCache::peek_coin`], so misses are served by
/// the parent without leaving an entry behind.
pub struct ReadOnlyCache<'a, P> {
    cache: &'a CoinsViewCache<P>,
}

impl<P: CoinsView> CoinsViewCache<P> {
    pub fn read_only(&self) -> ReadOnlyCache<'_, P> {
        ReadOnlyCache { cache: self }
    }
}

impl<P: CoinsView> CoinsView for ReadOnlyCache<'_, P> {
    fn get_coin(&self, outpoint: &OutPoint) -> CoinsResult<Option<Coin>> {
        self.cache.peek_coin(outpoint)
    }

    fn have_coin(&self, outpoint: &OutPoint) -> CoinsResult<bool> {
        self.cache.have_coin(outpoint)
    }

    fn best_block(&self) -> CoinsResult<Hash256> {
        self.cache.best_block()
    }

    fn cursor(&self) -> CoinsResult<CoinsCursor<'_>> {
        self.cache.cursor()
    }

    fn estimate_size(&self) -> usize {
        self.cache.estimate_size()
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Find the first unspent output of transaction `txid`
pub fn access_by_txid<V: CoinsView + ?Sized>(
    view: &V,
    txid: &Hash256,
) -> CoinsResult<Option<(OutPoint, Coin)>> {
    for index in 0..MAX_OUTPUTS_PER_TX {
        let outpoint = OutPoint::new(*txid, index);
        if let Some(coin) = view.get_coin(&outpoint)? {
            return Ok(Some((outpoint, coin)));
        }
    }
    Ok(None)
}

/// Add every output of `tx` as a coin created at `height`.
///
/// Coinbase outputs may legitimately repeat an earlier coinbase txid, so
/// they are always added with overwrite allowed.
pub fn add_tx_coins<P: CoinsView>(
    cache: &mut CoinsViewCache<P>,
    tx: &Transaction,
    height: u32,
    allow_overwrite: bool,
) -> CoinsResult<()> {
    let txid = tx.txid();
    let is_coinbase = tx.is_coinbase();
    let overwrite = allow_overwrite || is_coinbase;
    for (index, output) in tx.outputs.iter().enumerate() {
        let coin = Coin::new(output.amount, output.script_pubkey.clone(), height, is_coinbase);
        cache.add_coin(OutPoint::new(txid, index as u32), coin, overwrite)?;
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
