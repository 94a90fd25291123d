//! Coins and cache entries
//!
//! A [`Coin`] is the value stored for every unspent output. Inside a cache
//! each coin is wrapped in a [`CacheEntry`] that records whether the output
//! is still unspent in that overlay and how it relates to the parent view.

use crate::core::OutPoint;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::mem;

// =============================================================================
// Coin
// =============================================================================

/// An unspent transaction output together with its provenance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    /// Output value in the smallest currency unit
    pub amount: i64,
    /// Locking script
    #[serde(with = "hex_bytes")]
    pub script: Vec<u8>,
    /// Height of the block that created this output
    pub height: u32,
    /// Whether the output was created by a coinbase transaction
    pub is_coinbase: bool,
}

impl Coin {
    pub fn new(amount: i64, script: Vec<u8>, height: u32, is_coinbase: bool) -> Self {
        Self {
            amount,
            script,
            height,
            is_coinbase,
        }
    }

    /// Heap bytes owned by this coin
    pub fn dynamic_usage(&self) -> usize {
        self.script.len()
    }
}

pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Cache Entry
// =============================================================================

/// What an overlay knows about an output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoinState {
    Unspent(Coin),
    /// The output existed and has been consumed in this overlay
    Spent,
}

impl CoinState {
    pub fn coin(&self) -> Option<&Coin> {
        match self {
            CoinState::Unspent(coin) => Some(coin),
            CoinState::Spent => None,
        }
    }

    pub fn is_spent(&self) -> bool {
        matches!(self, CoinState::Spent)
    }
}

bitflags! {
    /// Relationship between a cache entry and the parent view
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EntryFlags: u8 {
        /// The entry differs from the parent and must be written on flush
        const DIRTY = 0b01;
        /// The parent has no record of this key at all
        const FRESH = 0b10;
    }
}

/// A coin as held by a cache, tagged with its bookkeeping flags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub state: CoinState,
    pub flags: EntryFlags,
}

/// Approximate fixed cost of one map slot holding a cache entry
pub const ENTRY_OVERHEAD: usize =
    mem::size_of::<(OutPoint, CacheEntry)>() + mem::size_of::<u64>();

impl CacheEntry {
    /// An entry that mirrors the parent exactly
    pub fn clean(coin: Coin) -> Self {
        Self {
            state: CoinState::Unspent(coin),
            flags: EntryFlags::empty(),
        }
    }

    pub fn new(state: CoinState, flags: EntryFlags) -> Self {
        Self { state, flags }
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.contains(EntryFlags::DIRTY)
    }

    pub fn is_fresh(&self) -> bool {
        self.flags.contains(EntryFlags::FRESH)
    }

    pub fn is_spent(&self) -> bool {
        self.state.is_spent()
    }

    pub fn coin(&self) -> Option<&Coin> {
        self.state.coin()
    }

    /// Estimated bytes this entry costs the owning cache
    pub fn memory_usage(&self) -> usize {
        ENTRY_OVERHEAD + self.coin().map_or(0, Coin::dynamic_usage)
    }
}

/// The set of changes handed from a cache to its parent on flush
pub type CoinsMap = HashMap<OutPoint, CacheEntry>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_flags() {
        let coin = Coin::new(5000, vec![0x51], 100, false);

        let clean = CacheEntry::clean(coin.clone());
        assert!(!clean.is_dirty());
        assert!(!clean.is_fresh());
        assert_eq!(clean.coin(), Some(&coin));

        let fresh = CacheEntry::new(
            CoinState::Unspent(coin),
            EntryFlags::DIRTY | EntryFlags::FRESH,
        );
        assert!(fresh.is_dirty());
        assert!(fresh.is_fresh());

        let spent = CacheEntry::new(CoinState::Spent, EntryFlags::DIRTY);
        assert!(spent.is_spent());
        assert!(spent.coin().is_none());
    }

    #[test]
    fn test_memory_usage_counts_script() {
        let small = CacheEntry::clean(Coin::new(1, Vec::new(), 1, false));
        let large = CacheEntry::clean(Coin::new(1, vec![0u8; 100], 1, false));
        let spent = CacheEntry::new(CoinState::Spent, EntryFlags::DIRTY);

        assert_eq!(small.memory_usage(), ENTRY_OVERHEAD);
        assert_eq!(large.memory_usage(), ENTRY_OVERHEAD + 100);
        assert_eq!(spent.memory_usage(), ENTRY_OVERHEAD);
    }

    #[test]
    fn test_coin_json() {
        let coin = Coin::new(42, vec![0xde, 0xad], 7, true);
        let json = serde_json::to_string(&coin).unwrap();
        assert!(json.contains("\"dead\""));
        assert_eq!(serde_json::from_str::<Coin>(&json).unwrap(), coin);
    }
}
