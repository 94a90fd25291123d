//! Core UTXO domain types
//!
//! This module contains the fundamental building blocks:
//! - Outpoints and coins (the keys and values of the UTXO set)
//! - Transactions and blocks (what creates and spends coins)
//! - Chain state (connecting and disconnecting blocks through the cache)
//! - The script verification seam

pub mod block;
pub mod chain_state;
pub mod coin;
pub mod outpoint;
pub mod script;
pub mod transaction;

pub use block::{Block, BlockError, BlockHeader, BLOCK_HEADER_SIZE, MAX_BLOCK_TXS};
pub use chain_state::{BlockUndo, ChainState, ChainStateError, ChainStateResult};
pub use coin::{CacheEntry, Coin, CoinState, CoinsMap, EntryFlags, ENTRY_OVERHEAD};
pub use outpoint::{OutPoint, OutPointParseError, NULL_INDEX};
pub use script::{AcceptAllScripts, MatchingScripts, ScriptError, ScriptVerifier, MAX_SCRIPT_SIZE};
pub use transaction::{
    money_range, Transaction, TransactionBuilder, TransactionError, TransactionInput,
    TransactionOutput, COIN, COINBASE_MATURITY, MAX_MONEY, SEQUENCE_FINAL, TX_VERSION,
};
