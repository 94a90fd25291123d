//! Blocks
//!
//! A block is a header plus an ordered list of transactions, the first of
//! which must be the coinbase. Connecting a block to the UTXO set happens in
//! [`chain_state`](crate::core::chain_state).

use crate::core::transaction::{Transaction, TransactionError};
use crate::crypto::{calculate_merkle_root, double_sha256, Hash256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Block header size in bytes
pub const BLOCK_HEADER_SIZE: usize = 80;

/// Maximum number of transactions per block
pub const MAX_BLOCK_TXS: usize = 10_000;

/// Block validation errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum BlockError {
    #[error("Block has no transactions")]
    Empty,
    #[error("Too many transactions: {0} (max: {1})")]
    TooManyTransactions(usize, usize),
    #[error("First transaction is not a coinbase")]
    MissingCoinbase,
    #[error("Transaction {0} is an extra coinbase")]
    ExtraCoinbase(usize),
    #[error("Invalid merkle root")]
    InvalidMerkleRoot,
    #[error("Invalid transaction {0}: {1}")]
    InvalidTransaction(usize, TransactionError),
}

/// Block header
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    pub previous_hash: Hash256,
    pub merkle_root: Hash256,
    /// Unix time in seconds
    pub timestamp: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Fixed-size header encoding
    pub fn serialize(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut out = [0u8; BLOCK_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(self.previous_hash.as_bytes());
        out[36..68].copy_from_slice(self.merkle_root.as_bytes());
        out[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
        // bytes 72..76 are reserved for a difficulty target
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    pub fn hash(&self) -> Hash256 {
        double_sha256(&self.serialize())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Build a block on top of `previous_hash`, filling in the merkle root
    pub fn new(previous_hash: Hash256, transactions: Vec<Transaction>, timestamp: u32) -> Self {
        let merkle_root = Self::calculate_merkle_root(&transactions);
        Self {
            header: BlockHeader {
                version: 1,
                previous_hash,
                merkle_root,
                timestamp,
                nonce: 0,
            },
            transactions,
        }
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    fn calculate_merkle_root(transactions: &[Transaction]) -> Hash256 {
        let txids: Vec<Hash256> = transactions.iter().map(Transaction::txid).collect();
        calculate_merkle_root(&txids)
    }

    pub fn verify_merkle_root(&self) -> bool {
        Self::calculate_merkle_root(&self.transactions) == self.header.merkle_root
    }

    pub fn coinbase_tx(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_coinbase())
    }

    pub fn tx_count(&self) -> usize {
        self.transactions.len()
    }

    /// Structural checks that need no access to the UTXO set
    pub fn check(&self) -> Result<(), BlockError> {
        if self.transactions.is_empty() {
            return Err(BlockError::Empty);
        }
        if self.transactions.len() > MAX_BLOCK_TXS {
            return Err(BlockError::TooManyTransactions(
                self.transactions.len(),
                MAX_BLOCK_TXS,
            ));
        }
        if self.coinbase_tx().is_none() {
            return Err(BlockError::MissingCoinbase);
        }
        if let Some(index) = self.transactions.iter().skip(1).position(Transaction::is_coinbase) {
            return Err(BlockError::ExtraCoinbase(index + 1));
        }
        if !self.verify_merkle_root() {
            return Err(BlockError::InvalidMerkleRoot);
        }
        for (index, tx) in self.transactions.iter().enumerate() {
            tx.check()
                .map_err(|e| BlockError::InvalidTransaction(index, e))?;
        }
        Ok(())
    }
}
