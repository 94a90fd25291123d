//! Transactions as seen by the UTXO set
//!
//! A transaction consumes coins through its inputs and creates new coins
//! through its outputs. Only the parts the coins layer needs are modelled:
//! the previous outpoints, amounts and locking scripts. Scripts are opaque
//! bytes handed to a verifier.

use crate::core::outpoint::OutPoint;
use crate::crypto::{double_sha256, Hash256};
use crate::storage::codec::write_varint;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Current transaction version
pub const TX_VERSION: u32 = 2;

/// Sequence number that disables locktime
pub const SEQUENCE_FINAL: u32 = 0xFFFFFFFF;

/// Base units per coin
pub const COIN: i64 = 100_000_000;

/// Upper bound for any single amount or sum of amounts
pub const MAX_MONEY: i64 = 21_000_000 * COIN;

/// Blocks a coinbase output must wait before it can be spent
pub const COINBASE_MATURITY: u32 = 100;

/// Whether `amount` is a valid monetary value
pub fn money_range(amount: i64) -> bool {
    (0..=MAX_MONEY).contains(&amount)
}

// =============================================================================
// Error Types
// =============================================================================

/// Context-free transaction errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Transaction has no inputs")]
    NoInputs,
    #[error("Transaction has no outputs")]
    NoOutputs,
    #[error("Output {0} amount out of range")]
    OutputOutOfRange(usize),
    #[error("Total output amount out of range")]
    TotalOutOfRange,
    #[error("Input {0} is spent twice")]
    DuplicateInput(OutPoint),
    #[error("Non-coinbase transaction spends the null outpoint")]
    NullInput,
}

// =============================================================================
// Transaction Input / Output
// =============================================================================

/// Transaction input (reference to a previous output)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionInput {
    pub prev_out: OutPoint,
    #[serde(with = "crate::core::coin::hex_bytes")]
    pub script_sig: Vec<u8>,
    #[serde(default = "default_sequence")]
    pub sequence: u32,
}

fn default_sequence() -> u32 {
    SEQUENCE_FINAL
}

impl TransactionInput {
    pub fn new(prev_out: OutPoint) -> Self {
        Self {
            prev_out,
            script_sig: Vec::new(),
            sequence: SEQUENCE_FINAL,
        }
    }
}

/// Transaction output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionOutput {
    pub amount: i64,
    #[serde(with = "crate::core::coin::hex_bytes")]
    pub script_pubkey: Vec<u8>,
}

impl TransactionOutput {
    pub fn new(amount: i64, script_pubkey: Vec<u8>) -> Self {
        Self {
            amount,
            script_pubkey,
        }
    }
}

// =============================================================================
// Transaction
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    #[serde(default)]
    pub lock_time: u32,
}

impl Transaction {
    pub fn new(inputs: Vec<TransactionInput>, outputs: Vec<TransactionOutput>) -> Self {
        Self {
            version: TX_VERSION,
            inputs,
            outputs,
            lock_time: 0,
        }
    }

    /// Create a coinbase paying `amount` to `script_pubkey`.
    ///
    /// The height goes into the input script so coinbases at different
    /// heights never share a txid.
    pub fn coinbase(script_pubkey: Vec<u8>, amount: i64, height: u32) -> Self {
        let input = TransactionInput {
            prev_out: OutPoint::null(),
            script_sig: height.to_le_bytes().to_vec(),
            sequence: SEQUENCE_FINAL,
        };
        Self::new(vec![input], vec![TransactionOutput::new(amount, script_pubkey)])
    }

    /// A coinbase has exactly one input, spending the null outpoint
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prev_out.is_null()
    }

    /// Canonical byte encoding used for hashing
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.version.to_le_bytes());

        write_varint(&mut out, self.inputs.len() as u64);
        for input in &self.inputs {
            out.extend_from_slice(input.prev_out.txid.as_bytes());
            out.extend_from_slice(&input.prev_out.index.to_le_bytes());
            write_varint(&mut out, input.script_sig.len() as u64);
            out.extend_from_slice(&input.script_sig);
            out.extend_from_slice(&input.sequence.to_le_bytes());
        }

        write_varint(&mut out, self.outputs.len() as u64);
        for output in &self.outputs {
            out.extend_from_slice(&output.amount.to_le_bytes());
            write_varint(&mut out, output.script_pubkey.len() as u64);
            out.extend_from_slice(&output.script_pubkey);
        }

        out.extend_from_slice(&self.lock_time.to_le_bytes());
        out
    }

    /// Transaction id: double SHA-256 of the serialized form
    pub fn txid(&self) -> Hash256 {
        double_sha256(&self.serialize())
    }

    /// Sum of output amounts, `None` on overflow
    pub fn total_output(&self) -> Option<i64> {
        self.outputs
            .iter()
            .try_fold(0i64, |sum, output| sum.checked_add(output.amount))
    }

    /// Checks that need no access to the UTXO set
    pub fn check(&self) -> Result<(), TransactionError> {
        if self.inputs.is_empty() {
            return Err(TransactionError::NoInputs);
        }
        if self.outputs.is_empty() {
            return Err(TransactionError::NoOutputs);
        }

        let mut total = 0i64;
        for (index, output) in self.outputs.iter().enumerate() {
            if !money_range(output.amount) {
                return Err(TransactionError::OutputOutOfRange(index));
            }
            total += output.amount;
            if !money_range(total) {
                return Err(TransactionError::TotalOutOfRange);
            }
        }

        let mut seen = HashSet::with_capacity(self.inputs.len());
        for input in &self.inputs {
            if !seen.insert(input.prev_out) {
                return Err(TransactionError::DuplicateInput(input.prev_out));
            }
        }

        if !self.is_coinbase() && self.inputs.iter().any(|i| i.prev_out.is_null()) {
            return Err(TransactionError::NullInput);
        }

        Ok(())
    }
}

// =============================================================================
// Transaction Builder
// =============================================================================

/// Builder for spending transactions
#[derive(Debug, Default)]
pub struct TransactionBuilder {
    inputs: Vec<TransactionInput>,
    outputs: Vec<TransactionOutput>,
    lock_time: u32,
}

impl TransactionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_input(mut self, prev_out: OutPoint) -> Self {
        self.inputs.push(TransactionInput::new(prev_out));
        self
    }

    pub fn add_output(mut self, amount: i64, script_pubkey: Vec<u8>) -> Self {
        self.outputs.push(TransactionOutput::new(amount, script_pubkey));
        self
    }

    pub fn lock_time(mut self, lock_time: u32) -> Self {
        self.lock_time = lock_time;
        self
    }

    pub fn build(self) -> Transaction {
        let mut tx = Transaction::new(self.inputs, self.outputs);
        tx.lock_time = self.lock_time;
        tx
    }
}

// =============================================================================
// Tests
// =============================================================================
