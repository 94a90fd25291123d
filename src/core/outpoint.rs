//! Transaction output references

use crate::crypto::{Hash256, HashParseError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Index value used by the null outpoint
pub const NULL_INDEX: u32 = u32::MAX;

/// Errors from parsing an outpoint in `txid:index` form
#[derive(Error, Debug, PartialEq)]
pub enum OutPointParseError {
    #[error("Expected <txid>:<index>, got {0:?}")]
    MissingSeparator(String),
    #[error("Invalid txid: {0}")]
    InvalidTxid(#[from] HashParseError),
    #[error("Invalid output index: {0}")]
    InvalidIndex(String),
}

/// Reference to one output of one transaction
///
/// Ordering is by txid first, then index, which is also the order
/// entries are stored in on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    /// Hash of the transaction holding the output
    pub txid: Hash256,
    /// Position of the output within the transaction
    pub index: u32,
}

impl OutPoint {
    pub const fn new(txid: Hash256, index: u32) -> Self {
        Self { txid, index }
    }

    /// The "no previous output" sentinel used by coinbase inputs
    pub const fn null() -> Self {
        Self {
            txid: Hash256::ZERO,
            index: NULL_INDEX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.index == NULL_INDEX && self.txid.is_zero()
    }
}

impl Default for OutPoint {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

impl FromStr for OutPoint {
    type Err = OutPointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (txid, index) = s
            .split_once(':')
            .ok_or_else(|| OutPointParseError::MissingSeparator(s.to_string()))?;
        let index = index
            .parse()
            .map_err(|_| OutPointParseError::InvalidIndex(index.to_string()))?;
        Ok(Self::new(txid.parse()?, index))
    }
}
