//! Script verification seam
//!
//! The UTXO layer never interprets scripts. Block connection hands every
//! input, together with the coin it spends, to a [`ScriptVerifier`] chosen
//! by the caller.

use crate::core::coin::Coin;
use crate::core::transaction::Transaction;
use thiserror::Error;

/// Script-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("Script execution failed: {0}")]
    ExecutionFailed(String),
    #[error("Unlocking script does not satisfy the locking script")]
    Mismatch,
    #[error("Script too large: {0} bytes")]
    ScriptTooLarge(usize),
}

/// Maximum size of a locking or unlocking script
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Checks that input `input_index` of `tx` may spend `coin`
pub trait ScriptVerifier {
    fn verify(&self, tx: &Transaction, input_index: usize, coin: &Coin) -> Result<(), ScriptError>;
}

impl<F> ScriptVerifier for F
where
    F: Fn(&Transaction, usize, &Coin) -> Result<(), ScriptError>,
{
    fn verify(&self, tx: &Transaction, input_index: usize, coin: &Coin) -> Result<(), ScriptError> {
        self(tx, input_index, coin)
    }
}

/// Accepts every spend. For replaying blocks that are already trusted.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllScripts;

impl ScriptVerifier for AcceptAllScripts {
    fn verify(
        &self,
        _tx: &Transaction,
        _input_index: usize,
        _coin: &Coin,
    ) -> Result<(), ScriptError> {
        Ok(())
    }
}

/// Toy rule: the unlocking script must repeat the locking script byte for byte
#[derive(Debug, Default, Clone, Copy)]
pub struct MatchingScripts;

impl ScriptVerifier for MatchingScripts {
    fn verify(&self, tx: &Transaction, input_index: usize, coin: &Coin) -> Result<(), ScriptError> {
        let input = tx
            .inputs
            .get(input_index)
            .ok_or_else(|| ScriptError::ExecutionFailed(format!("no input {}", input_index)))?;

        if input.script_sig.len() > MAX_SCRIPT_SIZE {
            return Err(ScriptError::ScriptTooLarge(input.script_sig.len()));
        }
        if input.script_sig != coin.script {
            return Err(ScriptError::Mismatch);
        }
        Ok(())
    }
}
