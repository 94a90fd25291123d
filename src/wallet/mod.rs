//! Wallet-side view of the UTXO set

pub mod wallet;

pub use wallet::{Wallet, WalletError};
