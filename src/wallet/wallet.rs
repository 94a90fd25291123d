//! Watch-only wallet over a UTXO view
//!
//! A wallet knows which locking scripts are its own and which outpoints it
//! has seen paying to them. Balances are always computed against a view
//! passed in by the caller, so the same wallet can be asked about the tip,
//! a speculative cache, or the on-disk set.

use crate::core::{
    Block, Coin, OutPoint, Transaction, TransactionBuilder, COINBASE_MATURITY,
};
use crate::storage::{CoinsError, CoinsView};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Wallet-related errors
#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Insufficient funds: have {have}, need {need}")]
    InsufficientFunds { have: i64, need: i64 },
    #[error("Invalid amount: {0}")]
    InvalidAmount(i64),
    #[error("Coins error: {0}")]
    Coins(#[from] CoinsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Serializable wallet data for persistence
#[derive(Debug, Default, Serialize, Deserialize)]
struct WalletData {
    label: Option<String>,
    /// Hex-encoded locking scripts
    scripts: Vec<String>,
    outpoints: Vec<OutPoint>,
}

#[derive(Debug, Clone, Default)]
pub struct Wallet {
    pub label: Option<String>,
    scripts: HashSet<Vec<u8>>,
    outpoints: BTreeSet<OutPoint>,
}

impl Wallet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_label(label: &str) -> Self {
        Self {
            label: Some(label.to_string()),
            ..Self::default()
        }
    }

    /// Start watching outputs locked to `script`
    pub fn add_script(&mut self, script: Vec<u8>) {
        self.scripts.insert(script);
    }

    pub fn is_mine(&self, script: &[u8]) -> bool {
        self.scripts.contains(script)
    }

    /// Remember an outpoint so later balance queries look it up
    pub fn track(&mut self, outpoint: OutPoint) -> bool {
        self.outpoints.insert(outpoint)
    }

    pub fn tracked(&self) -> impl Iterator<Item = &OutPoint> {
        self.outpoints.iter()
    }

    /// Track every output of `tx` that pays one of our scripts
    pub fn scan_transaction(&mut self, tx: &Transaction) -> usize {
        let txid = tx.txid();
        let mut found = 0;
        for (index, output) in tx.outputs.iter().enumerate() {
            if self.scripts.contains(&output.script_pubkey)
                && self.outpoints.insert(OutPoint::new(txid, index as u32))
            {
                found += 1;
            }
        }
        found
    }

    /// Track our outputs in every transaction of `block`
    pub fn scan_block(&mut self, block: &Block) -> usize {
        block
            .transactions
            .iter()
            .map(|tx| self.scan_transaction(tx))
            .sum()
    }

    /// Tracked outpoints that are still unspent in `view` and pay to us
    pub fn unspent<V: CoinsView + ?Sized>(
        &self,
        view: &V,
    ) -> Result<Vec<(OutPoint, Coin)>, WalletError> {
        let mut coins = Vec::new();
        for outpoint in &self.outpoints {
            if let Some(coin) = view.get_coin(outpoint)? {
                if self.is_mine(&coin.script) {
                    coins.push((*outpoint, coin));
                }
            }
        }
        Ok(coins)
    }

    /// Sum of our unspent coins in `view`
    pub fn balance<V: CoinsView + ?Sized>(&self, view: &V) -> Result<i64, WalletError> {
        Ok(self.unspent(view)?.iter().map(|(_, coin)| coin.amount).sum())
    }

    /// Our coins that a transaction in a block at `height` may spend
    pub fn spendable_coins<V: CoinsView + ?Sized>(
        &self,
        view: &V,
        height: u32,
    ) -> Result<Vec<(OutPoint, Coin)>, WalletError> {
        let mut coins = self.unspent(view)?;
        coins.retain(|(_, coin)| {
            !coin.is_coinbase || height.saturating_sub(coin.height) >= COINBASE_MATURITY
        });
        Ok(coins)
    }

    /// Build a transaction paying `amount` to `recipient`, spending coins
    /// that are mature at `height`. Change goes to `change_script`.
    ///
    /// Each input's unlocking script repeats the coin's locking script.
    pub fn create_transaction<V: CoinsView + ?Sized>(
        &self,
        view: &V,
        height: u32,
        recipient: Vec<u8>,
        amount: i64,
        change_script: Vec<u8>,
    ) -> Result<Transaction, WalletError> {
        if amount <= 0 {
            return Err(WalletError::InvalidAmount(amount));
        }

        let coins = self.spendable_coins(view, height)?;
        let available: i64 = coins.iter().map(|(_, coin)| coin.amount).sum();
        if available < amount {
            return Err(WalletError::InsufficientFunds {
                have: available,
                need: amount,
            });
        }

        // Select coins to cover the amount
        let mut selected = Vec::new();
        let mut selected_amount = 0i64;
        for (outpoint, coin) in coins {
            selected_amount += coin.amount;
            selected.push((outpoint, coin));
            if selected_amount >= amount {
                break;
            }
        }

        let mut builder = TransactionBuilder::new();
        for (outpoint, _) in &selected {
            builder = builder.add_input(*outpoint);
        }
        builder = builder.add_output(amount, recipient);

        let change = selected_amount - amount;
        if change > 0 {
            builder = builder.add_output(change, change_script);
        }

        let mut tx = builder.build();
        for (input, (_, coin)) in tx.inputs.iter_mut().zip(&selected) {
            input.script_sig = coin.script.clone();
        }
        Ok(tx)
    }

    /// Save wallet to file
    pub fn save(&self, path: &Path) -> Result<(), WalletError> {
        let mut scripts: Vec<String> = self.scripts.iter().map(hex::encode).collect();
        scripts.sort();
        let data = WalletData {
            label: self.label.clone(),
            scripts,
            outpoints: self.outpoints.iter().copied().collect(),
        };

        let json = serde_json::to_string_pretty(&data)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Load wallet from file
    pub fn load(path: &Path) -> Result<Self, WalletError> {
        let json = fs::read_to_string(path)?;
        let data: WalletData = serde_json::from_str(&json)?;

        let scripts = data
            .scripts
            .iter()
            .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .collect::<Result<HashSet<_>, serde_json::Error>>()?;

        Ok(Self {
            label: data.label,
            scripts,
            outpoints: data.outpoints.into_iter().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{double_sha256, Hash256};
    use crate::storage::{CoinsViewCache, EmptyView};

    const MINE: &[u8] = &[0xaa];
    const THEIRS: &[u8] = &[0xbb];

    fn wallet() -> Wallet {
        let mut wallet = Wallet::with_label("test");
        wallet.add_script(MINE.to_vec());
        wallet
    }

    /// A cache holding one coinbase coin at height 0 and two regular coins
    fn funded_view(wallet: &mut Wallet) -> CoinsViewCache<EmptyView> {
        let mut view = CoinsViewCache::new(EmptyView);
        let coins = [
            (OutPoint::new(double_sha256(b"cb"), 0), Coin::new(50, MINE.to_vec(), 0, true)),
            (OutPoint::new(double_sha256(b"a"), 0), Coin::new(20, MINE.to_vec(), 5, false)),
            (OutPoint::new(double_sha256(b"a"), 1), Coin::new(7, THEIRS.to_vec(), 5, false)),
            (OutPoint::new(double_sha256(b"b"), 0), Coin::new(30, MINE.to_vec(), 6, false)),
        ];
        for (outpoint, coin) in coins {
            view.add_coin(outpoint, coin, false).unwrap();
            wallet.track(outpoint);
        }
        view
    }

    #[test]
    fn test_balance_through_injected_view() {
        let mut wallet = wallet();
        let mut view = funded_view(&mut wallet);

        // Coins paying someone else never count
        assert_eq!(wallet.balance(&view).unwrap(), 100);
        assert_eq!(wallet.balance(&EmptyView).unwrap(), 0);

        view.spend_coin(&OutPoint::new(double_sha256(b"b"), 0)).unwrap();
        assert_eq!(wallet.balance(&view).unwrap(), 70);
    }

    #[test]
    fn test_spendable_honors_coinbase_maturity() {
        let mut wallet = wallet();
        let view = funded_view(&mut wallet);

        let early = wallet.spendable_coins(&view, 10).unwrap();
        assert_eq!(early.len(), 2);
        assert!(early.iter().all(|(_, coin)| !coin.is_coinbase));

        let late = wallet.spendable_coins(&view, COINBASE_MATURITY).unwrap();
        assert_eq!(late.len(), 3);
    }

    #[test]
    fn test_scan_block() {
        let mut wallet = wallet();
        let coinbase = Transaction::coinbase(MINE.to_vec(), 50, 1);
        let other = Transaction::coinbase(THEIRS.to_vec(), 50, 2);
        let block = Block::new(Hash256::ZERO, vec![coinbase.clone(), other], 0);

        assert_eq!(wallet.scan_block(&block), 1);
        assert_eq!(wallet.scan_block(&block), 0);
        assert_eq!(
            wallet.tracked().copied().collect::<Vec<_>>(),
            vec![OutPoint::new(coinbase.txid(), 0)]
        );
    }

    #[test]
    fn test_create_transaction() {
        let mut wallet = wallet();
        let view = funded_view(&mut wallet);

        let tx = wallet
            .create_transaction(&view, 10, THEIRS.to_vec(), 45, MINE.to_vec())
            .unwrap();
        // Needs both mature coins; the coinbase is still immature
        assert_eq!(tx.inputs.len(), 2);
        assert_eq!(tx.outputs[0].amount, 45);
        assert_eq!(tx.outputs[1].amount, 5);
        assert_eq!(tx.outputs[1].script_pubkey, MINE);
        assert!(tx.inputs.iter().all(|i| i.script_sig == MINE));

        assert!(matches!(
            wallet.create_transaction(&view, 10, THEIRS.to_vec(), 51, MINE.to_vec()),
            Err(WalletError::InsufficientFunds { have: 50, need: 51 })
        ));
        assert!(matches!(
            wallet.create_transaction(&view, 10, THEIRS.to_vec(), 0, MINE.to_vec()),
            Err(WalletError::InvalidAmount(0))
        ));
    }

    #[test]
    fn test_wallet_save_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("wallet.json");

        let mut wallet1 = wallet();
        wallet1.track(OutPoint::new(double_sha256(b"x"), 3));
        wallet1.save(&path).unwrap();

        let wallet2 = Wallet::load(&path).unwrap();
        assert_eq!(wallet1.label, wallet2.label);
        assert!(wallet2.is_mine(MINE));
        assert_eq!(
            wallet1.tracked().collect::<Vec<_>>(),
            wallet2.tracked().collect::<Vec<_>>()
        );
    }
}
