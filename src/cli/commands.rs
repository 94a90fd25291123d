//! CLI commands for inspecting a coins database
//!
//! Every command opens the database described by a [`ChainStateConfig`],
//! does its work and exits. Nothing is kept between invocations except the
//! database itself.

use crate::config::ChainStateConfig;
use crate::core::{
    Block, ChainState, MatchingScripts, OutPoint, Transaction, COINBASE_MATURITY, COIN,
};
use crate::storage::{
    CoinsStats, CoinsView, CoinsViewCache, CoinsViewDB, FileStore, KeyValueStore,
};
use crate::wallet::Wallet;
use std::path::Path;
use std::sync::Arc;

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Build the effective configuration: file (if any), then command-line overrides
pub fn load_config(
    data_dir: &Path,
    config_file: Option<&Path>,
    max_cache_bytes: Option<usize>,
) -> CliResult<ChainStateConfig> {
    let mut config = match config_file {
        Some(path) => ChainStateConfig::load(path)?,
        None => ChainStateConfig::default(),
    };
    config.storage.data_dir = data_dir.to_path_buf();
    if let Some(max) = max_cache_bytes {
        config.cache.max_cache_bytes = max;
    }
    Ok(config)
}

fn open_store(config: &ChainStateConfig) -> CliResult<Arc<FileStore>> {
    Ok(Arc::new(FileStore::open(config.storage.clone())?))
}

fn print_stats(stats: &CoinsStats) {
    println!("   ├─ Best block: {}", stats.best_block);
    println!("   ├─ Transactions: {}", stats.transaction_count);
    println!("   ├─ Unspent outputs: {}", stats.coin_count);
    println!("   └─ Total amount: {}", format_amount(stats.total_amount));
}

fn format_amount(amount: i128) -> String {
    let coin = i128::from(COIN);
    format!("{}.{:08}", amount / coin, (amount % coin).abs())
}

/// Create an empty coins database
pub fn cmd_init(config: &ChainStateConfig) -> CliResult<()> {
    let store = open_store(config)?;
    if store.path().exists() {
        println!("⚠️  Coins database already exists at {:?}", store.path());
        return Ok(());
    }

    let mut db = CoinsViewDB::new(store.clone());
    let mut cache = CoinsViewCache::new(&mut db);
    cache.flush()?;

    println!("✅ Coins database initialized!");
    println!("   📁 File: {:?}", store.path());
    Ok(())
}

/// Print set statistics and storage details
pub fn cmd_info(config: &ChainStateConfig) -> CliResult<()> {
    let store = open_store(config)?;
    let db = CoinsViewDB::new(store.clone());
    let stats = CoinsStats::compute(&db)?;
    let storage = store.stats()?;

    println!("🪙 UTXO Set");
    print_stats(&stats);
    println!("\n💾 Storage");
    println!("   ├─ Directory: {:?}", storage.data_dir);
    println!("   ├─ Records: {}", storage.record_count);
    println!("   ├─ File size: {} bytes", storage.file_size);
    println!("   ├─ Stored bytes: {}", store.size_estimate());
    println!("   └─ Backups: {}", storage.backup_count);
    Ok(())
}

/// Look up a single outpoint given as `txid:index`
pub fn cmd_get(config: &ChainStateConfig, outpoint: &str) -> CliResult<()> {
    let outpoint: OutPoint = outpoint.parse()?;
    let db = CoinsViewDB::new(open_store(config)?);

    match db.get_coin(&outpoint)? {
        Some(coin) => {
            println!("🪙 {}", outpoint);
            println!("   ├─ Amount: {}", format_amount(i128::from(coin.amount)));
            println!("   ├─ Height: {}", coin.height);
            println!("   ├─ Coinbase: {}", coin.is_coinbase);
            println!("   └─ Script: {}", hex::encode(&coin.script));
        }
        None => println!("❌ {} is not in the unspent set", outpoint),
    }
    Ok(())
}

/// List coins in key order
pub fn cmd_dump(config: &ChainStateConfig, limit: usize) -> CliResult<()> {
    let db = CoinsViewDB::new(open_store(config)?);

    println!("📋 Unspent outputs:");
    let mut shown = 0;
    for item in db.cursor()? {
        let (outpoint, coin) = item?;
        if shown == limit {
            println!("   ... (limit {} reached)", limit);
            break;
        }
        println!(
            "   {} | {} | height {}{}",
            outpoint,
            format_amount(i128::from(coin.amount)),
            coin.height,
            if coin.is_coinbase { " | coinbase" } else { "" }
        );
        shown += 1;
    }
    if shown == 0 {
        println!("   (empty)");
    }
    Ok(())
}

/// Connect a short synthetic chain, spend from it, and reorganize one block
pub fn cmd_demo(config: &ChainStateConfig, blocks: u32) -> CliResult<()> {
    let state = ChainState::open(config)?;
    if !state.best_block()?.is_zero() {
        println!(
            "⚠️  {:?} already holds a chain; run the demo on an empty data directory",
            config.storage.data_dir
        );
        return Ok(());
    }

    let script = b"demo-wallet".to_vec();
    let mut wallet = Wallet::with_label("demo");
    wallet.add_script(script.clone());

    let blocks = blocks.max(COINBASE_MATURITY + 1);
    println!("⛏️  Connecting {} coinbase blocks...", blocks);
    for height in 0..blocks {
        let block = Block::new(
            state.best_block()?,
            vec![Transaction::coinbase(script.clone(), 50 * COIN, height)],
            height,
        );
        state.connect_block(&block, height, &MatchingScripts)?;
        wallet.scan_block(&block);
    }

    let height = blocks;
    let spend = state.with_view(|view| {
        wallet.create_transaction(view, height, b"recipient".to_vec(), 30 * COIN, script.clone())
    })?;
    let block = Block::new(
        state.best_block()?,
        vec![
            Transaction::coinbase(script.clone(), 50 * COIN, height),
            spend.clone(),
        ],
        height,
    );

    let undo = state.connect_block(&block, height, &MatchingScripts)?;
    wallet.scan_block(&block);
    println!("\n📤 Block {} spends {} coin(s)", height, undo.spent_count());
    println!("   └─ Spend tx: {}", spend.txid());

    let balance = state.with_view(|view| wallet.balance(view))?;
    println!("   💰 Wallet balance: {}", format_amount(i128::from(balance)));

    state.disconnect_block(&block, &undo)?;
    let balance = state.with_view(|view| wallet.balance(view))?;
    println!("\n↩️  Disconnected block {}", height);
    println!("   💰 Wallet balance: {}", format_amount(i128::from(balance)));

    state.connect_block(&block, height, &MatchingScripts)?;
    state.flush()?;
    println!("\n✅ Reconnected and flushed to {:?}", config.storage.data_dir);

    let cache = state.cache_stats();
    println!("   ├─ Cache hits: {}", cache.hits);
    println!("   ├─ Cache misses: {}", cache.misses);
    println!("   └─ Hit rate: {:.1}%", cache.hit_rate() * 100.0);

    println!("\n🪙 UTXO Set");
    print_stats(&state.stats()?);
    Ok(())
}
