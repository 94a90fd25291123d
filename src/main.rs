//! UTXO set inspection CLI
//!
//! A command-line interface over a file-backed coins database.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use utxo_cache::cli;

#[derive(Parser)]
#[command(name = "utxo")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "Inspect and exercise a layered UTXO set cache", long_about = None)]
struct Cli {
    /// Data directory for the coins database
    #[arg(short, long, default_value = ".utxo_data")]
    data_dir: PathBuf,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Flush the tip cache once it holds more than this many bytes
    #[arg(long)]
    max_cache_bytes: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an empty coins database
    Init,

    /// Show set statistics and storage details
    Info,

    /// Look up one output
    Get {
        /// Output reference as <txid>:<index>
        outpoint: String,
    },

    /// List unspent outputs in key order
    Dump {
        /// Maximum number of outputs to print
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Connect a synthetic chain, spend from it and undo a block
    Demo {
        /// Number of coinbase blocks to connect before spending
        #[arg(short, long, default_value = "101")]
        blocks: u32,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = cli::load_config(&cli.data_dir, cli.config.as_deref(), cli.max_cache_bytes)?;

    match cli.command {
        Commands::Init => cli::cmd_init(&config)?,
        Commands::Info => cli::cmd_info(&config)?,
        Commands::Get { outpoint } => cli::cmd_get(&config, &outpoint)?,
        Commands::Dump { limit } => cli::cmd_dump(&config, limit)?,
        Commands::Demo { blocks } => cli::cmd_demo(&config, blocks)?,
    }

    Ok(())
}
