pub mod block;
pub mod config;
pub mod consensus;
pub mod context;
pub mod error;
pub mod ledger;
pub mod miner;
pub mod network;
pub mod shutdown;
pub mod state;
pub mod tables;
pub mod types;

use clap::Parser;
use config::Config;
use consensus::TdposEngine;
use context::{ChainContext, EngineOptions, NodeKeypair};
use ledger::SledLedger;
use miner::Miner;
use network::NullNetwork;
use state::UtxoState;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "dposd")]
#[command(about = "Delegated-proof-of-stake chain node daemon", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[arg(short, long)]
    verbose: bool,

    /// Write the default config to the config path and exit
    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Ok(name) = hostname::get() {
        if let Ok(name) = name.into_string() {
            let short = name.split('.').next().unwrap_or(&name);
            eprintln!("node: {short}");
        }
    }

    if args.generate_config {
        let config = Config::default();
        match config.save_to_file(&args.config) {
            Ok(_) => {
                println!("✓ Generated default config at {}", args.config);
                return;
            }
            Err(e) => {
                eprintln!("❌ Failed to generate config: {e}");
                std::process::exit(1);
            }
        }
    }

    let config = match Config::load_or_create(&args.config) {
        Ok(config) => {
            println!("✓ Loaded configuration from {}", args.config);
            config
        }
        Err(e) => {
            eprintln!("❌ Failed to load config: {e}");
            std::process::exit(1);
        }
    };

    setup_logging(&config.logging, args.verbose);

    let version = env!("CARGO_PKG_VERSION");
    tracing::info!(version, chain = %config.node.chain_name, "dposd starting");

    let data_dir = PathBuf::from(&config.storage.data_dir);
    let keypair = match NodeKeypair::load_or_create(&data_dir.join("node_key")) {
        Ok(keypair) => keypair,
        Err(e) => {
            eprintln!("❌ Failed to initialize node key: {e}");
            std::process::exit(1);
        }
    };
    tracing::info!(address = %keypair.address, "node identity ready");

    let db = match sled::open(data_dir.join("chain")) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("❌ Failed to open chain database: {e}");
            std::process::exit(1);
        }
    };

    let ledger = match SledLedger::open(&db) {
        Ok(ledger) => ledger,
        Err(e) => {
            eprintln!("❌ Failed to open ledger: {e}");
            std::process::exit(1);
        }
    };
    let state = match UtxoState::new(Arc::clone(&ledger), config.miner.max_block_size()) {
        Ok(state) => state,
        Err(e) => {
            eprintln!("❌ Failed to replay state: {e}");
            std::process::exit(1);
        }
    };

    let has_peers = config
        .consensus
        .validators
        .iter()
        .any(|validator| validator != &keypair.address);
    let consensus = Arc::new(TdposEngine::new(
        keypair.address.clone(),
        config.consensus.validators.clone(),
        config.consensus.blocks_per_term,
        has_peers,
    ));

    let ctx = Arc::new(ChainContext {
        chain_name: config.node.chain_name.clone(),
        keypair,
        ledger,
        state,
        consensus,
        network: Arc::new(NullNetwork),
        options: EngineOptions {
            max_block_queue_size: config.miner.max_block_queue_size,
            broadcast_mode: config.miner.broadcast_mode,
        },
    });

    let miner = Miner::new(ctx);
    let loop_handle = tokio::spawn(Arc::clone(&miner).run());

    tracing::info!("mining loop started");
    shutdown::wait_for_shutdown(miner, loop_handle).await;
    tracing::info!("dposd stopped");
}

fn setup_logging(config: &config::LoggingConfig, verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if verbose { "trace" } else { &config.level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match config.format.as_str() {
        "json" => fmt().with_env_filter(filter).json().init(),
        _ => fmt().with_env_filter(filter).init(),
    }
}
