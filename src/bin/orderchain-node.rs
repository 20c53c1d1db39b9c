#![forbid(unsafe_code)]
//! OrderChain node: replays stored blocks and optionally mines.

use clap::Parser;
use orderchain::config::load_config;
use orderchain::node::Node;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path of the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,
    /// Mine blocks even if the configuration leaves the miner disabled
    #[arg(long)]
    mine: bool,
    /// Stop after mining this many blocks
    #[arg(long)]
    blocks: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mine = cli.mine || config.miner.enabled;
    let node = Arc::new(Node::open(config)?);
    let head = node.head();
    info!(depth = ?head.depth(), pending = head.pool().len(), "node ready");

    if !mine {
        let stats = node.block_stats()?;
        info!(
            blocks = stats.total_count,
            operations = stats.total_op_count,
            deposits = stats.deposits,
            offers = stats.offers,
            transactions = stats.transactions,
            withdrawals = stats.withdrawals,
            "last 24h"
        );
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("shutting down");
        shutdown.cancel();
    });

    let mined = node.run_miner(cancel, cli.blocks).await;
    let head = node.head();
    info!(
        mined,
        depth = ?head.depth(),
        hash = ?head.block().map(|b| b.hash_str()),
        "miner finished"
    );
    Ok(())
}
