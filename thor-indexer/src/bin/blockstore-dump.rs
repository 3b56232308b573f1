//! Populates or resumes the local block archive from Tendermint RPC,
//! independently of live ingestion.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use thor_indexer::chain::{ArchiveWriter, Backoff, BlockArchive, BlockSource, TendermintClient};
use thor_indexer::config::IndexerConfig;
use thor_indexer::core::FetchError;

#[derive(Parser)]
#[command(name = "blockstore-dump")]
#[command(about = "Fill the local block archive from RPC")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "indexer.toml")]
    config: String,

    /// Archive directory, overrides archive.path
    #[arg(long)]
    path: Option<PathBuf>,

    /// Stop after this height instead of following the chain head
    #[arg(long)]
    to_height: Option<i64>,

    /// Override log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = cli.log_level.parse().unwrap_or(tracing::Level::INFO);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("blockstore_dump={},thor_indexer={}", log_level, log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = if std::path::Path::new(&cli.config).exists() {
        IndexerConfig::from_file(&cli.config)?
    } else {
        warn!("Config file not found, using defaults: {}", cli.config);
        IndexerConfig::default()
    };
    let path = cli
        .path
        .or_else(|| config.archive.path.clone())
        .ok_or_else(|| anyhow!("no archive path: set archive.path or pass --path"))?;

    let archive = BlockArchive::open(&path)?;
    let start = archive.resume_height(config.chain.start_height);
    info!(path = %path.display(), start, to = ?cli.to_height, "Dumping blocks");

    let chain = Arc::new(TendermintClient::new(&config.chain)?);
    let source = BlockSource::new(chain, config.chain.fetch_batch_size);
    let mut writer = ArchiveWriter::new(&path, config.archive.blocks_per_file, start);
    let mut backoff = Backoff::new(
        Duration::from_millis(config.chain.backoff_initial_ms),
        Duration::from_millis(config.chain.backoff_max_ms),
    );

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            signal_cancel.cancel();
        }
    });

    'cycle: while !cancel.is_cancelled() {
        let mut iter = source.iterator(writer.next_height(), cli.to_height)?;
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break 'cycle,
                result = iter.next() => result,
            };
            match result {
                Ok(block) => {
                    writer.append(&block)?;
                    backoff.reset();
                    if block.height % 10_000 == 0 {
                        info!(height = block.height, "Progress");
                    }
                }
                Err(FetchError::NoData) => {
                    if cli.to_height.map_or(false, |to| writer.next_height() > to) {
                        break 'cycle;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break 'cycle,
                        _ = tokio::time::sleep(config.chain.poll_interval()) => {}
                    }
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(height = writer.next_height(), error = %e, "Fetch failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => break 'cycle,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue 'cycle;
                }
            }
        }
    }

    if writer.pending() > 0 {
        info!(
            pending = writer.pending(),
            "Leaving the incomplete batch behind; it is discarded on the next run"
        );
    }
    info!(next_height = writer.next_height(), "Dump stopped");
    Ok(())
}
