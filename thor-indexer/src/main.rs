//! THORChain Indexer
//!
//! Acquires blocks over Tendermint RPC (or from the local archive), records
//! their events and pool depths in Postgres and refreshes the rollups.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use thor_indexer::aggregates::{coalescing, AggregateRefresher};
use thor_indexer::chain::{ArchiveWriter, BlockArchive, BlockFetcher, BlockSource, TendermintClient};
use thor_indexer::config::IndexerConfig;
use thor_indexer::core::{AggregatePort, AssetClassifier, StoragePort};
use thor_indexer::database::{
    new_inserter, reset_insert_strategy, select_strategy, MemoryStore, PostgresManager,
};
use thor_indexer::demux::corrections::CorrectionTable;
use thor_indexer::demux::Demux;
use thor_indexer::metrics::{self, Metrics};
use thor_indexer::record::EventRecorder;
use thor_indexer::sync::{recover, snapshot_channel, BlockIngestor};

#[derive(Parser)]
#[command(name = "thor-indexer")]
#[command(about = "THORChain block indexer")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "indexer.toml")]
    config: String,

    /// Override log level
    #[arg(long)]
    log_level: Option<String>,

    /// Index into an in-memory store instead of Postgres
    #[arg(long)]
    dry_run: bool,

    /// Clear the recorded flush failure and go back to batch inserts
    #[arg(long)]
    reset_insert_strategy: bool,

    /// Drop and recreate the schema when its hash does not match
    #[arg(long)]
    rebuild_schema: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config_missing = !std::path::Path::new(&cli.config).exists();
    let mut config = if config_missing {
        IndexerConfig::default()
    } else {
        IndexerConfig::from_file(&cli.config)?
    };

    // Override log level if provided
    if let Some(log_level) = cli.log_level {
        config.monitoring.log_level = log_level;
    }

    init_logging(&config)?;
    if config_missing {
        warn!("Config file not found, using defaults: {}", cli.config);
    }

    info!("Starting THORChain indexer");
    info!("Chain: {} at {}", config.chain.chain_id, config.chain.rpc_url);

    config.validate_all()?;
    config.ensure_directories()?;

    let metrics = Arc::new(Metrics::new().context("registering metrics")?);

    // Storage
    let (store, aggregates): (Arc<dyn StoragePort>, Arc<dyn AggregatePort>) = if cli.dry_run {
        info!("Dry run mode - indexing into memory, nothing is persisted");
        let memory = Arc::new(MemoryStore::new());
        let store: Arc<dyn StoragePort> = memory.clone();
        let aggregates: Arc<dyn AggregatePort> = memory;
        (store, aggregates)
    } else {
        info!("Connecting to Postgres...");
        let postgres = PostgresManager::new(&config.database).await?;
        postgres.ensure_schema(cli.rebuild_schema).await?;
        postgres.health_check().await?;
        let postgres = Arc::new(postgres);
        let store: Arc<dyn StoragePort> = postgres.clone();
        let aggregates: Arc<dyn AggregatePort> = postgres;
        (store, aggregates)
    };

    if cli.reset_insert_strategy {
        reset_insert_strategy(store.as_ref()).await?;
    }
    let strategy = select_strategy(store.as_ref()).await?;
    let recovered = recover(store.as_ref(), config.chain.start_height).await?;
    let start = recovered.next_height;
    let (snapshots_tx, snapshots_rx) = snapshot_channel(recovered.track.clone());

    // Event pipeline
    let classifier = AssetClassifier::new(config.chain.native_assets.iter().cloned());
    let corrections = CorrectionTable::load(
        &config.corrections,
        &config.chain.chain_id,
        classifier.clone(),
        config.ingestion.genesis_height,
    );
    let demux = Demux::new(
        classifier.clone(),
        corrections,
        config.chain.base64_attributes,
        config.chain.ignored_event_kinds.iter().cloned(),
    );
    let recorder = EventRecorder::new(classifier, config.corrections.withdraw_coin_kept_height);

    let cancel = CancellationToken::new();
    let (refresh_trigger, refresh_rx) = coalescing();
    let refresh_trigger = refresh_trigger.with_counter(metrics.refresh_triggers_dropped.clone());

    let ingestor = BlockIngestor::new(
        demux,
        recorder,
        new_inserter(strategy, store.clone()),
        store.clone(),
        recovered,
        snapshots_tx,
    )
    .with_refresh_trigger(refresh_trigger)
    .with_metrics(metrics.clone())
    .with_genesis_height(config.ingestion.genesis_height);

    // Block acquisition
    let chain = Arc::new(TendermintClient::new(&config.chain)?);
    let mut source = BlockSource::new(chain, config.chain.fetch_batch_size);
    let mut fetcher_writer = None;
    if let Some(path) = &config.archive.path {
        let archive = BlockArchive::open(path)?;
        info!(path = %path.display(), last_height = ?archive.last_height(), "Using block archive");
        source = source.with_archive(path.clone());
        if config.archive.write_through {
            let next = archive.resume_height(config.chain.start_height);
            fetcher_writer = Some(ArchiveWriter::new(path, config.archive.blocks_per_file, next));
        }
    }
    let mut fetcher = BlockFetcher::new(source, &config.chain).with_metrics(metrics.clone());
    if let Some(writer) = fetcher_writer {
        fetcher = fetcher.with_write_through(writer);
    }

    let (blocks_tx, blocks_rx) = mpsc::channel(config.ingestion.block_queue_capacity);
    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(fetcher.run(start, blocks_tx, cancel.clone())));

    let ingest_cancel = cancel.clone();
    let mut ingest_handle = tokio::spawn(async move { ingestor.run(blocks_rx, ingest_cancel).await });

    if config.aggregates.enabled {
        let (caught_up, mut caught_up_rx) = coalescing();
        let refresher = AggregateRefresher::new(
            aggregates,
            config.aggregates.max_refresh_window_nanos(),
            Duration::from_secs(config.aggregates.interval_secs),
        )
        .with_caught_up(caught_up.with_counter(metrics.notifications_dropped.clone()))
        .with_metrics(metrics.clone());
        tasks.push(tokio::spawn(refresher.run(refresh_rx, snapshots_rx, cancel.clone())));

        let notify_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = notify_cancel.cancelled() => break,
                    signal = caught_up_rx.recv() => {
                        if signal.is_none() {
                            break;
                        }
                        debug!("Aggregates caught up");
                    }
                }
            }
        }));
    }

    if config.monitoring.metrics_port > 0 {
        info!("Starting metrics server on port {}", config.monitoring.metrics_port);
        let port = config.monitoring.metrics_port;
        let metrics_cancel = cancel.clone();
        let metrics = metrics.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = metrics::serve(metrics, port, metrics_cancel).await {
                error!("Metrics server error: {}", e);
            }
        }));
    }

    // Wait for shutdown signal or a fatal ingestion error
    info!("Indexer started at height {}. Press Ctrl+C to shutdown.", start);
    let mut exit = Ok(());
    let ingest_done = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal");
            false
        }
        result = &mut ingest_handle => {
            match result {
                Ok(Ok(())) => info!("Ingestion finished"),
                Ok(Err(e)) => {
                    error!("Ingestion failed: {}", e);
                    exit = Err(anyhow::Error::new(e));
                }
                Err(e) => {
                    error!("Ingestion task error: {}", e);
                    exit = Err(e.into());
                }
            }
            true
        }
    };

    info!("Shutting down THORChain indexer");
    cancel.cancel();
    let timeout = Duration::from_secs(config.shutdown.timeout_secs);
    let drain = async {
        if !ingest_done {
            match ingest_handle.await {
                Ok(Err(e)) => error!("Ingestion failed during shutdown: {}", e),
                Err(e) => error!("Ingestion task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        for task in tasks {
            if let Err(e) = task.await {
                error!("Task error during shutdown: {}", e);
            }
        }
    };
    if tokio::time::timeout(timeout, drain).await.is_err() {
        warn!("Shutdown timed out after {:?}", timeout);
    }

    exit
}

fn init_logging(config: &IndexerConfig) -> Result<()> {
    let log_level = config
        .monitoring
        .log_level
        .parse()
        .unwrap_or(tracing::Level::INFO);
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("thor_indexer={},blockstore_dump={}", log_level, log_level).into());

    if config.monitoring.structured_logging {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    Ok(())
}
