//! Recorder daemon.
//!
//! Connects to the exchange feed, records order book events for every
//! subscribed market and drains buffered writes on Ctrl-C.
//!
//! Usage:
//!   RECORDER_API_KEY_ID=... RECORDER_API_SECRET=... \
//!   cargo run --release --bin recorder -- --config recorder.toml

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use dotenv::dotenv;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use orderbook_recorder::feed::{ConnectionManager, Credentials, FeedHandle};
use orderbook_recorder::ingest::{DiscoveryListener, EventProcessor, WriteBuffer};
use orderbook_recorder::models::{now_ms, MarketStatus};
use orderbook_recorder::{MarketRegistry, RecordSource, RecorderConfig, SqliteStore};

#[derive(Parser, Debug)]
#[command(name = "recorder")]
#[command(about = "Record order book snapshots and deltas for binary markets")]
struct Args {
    /// TOML configuration file
    #[arg(long, env = "RECORDER_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database path (overrides config)
    #[arg(long)]
    db: Option<String>,

    /// Feed websocket URL (overrides config)
    #[arg(long)]
    ws_url: Option<String>,

    /// Additional tickers to subscribe at startup
    #[arg(long, value_delimiter = ',')]
    seed: Vec<String>,

    /// Materialize a snapshot per live market every N seconds
    #[arg(long)]
    snapshot_interval_secs: Option<u64>,

    /// Seconds between stats log lines
    #[arg(long, default_value = "60")]
    stats_interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let args = Args::parse();

    let mut config =
        RecorderConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(db) = args.db {
        config.storage.db_path = db;
    }
    if let Some(url) = args.ws_url {
        config.feed.ws_url = url;
    }
    if let Some(secs) = args.snapshot_interval_secs {
        config.snapshots.materialize_interval_secs = Some(secs);
    }
    config.discovery.seed_tickers.extend(args.seed);
    config.validate(true).context("Invalid configuration")?;

    let credentials =
        Credentials::from_config(&config.feed).context("Feed API credentials not configured")?;

    info!(feed = ?config.feed, db = %config.storage.db_path, "Recorder starting");

    let store = Arc::new(
        SqliteStore::open(&config.storage.db_path).context("Failed to open history database")?,
    );
    let known = store
        .load_markets(None)
        .context("Failed to load persisted markets")?;
    let history = store
        .recorded_tails(
            known
                .iter()
                .map(|m| m.ticker.as_str())
                .chain(config.discovery.seed_tickers.iter().map(String::as_str)),
        )
        .context("Failed to read where recorded history ends")?;
    info!(markets = history.len(), "Resuming after recorded history");
    let restored: Vec<_> = known
        .into_iter()
        .filter(|m| m.status == MarketStatus::Active)
        .collect();

    let registry = Arc::new(MarketRegistry::with_history(history));
    let (feed, cmd_rx) = FeedHandle::channel(config.channels.command_capacity);
    let (frame_tx, frame_rx) = mpsc::channel(config.channels.frame_capacity);

    let buffer = WriteBuffer::new(store.clone(), config.write_buffer.clone());
    let buffer_stats = buffer.stats();
    let (records, buffer_task) = buffer.spawn();

    let discovery = DiscoveryListener::new(
        registry.clone(),
        feed.clone(),
        records.clone(),
        config.discovery.clone(),
    );
    let discovery_stats = discovery.stats();
    let restored_count = discovery.bootstrap(restored, now_ms()).await.len();
    info!(markets = restored_count, "Startup subscriptions queued");

    let processor = EventProcessor::new(
        registry.clone(),
        feed,
        records,
        discovery,
        config.snapshots.materialize_interval(),
    );
    let processor_stats = processor.stats();
    let processor_task = tokio::spawn(processor.run(frame_rx));

    let manager = ConnectionManager::new(
        config.feed.clone(),
        &config.backoff,
        credentials,
        registry.clone(),
        frame_tx,
        cmd_rx,
    );
    let connection_stats = manager.stats();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut manager_task = tokio::spawn(manager.run(shutdown_rx));

    let stats_task = {
        let store = store.clone();
        let registry = registry.clone();
        let connection_stats = connection_stats.clone();
        let processor_stats = processor_stats.clone();
        let buffer_stats = buffer_stats.clone();
        let discovery_stats = discovery_stats.clone();
        let period = Duration::from_secs(args.stats_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                info!(
                    markets = registry.len(),
                    subscribed = registry.subscription_count(),
                    connection = %connection_stats.summary(),
                    processor = %processor_stats.summary(),
                    discovery = %discovery_stats.summary(),
                    buffer = %buffer_stats.summary(),
                    storage = %store.stats().summary(),
                    "Recorder stats"
                );
            }
        })
    };

    let finished = tokio::select! {
        res = &mut manager_task => Some(res),
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested; draining");
            None
        }
    };
    let _ = shutdown_tx.send(true);
    let feed_result = match finished {
        Some(res) => res,
        None => manager_task.await,
    };

    // The manager dropped the frame sender; the processor drains what is
    // queued, then its record sender drops and the buffer flushes.
    if let Err(e) = processor_task.await {
        error!(error = %e, "Event processor task failed");
    }
    if let Err(e) = buffer_task.await {
        error!(error = %e, "Write buffer task failed");
    }
    stats_task.abort();

    info!(
        connection = %connection_stats.summary(),
        processor = %processor_stats.summary(),
        buffer = %buffer_stats.summary(),
        storage = %store.stats().summary(),
        "Recorder stopped"
    );

    match feed_result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e).context("Feed connection halted"),
        Err(e) => Err(anyhow!("connection manager task failed: {e}")),
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "orderbook_recorder=info,recorder=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents)
    let _ = dotenv();

    // Also the crate root .env when launched from elsewhere
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
