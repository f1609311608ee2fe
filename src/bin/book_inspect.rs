//! Operator CLI for recorded order book history.
//!
//! Usage:
//!   cargo run --release --bin book_inspect -- status
//!   cargo run --release --bin book_inspect -- gaps KXBTC-25JAN01
//!   cargo run --release --bin book_inspect -- reconstruct KXBTC-25JAN01 2025-01-01T12:00:00Z --depth 5

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use orderbook_recorder::models::{MarketStatus, Side, TimestampMs};
use orderbook_recorder::{reconstruct_with_timeout, RecordSource, RecorderConfig, SqliteStore};

#[derive(Parser, Debug)]
#[command(name = "book_inspect")]
#[command(about = "Inspect recorded order book history")]
struct Args {
    /// TOML configuration file
    #[arg(long, env = "RECORDER_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database path (overrides config)
    #[arg(long)]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Row counts and time coverage per table
    Status,

    /// List known markets
    Markets {
        /// Only markets with this status (active, closed, settled)
        #[arg(long)]
        status: Option<String>,
    },

    /// List recorded data gaps for a market
    Gaps { ticker: String },

    /// Rebuild a market's book at a point in time and print it as JSON
    Reconstruct {
        ticker: String,

        /// Epoch milliseconds or RFC 3339 timestamp
        at: String,

        /// Levels per side to keep
        #[arg(long)]
        depth: Option<usize>,

        /// Query timeout (defaults to the configured value)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "book_inspect=info,orderbook_recorder=warn".into()),
        )
        .init();

    let args = Args::parse();
    let mut config =
        RecorderConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(db) = args.db {
        config.storage.db_path = db;
    }
    config.validate(false).context("Invalid configuration")?;

    let store = Arc::new(
        SqliteStore::open_read_only(&config.storage.db_path)
            .with_context(|| format!("Failed to open {}", config.storage.db_path))?,
    );

    match args.command {
        Commands::Status => print_status(&store)?,
        Commands::Markets { status } => print_markets(&store, status.as_deref())?,
        Commands::Gaps { ticker } => print_gaps(&store, &ticker)?,
        Commands::Reconstruct {
            ticker,
            at,
            depth,
            timeout_ms,
        } => {
            let target_ts = parse_timestamp(&at)?;
            let timeout = Duration::from_millis(timeout_ms.unwrap_or(config.query.timeout_ms));
            let book = reconstruct_with_timeout(store, &ticker, target_ts, depth, timeout).await?;

            let view = serde_json::json!({
                "ticker": book.ticker,
                "target_ts": book.target_ts,
                "basis_snapshot_ts": book.basis_snapshot_ts,
                "deltas_applied": book.deltas_applied,
                "last_sequence": book.last_sequence,
                "sequence_breaks": book.sequence_breaks,
                "within_recorded_gap": book.within_recorded_gap,
                "yes": book.levels(Side::Yes),
                "no": book.levels(Side::No),
            });
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
    }

    Ok(())
}

fn print_status(store: &SqliteStore) -> Result<()> {
    println!("{:<22} {:>12} {:>8}  {:<24} {:<24}", "table", "rows", "markets", "first", "last");
    for summary in store.table_summaries()? {
        println!(
            "{:<22} {:>12} {:>8}  {:<24} {:<24}",
            summary.table,
            summary.rows,
            summary.tickers,
            format_ts(summary.first_ts),
            format_ts(summary.last_ts),
        );
    }

    let markets = store.load_markets(None)?;
    let active = markets.iter().filter(|m| m.status == MarketStatus::Active).count();
    println!();
    println!("markets: {} known, {} active", markets.len(), active);
    Ok(())
}

fn print_markets(store: &SqliteStore, status: Option<&str>) -> Result<()> {
    let status = match status {
        Some(s) => match MarketStatus::parse(s) {
            Some(status) => Some(status),
            None => bail!("unknown market status {s:?}"),
        },
        None => None,
    };
    for market in store.load_markets(status)? {
        println!(
            "{:<32} {:<8} created {}  updated {}",
            market.ticker,
            market.status.as_str(),
            format_ts(Some(market.created_at)),
            format_ts(Some(market.updated_at)),
        );
    }
    Ok(())
}

fn print_gaps(store: &SqliteStore, ticker: &str) -> Result<()> {
    let gaps = store.gaps_for(ticker)?;
    if gaps.is_empty() {
        println!("no recorded gaps for {ticker}");
        return Ok(());
    }
    for gap in gaps {
        let missing = match gap.last_missing() {
            Some(last) => format!("seq {}..={}", gap.first_missing(), last),
            None => format!("from seq {}", gap.first_missing()),
        };
        println!(
            "{:<14} {} -> {}  {}",
            gap.reason.as_str(),
            format_ts(Some(gap.start_ts)),
            format_ts(Some(gap.end_ts)),
            missing,
        );
    }
    Ok(())
}

fn parse_timestamp(value: &str) -> Result<TimestampMs> {
    if let Ok(ms) = value.parse::<TimestampMs>() {
        return Ok(ms);
    }
    let parsed = DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("expected epoch millis or RFC 3339, got {value:?}"))?;
    Ok(parsed.timestamp_millis())
}

fn format_ts(ts: Option<TimestampMs>) -> String {
    match ts.and_then(|ms| Utc.timestamp_millis_opt(ms).single()) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        None => "-".to_string(),
    }
}
