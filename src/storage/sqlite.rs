//! SQLite-backed durable store.
//!
//! One WAL-mode database holds markets, snapshots, deltas and gap records.
//! Uniqueness indexes plus `INSERT OR IGNORE` make every write idempotent, so
//! the write buffer can retry a batch without duplicating rows.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::error::StorageError;
use crate::models::{
    DataGap, GapReason, Market, MarketStatus, OrderbookDelta, OrderbookSnapshot, PriceLevel,
    RecordedTail, Side, TimestampMs,
};
use crate::storage::{RecordSink, RecordSource};

// =============================================================================
// Schema
// =============================================================================

const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -32000;
PRAGMA temp_store = MEMORY;
"#;

// `recorded_at` is local write time in Unix ms, like every other timestamp.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS markets (
    ticker TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS orderbook_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ticker TEXT NOT NULL,
    captured_at INTEGER NOT NULL,
    seq INTEGER NOT NULL,
    yes_count INTEGER NOT NULL,
    no_count INTEGER NOT NULL,
    -- [[price, quantity], ...] best first
    yes_json TEXT NOT NULL,
    no_json TEXT NOT NULL,
    recorded_at INTEGER NOT NULL DEFAULT (CAST((julianday('now') - 2440587.5) * 86400000 AS INTEGER))
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_snapshots_ticker_captured_seq
    ON orderbook_snapshots(ticker, captured_at, seq);

CREATE TABLE IF NOT EXISTS orderbook_deltas (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ticker TEXT NOT NULL,
    ts INTEGER NOT NULL,
    exchange_ts INTEGER NOT NULL,
    seq INTEGER NOT NULL,
    side TEXT NOT NULL,
    price INTEGER NOT NULL,
    delta INTEGER NOT NULL,
    recorded_at INTEGER NOT NULL DEFAULT (CAST((julianday('now') - 2440587.5) * 86400000 AS INTEGER))
);

-- Replay window scans and retry dedupe
CREATE UNIQUE INDEX IF NOT EXISTS idx_deltas_ticker_ts_seq
    ON orderbook_deltas(ticker, ts, seq);

CREATE TABLE IF NOT EXISTS data_gaps (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ticker TEXT NOT NULL,
    reason TEXT NOT NULL,
    start_ts INTEGER NOT NULL,
    end_ts INTEGER NOT NULL,
    detected_at INTEGER NOT NULL,
    expected_seq INTEGER NOT NULL,
    observed_seq INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_gaps_ticker_start_expected_reason
    ON data_gaps(ticker, start_ts, expected_seq, reason);
"#;

// =============================================================================
// Stats
// =============================================================================

#[derive(Debug, Default)]
pub struct StorageStats {
    pub snapshots_written: AtomicU64,
    pub deltas_written: AtomicU64,
    pub gaps_written: AtomicU64,
    pub markets_upserted: AtomicU64,
    /// Rows skipped because they were already persisted.
    pub duplicates_ignored: AtomicU64,
    pub batch_writes: AtomicU64,
}

impl StorageStats {
    pub fn summary(&self) -> String {
        format!(
            "snapshots={}, deltas={}, gaps={}, markets={}, duplicates_ignored={}, batches={}",
            self.snapshots_written.load(Ordering::Relaxed),
            self.deltas_written.load(Ordering::Relaxed),
            self.gaps_written.load(Ordering::Relaxed),
            self.markets_upserted.load(Ordering::Relaxed),
            self.duplicates_ignored.load(Ordering::Relaxed),
            self.batch_writes.load(Ordering::Relaxed),
        )
    }
}

/// Row count and time coverage of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSummary {
    pub table: &'static str,
    pub rows: u64,
    pub tickers: u64,
    pub first_ts: Option<TimestampMs>,
    pub last_ts: Option<TimestampMs>,
}

// =============================================================================
// Store
// =============================================================================

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    stats: StorageStats,
}

impl SqliteStore {
    /// Open or create the database at `db_path`.
    pub fn open(db_path: &str) -> Result<Self, StorageError> {
        let path = Path::new(db_path);

        if let Some(parent) = path.parent() {
            if !parent.exists() && !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(db_path, flags)?;
        conn.execute_batch(PRAGMAS)?;
        conn.execute_batch(SCHEMA)?;

        info!(path = %db_path, "Orderbook history storage opened");
        Ok(Self::from_connection(conn))
    }

    /// Open an existing database without write access (operator tooling).
    pub fn open_read_only(db_path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open_with_flags(db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Ok(Self::from_connection(conn))
    }

    /// Open in-memory storage (for testing).
    pub fn open_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            stats: StorageStats::default(),
        }
    }

    pub fn stats(&self) -> &StorageStats {
        &self.stats
    }

    fn record_batch(&self, counter: &AtomicU64, attempted: usize, written: usize) {
        counter.fetch_add(written as u64, Ordering::Relaxed);
        self.stats
            .duplicates_ignored
            .fetch_add((attempted - written) as u64, Ordering::Relaxed);
        self.stats.batch_writes.fetch_add(1, Ordering::Relaxed);
    }

    // -------------------------------------------------------------------------
    // Operator queries
    // -------------------------------------------------------------------------

    /// Row counts and time coverage for snapshots, deltas and gaps.
    pub fn table_summaries(&self) -> Result<Vec<TableSummary>, StorageError> {
        let tables: [(&'static str, &str); 3] = [
            ("orderbook_snapshots", "captured_at"),
            ("orderbook_deltas", "ts"),
            ("data_gaps", "start_ts"),
        ];
        let conn = self.conn.lock();
        let mut out = Vec::with_capacity(tables.len());
        for (table, ts_col) in tables {
            let sql = format!(
                "SELECT COUNT(*), COUNT(DISTINCT ticker), MIN({ts_col}), MAX({ts_col}) FROM {table}"
            );
            let summary = conn.query_row(&sql, [], |row| {
                Ok(TableSummary {
                    table,
                    rows: row.get::<_, i64>(0)? as u64,
                    tickers: row.get::<_, i64>(1)? as u64,
                    first_ts: row.get(2)?,
                    last_ts: row.get(3)?,
                })
            })?;
            out.push(summary);
        }
        Ok(out)
    }

    pub fn delta_count(&self, ticker: &str) -> Result<u64, StorageError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM orderbook_deltas WHERE ticker = ?1",
            params![ticker],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn snapshot_count(&self, ticker: &str) -> Result<u64, StorageError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM orderbook_snapshots WHERE ticker = ?1",
            params![ticker],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // -------------------------------------------------------------------------
    // Row decoding
    // -------------------------------------------------------------------------

    fn row_to_snapshot(row: &Row<'_>) -> rusqlite::Result<(OrderbookSnapshot, String, String)> {
        Ok((
            OrderbookSnapshot {
                ticker: row.get(0)?,
                captured_at: row.get(1)?,
                sequence: row.get::<_, i64>(2)? as u64,
                yes: Vec::new(),
                no: Vec::new(),
            },
            row.get(3)?,
            row.get(4)?,
        ))
    }

    fn row_to_delta(row: &Row<'_>) -> rusqlite::Result<(OrderbookDelta, String)> {
        Ok((
            OrderbookDelta {
                ticker: row.get(0)?,
                ts: row.get(1)?,
                exchange_ts: row.get(2)?,
                sequence: row.get::<_, i64>(3)? as u64,
                side: Side::Yes,
                price: row.get(5)?,
                delta: row.get(6)?,
            },
            row.get(4)?,
        ))
    }

    fn row_to_gap(row: &Row<'_>) -> rusqlite::Result<(DataGap, String)> {
        Ok((
            DataGap {
                ticker: row.get(0)?,
                reason: GapReason::SequenceSkip,
                start_ts: row.get(2)?,
                end_ts: row.get(3)?,
                detected_at: row.get(4)?,
                expected_seq: row.get::<_, i64>(5)? as u64,
                observed_seq: row.get::<_, i64>(6)? as u64,
            },
            row.get(1)?,
        ))
    }
}

fn encode_levels(levels: &[PriceLevel]) -> Result<String, StorageError> {
    let pairs: Vec<[i64; 2]> = levels.iter().map(|l| [l.price, l.quantity]).collect();
    Ok(serde_json::to_string(&pairs)?)
}

fn decode_levels(json: &str) -> Result<Vec<PriceLevel>, StorageError> {
    let pairs: Vec<[i64; 2]> = serde_json::from_str(json)?;
    Ok(pairs.into_iter().map(|[p, q]| PriceLevel::new(p, q)).collect())
}

fn decode_side(value: &str) -> Result<Side, StorageError> {
    Side::parse(value).ok_or_else(|| StorageError::Decode {
        column: "side",
        value: value.to_string(),
    })
}

fn decode_reason(value: &str) -> Result<GapReason, StorageError> {
    GapReason::parse(value).ok_or_else(|| StorageError::Decode {
        column: "reason",
        value: value.to_string(),
    })
}

fn decode_status(value: &str) -> Result<MarketStatus, StorageError> {
    MarketStatus::parse(value).ok_or_else(|| StorageError::Decode {
        column: "status",
        value: value.to_string(),
    })
}

// =============================================================================
// Contract impls
// =============================================================================

impl RecordSink for SqliteStore {
    fn write_snapshots(&self, snapshots: &[OrderbookSnapshot]) -> Result<usize, StorageError> {
        if snapshots.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut written = 0;
        {
            let mut stmt = tx.prepare_cached(
                r#"
                INSERT OR IGNORE INTO orderbook_snapshots (
                    ticker, captured_at, seq, yes_count, no_count, yes_json, no_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )?;
            for snapshot in snapshots {
                written += stmt.execute(params![
                    snapshot.ticker,
                    snapshot.captured_at,
                    snapshot.sequence as i64,
                    snapshot.yes.len() as i64,
                    snapshot.no.len() as i64,
                    encode_levels(&snapshot.yes)?,
                    encode_levels(&snapshot.no)?,
                ])?;
            }
        }
        tx.commit()?;

        self.record_batch(&self.stats.snapshots_written, snapshots.len(), written);
        Ok(written)
    }

    fn write_deltas(&self, deltas: &[OrderbookDelta]) -> Result<usize, StorageError> {
        if deltas.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut written = 0;
        {
            let mut stmt = tx.prepare_cached(
                r#"
                INSERT OR IGNORE INTO orderbook_deltas (
                    ticker, ts, exchange_ts, seq, side, price, delta
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )?;
            for delta in deltas {
                written += stmt.execute(params![
                    delta.ticker,
                    delta.ts,
                    delta.exchange_ts,
                    delta.sequence as i64,
                    delta.side.as_str(),
                    delta.price,
                    delta.delta,
                ])?;
            }
        }
        tx.commit()?;

        self.record_batch(&self.stats.deltas_written, deltas.len(), written);
        Ok(written)
    }

    fn write_gaps(&self, gaps: &[DataGap]) -> Result<usize, StorageError> {
        if gaps.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut written = 0;
        {
            let mut stmt = tx.prepare_cached(
                r#"
                INSERT OR IGNORE INTO data_gaps (
                    ticker, reason, start_ts, end_ts, detected_at, expected_seq, observed_seq
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )?;
            for gap in gaps {
                written += stmt.execute(params![
                    gap.ticker,
                    gap.reason.as_str(),
                    gap.start_ts,
                    gap.end_ts,
                    gap.detected_at,
                    gap.expected_seq as i64,
                    gap.observed_seq as i64,
                ])?;
            }
        }
        tx.commit()?;

        self.record_batch(&self.stats.gaps_written, gaps.len(), written);
        Ok(written)
    }

    fn upsert_markets(&self, markets: &[Market]) -> Result<usize, StorageError> {
        if markets.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut written = 0;
        {
            let mut stmt = tx.prepare_cached(
                r#"
                INSERT INTO markets (ticker, status, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(ticker) DO UPDATE SET
                    status = excluded.status,
                    created_at = MIN(markets.created_at, excluded.created_at),
                    updated_at = MAX(markets.updated_at, excluded.updated_at)
                "#,
            )?;
            for market in markets {
                written += stmt.execute(params![
                    market.ticker,
                    market.status.as_str(),
                    market.created_at,
                    market.updated_at,
                ])?;
            }
        }
        tx.commit()?;

        self.stats
            .markets_upserted
            .fetch_add(written as u64, Ordering::Relaxed);
        self.stats.batch_writes.fetch_add(1, Ordering::Relaxed);
        Ok(written)
    }
}

impl RecordSource for SqliteStore {
    fn latest_snapshot_at_or_before(
        &self,
        ticker: &str,
        target: TimestampMs,
    ) -> Result<Option<OrderbookSnapshot>, StorageError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                r#"
                SELECT ticker, captured_at, seq, yes_json, no_json
                FROM orderbook_snapshots
                WHERE ticker = ?1 AND captured_at <= ?2
                ORDER BY captured_at DESC, seq DESC
                LIMIT 1
                "#,
                params![ticker, target],
                Self::row_to_snapshot,
            )
            .optional()?;

        match row {
            Some((mut snapshot, yes_json, no_json)) => {
                snapshot.yes = decode_levels(&yes_json)?;
                snapshot.no = decode_levels(&no_json)?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    fn deltas_in_range(
        &self,
        ticker: &str,
        after: TimestampMs,
        until: TimestampMs,
    ) -> Result<Vec<OrderbookDelta>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT ticker, ts, exchange_ts, seq, side, price, delta
            FROM orderbook_deltas
            WHERE ticker = ?1 AND ts > ?2 AND ts <= ?3
            ORDER BY seq ASC, ts ASC
            "#,
        )?;
        let rows = stmt.query_map(params![ticker, after, until], Self::row_to_delta)?;

        let mut deltas = Vec::new();
        for row in rows {
            let (mut delta, side) = row?;
            delta.side = decode_side(&side)?;
            deltas.push(delta);
        }
        Ok(deltas)
    }

    fn gaps_overlapping(
        &self,
        ticker: &str,
        after: TimestampMs,
        until: TimestampMs,
    ) -> Result<Vec<DataGap>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT ticker, reason, start_ts, end_ts, detected_at, expected_seq, observed_seq
            FROM data_gaps
            WHERE ticker = ?1 AND start_ts <= ?3 AND end_ts > ?2
            ORDER BY start_ts ASC, expected_seq ASC
            "#,
        )?;
        let rows = stmt.query_map(params![ticker, after, until], Self::row_to_gap)?;

        let mut gaps = Vec::new();
        for row in rows {
            let (mut gap, reason) = row?;
            gap.reason = decode_reason(&reason)?;
            gaps.push(gap);
        }
        Ok(gaps)
    }

    fn load_markets(&self, status: Option<MarketStatus>) -> Result<Vec<Market>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT ticker, status, created_at, updated_at
            FROM markets
            WHERE ?1 IS NULL OR status = ?1
            ORDER BY ticker ASC
            "#,
        )?;
        let rows = stmt.query_map(params![status.map(|s| s.as_str())], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut markets = Vec::new();
        for row in rows {
            let (ticker, status, created_at, updated_at) = row?;
            markets.push(Market {
                ticker,
                status: decode_status(&status)?,
                created_at,
                updated_at,
            });
        }
        Ok(markets)
    }

    fn last_recorded(&self, ticker: &str) -> Result<Option<RecordedTail>, StorageError> {
        let conn = self.conn.lock();
        let tail = conn
            .query_row(
                r#"
                SELECT ts, seq FROM (
                    SELECT captured_at AS ts, seq FROM orderbook_snapshots WHERE ticker = ?1
                    UNION ALL
                    SELECT ts, seq FROM orderbook_deltas WHERE ticker = ?1
                    UNION ALL
                    SELECT end_ts AS ts, observed_seq AS seq FROM data_gaps WHERE ticker = ?1
                )
                ORDER BY ts DESC, seq DESC
                LIMIT 1
                "#,
                params![ticker],
                |row| {
                    Ok(RecordedTail {
                        ts: row.get(0)?,
                        seq: row.get::<_, i64>(1)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(tail)
    }
}
