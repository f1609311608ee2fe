//! Durable storage contract.
//!
//! Writes are append-only and idempotent: replaying an already-persisted
//! batch leaves storage unchanged. Reads serve the reconstruction engine and
//! the operator CLI.

pub mod sqlite;

pub use sqlite::{SqliteStore, StorageStats, TableSummary};

use crate::error::StorageError;
use std::collections::HashMap;

use crate::models::{
    DataGap, Market, MarketStatus, OrderbookDelta, OrderbookSnapshot, RecordedTail, TimestampMs,
};

/// A record headed for durable storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageRecord {
    Snapshot(OrderbookSnapshot),
    Delta(OrderbookDelta),
    Gap(DataGap),
    Market(Market),
}

impl StorageRecord {
    pub fn ticker(&self) -> &str {
        match self {
            StorageRecord::Snapshot(s) => &s.ticker,
            StorageRecord::Delta(d) => &d.ticker,
            StorageRecord::Gap(g) => &g.ticker,
            StorageRecord::Market(m) => &m.ticker,
        }
    }
}

/// Write side of durable storage. Each call is one bulk write; returns the
/// number of rows that were new.
pub trait RecordSink: Send + Sync {
    fn write_snapshots(&self, snapshots: &[OrderbookSnapshot]) -> Result<usize, StorageError>;

    fn write_deltas(&self, deltas: &[OrderbookDelta]) -> Result<usize, StorageError>;

    fn write_gaps(&self, gaps: &[DataGap]) -> Result<usize, StorageError>;

    /// Insert or update markets by ticker. `created_at` is never moved later.
    fn upsert_markets(&self, markets: &[Market]) -> Result<usize, StorageError>;

    fn write_snapshot(&self, snapshot: &OrderbookSnapshot) -> Result<usize, StorageError> {
        self.write_snapshots(std::slice::from_ref(snapshot))
    }

    fn write_gap(&self, gap: &DataGap) -> Result<usize, StorageError> {
        self.write_gaps(std::slice::from_ref(gap))
    }
}

/// Read side of durable storage.
pub trait RecordSource: Send + Sync {
    /// Most recent snapshot with `captured_at <= target`.
    fn latest_snapshot_at_or_before(
        &self,
        ticker: &str,
        target: TimestampMs,
    ) -> Result<Option<OrderbookSnapshot>, StorageError>;

    /// Deltas with `after < ts <= until`, ordered by sequence number.
    fn deltas_in_range(
        &self,
        ticker: &str,
        after: TimestampMs,
        until: TimestampMs,
    ) -> Result<Vec<OrderbookDelta>, StorageError>;

    /// Gaps with `start_ts <= until` and `end_ts > after`.
    fn gaps_overlapping(
        &self,
        ticker: &str,
        after: TimestampMs,
        until: TimestampMs,
    ) -> Result<Vec<DataGap>, StorageError>;

    /// Every gap recorded for a market, oldest first.
    fn gaps_for(&self, ticker: &str) -> Result<Vec<DataGap>, StorageError> {
        self.gaps_overlapping(ticker, TimestampMs::MIN, TimestampMs::MAX)
    }

    /// Persisted markets, optionally filtered by status.
    fn load_markets(&self, status: Option<MarketStatus>) -> Result<Vec<Market>, StorageError>;

    /// Latest snapshot, delta or gap end recorded for a market.
    fn last_recorded(&self, ticker: &str) -> Result<Option<RecordedTail>, StorageError>;

    /// [`RecordSource::last_recorded`] for each ticker that has history.
    fn recorded_tails<'a, I>(&self, tickers: I) -> Result<HashMap<String, RecordedTail>, StorageError>
    where
        I: IntoIterator<Item = &'a str>,
        Self: Sized,
    {
        let mut tails = HashMap::new();
        for ticker in tickers {
            if let Some(tail) = self.last_recorded(ticker)? {
                tails.insert(ticker.to_string(), tail);
            }
        }
        Ok(tails)
    }
}
