//! Core record types for the order-book history recorder.
//!
//! Prices are integer cents on the 1..=99 scale and quantities are integer
//! contract counts. Nothing in book state is ever floating point.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unix timestamp in milliseconds.
pub type TimestampMs = i64;

/// Per-subscription sequence number.
pub type Seq = u64;

/// Lowest valid price level (cents).
pub const MIN_PRICE: i64 = 1;
/// Highest valid price level (cents).
pub const MAX_PRICE: i64 = 99;

/// Current wall-clock time in milliseconds.
#[inline]
pub fn now_ms() -> TimestampMs {
    chrono::Utc::now().timestamp_millis()
}

/// Whether a price lies on the bounded binary-market scale.
#[inline]
pub fn is_valid_price(price: i64) -> bool {
    (MIN_PRICE..=MAX_PRICE).contains(&price)
}

// =============================================================================
// Market
// =============================================================================

/// Lifecycle status of a tracked market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketStatus {
    Active,
    Closed,
    Settled,
}

impl MarketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketStatus::Active => "active",
            MarketStatus::Closed => "closed",
            MarketStatus::Settled => "settled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(MarketStatus::Active),
            "closed" => Some(MarketStatus::Closed),
            "settled" => Some(MarketStatus::Settled),
            _ => None,
        }
    }
}

/// A binary-outcome market known to the recorder. Never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Market {
    pub ticker: String,
    pub status: MarketStatus,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
}

impl Market {
    pub fn new(ticker: impl Into<String>, created_at: TimestampMs) -> Self {
        Self {
            ticker: ticker.into(),
            status: MarketStatus::Active,
            created_at,
            updated_at: created_at,
        }
    }
}

// =============================================================================
// Book records
// =============================================================================

/// One of the two complementary outcomes of a binary market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Yes => "yes",
            Side::No => "no",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "yes" => Some(Side::Yes),
            "no" => Some(Side::No),
            _ => None,
        }
    }
}

/// A single resting price level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: i64,
    pub quantity: i64,
}

impl PriceLevel {
    pub fn new(price: i64, quantity: i64) -> Self {
        Self { price, quantity }
    }
}

/// Full capture of a market's book at one instant. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderbookSnapshot {
    pub ticker: String,
    pub captured_at: TimestampMs,
    /// Sequence number in effect at capture time.
    pub sequence: Seq,
    pub yes: Vec<PriceLevel>,
    pub no: Vec<PriceLevel>,
}

impl OrderbookSnapshot {
    pub fn levels(&self, side: Side) -> &[PriceLevel] {
        match side {
            Side::Yes => &self.yes,
            Side::No => &self.no,
        }
    }
}

/// Incremental signed change to one price level. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderbookDelta {
    pub ticker: String,
    /// Recorder timestamp: the exchange `ts`, raised so that it never sorts
    /// at or before the basis snapshot.
    pub ts: TimestampMs,
    /// Timestamp exactly as received from the exchange.
    pub exchange_ts: TimestampMs,
    pub sequence: Seq,
    pub side: Side,
    pub price: i64,
    pub delta: i64,
}

/// Why continuity was lost for a market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapReason {
    /// A delta arrived with a sequence number ahead of the expected one.
    SequenceSkip,
    /// The connection dropped; anything sent while disconnected is unknown.
    Reconnect,
}

impl GapReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            GapReason::SequenceSkip => "sequence_skip",
            GapReason::Reconnect => "reconnect",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sequence_skip" => Some(GapReason::SequenceSkip),
            "reconnect" => Some(GapReason::Reconnect),
            _ => None,
        }
    }
}

/// Metadata record marking a range where book fidelity is not guaranteed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataGap {
    pub ticker: String,
    pub reason: GapReason,
    /// Timestamp of the last event known to be good.
    pub start_ts: TimestampMs,
    /// Timestamp at which the loss became visible.
    pub end_ts: TimestampMs,
    pub detected_at: TimestampMs,
    /// Sequence number that was expected next.
    pub expected_seq: Seq,
    /// Sequence number actually observed.
    pub observed_seq: Seq,
}

impl DataGap {
    /// First sequence number known to be missing.
    pub fn first_missing(&self) -> Seq {
        self.expected_seq
    }

    /// Last sequence number known to be missing, if the range is non-empty.
    pub fn last_missing(&self) -> Option<Seq> {
        if self.observed_seq > self.expected_seq {
            Some(self.observed_seq - 1)
        } else {
            None
        }
    }

    /// Whether a reconstruction based on a snapshot captured at `basis` and
    /// targeting `target` crosses this gap.
    pub fn affects(&self, basis: TimestampMs, target: TimestampMs) -> bool {
        self.start_ts <= target && self.end_ts > basis
    }
}

/// Where a market's persisted history ends: the largest recorded timestamp
/// and the sequence number seen there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedTail {
    pub ts: TimestampMs,
    pub seq: Seq,
}

/// Point-in-time book built fresh per query. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconstructedOrderbook {
    pub ticker: String,
    pub target_ts: TimestampMs,
    pub basis_snapshot_ts: TimestampMs,
    pub deltas_applied: u64,
    /// Sequence number of the last applied event.
    pub last_sequence: Seq,
    /// Non-contiguous sequence steps seen while replaying.
    pub sequence_breaks: u64,
    /// The requested instant overlaps a recorded gap; accuracy is not guaranteed.
    pub within_recorded_gap: bool,
    pub yes: BTreeMap<i64, i64>,
    pub no: BTreeMap<i64, i64>,
}

impl ReconstructedOrderbook {
    /// Levels for one side, best (highest price) first.
    pub fn levels(&self, side: Side) -> Vec<PriceLevel> {
        let map = match side {
            Side::Yes => &self.yes,
            Side::No => &self.no,
        };
        map.iter()
            .rev()
            .map(|(&price, &quantity)| PriceLevel::new(price, quantity))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gap(start_ts: TimestampMs, end_ts: TimestampMs) -> DataGap {
        DataGap {
            ticker: "MKT".to_string(),
            reason: GapReason::SequenceSkip,
            start_ts,
            end_ts,
            detected_at: end_ts,
            expected_seq: 7,
            observed_seq: 8,
        }
    }

    #[test]
    fn test_gap_missing_range() {
        let g = gap(10, 20);
        assert_eq!(g.first_missing(), 7);
        assert_eq!(g.last_missing(), Some(7));
    }

    #[test]
    fn test_gap_affects_window() {
        let g = gap(10, 20);
        // Basis before the gap, target after it started.
        assert!(g.affects(0, 15));
        assert!(g.affects(0, 100));
        // Target before the gap started.
        assert!(!g.affects(0, 9));
        // Basis re-established after the gap became visible.
        assert!(!g.affects(20, 100));
    }

    #[test]
    fn test_side_serde() {
        assert_eq!(serde_json::to_string(&Side::Yes).unwrap(), "\"yes\"");
        assert_eq!(Side::parse("no"), Some(Side::No));
        assert_eq!(Side::parse("NO"), None);
    }

    #[test]
    fn test_levels_best_first() {
        let mut yes = BTreeMap::new();
        yes.insert(40, 3);
        yes.insert(60, 1);
        let book = ReconstructedOrderbook {
            ticker: "MKT".to_string(),
            target_ts: 0,
            basis_snapshot_ts: 0,
            deltas_applied: 0,
            last_sequence: 0,
            sequence_breaks: 0,
            within_recorded_gap: false,
            yes,
            no: BTreeMap::new(),
        };
        let levels = book.levels(Side::Yes);
        assert_eq!(levels[0], PriceLevel::new(60, 1));
        assert_eq!(levels[1], PriceLevel::new(40, 3));
    }
}
