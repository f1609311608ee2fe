//! Market Registry
//!
//! In-memory map of tracked markets and their subscription / sequence state.
//!
//! Each market lives in its own `Mutex`-guarded cell. The outer map is only
//! read-locked long enough to fetch the cell's `Arc`, so updates to one market
//! never contend with updates to another.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::book::Book;
use crate::models::{Market, MarketStatus, RecordedTail, Seq, TimestampMs};

// =============================================================================
// Subscription state
// =============================================================================

/// Per-market continuity state. Mutated by the event processor; the
/// connection manager only resets it when continuity is lost.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionState {
    /// Next sequence number expected. `None` while awaiting a snapshot.
    pub next_sequence: Option<Seq>,
    /// Capture time of the current basis snapshot.
    pub last_snapshot_ts: Option<TimestampMs>,
    /// Exchange subscription id, once acknowledged.
    pub subscription_id: Option<u64>,
    /// Book state is unknown until a fresh snapshot arrives.
    pub stale: bool,
}

/// Outcome of validating a delta's sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    /// Contiguous; apply it.
    Apply,
    /// Sequence numbers `[expected, observed)` were never seen.
    Gap { expected: Seq, observed: Seq },
    /// Already seen (or older); discard.
    Duplicate,
    /// No basis snapshot yet; discard.
    AwaitingSnapshot,
}

impl SubscriptionState {
    /// State for a market that has just been (re)subscribed.
    pub fn awaiting_snapshot() -> Self {
        Self {
            stale: true,
            ..Self::default()
        }
    }

    pub fn check(&self, seq: Seq) -> SequenceCheck {
        match self.next_sequence {
            None => SequenceCheck::AwaitingSnapshot,
            Some(expected) if seq == expected => SequenceCheck::Apply,
            Some(expected) if seq > expected => SequenceCheck::Gap {
                expected,
                observed: seq,
            },
            Some(_) => SequenceCheck::Duplicate,
        }
    }

    /// Forget continuity; deltas are ignored until the next snapshot.
    pub fn invalidate(&mut self) {
        self.next_sequence = None;
        self.stale = true;
    }
}

// =============================================================================
// Market cell
// =============================================================================

/// Everything the recorder tracks for one market.
#[derive(Debug, Clone)]
pub struct MarketCell {
    pub market: Market,
    pub sub: SubscriptionState,
    /// Whether the market should be subscribed on the live connection.
    pub subscribed: bool,
    /// Live book, kept in step with recorded events.
    pub book: Book,
    /// Largest timestamp recorded for this market (snapshot or delta).
    pub last_event_ts: Option<TimestampMs>,
    /// Sequence number of the last applied snapshot or delta.
    pub last_applied_seq: Option<Seq>,
    /// Deltas applied since the last snapshot was emitted.
    pub deltas_since_snapshot: u64,
    /// Set when a connection drop interrupted a valid basis:
    /// `(last good timestamp, sequence that was expected next)`.
    pub pending_reconnect_gap: Option<(TimestampMs, Seq)>,
}

impl MarketCell {
    pub fn new(market: Market) -> Self {
        Self {
            market,
            sub: SubscriptionState::awaiting_snapshot(),
            subscribed: false,
            book: Book::new(),
            last_event_ts: None,
            last_applied_seq: None,
            deltas_since_snapshot: 0,
            pending_reconnect_gap: None,
        }
    }

    /// Cell for a market that already has persisted history from an earlier
    /// run. New events sort after that history, and the first snapshot
    /// records the downtime as a gap.
    pub fn resume(market: Market, tail: RecordedTail) -> Self {
        let mut cell = Self::new(market);
        cell.last_event_ts = Some(tail.ts);
        cell.pending_reconnect_gap = Some((tail.ts, tail.seq.saturating_add(1)));
        cell
    }

    /// Lowest timestamp the next recorded event may carry.
    pub fn next_ts_floor(&self) -> TimestampMs {
        self.last_event_ts.map(|t| t + 1).unwrap_or(TimestampMs::MIN)
    }
}

/// Whether `register` created a new entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Inserted,
    AlreadyKnown,
}

// =============================================================================
// Registry
// =============================================================================

pub type CellRef = Arc<Mutex<MarketCell>>;

/// Concurrent market registry.
#[derive(Default)]
pub struct MarketRegistry {
    cells: RwLock<HashMap<String, CellRef>>,
    /// Outstanding subscribe commands: command id -> tickers.
    pending_commands: Mutex<HashMap<u64, Vec<String>>>,
    /// Connection session. Frames tagged with an older session are stale.
    session: AtomicU64,
    /// Persisted history of markets not yet registered in this run.
    history: Mutex<HashMap<String, RecordedTail>>,
}

impl MarketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry for a restarted recorder. Markets registered later resume
    /// after the given persisted history.
    pub fn with_history(tails: HashMap<String, RecordedTail>) -> Self {
        Self {
            history: Mutex::new(tails),
            ..Self::default()
        }
    }

    fn new_cell(&self, market: Market) -> CellRef {
        let cell = match self.history.lock().remove(&market.ticker) {
            Some(tail) => MarketCell::resume(market, tail),
            None => MarketCell::new(market),
        };
        Arc::new(Mutex::new(cell))
    }

    /// Insert a market if absent. Duplicate registrations are no-ops.
    pub fn register(&self, market: Market) -> RegisterOutcome {
        if self.cells.read().contains_key(&market.ticker) {
            return RegisterOutcome::AlreadyKnown;
        }
        let mut cells = self.cells.write();
        if cells.contains_key(&market.ticker) {
            return RegisterOutcome::AlreadyKnown;
        }
        let ticker = market.ticker.clone();
        let cell = self.new_cell(market);
        cells.insert(ticker, cell);
        RegisterOutcome::Inserted
    }

    pub fn get(&self, ticker: &str) -> Option<CellRef> {
        self.cells.read().get(ticker).cloned()
    }

    /// Fetch a cell, registering an active market first if unknown.
    pub fn get_or_register(&self, ticker: &str, now: TimestampMs) -> CellRef {
        if let Some(cell) = self.get(ticker) {
            return cell;
        }
        self.cells
            .write()
            .entry(ticker.to_string())
            .or_insert_with(|| self.new_cell(Market::new(ticker, now)))
            .clone()
    }

    /// Run `f` against one market's cell while holding only that cell's lock.
    pub fn with_cell<R>(&self, ticker: &str, f: impl FnOnce(&mut MarketCell) -> R) -> Option<R> {
        let cell = self.get(ticker)?;
        let mut guard = cell.lock();
        Some(f(&mut guard))
    }

    pub fn contains(&self, ticker: &str) -> bool {
        self.cells.read().contains_key(ticker)
    }

    pub fn len(&self) -> usize {
        self.cells.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.read().is_empty()
    }

    /// All cells, for sweeps that visit every market. Locks are taken one
    /// at a time by the caller.
    pub fn cells(&self) -> Vec<CellRef> {
        self.cells.read().values().cloned().collect()
    }

    /// Copy of a market's subscription state.
    pub fn subscription(&self, ticker: &str) -> Option<SubscriptionState> {
        self.with_cell(ticker, |cell| cell.sub.clone())
    }

    pub fn status(&self, ticker: &str) -> Option<MarketStatus> {
        self.with_cell(ticker, |cell| cell.market.status)
    }

    pub fn is_stale(&self, ticker: &str) -> Option<bool> {
        self.with_cell(ticker, |cell| cell.sub.stale)
    }

    // -------------------------------------------------------------------------
    // Subscription bookkeeping
    // -------------------------------------------------------------------------

    /// Tickers that should be subscribed on the live connection, sorted.
    pub fn subscribed_tickers(&self) -> Vec<String> {
        let mut tickers: Vec<String> = self
            .cells()
            .into_iter()
            .filter_map(|cell| {
                let guard = cell.lock();
                guard.subscribed.then(|| guard.market.ticker.clone())
            })
            .collect();
        tickers.sort();
        tickers
    }

    pub fn subscription_count(&self) -> usize {
        self.cells()
            .into_iter()
            .filter(|cell| cell.lock().subscribed)
            .count()
    }

    /// Flag a market as subscribed. Returns false if it already was.
    pub fn mark_subscribed(&self, ticker: &str, now: TimestampMs) -> bool {
        let cell = self.get_or_register(ticker, now);
        let mut guard = cell.lock();
        if guard.subscribed {
            return false;
        }
        guard.subscribed = true;
        guard.sub = SubscriptionState::awaiting_snapshot();
        true
    }

    /// Flag a market as unsubscribed. Returns false if it was not subscribed.
    pub fn mark_unsubscribed(&self, ticker: &str) -> bool {
        self.with_cell(ticker, |cell| {
            let was = cell.subscribed;
            cell.subscribed = false;
            cell.sub.invalidate();
            cell.sub.subscription_id = None;
            was
        })
        .unwrap_or(false)
    }

    /// Current connection session id.
    pub fn session_id(&self) -> u64 {
        self.session.load(Ordering::Acquire)
    }

    /// Continuity was lost for every market (connection dropped). Each
    /// subscribed market with a valid basis remembers where it left off so
    /// the gap can be recorded once its next snapshot arrives. Frames from
    /// the old session are rejected from here on.
    pub fn invalidate_all(&self) -> usize {
        self.session.fetch_add(1, Ordering::AcqRel);
        let mut affected = 0;
        for cell in self.cells() {
            let mut guard = cell.lock();
            if !guard.subscribed {
                continue;
            }
            if let (Some(next), Some(last_ts)) = (guard.sub.next_sequence, guard.last_event_ts) {
                if guard.pending_reconnect_gap.is_none() {
                    guard.pending_reconnect_gap = Some((last_ts, next));
                }
                affected += 1;
            }
            guard.sub.invalidate();
            guard.sub.subscription_id = None;
        }
        affected
    }

    /// Forget acknowledgements still outstanding from a previous session.
    pub fn clear_pending_commands(&self) {
        self.pending_commands.lock().clear();
    }

    pub fn note_pending_command(&self, command_id: u64, tickers: Vec<String>) {
        self.pending_commands.lock().insert(command_id, tickers);
    }

    /// Attach the exchange subscription id to the markets named by the
    /// acknowledged command. Returns how many markets were updated.
    pub fn confirm_subscription(&self, command_id: u64, sid: u64) -> usize {
        let Some(tickers) = self.pending_commands.lock().remove(&command_id) else {
            return 0;
        };
        tickers
            .iter()
            .filter_map(|t| self.with_cell(t, |cell| cell.sub.subscription_id = Some(sid)))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_variants() {
        let mut state = SubscriptionState::awaiting_snapshot();
        assert_eq!(state.check(5), SequenceCheck::AwaitingSnapshot);

        state.next_sequence = Some(7);
        state.stale = false;
        assert_eq!(state.check(7), SequenceCheck::Apply);
        assert_eq!(state.check(6), SequenceCheck::Duplicate);
        assert_eq!(
            state.check(9),
            SequenceCheck::Gap {
                expected: 7,
                observed: 9
            }
        );

        state.invalidate();
        assert!(state.stale);
        assert_eq!(state.check(7), SequenceCheck::AwaitingSnapshot);
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = MarketRegistry::new();
        assert_eq!(registry.register(Market::new("A", 1)), RegisterOutcome::Inserted);

        registry.with_cell("A", |cell| cell.market.status = MarketStatus::Closed);
        assert_eq!(registry.register(Market::new("A", 2)), RegisterOutcome::AlreadyKnown);

        // The original entry is untouched
        assert_eq!(registry.status("A"), Some(MarketStatus::Closed));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_subscription_bookkeeping() {
        let registry = MarketRegistry::new();
        assert!(registry.mark_subscribed("B", 1));
        assert!(registry.mark_subscribed("A", 1));
        assert!(!registry.mark_subscribed("A", 2));
        assert_eq!(registry.subscribed_tickers(), vec!["A", "B"]);

        registry.note_pending_command(3, vec!["A".into(), "B".into()]);
        assert_eq!(registry.confirm_subscription(3, 42), 2);
        assert_eq!(registry.subscription("A").unwrap().subscription_id, Some(42));
        assert_eq!(registry.confirm_subscription(3, 42), 0);

        assert!(registry.mark_unsubscribed("B"));
        assert!(!registry.mark_unsubscribed("B"));
        assert_eq!(registry.subscription_count(), 1);
    }

    #[test]
    fn test_invalidate_all_remembers_basis() {
        let registry = MarketRegistry::new();
        registry.mark_subscribed("LIVE", 0);
        registry.mark_subscribed("FRESH", 0);
        registry.with_cell("LIVE", |cell| {
            cell.sub.next_sequence = Some(11);
            cell.sub.stale = false;
            cell.last_event_ts = Some(500);
        });

        let session = registry.session_id();
        assert_eq!(registry.invalidate_all(), 1);
        assert_eq!(registry.session_id(), session + 1);

        registry.with_cell("LIVE", |cell| {
            assert_eq!(cell.pending_reconnect_gap, Some((500, 11)));
            assert!(cell.sub.stale);
            assert_eq!(cell.sub.next_sequence, None);
        });
        registry.with_cell("FRESH", |cell| {
            assert_eq!(cell.pending_reconnect_gap, None);
        });
    }

    #[test]
    fn test_registered_market_resumes_after_history() {
        let mut tails = HashMap::new();
        tails.insert("OLD".to_string(), RecordedTail { ts: 5_000, seq: 901 });
        let registry = MarketRegistry::with_history(tails);

        registry.register(Market::new("NEW", 0));
        registry.mark_subscribed("OLD", 0);

        registry.with_cell("OLD", |cell| {
            assert_eq!(cell.last_event_ts, Some(5_000));
            assert_eq!(cell.next_ts_floor(), 5_001);
            assert_eq!(cell.pending_reconnect_gap, Some((5_000, 902)));
            assert!(cell.sub.stale);
        });
        registry.with_cell("NEW", |cell| {
            assert_eq!(cell.last_event_ts, None);
            assert_eq!(cell.pending_reconnect_gap, None);
        });
    }

    #[test]
    fn test_cells_are_independent() {
        let registry = Arc::new(MarketRegistry::new());
        registry.mark_subscribed("A", 0);
        registry.mark_subscribed("B", 0);

        // Holding one market's lock does not block another market
        let a = registry.get("A").unwrap();
        let _held = a.lock();
        let other = Arc::clone(&registry);
        let handle = std::thread::spawn(move || {
            other.with_cell("B", |cell| {
                cell.sub.next_sequence = Some(1);
            })
        });
        assert!(handle.join().unwrap().is_some());
        assert!(a.try_lock().is_none());
    }
}
