//! Event Processor
//!
//! Classifies inbound frames and enforces per-market sequence continuity.
//!
//! A market moves through three states:
//! - awaiting a snapshot: deltas are discarded
//! - live: each delta must carry exactly the expected sequence number
//! - stale: a gap was seen; a `DataGap` is recorded, the market is
//!   resubscribed and it waits for a fresh snapshot again
//!
//! Book mutations happen under the market's own lock and never across an
//! `.await`; the resulting records are pushed to the write buffer afterwards.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::FrameError;
use crate::feed::messages::{DeltaFrame, ErrorFrame, SnapshotFrame, SubscribedFrame};
use crate::feed::{parse_frame, FeedHandle, FeedMessage, InboundFrame};
use crate::ingest::discovery::DiscoveryListener;
use crate::ingest::write_buffer::RecordSender;
use crate::models::{
    DataGap, GapReason, OrderbookDelta, OrderbookSnapshot, Side, TimestampMs,
};
use crate::registry::{MarketCell, MarketRegistry, SequenceCheck};
use crate::storage::StorageRecord;

// =============================================================================
// Stats
// =============================================================================

#[derive(Debug, Default)]
pub struct ProcessorStats {
    pub frames: AtomicU64,
    pub snapshots: AtomicU64,
    pub deltas_applied: AtomicU64,
    pub duplicates: AtomicU64,
    pub awaiting_snapshot: AtomicU64,
    pub stale_session: AtomicU64,
    pub untracked: AtomicU64,
    pub sequence_gaps: AtomicU64,
    pub reconnect_gaps: AtomicU64,
    pub resubscriptions: AtomicU64,
    pub malformed: AtomicU64,
    pub materialized: AtomicU64,
}

impl ProcessorStats {
    pub fn summary(&self) -> String {
        format!(
            "frames={}, snapshots={}, deltas={}, duplicates={}, awaiting={}, stale_session={}, untracked={}, seq_gaps={}, reconnect_gaps={}, resubscriptions={}, malformed={}, materialized={}",
            self.frames.load(Ordering::Relaxed),
            self.snapshots.load(Ordering::Relaxed),
            self.deltas_applied.load(Ordering::Relaxed),
            self.duplicates.load(Ordering::Relaxed),
            self.awaiting_snapshot.load(Ordering::Relaxed),
            self.stale_session.load(Ordering::Relaxed),
            self.untracked.load(Ordering::Relaxed),
            self.sequence_gaps.load(Ordering::Relaxed),
            self.reconnect_gaps.load(Ordering::Relaxed),
            self.resubscriptions.load(Ordering::Relaxed),
            self.malformed.load(Ordering::Relaxed),
            self.materialized.load(Ordering::Relaxed),
        )
    }
}

// =============================================================================
// Per-market state transitions
// =============================================================================

/// Result of installing a snapshot as a market's new basis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotApplied {
    pub snapshot: OrderbookSnapshot,
    /// Set when the previous basis was cut off by a reconnect.
    pub reconnect_gap: Option<DataGap>,
}

/// Install `frame` as the market's basis. Nothing is modified if the frame
/// carries invalid levels.
pub fn apply_snapshot(
    cell: &mut MarketCell,
    frame: &SnapshotFrame,
    received_at: TimestampMs,
) -> Result<SnapshotApplied, FrameError> {
    let yes = frame.levels(Side::Yes)?;
    let no = frame.levels(Side::No)?;
    let next_sequence = successor(&frame.market_ticker, frame.seq)?;

    // Stored events for one market stay in arrival order even if the local
    // clock steps backwards.
    let captured_at = received_at.max(cell.next_ts_floor());

    let reconnect_gap = cell
        .pending_reconnect_gap
        .take()
        .map(|(start_ts, expected_seq)| DataGap {
            ticker: cell.market.ticker.clone(),
            reason: GapReason::Reconnect,
            start_ts,
            end_ts: captured_at,
            detected_at: received_at,
            expected_seq,
            observed_seq: frame.seq,
        });

    cell.book.reset(&yes, &no);
    cell.sub.next_sequence = Some(next_sequence);
    cell.sub.last_snapshot_ts = Some(captured_at);
    cell.sub.stale = false;
    cell.last_event_ts = Some(captured_at);
    cell.last_applied_seq = Some(frame.seq);
    cell.deltas_since_snapshot = 0;

    Ok(SnapshotApplied {
        snapshot: OrderbookSnapshot {
            ticker: cell.market.ticker.clone(),
            captured_at,
            sequence: frame.seq,
            yes: cell.book.levels(Side::Yes),
            no: cell.book.levels(Side::No),
        },
        reconnect_gap,
    })
}

/// What happened to one delta frame.
#[derive(Debug)]
pub enum DeltaOutcome {
    Applied(OrderbookDelta),
    /// Continuity lost; the market is now stale.
    Gap(DataGap),
    /// The expected delta itself was unusable. Treated as a one-event gap.
    Malformed { gap: DataGap, error: FrameError },
    Duplicate,
    AwaitingSnapshot,
}

pub fn apply_delta(cell: &mut MarketCell, frame: &DeltaFrame, received_at: TimestampMs) -> DeltaOutcome {
    match cell.sub.check(frame.seq) {
        SequenceCheck::Apply => {
            match frame
                .validate()
                .and_then(|()| successor(&frame.market_ticker, frame.seq))
            {
                Ok(next) => DeltaOutcome::Applied(apply_valid_delta(cell, frame, next)),
                Err(error) => DeltaOutcome::Malformed {
                    gap: mark_gap(cell, frame, received_at, frame.seq, frame.seq.saturating_add(1)),
                    error,
                },
            }
        }
        SequenceCheck::Gap { expected, observed } => {
            DeltaOutcome::Gap(mark_gap(cell, frame, received_at, expected, observed))
        }
        SequenceCheck::Duplicate => DeltaOutcome::Duplicate,
        SequenceCheck::AwaitingSnapshot => DeltaOutcome::AwaitingSnapshot,
    }
}

/// Sequence number expected after `seq`.
fn successor(ticker: &str, seq: u64) -> Result<u64, FrameError> {
    seq.checked_add(1).ok_or_else(|| FrameError::SequenceOverflow {
        ticker: ticker.to_string(),
        seq,
    })
}

fn apply_valid_delta(cell: &mut MarketCell, frame: &DeltaFrame, next_sequence: u64) -> OrderbookDelta {
    // Never at or before the basis snapshot, never behind the previous event.
    let floor = cell
        .sub
        .last_snapshot_ts
        .map(|t| t + 1)
        .unwrap_or(TimestampMs::MIN)
        .max(cell.last_event_ts.unwrap_or(TimestampMs::MIN));
    let ts = frame.ts.max(floor);

    cell.book.apply(frame.side, frame.price, frame.delta);
    cell.sub.next_sequence = Some(next_sequence);
    cell.last_event_ts = Some(ts);
    cell.last_applied_seq = Some(frame.seq);
    cell.deltas_since_snapshot += 1;

    OrderbookDelta {
        ticker: cell.market.ticker.clone(),
        ts,
        exchange_ts: frame.ts,
        sequence: frame.seq,
        side: frame.side,
        price: frame.price,
        delta: frame.delta,
    }
}

fn mark_gap(
    cell: &mut MarketCell,
    frame: &DeltaFrame,
    received_at: TimestampMs,
    expected_seq: u64,
    observed_seq: u64,
) -> DataGap {
    let start_ts = cell.last_event_ts.unwrap_or(frame.ts);
    let end_ts = frame.ts.max(start_ts + 1);

    // The gap window counts as recorded: the next basis must come after it.
    cell.last_event_ts = Some(end_ts);
    cell.sub.invalidate();

    DataGap {
        ticker: cell.market.ticker.clone(),
        reason: GapReason::SequenceSkip,
        start_ts,
        end_ts,
        detected_at: received_at,
        expected_seq,
        observed_seq,
    }
}

/// Snapshot of the live book if the market is live and has moved since its
/// last snapshot. Becomes the market's new basis.
pub fn materialize(cell: &mut MarketCell) -> Option<OrderbookSnapshot> {
    if cell.sub.stale || cell.deltas_since_snapshot == 0 {
        return None;
    }
    let captured_at = cell.last_event_ts?;
    let sequence = cell.last_applied_seq?;

    cell.sub.last_snapshot_ts = Some(captured_at);
    cell.deltas_since_snapshot = 0;

    Some(OrderbookSnapshot {
        ticker: cell.market.ticker.clone(),
        captured_at,
        sequence,
        yes: cell.book.levels(Side::Yes),
        no: cell.book.levels(Side::No),
    })
}

// =============================================================================
// Processor task
// =============================================================================

pub struct EventProcessor {
    registry: Arc<MarketRegistry>,
    feed: FeedHandle,
    records: RecordSender,
    discovery: DiscoveryListener,
    materialize_interval: Option<Duration>,
    stats: Arc<ProcessorStats>,
}

impl EventProcessor {
    pub fn new(
        registry: Arc<MarketRegistry>,
        feed: FeedHandle,
        records: RecordSender,
        discovery: DiscoveryListener,
        materialize_interval: Option<Duration>,
    ) -> Self {
        Self {
            registry,
            feed,
            records,
            discovery,
            materialize_interval,
            stats: Arc::new(ProcessorStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ProcessorStats> {
        Arc::clone(&self.stats)
    }

    /// Consume frames until the connection manager drops its sender.
    pub async fn run(self, mut frames: mpsc::Receiver<InboundFrame>) {
        let mut materialize_timer = self.materialize_interval.map(|period| {
            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer
        });

        loop {
            tokio::select! {
                frame = frames.recv() => {
                    let Some(frame) = frame else { break };
                    self.handle_frame(frame).await;
                }
                _ = tick(&mut materialize_timer) => {
                    self.materialize_all().await;
                }
            }
        }

        info!(stats = %self.stats.summary(), "Event processor stopped");
    }

    pub async fn handle_frame(&self, frame: InboundFrame) {
        self.stats.frames.fetch_add(1, Ordering::Relaxed);

        if frame.session != self.registry.session_id() {
            // Queued before a reconnect; the market state it belongs to is gone.
            self.stats.stale_session.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let message = match parse_frame(&frame.text) {
            Ok(m) => m,
            Err(e) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Dropping unparseable frame");
                return;
            }
        };

        match message {
            FeedMessage::OrderbookSnapshot(snapshot) => {
                self.on_snapshot(&snapshot, frame.received_at).await
            }
            FeedMessage::OrderbookDelta(delta) => self.on_delta(&delta, frame.received_at).await,
            FeedMessage::MarketLifecycle(lifecycle) => {
                self.discovery.on_lifecycle(&lifecycle).await;
            }
            FeedMessage::Subscribed(ack) => self.on_subscribed(&ack),
            FeedMessage::Error(err) => self.on_error(&err),
            FeedMessage::Heartbeat => {}
            FeedMessage::Unknown => debug!("Ignoring unrecognized frame type"),
        }
    }

    async fn on_snapshot(&self, frame: &SnapshotFrame, received_at: TimestampMs) {
        let cell = self.registry.get_or_register(&frame.market_ticker, received_at);
        let applied = {
            let mut guard = cell.lock();
            apply_snapshot(&mut guard, frame, received_at)
        };

        let applied = match applied {
            Ok(applied) => applied,
            Err(e) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(ticker = %frame.market_ticker, error = %e, "Invalid snapshot; requesting another");
                self.resubscribe(frame.market_ticker.clone()).await;
                return;
            }
        };

        self.stats.snapshots.fetch_add(1, Ordering::Relaxed);
        if let Some(gap) = applied.reconnect_gap {
            self.stats.reconnect_gaps.fetch_add(1, Ordering::Relaxed);
            info!(
                ticker = %gap.ticker,
                start_ts = gap.start_ts,
                end_ts = gap.end_ts,
                "Recorded reconnect gap"
            );
            self.records.send(StorageRecord::Gap(gap)).await;
        }
        debug!(
            ticker = %frame.market_ticker,
            seq = frame.seq,
            captured_at = applied.snapshot.captured_at,
            "Snapshot established basis"
        );
        self.records.send(StorageRecord::Snapshot(applied.snapshot)).await;
    }

    async fn on_delta(&self, frame: &DeltaFrame, received_at: TimestampMs) {
        let Some(cell) = self.registry.get(&frame.market_ticker) else {
            self.stats.untracked.fetch_add(1, Ordering::Relaxed);
            debug!(ticker = %frame.market_ticker, "Delta for untracked market");
            return;
        };
        let outcome = {
            let mut guard = cell.lock();
            apply_delta(&mut guard, frame, received_at)
        };

        match outcome {
            DeltaOutcome::Applied(delta) => {
                self.stats.deltas_applied.fetch_add(1, Ordering::Relaxed);
                self.records.send(StorageRecord::Delta(delta)).await;
            }
            DeltaOutcome::Gap(gap) => {
                warn!(
                    ticker = %gap.ticker,
                    expected = gap.expected_seq,
                    observed = gap.observed_seq,
                    "Sequence gap; resubscribing"
                );
                self.record_gap(gap).await;
            }
            DeltaOutcome::Malformed { gap, error } => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(ticker = %gap.ticker, seq = frame.seq, error = %error, "Unusable delta; resubscribing");
                self.record_gap(gap).await;
            }
            DeltaOutcome::Duplicate => {
                self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                debug!(ticker = %frame.market_ticker, seq = frame.seq, "Discarding duplicate delta");
            }
            DeltaOutcome::AwaitingSnapshot => {
                self.stats.awaiting_snapshot.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn record_gap(&self, gap: DataGap) {
        self.stats.sequence_gaps.fetch_add(1, Ordering::Relaxed);
        let ticker = gap.ticker.clone();
        self.records.send(StorageRecord::Gap(gap)).await;
        self.resubscribe(ticker).await;
    }

    async fn resubscribe(&self, ticker: String) {
        if self.feed.resubscribe(ticker).await {
            self.stats.resubscriptions.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn on_subscribed(&self, ack: &SubscribedFrame) {
        let confirmed = self.registry.confirm_subscription(ack.id, ack.sid);
        debug!(id = ack.id, sid = ack.sid, markets = confirmed, "Subscription acknowledged");
    }

    fn on_error(&self, err: &ErrorFrame) {
        warn!(id = ?err.id, code = ?err.code, msg = %err.msg, "Feed reported an error");
    }

    async fn materialize_all(&self) {
        let snapshots: Vec<OrderbookSnapshot> = self
            .registry
            .cells()
            .into_iter()
            .filter_map(|cell| materialize(&mut cell.lock()))
            .collect();

        if snapshots.is_empty() {
            return;
        }
        self.stats
            .materialized
            .fetch_add(snapshots.len() as u64, Ordering::Relaxed);
        debug!(markets = snapshots.len(), "Materialized snapshots");
        for snapshot in snapshots {
            self.records.send(StorageRecord::Snapshot(snapshot)).await;
        }
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Market;

    fn live_cell() -> MarketCell {
        let mut cell = MarketCell::new(Market::new("MKT", 0));
        let snapshot = SnapshotFrame {
            market_ticker: "MKT".into(),
            seq: 4,
            yes: vec![[60, 10]],
            no: vec![[35, 3]],
        };
        apply_snapshot(&mut cell, &snapshot, 1_000).unwrap();
        cell
    }

    fn delta(seq: u64, ts: TimestampMs, price: i64, delta: i64) -> DeltaFrame {
        DeltaFrame {
            market_ticker: "MKT".into(),
            seq,
            ts,
            side: Side::Yes,
            price,
            delta,
        }
    }

    #[test]
    fn test_snapshot_sets_basis() {
        let cell = live_cell();
        assert_eq!(cell.sub.next_sequence, Some(5));
        assert_eq!(cell.sub.last_snapshot_ts, Some(1_000));
        assert!(!cell.sub.stale);
        assert_eq!(cell.book.quantity(Side::Yes, 60), 10);
    }

    #[test]
    fn test_contiguous_deltas_apply() {
        let mut cell = live_cell();
        for (seq, ts) in [(5, 1_001), (6, 1_002)] {
            assert!(matches!(
                apply_delta(&mut cell, &delta(seq, ts, 60, -1), ts),
                DeltaOutcome::Applied(_)
            ));
        }
        assert_eq!(cell.book.quantity(Side::Yes, 60), 8);
        assert_eq!(cell.sub.next_sequence, Some(7));
        assert_eq!(cell.deltas_since_snapshot, 2);
    }

    #[test]
    fn test_gap_marks_stale_and_discards_followers() {
        let mut cell = live_cell();
        apply_delta(&mut cell, &delta(5, 1_001, 60, 1), 1_001);
        apply_delta(&mut cell, &delta(6, 1_002, 60, 1), 1_002);

        let DeltaOutcome::Gap(gap) = apply_delta(&mut cell, &delta(8, 1_004, 60, 1), 1_004) else {
            panic!("expected gap");
        };
        assert_eq!(gap.expected_seq, 7);
        assert_eq!(gap.last_missing(), Some(7));
        assert_eq!(gap.start_ts, 1_002);
        assert_eq!(gap.end_ts, 1_004);
        assert!(cell.sub.stale);

        assert!(matches!(
            apply_delta(&mut cell, &delta(9, 1_005, 60, 1), 1_005),
            DeltaOutcome::AwaitingSnapshot
        ));
        // Book untouched by 8 and 9
        assert_eq!(cell.book.quantity(Side::Yes, 60), 12);
    }

    #[test]
    fn test_duplicate_discarded() {
        let mut cell = live_cell();
        apply_delta(&mut cell, &delta(5, 1_001, 60, 1), 1_001);
        assert!(matches!(
            apply_delta(&mut cell, &delta(5, 1_001, 60, 1), 1_001),
            DeltaOutcome::Duplicate
        ));
        assert!(matches!(
            apply_delta(&mut cell, &delta(3, 1_001, 60, 1), 1_001),
            DeltaOutcome::Duplicate
        ));
        assert_eq!(cell.book.quantity(Side::Yes, 60), 11);
    }

    #[test]
    fn test_malformed_expected_delta_is_a_gap() {
        let mut cell = live_cell();
        let DeltaOutcome::Malformed { gap, error } =
            apply_delta(&mut cell, &delta(5, 1_001, 150, 1), 1_001)
        else {
            panic!("expected malformed");
        };
        assert!(matches!(error, FrameError::PriceOutOfRange { price: 150, .. }));
        assert_eq!(gap.expected_seq, 5);
        assert_eq!(gap.observed_seq, 6);
        assert!(cell.sub.stale);
    }

    #[test]
    fn test_last_possible_sequence_is_malformed() {
        let mut cell = live_cell();
        cell.sub.next_sequence = Some(u64::MAX);
        let DeltaOutcome::Malformed { gap, error } =
            apply_delta(&mut cell, &delta(u64::MAX, 1_001, 60, 1), 1_001)
        else {
            panic!("expected malformed");
        };
        assert!(matches!(error, FrameError::SequenceOverflow { seq: u64::MAX, .. }));
        assert_eq!((gap.expected_seq, gap.observed_seq), (u64::MAX, u64::MAX));
        assert!(cell.sub.stale);
        assert_eq!(cell.book.quantity(Side::Yes, 60), 10);

        let snapshot = SnapshotFrame {
            market_ticker: "MKT".into(),
            seq: u64::MAX,
            yes: vec![[61, 1]],
            no: vec![],
        };
        assert!(matches!(
            apply_snapshot(&mut cell, &snapshot, 2_000),
            Err(FrameError::SequenceOverflow { .. })
        ));
        assert_eq!(cell.sub.next_sequence, None);
        assert_eq!(cell.book.quantity(Side::Yes, 61), 0);
    }

    #[test]
    fn test_delta_ts_never_precedes_basis() {
        let mut cell = live_cell();
        // Exchange clock behind the local receipt time of the snapshot
        let DeltaOutcome::Applied(d) = apply_delta(&mut cell, &delta(5, 900, 60, 1), 1_001) else {
            panic!("expected applied");
        };
        assert_eq!(d.ts, 1_001);
        assert_eq!(d.exchange_ts, 900);

        let DeltaOutcome::Applied(d) = apply_delta(&mut cell, &delta(6, 950, 60, 1), 1_002) else {
            panic!("expected applied");
        };
        assert_eq!(d.ts, 1_001);
    }

    #[test]
    fn test_reconnect_gap_emitted_with_next_snapshot() {
        let mut cell = live_cell();
        apply_delta(&mut cell, &delta(5, 1_001, 60, 1), 1_001);
        cell.pending_reconnect_gap = Some((1_001, 6));
        cell.sub.invalidate();

        let snapshot = SnapshotFrame {
            market_ticker: "MKT".into(),
            seq: 1,
            yes: vec![[61, 2]],
            no: vec![],
        };
        let applied = apply_snapshot(&mut cell, &snapshot, 5_000).unwrap();
        let gap = applied.reconnect_gap.unwrap();
        assert_eq!(gap.reason, GapReason::Reconnect);
        assert_eq!((gap.start_ts, gap.end_ts), (1_001, 5_000));
        assert!(cell.pending_reconnect_gap.is_none());
        assert_eq!(cell.book.quantity(Side::Yes, 60), 0);
        assert_eq!(cell.sub.next_sequence, Some(2));
    }

    #[test]
    fn test_snapshot_after_gap_sorts_after_gap_end() {
        let mut cell = live_cell();
        apply_delta(&mut cell, &delta(7, 2_000, 60, 1), 2_000);
        let snapshot = SnapshotFrame {
            market_ticker: "MKT".into(),
            seq: 20,
            yes: vec![],
            no: vec![],
        };
        // Local clock stepped back below the gap end
        let applied = apply_snapshot(&mut cell, &snapshot, 1_500).unwrap();
        assert_eq!(applied.snapshot.captured_at, 2_001);
    }

    #[test]
    fn test_invalid_snapshot_leaves_cell_untouched() {
        let mut cell = live_cell();
        let snapshot = SnapshotFrame {
            market_ticker: "MKT".into(),
            seq: 30,
            yes: vec![[0, 5]],
            no: vec![],
        };
        assert!(apply_snapshot(&mut cell, &snapshot, 2_000).is_err());
        assert_eq!(cell.sub.next_sequence, Some(5));
        assert_eq!(cell.book.quantity(Side::Yes, 60), 10);
    }

    #[test]
    fn test_materialize_only_when_moved() {
        let mut cell = live_cell();
        assert!(materialize(&mut cell).is_none());

        apply_delta(&mut cell, &delta(5, 1_010, 60, 5), 1_010);
        let snapshot = materialize(&mut cell).unwrap();
        assert_eq!(snapshot.captured_at, 1_010);
        assert_eq!(snapshot.sequence, 5);
        assert_eq!(snapshot.yes[0].quantity, 15);
        assert_eq!(cell.sub.last_snapshot_ts, Some(1_010));
        assert!(materialize(&mut cell).is_none());

        // Next delta sorts strictly after the materialized basis
        let DeltaOutcome::Applied(d) = apply_delta(&mut cell, &delta(6, 1_010, 60, 1), 1_011) else {
            panic!("expected applied");
        };
        assert_eq!(d.ts, 1_011);
    }
}
