//! Write Buffer
//!
//! Accumulates validated records and persists them in one bulk write per
//! record type, whenever `max_rows` records are pending or `flush_interval`
//! elapses, whichever comes first.
//!
//! A failed write keeps its batch pending for the next interval flush, so
//! retries are spaced one flush interval apart. After `max_retries` failed
//! attempts the batch is dropped and counted; the next snapshot for each
//! affected market re-establishes ground truth.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::WriteBufferConfig;
use crate::error::StorageError;
use crate::models::{DataGap, Market, OrderbookDelta, OrderbookSnapshot};
use crate::storage::{RecordSink, StorageRecord};

// =============================================================================
// Stats
// =============================================================================

#[derive(Debug, Default)]
pub struct WriteBufferStats {
    pub records_received: AtomicU64,
    pub flushes: AtomicU64,
    pub flush_failures: AtomicU64,
    pub rows_written: AtomicU64,
    /// Rows the store already had (retried or replayed writes).
    pub rows_ignored: AtomicU64,
    pub records_dropped: AtomicU64,
}

impl WriteBufferStats {
    pub fn summary(&self) -> String {
        format!(
            "received={}, flushes={}, failures={}, written={}, ignored={}, dropped={}",
            self.records_received.load(Ordering::Relaxed),
            self.flushes.load(Ordering::Relaxed),
            self.flush_failures.load(Ordering::Relaxed),
            self.rows_written.load(Ordering::Relaxed),
            self.rows_ignored.load(Ordering::Relaxed),
            self.records_dropped.load(Ordering::Relaxed),
        )
    }
}

// =============================================================================
// Sender
// =============================================================================

/// Push side of the buffer. Producers never see buffered contents.
#[derive(Debug, Clone)]
pub struct RecordSender {
    tx: mpsc::Sender<StorageRecord>,
}

impl RecordSender {
    /// Sender plus the receiving end a [`WriteBuffer`] drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StorageRecord>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue a record, waiting for room if the buffer is backed up.
    /// Returns false once the buffer has shut down.
    pub async fn send(&self, record: StorageRecord) -> bool {
        match self.tx.send(record).await {
            Ok(()) => true,
            Err(e) => {
                error!(ticker = %e.0.ticker(), "Write buffer closed; record lost");
                false
            }
        }
    }
}

// =============================================================================
// Buffer
// =============================================================================

/// Pending rows of one record type and how often writing them has failed.
struct Batch<T> {
    kind: &'static str,
    rows: Vec<T>,
    attempts: u32,
}

impl<T> Batch<T> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            rows: Vec::new(),
            attempts: 0,
        }
    }
}

pub struct WriteBuffer {
    sink: Arc<dyn RecordSink>,
    config: WriteBufferConfig,
    markets: Batch<Market>,
    snapshots: Batch<OrderbookSnapshot>,
    deltas: Batch<OrderbookDelta>,
    gaps: Batch<DataGap>,
    stats: Arc<WriteBufferStats>,
}

impl WriteBuffer {
    pub fn new(sink: Arc<dyn RecordSink>, config: WriteBufferConfig) -> Self {
        Self {
            sink,
            config,
            markets: Batch::new("markets"),
            snapshots: Batch::new("snapshots"),
            deltas: Batch::new("deltas"),
            gaps: Batch::new("gaps"),
            stats: Arc::new(WriteBufferStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<WriteBufferStats> {
        Arc::clone(&self.stats)
    }

    /// Start the buffer task. It runs until every sender is dropped, then
    /// flushes what is left.
    pub fn spawn(self) -> (RecordSender, JoinHandle<()>) {
        let (sender, rx) = RecordSender::channel(self.config.queue_capacity);
        let handle = tokio::spawn(self.run(rx));
        (sender, handle)
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<StorageRecord>) {
        let mut flush_interval = interval(self.config.flush_interval());
        flush_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately.
        flush_interval.tick().await;

        // Set while a failed batch is held; retries then wait for the tick.
        let mut retrying = false;

        loop {
            tokio::select! {
                record = rx.recv() => {
                    let Some(record) = record else { break };
                    self.push(record);
                    if !retrying && self.pending() >= self.config.max_rows {
                        retrying = self.flush().await;
                        flush_interval.reset();
                    }
                }
                _ = flush_interval.tick() => {
                    if self.pending() > 0 {
                        retrying = self.flush().await;
                    }
                }
            }
        }

        // Graceful drain: retry until written or dropped.
        while self.pending() > 0 {
            self.flush().await;
        }
        info!(stats = %self.stats.summary(), "Write buffer drained");
    }

    fn push(&mut self, record: StorageRecord) {
        self.stats.records_received.fetch_add(1, Ordering::Relaxed);
        match record {
            StorageRecord::Market(m) => self.markets.rows.push(m),
            StorageRecord::Snapshot(s) => self.snapshots.rows.push(s),
            StorageRecord::Delta(d) => self.deltas.rows.push(d),
            StorageRecord::Gap(g) => self.gaps.rows.push(g),
        }
    }

    pub fn pending(&self) -> usize {
        self.markets.rows.len()
            + self.snapshots.rows.len()
            + self.deltas.rows.len()
            + self.gaps.rows.len()
    }

    /// One bulk write per non-empty record type. Returns true if any batch
    /// failed and is held for another attempt.
    async fn flush(&mut self) -> bool {
        let max_retries = self.config.max_retries.max(1);
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);

        let markets = flush_batch(&self.sink, &mut self.markets, max_retries, &self.stats, |s, r| {
            s.upsert_markets(r)
        })
        .await;
        let snapshots = flush_batch(&self.sink, &mut self.snapshots, max_retries, &self.stats, |s, r| {
            s.write_snapshots(r)
        })
        .await;
        let deltas = flush_batch(&self.sink, &mut self.deltas, max_retries, &self.stats, |s, r| {
            s.write_deltas(r)
        })
        .await;
        let gaps =
            flush_batch(&self.sink, &mut self.gaps, max_retries, &self.stats, |s, r| s.write_gaps(r))
                .await;
        markets || snapshots || deltas || gaps
    }
}

/// Write one batch. Returns true if it failed and was kept for retry.
async fn flush_batch<T, F>(
    sink: &Arc<dyn RecordSink>,
    batch: &mut Batch<T>,
    max_retries: u32,
    stats: &WriteBufferStats,
    write: F,
) -> bool
where
    T: Send + 'static,
    F: FnOnce(&dyn RecordSink, &[T]) -> Result<usize, StorageError> + Send + 'static,
{
    if batch.rows.is_empty() {
        return false;
    }

    let rows = std::mem::take(&mut batch.rows);
    let count = rows.len();
    let sink = Arc::clone(sink);
    let joined = tokio::task::spawn_blocking(move || {
        let result = write(sink.as_ref(), &rows);
        (rows, result)
    })
    .await;

    let (rows, err) = match joined {
        Ok((_, Ok(written))) => {
            stats.rows_written.fetch_add(written as u64, Ordering::Relaxed);
            stats
                .rows_ignored
                .fetch_add(count.saturating_sub(written) as u64, Ordering::Relaxed);
            batch.attempts = 0;
            debug!(kind = batch.kind, rows = count, written, "Flushed batch");
            return false;
        }
        Ok((rows, Err(e))) => (rows, e.to_string()),
        Err(e) => {
            // The rows went down with the blocking task.
            stats.flush_failures.fetch_add(1, Ordering::Relaxed);
            stats.records_dropped.fetch_add(count as u64, Ordering::Relaxed);
            batch.attempts = 0;
            error!(kind = batch.kind, rows = count, error = %e, "Flush task failed; batch lost");
            return false;
        }
    };

    stats.flush_failures.fetch_add(1, Ordering::Relaxed);
    batch.attempts += 1;
    if batch.attempts >= max_retries {
        stats.records_dropped.fetch_add(count as u64, Ordering::Relaxed);
        error!(
            kind = batch.kind,
            rows = count,
            attempts = batch.attempts,
            error = %err,
            "Storage write failed repeatedly; dropping batch"
        );
        batch.attempts = 0;
        // Anything queued behind the failed rows stays.
        return false;
    }

    warn!(
        kind = batch.kind,
        rows = count,
        attempt = batch.attempts,
        max_retries,
        error = %err,
        "Storage write failed; keeping batch for retry"
    );
    let mut restored = rows;
    restored.append(&mut batch.rows);
    batch.rows = restored;
    true
}
