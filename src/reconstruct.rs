//! Reconstruction Engine
//!
//! Rebuilds a market's book at an arbitrary past instant from persisted
//! records: the latest snapshot at or before the target, then every delta
//! after that snapshot up to and including the target, in sequence order.
//!
//! Read-only and stateless; each query builds its book from scratch.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::book::Book;
use crate::error::ReconstructError;
use crate::models::{ReconstructedOrderbook, TimestampMs};
use crate::storage::RecordSource;

/// Book for `ticker` as of `target_ts`, optionally truncated to the best
/// `depth` levels per side.
pub fn reconstruct(
    source: &dyn RecordSource,
    ticker: &str,
    target_ts: TimestampMs,
    depth: Option<usize>,
) -> Result<ReconstructedOrderbook, ReconstructError> {
    let basis = source
        .latest_snapshot_at_or_before(ticker, target_ts)?
        .ok_or_else(|| ReconstructError::NoData {
            ticker: ticker.to_string(),
            target_ts,
        })?;

    let mut book = Book::from_snapshot(&basis);
    let deltas = source.deltas_in_range(ticker, basis.captured_at, target_ts)?;

    let mut last_sequence = basis.sequence;
    let mut deltas_applied = 0u64;
    let mut sequence_breaks = 0u64;
    for delta in &deltas {
        // Same event persisted twice, or already folded into the basis.
        if delta.sequence <= last_sequence {
            continue;
        }
        if delta.sequence != last_sequence + 1 {
            sequence_breaks += 1;
        }
        book.apply(delta.side, delta.price, delta.delta);
        last_sequence = delta.sequence;
        deltas_applied += 1;
    }

    let within_recorded_gap = source
        .gaps_overlapping(ticker, basis.captured_at, target_ts)?
        .iter()
        .any(|gap| gap.affects(basis.captured_at, target_ts));

    // Depth applies to the final state, never to the replay.
    if let Some(depth) = depth {
        book.truncate(depth);
    }

    debug!(
        ticker,
        target_ts,
        basis_ts = basis.captured_at,
        deltas_applied,
        sequence_breaks,
        within_recorded_gap,
        "Reconstructed book"
    );

    let (yes, no) = book.into_sides();
    Ok(ReconstructedOrderbook {
        ticker: ticker.to_string(),
        target_ts,
        basis_snapshot_ts: basis.captured_at,
        deltas_applied,
        last_sequence,
        sequence_breaks,
        within_recorded_gap,
        yes,
        no,
    })
}

/// [`reconstruct`] on the blocking pool, abandoned after `timeout`.
pub async fn reconstruct_with_timeout(
    source: Arc<dyn RecordSource>,
    ticker: &str,
    target_ts: TimestampMs,
    depth: Option<usize>,
    timeout: Duration,
) -> Result<ReconstructedOrderbook, ReconstructError> {
    let owned = ticker.to_string();
    let task = tokio::task::spawn_blocking(move || {
        reconstruct(source.as_ref(), &owned, target_ts, depth)
    });

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(ReconstructError::Join(e.to_string())),
        Err(_) => Err(ReconstructError::Timeout {
            ticker: ticker.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}
