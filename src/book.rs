//! Integer order book used both for live per-market tracking and for replay.
//!
//! Each side is a `price -> quantity` map in cents / contracts. A level whose
//! quantity reaches zero or below is removed, so the maps never hold empty
//! levels.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::{OrderbookSnapshot, PriceLevel, Side};

/// Two-sided binary-market book.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Book {
    /// Yes levels: price -> quantity (iterate in reverse for best).
    yes: BTreeMap<i64, i64>,
    /// No levels: price -> quantity (iterate in reverse for best).
    no: BTreeMap<i64, i64>,
}

impl Book {
    pub fn new() -> Self {
        Self::default()
    }

    /// Book initialised from a snapshot's levels. Non-positive levels are skipped.
    pub fn from_snapshot(snapshot: &OrderbookSnapshot) -> Self {
        let mut book = Self::new();
        book.reset(&snapshot.yes, &snapshot.no);
        book
    }

    /// Replace the entire book state.
    pub fn reset(&mut self, yes: &[PriceLevel], no: &[PriceLevel]) {
        self.yes.clear();
        self.no.clear();
        for level in yes {
            if level.quantity > 0 {
                self.yes.insert(level.price, level.quantity);
            }
        }
        for level in no {
            if level.quantity > 0 {
                self.no.insert(level.price, level.quantity);
            }
        }
    }

    /// Apply a signed quantity change and return the resulting level quantity
    /// (zero when the level was pruned).
    pub fn apply(&mut self, side: Side, price: i64, delta: i64) -> i64 {
        let levels = self.side_mut(side);
        let current = levels.get(&price).copied().unwrap_or(0);
        let updated = current.saturating_add(delta);
        if updated <= 0 {
            levels.remove(&price);
            0
        } else {
            levels.insert(price, updated);
            updated
        }
    }

    pub fn side(&self, side: Side) -> &BTreeMap<i64, i64> {
        match side {
            Side::Yes => &self.yes,
            Side::No => &self.no,
        }
    }

    fn side_mut(&mut self, side: Side) -> &mut BTreeMap<i64, i64> {
        match side {
            Side::Yes => &mut self.yes,
            Side::No => &mut self.no,
        }
    }

    /// Quantity resting at `price`, zero if the level does not exist.
    #[inline]
    pub fn quantity(&self, side: Side, price: i64) -> i64 {
        self.side(side).get(&price).copied().unwrap_or(0)
    }

    /// Highest resting price on a side.
    #[inline]
    pub fn best_price(&self, side: Side) -> Option<i64> {
        self.side(side).keys().next_back().copied()
    }

    /// Levels for a side, best first.
    pub fn levels(&self, side: Side) -> Vec<PriceLevel> {
        self.side(side)
            .iter()
            .rev()
            .map(|(&price, &quantity)| PriceLevel::new(price, quantity))
            .collect()
    }

    pub fn level_count(&self) -> usize {
        self.yes.len() + self.no.len()
    }

    pub fn is_empty(&self) -> bool {
        self.yes.is_empty() && self.no.is_empty()
    }

    /// Keep only the best `depth` levels on each side.
    pub fn truncate(&mut self, depth: usize) {
        truncate_to_depth(&mut self.yes, depth);
        truncate_to_depth(&mut self.no, depth);
    }

    pub fn into_sides(self) -> (BTreeMap<i64, i64>, BTreeMap<i64, i64>) {
        (self.yes, self.no)
    }
}

/// Drop everything but the `depth` highest prices.
pub fn truncate_to_depth(levels: &mut BTreeMap<i64, i64>, depth: usize) {
    if levels.len() <= depth {
        return;
    }
    let cutoff = levels.keys().rev().nth(depth).copied();
    if let Some(cutoff) = cutoff {
        // split_off keeps keys >= the argument in the returned map
        *levels = levels.split_off(&(cutoff + 1));
    }
}
