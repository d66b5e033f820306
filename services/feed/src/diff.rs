//! Order book diff engine
//!
//! Compares consecutive snapshots of one product's book and decides what
//! a subscriber should receive: a full snapshot (first contact), a delta
//! (levels changed or removed), nothing (identical books), or a discard
//! (stale sequence, protects against out-of-order delivery from a
//! multi-producer upstream).
//!
//! The diff is a pure function of its two inputs; per-subscription state
//! lives with the caller (the registry's session lanes).

use rust_decimal::Decimal;
use types::book::{OrderBookSnapshot, PriceLevel};
use types::order::Side;

/// Levels to change and prices to drop, relative to a previous snapshot.
///
/// Deterministically ordered: bids before asks, price ascending within
/// a side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookDelta {
    pub sequence: u64,
    /// Levels added or resized.
    pub changed: Vec<(Side, PriceLevel)>,
    /// Prices no longer present.
    pub removed: Vec<(Side, Decimal)>,
}

impl BookDelta {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
}

/// Outcome of diffing a new snapshot against the last one sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffOutcome {
    /// No previous state: send the full book.
    Snapshot,
    /// Incremental changes to apply.
    Delta(BookDelta),
    /// Books are identical; nothing to send.
    Unchanged,
    /// Stale sequence; the caller logs and sends nothing.
    Discard,
}

/// Diff `next` against the previously sent snapshot.
pub fn diff(previous: Option<&OrderBookSnapshot>, next: &OrderBookSnapshot) -> DiffOutcome {
    let Some(previous) = previous else {
        return DiffOutcome::Snapshot;
    };
    if next.sequence <= previous.sequence {
        return DiffOutcome::Discard;
    }

    let mut changed = Vec::new();
    let mut removed = Vec::new();
    for side in [Side::BUY, Side::SELL] {
        let before = previous.level_map(side);
        let after = next.level_map(side);

        for (&price, &size) in &after {
            if before.get(&price) != Some(&size) {
                changed.push((side, PriceLevel::new(price, size)));
            }
        }
        for &price in before.keys() {
            if !after.contains_key(&price) {
                removed.push((side, price));
            }
        }
    }

    if changed.is_empty() && removed.is_empty() {
        return DiffOutcome::Unchanged;
    }
    // level_map iteration is already price-ascending; the side loop
    // fixes bids-before-asks.
    DiffOutcome::Delta(BookDelta {
        sequence: next.sequence,
        changed,
        removed,
    })
}

/// Apply a delta to a snapshot, producing the follow-up book.
///
/// Used to verify that `diff` loses nothing; the hot path never
/// reconstructs books this way.
pub fn apply_delta(previous: &OrderBookSnapshot, delta: &BookDelta) -> OrderBookSnapshot {
    let mut bids = previous.level_map(Side::BUY);
    let mut asks = previous.level_map(Side::SELL);

    for (side, level) in &delta.changed {
        match side {
            Side::BUY => bids.insert(level.price, level.size),
            Side::SELL => asks.insert(level.price, level.size),
        };
    }
    for (side, price) in &delta.removed {
        match side {
            Side::BUY => bids.remove(price),
            Side::SELL => asks.remove(price),
        };
    }

    OrderBookSnapshot {
        product_id: previous.product_id.clone(),
        sequence: delta.sequence,
        bids: bids
            .into_iter()
            .rev()
            .map(|(price, size)| PriceLevel::new(price, size))
            .collect(),
        asks: asks
            .into_iter()
            .map(|(price, size)| PriceLevel::new(price, size))
            .collect(),
    }
}
