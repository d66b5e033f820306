//! Order book snapshot types
//!
//! An `OrderBookSnapshot` is an immutable, sequence-stamped view of one
//! product's book as published by the trading core. Bids are ordered best
//! first (descending price), asks best first (ascending price), one level
//! per price, no zero sizes. Diffing and mirroring both operate on the
//! `BTreeMap` projections for deterministic iteration.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::ProductId;
use crate::order::Side;

/// A single aggregated price level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    /// The price of this level.
    pub price: Decimal,
    /// Total size resting at this level.
    pub size: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

/// Violations of the snapshot shape contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BookError {
    #[error("duplicate {side:?} price {price}")]
    DuplicatePrice { side: Side, price: Decimal },

    #[error("{side:?} levels out of order at price {price}")]
    OutOfOrder { side: Side, price: Decimal },

    #[error("zero-size {side:?} level at price {price}")]
    ZeroSize { side: Side, price: Decimal },
}

/// Immutable sequence-stamped view of one product's book.
///
/// Snapshots with a lower-or-equal sequence than one already seen are
/// stale and must be discarded by consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    /// Trading pair this book belongs to.
    pub product_id: ProductId,
    /// Monotonic sequence assigned by the trading core.
    pub sequence: u64,
    /// Bid levels, best (highest price) first.
    pub bids: Vec<PriceLevel>,
    /// Ask levels, best (lowest price) first.
    pub asks: Vec<PriceLevel>,
}

impl OrderBookSnapshot {
    /// Create an empty snapshot at the given sequence.
    pub fn empty(product_id: ProductId, sequence: u64) -> Self {
        Self {
            product_id,
            sequence,
            bids: Vec::new(),
            asks: Vec::new(),
        }
    }

    /// Levels for one side as a price-sorted map.
    pub fn level_map(&self, side: Side) -> BTreeMap<Decimal, Decimal> {
        let levels = match side {
            Side::BUY => &self.bids,
            Side::SELL => &self.asks,
        };
        levels.iter().map(|l| (l.price, l.size)).collect()
    }

    /// Best bid price, if any.
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    /// Best ask price, if any.
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }

    /// Check the shape contract: strict best-first ordering, unique
    /// prices per side, no zero-size levels.
    pub fn validate(&self) -> Result<(), BookError> {
        Self::validate_side(&self.bids, Side::BUY)?;
        Self::validate_side(&self.asks, Side::SELL)
    }

    fn validate_side(levels: &[PriceLevel], side: Side) -> Result<(), BookError> {
        let mut prev: Option<Decimal> = None;
        for level in levels {
            if level.size <= Decimal::ZERO {
                return Err(BookError::ZeroSize {
                    side,
                    price: level.price,
                });
            }
            if let Some(p) = prev {
                if p == level.price {
                    return Err(BookError::DuplicatePrice {
                        side,
                        price: level.price,
                    });
                }
                let ordered = match side {
                    Side::BUY => level.price < p,
                    Side::SELL => level.price > p,
                };
                if !ordered {
                    return Err(BookError::OutOfOrder {
                        side,
                        price: level.price,
                    });
                }
            }
            prev = Some(level.price);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn snapshot() -> OrderBookSnapshot {
        OrderBookSnapshot {
            product_id: ProductId::new("BTC-USDT"),
            sequence: 42,
            bids: vec![
                PriceLevel::new(d("100.5"), d("2")),
                PriceLevel::new(d("100.0"), d("1")),
            ],
            asks: vec![
                PriceLevel::new(d("101.0"), d("3")),
                PriceLevel::new(d("101.5"), d("4")),
            ],
        }
    }

    #[test]
    fn test_valid_snapshot() {
        assert!(snapshot().validate().is_ok());
    }

    #[test]
    fn test_best_prices() {
        let snap = snapshot();
        assert_eq!(snap.best_bid(), Some(d("100.5")));
        assert_eq!(snap.best_ask(), Some(d("101.0")));
    }

    #[test]
    fn test_level_map_sorted_ascending() {
        let snap = snapshot();
        let bids = snap.level_map(Side::BUY);
        let prices: Vec<_> = bids.keys().copied().collect();
        assert_eq!(prices, vec![d("100.0"), d("100.5")]);
    }

    #[test]
    fn test_rejects_unsorted_bids() {
        let mut snap = snapshot();
        snap.bids.reverse();
        assert!(matches!(
            snap.validate(),
            Err(BookError::OutOfOrder { side: Side::BUY, .. })
        ));
    }

    #[test]
    fn test_rejects_duplicate_ask_price() {
        let mut snap = snapshot();
        snap.asks.push(PriceLevel::new(d("101.5"), d("1")));
        assert!(matches!(
            snap.validate(),
            Err(BookError::DuplicatePrice { side: Side::SELL, .. })
        ));
    }

    #[test]
    fn test_rejects_zero_size() {
        let mut snap = snapshot();
        snap.bids[0].size = Decimal::ZERO;
        assert!(matches!(snap.validate(), Err(BookError::ZeroSize { .. })));
    }
}
