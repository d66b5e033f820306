//! Local-vs-external book comparison
//!
//! Produces the per-cycle work list for the reconciler: external levels
//! the local mirror is missing or holds at the wrong size, and local
//! mirror levels the external book no longer has. Price is the identity
//! within a side; a zero external size means absent.

use std::collections::{BTreeMap, BTreeSet};

use rust_decimal::Decimal;
use types::book::OrderBookSnapshot;
use types::order::Side;

/// Price-indexed view of one book, both sides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookLevels {
    pub bids: BTreeMap<Decimal, Decimal>,
    pub asks: BTreeMap<Decimal, Decimal>,
}

impl BookLevels {
    pub fn from_snapshot(snapshot: &OrderBookSnapshot) -> Self {
        Self {
            bids: snapshot.level_map(Side::BUY),
            asks: snapshot.level_map(Side::SELL),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

/// Changes needed to bring the local mirror in line with the external
/// book.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MirrorDiff {
    /// price → target size
    pub bids_to_add: BTreeMap<Decimal, Decimal>,
    pub asks_to_add: BTreeMap<Decimal, Decimal>,
    /// prices with no external counterpart
    pub bids_to_remove: BTreeSet<Decimal>,
    pub asks_to_remove: BTreeSet<Decimal>,
}

impl MirrorDiff {
    pub fn has_changes(&self) -> bool {
        !self.bids_to_add.is_empty()
            || !self.asks_to_add.is_empty()
            || !self.bids_to_remove.is_empty()
            || !self.asks_to_remove.is_empty()
    }

    /// Bid prices that must survive this cycle (add targets plus
    /// unchanged levels), used by the reconciler's drift sweep.
    pub fn keep_bids(&self, local: &BookLevels) -> BTreeSet<Decimal> {
        let mut keep: BTreeSet<Decimal> = self.bids_to_add.keys().copied().collect();
        keep.extend(
            local
                .bids
                .keys()
                .filter(|p| !self.bids_to_remove.contains(p)),
        );
        keep
    }

    pub fn keep_asks(&self, local: &BookLevels) -> BTreeSet<Decimal> {
        let mut keep: BTreeSet<Decimal> = self.asks_to_add.keys().copied().collect();
        keep.extend(
            local
                .asks
                .keys()
                .filter(|p| !self.asks_to_remove.contains(p)),
        );
        keep
    }
}

/// Compare the local mirror against the external target.
pub fn mirror_diff(local: &BookLevels, external: &BookLevels) -> MirrorDiff {
    let (bids_to_add, bids_to_remove) = diff_side(&local.bids, &external.bids);
    let (asks_to_add, asks_to_remove) = diff_side(&local.asks, &external.asks);
    MirrorDiff {
        bids_to_add,
        asks_to_add,
        bids_to_remove,
        asks_to_remove,
    }
}

fn diff_side(
    local: &BTreeMap<Decimal, Decimal>,
    external: &BTreeMap<Decimal, Decimal>,
) -> (BTreeMap<Decimal, Decimal>, BTreeSet<Decimal>) {
    let mut to_add = BTreeMap::new();
    for (&price, &size) in external {
        if size <= Decimal::ZERO {
            continue;
        }
        if local.get(&price) != Some(&size) {
            to_add.insert(price, size);
        }
    }

    let to_remove = local
        .keys()
        .filter(|price| {
            external
                .get(price)
                .map(|size| *size <= Decimal::ZERO)
                .unwrap_or(true)
        })
        .copied()
        .collect();

    (to_add, to_remove)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn levels(pairs: &[(&str, &str)]) -> BTreeMap<Decimal, Decimal> {
        pairs.iter().map(|(p, s)| (d(p), d(s))).collect()
    }

    #[test]
    fn test_empty_local_adds_everything() {
        let local = BookLevels::default();
        let external = BookLevels {
            bids: levels(&[("100", "2"), ("99", "1")]),
            asks: levels(&[("101", "3")]),
        };
        let diff = mirror_diff(&local, &external);
        assert_eq!(diff.bids_to_add, levels(&[("100", "2"), ("99", "1")]));
        assert_eq!(diff.asks_to_add, levels(&[("101", "3")]));
        assert!(diff.bids_to_remove.is_empty());
        assert!(diff.asks_to_remove.is_empty());
    }

    #[test]
    fn test_size_change_and_removal() {
        let local = BookLevels {
            bids: levels(&[("100", "2"), ("99", "1")]),
            asks: levels(&[("101", "3")]),
        };
        let external = BookLevels {
            bids: levels(&[("99", "5")]),
            asks: levels(&[("101", "3")]),
        };
        let diff = mirror_diff(&local, &external);
        assert_eq!(diff.bids_to_add, levels(&[("99", "5")]));
        assert_eq!(
            diff.bids_to_remove,
            [d("100")].into(),
            "size changes go through the add path, not removal"
        );
        assert!(diff.asks_to_add.is_empty());
        assert!(diff.asks_to_remove.is_empty());
    }

    #[test]
    fn test_zero_external_size_means_absent() {
        let local = BookLevels {
            bids: levels(&[("100", "2")]),
            asks: BTreeMap::new(),
        };
        let external = BookLevels {
            bids: levels(&[("100", "0")]),
            asks: BTreeMap::new(),
        };
        let diff = mirror_diff(&local, &external);
        assert!(diff.bids_to_add.is_empty());
        assert_eq!(diff.bids_to_remove, [d("100")].into());
    }

    #[test]
    fn test_matching_books_have_no_changes() {
        let local = BookLevels {
            bids: levels(&[("100", "2")]),
            asks: levels(&[("101", "1")]),
        };
        let diff = mirror_diff(&local, &local.clone());
        assert!(!diff.has_changes());
    }

    #[test]
    fn test_keep_sets_cover_adds_and_survivors() {
        let local = BookLevels {
            bids: levels(&[("100", "2"), ("98", "1")]),
            asks: BTreeMap::new(),
        };
        let external = BookLevels {
            bids: levels(&[("100", "2"), ("99", "4")]),
            asks: BTreeMap::new(),
        };
        let diff = mirror_diff(&local, &external);
        let keep = diff.keep_bids(&local);
        assert_eq!(keep, [d("99"), d("100")].into());
    }
}
