//! Live bid/ask structure for one symbol.
//!
//! Bids are kept in descending price order and asks in ascending price order,
//! both as sorted vectors. A delta locates its level with a binary search and
//! splices in place, which stays cheap at the tens-to-hundreds of levels a
//! venue stream carries. Published views are produced by [`OrderBook::snapshot`]
//! and never alias the live vectors.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::types::BookSide;

/// A single `(price, size)` level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

impl BookLevel {
    pub const fn new(price: f64, size: f64) -> Self {
        Self { price, size }
    }
}

impl From<(f64, f64)> for BookLevel {
    fn from((price, size): (f64, f64)) -> Self {
        Self::new(price, size)
    }
}

#[derive(Debug, Clone, Default)]
pub struct OrderBook {
    bids: Vec<BookLevel>,
    asks: Vec<BookLevel>,
    timestamp: Option<i64>,
    sequence: Option<u64>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces both sides wholesale.
    ///
    /// Input order does not matter. Zero sizes are dropped and a repeated
    /// price keeps the last size given for it.
    pub fn apply_snapshot<B, A>(&mut self, bids: B, asks: A)
    where
        B: IntoIterator<Item = BookLevel>,
        A: IntoIterator<Item = BookLevel>,
    {
        self.bids.clear();
        self.asks.clear();
        for level in bids {
            self.apply_delta(BookSide::Bid, level.price, level.size);
        }
        for level in asks {
            self.apply_delta(BookSide::Ask, level.price, level.size);
        }
    }

    /// Inserts, updates or removes (`size == 0`) the level at `price`.
    ///
    /// Removing a price that is not on the book is a no-op.
    pub fn apply_delta(&mut self, side: BookSide, price: f64, size: f64) {
        let levels = match side {
            BookSide::Bid => &mut self.bids,
            BookSide::Ask => &mut self.asks,
        };

        match locate(levels, side, price) {
            Ok(index) if size <= 0.0 => {
                levels.remove(index);
            }
            Ok(index) => levels[index].size = size,
            Err(_) if size <= 0.0 => {}
            Err(index) => levels.insert(index, BookLevel::new(price, size)),
        }
    }

    /// Empties both sides and forgets timestamp and sequence.
    pub fn reset(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.timestamp = None;
        self.sequence = None;
    }

    /// Copy of the book truncated to `limit` levels per side.
    pub fn snapshot(&self, limit: Option<usize>) -> BookSnapshot {
        let take = limit.unwrap_or(usize::MAX);
        BookSnapshot {
            bids: self.bids.iter().take(take).copied().collect(),
            asks: self.asks.iter().take(take).copied().collect(),
            timestamp: self.timestamp,
            sequence: self.sequence,
        }
    }

    pub fn set_timestamp(&mut self, timestamp_ms: i64) {
        self.timestamp = Some(timestamp_ms);
    }

    pub fn set_sequence(&mut self, sequence: u64) {
        self.sequence = Some(sequence);
    }

    pub fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }

    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    pub fn bids(&self) -> &[BookLevel] {
        &self.bids
    }

    pub fn asks(&self) -> &[BookLevel] {
        &self.asks
    }

    pub fn best_bid(&self) -> Option<BookLevel> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<BookLevel> {
        self.asks.first().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

/// Immutable, depth-limited copy of an [`OrderBook`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookSnapshot {
    /// Descending by price.
    pub bids: Vec<BookLevel>,
    /// Ascending by price.
    pub asks: Vec<BookLevel>,
    /// Milliseconds since the unix epoch.
    pub timestamp: Option<i64>,
    pub sequence: Option<u64>,
}

impl BookSnapshot {
    pub fn datetime(&self) -> Option<OffsetDateTime> {
        let millis = self.timestamp?;
        OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).ok()
    }

    pub fn mid_price(&self) -> Option<f64> {
        let bid = self.bids.first()?;
        let ask = self.asks.first()?;
        Some(0.5 * (bid.price + ask.price))
    }
}

// Bids sort descending, so the comparison is flipped for that side.
fn locate(levels: &[BookLevel], side: BookSide, price: f64) -> Result<usize, usize> {
    levels.binary_search_by(|level| match side {
        BookSide::Bid => price.total_cmp(&level.price),
        BookSide::Ask => level.price.total_cmp(&price),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::cmp::Ordering;

    fn is_sorted(levels: &[BookLevel], side: BookSide) -> bool {
        levels.windows(2).all(|pair| {
            let ordering = pair[0].price.total_cmp(&pair[1].price);
            match side {
                BookSide::Bid => ordering == Ordering::Greater,
                BookSide::Ask => ordering == Ordering::Less,
            }
        })
    }

    fn levels(pairs: &[(f64, f64)]) -> Vec<BookLevel> {
        pairs.iter().copied().map(BookLevel::from).collect()
    }

    #[test]
    fn test_snapshot_sorts_both_sides() {
        let mut book = OrderBook::new();
        book.apply_snapshot(
            levels(&[(99.0, 2.0), (100.0, 1.0), (98.5, 4.0)]),
            levels(&[(102.0, 1.0), (101.0, 3.0)]),
        );

        assert_eq!(book.bids(), levels(&[(100.0, 1.0), (99.0, 2.0), (98.5, 4.0)]));
        assert_eq!(book.asks(), levels(&[(101.0, 3.0), (102.0, 1.0)]));
        assert!(is_sorted(book.bids(), BookSide::Bid));
        assert!(is_sorted(book.asks(), BookSide::Ask));
    }

    #[test]
    fn test_snapshot_drops_zero_and_keeps_last_duplicate() {
        let mut book = OrderBook::new();
        book.apply_snapshot(
            levels(&[(100.0, 1.0), (99.0, 0.0), (100.0, 5.0)]),
            Vec::<BookLevel>::new(),
        );

        assert_eq!(book.bids(), levels(&[(100.0, 5.0)]));
        assert!(book.asks().is_empty());
    }

    #[test]
    fn test_delta_insert_update_remove() {
        let mut book = OrderBook::new();
        book.apply_delta(BookSide::Bid, 100.0, 1.0);
        book.apply_delta(BookSide::Bid, 101.0, 2.0);
        book.apply_delta(BookSide::Bid, 99.0, 3.0);
        assert_eq!(
            book.bids(),
            levels(&[(101.0, 2.0), (100.0, 1.0), (99.0, 3.0)])
        );

        book.apply_delta(BookSide::Bid, 100.0, 7.5);
        assert_eq!(book.bids()[1], BookLevel::new(100.0, 7.5));

        book.apply_delta(BookSide::Bid, 101.0, 0.0);
        assert_eq!(book.best_bid(), Some(BookLevel::new(100.0, 7.5)));
        assert_eq!(book.bids().len(), 2);
    }

    #[test]
    fn test_remove_absent_level_is_noop() {
        let mut book = OrderBook::new();
        book.apply_delta(BookSide::Ask, 101.0, 1.0);
        book.apply_delta(BookSide::Ask, 150.0, 0.0);
        book.apply_delta(BookSide::Bid, 101.0, 0.0);

        assert_eq!(book.asks(), levels(&[(101.0, 1.0)]));
        assert!(book.bids().is_empty());
    }

    #[test]
    fn test_snapshot_limit_truncates_each_side() {
        let mut book = OrderBook::new();
        for i in 0..10 {
            book.apply_delta(BookSide::Bid, 100.0 - i as f64, 1.0);
            book.apply_delta(BookSide::Ask, 101.0 + i as f64, 1.0);
        }

        let view = book.snapshot(Some(3));
        assert_eq!(view.bids.len(), 3);
        assert_eq!(view.asks.len(), 3);
        assert_eq!(view.bids[0].price, 100.0);
        assert_eq!(view.asks[0].price, 101.0);

        let full = book.snapshot(None);
        assert_eq!(full.bids.len(), 10);
        assert_eq!(full.asks.len(), 10);
    }

    #[test]
    fn test_snapshot_not_aliased_to_live_book() {
        let mut book = OrderBook::new();
        book.apply_snapshot(levels(&[(100.0, 1.0)]), levels(&[(101.0, 1.0)]));
        let view = book.snapshot(None);

        book.apply_delta(BookSide::Bid, 100.0, 0.0);
        book.apply_delta(BookSide::Ask, 100.5, 9.0);

        assert_eq!(view.bids, levels(&[(100.0, 1.0)]));
        assert_eq!(view.asks, levels(&[(101.0, 1.0)]));
    }

    #[test]
    fn test_datetime_from_millis() {
        let mut book = OrderBook::new();
        book.set_timestamp(1_500_000_000_123);
        let view = book.snapshot(None);
        let datetime = view.datetime().unwrap();
        assert_eq!(datetime.unix_timestamp(), 1_500_000_000);
        assert_eq!(datetime.millisecond(), 123);
    }

    #[test]
    fn test_reset_clears_metadata() {
        let mut book = OrderBook::new();
        book.apply_delta(BookSide::Bid, 1.0, 1.0);
        book.set_sequence(4);
        book.set_timestamp(10);
        book.reset();
        assert!(book.is_empty());
        assert_eq!(book.sequence(), None);
        assert_eq!(book.timestamp(), None);
    }

    fn delta_strategy() -> impl Strategy<Value = (bool, u16, u8)> {
        // small price grid so updates collide with existing levels
        (any::<bool>(), 90u16..110, 0u8..4)
    }

    proptest! {
        #[test]
        fn prop_deltas_match_equivalent_snapshot(deltas in prop::collection::vec(delta_strategy(), 0..200)) {
            let mut incremental = OrderBook::new();
            let mut final_bids = std::collections::BTreeMap::new();
            let mut final_asks = std::collections::BTreeMap::new();

            for (is_bid, price, size) in &deltas {
                let side = if *is_bid { BookSide::Bid } else { BookSide::Ask };
                incremental.apply_delta(side, f64::from(*price), f64::from(*size));
                let target = if *is_bid { &mut final_bids } else { &mut final_asks };
                if *size == 0 {
                    target.remove(price);
                } else {
                    target.insert(*price, *size);
                }
            }

            let mut wholesale = OrderBook::new();
            wholesale.apply_snapshot(
                final_bids.iter().map(|(p, s)| BookLevel::new(f64::from(*p), f64::from(*s))),
                final_asks.iter().map(|(p, s)| BookLevel::new(f64::from(*p), f64::from(*s))),
            );

            prop_assert_eq!(incremental.snapshot(None), wholesale.snapshot(None));
            prop_assert!(is_sorted(incremental.bids(), BookSide::Bid));
            prop_assert!(is_sorted(incremental.asks(), BookSide::Ask));
        }

        #[test]
        fn prop_delta_is_idempotent(
            seed in prop::collection::vec(delta_strategy(), 0..50),
            (is_bid, price, size) in delta_strategy(),
        ) {
            let mut book = OrderBook::new();
            for (b, p, s) in &seed {
                let side = if *b { BookSide::Bid } else { BookSide::Ask };
                book.apply_delta(side, f64::from(*p), f64::from(*s));
            }
            let side = if is_bid { BookSide::Bid } else { BookSide::Ask };

            let mut once = book.clone();
            once.apply_delta(side, f64::from(price), f64::from(size));
            let mut twice = once.clone();
            twice.apply_delta(side, f64::from(price), f64::from(size));

            prop_assert_eq!(once.snapshot(None), twice.snapshot(None));
        }
    }
}
