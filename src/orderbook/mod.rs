use std::collections::{BTreeMap, VecDeque};

use ordered_float::OrderedFloat;
use serde::Serialize;
use thiserror::Error;

pub const DEFAULT_DIFF_BUFFER_CAP: usize = 1_000;
pub const DEFAULT_MAX_GAP_TOLERANCE: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelUpdate {
    pub price: f64,
    pub qty: f64,
}

#[derive(Debug, Clone)]
pub struct DepthSnapshot {
    pub last_update_id: u64,
    pub bids: Vec<LevelUpdate>,
    pub asks: Vec<LevelUpdate>,
}

#[derive(Debug, Clone)]
pub struct DepthDiff {
    pub first_update_id: u64,
    pub final_update_id: u64,
    pub bids: Vec<LevelUpdate>,
    pub asks: Vec<LevelUpdate>,
    pub event_time_ms: u64,
}

/// Lifecycle of a per-symbol book. Metrics are only consumed in `Live`;
/// `Stale` marks a book whose resync attempts keep failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookLifecycle {
    Unseeded,
    Resyncing,
    Live,
    Stale,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BookStats {
    pub applied: u64,
    pub dropped: u64,
    pub buffered: u64,
    pub desyncs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOutcome {
    /// Diff applied, or benignly dropped because it predates the book.
    Applied,
    /// Held back while the book awaits a snapshot.
    Buffered,
    /// Sequence gap beyond tolerance; caller should trigger a resync.
    Desync,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TopOfBook {
    pub best_bid: f64,
    pub best_bid_qty: f64,
    pub best_ask: f64,
    pub best_ask_qty: f64,
    pub mid_price: f64,
    pub spread_pct: f64,
}

#[derive(Debug, Error)]
pub enum OrderBookError {
    #[error("invalid {side} level (price={price}, qty={qty})")]
    InvalidLevel {
        side: &'static str,
        price: f64,
        qty: f64,
    },
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Bid,
    Ask,
}

impl Side {
    fn label(self) -> &'static str {
        match self {
            Self::Bid => "bid",
            Self::Ask => "ask",
        }
    }
}

/// Sequence-validated L2 book for one futures symbol.
///
/// Diffs arriving before the first snapshot (and during a resync) are
/// buffered, bounded, and replayed once the snapshot lands. A gap of up to
/// `max_gap_tolerance` update ids is applied anyway rather than forcing a
/// REST round-trip; anything larger reports `Desync`.
#[derive(Debug, Clone)]
pub struct BookState {
    symbol: String,
    bids: BTreeMap<OrderedFloat<f64>, f64>,
    asks: BTreeMap<OrderedFloat<f64>, f64>,
    last_update_id: u64,
    lifecycle: BookLifecycle,
    buffer: VecDeque<DepthDiff>,
    buffer_cap: usize,
    max_gap_tolerance: u64,
    stats: BookStats,
    last_seen_ids: Option<(u64, u64)>,
}

impl BookState {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self::with_limits(symbol, DEFAULT_DIFF_BUFFER_CAP, DEFAULT_MAX_GAP_TOLERANCE)
    }

    pub fn with_limits(
        symbol: impl Into<String>,
        buffer_cap: usize,
        max_gap_tolerance: u64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_id: 0,
            lifecycle: BookLifecycle::Unseeded,
            buffer: VecDeque::new(),
            buffer_cap: buffer_cap.max(1),
            max_gap_tolerance,
            stats: BookStats::default(),
            last_seen_ids: None,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    pub fn lifecycle(&self) -> BookLifecycle {
        self.lifecycle
    }

    pub fn stats(&self) -> BookStats {
        self.stats
    }

    pub fn last_seen_ids(&self) -> Option<(u64, u64)> {
        self.last_seen_ids
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn mark_resyncing(&mut self) {
        self.lifecycle = BookLifecycle::Resyncing;
    }

    pub fn mark_stale(&mut self) {
        self.lifecycle = BookLifecycle::Stale;
    }

    /// Replaces book contents from a REST snapshot, transitions to `Live`,
    /// then replays buffered diffs in arrival order. Buffered diffs fully
    /// covered by the snapshot (`u <= last_update_id`) are discarded.
    pub fn apply_snapshot(&mut self, snapshot: DepthSnapshot) -> Result<(), OrderBookError> {
        self.bids.clear();
        self.asks.clear();
        self.set_levels(&snapshot.bids, Side::Bid)?;
        self.set_levels(&snapshot.asks, Side::Ask)?;
        self.last_update_id = snapshot.last_update_id;
        self.lifecycle = BookLifecycle::Live;

        let pending: Vec<DepthDiff> = self.buffer.drain(..).collect();
        for diff in pending {
            if diff.final_update_id <= self.last_update_id {
                continue;
            }
            self.apply_diff(&diff)?;
        }

        Ok(())
    }

    /// Applies one incremental diff against the current sequence position.
    pub fn apply_diff(&mut self, diff: &DepthDiff) -> Result<DiffOutcome, OrderBookError> {
        self.last_seen_ids = Some((diff.first_update_id, diff.final_update_id));

        if matches!(
            self.lifecycle,
            BookLifecycle::Unseeded | BookLifecycle::Resyncing
        ) {
            if self.buffer.len() >= self.buffer_cap {
                self.buffer.pop_front();
            }
            self.buffer.push_back(diff.clone());
            self.stats.buffered = self.stats.buffered.saturating_add(1);
            return Ok(DiffOutcome::Buffered);
        }

        if diff.final_update_id <= self.last_update_id {
            self.stats.dropped = self.stats.dropped.saturating_add(1);
            return Ok(DiffOutcome::Applied);
        }

        let next_id = self.last_update_id.saturating_add(1);
        let contiguous = diff.first_update_id <= next_id && diff.final_update_id >= next_id;
        let gap = diff.first_update_id.saturating_sub(next_id);

        if !contiguous && gap > self.max_gap_tolerance {
            self.stats.desyncs = self.stats.desyncs.saturating_add(1);
            return Ok(DiffOutcome::Desync);
        }

        self.set_levels(&diff.bids, Side::Bid)?;
        self.set_levels(&diff.asks, Side::Ask)?;
        self.last_update_id = diff.final_update_id;
        self.stats.applied = self.stats.applied.saturating_add(1);

        if self.lifecycle == BookLifecycle::Stale {
            self.lifecycle = BookLifecycle::Live;
        }

        Ok(DiffOutcome::Applied)
    }

    pub fn best_bid(&self) -> Option<(f64, f64)> {
        self.bids.iter().next_back().map(|(p, q)| (p.0, *q))
    }

    pub fn best_ask(&self) -> Option<(f64, f64)> {
        self.asks.iter().next().map(|(p, q)| (p.0, *q))
    }

    pub fn mid_price(&self) -> Option<f64> {
        let (bid, _) = self.best_bid()?;
        let (ask, _) = self.best_ask()?;
        Some((bid + ask) * 0.5)
    }

    pub fn spread_pct(&self) -> Option<f64> {
        let mid = self.mid_price()?;
        if mid <= 0.0 {
            return None;
        }
        let (bid, _) = self.best_bid()?;
        let (ask, _) = self.best_ask()?;
        Some(((ask - bid) / mid) * 100.0)
    }

    pub fn top_of_book(&self) -> Option<TopOfBook> {
        let (best_bid, best_bid_qty) = self.best_bid()?;
        let (best_ask, best_ask_qty) = self.best_ask()?;
        let mid_price = (best_bid + best_ask) * 0.5;
        if mid_price <= 0.0 {
            return None;
        }

        Some(TopOfBook {
            best_bid,
            best_bid_qty,
            best_ask,
            best_ask_qty,
            mid_price,
            spread_pct: ((best_ask - best_bid) / mid_price) * 100.0,
        })
    }

    /// Bids descending, asks ascending, at most `depth` levels each.
    pub fn top_levels(&self, depth: usize) -> (Vec<(f64, f64)>, Vec<(f64, f64)>) {
        let bids = self
            .bids
            .iter()
            .rev()
            .take(depth)
            .map(|(p, q)| (p.0, *q))
            .collect();
        let asks = self
            .asks
            .iter()
            .take(depth)
            .map(|(p, q)| (p.0, *q))
            .collect();
        (bids, asks)
    }

    /// Summed bid and ask quantities over the top `depth` levels.
    pub fn depth_sums(&self, depth: usize) -> (f64, f64) {
        let bid_sum = self.bids.iter().rev().take(depth).map(|(_, q)| *q).sum();
        let ask_sum = self.asks.iter().take(depth).map(|(_, q)| *q).sum();
        (bid_sum, ask_sum)
    }

    pub fn is_two_sided(&self) -> bool {
        !self.bids.is_empty() && !self.asks.is_empty()
    }

    fn set_levels(&mut self, levels: &[LevelUpdate], side: Side) -> Result<(), OrderBookError> {
        let side_label = side.label();

        for level in levels {
            if !level.price.is_finite()
                || level.price <= 0.0
                || !level.qty.is_finite()
                || level.qty < 0.0
            {
                return Err(OrderBookError::InvalidLevel {
                    side: side_label,
                    price: level.price,
                    qty: level.qty,
                });
            }

            let map = match side {
                Side::Bid => &mut self.bids,
                Side::Ask => &mut self.asks,
            };

            let key = OrderedFloat(level.price);
            if level.qty == 0.0 {
                map.remove(&key);
            } else {
                map.insert(key, level.qty);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{BookLifecycle, BookState, DepthDiff, DepthSnapshot, DiffOutcome, LevelUpdate};

    fn level(price: f64, qty: f64) -> LevelUpdate {
        LevelUpdate { price, qty }
    }

    fn diff(first: u64, last: u64, bids: Vec<LevelUpdate>, asks: Vec<LevelUpdate>) -> DepthDiff {
        DepthDiff {
            first_update_id: first,
            final_update_id: last,
            bids,
            asks,
            event_time_ms: 1_700_000_000_000,
        }
    }

    fn seeded_book() -> BookState {
        let mut book = BookState::new("BTCUSDT");
        book.apply_snapshot(DepthSnapshot {
            last_update_id: 100,
            bids: vec![level(10.0, 1.0)],
            asks: vec![level(11.0, 1.0)],
        })
        .expect("snapshot applies");
        book
    }

    #[test]
    fn seed_then_contiguous_diff() {
        let mut book = seeded_book();
        assert_eq!(book.lifecycle(), BookLifecycle::Live);

        let outcome = book
            .apply_diff(&diff(101, 101, vec![level(10.0, 2.0)], vec![]))
            .expect("diff applies");

        assert_eq!(outcome, DiffOutcome::Applied);
        assert_eq!(book.last_update_id(), 101);
        assert_eq!(book.best_bid(), Some((10.0, 2.0)));
        assert_eq!(book.lifecycle(), BookLifecycle::Live);
    }

    #[test]
    fn tolerant_gap_applies_and_deletes_level() {
        let mut book = seeded_book();
        book.apply_diff(&diff(101, 101, vec![level(10.0, 2.0)], vec![]))
            .expect("diff applies");

        let desyncs_before = book.stats().desyncs;
        let applied_before = book.stats().applied;
        let outcome = book
            .apply_diff(&diff(110, 111, vec![], vec![level(11.0, 0.0)]))
            .expect("tolerant diff applies");

        assert_eq!(outcome, DiffOutcome::Applied);
        assert_eq!(book.last_update_id(), 111);
        assert_eq!(book.best_ask(), None);
        assert_eq!(book.stats().desyncs, desyncs_before);
        assert_eq!(book.stats().applied, applied_before + 1);
    }

    #[test]
    fn hard_desync_leaves_book_untouched() {
        let mut book = seeded_book();

        let outcome = book
            .apply_diff(&diff(500, 500, vec![level(12.0, 1.0)], vec![]))
            .expect("diff evaluated");

        assert_eq!(outcome, DiffOutcome::Desync);
        assert_eq!(book.stats().desyncs, 1);
        assert_eq!(book.last_update_id(), 100);
        assert_eq!(book.best_bid(), Some((10.0, 1.0)));
    }

    #[test]
    fn old_diff_is_benignly_dropped() {
        let mut book = seeded_book();

        let outcome = book
            .apply_diff(&diff(90, 100, vec![level(9.0, 5.0)], vec![]))
            .expect("diff evaluated");

        assert_eq!(outcome, DiffOutcome::Applied);
        assert_eq!(book.stats().dropped, 1);
        assert_eq!(book.last_update_id(), 100);
        assert_eq!(book.best_bid(), Some((10.0, 1.0)));
    }

    #[test]
    fn unseeded_diffs_buffer_then_replay_after_snapshot() {
        let mut book = BookState::new("ETHUSDT");

        assert_eq!(
            book.apply_diff(&diff(99, 100, vec![level(9.5, 1.0)], vec![]))
                .expect("buffered"),
            DiffOutcome::Buffered
        );
        assert_eq!(
            book.apply_diff(&diff(101, 102, vec![level(10.5, 2.0)], vec![]))
                .expect("buffered"),
            DiffOutcome::Buffered
        );
        assert_eq!(book.buffered_len(), 2);

        book.apply_snapshot(DepthSnapshot {
            last_update_id: 100,
            bids: vec![level(10.0, 1.0)],
            asks: vec![level(11.0, 1.0)],
        })
        .expect("snapshot applies");

        // First buffered diff was covered by the snapshot; second applied.
        assert_eq!(book.last_update_id(), 102);
        assert_eq!(book.best_bid(), Some((10.5, 2.0)));
        assert_eq!(book.buffered_len(), 0);
        assert_eq!(book.lifecycle(), BookLifecycle::Live);
    }

    #[test]
    fn buffer_overflow_drops_oldest() {
        let mut book = BookState::with_limits("BTCUSDT", 2, 100);

        for id in 0..4u64 {
            book.apply_diff(&diff(id * 10, id * 10 + 1, vec![], vec![]))
                .expect("buffered");
        }

        assert_eq!(book.buffered_len(), 2);
        assert_eq!(book.stats().buffered, 4);
    }

    #[test]
    fn stale_book_restores_live_on_applied_diff() {
        let mut book = seeded_book();
        book.mark_stale();

        book.apply_diff(&diff(101, 101, vec![level(10.2, 1.0)], vec![]))
            .expect("diff applies");

        assert_eq!(book.lifecycle(), BookLifecycle::Live);
    }

    #[test]
    fn update_id_is_monotonic_and_no_zero_levels_survive() {
        let mut book = seeded_book();
        let mut last = book.last_update_id();

        let diffs = [
            diff(101, 102, vec![level(10.1, 1.0)], vec![level(11.0, 0.0)]),
            diff(103, 103, vec![level(10.1, 0.0)], vec![level(11.2, 3.0)]),
            diff(90, 95, vec![level(1.0, 1.0)], vec![]),
            diff(104, 110, vec![level(10.4, 2.0)], vec![]),
        ];
        for d in &diffs {
            book.apply_diff(d).expect("diff evaluated");
            assert!(book.last_update_id() >= last);
            last = book.last_update_id();
        }

        let (bids, asks) = book.top_levels(50);
        assert!(bids.iter().all(|(_, q)| *q > 0.0));
        assert!(asks.iter().all(|(_, q)| *q > 0.0));
    }
}
