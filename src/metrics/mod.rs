use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::orderbook::BookState;
use crate::tape::Trade;

const MIN_Z_BUCKETS: usize = 2;

/// Derived indicator snapshot consumed by the gate and the decision engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LegacyMetricsSnapshot {
    pub obi_weighted: f64,
    pub obi_deep: f64,
    pub obi_divergence: f64,
    pub delta_z: f64,
    pub cvd_slope: f64,
    #[serde(default)]
    pub oi_delta: Option<f64>,
}

/// The unit handed to the gate, the actors, and the metrics log.
/// `canonical_time_ms` is wall clock at broadcast; `exchange_event_time_ms`
/// is the feed's event time. `legacy` is absent while the book is one-sided.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsEnvelope {
    pub symbol: String,
    pub canonical_time_ms: u64,
    pub exchange_event_time_ms: u64,
    pub spread_pct: f64,
    pub prints_per_second: f64,
    pub best_bid: f64,
    pub best_ask: f64,
    pub legacy: Option<LegacyMetricsSnapshot>,
}

/// Rolling per-symbol indicator state: one-second signed-volume buckets
/// feeding the trade-imbalance Z score and the CVD slope, order-book
/// imbalance read straight off the book, and an open-interest delta when a
/// poller supplies values.
#[derive(Debug, Clone)]
pub struct LegacyMetrics {
    window_s: u64,
    buckets: VecDeque<(u64, f64)>,
    last_open_interest: Option<f64>,
    oi_delta: Option<f64>,
}

impl LegacyMetrics {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_s: (window_ms / 1_000).max(1),
            buckets: VecDeque::new(),
            last_open_interest: None,
            oi_delta: None,
        }
    }

    pub fn add_trade(&mut self, trade: &Trade) {
        let sec = trade.event_time_ms / 1_000;
        let signed = trade.taker_side.signed(trade.qty);

        match self.buckets.back_mut() {
            Some((bucket_sec, delta)) if *bucket_sec == sec => *delta += signed,
            _ => self.buckets.push_back((sec, signed)),
        }

        let cutoff = sec.saturating_sub(self.window_s);
        while let Some((bucket_sec, _)) = self.buckets.front() {
            if *bucket_sec > cutoff {
                break;
            }
            self.buckets.pop_front();
        }
    }

    pub fn record_open_interest(&mut self, open_interest: f64) {
        if let Some(prev) = self.last_open_interest {
            self.oi_delta = Some(open_interest - prev);
        }
        self.last_open_interest = Some(open_interest);
    }

    /// Z score of the newest one-second signed-volume bucket against the
    /// window. Zero until enough buckets exist or while variance vanishes.
    pub fn delta_z(&self) -> f64 {
        if self.buckets.len() < MIN_Z_BUCKETS {
            return 0.0;
        }

        let n = self.buckets.len() as f64;
        let mean = self.buckets.iter().map(|(_, d)| *d).sum::<f64>() / n;
        let variance = self
            .buckets
            .iter()
            .map(|(_, d)| (*d - mean).powi(2))
            .sum::<f64>()
            / n;
        let std = variance.sqrt();
        if std <= f64::EPSILON {
            return 0.0;
        }

        let (_, newest) = self.buckets.back().copied().unwrap_or((0, 0.0));
        (newest - mean) / std
    }

    /// Signed-flow slope over the window: newest half minus oldest half,
    /// normalized by total absolute flow. Bounded to [-1, 1].
    pub fn cvd_slope(&self) -> f64 {
        let Some(&(newest_sec, _)) = self.buckets.back() else {
            return 0.0;
        };

        let half = (self.window_s / 2).max(1);
        let mut newer = 0.0;
        let mut older = 0.0;
        let mut total_abs = 0.0;
        for &(sec, delta) in &self.buckets {
            if newest_sec.saturating_sub(sec) < half {
                newer += delta;
            } else {
                older += delta;
            }
            total_abs += delta.abs();
        }

        if total_abs <= f64::EPSILON {
            return 0.0;
        }
        ((newer - older) / total_abs).clamp(-1.0, 1.0)
    }

    pub fn snapshot(&self, book: &BookState, depth_levels: usize) -> Option<LegacyMetricsSnapshot> {
        if !book.is_two_sided() {
            return None;
        }

        let obi_deep = obi_deep(book, depth_levels)?;
        let obi_weighted = obi_weighted(book, depth_levels)?;

        Some(LegacyMetricsSnapshot {
            obi_weighted,
            obi_deep,
            obi_divergence: obi_weighted - obi_deep,
            delta_z: self.delta_z(),
            cvd_slope: self.cvd_slope(),
            oi_delta: self.oi_delta,
        })
    }
}

/// Plain imbalance over the summed top-`depth` quantities.
fn obi_deep(book: &BookState, depth: usize) -> Option<f64> {
    let (bid_sum, ask_sum) = book.depth_sums(depth);
    let total = bid_sum + ask_sum;
    if total <= 0.0 {
        return None;
    }
    Some((bid_sum - ask_sum) / total)
}

/// Imbalance with levels discounted by distance from the top of book.
fn obi_weighted(book: &BookState, depth: usize) -> Option<f64> {
    let (bids, asks) = book.top_levels(depth);
    let weigh = |levels: &[(f64, f64)]| -> f64 {
        levels
            .iter()
            .enumerate()
            .map(|(i, (_, qty))| qty / (i as f64 + 1.0))
            .sum()
    };
    let bid_w = weigh(&bids);
    let ask_w = weigh(&asks);
    let total = bid_w + ask_w;
    if total <= 0.0 {
        return None;
    }
    Some((bid_w - ask_w) / total)
}
