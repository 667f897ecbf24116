use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

pub const DEFAULT_TRADE_WINDOW_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TakerSide {
    Buy,
    Sell,
}

impl TakerSide {
    /// The wire carries a buyer-is-maker flag; the taker is the opposite.
    pub fn from_buyer_is_maker(buyer_is_maker: bool) -> Self {
        if buyer_is_maker {
            Self::Sell
        } else {
            Self::Buy
        }
    }

    pub fn signed(self, qty: f64) -> f64 {
        match self {
            Self::Buy => qty,
            Self::Sell => -qty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trade {
    pub price: f64,
    pub qty: f64,
    pub taker_side: TakerSide,
    pub event_time_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SizeBuckets {
    pub small: u64,
    pub medium: u64,
    pub large: u64,
    pub small_max: f64,
    pub large_min: f64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct TapeSummary {
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub trade_count: usize,
    pub prints_per_second: f64,
    /// Sell-taker volume over buy-taker volume; None while one side is empty.
    pub bid_hit_ask_lift_ratio: Option<f64>,
    pub burst_len: u32,
    pub burst_side: Option<TakerSide>,
    pub size_buckets: SizeBuckets,
}

/// Rolling window of aggressive trades, indexed by exchange event time.
#[derive(Debug, Clone)]
pub struct TradeTape {
    window_ms: u64,
    trades: VecDeque<Trade>,
}

impl TradeTape {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms: window_ms.max(1),
            trades: VecDeque::new(),
        }
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    pub fn add(&mut self, trade: Trade) {
        self.trades.push_back(trade);
        self.prune(trade.event_time_ms);
    }

    fn prune(&mut self, now_event_ms: u64) {
        let cutoff = now_event_ms.saturating_sub(self.window_ms);
        while let Some(front) = self.trades.front() {
            if front.event_time_ms >= cutoff {
                break;
            }
            self.trades.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }

    pub fn summary(&self) -> TapeSummary {
        let mut buy_volume = 0.0;
        let mut sell_volume = 0.0;
        for trade in &self.trades {
            match trade.taker_side {
                TakerSide::Buy => buy_volume += trade.qty,
                TakerSide::Sell => sell_volume += trade.qty,
            }
        }

        let trade_count = self.trades.len();
        let prints_per_second = trade_count as f64 / (self.window_ms as f64 / 1_000.0);

        let bid_hit_ask_lift_ratio = if buy_volume > 0.0 && sell_volume > 0.0 {
            Some(sell_volume / buy_volume)
        } else {
            None
        };

        let (burst_len, burst_side) = self.trailing_burst();

        TapeSummary {
            buy_volume,
            sell_volume,
            trade_count,
            prints_per_second,
            bid_hit_ask_lift_ratio,
            burst_len,
            burst_side,
            size_buckets: self.size_buckets(),
        }
    }

    fn trailing_burst(&self) -> (u32, Option<TakerSide>) {
        let Some(last) = self.trades.back() else {
            return (0, None);
        };
        let mut len = 0u32;
        for trade in self.trades.iter().rev() {
            if trade.taker_side != last.taker_side {
                break;
            }
            len += 1;
        }
        (len, Some(last.taker_side))
    }

    /// Bucket thresholds sit at the 33rd/66th size quantiles once at least
    /// ten samples exist; before that a fixed 1/10 split is used.
    fn size_buckets(&self) -> SizeBuckets {
        let (small_max, large_min) = if self.trades.len() >= 10 {
            let mut sizes: Vec<f64> = self.trades.iter().map(|t| t.qty).collect();
            sizes.sort_by(|a, b| a.total_cmp(b));
            let q = |pct: f64| -> f64 {
                let rank = ((sizes.len() as f64 - 1.0) * pct).round() as usize;
                sizes[rank.min(sizes.len() - 1)]
            };
            (q(0.33), q(0.66))
        } else {
            (1.0, 10.0)
        };

        let mut small = 0u64;
        let mut medium = 0u64;
        let mut large = 0u64;
        for trade in &self.trades {
            if trade.qty <= small_max {
                small += 1;
            } else if trade.qty < large_min {
                medium += 1;
            } else {
                large += 1;
            }
        }

        SizeBuckets {
            small,
            medium,
            large,
            small_max,
            large_min,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CvdSnapshot {
    pub timeframe_s: u64,
    pub cvd: f64,
    pub delta: f64,
    pub exhaustion: bool,
}

#[derive(Debug, Clone)]
struct CvdWindow {
    window_ms: u64,
    entries: VecDeque<(u64, f64)>,
}

impl CvdWindow {
    fn new(window_ms: u64) -> Self {
        Self {
            window_ms: window_ms.max(1),
            entries: VecDeque::new(),
        }
    }

    fn add(&mut self, event_time_ms: u64, signed_qty: f64) {
        self.entries.push_back((event_time_ms, signed_qty));
        let cutoff = event_time_ms.saturating_sub(self.window_ms);
        while let Some((ts, _)) = self.entries.front() {
            if *ts >= cutoff {
                break;
            }
            self.entries.pop_front();
        }
    }

    /// Splits the window into three equal time buckets; exhaustion is the
    /// strict deceleration of per-bucket absolute delta toward the present.
    fn snapshot(&self) -> CvdSnapshot {
        let timeframe_s = self.window_ms / 1_000;
        let Some(&(newest_ts, _)) = self.entries.back() else {
            return CvdSnapshot {
                timeframe_s,
                cvd: 0.0,
                delta: 0.0,
                exhaustion: false,
            };
        };

        let third = (self.window_ms / 3).max(1);
        let mut buckets = [0.0f64; 3];
        let mut cvd = 0.0;
        for &(ts, signed) in &self.entries {
            cvd += signed;
            let age = newest_ts.saturating_sub(ts);
            let idx = 2usize.saturating_sub((age / third).min(2) as usize);
            buckets[idx] += signed;
        }

        let exhaustion = cvd != 0.0
            && buckets[2].abs() < buckets[1].abs()
            && buckets[1].abs() < buckets[0].abs();

        CvdSnapshot {
            timeframe_s,
            cvd,
            delta: buckets[2],
            exhaustion,
        }
    }
}

/// Multi-horizon cumulative volume delta over the configured timeframes.
#[derive(Debug, Clone)]
pub struct CvdEngine {
    windows: Vec<CvdWindow>,
}

impl CvdEngine {
    pub fn new(timeframes_s: &[u64]) -> Self {
        let windows = timeframes_s
            .iter()
            .map(|s| CvdWindow::new(s.saturating_mul(1_000)))
            .collect();
        Self { windows }
    }

    pub fn add(&mut self, trade: &Trade) {
        let signed = trade.taker_side.signed(trade.qty);
        for window in &mut self.windows {
            window.add(trade.event_time_ms, signed);
        }
    }

    pub fn snapshots(&self) -> Vec<CvdSnapshot> {
        self.windows.iter().map(CvdWindow::snapshot).collect()
    }

    /// Snapshot of the shortest configured horizon, if any.
    pub fn primary(&self) -> Option<CvdSnapshot> {
        self.windows
            .iter()
            .min_by_key(|w| w.window_ms)
            .map(CvdWindow::snapshot)
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct AbsorptionSnapshot {
    pub bid_absorption: bool,
    pub ask_absorption: bool,
    pub score: f64,
}

/// Flags one-sided aggression that fails to move the mid: heavy selling
/// into bids that hold is bid absorption, and symmetrically for asks.
#[derive(Debug, Clone)]
pub struct AbsorptionDetector {
    window_ms: u64,
    volume_ratio: f64,
    max_move_spread_frac: f64,
    samples: VecDeque<AbsorptionSample>,
}

#[derive(Debug, Clone, Copy)]
struct AbsorptionSample {
    event_time_ms: u64,
    signed_qty: f64,
    mid: f64,
    spread: f64,
}

impl AbsorptionDetector {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms: window_ms.max(1),
            volume_ratio: 2.0,
            max_move_spread_frac: 0.5,
            samples: VecDeque::new(),
        }
    }

    pub fn record(&mut self, trade: &Trade, mid: f64, spread: f64) {
        if !mid.is_finite() || !spread.is_finite() || mid <= 0.0 {
            return;
        }
        self.samples.push_back(AbsorptionSample {
            event_time_ms: trade.event_time_ms,
            signed_qty: trade.taker_side.signed(trade.qty),
            mid,
            spread,
        });
        let cutoff = trade.event_time_ms.saturating_sub(self.window_ms);
        while let Some(front) = self.samples.front() {
            if front.event_time_ms >= cutoff {
                break;
            }
            self.samples.pop_front();
        }
    }

    pub fn snapshot(&self) -> AbsorptionSnapshot {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return AbsorptionSnapshot {
                bid_absorption: false,
                ask_absorption: false,
                score: 0.0,
            };
        };

        let mut buy_volume = 0.0;
        let mut sell_volume = 0.0;
        let mut spread_sum = 0.0;
        for sample in &self.samples {
            if sample.signed_qty >= 0.0 {
                buy_volume += sample.signed_qty;
            } else {
                sell_volume += -sample.signed_qty;
            }
            spread_sum += sample.spread;
        }
        let avg_spread = spread_sum / self.samples.len() as f64;
        let mid_move = (last.mid - first.mid).abs();
        let held = avg_spread > 0.0 && mid_move <= avg_spread * self.max_move_spread_frac;

        let bid_absorption = held && sell_volume >= buy_volume * self.volume_ratio;
        let ask_absorption = held && buy_volume >= sell_volume * self.volume_ratio;

        let total = buy_volume + sell_volume;
        let score = if held && total > 0.0 {
            let dominant = buy_volume.max(sell_volume);
            let move_frac = if avg_spread > 0.0 {
                (mid_move / avg_spread).min(1.0)
            } else {
                1.0
            };
            (dominant / total) * (1.0 - move_frac)
        } else {
            0.0
        };

        AbsorptionSnapshot {
            bid_absorption,
            ask_absorption,
            score,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AbsorptionDetector, CvdEngine, TakerSide, Trade, TradeTape};

    fn trade(ts: u64, qty: f64, side: TakerSide) -> Trade {
        Trade {
            price: 100.0,
            qty,
            taker_side: side,
            event_time_ms: ts,
        }
    }

    #[test]
    fn maker_flag_inverts_to_taker_side() {
        assert_eq!(TakerSide::from_buyer_is_maker(true), TakerSide::Sell);
        assert_eq!(TakerSide::from_buyer_is_maker(false), TakerSide::Buy);
    }

    #[test]
    fn tape_prunes_outside_window_by_event_time() {
        let mut tape = TradeTape::new(60_000);
        tape.add(trade(1_000, 1.0, TakerSide::Buy));
        tape.add(trade(30_000, 1.0, TakerSide::Sell));
        tape.add(trade(62_000, 1.0, TakerSide::Buy));

        // 1_000 < 62_000 - 60_000.
        assert_eq!(tape.len(), 2);
    }

    #[test]
    fn summary_splits_aggressive_volume_by_side() {
        let mut tape = TradeTape::new(60_000);
        tape.add(trade(1_000, 2.0, TakerSide::Buy));
        tape.add(trade(2_000, 3.0, TakerSide::Sell));
        tape.add(trade(3_000, 1.0, TakerSide::Sell));

        let summary = tape.summary();
        assert!((summary.buy_volume - 2.0).abs() < 1e-12);
        assert!((summary.sell_volume - 4.0).abs() < 1e-12);
        assert_eq!(summary.trade_count, 3);
        let ratio = summary.bid_hit_ask_lift_ratio.expect("both sides present");
        assert!((ratio - 2.0).abs() < 1e-12);
        assert_eq!(summary.burst_len, 2);
        assert_eq!(summary.burst_side, Some(TakerSide::Sell));
    }

    #[test]
    fn size_buckets_use_fixed_split_under_ten_samples() {
        let mut tape = TradeTape::new(60_000);
        tape.add(trade(1_000, 0.5, TakerSide::Buy));
        tape.add(trade(2_000, 5.0, TakerSide::Buy));
        tape.add(trade(3_000, 50.0, TakerSide::Buy));

        let buckets = tape.summary().size_buckets;
        assert_eq!(buckets.small_max, 1.0);
        assert_eq!(buckets.large_min, 10.0);
        assert_eq!((buckets.small, buckets.medium, buckets.large), (1, 1, 1));
    }

    #[test]
    fn size_buckets_switch_to_quantiles_at_ten_samples() {
        let mut tape = TradeTape::new(60_000);
        for i in 1..=10u64 {
            tape.add(trade(i * 100, i as f64, TakerSide::Buy));
        }

        let buckets = tape.summary().size_buckets;
        assert!(buckets.small_max >= 3.0 && buckets.small_max <= 4.0);
        assert!(buckets.large_min >= 6.0 && buckets.large_min <= 7.0);
    }

    #[test]
    fn cvd_accumulates_signed_volume_per_timeframe() {
        let mut cvd = CvdEngine::new(&[60, 300]);
        cvd.add(&trade(1_000, 5.0, TakerSide::Buy));
        cvd.add(&trade(2_000, 2.0, TakerSide::Sell));

        let snapshots = cvd.snapshots();
        assert_eq!(snapshots.len(), 2);
        for snap in &snapshots {
            assert!((snap.cvd - 3.0).abs() < 1e-12);
        }
        assert_eq!(cvd.primary().expect("primary window").timeframe_s, 60);
    }

    #[test]
    fn cvd_flags_exhaustion_on_decelerating_delta() {
        let mut cvd = CvdEngine::new(&[60]);
        // Oldest third heavy buying, middle third lighter, newest lightest.
        cvd.add(&trade(1_000, 10.0, TakerSide::Buy));
        cvd.add(&trade(25_000, 4.0, TakerSide::Buy));
        cvd.add(&trade(59_000, 1.0, TakerSide::Buy));

        let snap = cvd.primary().expect("primary window");
        assert!(snap.exhaustion);
        assert!((snap.delta - 1.0).abs() < 1e-12);

        // Accelerating flow clears the flag.
        cvd.add(&trade(59_500, 20.0, TakerSide::Buy));
        assert!(!cvd.primary().expect("primary window").exhaustion);
    }

    #[test]
    fn absorption_flags_one_sided_flow_into_static_mid() {
        let mut detector = AbsorptionDetector::new(60_000);
        for i in 0..10u64 {
            detector.record(&trade(i * 1_000, 5.0, TakerSide::Sell), 100.0, 0.1);
        }
        detector.record(&trade(11_000, 1.0, TakerSide::Buy), 100.01, 0.1);

        let snap = detector.snapshot();
        assert!(snap.bid_absorption);
        assert!(!snap.ask_absorption);
        assert!(snap.score > 0.5);
    }

    #[test]
    fn no_absorption_when_mid_breaks_away() {
        let mut detector = AbsorptionDetector::new(60_000);
        detector.record(&trade(1_000, 5.0, TakerSide::Sell), 100.0, 0.1);
        detector.record(&trade(2_000, 5.0, TakerSide::Sell), 99.0, 0.1);

        let snap = detector.snapshot();
        assert!(!snap.bid_absorption);
        assert!((snap.score - 0.0).abs() < 1e-12);
    }
}
