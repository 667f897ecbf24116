use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::DecisionSettings;
use crate::gate::GateResult;
use crate::metrics::MetricsEnvelope;
use crate::util::round_decimals;

const PROFIT_LOCK_PEAK: f64 = 0.5;
const PROFIT_LOCK_DRAWDOWN: f64 = 0.2;
const REVERSAL_DELTA_Z: f64 = 3.0;
const REVERSAL_CVD_SLOPE: f64 = 0.5;
const ADD_MIN_PNL: f64 = 0.10;
const MAX_ADDS: u8 = 2;
const EMERGENCY_MIN_LATENCY_SAMPLES: usize = 3;
const QTY_DECIMALS: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn closing_order_side(self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Sell,
            Self::Short => OrderSide::Buy,
        }
    }

    pub fn opening_order_side(self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Buy,
            Self::Short => OrderSide::Sell,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub side: PositionSide,
    pub qty: f64,
    pub entry_price: f64,
    /// Fractional pnl relative to entry notional (0.10 = +10%). The venue
    /// reports a signed USDT amount; it is normalized at ingestion so the
    /// engine only ever sees the fraction.
    pub unrealized_pnl_pct: f64,
    pub adds_used: u8,
    pub peak_pnl_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: u64,
    pub client_order_id: Option<String>,
    pub side: OrderSide,
    pub price: f64,
    pub quantity: f64,
    pub reduce_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecQuality {
    pub poor: bool,
    pub recent_latency_ms: Vec<u64>,
    pub recent_slippage_bps: Vec<f64>,
}

/// Exclusive property of one SymbolActor; everything that leaves the actor
/// is a clone of this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolState {
    pub symbol: String,
    pub halted: bool,
    pub available_balance: f64,
    pub wallet_balance: f64,
    pub position: Option<Position>,
    pub open_orders: BTreeMap<u64, OpenOrder>,
    pub has_open_entry_order: bool,
    pub cooldown_until_ms: u64,
    pub last_exit_event_time_ms: Option<u64>,
    pub exec_quality: ExecQuality,
}

impl SymbolState {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            halted: false,
            available_balance: 0.0,
            wallet_balance: 0.0,
            position: None,
            open_orders: BTreeMap::new(),
            has_open_entry_order: false,
            cooldown_until_ms: 0,
            last_exit_event_time_ms: None,
            exec_quality: ExecQuality::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionAction {
    Noop {
        symbol: String,
        event_time_ms: u64,
        reason: String,
    },
    EntryProbe {
        symbol: String,
        event_time_ms: u64,
        reason: String,
        side: OrderSide,
        quantity: f64,
        reduce_only: bool,
        expected_price: f64,
    },
    AddPosition {
        symbol: String,
        event_time_ms: u64,
        reason: String,
        side: OrderSide,
        quantity: f64,
        reduce_only: bool,
        expected_price: f64,
    },
    ExitMarket {
        symbol: String,
        event_time_ms: u64,
        reason: String,
        side: OrderSide,
        quantity: f64,
        reduce_only: bool,
        expected_price: f64,
    },
    CancelOpenEntryOrders {
        symbol: String,
        event_time_ms: u64,
        reason: String,
    },
}

impl DecisionAction {
    pub fn is_noop(&self) -> bool {
        matches!(self, Self::Noop { .. })
    }

    pub fn symbol(&self) -> &str {
        match self {
            Self::Noop { symbol, .. }
            | Self::EntryProbe { symbol, .. }
            | Self::AddPosition { symbol, .. }
            | Self::ExitMarket { symbol, .. }
            | Self::CancelOpenEntryOrders { symbol, .. } => symbol,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Noop { reason, .. }
            | Self::EntryProbe { reason, .. }
            | Self::AddPosition { reason, .. }
            | Self::ExitMarket { reason, .. }
            | Self::CancelOpenEntryOrders { reason, .. } => reason,
        }
    }
}

/// Immutable record of one decision step: inputs, output actions, and the
/// state snapshot taken at decision time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub symbol: String,
    pub canonical_time_ms: u64,
    pub exchange_event_time_ms: u64,
    pub gate: GateResult,
    pub actions: Vec<DecisionAction>,
    pub state: SymbolState,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionConfig {
    pub initial_margin_usdt: f64,
    pub max_leverage: f64,
    pub cooldown_min_ms: u64,
    pub cooldown_max_ms: u64,
}

impl From<&DecisionSettings> for DecisionConfig {
    fn from(settings: &DecisionSettings) -> Self {
        Self {
            initial_margin_usdt: settings.initial_margin_usdt,
            max_leverage: settings.max_leverage,
            cooldown_min_ms: settings.cooldown_min_ms,
            cooldown_max_ms: settings.cooldown_max_ms(),
        }
    }
}

/// Post-exit cooldown scales with how violent the exit context was.
pub fn cooldown_ms_after_exit(delta_z: f64, prints_per_second: f64, cfg: &DecisionConfig) -> u64 {
    let raw = 200.0 * (delta_z.abs() + prints_per_second / 10.0);
    let rounded = if raw.is_finite() { raw.round().max(0.0) as u64 } else { 0 };
    rounded.clamp(cfg.cooldown_min_ms, cfg.cooldown_max_ms)
}

fn probe_qty(expected_price: f64, cfg: &DecisionConfig) -> f64 {
    if expected_price <= 0.0 || !expected_price.is_finite() {
        return 0.0;
    }
    round_decimals(
        cfg.initial_margin_usdt * cfg.max_leverage / expected_price,
        QTY_DECIMALS,
    )
}

/// Best ask buys, best bid sells: the market-order price the venue ticker
/// would quote for the taker side.
fn expected_market_price(envelope: &MetricsEnvelope, side: OrderSide) -> Option<f64> {
    let price = match side {
        OrderSide::Buy => envelope.best_ask,
        OrderSide::Sell => envelope.best_bid,
    };
    (price.is_finite() && price > 0.0).then_some(price)
}

/// Pure mapping (gate result, metrics, symbol state) -> ordered action list.
/// An empty result is coerced to a single NOOP so every evaluation leaves a
/// record.
pub fn evaluate(
    gate: &GateResult,
    envelope: &MetricsEnvelope,
    state: &SymbolState,
    cfg: &DecisionConfig,
) -> Vec<DecisionAction> {
    let symbol = envelope.symbol.clone();
    let event_time_ms = envelope.exchange_event_time_ms;
    let noop = |reason: String| DecisionAction::Noop {
        symbol: symbol.clone(),
        event_time_ms,
        reason,
    };

    if !gate.passed {
        let reason = gate
            .reason
            .map(|r| r.as_str())
            .unwrap_or("unspecified");
        return vec![noop(format!("gate_fail:{reason}"))];
    }

    let Some(legacy) = envelope.legacy.as_ref() else {
        return vec![noop("gate_fail:missing_metrics".to_string())];
    };

    let mut actions = Vec::new();

    if state.halted && state.has_open_entry_order {
        actions.push(DecisionAction::CancelOpenEntryOrders {
            symbol: symbol.clone(),
            event_time_ms,
            reason: "halted_with_open_entry".to_string(),
        });
    }

    match state.position.as_ref() {
        None => {
            if state.halted {
                actions.push(noop("halted".to_string()));
            } else if state.has_open_entry_order {
                actions.push(noop("entry_order_pending".to_string()));
            } else if !state.open_orders.is_empty() {
                actions.push(noop("open_orders_present".to_string()));
            } else if event_time_ms < state.cooldown_until_ms {
                actions.push(noop("cooldown_active".to_string()));
            } else {
                let side = if legacy.delta_z > 0.0 {
                    Some(OrderSide::Buy)
                } else if legacy.delta_z < 0.0 {
                    Some(OrderSide::Sell)
                } else {
                    None
                };

                match side {
                    None => actions.push(noop("flat_delta_z".to_string())),
                    Some(side) => match expected_market_price(envelope, side) {
                        None => actions.push(noop("no_expected_price".to_string())),
                        Some(expected_price) => {
                            let quantity = probe_qty(expected_price, cfg);
                            if quantity > 0.0 {
                                actions.push(DecisionAction::EntryProbe {
                                    symbol: symbol.clone(),
                                    event_time_ms,
                                    reason: "delta_z_entry".to_string(),
                                    side,
                                    quantity,
                                    reduce_only: false,
                                    expected_price,
                                });
                            } else {
                                actions.push(noop("probe_qty_zero".to_string()));
                            }
                        }
                    },
                }
            }
        }
        Some(position) => {
            let exit_reason = exit_reason(position, legacy, state);

            if let Some(reason) = exit_reason {
                let side = position.side.closing_order_side();
                let expected_price =
                    expected_market_price(envelope, side).unwrap_or(position.entry_price);
                actions.push(DecisionAction::ExitMarket {
                    symbol: symbol.clone(),
                    event_time_ms,
                    reason: reason.to_string(),
                    side,
                    quantity: position.qty,
                    reduce_only: true,
                    expected_price,
                });
            } else {
                let signal_matches = match position.side {
                    PositionSide::Long => legacy.delta_z > 0.0,
                    PositionSide::Short => legacy.delta_z < 0.0,
                };
                let can_add = !state.halted
                    && position.adds_used < MAX_ADDS
                    && position.unrealized_pnl_pct > ADD_MIN_PNL
                    && !state.exec_quality.poor
                    && signal_matches;

                if can_add {
                    let side = position.side.opening_order_side();
                    if let Some(expected_price) = expected_market_price(envelope, side) {
                        let quantity = probe_qty(expected_price, cfg);
                        if quantity > 0.0 {
                            actions.push(DecisionAction::AddPosition {
                                symbol: symbol.clone(),
                                event_time_ms,
                                reason: "add_to_winner".to_string(),
                                side,
                                quantity,
                                reduce_only: false,
                                expected_price,
                            });
                        }
                    }
                }
            }
        }
    }

    if actions.is_empty() {
        actions.push(noop("no_action".to_string()));
    }
    actions
}

/// Terminal exits in priority order; first match wins.
fn exit_reason(
    position: &Position,
    legacy: &crate::metrics::LegacyMetricsSnapshot,
    state: &SymbolState,
) -> Option<&'static str> {
    if position.peak_pnl_pct > PROFIT_LOCK_PEAK
        && position.peak_pnl_pct - position.unrealized_pnl_pct > PROFIT_LOCK_DRAWDOWN
    {
        return Some("profit_lock_drawdown");
    }

    match position.side {
        PositionSide::Long => {
            if legacy.delta_z < -REVERSAL_DELTA_Z && legacy.cvd_slope < -REVERSAL_CVD_SLOPE {
                return Some("reversal_exit_long");
            }
        }
        PositionSide::Short => {
            if legacy.delta_z > REVERSAL_DELTA_Z && legacy.cvd_slope > REVERSAL_CVD_SLOPE {
                return Some("reversal_exit_short");
            }
        }
    }

    if state.exec_quality.poor
        && state.exec_quality.recent_latency_ms.len() >= EMERGENCY_MIN_LATENCY_SAMPLES
    {
        return Some("exec_quality_emergency");
    }

    None
}

#[cfg(test)]
mod tests {
    use super::{
        cooldown_ms_after_exit, evaluate, DecisionAction, DecisionConfig, OrderSide, Position,
        PositionSide, SymbolState,
    };
    use crate::gate::{evaluate as gate_evaluate, GateConfig, GateMode};
    use crate::metrics::{LegacyMetricsSnapshot, MetricsEnvelope};

    fn cfg() -> DecisionConfig {
        DecisionConfig {
            initial_margin_usdt: 50.0,
            max_leverage: 5.0,
            cooldown_min_ms: 1_000,
            cooldown_max_ms: 60_000,
        }
    }

    fn envelope(delta_z: f64, cvd_slope: f64) -> MetricsEnvelope {
        MetricsEnvelope {
            symbol: "BTCUSDT".to_string(),
            canonical_time_ms: 5_000,
            exchange_event_time_ms: 5_000,
            spread_pct: 0.01,
            prints_per_second: 4.0,
            best_bid: 100.0,
            best_ask: 100.1,
            legacy: Some(LegacyMetricsSnapshot {
                obi_weighted: 0.2,
                obi_deep: 0.3,
                obi_divergence: -0.1,
                delta_z,
                cvd_slope,
                oi_delta: None,
            }),
        }
    }

    fn passing_gate(env: &MetricsEnvelope) -> crate::gate::GateResult {
        let gate_cfg = GateConfig {
            mode: GateMode::V1NoLatency,
            max_spread_pct: 0.08,
            min_obi_deep: 0.05,
            max_network_latency_ms: 100,
        };
        let result = gate_evaluate(env, &gate_cfg);
        assert!(result.passed, "fixture gate must pass");
        result
    }

    fn long_position(upnl: f64, peak: f64) -> Position {
        Position {
            side: PositionSide::Long,
            qty: 2.5,
            entry_price: 100.0,
            unrealized_pnl_pct: upnl,
            adds_used: 0,
            peak_pnl_pct: peak,
        }
    }

    #[test]
    fn gate_failure_maps_to_single_noop() {
        let env = envelope(1.0, 0.0);
        let mut gate = passing_gate(&env);
        gate.passed = false;
        gate.reason = Some(crate::gate::GateReason::SpreadTooWide);

        let actions = evaluate(&gate, &env, &SymbolState::new("BTCUSDT"), &cfg());
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            DecisionAction::Noop { reason, .. } => {
                assert_eq!(reason, "gate_fail:spread_too_wide");
            }
            other => panic!("expected noop, got {other:?}"),
        }
    }

    #[test]
    fn flat_state_probes_in_delta_z_direction() {
        let env = envelope(1.1, 0.2);
        let gate = passing_gate(&env);

        let actions = evaluate(&gate, &env, &SymbolState::new("BTCUSDT"), &cfg());
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            DecisionAction::EntryProbe {
                side,
                quantity,
                reduce_only,
                expected_price,
                ..
            } => {
                assert_eq!(*side, OrderSide::Buy);
                assert!(!reduce_only);
                assert!((expected_price - 100.1).abs() < 1e-12);
                // 50 * 5 / 100.1 rounded to 6 decimals.
                assert!((quantity - 2.497502).abs() < 1e-9);
            }
            other => panic!("expected entry probe, got {other:?}"),
        }
    }

    #[test]
    fn negative_delta_z_probes_short_at_best_bid() {
        let env = envelope(-2.0, 0.0);
        let gate = passing_gate(&env);

        let actions = evaluate(&gate, &env, &SymbolState::new("BTCUSDT"), &cfg());
        match &actions[0] {
            DecisionAction::EntryProbe {
                side,
                expected_price,
                ..
            } => {
                assert_eq!(*side, OrderSide::Sell);
                assert!((expected_price - 100.0).abs() < 1e-12);
            }
            other => panic!("expected entry probe, got {other:?}"),
        }
    }

    #[test]
    fn cooldown_blocks_entry() {
        let env = envelope(1.1, 0.2);
        let gate = passing_gate(&env);
        let mut state = SymbolState::new("BTCUSDT");
        state.cooldown_until_ms = 10_000;

        let actions = evaluate(&gate, &env, &state, &cfg());
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            DecisionAction::Noop { reason, .. } => assert_eq!(reason, "cooldown_active"),
            other => panic!("expected noop, got {other:?}"),
        }
    }

    #[test]
    fn halted_with_open_entry_cancels_first() {
        let env = envelope(1.1, 0.2);
        let gate = passing_gate(&env);
        let mut state = SymbolState::new("BTCUSDT");
        state.halted = true;
        state.has_open_entry_order = true;

        let actions = evaluate(&gate, &env, &state, &cfg());
        assert!(matches!(
            actions[0],
            DecisionAction::CancelOpenEntryOrders { .. }
        ));
        assert!(matches!(actions[1], DecisionAction::Noop { .. }));
    }

    #[test]
    fn long_reversal_exit_is_reduce_only_sell() {
        let env = envelope(-3.5, -0.6);
        let gate = passing_gate(&env);
        let mut state = SymbolState::new("BTCUSDT");
        state.position = Some(long_position(0.05, 0.05));

        let actions = evaluate(&gate, &env, &state, &cfg());
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            DecisionAction::ExitMarket {
                side,
                reduce_only,
                quantity,
                reason,
                ..
            } => {
                assert_eq!(*side, OrderSide::Sell);
                assert!(reduce_only);
                assert!((quantity - 2.5).abs() < 1e-12);
                assert_eq!(reason, "reversal_exit_long");
            }
            other => panic!("expected exit, got {other:?}"),
        }
    }

    #[test]
    fn profit_lock_drawdown_outranks_reversal() {
        let env = envelope(-3.5, -0.6);
        let gate = passing_gate(&env);
        let mut state = SymbolState::new("BTCUSDT");
        state.position = Some(long_position(0.25, 0.6));

        let actions = evaluate(&gate, &env, &state, &cfg());
        match &actions[0] {
            DecisionAction::ExitMarket { reason, .. } => {
                assert_eq!(reason, "profit_lock_drawdown");
            }
            other => panic!("expected exit, got {other:?}"),
        }
    }

    #[test]
    fn emergency_exit_requires_three_latency_samples() {
        let env = envelope(0.5, 0.0);
        let gate = passing_gate(&env);
        let mut state = SymbolState::new("BTCUSDT");
        state.position = Some(long_position(0.02, 0.02));
        state.exec_quality.poor = true;
        state.exec_quality.recent_latency_ms = vec![3_000, 3_100];

        let actions = evaluate(&gate, &env, &state, &cfg());
        assert!(matches!(actions[0], DecisionAction::Noop { .. }));

        state.exec_quality.recent_latency_ms.push(3_200);
        let actions = evaluate(&gate, &env, &state, &cfg());
        match &actions[0] {
            DecisionAction::ExitMarket { reason, .. } => {
                assert_eq!(reason, "exec_quality_emergency");
            }
            other => panic!("expected exit, got {other:?}"),
        }
    }

    #[test]
    fn winner_adds_until_cap_reached() {
        let env = envelope(1.5, 0.2);
        let gate = passing_gate(&env);
        let mut state = SymbolState::new("BTCUSDT");
        state.position = Some(long_position(0.15, 0.15));

        let actions = evaluate(&gate, &env, &state, &cfg());
        assert!(matches!(actions[0], DecisionAction::AddPosition { .. }));

        if let Some(position) = state.position.as_mut() {
            position.adds_used = 2;
        }
        let actions = evaluate(&gate, &env, &state, &cfg());
        assert!(matches!(actions[0], DecisionAction::Noop { .. }));
    }

    #[test]
    fn add_requires_matching_signal_direction() {
        let env = envelope(-1.5, 0.2);
        let gate = passing_gate(&env);
        let mut state = SymbolState::new("BTCUSDT");
        state.position = Some(long_position(0.15, 0.15));

        let actions = evaluate(&gate, &env, &state, &cfg());
        assert!(matches!(actions[0], DecisionAction::Noop { .. }));
    }

    #[test]
    fn cooldown_scales_with_violence_and_clamps() {
        let cfg = cfg();
        // 200 * (3.5 + 40/10) = 1500
        assert_eq!(cooldown_ms_after_exit(3.5, 40.0, &cfg), 1_500);
        assert_eq!(cooldown_ms_after_exit(0.0, 0.0, &cfg), 1_000);
        assert_eq!(cooldown_ms_after_exit(1_000.0, 0.0, &cfg), 60_000);
    }
}
