use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::connector::ExecutionEvent;
use crate::decision::{
    self, cooldown_ms_after_exit, DecisionAction, DecisionConfig, DecisionRecord, OpenOrder,
    Position, PositionSide, SymbolState,
};
use crate::gate::GateResult;
use crate::metrics::MetricsEnvelope;

const EXEC_QUALITY_RING_CAP: usize = 20;
const POOR_LATENCY_AVG_MS: f64 = 2_000.0;
const POOR_SLIPPAGE_AVG_BPS: f64 = 30.0;
const FLAT_POSITION_EPS: f64 = 1e-12;

/// Expected-price metadata captured by the orchestrator when an order was
/// sent; joined back onto TRADE_UPDATE events for latency and slippage.
#[derive(Debug, Clone, Copy)]
pub struct OrderMeta {
    pub sent_at_ms: u64,
    pub expected_price: f64,
    pub is_add: bool,
}

#[derive(Debug)]
pub enum ActorEnvelope {
    Metrics {
        envelope: MetricsEnvelope,
        gate: GateResult,
    },
    Execution {
        event: ExecutionEvent,
        order_meta: Option<OrderMeta>,
    },
    /// Capital settings changed; applied in queue order like any envelope.
    Reconfigure(DecisionConfig),
    Flush(oneshot::Sender<()>),
}

/// The orchestrator's side of an actor step. `on_record` receives every
/// decision; `on_actions` only fires when the list contains a non-noop;
/// `on_execution_applied` fires after an execution envelope mutated state.
/// All payloads are snapshots, never live references into the actor.
#[async_trait]
pub trait ActorSink: Send + Sync {
    async fn on_record(&self, record: DecisionRecord);
    async fn on_actions(&self, state: &SymbolState, actions: &[DecisionAction]);
    async fn on_execution_applied(&self, event: &ExecutionEvent, state: &SymbolState);
}

/// Synchronous core of a symbol actor: owns the SymbolState and applies
/// metrics and execution envelopes in strict arrival order. The async shell
/// around it guarantees single-flight processing.
#[derive(Debug)]
pub struct ActorCore {
    state: SymbolState,
    cfg: DecisionConfig,
    last_delta_z: f64,
    last_prints_per_second: f64,
}

impl ActorCore {
    pub fn new(symbol: impl Into<String>, cfg: DecisionConfig) -> Self {
        Self {
            state: SymbolState::new(symbol),
            cfg,
            last_delta_z: 0.0,
            last_prints_per_second: 0.0,
        }
    }

    pub fn state(&self) -> &SymbolState {
        &self.state
    }

    pub fn reconfigure(&mut self, cfg: DecisionConfig) {
        self.cfg = cfg;
    }

    pub fn handle_metrics(
        &mut self,
        envelope: &MetricsEnvelope,
        gate: &GateResult,
    ) -> (DecisionRecord, Vec<DecisionAction>) {
        if let Some(legacy) = envelope.legacy.as_ref() {
            self.last_delta_z = legacy.delta_z;
        }
        self.last_prints_per_second = envelope.prints_per_second;

        let actions = decision::evaluate(gate, envelope, &self.state, &self.cfg);
        let record = DecisionRecord {
            symbol: self.state.symbol.clone(),
            canonical_time_ms: envelope.canonical_time_ms,
            exchange_event_time_ms: envelope.exchange_event_time_ms,
            gate: *gate,
            actions: actions.clone(),
            state: self.state.clone(),
        };
        (record, actions)
    }

    pub fn handle_execution(&mut self, event: &ExecutionEvent, meta: Option<OrderMeta>) {
        match event {
            ExecutionEvent::SystemHalt { .. } => {
                self.state.halted = true;
            }
            ExecutionEvent::SystemResume { .. } => {
                self.state.halted = false;
            }
            ExecutionEvent::OrderUpdate {
                order_id,
                client_order_id,
                side,
                status,
                price,
                quantity,
                reduce_only,
                ..
            } => {
                if status.is_terminal() {
                    self.state.open_orders.remove(order_id);
                } else {
                    self.state.open_orders.insert(
                        *order_id,
                        OpenOrder {
                            order_id: *order_id,
                            client_order_id: client_order_id.clone(),
                            side: *side,
                            price: *price,
                            quantity: *quantity,
                            reduce_only: *reduce_only,
                        },
                    );
                }
                self.recompute_open_entry_flag();
            }
            ExecutionEvent::OpenOrdersSnapshot { orders, .. } => {
                self.state.open_orders =
                    orders.iter().map(|o| (o.order_id, o.clone())).collect();
                self.recompute_open_entry_flag();
            }
            ExecutionEvent::TradeUpdate {
                event_time_ms,
                fill_price,
                ..
            } => {
                if let Some(meta) = meta {
                    self.apply_fill_quality(*event_time_ms, *fill_price, meta);
                }
            }
            ExecutionEvent::AccountUpdate {
                event_time_ms,
                available_balance,
                wallet_balance,
                position_amt,
                entry_price,
                unrealized_pnl,
                ..
            } => {
                self.state.available_balance = *available_balance;
                self.state.wallet_balance = *wallet_balance;
                self.apply_position_update(
                    *event_time_ms,
                    *position_amt,
                    *entry_price,
                    *unrealized_pnl,
                );
            }
        }
    }

    fn recompute_open_entry_flag(&mut self) {
        self.state.has_open_entry_order = self
            .state
            .open_orders
            .values()
            .any(|order| !order.reduce_only);
    }

    fn apply_fill_quality(&mut self, event_time_ms: u64, fill_price: f64, meta: OrderMeta) {
        let latency_ms = event_time_ms.saturating_sub(meta.sent_at_ms);
        push_capped(
            &mut self.state.exec_quality.recent_latency_ms,
            latency_ms,
            EXEC_QUALITY_RING_CAP,
        );

        if meta.expected_price > 0.0 && fill_price.is_finite() {
            let slippage_bps =
                ((fill_price - meta.expected_price).abs() / meta.expected_price) * 10_000.0;
            push_capped(
                &mut self.state.exec_quality.recent_slippage_bps,
                slippage_bps,
                EXEC_QUALITY_RING_CAP,
            );
        }

        let avg_latency = average_u64(&self.state.exec_quality.recent_latency_ms);
        let avg_slippage = average_f64(&self.state.exec_quality.recent_slippage_bps);
        self.state.exec_quality.poor =
            avg_latency > POOR_LATENCY_AVG_MS || avg_slippage > POOR_SLIPPAGE_AVG_BPS;

        if meta.is_add {
            if let Some(position) = self.state.position.as_mut() {
                position.adds_used = (position.adds_used + 1).min(2);
            }
        }
    }

    fn apply_position_update(
        &mut self,
        event_time_ms: u64,
        position_amt: f64,
        entry_price: f64,
        unrealized_pnl: f64,
    ) {
        if position_amt.abs() <= FLAT_POSITION_EPS {
            if self.state.position.take().is_some() {
                self.state.last_exit_event_time_ms = Some(event_time_ms);
                let cooldown = cooldown_ms_after_exit(
                    self.last_delta_z,
                    self.last_prints_per_second,
                    &self.cfg,
                );
                self.state.cooldown_until_ms = event_time_ms.saturating_add(cooldown);
            }
            return;
        }

        let side = if position_amt > 0.0 {
            PositionSide::Long
        } else {
            PositionSide::Short
        };
        let qty = position_amt.abs();
        let notional = entry_price * qty;
        // Venue pnl arrives as signed USDT; the engine consumes the
        // entry-notional fraction.
        let unrealized_pnl_pct = if notional > 0.0 {
            unrealized_pnl / notional
        } else {
            0.0
        };

        match self.state.position.as_mut() {
            Some(position) => {
                position.side = side;
                position.qty = qty;
                position.entry_price = entry_price;
                position.unrealized_pnl_pct = unrealized_pnl_pct;
                position.peak_pnl_pct = position.peak_pnl_pct.max(unrealized_pnl_pct);
            }
            None => {
                self.state.position = Some(Position {
                    side,
                    qty,
                    entry_price,
                    unrealized_pnl_pct,
                    adds_used: 0,
                    peak_pnl_pct: unrealized_pnl_pct.max(0.0),
                });
            }
        }
    }
}

fn push_capped<T>(ring: &mut Vec<T>, value: T, cap: usize) {
    ring.push(value);
    if ring.len() > cap {
        ring.remove(0);
    }
}

fn average_u64(values: &[u64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<u64>() as f64 / values.len() as f64
}

fn average_f64(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

#[derive(Debug)]
pub struct ActorHandle {
    tx: mpsc::Sender<ActorEnvelope>,
    join: JoinHandle<()>,
}

impl ActorHandle {
    /// A cloneable sending side, usable outside any registry lock.
    pub fn sender(&self) -> ActorSender {
        ActorSender {
            tx: self.tx.clone(),
        }
    }

    pub async fn send(&self, envelope: ActorEnvelope) {
        if self.tx.send(envelope).await.is_err() {
            warn!("symbol actor queue closed; envelope dropped");
        }
    }

    /// Resolves once every envelope enqueued before it has been processed.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(ActorEnvelope::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub fn abort(&self) {
        self.join.abort();
    }
}

#[derive(Debug, Clone)]
pub struct ActorSender {
    tx: mpsc::Sender<ActorEnvelope>,
}

impl ActorSender {
    pub async fn send(&self, envelope: ActorEnvelope) {
        if self.tx.send(envelope).await.is_err() {
            warn!("symbol actor queue closed; envelope dropped");
        }
    }

    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(ActorEnvelope::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// One task per symbol, consuming a FIFO channel: per-symbol serialization
/// of state mutation holds by construction. The task does not pick up the
/// next envelope until the sink calls for the current one have returned.
pub fn spawn_symbol_actor(
    symbol: impl Into<String>,
    cfg: DecisionConfig,
    sink: Arc<dyn ActorSink>,
    queue_buffer: usize,
) -> ActorHandle {
    let symbol = symbol.into();
    let (tx, mut rx) = mpsc::channel(queue_buffer.max(1));

    let join = tokio::spawn(async move {
        let mut core = ActorCore::new(symbol, cfg);
        while let Some(envelope) = rx.recv().await {
            match envelope {
                ActorEnvelope::Metrics { envelope, gate } => {
                    let (record, actions) = core.handle_metrics(&envelope, &gate);
                    sink.on_record(record).await;
                    if actions.iter().any(|a| !a.is_noop()) {
                        sink.on_actions(core.state(), &actions).await;
                    }
                }
                ActorEnvelope::Execution { event, order_meta } => {
                    core.handle_execution(&event, order_meta);
                    sink.on_execution_applied(&event, core.state()).await;
                }
                ActorEnvelope::Reconfigure(cfg) => {
                    core.reconfigure(cfg);
                }
                ActorEnvelope::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }
    });

    ActorHandle { tx, join }
}

#[cfg(test)]
mod tests {
    use super::{ActorCore, OrderMeta};
    use crate::connector::{ExecutionEvent, OrderStatus};
    use crate::decision::{DecisionConfig, OpenOrder, OrderSide, PositionSide};

    fn cfg() -> DecisionConfig {
        DecisionConfig {
            initial_margin_usdt: 50.0,
            max_leverage: 5.0,
            cooldown_min_ms: 1_000,
            cooldown_max_ms: 60_000,
        }
    }

    fn order_update(order_id: u64, status: OrderStatus, reduce_only: bool) -> ExecutionEvent {
        ExecutionEvent::OrderUpdate {
            symbol: "BTCUSDT".to_string(),
            event_time_ms: 1_000,
            order_id,
            client_order_id: None,
            side: OrderSide::Buy,
            status,
            price: 100.0,
            quantity: 1.0,
            reduce_only,
        }
    }

    fn account_update(amt: f64, entry: f64, upnl: f64, ts: u64) -> ExecutionEvent {
        ExecutionEvent::AccountUpdate {
            symbol: "BTCUSDT".to_string(),
            event_time_ms: ts,
            available_balance: 900.0,
            wallet_balance: 1_000.0,
            position_amt: amt,
            entry_price: entry,
            unrealized_pnl: upnl,
        }
    }

    #[test]
    fn halt_and_resume_toggle_state() {
        let mut core = ActorCore::new("BTCUSDT", cfg());
        core.handle_execution(
            &ExecutionEvent::SystemHalt {
                symbol: "BTCUSDT".to_string(),
                event_time_ms: 1,
                reason: "test".to_string(),
            },
            None,
        );
        assert!(core.state().halted);

        core.handle_execution(
            &ExecutionEvent::SystemResume {
                symbol: "BTCUSDT".to_string(),
                event_time_ms: 2,
            },
            None,
        );
        assert!(!core.state().halted);
    }

    #[test]
    fn terminal_order_updates_remove_and_recompute_entry_flag() {
        let mut core = ActorCore::new("BTCUSDT", cfg());

        core.handle_execution(&order_update(1, OrderStatus::New, false), None);
        assert!(core.state().has_open_entry_order);
        assert_eq!(core.state().open_orders.len(), 1);

        core.handle_execution(&order_update(2, OrderStatus::New, true), None);
        assert_eq!(core.state().open_orders.len(), 2);

        core.handle_execution(&order_update(1, OrderStatus::Filled, false), None);
        assert_eq!(core.state().open_orders.len(), 1);
        assert!(!core.state().has_open_entry_order);
    }

    #[test]
    fn open_orders_snapshot_replaces_atomically() {
        let mut core = ActorCore::new("BTCUSDT", cfg());
        core.handle_execution(&order_update(1, OrderStatus::New, false), None);

        core.handle_execution(
            &ExecutionEvent::OpenOrdersSnapshot {
                symbol: "BTCUSDT".to_string(),
                event_time_ms: 5,
                orders: vec![OpenOrder {
                    order_id: 9,
                    client_order_id: None,
                    side: OrderSide::Sell,
                    price: 101.0,
                    quantity: 0.5,
                    reduce_only: true,
                }],
            },
            None,
        );

        assert_eq!(core.state().open_orders.len(), 1);
        assert!(core.state().open_orders.contains_key(&9));
        assert!(!core.state().has_open_entry_order);
    }

    #[test]
    fn fill_quality_rings_cap_and_flag_poor() {
        let mut core = ActorCore::new("BTCUSDT", cfg());
        let meta = OrderMeta {
            sent_at_ms: 0,
            expected_price: 100.0,
            is_add: false,
        };

        for i in 0..25u64 {
            core.handle_execution(
                &ExecutionEvent::TradeUpdate {
                    symbol: "BTCUSDT".to_string(),
                    event_time_ms: 3_000 + i,
                    order_id: i,
                    fill_price: 100.05,
                    fill_qty: 1.0,
                    realized_pnl: 0.0,
                },
                Some(meta),
            );
        }

        let quality = &core.state().exec_quality;
        assert_eq!(quality.recent_latency_ms.len(), 20);
        assert_eq!(quality.recent_slippage_bps.len(), 20);
        // ~3s ack latency on every fill.
        assert!(quality.poor);
    }

    #[test]
    fn add_tagged_fill_bumps_adds_used_to_cap() {
        let mut core = ActorCore::new("BTCUSDT", cfg());
        core.handle_execution(&account_update(1.0, 100.0, 0.0, 1_000), None);

        let meta = OrderMeta {
            sent_at_ms: 900,
            expected_price: 100.0,
            is_add: true,
        };
        for i in 0..3u64 {
            core.handle_execution(
                &ExecutionEvent::TradeUpdate {
                    symbol: "BTCUSDT".to_string(),
                    event_time_ms: 1_000 + i,
                    order_id: i,
                    fill_price: 100.0,
                    fill_qty: 1.0,
                    realized_pnl: 0.0,
                },
                Some(meta),
            );
        }

        let position = core.state().position.as_ref().expect("position open");
        assert_eq!(position.adds_used, 2);
    }

    #[test]
    fn position_open_update_and_peak_ratchet() {
        let mut core = ActorCore::new("BTCUSDT", cfg());

        core.handle_execution(&account_update(2.0, 100.0, 10.0, 1_000), None);
        let position = core.state().position.as_ref().expect("position open");
        assert_eq!(position.side, PositionSide::Long);
        // 10 USDT on 200 notional = 5%.
        assert!((position.unrealized_pnl_pct - 0.05).abs() < 1e-12);
        assert!((position.peak_pnl_pct - 0.05).abs() < 1e-12);

        core.handle_execution(&account_update(2.0, 100.0, 40.0, 2_000), None);
        let position = core.state().position.as_ref().expect("position open");
        assert!((position.peak_pnl_pct - 0.20).abs() < 1e-12);

        core.handle_execution(&account_update(2.0, 100.0, 4.0, 3_000), None);
        let position = core.state().position.as_ref().expect("position open");
        assert!((position.unrealized_pnl_pct - 0.02).abs() < 1e-12);
        assert!((position.peak_pnl_pct - 0.20).abs() < 1e-12);
    }

    #[test]
    fn flat_account_update_records_exit_and_arms_cooldown() {
        let mut core = ActorCore::new("BTCUSDT", cfg());
        core.handle_execution(&account_update(1.0, 100.0, 0.0, 1_000), None);

        // Cache violence context the way a metrics envelope would.
        core.last_delta_z = 3.5;
        core.last_prints_per_second = 40.0;

        core.handle_execution(&account_update(0.0, 0.0, 0.0, 5_000), None);
        assert!(core.state().position.is_none());
        assert_eq!(core.state().last_exit_event_time_ms, Some(5_000));
        // clamp(200 * (3.5 + 4.0)) = 1500.
        assert_eq!(core.state().cooldown_until_ms, 6_500);
    }

    #[test]
    fn flat_update_without_position_is_ignored() {
        let mut core = ActorCore::new("BTCUSDT", cfg());
        core.handle_execution(&account_update(0.0, 0.0, 0.0, 5_000), None);
        assert_eq!(core.state().cooldown_until_ms, 0);
        assert_eq!(core.state().last_exit_event_time_ms, None);
    }
}
