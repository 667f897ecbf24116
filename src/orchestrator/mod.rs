use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::actor::{
    spawn_symbol_actor, ActorEnvelope, ActorHandle, ActorSender, ActorSink, OrderMeta,
};
use crate::connector::{
    ExecutionConnector, ExecutionEvent, OrderType, PlaceOrderRequest,
};
use crate::decision::{DecisionAction, DecisionConfig, DecisionRecord, OrderSide, SymbolState};
use crate::gate::{self, GateConfig, GateResult};
use crate::logger::{LogKind, OrchestratorLogger};
use crate::metrics::MetricsEnvelope;
use crate::util::now_millis;

const ACTOR_QUEUE_BUFFER: usize = 1_024;

/// One line of the metrics JSONL stream. Replay accepts lines with or
/// without the `gate` field; the latter are re-gated on ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsLogLine {
    pub canonical_time_ms: u64,
    pub exchange_event_time_ms: u64,
    pub symbol: String,
    #[serde(default)]
    pub gate: Option<GateResult>,
    #[serde(default)]
    pub metrics: Option<MetricsEnvelope>,
}

/// One line of the execution JSONL stream: the raw venue event plus the
/// state projection after it was applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogLine {
    pub event_time_ms: u64,
    pub symbol: String,
    pub event: ExecutionEvent,
    pub state: SymbolState,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub gate: GateConfig,
    pub decision: DecisionConfig,
    pub execution_enabled: bool,
}

struct Inner {
    cfg: OrchestratorConfig,
    /// The one mutable piece of decision config; everything else is frozen
    /// at construction. Changes fan out to actors as envelopes.
    capital: RwLock<DecisionConfig>,
    connector: Arc<dyn ExecutionConnector>,
    logger: OrchestratorLogger,
    actors: Mutex<HashMap<String, ActorHandle>>,
    /// Empty set = accept every observed symbol.
    execution_symbols: RwLock<BTreeSet<String>>,
    order_meta: Mutex<HashMap<u64, (String, OrderMeta)>>,
    ledger: Mutex<Vec<DecisionRecord>>,
    latest_states: Mutex<BTreeMap<String, SymbolState>>,
    realized_pnl: Mutex<BTreeMap<String, f64>>,
    connected: AtomicBool,
    weak_self: Weak<Inner>,
}

/// Owns the per-symbol actors and everything they report into: the decision
/// ledger, the order metadata joined onto fills, the realized-pnl tally and
/// the three log streams. Communicates with actors by message only.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        connector: Arc<dyn ExecutionConnector>,
        logger: OrchestratorLogger,
        cfg: OrchestratorConfig,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak| Inner {
            capital: RwLock::new(cfg.decision),
            cfg,
            connector,
            logger,
            actors: Mutex::new(HashMap::new()),
            execution_symbols: RwLock::new(BTreeSet::new()),
            order_meta: Mutex::new(HashMap::new()),
            ledger: Mutex::new(Vec::new()),
            latest_states: Mutex::new(BTreeMap::new()),
            realized_pnl: Mutex::new(BTreeMap::new()),
            connected: AtomicBool::new(false),
            weak_self: weak.clone(),
        });
        Self { inner }
    }

    pub fn set_connected(&self, connected: bool) {
        self.inner.connected.store(connected, AtomicOrdering::SeqCst);
    }

    /// Updates probe sizing inputs at runtime. Existing actors pick the new
    /// values up through their queue, after everything already enqueued.
    pub async fn set_capital_settings(&self, initial_margin_usdt: f64, max_leverage: f64) {
        let updated = {
            let mut capital = self.inner.capital.write().await;
            capital.initial_margin_usdt = initial_margin_usdt;
            capital.max_leverage = max_leverage;
            *capital
        };

        let senders: Vec<ActorSender> = {
            let actors = self.inner.actors.lock().await;
            actors.values().map(ActorHandle::sender).collect()
        };
        for sender in senders {
            sender.send(ActorEnvelope::Reconfigure(updated)).await;
        }
        info!(initial_margin_usdt, max_leverage, "capital settings updated");
    }

    /// Live path: gate, log the metrics line, hand to the symbol's actor.
    pub async fn ingest(&self, envelope: MetricsEnvelope) {
        if !self.symbol_allowed(&envelope.symbol).await {
            return;
        }

        let gate = gate::evaluate(&envelope, &self.inner.cfg.gate);
        self.log_metrics_line(&envelope, &gate);
        self.enqueue_metrics(envelope, gate).await;
    }

    /// Replay path for lines that already carry their gate result; nothing
    /// is re-gated and nothing is re-logged.
    pub async fn ingest_logged_metrics(&self, envelope: MetricsEnvelope, gate: GateResult) {
        if !self.symbol_allowed(&envelope.symbol).await {
            return;
        }
        self.enqueue_metrics(envelope, gate).await;
    }

    /// Venue push events: accumulate realized pnl, join order metadata, and
    /// forward to the owning actor.
    pub async fn handle_execution_event(&self, event: ExecutionEvent) {
        let symbol = event.symbol().to_string();
        if !self.symbol_allowed(&symbol).await {
            return;
        }

        if let ExecutionEvent::TradeUpdate {
            realized_pnl,
            ..
        } = &event
        {
            if *realized_pnl != 0.0 {
                let mut tally = self.inner.realized_pnl.lock().await;
                *tally.entry(symbol.clone()).or_insert(0.0) += realized_pnl;
            }
        }

        let order_meta = match &event {
            ExecutionEvent::TradeUpdate { order_id, .. } => {
                let metas = self.inner.order_meta.lock().await;
                metas.get(order_id).map(|(_, meta)| *meta)
            }
            _ => None,
        };

        let actor = self.ensure_actor(&symbol).await;
        actor
            .send(ActorEnvelope::Execution { event, order_meta })
            .await;
    }

    /// Replay path for logged execution events; identical state semantics.
    pub async fn ingest_execution_replay(&self, event: ExecutionEvent) {
        self.handle_execution_event(event).await;
    }

    /// Consumes the connector's push stream until it closes.
    pub fn spawn_execution_pump(
        &self,
        mut events_rx: mpsc::Receiver<ExecutionEvent>,
    ) -> JoinHandle<()> {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                orchestrator.handle_execution_event(event).await;
            }
            info!("execution event stream closed");
        })
    }

    /// Consumes logger drop-spike signals, halting every live actor.
    pub fn spawn_logger_halt_watcher(&self, mut halt_rx: mpsc::Receiver<u64>) -> JoinHandle<()> {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            while let Some(dropped) = halt_rx.recv().await {
                orchestrator
                    .system_halt_all(&format!("logger_drop_spike:{dropped}"))
                    .await;
            }
        })
    }

    pub async fn system_halt_all(&self, reason: &str) {
        let symbols: Vec<String> = {
            let actors = self.inner.actors.lock().await;
            actors.keys().cloned().collect()
        };
        let event_time_ms = now_millis();
        warn!(reason, symbols = symbols.len(), "halting all symbols");
        for symbol in symbols {
            self.handle_execution_event(ExecutionEvent::SystemHalt {
                symbol,
                event_time_ms,
                reason: reason.to_string(),
            })
            .await;
        }
    }

    pub async fn system_resume_all(&self) {
        let symbols: Vec<String> = {
            let actors = self.inner.actors.lock().await;
            actors.keys().cloned().collect()
        };
        let event_time_ms = now_millis();
        for symbol in symbols {
            self.handle_execution_event(ExecutionEvent::SystemResume {
                symbol,
                event_time_ms,
            })
            .await;
        }
    }

    /// Replaces the traded-symbol universe: dropped symbols get their open
    /// orders canceled and their actor discarded; added symbols get an actor
    /// up front; the connector then refreshes subscriptions and re-syncs.
    pub async fn set_execution_symbols(&self, new_symbols: BTreeSet<String>) {
        let old_symbols = {
            let guard = self.inner.execution_symbols.read().await;
            guard.clone()
        };

        for symbol in old_symbols.difference(&new_symbols) {
            if let Err(error) = self.inner.connector.cancel_all_open_orders(symbol).await {
                warn!(symbol = %symbol, error = %error, "cancel on symbol drop failed");
            }
            let mut actors = self.inner.actors.lock().await;
            if let Some(actor) = actors.remove(symbol) {
                actor.flush().await;
                actor.abort();
            }
            self.inner.realized_pnl.lock().await.remove(symbol);
            self.inner.latest_states.lock().await.remove(symbol);
            let mut metas = self.inner.order_meta.lock().await;
            metas.retain(|_, (meta_symbol, _)| meta_symbol != symbol);
        }

        *self.inner.execution_symbols.write().await = new_symbols.clone();

        for symbol in &new_symbols {
            self.ensure_actor(symbol).await;
        }

        self.inner
            .connector
            .set_tracked_symbols(new_symbols.clone())
            .await;
        if let Err(error) = self.inner.connector.sync_state().await {
            warn!(error = %error, "state sync after symbol change failed");
        }
        info!(symbols = ?new_symbols, "execution symbols updated");
    }

    /// Waits until every actor has drained its queue.
    pub async fn flush(&self) {
        let handles: Vec<String> = {
            let actors = self.inner.actors.lock().await;
            actors.keys().cloned().collect()
        };
        for symbol in handles {
            let actor = {
                let actors = self.inner.actors.lock().await;
                actors.get(&symbol).map(|a| a.sender())
            };
            if let Some(actor) = actor {
                actor.flush().await;
            }
        }
    }

    pub async fn reset_for_replay(&self) {
        let mut actors = self.inner.actors.lock().await;
        for (_, actor) in actors.drain() {
            actor.abort();
        }
        drop(actors);

        self.inner.order_meta.lock().await.clear();
        self.inner.ledger.lock().await.clear();
        self.inner.latest_states.lock().await.clear();
        self.inner.realized_pnl.lock().await.clear();
    }

    pub async fn decision_ledger(&self) -> Vec<DecisionRecord> {
        self.inner.ledger.lock().await.clone()
    }

    pub async fn final_states(&self) -> BTreeMap<String, SymbolState> {
        self.inner.latest_states.lock().await.clone()
    }

    pub async fn realized_pnl(&self) -> BTreeMap<String, f64> {
        self.inner.realized_pnl.lock().await.clone()
    }

    async fn symbol_allowed(&self, symbol: &str) -> bool {
        let allowed = self.inner.execution_symbols.read().await;
        allowed.is_empty() || allowed.contains(symbol)
    }

    async fn enqueue_metrics(&self, envelope: MetricsEnvelope, gate: GateResult) {
        let actor = self.ensure_actor(&envelope.symbol).await;
        actor.send(ActorEnvelope::Metrics { envelope, gate }).await;
    }

    async fn ensure_actor(&self, symbol: &str) -> ActorSender {
        let mut actors = self.inner.actors.lock().await;
        if let Some(actor) = actors.get(symbol) {
            return actor.sender();
        }

        let sink = Arc::new(OrchestratorSink {
            inner: self.inner.weak_self.clone(),
        });
        let decision_cfg = *self.inner.capital.read().await;
        let handle = spawn_symbol_actor(symbol, decision_cfg, sink, ACTOR_QUEUE_BUFFER);
        let sender = handle.sender();
        actors.insert(symbol.to_string(), handle);
        info!(symbol, "symbol actor started");
        sender
    }

    fn log_metrics_line(&self, envelope: &MetricsEnvelope, gate: &GateResult) {
        let line = MetricsLogLine {
            canonical_time_ms: envelope.canonical_time_ms,
            exchange_event_time_ms: envelope.exchange_event_time_ms,
            symbol: envelope.symbol.clone(),
            gate: Some(*gate),
            metrics: Some(envelope.clone()),
        };
        match serde_json::to_value(&line) {
            Ok(value) => {
                self.inner
                    .logger
                    .enqueue(LogKind::Metrics, envelope.exchange_event_time_ms, value);
            }
            Err(error) => warn!(error = %error, "metrics line serialization failed"),
        }
    }
}

struct OrchestratorSink {
    inner: Weak<Inner>,
}

#[async_trait]
impl ActorSink for OrchestratorSink {
    async fn on_record(&self, record: DecisionRecord) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };

        inner
            .latest_states
            .lock()
            .await
            .insert(record.symbol.clone(), record.state.clone());

        match serde_json::to_value(&record) {
            Ok(value) => {
                inner
                    .logger
                    .enqueue(LogKind::Decision, record.exchange_event_time_ms, value);
            }
            Err(error) => warn!(error = %error, "decision record serialization failed"),
        }

        inner.ledger.lock().await.push(record);
    }

    async fn on_actions(&self, state: &SymbolState, actions: &[DecisionAction]) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        execute_actions(&inner, state, actions).await;
    }

    async fn on_execution_applied(&self, event: &ExecutionEvent, state: &SymbolState) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };

        inner
            .latest_states
            .lock()
            .await
            .insert(state.symbol.clone(), state.clone());

        let line = ExecutionLogLine {
            event_time_ms: event.event_time_ms(),
            symbol: state.symbol.clone(),
            event: event.clone(),
            state: state.clone(),
        };
        match serde_json::to_value(&line) {
            Ok(value) => {
                inner
                    .logger
                    .enqueue(LogKind::Execution, line.event_time_ms, value);
            }
            Err(error) => warn!(error = %error, "execution line serialization failed"),
        }
    }
}

/// Serializes the action list into connector calls. A failed call is logged
/// and never retried; later decisions see the resulting state and react.
async fn execute_actions(inner: &Arc<Inner>, state: &SymbolState, actions: &[DecisionAction]) {
    if !inner.cfg.execution_enabled || !inner.connected.load(AtomicOrdering::SeqCst) {
        return;
    }

    for action in actions {
        match action {
            DecisionAction::Noop { .. } => {}
            DecisionAction::EntryProbe {
                symbol,
                side,
                quantity,
                expected_price,
                ..
            }
            | DecisionAction::AddPosition {
                symbol,
                side,
                quantity,
                expected_price,
                ..
            } => {
                let is_add = matches!(action, DecisionAction::AddPosition { .. });
                submit_market_order(
                    inner,
                    symbol,
                    *side,
                    *quantity,
                    false,
                    *expected_price,
                    is_add,
                    action.reason(),
                )
                .await;
            }
            DecisionAction::ExitMarket {
                symbol,
                side,
                quantity,
                expected_price,
                ..
            } => {
                submit_market_order(
                    inner,
                    symbol,
                    *side,
                    *quantity,
                    true,
                    *expected_price,
                    false,
                    action.reason(),
                )
                .await;
            }
            DecisionAction::CancelOpenEntryOrders { symbol, .. } => {
                for order in state.open_orders.values().filter(|o| !o.reduce_only) {
                    if let Err(error) = inner
                        .connector
                        .cancel_order(symbol, Some(order.order_id), None)
                        .await
                    {
                        warn!(
                            symbol = %symbol,
                            order_id = order.order_id,
                            error = %error,
                            "cancel entry order failed"
                        );
                    }
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn submit_market_order(
    inner: &Arc<Inner>,
    symbol: &str,
    side: OrderSide,
    quantity: f64,
    reduce_only: bool,
    expected_price: f64,
    is_add: bool,
    reason: &str,
) {
    let request = PlaceOrderRequest {
        symbol: symbol.to_string(),
        side,
        order_type: OrderType::Market,
        quantity,
        price: None,
        reduce_only,
        client_order_id: None,
    };

    match inner.connector.place_order(request).await {
        Ok(placed) => {
            info!(
                symbol,
                order_id = placed.order_id,
                reason,
                reduce_only,
                quantity,
                "order submitted"
            );
            let mut metas = inner.order_meta.lock().await;
            metas.insert(
                placed.order_id,
                (
                    symbol.to_string(),
                    OrderMeta {
                        sent_at_ms: now_millis(),
                        expected_price,
                        is_add,
                    },
                ),
            );
        }
        Err(error) => {
            warn!(symbol, reason, error = %error, "order submission failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use super::{Orchestrator, OrchestratorConfig};
    use crate::connector::{ExecutionEvent, MockConnector};
    use crate::decision::DecisionConfig;
    use crate::gate::{GateConfig, GateMode};
    use crate::logger::OrchestratorLogger;
    use crate::metrics::{LegacyMetricsSnapshot, MetricsEnvelope};

    fn test_logger(tag: &str) -> OrchestratorLogger {
        let dir = std::env::temp_dir().join(format!(
            "orderflow-orch-{tag}-{}",
            std::process::id()
        ));
        let settings = toml::from_str("").expect("default logger settings");
        let (logger, _halt_rx, _runtime) = OrchestratorLogger::spawn(dir, &settings);
        logger
    }

    fn orchestrator(tag: &str, execution_enabled: bool) -> (Orchestrator, Arc<MockConnector>) {
        let connector = Arc::new(MockConnector::default());
        let cfg = OrchestratorConfig {
            gate: GateConfig {
                mode: GateMode::V1NoLatency,
                max_spread_pct: 0.08,
                min_obi_deep: 0.05,
                max_network_latency_ms: 100,
            },
            decision: DecisionConfig {
                initial_margin_usdt: 50.0,
                max_leverage: 5.0,
                cooldown_min_ms: 1_000,
                cooldown_max_ms: 60_000,
            },
            execution_enabled,
        };
        let orchestrator = Orchestrator::new(connector.clone(), test_logger(tag), cfg);
        (orchestrator, connector)
    }

    fn envelope(symbol: &str, canonical: u64, delta_z: f64) -> MetricsEnvelope {
        MetricsEnvelope {
            symbol: symbol.to_string(),
            canonical_time_ms: canonical,
            exchange_event_time_ms: canonical,
            spread_pct: 0.01,
            prints_per_second: 4.0,
            best_bid: 100.0,
            best_ask: 100.1,
            legacy: Some(LegacyMetricsSnapshot {
                obi_weighted: 0.2,
                obi_deep: 0.3,
                obi_divergence: -0.1,
                delta_z,
                cvd_slope: 0.2,
                oi_delta: None,
            }),
        }
    }

    #[tokio::test]
    async fn ingest_builds_ledger_in_order() {
        let (orchestrator, _connector) = orchestrator("ledger", false);

        for i in 0..5u64 {
            orchestrator
                .ingest(envelope("BTCUSDT", 1_000 + i, 0.0))
                .await;
        }
        orchestrator.flush().await;

        let ledger = orchestrator.decision_ledger().await;
        assert_eq!(ledger.len(), 5);
        let times: Vec<u64> = ledger.iter().map(|r| r.canonical_time_ms).collect();
        let mut sorted = times.clone();
        sorted.sort_unstable();
        assert_eq!(times, sorted);
    }

    #[tokio::test]
    async fn execution_symbol_filter_drops_foreign_metrics() {
        let (orchestrator, _connector) = orchestrator("filter", false);
        orchestrator
            .set_execution_symbols(BTreeSet::from(["ETHUSDT".to_string()]))
            .await;

        orchestrator.ingest(envelope("BTCUSDT", 1_000, 0.0)).await;
        orchestrator.ingest(envelope("ETHUSDT", 1_001, 0.0)).await;
        orchestrator.flush().await;

        let ledger = orchestrator.decision_ledger().await;
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].symbol, "ETHUSDT");
    }

    #[tokio::test]
    async fn entry_probe_reaches_connector_when_enabled() {
        let (orchestrator, connector) = orchestrator("exec", true);
        orchestrator.set_connected(true);

        orchestrator.ingest(envelope("BTCUSDT", 1_000, 1.5)).await;
        orchestrator.flush().await;

        let placed = connector.placed.lock().await;
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].symbol, "BTCUSDT");
        assert!(!placed[0].reduce_only);
    }

    #[tokio::test]
    async fn capital_settings_update_resizes_later_probes() {
        let (orchestrator, connector) = orchestrator("capital", true);
        orchestrator.set_connected(true);

        orchestrator.ingest(envelope("BTCUSDT", 1_000, 1.5)).await;
        orchestrator.flush().await;
        orchestrator.set_capital_settings(100.0, 10.0).await;
        orchestrator.ingest(envelope("BTCUSDT", 2_000, 1.5)).await;
        orchestrator.flush().await;

        let placed = connector.placed.lock().await;
        assert_eq!(placed.len(), 2);
        // 50*5/100.1 then 100*10/100.1, both rounded to 6 decimals.
        assert!((placed[0].quantity - 2.497502).abs() < 1e-9);
        assert!((placed[1].quantity - 9.990010).abs() < 1e-9);
    }

    #[tokio::test]
    async fn execution_disabled_keeps_decisions_but_no_orders() {
        let (orchestrator, connector) = orchestrator("noexec", false);
        orchestrator.set_connected(true);

        orchestrator.ingest(envelope("BTCUSDT", 1_000, 1.5)).await;
        orchestrator.flush().await;

        assert_eq!(orchestrator.decision_ledger().await.len(), 1);
        assert!(connector.placed.lock().await.is_empty());
    }

    #[tokio::test]
    async fn dropped_symbol_gets_orders_canceled_and_state_discarded() {
        let (orchestrator, connector) = orchestrator("drop", false);
        orchestrator
            .set_execution_symbols(BTreeSet::from([
                "BTCUSDT".to_string(),
                "ETHUSDT".to_string(),
            ]))
            .await;
        orchestrator.ingest(envelope("BTCUSDT", 1_000, 0.0)).await;
        orchestrator.flush().await;

        orchestrator
            .set_execution_symbols(BTreeSet::from(["ETHUSDT".to_string()]))
            .await;

        assert_eq!(
            connector.canceled_all.lock().await.as_slice(),
            ["BTCUSDT".to_string()]
        );
        assert!(!orchestrator.final_states().await.contains_key("BTCUSDT"));
    }

    #[tokio::test]
    async fn realized_pnl_accumulates_per_symbol() {
        let (orchestrator, _connector) = orchestrator("pnl", false);

        for pnl in [1.5, -0.5] {
            orchestrator
                .handle_execution_event(ExecutionEvent::TradeUpdate {
                    symbol: "BTCUSDT".to_string(),
                    event_time_ms: 1_000,
                    order_id: 7,
                    fill_price: 100.0,
                    fill_qty: 1.0,
                    realized_pnl: pnl,
                })
                .await;
        }
        orchestrator.flush().await;

        let tally = orchestrator.realized_pnl().await;
        assert!((tally["BTCUSDT"] - 1.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn halt_all_reaches_every_actor() {
        let (orchestrator, _connector) = orchestrator("halt", false);
        orchestrator.ingest(envelope("BTCUSDT", 1_000, 0.0)).await;
        orchestrator.ingest(envelope("ETHUSDT", 1_000, 0.0)).await;
        orchestrator.flush().await;

        orchestrator.system_halt_all("logger_drop_spike:250").await;
        orchestrator.flush().await;

        let states = orchestrator.final_states().await;
        assert!(states["BTCUSDT"].halted);
        assert!(states["ETHUSDT"].halted);

        orchestrator.system_resume_all().await;
        orchestrator.flush().await;
        let states = orchestrator.final_states().await;
        assert!(!states["BTCUSDT"].halted);
    }

    #[tokio::test]
    async fn reset_for_replay_clears_everything() {
        let (orchestrator, _connector) = orchestrator("reset", false);
        orchestrator.ingest(envelope("BTCUSDT", 1_000, 0.0)).await;
        orchestrator.flush().await;
        assert!(!orchestrator.decision_ledger().await.is_empty());

        orchestrator.reset_for_replay().await;
        assert!(orchestrator.decision_ledger().await.is_empty());
        assert!(orchestrator.final_states().await.is_empty());
    }
}
