use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::metrics::{LegacyMetrics, MetricsEnvelope};
use crate::orchestrator::Orchestrator;
use crate::orderbook::BookState;
use crate::tape::{AbsorptionDetector, CvdEngine, TradeTape};
use crate::util::now_millis;

const CLIENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastReason {
    Trade,
    Depth,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<String>,
}

#[derive(Default)]
struct HubInner {
    subscribers: RwLock<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

/// Fan-out hub for `/ws?symbols=S1,S2` clients. Slow clients lose messages
/// rather than stalling the pipeline.
#[derive(Clone, Default)]
pub struct WsHub {
    inner: Arc<HubInner>,
}

impl WsHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn publish(&self, symbol: &str, payload: &str) {
        let mut closed: Vec<u64> = Vec::new();
        {
            let subscribers = self.inner.subscribers.read().await;
            let Some(list) = subscribers.get(symbol) else {
                return;
            };
            for subscriber in list {
                match subscriber.tx.try_send(payload.to_string()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(symbol, subscriber = subscriber.id, "slow ws client; dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(subscriber.id),
                }
            }
        }

        if !closed.is_empty() {
            let mut subscribers = self.inner.subscribers.write().await;
            if let Some(list) = subscribers.get_mut(symbol) {
                list.retain(|s| !closed.contains(&s.id));
            }
        }
    }

    async fn subscribe(&self, symbols: &[String]) -> (u64, mpsc::Receiver<String>) {
        let id = self.inner.next_id.fetch_add(1, AtomicOrdering::Relaxed);
        let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
        let mut subscribers = self.inner.subscribers.write().await;
        for symbol in symbols {
            subscribers
                .entry(symbol.to_uppercase())
                .or_default()
                .push(Subscriber {
                    id,
                    tx: tx.clone(),
                });
        }
        (id, rx)
    }

    async fn unsubscribe(&self, id: u64) {
        let mut subscribers = self.inner.subscribers.write().await;
        for list in subscribers.values_mut() {
            list.retain(|s| s.id != id);
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        let subscribers = self.inner.subscribers.read().await;
        subscribers.values().map(Vec::len).sum()
    }

    /// Accept loop for websocket clients; runs until the process exits.
    pub fn spawn_server(&self, bind_addr: String) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let listener = match TcpListener::bind(bind_addr.as_str()).await {
                Ok(listener) => listener,
                Err(error) => {
                    warn!(error = %error, bind_addr = %bind_addr, "ws server bind failed");
                    return;
                }
            };
            info!(bind_addr = %bind_addr, "ws fan-out listening");

            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(error) => {
                        warn!(error = %error, "ws accept failed");
                        continue;
                    }
                };
                let hub = hub.clone();
                tokio::spawn(async move {
                    if let Err(error) = hub.serve_client(stream).await {
                        debug!(peer = %peer, error = %error, "ws client closed");
                    }
                });
            }
        })
    }

    async fn serve_client(
        &self,
        stream: tokio::net::TcpStream,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let mut requested: Vec<String> = Vec::new();
        let socket = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                requested = parse_symbols_query(request.uri().query());
                Ok(response)
            },
        )
        .await?;

        if requested.is_empty() {
            return Ok(());
        }

        let (id, mut rx) = self.subscribe(&requested).await;
        let (mut sink, mut source) = socket.split();

        loop {
            tokio::select! {
                maybe_payload = rx.recv() => {
                    let Some(payload) = maybe_payload else { break };
                    if sink.send(Message::Text(payload)).await.is_err() {
                        break;
                    }
                }
                maybe_msg = source.next() => {
                    match maybe_msg {
                        Some(Ok(msg)) if msg.is_ping() => {
                            if sink.send(Message::Pong(msg.into_data())).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(msg)) if msg.is_close() => break,
                        Some(Ok(_)) => {}
                        Some(Err(_)) | None => break,
                    }
                }
            }
        }

        self.unsubscribe(id).await;
        Ok(())
    }
}

fn parse_symbols_query(query: Option<&str>) -> Vec<String> {
    let Some(query) = query else {
        return Vec::new();
    };
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "symbols")
        .map(|(_, value)| {
            value
                .split(',')
                .filter(|s| !s.is_empty())
                .map(|s| s.to_uppercase())
                .collect()
        })
        .unwrap_or_default()
}

/// Throttled emitter sitting between the ingestion pipeline and both
/// consumers of metric snapshots: websocket clients and the orchestrator.
pub struct BroadcastGate {
    throttle_ms: u64,
    depth_levels: usize,
    last_emit_ms: HashMap<String, u64>,
    hub: WsHub,
    orchestrator: Orchestrator,
}

impl BroadcastGate {
    pub fn new(
        throttle_ms: u64,
        depth_levels: usize,
        hub: WsHub,
        orchestrator: Orchestrator,
    ) -> Self {
        Self {
            throttle_ms,
            depth_levels,
            last_emit_ms: HashMap::new(),
            hub,
            orchestrator,
        }
    }

    /// Called on every trade and every applied depth diff. Emits at most one
    /// snapshot per symbol per throttle window; returns whether it emitted.
    #[allow(clippy::too_many_arguments)]
    pub async fn broadcast(
        &mut self,
        reason: BroadcastReason,
        book: &BookState,
        tape: &TradeTape,
        cvd: &CvdEngine,
        metrics: &LegacyMetrics,
        absorption: &AbsorptionDetector,
        event_time_ms: u64,
    ) -> bool {
        let now_ms = now_millis();
        let symbol = book.symbol().to_string();

        if within_throttle(
            self.last_emit_ms.get(&symbol).copied(),
            now_ms,
            self.throttle_ms,
        ) {
            return false;
        }
        self.last_emit_ms.insert(symbol.clone(), now_ms);

        let tape_summary = tape.summary();
        let legacy = metrics.snapshot(book, self.depth_levels);
        let top = book.top_of_book();

        let envelope = MetricsEnvelope {
            symbol: symbol.clone(),
            canonical_time_ms: now_ms,
            exchange_event_time_ms: event_time_ms,
            spread_pct: top.map(|t| t.spread_pct).unwrap_or(0.0),
            prints_per_second: tape_summary.prints_per_second,
            best_bid: top.map(|t| t.best_bid).unwrap_or(0.0),
            best_ask: top.map(|t| t.best_ask).unwrap_or(0.0),
            legacy,
        };

        let payload = build_client_payload(
            &envelope,
            book,
            &tape_summary,
            cvd,
            absorption,
            self.depth_levels,
            reason,
        );
        self.hub.publish(&symbol, &payload.to_string()).await;

        self.orchestrator.ingest(envelope).await;
        true
    }
}

fn within_throttle(last_emit_ms: Option<u64>, now_ms: u64, throttle_ms: u64) -> bool {
    match last_emit_ms {
        Some(last) => now_ms.saturating_sub(last) < throttle_ms,
        None => false,
    }
}

fn build_client_payload(
    envelope: &MetricsEnvelope,
    book: &BookState,
    tape_summary: &crate::tape::TapeSummary,
    cvd: &CvdEngine,
    absorption: &AbsorptionDetector,
    depth_levels: usize,
    reason: BroadcastReason,
) -> JsonValue {
    let (bids, asks) = book.top_levels(depth_levels);
    let top = book.top_of_book();

    let mut cvd_map = JsonMap::new();
    for snap in cvd.snapshots() {
        let key = if snap.timeframe_s % 60 == 0 {
            format!("tf{}m", snap.timeframe_s / 60)
        } else {
            format!("tf{}s", snap.timeframe_s)
        };
        cvd_map.insert(key, json!(snap));
    }

    json!({
        "type": "metrics",
        "symbol": envelope.symbol,
        "event_time_ms": envelope.exchange_event_time_ms,
        "reason": match reason {
            BroadcastReason::Trade => "trade",
            BroadcastReason::Depth => "depth",
        },
        "state": book.lifecycle(),
        "timeAndSales": tape_summary,
        "cvd": JsonValue::Object(cvd_map),
        "absorption": absorption.snapshot(),
        "legacyMetrics": envelope.legacy,
        "bids": bids,
        "asks": asks,
        "bestBid": envelope.best_bid,
        "bestAsk": envelope.best_ask,
        "spreadPct": envelope.spread_pct,
        "midPrice": top.map(|t| t.mid_price),
        "lastUpdateId": book.last_update_id(),
    })
}
