use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Once};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::broadcast::{BroadcastGate, BroadcastReason};
use crate::config::MarketDataConfig;
use crate::metrics::LegacyMetrics;
use crate::orderbook::{
    BookLifecycle, BookState, DepthDiff, DepthSnapshot, DiffOutcome, LevelUpdate,
};
use crate::snapshot::{FetchOutcome, SnapshotFetcher};
use crate::tape::{AbsorptionDetector, CvdEngine, TakerSide, Trade, TradeTape};

const RESYNC_RETRY_DELAY_MS: u64 = 1_000;
const SNAPSHOT_CHANNEL_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("websocket connection error: {0}")]
    Connection(#[source] Box<tokio_tungstenite::tungstenite::Error>),
    #[error("websocket stream closed")]
    StreamClosed,
    #[error("subscription set changed")]
    SubscriptionChanged,
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Connection(Box::new(error))
    }
}

/// Everything the ingestion task owns for one symbol. Nothing in here is
/// shared; only snapshots of derived values leave the task.
pub struct SymbolPipeline {
    pub book: BookState,
    pub tape: TradeTape,
    pub cvd: CvdEngine,
    pub metrics: LegacyMetrics,
    pub absorption: AbsorptionDetector,
}

impl SymbolPipeline {
    pub fn new(symbol: &str, cfg: &MarketDataConfig) -> Self {
        Self {
            book: BookState::with_limits(symbol, cfg.diff_buffer_cap(), cfg.max_gap_tolerance),
            tape: TradeTape::new(cfg.trade_window_ms()),
            cvd: CvdEngine::new(&cfg.cvd_timeframes_s()),
            metrics: LegacyMetrics::new(cfg.trade_window_ms()),
            absorption: AbsorptionDetector::new(cfg.trade_window_ms()),
        }
    }
}

enum ResyncSignal {
    Snapshot(String, DepthSnapshot),
    MarkStale(String),
}

/// Single multiplexed subscription over the union of required symbols; one
/// depth-diff channel and one aggTrade channel each. Reconnects after a
/// fixed delay; rate limiting lives in the snapshot fetcher, not here.
pub struct FeedIngestor {
    cfg: MarketDataConfig,
    fetcher: Arc<SnapshotFetcher>,
    gate: BroadcastGate,
    symbols_rx: watch::Receiver<BTreeSet<String>>,
}

impl FeedIngestor {
    pub fn new(
        cfg: MarketDataConfig,
        fetcher: Arc<SnapshotFetcher>,
        gate: BroadcastGate,
        symbols_rx: watch::Receiver<BTreeSet<String>>,
    ) -> Self {
        Self {
            cfg,
            fetcher,
            gate,
            symbols_rx,
        }
    }

    pub fn spawn(mut self) -> JoinHandle<()> {
        ensure_rustls_crypto_provider();

        tokio::spawn(async move {
            let reconnect_delay = Duration::from_millis(self.cfg.reconnect_delay_ms());

            loop {
                let symbols: Vec<String> = {
                    let current = self.symbols_rx.borrow().clone();
                    current.into_iter().collect()
                };

                if symbols.is_empty() {
                    if self.symbols_rx.changed().await.is_err() {
                        return;
                    }
                    continue;
                }

                let url = combined_stream_url(&self.cfg.ws_url, &self.cfg.depth_stream, &symbols);
                match connect_async(&url).await {
                    Ok((socket, _)) => {
                        info!(symbols = symbols.len(), "market data feed connected");
                        match self.run_socket(socket, &symbols).await {
                            Err(FeedError::SubscriptionChanged) => {
                                info!("required symbols changed; resubscribing");
                                continue;
                            }
                            Err(error) => warn!(error = %error, "market data feed dropped"),
                            Ok(()) => return,
                        }
                    }
                    Err(error) => {
                        warn!(error = %error, "market data connect failed");
                    }
                }

                time::sleep(reconnect_delay).await;
            }
        })
    }

    async fn run_socket(
        &mut self,
        mut socket: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        symbols: &[String],
    ) -> Result<(), FeedError> {
        let mut pipelines: HashMap<String, SymbolPipeline> = symbols
            .iter()
            .map(|s| (s.clone(), SymbolPipeline::new(s, &self.cfg)))
            .collect();

        let (resync_tx, mut resync_rx) = mpsc::channel::<ResyncSignal>(SNAPSHOT_CHANNEL_BUFFER);

        // Books start unseeded; request the first snapshots up front.
        for symbol in symbols {
            self.request_resync(symbol, BookLifecycle::Unseeded, &resync_tx)
                .await;
        }

        let mut ping_interval =
            time::interval(Duration::from_secs(self.cfg.ping_interval_s()));
        ping_interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ping_interval.tick() => {
                    socket
                        .send(Message::Ping(Vec::new()))
                        .await
                        .map_err(FeedError::from)?;
                }
                changed = self.symbols_rx.changed() => {
                    if changed.is_err() {
                        return Err(FeedError::StreamClosed);
                    }
                    return Err(FeedError::SubscriptionChanged);
                }
                maybe_signal = resync_rx.recv() => {
                    let Some(signal) = maybe_signal else { continue };
                    match signal {
                        ResyncSignal::Snapshot(symbol, snapshot) => {
                            if let Some(pipeline) = pipelines.get_mut(&symbol) {
                                match pipeline.book.apply_snapshot(snapshot) {
                                    Ok(()) => info!(
                                        symbol = %symbol,
                                        last_update_id = pipeline.book.last_update_id(),
                                        buffered_replayed = pipeline.book.stats().buffered,
                                        "order book seeded"
                                    ),
                                    Err(error) => {
                                        warn!(symbol = %symbol, error = %error, "snapshot apply failed");
                                    }
                                }
                            }
                        }
                        ResyncSignal::MarkStale(symbol) => {
                            if let Some(pipeline) = pipelines.get_mut(&symbol) {
                                pipeline.book.mark_stale();
                                warn!(symbol = %symbol, "book degraded to stale");
                            }
                        }
                    }
                }
                maybe_msg = socket.next() => {
                    let Some(msg) = maybe_msg else {
                        return Err(FeedError::StreamClosed);
                    };
                    let msg = msg.map_err(FeedError::from)?;

                    if msg.is_ping() {
                        socket
                            .send(Message::Pong(msg.into_data()))
                            .await
                            .map_err(FeedError::from)?;
                        continue;
                    }
                    if msg.is_pong() {
                        continue;
                    }
                    if msg.is_close() {
                        return Err(FeedError::StreamClosed);
                    }
                    if !msg.is_text() {
                        continue;
                    }

                    let payload = msg.into_data();
                    match parse_stream_payload(&payload) {
                        Ok(Some(StreamEvent::Depth { symbol, diff })) => {
                            self.on_depth(&mut pipelines, &symbol, diff, &resync_tx).await;
                        }
                        Ok(Some(StreamEvent::Trade { symbol, trade })) => {
                            self.on_trade(&mut pipelines, &symbol, trade).await;
                        }
                        Ok(None) => {}
                        Err(error) => {
                            debug!(error = %error, "skipping malformed feed payload");
                        }
                    }
                }
            }
        }
    }

    async fn on_depth(
        &mut self,
        pipelines: &mut HashMap<String, SymbolPipeline>,
        symbol: &str,
        diff: DepthDiff,
        resync_tx: &mpsc::Sender<ResyncSignal>,
    ) {
        let Some(pipeline) = pipelines.get_mut(symbol) else {
            return;
        };
        let was_unseeded = pipeline.book.lifecycle() == BookLifecycle::Unseeded;
        let event_time_ms = diff.event_time_ms;

        match pipeline.book.apply_diff(&diff) {
            Ok(DiffOutcome::Applied) => {
                self.gate
                    .broadcast(
                        BroadcastReason::Depth,
                        &pipeline.book,
                        &pipeline.tape,
                        &pipeline.cvd,
                        &pipeline.metrics,
                        &pipeline.absorption,
                        event_time_ms,
                    )
                    .await;
            }
            Ok(DiffOutcome::Buffered) => {
                // The very first diffs arrive before any snapshot; this is
                // how the initial seed gets requested.
                if was_unseeded {
                    self.request_resync(symbol, BookLifecycle::Unseeded, resync_tx)
                        .await;
                }
            }
            Ok(DiffOutcome::Desync) => {
                let stats = pipeline.book.stats();
                warn!(
                    symbol,
                    last_update_id = pipeline.book.last_update_id(),
                    first_update_id = diff.first_update_id,
                    final_update_id = diff.final_update_id,
                    desyncs = stats.desyncs,
                    "book desync; requesting snapshot"
                );
                pipeline.book.mark_resyncing();
                self.request_resync(symbol, BookLifecycle::Resyncing, resync_tx)
                    .await;
            }
            Err(error) => {
                warn!(symbol, error = %error, "depth diff rejected");
            }
        }
    }

    async fn on_trade(
        &mut self,
        pipelines: &mut HashMap<String, SymbolPipeline>,
        symbol: &str,
        trade: Trade,
    ) {
        let Some(pipeline) = pipelines.get_mut(symbol) else {
            return;
        };

        pipeline.tape.add(trade);
        pipeline.cvd.add(&trade);
        pipeline.metrics.add_trade(&trade);
        if let Some(top) = pipeline.book.top_of_book() {
            pipeline
                .absorption
                .record(&trade, top.mid_price, top.best_ask - top.best_bid);
        }

        self.gate
            .broadcast(
                BroadcastReason::Trade,
                &pipeline.book,
                &pipeline.tape,
                &pipeline.cvd,
                &pipeline.metrics,
                &pipeline.absorption,
                trade.event_time_ms,
            )
            .await;
    }

    /// Spawns a background fetch for the symbol unless one is in flight.
    /// The result comes back over the resync channel so book mutation stays
    /// on the ingestion task.
    async fn request_resync(
        &self,
        symbol: &str,
        lifecycle: BookLifecycle,
        resync_tx: &mpsc::Sender<ResyncSignal>,
    ) {
        if !self.fetcher.try_begin_resync(symbol).await {
            return;
        }

        let fetcher = self.fetcher.clone();
        let symbol = symbol.to_string();
        let tx = resync_tx.clone();
        tokio::spawn(async move {
            loop {
                match fetcher.fetch(&symbol, lifecycle).await {
                    FetchOutcome::Snapshot(snapshot) => {
                        let _ = tx.send(ResyncSignal::Snapshot(symbol, snapshot)).await;
                        return;
                    }
                    FetchOutcome::Throttled => {
                        time::sleep(Duration::from_millis(RESYNC_RETRY_DELAY_MS)).await;
                    }
                    FetchOutcome::Failed { escalate_stale, .. } => {
                        if escalate_stale {
                            let _ = tx.send(ResyncSignal::MarkStale(symbol.clone())).await;
                        }
                        time::sleep(Duration::from_millis(RESYNC_RETRY_DELAY_MS)).await;
                    }
                }
            }
        });
    }
}

enum StreamEvent {
    Depth { symbol: String, diff: DepthDiff },
    Trade { symbol: String, trade: Trade },
}

fn combined_stream_url(ws_url: &str, depth_stream: &str, symbols: &[String]) -> String {
    let depth_suffix = depth_stream.trim_start_matches('@');
    let streams: Vec<String> = symbols
        .iter()
        .flat_map(|symbol| {
            let lower = symbol.to_lowercase();
            [
                format!("{lower}@{depth_suffix}"),
                format!("{lower}@aggTrade"),
            ]
        })
        .collect();
    format!(
        "{}?streams={}",
        ws_url.trim_end_matches('/'),
        streams.join("/")
    )
}

#[derive(Debug, Deserialize)]
struct DepthUpdateData {
    #[serde(rename = "E")]
    event_time_ms: Option<u64>,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "U")]
    first_update_id: u64,
    #[serde(rename = "u")]
    final_update_id: u64,
    #[serde(rename = "b")]
    bids: Vec<[String; 2]>,
    #[serde(rename = "a")]
    asks: Vec<[String; 2]>,
}

#[derive(Debug, Deserialize)]
struct AggTradeData {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "T")]
    trade_time_ms: u64,
    #[serde(rename = "m")]
    buyer_is_maker: bool,
}

fn parse_stream_payload(payload: &[u8]) -> Result<Option<StreamEvent>, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_slice(payload)?;
    // Combined-stream messages wrap the event in `data`; direct payloads
    // carry it at the top level.
    let data = match value.get("data") {
        Some(data) => data.clone(),
        None => value,
    };

    let event_type = data
        .get("e")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string();

    match event_type.as_str() {
        "depthUpdate" => {
            let data: DepthUpdateData = serde_json::from_value(data)?;
            let diff = DepthDiff {
                first_update_id: data.first_update_id,
                final_update_id: data.final_update_id,
                bids: parse_levels_lossy(&data.bids),
                asks: parse_levels_lossy(&data.asks),
                event_time_ms: data.event_time_ms.unwrap_or(0),
            };
            Ok(Some(StreamEvent::Depth {
                symbol: data.symbol.to_uppercase(),
                diff,
            }))
        }
        "aggTrade" => {
            let data: AggTradeData = serde_json::from_value(data)?;
            let (Ok(price), Ok(qty)) = (data.price.parse::<f64>(), data.quantity.parse::<f64>())
            else {
                return Ok(None);
            };
            Ok(Some(StreamEvent::Trade {
                symbol: data.symbol.to_uppercase(),
                trade: Trade {
                    price,
                    qty,
                    taker_side: TakerSide::from_buyer_is_maker(data.buyer_is_maker),
                    event_time_ms: data.trade_time_ms,
                },
            }))
        }
        _ => Ok(None),
    }
}

fn ensure_rustls_crypto_provider() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::CryptoProvider::install_default(
            rustls::crypto::ring::default_provider(),
        );
    });
}

fn parse_levels_lossy(levels: &[[String; 2]]) -> Vec<LevelUpdate> {
    levels
        .iter()
        .filter_map(|[price_raw, qty_raw]| {
            let price = price_raw.parse::<f64>().ok()?;
            let qty = qty_raw.parse::<f64>().ok()?;
            Some(LevelUpdate { price, qty })
        })
        .collect()
}
