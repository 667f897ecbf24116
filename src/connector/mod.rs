use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::sync::Once;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use crate::config::ExecutionSettings;
use crate::decision::{OpenOrder, OrderSide};
use crate::util::{now_millis, quantize_qty_floor};

const API_KEY_ENV: &str = "FUTURES_API_KEY";
const API_SECRET_ENV: &str = "FUTURES_API_SECRET";
const API_KEY_HEADER: &str = "X-MBX-APIKEY";
const USER_STREAM_KEEPALIVE_SECS: u64 = 30 * 60;
const USER_STREAM_RECONNECT_BACKOFF_MS: u64 = 1_000;
const EXCHANGE_INFO_TTL_SECS: u64 = 3_600;
const EVENT_CHANNEL_BUFFER: usize = 4_096;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Canceled | Self::Rejected | Self::Expired
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
}

/// Typed events pushed by the execution venue. Every variant carries the
/// symbol and the venue event time; the orchestrator fans them out to the
/// owning actors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionEvent {
    AccountUpdate {
        symbol: String,
        event_time_ms: u64,
        available_balance: f64,
        wallet_balance: f64,
        position_amt: f64,
        entry_price: f64,
        unrealized_pnl: f64,
    },
    OrderUpdate {
        symbol: String,
        event_time_ms: u64,
        order_id: u64,
        client_order_id: Option<String>,
        side: OrderSide,
        status: OrderStatus,
        price: f64,
        quantity: f64,
        reduce_only: bool,
    },
    TradeUpdate {
        symbol: String,
        event_time_ms: u64,
        order_id: u64,
        fill_price: f64,
        fill_qty: f64,
        realized_pnl: f64,
    },
    OpenOrdersSnapshot {
        symbol: String,
        event_time_ms: u64,
        orders: Vec<OpenOrder>,
    },
    SystemHalt {
        symbol: String,
        event_time_ms: u64,
        reason: String,
    },
    SystemResume {
        symbol: String,
        event_time_ms: u64,
    },
}

impl ExecutionEvent {
    pub fn symbol(&self) -> &str {
        match self {
            Self::AccountUpdate { symbol, .. }
            | Self::OrderUpdate { symbol, .. }
            | Self::TradeUpdate { symbol, .. }
            | Self::OpenOrdersSnapshot { symbol, .. }
            | Self::SystemHalt { symbol, .. }
            | Self::SystemResume { symbol, .. } => symbol,
        }
    }

    pub fn event_time_ms(&self) -> u64 {
        match self {
            Self::AccountUpdate { event_time_ms, .. }
            | Self::OrderUpdate { event_time_ms, .. }
            | Self::TradeUpdate { event_time_ms, .. }
            | Self::OpenOrdersSnapshot { event_time_ms, .. }
            | Self::SystemHalt { event_time_ms, .. }
            | Self::SystemResume { event_time_ms, .. } => *event_time_ms,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlaceOrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    pub reduce_only: bool,
    pub client_order_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub order_id: u64,
    pub client_order_id: String,
}

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("missing required env var {0}")]
    MissingCredentials(&'static str),
    #[error("http request error: {0}")]
    Http(#[source] Box<reqwest::Error>),
    #[error("rest call timed out after {0} ms")]
    Timeout(u64),
    #[error("venue api error (status={status}, code={code:?}): {msg}")]
    Api {
        status: u16,
        code: Option<i64>,
        msg: String,
    },
    #[error("json parse error: {0}")]
    Json(#[source] Box<serde_json::Error>),
    #[error("signature error: {0}")]
    Signature(String),
    #[error("user stream websocket error: {0}")]
    UserStreamSocket(#[source] Box<tokio_tungstenite::tungstenite::Error>),
    #[error("exchange info missing symbol {0}")]
    ExchangeInfoSymbolMissing(String),
}

impl From<reqwest::Error> for ConnectorError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            return Self::Timeout(0);
        }
        Self::Http(Box::new(error))
    }
}

impl From<serde_json::Error> for ConnectorError {
    fn from(error: serde_json::Error) -> Self {
        Self::Json(Box::new(error))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ConnectorError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::UserStreamSocket(Box::new(error))
    }
}

/// The surface the orchestrator depends on. Push events arrive on the
/// channel handed out at construction; everything else is request/response.
#[async_trait]
pub trait ExecutionConnector: Send + Sync {
    async fn place_order(&self, request: PlaceOrderRequest) -> Result<PlacedOrder, ConnectorError>;

    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: Option<u64>,
        client_order_id: Option<&str>,
    ) -> Result<(), ConnectorError>;

    async fn cancel_all_open_orders(&self, symbol: &str) -> Result<(), ConnectorError>;

    /// Best ask for BUY, best bid for SELL, from the venue ticker; None when
    /// the venue has no quote.
    async fn expected_price(
        &self,
        symbol: &str,
        side: OrderSide,
        order_type: OrderType,
    ) -> Result<Option<f64>, ConnectorError>;

    /// Re-emits ACCOUNT_UPDATE + OPEN_ORDERS_SNAPSHOT for every tracked
    /// symbol.
    async fn sync_state(&self) -> Result<(), ConnectorError>;

    async fn set_tracked_symbols(&self, symbols: BTreeSet<String>);
}

#[derive(Debug, Clone, Copy)]
pub struct SymbolFilters {
    pub tick_size: f64,
    pub step_size: f64,
}

/// Process-wide symbol filter cache with a 1-hour TTL; only its fetcher
/// writes it, on miss.
#[derive(Debug, Default)]
struct ExchangeInfoCache {
    fetched_at: Option<Instant>,
    filters: HashMap<String, SymbolFilters>,
}

impl ExchangeInfoCache {
    fn get_fresh(&self, symbol: &str) -> Option<SymbolFilters> {
        let fetched_at = self.fetched_at?;
        if fetched_at.elapsed() > Duration::from_secs(EXCHANGE_INFO_TTL_SECS) {
            return None;
        }
        self.filters.get(symbol).copied()
    }
}

/// Signed REST + user-data-stream connector for the USDⓈ-futures venue.
#[derive(Clone)]
pub struct FuturesRestConnector {
    http: reqwest::Client,
    api_key: String,
    api_secret: String,
    rest_url: String,
    ws_url: String,
    recv_window_ms: u64,
    timeout_ms: u64,
    events_tx: mpsc::Sender<ExecutionEvent>,
    tracked: Arc<RwLock<BTreeSet<String>>>,
    info_cache: Arc<Mutex<ExchangeInfoCache>>,
    client_order_seq: Arc<AtomicU64>,
    user_stream_started: Arc<AtomicBool>,
}

impl FuturesRestConnector {
    pub fn from_settings(
        settings: &ExecutionSettings,
    ) -> Result<(Self, mpsc::Receiver<ExecutionEvent>), ConnectorError> {
        ensure_rustls_crypto_provider();

        let api_key = std::env::var(API_KEY_ENV)
            .map_err(|_| ConnectorError::MissingCredentials(API_KEY_ENV))?;
        let api_secret = std::env::var(API_SECRET_ENV)
            .map_err(|_| ConnectorError::MissingCredentials(API_SECRET_ENV))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms()))
            .tcp_nodelay(true)
            .build()?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_BUFFER);

        Ok((
            Self {
                http,
                api_key,
                api_secret,
                rest_url: settings.rest_url.trim_end_matches('/').to_string(),
                ws_url: settings.ws_url.trim_end_matches('/').to_string(),
                recv_window_ms: settings.recv_window_ms(),
                timeout_ms: settings.timeout_ms(),
                events_tx,
                tracked: Arc::new(RwLock::new(BTreeSet::new())),
                info_cache: Arc::new(Mutex::new(ExchangeInfoCache::default())),
                client_order_seq: Arc::new(AtomicU64::new(1)),
                user_stream_started: Arc::new(AtomicBool::new(false)),
            },
            events_rx,
        ))
    }

    /// Starts the user-data-stream loop; idempotent.
    pub fn start_user_stream(&self) {
        if self.user_stream_started.swap(true, AtomicOrdering::SeqCst) {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.user_stream_loop().await;
        });
    }

    fn next_client_order_id(&self) -> String {
        let seq = self.client_order_seq.fetch_add(1, AtomicOrdering::SeqCst);
        format!("ofb-{}-{}", now_millis(), seq)
    }

    async fn symbol_filters(&self, symbol: &str) -> Result<Option<SymbolFilters>, ConnectorError> {
        {
            let cache = self.info_cache.lock().await;
            if let Some(filters) = cache.get_fresh(symbol) {
                return Ok(Some(filters));
            }
        }

        let response = self
            .http
            .get(format!("{}/fapi/v1/exchangeInfo", self.rest_url))
            .send()
            .await
            .map_err(self.classify_timeout())?;
        let response = check_status(response).await?;
        let payload: ExchangeInfoResponse = response.json().await?;

        let mut filters = HashMap::new();
        for item in payload.symbols {
            let mut tick_size = None;
            let mut step_size = None;
            for filter in item.filters {
                match filter.filter_type.as_str() {
                    "PRICE_FILTER" => tick_size = filter.tick_size.and_then(|v| v.parse().ok()),
                    "LOT_SIZE" => step_size = filter.step_size.and_then(|v| v.parse().ok()),
                    _ => {}
                }
            }
            if let (Some(tick_size), Some(step_size)) = (tick_size, step_size) {
                filters.insert(
                    item.symbol,
                    SymbolFilters {
                        tick_size,
                        step_size,
                    },
                );
            }
        }

        let mut cache = self.info_cache.lock().await;
        cache.fetched_at = Some(Instant::now());
        cache.filters = filters;
        Ok(cache.filters.get(symbol).copied())
    }

    fn classify_timeout(&self) -> impl Fn(reqwest::Error) -> ConnectorError + '_ {
        let timeout_ms = self.timeout_ms;
        move |error: reqwest::Error| {
            if error.is_timeout() {
                ConnectorError::Timeout(timeout_ms)
            } else {
                ConnectorError::Http(Box::new(error))
            }
        }
    }

    async fn send_signed(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(&str, String)>,
    ) -> Result<reqwest::Response, ConnectorError> {
        params.push(("timestamp", now_millis().to_string()));
        params.push(("recvWindow", self.recv_window_ms.to_string()));

        let mut query = build_query_string(&params);
        append_signature_param(&self.api_secret, &mut query)?;
        let url = format!("{}{}?{}", self.rest_url, path, query);

        let response = self
            .http
            .request(method, url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(self.classify_timeout())?;
        check_status(response).await
    }

    async fn emit(&self, event: ExecutionEvent) {
        if self.events_tx.send(event).await.is_err() {
            warn!("execution event channel closed; dropping venue event");
        }
    }

    async fn user_stream_loop(self) {
        let reconnect_backoff = Duration::from_millis(USER_STREAM_RECONNECT_BACKOFF_MS);
        let mut first_connect = true;

        loop {
            let listen_key = match self.create_listen_key().await {
                Ok(value) => value,
                Err(error) => {
                    warn!(error = %error, "failed to create listenKey");
                    sleep(reconnect_backoff).await;
                    continue;
                }
            };

            let keepalive = self.clone();
            let keepalive_handle = tokio::spawn(async move {
                loop {
                    sleep(Duration::from_secs(USER_STREAM_KEEPALIVE_SECS)).await;
                    if let Err(error) = keepalive
                        .send_signed(Method::PUT, "/fapi/v1/listenKey", Vec::new())
                        .await
                    {
                        warn!(error = %error, "listenKey keepalive failed");
                    }
                }
            });

            let url = format!("{}/{}", self.ws_url, listen_key);
            match connect_async(&url).await {
                Ok((socket, _)) => {
                    info!("user data stream connected");
                    if !first_connect {
                        if let Err(error) = self.sync_state_inner().await {
                            warn!(error = %error, "post-reconnect state sync failed");
                        }
                        self.emit_resume_all().await;
                    }
                    first_connect = false;

                    if let Err(error) = self.run_user_socket(socket).await {
                        warn!(error = %error, "user data stream disconnected");
                    }
                    // The venue connection is gone; owned symbols halt until
                    // reconnect + sync raises the resume.
                    self.emit_halt_all("user_stream_disconnect").await;
                }
                Err(error) => {
                    warn!(error = %error, "failed to connect user data stream");
                }
            }

            keepalive_handle.abort();
            let _ = keepalive_handle.await;
            sleep(reconnect_backoff).await;
        }
    }

    async fn emit_halt_all(&self, reason: &str) {
        let symbols = self.tracked.read().await.clone();
        let event_time_ms = now_millis();
        for symbol in symbols {
            self.emit(ExecutionEvent::SystemHalt {
                symbol,
                event_time_ms,
                reason: reason.to_string(),
            })
            .await;
        }
    }

    async fn emit_resume_all(&self) {
        let symbols = self.tracked.read().await.clone();
        let event_time_ms = now_millis();
        for symbol in symbols {
            self.emit(ExecutionEvent::SystemResume {
                symbol,
                event_time_ms,
            })
            .await;
        }
    }

    async fn run_user_socket(
        &self,
        mut socket: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) -> Result<(), ConnectorError> {
        loop {
            let Some(msg) = socket.next().await else {
                return Err(ConnectorError::UserStreamSocket(Box::new(
                    tokio_tungstenite::tungstenite::Error::ConnectionClosed,
                )));
            };
            let msg = msg.map_err(ConnectorError::from)?;

            if msg.is_ping() {
                socket
                    .send(Message::Pong(msg.into_data()))
                    .await
                    .map_err(ConnectorError::from)?;
                continue;
            }
            if msg.is_pong() {
                continue;
            }
            if msg.is_close() {
                return Err(ConnectorError::UserStreamSocket(Box::new(
                    tokio_tungstenite::tungstenite::Error::ConnectionClosed,
                )));
            }
            if !msg.is_text() {
                continue;
            }

            let payload = msg.into_data();
            let event: UserStreamEvent = match serde_json::from_slice(&payload) {
                Ok(value) => value,
                Err(_) => continue,
            };
            self.apply_user_event(event).await;
        }
    }

    async fn apply_user_event(&self, event: UserStreamEvent) {
        match event {
            UserStreamEvent::OrderTradeUpdate { event_time_ms, order } => {
                let status = match map_order_status(&order.status) {
                    Some(status) => status,
                    None => return,
                };
                let side = match order.side.as_str() {
                    "BUY" => OrderSide::Buy,
                    "SELL" => OrderSide::Sell,
                    _ => return,
                };

                self.emit(ExecutionEvent::OrderUpdate {
                    symbol: order.symbol.clone(),
                    event_time_ms,
                    order_id: order.order_id,
                    client_order_id: Some(order.client_order_id.clone()),
                    side,
                    status,
                    price: parse_decimal_or_zero(&order.price),
                    quantity: parse_decimal_or_zero(&order.quantity),
                    reduce_only: order.reduce_only,
                })
                .await;

                let fill_qty = parse_decimal_or_zero(&order.last_fill_qty);
                if fill_qty > 0.0 {
                    self.emit(ExecutionEvent::TradeUpdate {
                        symbol: order.symbol,
                        event_time_ms,
                        order_id: order.order_id,
                        fill_price: parse_decimal_or_zero(&order.last_fill_price),
                        fill_qty,
                        realized_pnl: parse_decimal_or_zero(&order.realized_pnl),
                    })
                    .await;
                }
            }
            UserStreamEvent::AccountUpdate { event_time_ms, data } => {
                let mut available_balance = 0.0;
                let mut wallet_balance = 0.0;
                for balance in &data.balances {
                    if balance.asset == "USDT" {
                        available_balance = parse_decimal_or_zero(&balance.available);
                        wallet_balance = parse_decimal_or_zero(&balance.wallet);
                    }
                }

                for position in data.positions {
                    self.emit(ExecutionEvent::AccountUpdate {
                        symbol: position.symbol,
                        event_time_ms,
                        available_balance,
                        wallet_balance,
                        position_amt: parse_signed_decimal_or_zero(&position.position_amt),
                        entry_price: parse_decimal_or_zero(&position.entry_price),
                        unrealized_pnl: parse_signed_decimal_or_zero(&position.unrealized_pnl),
                    })
                    .await;
                }
            }
            UserStreamEvent::Other => {}
        }
    }

    async fn create_listen_key(&self) -> Result<String, ConnectorError> {
        let response = self
            .http
            .post(format!("{}/fapi/v1/listenKey", self.rest_url))
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(self.classify_timeout())?;
        let response = check_status(response).await?;
        let payload: ListenKeyResponse = response.json().await?;
        Ok(payload.listen_key)
    }

    async fn sync_state_inner(&self) -> Result<(), ConnectorError> {
        let symbols = self.tracked.read().await.clone();
        let event_time_ms = now_millis();

        let response = self
            .send_signed(Method::GET, "/fapi/v2/account", Vec::new())
            .await?;
        let account: AccountResponse = response.json().await?;

        let mut available_balance = 0.0;
        let mut wallet_balance = 0.0;
        for asset in &account.assets {
            if asset.asset == "USDT" {
                available_balance = parse_decimal_or_zero(&asset.available_balance);
                wallet_balance = parse_decimal_or_zero(&asset.wallet_balance);
            }
        }

        for symbol in &symbols {
            let position = account
                .positions
                .iter()
                .find(|p| p.symbol.eq_ignore_ascii_case(symbol));
            let (position_amt, entry_price, unrealized_pnl) = match position {
                Some(p) => (
                    parse_signed_decimal_or_zero(&p.position_amt),
                    parse_decimal_or_zero(&p.entry_price),
                    parse_signed_decimal_or_zero(&p.unrealized_pnl),
                ),
                None => (0.0, 0.0, 0.0),
            };
            self.emit(ExecutionEvent::AccountUpdate {
                symbol: symbol.clone(),
                event_time_ms,
                available_balance,
                wallet_balance,
                position_amt,
                entry_price,
                unrealized_pnl,
            })
            .await;

            let response = self
                .send_signed(
                    Method::GET,
                    "/fapi/v1/openOrders",
                    vec![("symbol", symbol.clone())],
                )
                .await?;
            let raw_orders: Vec<OpenOrderResponse> = response.json().await?;
            let orders = raw_orders
                .into_iter()
                .filter_map(|raw| {
                    let side = match raw.side.as_str() {
                        "BUY" => OrderSide::Buy,
                        "SELL" => OrderSide::Sell,
                        _ => return None,
                    };
                    Some(OpenOrder {
                        order_id: raw.order_id,
                        client_order_id: Some(raw.client_order_id),
                        side,
                        price: parse_decimal_or_zero(&raw.price),
                        quantity: parse_decimal_or_zero(&raw.orig_qty),
                        reduce_only: raw.reduce_only,
                    })
                })
                .collect();

            self.emit(ExecutionEvent::OpenOrdersSnapshot {
                symbol: symbol.clone(),
                event_time_ms,
                orders,
            })
            .await;
        }

        Ok(())
    }
}

#[async_trait]
impl ExecutionConnector for FuturesRestConnector {
    async fn place_order(&self, request: PlaceOrderRequest) -> Result<PlacedOrder, ConnectorError> {
        let symbol = request.symbol.to_uppercase();
        let quantity = match self.symbol_filters(&symbol).await? {
            Some(filters) => {
                quantize_qty_floor(request.quantity, filters.step_size).unwrap_or(request.quantity)
            }
            None => request.quantity,
        };

        let client_order_id = request
            .client_order_id
            .unwrap_or_else(|| self.next_client_order_id());

        let mut params: Vec<(&str, String)> = vec![
            ("symbol", symbol.clone()),
            ("side", order_side_str(request.side).to_string()),
            ("type", order_type_str(request.order_type).to_string()),
            ("quantity", decimal_string(quantity)),
            ("newClientOrderId", client_order_id.clone()),
        ];
        if request.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }
        if let (OrderType::Limit, Some(price)) = (request.order_type, request.price) {
            params.push(("price", decimal_string(price)));
            params.push(("timeInForce", "GTC".to_string()));
        }

        let response = self
            .send_signed(Method::POST, "/fapi/v1/order", params)
            .await?;
        let payload: NewOrderResponse = response.json().await?;

        Ok(PlacedOrder {
            order_id: payload.order_id,
            client_order_id,
        })
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: Option<u64>,
        client_order_id: Option<&str>,
    ) -> Result<(), ConnectorError> {
        let mut params: Vec<(&str, String)> = vec![("symbol", symbol.to_uppercase())];
        if let Some(order_id) = order_id {
            params.push(("orderId", order_id.to_string()));
        }
        if let Some(client_order_id) = client_order_id {
            params.push(("origClientOrderId", client_order_id.to_string()));
        }

        self.send_signed(Method::DELETE, "/fapi/v1/order", params)
            .await?;
        Ok(())
    }

    async fn cancel_all_open_orders(&self, symbol: &str) -> Result<(), ConnectorError> {
        self.send_signed(
            Method::DELETE,
            "/fapi/v1/allOpenOrders",
            vec![("symbol", symbol.to_uppercase())],
        )
        .await?;
        Ok(())
    }

    async fn expected_price(
        &self,
        symbol: &str,
        side: OrderSide,
        _order_type: OrderType,
    ) -> Result<Option<f64>, ConnectorError> {
        let response = self
            .http
            .get(format!("{}/fapi/v1/ticker/bookTicker", self.rest_url))
            .query(&[("symbol", symbol.to_uppercase())])
            .send()
            .await
            .map_err(self.classify_timeout())?;
        let response = check_status(response).await?;
        let payload: BookTickerResponse = response.json().await?;

        let price = match side {
            OrderSide::Buy => parse_decimal_or_zero(&payload.ask_price),
            OrderSide::Sell => parse_decimal_or_zero(&payload.bid_price),
        };
        Ok((price > 0.0).then_some(price))
    }

    async fn sync_state(&self) -> Result<(), ConnectorError> {
        self.sync_state_inner().await
    }

    async fn set_tracked_symbols(&self, symbols: BTreeSet<String>) {
        *self.tracked.write().await = symbols;
    }
}

/// In-process connector for tests and replay: accepts everything, assigns
/// sequential order ids, records the calls, pushes nothing.
#[derive(Debug, Default)]
pub struct MockConnector {
    order_seq: AtomicU64,
    pub placed: Mutex<Vec<PlaceOrderRequest>>,
    pub canceled_all: Mutex<Vec<String>>,
}

#[async_trait]
impl ExecutionConnector for MockConnector {
    async fn place_order(&self, request: PlaceOrderRequest) -> Result<PlacedOrder, ConnectorError> {
        let order_id = self.order_seq.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        let client_order_id = request
            .client_order_id
            .clone()
            .unwrap_or_else(|| format!("mock-{order_id}"));
        self.placed.lock().await.push(request);
        Ok(PlacedOrder {
            order_id,
            client_order_id,
        })
    }

    async fn cancel_order(
        &self,
        _symbol: &str,
        _order_id: Option<u64>,
        _client_order_id: Option<&str>,
    ) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn cancel_all_open_orders(&self, symbol: &str) -> Result<(), ConnectorError> {
        self.canceled_all.lock().await.push(symbol.to_string());
        Ok(())
    }

    async fn expected_price(
        &self,
        _symbol: &str,
        _side: OrderSide,
        _order_type: OrderType,
    ) -> Result<Option<f64>, ConnectorError> {
        Ok(None)
    }

    async fn sync_state(&self) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn set_tracked_symbols(&self, _symbols: BTreeSet<String>) {}
}

fn order_side_str(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "BUY",
        OrderSide::Sell => "SELL",
    }
}

fn order_type_str(order_type: OrderType) -> &'static str {
    match order_type {
        OrderType::Market => "MARKET",
        OrderType::Limit => "LIMIT",
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ConnectorError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let code = serde_json::from_str::<ApiErrorResponse>(&body)
        .ok()
        .and_then(|e| e.code);
    Err(ConnectorError::Api {
        status: status.as_u16(),
        code,
        msg: body.chars().take(300).collect(),
    })
}

fn decimal_string(value: f64) -> String {
    let mut out = format!("{value:.8}");
    while out.contains('.') && out.ends_with('0') {
        out.pop();
    }
    if out.ends_with('.') {
        out.pop();
    }
    out
}

fn parse_decimal_or_zero(raw: &str) -> f64 {
    raw.parse::<f64>()
        .ok()
        .filter(|value| value.is_finite() && *value >= 0.0)
        .unwrap_or(0.0)
}

fn parse_signed_decimal_or_zero(raw: &str) -> f64 {
    raw.parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .unwrap_or(0.0)
}

fn map_order_status(raw: &str) -> Option<OrderStatus> {
    match raw {
        "NEW" => Some(OrderStatus::New),
        "PARTIALLY_FILLED" => Some(OrderStatus::PartiallyFilled),
        "FILLED" => Some(OrderStatus::Filled),
        "CANCELED" => Some(OrderStatus::Canceled),
        "REJECTED" => Some(OrderStatus::Rejected),
        "EXPIRED" | "EXPIRED_IN_MATCH" => Some(OrderStatus::Expired),
        _ => None,
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

fn build_query_string(params: &[(&str, String)]) -> String {
    let mut query = String::new();
    for (idx, (key, value)) in params.iter().enumerate() {
        if idx > 0 {
            query.push('&');
        }
        query.push_str(key);
        query.push('=');
        query.push_str(value);
    }
    query
}

fn append_signature_param(secret: &str, query: &mut String) -> Result<(), ConnectorError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ConnectorError::Signature(e.to_string()))?;
    mac.update(query.as_bytes());
    let digest = mac.finalize().into_bytes();

    query.push_str("&signature=");
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(query, "{byte:02x}");
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    code: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct NewOrderResponse {
    #[serde(rename = "orderId")]
    order_id: u64,
}

#[derive(Debug, Deserialize)]
struct ListenKeyResponse {
    #[serde(rename = "listenKey")]
    listen_key: String,
}

#[derive(Debug, Deserialize)]
struct BookTickerResponse {
    #[serde(rename = "bidPrice")]
    bid_price: String,
    #[serde(rename = "askPrice")]
    ask_price: String,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfoResponse {
    symbols: Vec<ExchangeInfoSymbol>,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfoSymbol {
    symbol: String,
    filters: Vec<ExchangeInfoFilter>,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfoFilter {
    #[serde(rename = "filterType")]
    filter_type: String,
    #[serde(rename = "tickSize")]
    tick_size: Option<String>,
    #[serde(rename = "stepSize")]
    step_size: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    assets: Vec<AccountAsset>,
    positions: Vec<AccountPosition>,
}

#[derive(Debug, Deserialize)]
struct AccountAsset {
    asset: String,
    #[serde(rename = "availableBalance")]
    available_balance: String,
    #[serde(rename = "walletBalance")]
    wallet_balance: String,
}

#[derive(Debug, Deserialize)]
struct AccountPosition {
    symbol: String,
    #[serde(rename = "positionAmt")]
    position_amt: String,
    #[serde(rename = "entryPrice")]
    entry_price: String,
    #[serde(rename = "unrealizedProfit")]
    unrealized_pnl: String,
}

#[derive(Debug, Deserialize)]
struct OpenOrderResponse {
    #[serde(rename = "orderId")]
    order_id: u64,
    #[serde(rename = "clientOrderId")]
    client_order_id: String,
    side: String,
    price: String,
    #[serde(rename = "origQty")]
    orig_qty: String,
    #[serde(rename = "reduceOnly", default)]
    reduce_only: bool,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "e")]
enum UserStreamEvent {
    #[serde(rename = "ORDER_TRADE_UPDATE")]
    OrderTradeUpdate {
        #[serde(rename = "E")]
        event_time_ms: u64,
        #[serde(rename = "o")]
        order: OrderTradeUpdateData,
    },
    #[serde(rename = "ACCOUNT_UPDATE")]
    AccountUpdate {
        #[serde(rename = "E")]
        event_time_ms: u64,
        #[serde(rename = "a")]
        data: AccountUpdateData,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct OrderTradeUpdateData {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "i")]
    order_id: u64,
    #[serde(rename = "c")]
    client_order_id: String,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "X")]
    status: String,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "R", default)]
    reduce_only: bool,
    #[serde(rename = "l", default)]
    last_fill_qty: String,
    #[serde(rename = "L", default)]
    last_fill_price: String,
    #[serde(rename = "rp", default)]
    realized_pnl: String,
}

#[derive(Debug, Deserialize)]
struct AccountUpdateData {
    #[serde(rename = "B", default)]
    balances: Vec<AccountUpdateBalance>,
    #[serde(rename = "P", default)]
    positions: Vec<AccountUpdatePosition>,
}

#[derive(Debug, Deserialize)]
struct AccountUpdateBalance {
    #[serde(rename = "a")]
    asset: String,
    #[serde(rename = "cw", default)]
    available: String,
    #[serde(rename = "wb", default)]
    wallet: String,
}

#[derive(Debug, Deserialize)]
struct AccountUpdatePosition {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "pa")]
    position_amt: String,
    #[serde(rename = "ep", default)]
    entry_price: String,
    #[serde(rename = "up", default)]
    unrealized_pnl: String,
}
