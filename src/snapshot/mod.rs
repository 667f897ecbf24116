use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::MarketDataConfig;
use crate::orderbook::{BookLifecycle, DepthSnapshot, LevelUpdate};
use crate::util::now_millis;

const REST_TIMEOUT_MS: u64 = 10_000;
const STALE_ESCALATION_ERRORS: u32 = 4;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("http request error: {0}")]
    Http(#[source] Box<reqwest::Error>),
    #[error("snapshot request timed out after {0} ms")]
    Timeout(u64),
    #[error("rate limited (status={status}, retry_after_ms={retry_after_ms})")]
    RateLimited { status: u16, retry_after_ms: u64 },
    #[error("snapshot http status {0}")]
    Status(u16),
    #[error("invalid numeric value '{0}' in snapshot")]
    InvalidNumber(String),
}

#[derive(Debug)]
pub enum FetchOutcome {
    Snapshot(DepthSnapshot),
    /// Global or per-symbol throttle said not yet.
    Throttled,
    Failed {
        error: SnapshotError,
        /// True once the symbol has failed often enough that its book
        /// should degrade to Stale.
        escalate_stale: bool,
    },
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SymbolFetchHealth {
    pub symbol: String,
    pub last_attempt_ms: u64,
    pub last_ok_ms: u64,
    pub backoff_ms: u64,
    pub consecutive_errors: u32,
    pub resyncing: bool,
}

#[derive(Debug, Clone, Copy)]
struct SymbolFetchState {
    last_attempt_ms: u64,
    last_ok_ms: u64,
    backoff_ms: u64,
    consecutive_errors: u32,
    resyncing: bool,
}

#[derive(Debug, Clone, Copy)]
struct FetchLimits {
    min_interval_ms: u64,
    backoff_min_ms: u64,
    backoff_max_ms: u64,
}

/// REST depth fetcher behind two gates: a process-wide backoff armed by
/// venue rate-limit responses, and a per-symbol throttle that unseeded and
/// resyncing symbols may bypass (never the global one).
pub struct SnapshotFetcher {
    http: reqwest::Client,
    rest_url: String,
    snapshot_limit: u32,
    limits: FetchLimits,
    per_symbol: Mutex<HashMap<String, SymbolFetchState>>,
    global_backoff_until_ms: AtomicU64,
}

impl SnapshotFetcher {
    pub fn from_config(cfg: &MarketDataConfig) -> Result<Self, SnapshotError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(REST_TIMEOUT_MS))
            .build()
            .map_err(|e| SnapshotError::Http(Box::new(e)))?;

        Ok(Self {
            http,
            rest_url: cfg.rest_url.trim_end_matches('/').to_string(),
            snapshot_limit: cfg.snapshot_limit(),
            limits: FetchLimits {
                min_interval_ms: cfg.snapshot_min_interval_ms,
                backoff_min_ms: cfg.snapshot_backoff_min_ms(),
                backoff_max_ms: cfg.snapshot_backoff_max_ms(),
            },
            per_symbol: Mutex::new(HashMap::new()),
            global_backoff_until_ms: AtomicU64::new(0),
        })
    }

    pub fn global_backoff_until_ms(&self) -> u64 {
        self.global_backoff_until_ms.load(AtomicOrdering::Relaxed)
    }

    /// Per-symbol fetch health for the structured health output.
    pub async fn health(&self) -> Vec<SymbolFetchHealth> {
        let states = self.per_symbol.lock().await;
        states
            .iter()
            .map(|(symbol, state)| SymbolFetchHealth {
                symbol: symbol.clone(),
                last_attempt_ms: state.last_attempt_ms,
                last_ok_ms: state.last_ok_ms,
                backoff_ms: state.backoff_ms,
                consecutive_errors: state.consecutive_errors,
                resyncing: state.resyncing,
            })
            .collect()
    }

    /// Marks the symbol as having a resync in flight. Returns false when one
    /// is already running, so callers do not double-spawn.
    pub async fn try_begin_resync(&self, symbol: &str) -> bool {
        let mut states = self.per_symbol.lock().await;
        let state = states
            .entry(symbol.to_string())
            .or_insert_with(|| new_state(self.limits.backoff_min_ms));
        if state.resyncing {
            return false;
        }
        state.resyncing = true;
        true
    }

    pub async fn fetch(&self, symbol: &str, lifecycle: BookLifecycle) -> FetchOutcome {
        let now = now_millis();

        if now < self.global_backoff_until_ms.load(AtomicOrdering::Relaxed) {
            return FetchOutcome::Throttled;
        }

        {
            let mut states = self.per_symbol.lock().await;
            let state = states
                .entry(symbol.to_string())
                .or_insert_with(|| new_state(self.limits.backoff_min_ms));
            if !may_attempt(state, lifecycle, now, self.limits) {
                return FetchOutcome::Throttled;
            }
            state.last_attempt_ms = now;
            state.resyncing = true;
        }

        match self.request_snapshot(symbol).await {
            Ok(snapshot) => {
                let mut states = self.per_symbol.lock().await;
                if let Some(state) = states.get_mut(symbol) {
                    state.backoff_ms = self.limits.backoff_min_ms;
                    state.consecutive_errors = 0;
                    state.last_ok_ms = now_millis();
                    state.resyncing = false;
                }
                info!(
                    symbol,
                    last_update_id = snapshot.last_update_id,
                    bids = snapshot.bids.len(),
                    asks = snapshot.asks.len(),
                    "depth snapshot fetched"
                );
                FetchOutcome::Snapshot(snapshot)
            }
            Err(error) => {
                if let SnapshotError::RateLimited { retry_after_ms, .. } = &error {
                    let until = now_millis().saturating_add(*retry_after_ms);
                    self.global_backoff_until_ms
                        .store(until, AtomicOrdering::Relaxed);
                    warn!(retry_after_ms, "global snapshot backoff armed");
                }

                let mut states = self.per_symbol.lock().await;
                let escalate_stale = match states.get_mut(symbol) {
                    Some(state) => {
                        state.consecutive_errors = state.consecutive_errors.saturating_add(1);
                        state.backoff_ms = (state.backoff_ms.saturating_mul(2))
                            .clamp(self.limits.backoff_min_ms, self.limits.backoff_max_ms);
                        state.consecutive_errors >= STALE_ESCALATION_ERRORS
                    }
                    None => false,
                };

                warn!(symbol, error = %error, escalate_stale, "snapshot fetch failed");
                FetchOutcome::Failed {
                    error,
                    escalate_stale,
                }
            }
        }
    }

    async fn request_snapshot(&self, symbol: &str) -> Result<DepthSnapshot, SnapshotError> {
        let url = format!("{}/fapi/v1/depth", self.rest_url);
        let response = self
            .http
            .get(url)
            .query(&[
                ("symbol", symbol.to_uppercase()),
                ("limit", self.snapshot_limit.to_string()),
            ])
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    SnapshotError::Timeout(REST_TIMEOUT_MS)
                } else {
                    SnapshotError::Http(Box::new(error))
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 || status.as_u16() == 418 {
            let retry_after_ms = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1_000)
                .unwrap_or(self.limits.backoff_min_ms);
            return Err(SnapshotError::RateLimited {
                status: status.as_u16(),
                retry_after_ms,
            });
        }
        if !status.is_success() {
            return Err(SnapshotError::Status(status.as_u16()));
        }

        let payload: RestDepthSnapshot = response
            .json()
            .await
            .map_err(|e| SnapshotError::Http(Box::new(e)))?;

        Ok(DepthSnapshot {
            last_update_id: payload.last_update_id,
            bids: parse_levels(payload.bids)?,
            asks: parse_levels(payload.asks)?,
        })
    }
}

fn new_state(backoff_min_ms: u64) -> SymbolFetchState {
    SymbolFetchState {
        last_attempt_ms: 0,
        last_ok_ms: 0,
        backoff_ms: backoff_min_ms,
        consecutive_errors: 0,
        resyncing: false,
    }
}

/// Unseeded and resyncing books skip the per-symbol interval; live and
/// stale ones wait out max(min_interval, current backoff).
fn may_attempt(
    state: &SymbolFetchState,
    lifecycle: BookLifecycle,
    now_ms: u64,
    limits: FetchLimits,
) -> bool {
    match lifecycle {
        BookLifecycle::Unseeded | BookLifecycle::Resyncing => true,
        BookLifecycle::Live | BookLifecycle::Stale => {
            let wait = limits.min_interval_ms.max(state.backoff_ms);
            now_ms.saturating_sub(state.last_attempt_ms) >= wait
        }
    }
}

fn parse_levels(levels: Vec<[String; 2]>) -> Result<Vec<LevelUpdate>, SnapshotError> {
    let mut parsed = Vec::with_capacity(levels.len());
    for [price_raw, qty_raw] in levels {
        let price = price_raw
            .parse::<f64>()
            .map_err(|_| SnapshotError::InvalidNumber(price_raw.clone()))?;
        let qty = qty_raw
            .parse::<f64>()
            .map_err(|_| SnapshotError::InvalidNumber(qty_raw.clone()))?;
        parsed.push(LevelUpdate { price, qty });
    }
    Ok(parsed)
}

#[derive(Debug, Deserialize)]
struct RestDepthSnapshot {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

#[cfg(test)]
mod tests {
    use super::{may_attempt, new_state, FetchLimits, SnapshotFetcher};
    use crate::config::MarketDataConfig;
    use crate::orderbook::BookLifecycle;

    const LIMITS: FetchLimits = FetchLimits {
        min_interval_ms: 60_000,
        backoff_min_ms: 5_000,
        backoff_max_ms: 120_000,
    };

    #[test]
    fn live_symbols_wait_out_min_interval() {
        let mut state = new_state(5_000);
        state.last_attempt_ms = 100_000;

        assert!(!may_attempt(&state, BookLifecycle::Live, 150_000, LIMITS));
        assert!(may_attempt(&state, BookLifecycle::Live, 160_000, LIMITS));
    }

    #[test]
    fn backoff_extends_the_wait_beyond_min_interval() {
        let mut state = new_state(5_000);
        state.last_attempt_ms = 100_000;
        state.backoff_ms = 90_000;

        assert!(!may_attempt(&state, BookLifecycle::Stale, 160_000, LIMITS));
        assert!(may_attempt(&state, BookLifecycle::Stale, 190_000, LIMITS));
    }

    #[tokio::test]
    async fn one_resync_in_flight_per_symbol() {
        let fetcher =
            SnapshotFetcher::from_config(&MarketDataConfig::default()).expect("fetcher builds");

        assert!(fetcher.try_begin_resync("BTCUSDT").await);
        assert!(!fetcher.try_begin_resync("BTCUSDT").await);
        // Other symbols are independent.
        assert!(fetcher.try_begin_resync("ETHUSDT").await);
    }

    #[test]
    fn unseeded_and_resyncing_bypass_local_throttle() {
        let mut state = new_state(5_000);
        state.last_attempt_ms = 100_000;
        state.backoff_ms = 120_000;

        assert!(may_attempt(&state, BookLifecycle::Unseeded, 100_001, LIMITS));
        assert!(may_attempt(
            &state,
            BookLifecycle::Resyncing,
            100_001,
            LIMITS
        ));
    }
}
