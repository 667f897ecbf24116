use serde::Deserialize;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub general: GeneralConfig,
    #[serde(default)]
    pub marketdata: MarketDataConfig,
    #[serde(default)]
    pub gate: GateSettings,
    #[serde(default)]
    pub decision: DecisionSettings,
    #[serde(default)]
    pub logger: LoggerSettings,
    #[serde(default)]
    pub execution: ExecutionSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    pub symbols: Vec<String>,
    #[serde(default = "default_logs_dir")]
    pub logs_dir: String,
}

impl GeneralConfig {
    pub fn symbols_upper(&self) -> Vec<String> {
        self.symbols.iter().map(|s| s.to_uppercase()).collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketDataConfig {
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
    #[serde(default = "default_depth_stream")]
    pub depth_stream: String,
    #[serde(default = "default_snapshot_limit")]
    pub snapshot_limit: u32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_ping_interval_s")]
    pub ping_interval_s: u64,
    #[serde(default = "default_channel_buffer")]
    pub channel_buffer: usize,
    #[serde(default = "default_trade_window_ms")]
    pub trade_window_ms: u64,
    #[serde(default = "default_cvd_timeframes_s")]
    pub cvd_timeframes_s: Vec<u64>,
    #[serde(default = "default_max_gap_tolerance")]
    pub max_gap_tolerance: u64,
    #[serde(default = "default_diff_buffer_cap")]
    pub diff_buffer_cap: usize,
    #[serde(default = "default_snapshot_min_interval_ms")]
    pub snapshot_min_interval_ms: u64,
    #[serde(default = "default_snapshot_backoff_min_ms")]
    pub snapshot_backoff_min_ms: u64,
    #[serde(default = "default_snapshot_backoff_max_ms")]
    pub snapshot_backoff_max_ms: u64,
    #[serde(default = "default_broadcast_throttle_ms")]
    pub broadcast_throttle_ms: u64,
    #[serde(default = "default_book_depth_levels")]
    pub book_depth_levels: usize,
    #[serde(default = "default_ws_bind_addr")]
    pub ws_bind_addr: String,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            rest_url: default_rest_url(),
            depth_stream: default_depth_stream(),
            snapshot_limit: default_snapshot_limit(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            ping_interval_s: default_ping_interval_s(),
            channel_buffer: default_channel_buffer(),
            trade_window_ms: default_trade_window_ms(),
            cvd_timeframes_s: default_cvd_timeframes_s(),
            max_gap_tolerance: default_max_gap_tolerance(),
            diff_buffer_cap: default_diff_buffer_cap(),
            snapshot_min_interval_ms: default_snapshot_min_interval_ms(),
            snapshot_backoff_min_ms: default_snapshot_backoff_min_ms(),
            snapshot_backoff_max_ms: default_snapshot_backoff_max_ms(),
            broadcast_throttle_ms: default_broadcast_throttle_ms(),
            book_depth_levels: default_book_depth_levels(),
            ws_bind_addr: default_ws_bind_addr(),
        }
    }
}

impl MarketDataConfig {
    pub fn channel_buffer(&self) -> usize {
        self.channel_buffer.max(1)
    }

    pub fn snapshot_limit(&self) -> u32 {
        self.snapshot_limit.clamp(1, 1_000)
    }

    pub fn reconnect_delay_ms(&self) -> u64 {
        self.reconnect_delay_ms.max(1)
    }

    pub fn ping_interval_s(&self) -> u64 {
        self.ping_interval_s.max(1)
    }

    pub fn trade_window_ms(&self) -> u64 {
        self.trade_window_ms.max(1_000)
    }

    pub fn cvd_timeframes_s(&self) -> Vec<u64> {
        if self.cvd_timeframes_s.is_empty() {
            default_cvd_timeframes_s()
        } else {
            self.cvd_timeframes_s.iter().map(|s| (*s).max(1)).collect()
        }
    }

    pub fn diff_buffer_cap(&self) -> usize {
        self.diff_buffer_cap.max(1)
    }

    pub fn snapshot_backoff_min_ms(&self) -> u64 {
        self.snapshot_backoff_min_ms.max(1)
    }

    pub fn snapshot_backoff_max_ms(&self) -> u64 {
        self.snapshot_backoff_max_ms
            .max(self.snapshot_backoff_min_ms())
    }

    pub fn book_depth_levels(&self) -> usize {
        self.book_depth_levels.clamp(1, 100)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateModeSetting {
    V1NoLatency,
    V2NetworkLatency,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GateSettings {
    #[serde(default = "default_gate_mode")]
    pub mode: GateModeSetting,
    #[serde(default = "default_max_spread_pct")]
    pub max_spread_pct: f64,
    #[serde(default = "default_min_obi_deep")]
    pub min_obi_deep: f64,
    #[serde(default = "default_max_network_latency_ms")]
    pub max_network_latency_ms: u64,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            mode: default_gate_mode(),
            max_spread_pct: default_max_spread_pct(),
            min_obi_deep: default_min_obi_deep(),
            max_network_latency_ms: default_max_network_latency_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecisionSettings {
    #[serde(default = "default_initial_margin_usdt")]
    pub initial_margin_usdt: f64,
    #[serde(default = "default_max_leverage")]
    pub max_leverage: f64,
    #[serde(default = "default_cooldown_min_ms")]
    pub cooldown_min_ms: u64,
    #[serde(default = "default_cooldown_max_ms")]
    pub cooldown_max_ms: u64,
}

impl Default for DecisionSettings {
    fn default() -> Self {
        Self {
            initial_margin_usdt: default_initial_margin_usdt(),
            max_leverage: default_max_leverage(),
            cooldown_min_ms: default_cooldown_min_ms(),
            cooldown_max_ms: default_cooldown_max_ms(),
        }
    }
}

impl DecisionSettings {
    pub fn cooldown_max_ms(&self) -> u64 {
        self.cooldown_max_ms.max(self.cooldown_min_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggerSettings {
    #[serde(default = "default_logger_queue_limit")]
    pub queue_limit: usize,
    #[serde(default = "default_drop_halt_threshold")]
    pub drop_halt_threshold: u64,
}

impl Default for LoggerSettings {
    fn default() -> Self {
        Self {
            queue_limit: default_logger_queue_limit(),
            drop_halt_threshold: default_drop_halt_threshold(),
        }
    }
}

impl LoggerSettings {
    pub fn queue_limit(&self) -> usize {
        self.queue_limit.max(1)
    }

    pub fn drop_halt_threshold(&self) -> u64 {
        self.drop_halt_threshold.max(1)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_execution_testnet")]
    pub testnet: bool,
    #[serde(default = "default_execution_rest_url")]
    pub rest_url: String,
    #[serde(default = "default_execution_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_execution_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_execution_recv_window_ms")]
    pub recv_window_ms: u64,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            testnet: default_execution_testnet(),
            rest_url: default_execution_rest_url(),
            ws_url: default_execution_ws_url(),
            timeout_ms: default_execution_timeout_ms(),
            recv_window_ms: default_execution_recv_window_ms(),
        }
    }
}

impl ExecutionSettings {
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms.max(100)
    }

    pub fn recv_window_ms(&self) -> u64 {
        self.recv_window_ms.max(1)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl AppConfig {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let cfg: AppConfig = toml::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.general.symbols.is_empty() {
            return Err(ConfigError::Invalid(
                "general.symbols must name at least one symbol".to_string(),
            ));
        }
        if self.gate.max_spread_pct <= 0.0 {
            return Err(ConfigError::Invalid(
                "gate.max_spread_pct must be > 0".to_string(),
            ));
        }
        if self.decision.initial_margin_usdt <= 0.0 || self.decision.max_leverage <= 0.0 {
            return Err(ConfigError::Invalid(
                "decision.initial_margin_usdt and decision.max_leverage must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_logs_dir() -> String {
    "logs".to_string()
}

fn default_ws_url() -> String {
    "wss://fstream.binance.com/stream".to_string()
}

fn default_rest_url() -> String {
    "https://fapi.binance.com".to_string()
}

fn default_depth_stream() -> String {
    "depth@100ms".to_string()
}

fn default_snapshot_limit() -> u32 {
    1_000
}

fn default_reconnect_delay_ms() -> u64 {
    5_000
}

fn default_ping_interval_s() -> u64 {
    15
}

fn default_channel_buffer() -> usize {
    4_096
}

fn default_trade_window_ms() -> u64 {
    60_000
}

fn default_cvd_timeframes_s() -> Vec<u64> {
    vec![60, 300, 900]
}

fn default_max_gap_tolerance() -> u64 {
    100
}

fn default_diff_buffer_cap() -> usize {
    1_000
}

fn default_snapshot_min_interval_ms() -> u64 {
    60_000
}

fn default_snapshot_backoff_min_ms() -> u64 {
    5_000
}

fn default_snapshot_backoff_max_ms() -> u64 {
    120_000
}

fn default_broadcast_throttle_ms() -> u64 {
    250
}

fn default_book_depth_levels() -> usize {
    20
}

fn default_ws_bind_addr() -> String {
    "127.0.0.1:8090".to_string()
}

fn default_gate_mode() -> GateModeSetting {
    GateModeSetting::V1NoLatency
}

fn default_max_spread_pct() -> f64 {
    0.08
}

fn default_min_obi_deep() -> f64 {
    0.05
}

fn default_max_network_latency_ms() -> u64 {
    1_500
}

fn default_initial_margin_usdt() -> f64 {
    50.0
}

fn default_max_leverage() -> f64 {
    5.0
}

fn default_cooldown_min_ms() -> u64 {
    2_000
}

fn default_cooldown_max_ms() -> u64 {
    60_000
}

fn default_logger_queue_limit() -> usize {
    5_000
}

fn default_drop_halt_threshold() -> u64 {
    200
}

fn default_execution_testnet() -> bool {
    true
}

fn default_execution_rest_url() -> String {
    "https://testnet.binancefuture.com".to_string()
}

fn default_execution_ws_url() -> String {
    "wss://stream.binancefuture.com/ws".to_string()
}

fn default_execution_timeout_ms() -> u64 {
    10_000
}

fn default_execution_recv_window_ms() -> u64 {
    5_000
}

#[cfg(test)]
mod tests {
    use super::{AppConfig, GateModeSetting};

    #[test]
    fn parses_minimal_config_with_defaults() {
        let raw = r#"
            [general]
            symbols = ["btcusdt", "ETHUSDT"]
        "#;
        let cfg: AppConfig = toml::from_str(raw).expect("minimal config parses");

        assert_eq!(cfg.general.symbols_upper(), vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(cfg.marketdata.max_gap_tolerance, 100);
        assert_eq!(cfg.marketdata.broadcast_throttle_ms, 250);
        assert_eq!(cfg.marketdata.snapshot_min_interval_ms, 60_000);
        assert_eq!(cfg.marketdata.cvd_timeframes_s(), vec![60, 300, 900]);
        assert_eq!(cfg.gate.mode, GateModeSetting::V1NoLatency);
        assert_eq!(cfg.logger.queue_limit(), 5_000);
        assert_eq!(cfg.logger.drop_halt_threshold(), 200);
        assert_eq!(cfg.execution.timeout_ms(), 10_000);
    }

    #[test]
    fn gate_mode_names_follow_wire_spelling() {
        let raw = r#"
            [general]
            symbols = ["BTCUSDT"]

            [gate]
            mode = "V2_NETWORK_LATENCY"
            max_network_latency_ms = 100
        "#;
        let cfg: AppConfig = toml::from_str(raw).expect("config parses");
        assert_eq!(cfg.gate.mode, GateModeSetting::V2NetworkLatency);
        assert_eq!(cfg.gate.max_network_latency_ms, 100);
    }

    #[test]
    fn backoff_bounds_are_ordered() {
        let raw = r#"
            [general]
            symbols = ["BTCUSDT"]

            [marketdata]
            snapshot_backoff_min_ms = 9000
            snapshot_backoff_max_ms = 1000
        "#;
        let cfg: AppConfig = toml::from_str(raw).expect("config parses");
        assert_eq!(cfg.marketdata.snapshot_backoff_min_ms(), 9_000);
        assert_eq!(cfg.marketdata.snapshot_backoff_max_ms(), 9_000);
    }
}
