use serde::{Deserialize, Serialize};

use crate::config::{GateModeSetting, GateSettings};
use crate::metrics::MetricsEnvelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateMode {
    V1NoLatency,
    V2NetworkLatency,
}

impl From<GateModeSetting> for GateMode {
    fn from(setting: GateModeSetting) -> Self {
        match setting {
            GateModeSetting::V1NoLatency => Self::V1NoLatency,
            GateModeSetting::V2NetworkLatency => Self::V2NetworkLatency,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateReason {
    MissingMetrics,
    SpreadTooWide,
    InsufficientLiquidity,
    NetworkLatencyTooHigh,
}

impl GateReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingMetrics => "missing_metrics",
            Self::SpreadTooWide => "spread_too_wide",
            Self::InsufficientLiquidity => "insufficient_liquidity",
            Self::NetworkLatencyTooHigh => "network_latency_too_high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateChecks {
    pub metrics_present: bool,
    pub spread_ok: bool,
    pub liquidity_ok: bool,
    /// Absent under V1_NO_LATENCY; latency never gates there.
    pub latency_ok: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    pub mode: GateMode,
    pub max_spread_pct: f64,
    pub min_obi_deep: f64,
    pub max_network_latency_ms: u64,
}

impl From<&GateSettings> for GateConfig {
    fn from(settings: &GateSettings) -> Self {
        Self {
            mode: settings.mode.into(),
            max_spread_pct: settings.max_spread_pct,
            min_obi_deep: settings.min_obi_deep,
            max_network_latency_ms: settings.max_network_latency_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub mode: GateMode,
    pub passed: bool,
    pub reason: Option<GateReason>,
    pub network_latency_ms: Option<u64>,
    pub checks: GateChecks,
}

/// Pure data-quality gate: the result is a function of the envelope and the
/// config alone. Reason priority: missing_metrics > spread_too_wide >
/// insufficient_liquidity > network_latency_too_high.
pub fn evaluate(envelope: &MetricsEnvelope, config: &GateConfig) -> GateResult {
    let metrics_present = envelope.spread_pct.is_finite()
        && envelope.prints_per_second.is_finite()
        && envelope.legacy.as_ref().is_some_and(|legacy| {
            legacy.obi_deep.is_finite()
                && legacy.delta_z.is_finite()
                && legacy.cvd_slope.is_finite()
        });

    let spread_ok = metrics_present && envelope.spread_pct <= config.max_spread_pct;
    let liquidity_ok = metrics_present
        && envelope
            .legacy
            .as_ref()
            .is_some_and(|legacy| legacy.obi_deep.abs() >= config.min_obi_deep);

    let (network_latency_ms, latency_ok) = match config.mode {
        GateMode::V1NoLatency => (None, None),
        GateMode::V2NetworkLatency => {
            let latency = envelope
                .canonical_time_ms
                .saturating_sub(envelope.exchange_event_time_ms);
            (Some(latency), Some(latency <= config.max_network_latency_ms))
        }
    };

    let reason = if !metrics_present {
        Some(GateReason::MissingMetrics)
    } else if !spread_ok {
        Some(GateReason::SpreadTooWide)
    } else if !liquidity_ok {
        Some(GateReason::InsufficientLiquidity)
    } else if latency_ok == Some(false) {
        Some(GateReason::NetworkLatencyTooHigh)
    } else {
        None
    };

    GateResult {
        mode: config.mode,
        passed: reason.is_none(),
        reason,
        network_latency_ms,
        checks: GateChecks {
            metrics_present,
            spread_ok,
            liquidity_ok,
            latency_ok,
        },
    }
}
