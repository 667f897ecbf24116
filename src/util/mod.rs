use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{TimeZone, Utc};

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// UTC calendar date of an epoch-milliseconds timestamp, as `YYYYMMDD`.
/// Log files rotate on this key, so it is derived from event time, never
/// from the wall clock.
pub fn utc_date_key(epoch_ms: u64) -> String {
    match Utc.timestamp_millis_opt(epoch_ms as i64).single() {
        Some(dt) => dt.format("%Y%m%d").to_string(),
        None => "00000000".to_string(),
    }
}

/// Round to `decimals` places, half away from zero. Order quantities are
/// sized at 6 decimals before quantization against the venue step.
pub fn round_decimals(value: f64, decimals: u32) -> f64 {
    if !value.is_finite() {
        return value;
    }
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

pub fn quantize_price_floor(price: f64, tick_size: f64) -> Option<f64> {
    quantize_floor(price, tick_size)
}

pub fn quantize_qty_floor(qty: f64, step_size: f64) -> Option<f64> {
    quantize_floor(qty, step_size)
}

fn quantize_floor(value: f64, step: f64) -> Option<f64> {
    if !value.is_finite() || !step.is_finite() || value < 0.0 || step <= 0.0 {
        return None;
    }

    let scale = infer_decimal_scale(step);
    let factor = 10f64.powi(scale as i32);

    let value_units = (value * factor + 1e-9).floor();
    let step_units = (step * factor + 1e-9).round();
    if value_units < 0.0 || step_units <= 0.0 {
        return None;
    }

    let quantized_units = (value_units / step_units).floor() * step_units;
    if !quantized_units.is_finite() {
        return None;
    }

    let quantized = quantized_units / factor;
    if !quantized.is_finite() {
        return None;
    }

    // Re-snap to inferred decimal scale to avoid fp tails.
    Some((quantized * factor + 1e-9).floor() / factor)
}

fn infer_decimal_scale(step: f64) -> usize {
    let formatted = format!("{step:.16}");
    match formatted.split_once('.') {
        Some((_, frac)) => frac.trim_end_matches('0').len(),
        None => 0,
    }
}
