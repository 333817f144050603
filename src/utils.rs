use std::cmp::max;

use chrono::{DateTime, Utc};

pub fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

pub fn to_lon360(lon_deg: f64) -> f64 {
    let normalized = lon_deg % 360.0;
    if normalized < 0.0 {
        normalized + 360.0
    } else {
        normalized
    }
}

pub fn shortest_lon_delta_degrees(lon_deg360: f64, origin_lon_deg360: f64) -> f64 {
    let mut delta = lon_deg360 - origin_lon_deg360;
    if delta > 180.0 {
        delta -= 360.0;
    }
    if delta < -180.0 {
        delta += 360.0;
    }
    delta
}

pub fn clamp_index(value: f64, len: usize) -> usize {
    if len == 0 || !value.is_finite() {
        return 0;
    }
    value.round().clamp(0.0, (len - 1) as f64) as usize
}

pub fn format_timestamp_compact(timestamp: DateTime<Utc>) -> String {
    timestamp.format("%Y%m%d-%H%M%S").to_string()
}

pub fn floor_timestamp(timestamp: DateTime<Utc>, step_seconds: i64) -> DateTime<Utc> {
    let step_ms = max(step_seconds, 1) * 1000;
    let floored_ms = timestamp.timestamp_millis().div_euclid(step_ms) * step_ms;
    DateTime::<Utc>::from_timestamp_millis(floored_ms).unwrap_or(timestamp)
}

pub fn normalize_base_url(value: &str) -> String {
    value.trim().trim_end_matches('/').to_string()
}
