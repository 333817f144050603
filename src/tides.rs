use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::config::Config;
use crate::constants::{TIDE_SEARCH_WINDOW_MINUTES, USER_AGENT};
use crate::http_client::Transport;

#[async_trait]
pub trait TideSource: Send + Sync {
    /// Water level in feet; the latest reading when `at` is `None`.
    async fn water_level_ft(&self, at: Option<DateTime<Utc>>) -> Result<f64>;
}

#[derive(Deserialize)]
struct WaterLevelResponse {
    #[serde(default)]
    data: Vec<WaterLevelRecord>,
    error: Option<ServiceError>,
}

#[derive(Deserialize)]
struct WaterLevelRecord {
    t: String,
    v: String,
}

#[derive(Deserialize)]
struct ServiceError {
    message: String,
}

/// NOAA CO-OPS observed water level for one station, MLLW datum.
pub struct NoaaTidesClient {
    transport: Arc<dyn Transport>,
    base_url: String,
    station: String,
}

impl NoaaTidesClient {
    pub fn new(cfg: &Config, transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            base_url: cfg.noaa_tides_base_url.clone(),
            station: cfg.tide_station.clone(),
        }
    }

    pub fn request_url(&self, at: Option<DateTime<Utc>>) -> String {
        let range = match at {
            None => "date=latest".to_string(),
            Some(at) => {
                let window = Duration::minutes(TIDE_SEARCH_WINDOW_MINUTES);
                let format = |time: DateTime<Utc>| {
                    urlencoding::encode(&time.format("%Y%m%d %H:%M").to_string()).into_owned()
                };
                format!(
                    "begin_date={}&end_date={}",
                    format(at - window),
                    format(at + window)
                )
            }
        };
        format!(
            "{}?{range}&station={}&product=water_level&datum=MLLW&units=english&time_zone=gmt&format=json&application={}",
            self.base_url,
            self.station,
            urlencoding::encode(USER_AGENT)
        )
    }
}

#[async_trait]
impl TideSource for NoaaTidesClient {
    async fn water_level_ft(&self, at: Option<DateTime<Utc>>) -> Result<f64> {
        let url = self.request_url(at);
        let body = self.transport.fetch_text(&url).await?;
        let level = nearest_water_level(&body, at)
            .with_context(|| format!("No usable water level for station {}", self.station))?;
        debug!("Water level at station {}: {level:.2} ft", self.station);
        Ok(level)
    }
}

/// Reading closest to `at`, or the last reading when `at` is `None`.
pub fn nearest_water_level(body: &str, at: Option<DateTime<Utc>>) -> Result<f64> {
    let response: WaterLevelResponse =
        serde_json::from_str(body).context("Unexpected water level response")?;
    if let Some(error) = response.error {
        bail!("tide service error: {}", error.message);
    }

    let readings: Vec<(DateTime<Utc>, f64)> = response
        .data
        .iter()
        .filter_map(|record| {
            let time = NaiveDateTime::parse_from_str(&record.t, "%Y-%m-%d %H:%M")
                .ok()?
                .and_utc();
            let level = record.v.trim().parse::<f64>().ok()?;
            Some((time, level))
        })
        .collect();

    let chosen = match at {
        None => readings.last(),
        Some(target) => readings
            .iter()
            .min_by_key(|(time, _)| (*time - target).num_seconds().abs()),
    };
    chosen
        .map(|(_, level)| *level)
        .ok_or_else(|| anyhow!("no readings in response"))
}
