use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::Config;
use crate::http_client::Transport;
use crate::sampler::mm_to_inches;
use crate::types::{CoordKey, ForecastTotals, GeoPoint};

#[async_trait]
pub trait ForecastSource: Send + Sync {
    /// Forecast precipitation for the next 6 and 24 hours at `point`.
    async fn forecast_totals(&self, point: GeoPoint) -> Result<ForecastTotals>;
}

/// Fetches forecasts once per rounded coordinate with at most `limit`
/// requests in flight. A failed key maps to `None` without affecting others.
pub async fn fetch_forecasts(
    source: &dyn ForecastSource,
    points: &[GeoPoint],
    limit: usize,
) -> HashMap<CoordKey, Option<ForecastTotals>> {
    let mut unique: HashMap<CoordKey, GeoPoint> = HashMap::with_capacity(points.len());
    for point in points {
        unique.entry(point.coord_key()).or_insert(*point);
    }
    debug!(
        "Fetching forecasts for {} distinct points of {}",
        unique.len(),
        points.len()
    );

    stream::iter(unique)
        .map(|(key, point)| async move { (key, source.forecast_totals(point).await) })
        .buffer_unordered(limit.max(1))
        .map(|(key, result)| {
            let totals = match result {
                Ok(totals) => Some(totals),
                Err(error) => {
                    warn!("Forecast unavailable for {key}: {error:#}");
                    None
                }
            };
            (key, totals)
        })
        .collect()
        .await
}

#[derive(Deserialize)]
struct PointResponse {
    properties: PointProperties,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PointProperties {
    forecast_grid_data: String,
}

#[derive(Deserialize)]
struct GridResponse {
    properties: GridProperties,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GridProperties {
    quantitative_precipitation: GridSeries,
}

#[derive(Deserialize)]
struct GridSeries {
    #[serde(default)]
    uom: Option<String>,
    #[serde(default)]
    values: Vec<GridValue>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GridValue {
    valid_time: String,
    value: Option<f64>,
}

/// National Weather Service gridpoint forecasts.
pub struct NwsForecastClient {
    transport: Arc<dyn Transport>,
    base_url: String,
}

impl NwsForecastClient {
    pub fn new(cfg: &Config, transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            base_url: cfg.nws_base_url.clone(),
        }
    }

    pub fn points_url(&self, point: GeoPoint) -> String {
        format!("{}/points/{:.4},{:.4}", self.base_url, point.lat, point.lon)
    }

    pub async fn forecast_totals_at(
        &self,
        point: GeoPoint,
        now: DateTime<Utc>,
    ) -> Result<ForecastTotals> {
        let points_url = self.points_url(point);
        let body = self.transport.fetch_text(&points_url).await?;
        let grid_url = serde_json::from_str::<PointResponse>(&body)
            .with_context(|| format!("Unexpected points response from {points_url}"))?
            .properties
            .forecast_grid_data;

        let body = self.transport.fetch_text(&grid_url).await?;
        totals_from_grid(&body, now)
            .with_context(|| format!("Unusable gridpoint data from {grid_url}"))
    }
}

#[async_trait]
impl ForecastSource for NwsForecastClient {
    async fn forecast_totals(&self, point: GeoPoint) -> Result<ForecastTotals> {
        self.forecast_totals_at(point, Utc::now()).await
    }
}

/// Sums `quantitativePrecipitation` over the next 6 and 24 hours, prorating
/// intervals that straddle a window edge.
pub fn totals_from_grid(body: &str, now: DateTime<Utc>) -> Result<ForecastTotals> {
    let series = serde_json::from_str::<GridResponse>(body)?
        .properties
        .quantitative_precipitation;
    let to_inches: fn(f64) -> f64 = match series.uom.as_deref() {
        Some(uom) if uom.ends_with(":in") => |value: f64| value,
        _ => mm_to_inches,
    };

    let intervals: Vec<(DateTime<Utc>, Duration, f64)> = series
        .values
        .iter()
        .filter_map(|entry| {
            let (start, length) = parse_valid_time(&entry.valid_time)?;
            Some((start, length, entry.value?))
        })
        .collect();

    let window_total = |hours: i64| -> f64 {
        let window_end = now + Duration::hours(hours);
        intervals
            .iter()
            .map(|(start, length, value)| {
                let end = *start + *length;
                let overlap_start = (*start).max(now);
                let overlap_end = end.min(window_end);
                if overlap_end <= overlap_start {
                    return 0.0;
                }
                let overlap = (overlap_end - overlap_start).num_seconds() as f64;
                value * overlap / length.num_seconds() as f64
            })
            .sum()
    };

    Ok(ForecastTotals {
        total_6hr_in: to_inches(window_total(6)),
        total_24hr_in: to_inches(window_total(24)),
    })
}

/// `2024-06-01T12:00:00+00:00/PT6H` style interval.
fn parse_valid_time(text: &str) -> Option<(DateTime<Utc>, Duration)> {
    let (start, length) = text.split_once('/')?;
    let start = DateTime::parse_from_rfc3339(start).ok()?.with_timezone(&Utc);
    Some((start, parse_iso_duration(length)?))
}

const DATE_UNITS: &[(char, i64)] = &[('W', 604_800), ('D', 86_400)];
const TIME_UNITS: &[(char, i64)] = &[('H', 3_600), ('M', 60), ('S', 1)];

fn parse_iso_duration(text: &str) -> Option<Duration> {
    let body = text.strip_prefix('P')?;
    let (date_part, time_part) = body.split_once('T').unwrap_or((body, ""));

    let mut seconds = 0_i64;
    for (part, units) in [(date_part, DATE_UNITS), (time_part, TIME_UNITS)] {
        let mut number = String::new();
        for ch in part.chars() {
            if ch.is_ascii_digit() {
                number.push(ch);
                continue;
            }
            let (_, scale) = units.iter().find(|(unit, _)| *unit == ch)?;
            seconds += number.parse::<i64>().ok()? * scale;
            number.clear();
        }
        if !number.is_empty() {
            return None;
        }
    }
    (seconds > 0).then(|| Duration::seconds(seconds))
}
