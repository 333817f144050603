use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::constants::{
    DEFAULT_DOWNLOAD_TIMEOUT_SECONDS, DEFAULT_FORECAST_CONCURRENCY, DEFAULT_HEAD_TIMEOUT_SECONDS,
    DEFAULT_LISTING_TIMEOUT_SECONDS, DEFAULT_RANGE_PROBE_TIMEOUT_SECONDS,
    DEFAULT_RASTER_CACHE_TTL_SECONDS, DEFAULT_SEARCH_WINDOW_MINUTES, MRMS_ARCHIVE_BASE_URL,
    MRMS_BUCKET_URL, MRMS_HTTP_BASE_URL, NOAA_BATTERY_STATION, NOAA_TIDES_BASE_URL, NWS_BASE_URL,
    STAGE4_ARCHIVE_BASE_URLS,
};
use crate::risk::{StructureThresholds, ThresholdPair, ThresholdTable};
use crate::utils::normalize_base_url;

/// Which archive family answers requests for past times.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HistoricalSource {
    Stage4,
    Mrms,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub mrms_bucket_url: String,
    pub mrms_http_base_url: String,
    pub mrms_archive_base_urls: Vec<String>,
    pub stage4_archive_base_urls: Vec<String>,
    pub historical_source: HistoricalSource,
    pub download_timeout: Duration,
    pub listing_timeout: Duration,
    pub head_timeout: Duration,
    pub range_probe_timeout: Duration,
    pub raster_cache_ttl: Duration,
    pub search_window_minutes: i64,
    pub forecast_concurrency: usize,
    pub noaa_tides_base_url: String,
    pub tide_station: String,
    pub nws_base_url: String,
    pub thresholds: ThresholdTable,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mrms_bucket_url: MRMS_BUCKET_URL.to_string(),
            mrms_http_base_url: MRMS_HTTP_BASE_URL.to_string(),
            mrms_archive_base_urls: split_urls(MRMS_ARCHIVE_BASE_URL),
            stage4_archive_base_urls: split_urls(STAGE4_ARCHIVE_BASE_URLS),
            historical_source: HistoricalSource::Stage4,
            download_timeout: Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECONDS),
            listing_timeout: Duration::from_secs(DEFAULT_LISTING_TIMEOUT_SECONDS),
            head_timeout: Duration::from_secs(DEFAULT_HEAD_TIMEOUT_SECONDS),
            range_probe_timeout: Duration::from_secs(DEFAULT_RANGE_PROBE_TIMEOUT_SECONDS),
            raster_cache_ttl: Duration::from_secs(DEFAULT_RASTER_CACHE_TTL_SECONDS),
            search_window_minutes: DEFAULT_SEARCH_WINDOW_MINUTES,
            forecast_concurrency: DEFAULT_FORECAST_CONCURRENCY,
            noaa_tides_base_url: NOAA_TIDES_BASE_URL.to_string(),
            tide_station: NOAA_BATTERY_STATION.to_string(),
            nws_base_url: NWS_BASE_URL.to_string(),
            thresholds: ThresholdTable::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let mrms_bucket_url =
            normalize_base_url(&env_string("PRECIP_MRMS_BUCKET_URL", MRMS_BUCKET_URL));
        let mrms_http_base_url =
            normalize_base_url(&env_string("PRECIP_MRMS_HTTP_BASE_URL", MRMS_HTTP_BASE_URL));
        let mrms_archive_base_urls =
            env_list("PRECIP_MRMS_ARCHIVE_BASE_URLS", MRMS_ARCHIVE_BASE_URL)?;
        let stage4_archive_base_urls =
            env_list("PRECIP_STAGE4_ARCHIVE_BASE_URLS", STAGE4_ARCHIVE_BASE_URLS)?;
        let historical_source =
            parse_historical_source(&env_string("PRECIP_HISTORICAL_SOURCE", "stage4"))?;

        let download_timeout = Duration::from_secs(env_u64(
            "PRECIP_DOWNLOAD_TIMEOUT_SECONDS",
            DEFAULT_DOWNLOAD_TIMEOUT_SECONDS,
        )?);
        let listing_timeout = Duration::from_secs(env_u64(
            "PRECIP_LISTING_TIMEOUT_SECONDS",
            DEFAULT_LISTING_TIMEOUT_SECONDS,
        )?);
        let head_timeout = Duration::from_secs(env_u64(
            "PRECIP_HEAD_TIMEOUT_SECONDS",
            DEFAULT_HEAD_TIMEOUT_SECONDS,
        )?);
        let range_probe_timeout = Duration::from_secs(env_u64(
            "PRECIP_RANGE_PROBE_TIMEOUT_SECONDS",
            DEFAULT_RANGE_PROBE_TIMEOUT_SECONDS,
        )?);
        let raster_cache_ttl = Duration::from_secs(env_u64(
            "PRECIP_RASTER_CACHE_TTL_SECONDS",
            DEFAULT_RASTER_CACHE_TTL_SECONDS,
        )?);
        let search_window_minutes = env_u64(
            "PRECIP_SEARCH_WINDOW_MINUTES",
            DEFAULT_SEARCH_WINDOW_MINUTES as u64,
        )? as i64;
        let forecast_concurrency = env_u64(
            "PRECIP_FORECAST_CONCURRENCY",
            DEFAULT_FORECAST_CONCURRENCY as u64,
        )?
        .max(1) as usize;

        let noaa_tides_base_url =
            normalize_base_url(&env_string("PRECIP_NOAA_TIDES_BASE_URL", NOAA_TIDES_BASE_URL));
        let tide_station = env_string("PRECIP_TIDE_STATION", NOAA_BATTERY_STATION);
        let nws_base_url = normalize_base_url(&env_string("PRECIP_NWS_BASE_URL", NWS_BASE_URL));
        let thresholds = thresholds_from_env(&defaults.thresholds)?;

        Ok(Self {
            mrms_bucket_url,
            mrms_http_base_url,
            mrms_archive_base_urls,
            stage4_archive_base_urls,
            historical_source,
            download_timeout,
            listing_timeout,
            head_timeout,
            range_probe_timeout,
            raster_cache_ttl,
            search_window_minutes,
            forecast_concurrency,
            noaa_tides_base_url,
            tide_station,
            nws_base_url,
            thresholds,
        })
    }
}

fn parse_historical_source(value: &str) -> Result<HistoricalSource> {
    match value.trim().to_ascii_lowercase().as_str() {
        "stage4" | "stage-iv" | "stageiv" => Ok(HistoricalSource::Stage4),
        "mrms" => Ok(HistoricalSource::Mrms),
        other => bail!("PRECIP_HISTORICAL_SOURCE must be stage4 or mrms, got {other}"),
    }
}

fn thresholds_from_env(defaults: &ThresholdTable) -> Result<ThresholdTable> {
    Ok(ThresholdTable {
        underground: env_structure_thresholds("SUBWAY", defaults.underground)?,
        open_cut: env_structure_thresholds("OPEN_CUT", defaults.open_cut)?,
        elevated: env_structure_thresholds("ELEVATED", defaults.elevated)?,
        coastal: env_structure_thresholds("COASTAL", defaults.coastal)?,
        default: env_structure_thresholds("DEFAULT", defaults.default)?,
        tide_high_level_ft: env_f64("PRECIP_TIDE_HIGH_LEVEL_FT", defaults.tide_high_level_ft)?,
    })
}

fn env_structure_thresholds(
    structure: &str,
    defaults: StructureThresholds,
) -> Result<StructureThresholds> {
    let pair = |tier: &str, default: ThresholdPair| -> Result<ThresholdPair> {
        Ok(ThresholdPair::new(
            env_optional_f64(
                &format!("PRECIP_{structure}_{tier}_RATE"),
                default.rate_in_hr,
            )?,
            env_optional_f64(
                &format!("PRECIP_{structure}_{tier}_ACCUM_6H"),
                default.accum_6hr_in,
            )?,
        ))
    };
    Ok(StructureThresholds::new(
        pair("HIGH", defaults.high)?,
        pair("AT_RISK", defaults.at_risk)?,
    ))
}

fn split_urls(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(normalize_base_url)
        .filter(|url| !url.is_empty())
        .collect()
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_list(name: &str, default: &str) -> Result<Vec<String>> {
    let urls = split_urls(&env_string(name, default));
    if urls.is_empty() {
        bail!("{name} must list at least one URL");
    }
    Ok(urls)
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Ok(value) => value
            .parse::<u64>()
            .with_context(|| format!("Failed to parse {}={} as u64", name, value)),
        Err(_) => Ok(default),
    }
}

fn env_f64(name: &str, default: f64) -> Result<f64> {
    match std::env::var(name) {
        Ok(value) => value
            .parse::<f64>()
            .with_context(|| format!("Failed to parse {}={} as f64", name, value)),
        Err(_) => Ok(default),
    }
}

/// Like `env_f64`, but `none` clears the threshold.
fn env_optional_f64(name: &str, default: Option<f64>) -> Result<Option<f64>> {
    match std::env::var(name) {
        Ok(value) if value.trim().eq_ignore_ascii_case("none") => Ok(None),
        Ok(value) => value
            .trim()
            .parse::<f64>()
            .map(Some)
            .with_context(|| format!("Failed to parse {}={} as f64", name, value)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_mirrors_are_in_priority_order() {
        let config = Config::default();
        assert_eq!(config.stage4_archive_base_urls.len(), 2);
        assert!(config.stage4_archive_base_urls[0].starts_with("https://mesonet."));
        assert!(config.stage4_archive_base_urls[1].starts_with("https://mesonet2."));
        assert_eq!(config.historical_source, HistoricalSource::Stage4);
    }

    #[test]
    fn split_urls_trims_and_drops_blanks() {
        assert_eq!(
            split_urls(" https://a.example/data/ ,, https://b.example "),
            vec!["https://a.example/data", "https://b.example"]
        );
    }

    #[test]
    fn historical_source_parsing() {
        assert_eq!(
            parse_historical_source("MRMS").expect("mrms"),
            HistoricalSource::Mrms
        );
        assert_eq!(
            parse_historical_source("stage4").expect("stage4"),
            HistoricalSource::Stage4
        );
        assert!(parse_historical_source("radar").is_err());
    }

    #[test]
    fn threshold_overrides_read_from_environment() {
        std::env::set_var("PRECIP_OPEN_CUT_HIGH_RATE", "0.9");
        std::env::set_var("PRECIP_OPEN_CUT_AT_RISK_ACCUM_6H", "none");
        let table = thresholds_from_env(&ThresholdTable::default()).expect("thresholds");
        std::env::remove_var("PRECIP_OPEN_CUT_HIGH_RATE");
        std::env::remove_var("PRECIP_OPEN_CUT_AT_RISK_ACCUM_6H");

        assert_eq!(table.open_cut.high.rate_in_hr, Some(0.9));
        assert_eq!(table.open_cut.at_risk.accum_6hr_in, None);
        assert_eq!(table.underground, ThresholdTable::default().underground);
    }
}
