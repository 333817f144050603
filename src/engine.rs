use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::cache::RetrievalCaches;
use crate::config::{Config, HistoricalSource};
use crate::constants::{DEFAULT_RASTER_CACHE_TTL_SECONDS, HISTORICAL_CUTOFF_MINUTES};
use crate::error::RetrievalError;
use crate::forecast::{fetch_forecasts, ForecastSource, NwsForecastClient};
use crate::grib::DecodeFn;
use crate::http_client::Transport;
use crate::locator::{MrmsLocator, Stage4Locator};
use crate::risk::{Observation, ThresholdTable};
use crate::sampler::{sample_hourly_window, sample_products};
use crate::tides::{NoaaTidesClient, TideSource};
use crate::types::{
    CoordKey, ForecastTotals, GeoPoint, PrecipSource, RiskReport, RiskTier, SampleResult,
    Station, StationRisk,
};

#[derive(Clone, Copy, Debug, Default)]
pub struct AssessmentRequest {
    /// Report time; `None` means now.
    pub at: Option<DateTime<Utc>>,
    pub with_forecast: bool,
    /// Drop LOW stations from the report.
    pub risk_only: bool,
}

struct StationSamples {
    source: PrecipSource,
    samples: Vec<SampleResult>,
    source_urls: Vec<String>,
}

/// Samples precipitation at stations and classifies their flood risk.
pub struct FloodRiskEngine {
    mrms: MrmsLocator,
    stage4: Stage4Locator,
    tides: Arc<dyn TideSource>,
    forecasts: Arc<dyn ForecastSource>,
    thresholds: ThresholdTable,
    historical_source: HistoricalSource,
    forecast_concurrency: usize,
}

impl FloodRiskEngine {
    pub fn new(cfg: &Config, transport: Arc<dyn Transport>) -> Self {
        let tides = Arc::new(NoaaTidesClient::new(cfg, transport.clone()));
        let forecasts = Arc::new(NwsForecastClient::new(cfg, transport.clone()));
        Self::with_sources(cfg, transport, tides, forecasts)
    }

    pub fn with_sources(
        cfg: &Config,
        transport: Arc<dyn Transport>,
        tides: Arc<dyn TideSource>,
        forecasts: Arc<dyn ForecastSource>,
    ) -> Self {
        let raster_ttl = Duration::from_std(cfg.raster_cache_ttl)
            .unwrap_or_else(|_| Duration::seconds(DEFAULT_RASTER_CACHE_TTL_SECONDS as i64));
        let caches = Arc::new(RetrievalCaches::new(raster_ttl));
        Self {
            mrms: MrmsLocator::new(cfg, transport.clone(), caches.clone()),
            stage4: Stage4Locator::new(cfg, transport, caches),
            tides,
            forecasts,
            thresholds: cfg.thresholds,
            historical_source: cfg.historical_source,
            forecast_concurrency: cfg.forecast_concurrency,
        }
    }

    pub fn with_decoder(mut self, decode: DecodeFn) -> Self {
        self.mrms = self.mrms.with_decoder(decode);
        self.stage4 = self.stage4.with_decoder(decode);
        self
    }

    pub async fn is_available(&self) -> bool {
        self.mrms.is_available().await
    }

    pub async fn assess(
        &self,
        stations: &[Station],
        request: &AssessmentRequest,
    ) -> Result<RiskReport, RetrievalError> {
        self.assess_at(stations, request, Utc::now()).await
    }

    /// Builds the report as seen at `now`. Requests more than a few minutes
    /// in the past are served from the historical archives.
    pub async fn assess_at(
        &self,
        stations: &[Station],
        request: &AssessmentRequest,
        now: DateTime<Utc>,
    ) -> Result<RiskReport, RetrievalError> {
        let target = request.at.unwrap_or(now);
        let historical = target < now - Duration::minutes(HISTORICAL_CUTOFF_MINUTES);
        let points: Vec<GeoPoint> = stations.iter().map(Station::point).collect();

        let sampled = if historical {
            self.sample_historical(target, now, &points).await?
        } else {
            self.sample_realtime(now, &points).await
        };
        info!(
            "Sampled {} stations from {:?} for {}",
            points.len(),
            sampled.source,
            target.to_rfc3339()
        );

        let tide_level_ft = if stations.iter().any(Station::is_coastal) {
            self.tide_level(historical.then_some(target)).await
        } else {
            None
        };

        let forecasts: HashMap<CoordKey, Option<ForecastTotals>> = if request.with_forecast {
            fetch_forecasts(self.forecasts.as_ref(), &points, self.forecast_concurrency).await
        } else {
            HashMap::new()
        };

        let mut reported = Vec::with_capacity(stations.len());
        for (station, sample) in stations.iter().zip(sampled.samples) {
            let record = self.station_risk(station, sample, tide_level_ft, &forecasts);
            if request.risk_only && record.risk.tier == RiskTier::Low {
                continue;
            }
            reported.push(record);
        }

        let count = |tier: RiskTier| {
            reported
                .iter()
                .filter(|record| record.risk.tier == tier)
                .count()
        };
        Ok(RiskReport {
            generated_at: now,
            target_time: target,
            source: sampled.source,
            station_count: reported.len(),
            high_risk_count: count(RiskTier::High),
            at_risk_count: count(RiskTier::AtRisk),
            source_urls: sampled.source_urls,
            stations: reported,
        })
    }

    async fn sample_historical(
        &self,
        target: DateTime<Utc>,
        now: DateTime<Utc>,
        points: &[GeoPoint],
    ) -> Result<StationSamples, RetrievalError> {
        match self.historical_source {
            HistoricalSource::Stage4 => {
                let window = self.stage4.hourly_window(target, now).await?;
                let samples = sample_hourly_window(&window.current, &window.hourly, points);
                let mut source_urls = vec![window.current_url];
                for url in window.hourly_urls {
                    if !source_urls.contains(&url) {
                        source_urls.push(url);
                    }
                }
                Ok(StationSamples {
                    source: PrecipSource::Stage4Archive,
                    samples,
                    source_urls,
                })
            }
            HistoricalSource::Mrms => {
                let (products, source_urls) = self.mrms.fetch_products_at(target).await?;
                Ok(StationSamples {
                    source: PrecipSource::MrmsArchive,
                    samples: sample_products(&products, points),
                    source_urls,
                })
            }
        }
    }

    async fn sample_realtime(&self, now: DateTime<Utc>, points: &[GeoPoint]) -> StationSamples {
        let products = self.mrms.fetch_products_as_of(now).await;
        if products.values().all(Option::is_none) {
            warn!("No near-real-time MRMS products available; sampling as zero");
        }
        StationSamples {
            source: PrecipSource::MrmsRealtime,
            samples: sample_products(&products, points),
            source_urls: Vec::new(),
        }
    }

    async fn tide_level(&self, at: Option<DateTime<Utc>>) -> Option<f64> {
        match self.tides.water_level_ft(at).await {
            Ok(level) => Some(level),
            Err(error) => {
                warn!("Tide level unavailable: {error:#}");
                None
            }
        }
    }

    fn station_risk(
        &self,
        station: &Station,
        sample: SampleResult,
        tide_level_ft: Option<f64>,
        forecasts: &HashMap<CoordKey, Option<ForecastTotals>>,
    ) -> StationRisk {
        let is_coastal = station.is_coastal();
        let tide_level_ft = tide_level_ft.filter(|_| is_coastal);
        let risk = self.thresholds.classify(
            &station.structure,
            &Observation {
                precip_rate_in_hr: sample.precip_rate_in_hr,
                accum_6hr_in: sample.accum_6hr_in,
                tide_level_ft,
                is_coastal,
            },
        );

        let forecast = forecasts
            .get(&station.point().coord_key())
            .copied()
            .flatten();
        let predict = |total: f64, hours: u32| {
            self.thresholds
                .classify_forecast(&station.structure, total, hours, tide_level_ft, is_coastal)
        };

        StationRisk {
            station_name: station.name.clone(),
            borough: station.borough.clone(),
            structure: station.structure.clone(),
            latitude: station.latitude,
            longitude: station.longitude,
            is_coastal,
            sample,
            tide_level_ft,
            risk,
            forecast,
            predicted_risk_6hr: forecast.map(|totals| predict(totals.total_6hr_in, 6)),
            predicted_risk_24hr: forecast.map(|totals| predict(totals.total_24hr_in, 24)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MRMS_PRODUCTS;
    use crate::test_support::{fake_decode, MockTransport};
    use crate::types::StructureType;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedTide {
        level: Option<f64>,
        calls: AtomicUsize,
    }

    impl FixedTide {
        fn new(level: Option<f64>) -> Arc<Self> {
            Arc::new(Self {
                level,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TideSource for FixedTide {
        async fn water_level_ft(&self, _at: Option<DateTime<Utc>>) -> Result<f64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.level.ok_or_else(|| anyhow!("tide gauge offline"))
        }
    }

    struct FixedForecast(ForecastTotals);

    #[async_trait]
    impl ForecastSource for FixedForecast {
        async fn forecast_totals(&self, _point: GeoPoint) -> Result<ForecastTotals> {
            Ok(self.0)
        }
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn test_config() -> Config {
        Config {
            mrms_bucket_url: "https://bucket.test".to_string(),
            mrms_http_base_url: "https://realtime.test/2D".to_string(),
            mrms_archive_base_urls: vec!["https://archive.test/mtarchive".to_string()],
            stage4_archive_base_urls: vec!["https://stage4.test/data".to_string()],
            search_window_minutes: 60,
            ..Config::default()
        }
    }

    fn station(name: &str, structure: StructureType) -> Station {
        Station {
            name: name.to_string(),
            latitude: 40.7033,
            longitude: -74.0170,
            structure,
            borough: Some("Manhattan".to_string()),
            coastal: false,
        }
    }

    fn latest_url(http_name: &str) -> String {
        format!("https://realtime.test/2D/{http_name}/MRMS_{http_name}.latest.grib2.gz")
    }

    /// Realtime products served by the latest endpoint, in millimetres.
    fn realtime_transport(rate: &str, one_hour: &str, six_hour: &str) -> Arc<MockTransport> {
        Arc::new(
            MockTransport::new()
                .with_file(&latest_url(MRMS_PRODUCTS[0].http_name), rate)
                .with_file(&latest_url(MRMS_PRODUCTS[1].http_name), one_hour)
                .with_file(&latest_url(MRMS_PRODUCTS[2].http_name), six_hour),
        )
    }

    fn engine(
        cfg: &Config,
        transport: Arc<MockTransport>,
        tides: Arc<FixedTide>,
        forecast: Option<ForecastTotals>,
    ) -> FloodRiskEngine {
        let forecasts = FixedForecast(forecast.unwrap_or(ForecastTotals {
            total_6hr_in: 0.0,
            total_24hr_in: 0.0,
        }));
        FloodRiskEngine::with_sources(cfg, transport, tides, Arc::new(forecasts))
            .with_decoder(fake_decode)
    }

    fn mixed_stations() -> Vec<Station> {
        vec![
            station("Chambers St", StructureType::Underground),
            station("Ditmas Av", StructureType::OpenCut),
            station("Smith-9 Sts", StructureType::Elevated),
        ]
    }

    #[tokio::test]
    async fn realtime_report_classifies_each_structure() {
        let tides = FixedTide::new(Some(6.0));
        let engine = engine(
            &test_config(),
            realtime_transport("15.24", "5.08", "25.4"),
            tides.clone(),
            None,
        );
        let now = utc(2024, 6, 1, 12, 0);

        let report = engine
            .assess_at(&mixed_stations(), &AssessmentRequest::default(), now)
            .await
            .expect("report");
        assert_eq!(report.source, PrecipSource::MrmsRealtime);
        assert_eq!(report.target_time, now);
        assert_eq!(report.station_count, 3);
        assert_eq!(report.high_risk_count, 1);
        assert_eq!(report.at_risk_count, 1);

        let tiers: Vec<RiskTier> = report.stations.iter().map(|s| s.risk.tier).collect();
        assert_eq!(tiers, vec![RiskTier::High, RiskTier::AtRisk, RiskTier::Low]);
        assert!((report.stations[0].sample.precip_rate_in_hr - 0.6).abs() < 1e-6);
        assert!((report.stations[0].sample.accum_6hr_in - 1.0).abs() < 1e-6);
        assert!(report.stations.iter().all(|s| s.tide_level_ft.is_none()));
        assert!(report.stations.iter().all(|s| s.forecast.is_none()));
        assert_eq!(tides.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn risk_only_drops_low_stations_from_counts() {
        let engine = engine(
            &test_config(),
            realtime_transport("15.24", "5.08", "25.4"),
            FixedTide::new(None),
            None,
        );
        let request = AssessmentRequest {
            risk_only: true,
            ..AssessmentRequest::default()
        };
        let report = engine
            .assess_at(&mixed_stations(), &request, utc(2024, 6, 1, 12, 0))
            .await
            .expect("report");
        assert_eq!(report.station_count, 2);
        assert!(report.stations.iter().all(|s| s.risk.tier != RiskTier::Low));
    }

    #[tokio::test]
    async fn realtime_without_products_reports_zeros() {
        let engine = engine(
            &test_config(),
            Arc::new(MockTransport::new()),
            FixedTide::new(None),
            None,
        );
        let report = engine
            .assess_at(&mixed_stations(), &AssessmentRequest::default(), utc(2024, 6, 1, 12, 0))
            .await
            .expect("report");
        assert_eq!(report.high_risk_count, 0);
        assert!(report
            .stations
            .iter()
            .all(|s| s.sample == SampleResult::default() && s.risk.tier == RiskTier::Low));
    }

    #[tokio::test]
    async fn coastal_station_escalates_on_high_tide() {
        let tides = FixedTide::new(Some(5.5));
        let engine = engine(
            &test_config(),
            realtime_transport("0.0", "0.0", "0.0"),
            tides.clone(),
            None,
        );
        let stations = vec![
            station("Broad Channel", StructureType::AtGrade),
            station("Chambers St", StructureType::Underground),
        ];
        let report = engine
            .assess_at(&stations, &AssessmentRequest::default(), utc(2024, 6, 1, 12, 0))
            .await
            .expect("report");

        assert_eq!(tides.calls.load(Ordering::SeqCst), 1);
        let coastal = &report.stations[0];
        assert!(coastal.is_coastal);
        assert_eq!(coastal.tide_level_ft, Some(5.5));
        assert_eq!(coastal.risk.tier, RiskTier::AtRisk);
        assert!(coastal.risk.reason.contains("high tide 5.50 ft"));

        let inland = &report.stations[1];
        assert_eq!(inland.tide_level_ft, None);
        assert_eq!(inland.risk.tier, RiskTier::Low);
    }

    #[tokio::test]
    async fn tide_failure_leaves_report_intact() {
        let engine = engine(
            &test_config(),
            realtime_transport("0.0", "0.0", "0.0"),
            FixedTide::new(None),
            None,
        );
        let stations = vec![station("Broad Channel", StructureType::AtGrade)];
        let report = engine
            .assess_at(&stations, &AssessmentRequest::default(), utc(2024, 6, 1, 12, 0))
            .await
            .expect("report");
        assert_eq!(report.stations[0].tide_level_ft, None);
        assert_eq!(report.stations[0].risk.tier, RiskTier::Low);
    }

    #[tokio::test]
    async fn forecast_drives_predicted_risk() {
        let forecast = ForecastTotals {
            total_6hr_in: 2.1,
            total_24hr_in: 0.3,
        };
        let engine = engine(
            &test_config(),
            realtime_transport("0.0", "0.0", "0.0"),
            FixedTide::new(None),
            Some(forecast),
        );
        let request = AssessmentRequest {
            with_forecast: true,
            ..AssessmentRequest::default()
        };
        let stations = vec![station("Chambers St", StructureType::Underground)];
        let report = engine
            .assess_at(&stations, &request, utc(2024, 6, 1, 12, 0))
            .await
            .expect("report");

        let record = &report.stations[0];
        assert_eq!(record.risk.tier, RiskTier::Low);
        assert_eq!(record.forecast, Some(forecast));
        let six_hour = record.predicted_risk_6hr.as_ref().expect("6h prediction");
        assert_eq!(six_hour.tier, RiskTier::High);
        assert!(six_hour.reason.contains("6h forecast 2.10 in"));
        let day = record.predicted_risk_24hr.as_ref().expect("24h prediction");
        assert_eq!(day.tier, RiskTier::Low);
    }

    #[tokio::test]
    async fn historical_request_reads_stage4_hours() {
        const DAY: &str = "https://stage4.test/data/2024/06/01/stage4/";
        let names: Vec<String> = (7..=12)
            .rev()
            .map(|hour| format!("st4_conus.20240601{hour:02}.01h.grb2"))
            .collect();
        let listing: String = names
            .iter()
            .map(|name| format!("<a href=\"{name}\">{name}</a>\n"))
            .collect();
        let mut transport = MockTransport::new().with_text(DAY, &listing);
        for name in &names {
            transport = transport.with_file(&format!("{DAY}{name}"), "5.08");
        }
        let engine = engine(&test_config(), Arc::new(transport), FixedTide::new(None), None);

        let request = AssessmentRequest {
            at: Some(utc(2024, 6, 1, 12, 0)),
            ..AssessmentRequest::default()
        };
        let stations = vec![station("Chambers St", StructureType::Underground)];
        let report = engine
            .assess_at(&stations, &request, utc(2024, 6, 2, 9, 0))
            .await
            .expect("report");

        assert_eq!(report.source, PrecipSource::Stage4Archive);
        assert_eq!(report.source_urls.len(), 6);
        assert_eq!(report.source_urls[0], format!("{DAY}{}", names[0]));
        let sample = report.stations[0].sample;
        assert!((sample.precip_rate_in_hr - 0.2).abs() < 1e-6);
        assert!((sample.accum_1hr_in - 0.2).abs() < 1e-6);
        assert!((sample.accum_6hr_in - 1.2).abs() < 1e-6);
        assert_eq!(report.stations[0].risk.tier, RiskTier::AtRisk);
    }

    #[tokio::test]
    async fn historical_request_without_data_fails() {
        let engine = engine(
            &test_config(),
            Arc::new(MockTransport::new()),
            FixedTide::new(None),
            None,
        );
        let request = AssessmentRequest {
            at: Some(utc(2024, 6, 1, 12, 0)),
            ..AssessmentRequest::default()
        };
        let result = engine
            .assess_at(&mixed_stations(), &request, utc(2024, 6, 2, 9, 0))
            .await;
        assert!(matches!(result, Err(RetrievalError::NoDataForWindow(_))));
    }

    #[tokio::test]
    async fn historical_mrms_source_uses_archive_mirrors() {
        let cfg = Config {
            historical_source: HistoricalSource::Mrms,
            ..test_config()
        };
        let target = utc(2024, 6, 1, 12, 0);
        let rate_url = "https://archive.test/mtarchive/2024/06/01/mrms/ncep/PrecipRate/PrecipRate_00.00_20240601-120000.grib2.gz"
            .to_string();
        let transport = Arc::new(MockTransport::new().with_file(&rate_url, "12.7"));
        let engine = engine(&cfg, transport, FixedTide::new(None), None);

        let request = AssessmentRequest {
            at: Some(target),
            ..AssessmentRequest::default()
        };
        let stations = vec![station("Chambers St", StructureType::Underground)];
        let report = engine
            .assess_at(&stations, &request, utc(2024, 6, 1, 13, 0))
            .await
            .expect("report");
        assert_eq!(report.source, PrecipSource::MrmsArchive);
        assert_eq!(report.source_urls, vec![rate_url]);
        assert_eq!(report.stations[0].risk.tier, RiskTier::High);
    }
}
