use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{COASTAL_STATIONS, COORD_KEY_DECIMALS};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductKey {
    PrecipRate,
    Qpe01H,
    Qpe06H,
}

impl fmt::Display for ProductKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::PrecipRate => "precip_rate",
            Self::Qpe01H => "qpe_01h",
            Self::Qpe06H => "qpe_06h",
        };
        f.write_str(label)
    }
}

/// One published MRMS quantity and where each source calls it.
#[derive(Clone, Copy, Debug)]
pub struct RasterProduct {
    pub key: ProductKey,
    pub bucket_name: &'static str,
    pub http_name: &'static str,
    pub interval_minutes: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn coord_key(&self) -> CoordKey {
        let scale = 10_f64.powi(COORD_KEY_DECIMALS);
        CoordKey {
            lat_milli: (self.lat * scale).round() as i64,
            lon_milli: (self.lon * scale).round() as i64,
        }
    }
}

/// Coordinate rounded to 3 decimals (~110 m), used to share forecast lookups.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoordKey {
    pub lat_milli: i64,
    pub lon_milli: i64,
}

impl fmt::Display for CoordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.3},{:.3}",
            self.lat_milli as f64 / 1000.0,
            self.lon_milli as f64 / 1000.0
        )
    }
}

/// Regular lat/lon grid as published in GRIB2 template 3.0.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FixedGrid {
    pub rows: usize,
    pub cols: usize,
    pub first_lat_deg: f64,
    pub first_lon_deg360: f64,
    pub lat_step_deg: f64,
    pub lon_step_deg: f64,
}

/// Explicit per-cell coordinates, row-major, for projected grids.
#[derive(Clone, Debug, PartialEq)]
pub struct LatLonGrid {
    pub rows: usize,
    pub cols: usize,
    pub lats: Vec<f32>,
    pub lons: Vec<f32>,
}

#[derive(Clone, Debug)]
pub enum GridGeometry {
    Fixed(FixedGrid),
    Irregular(Arc<LatLonGrid>),
}

#[derive(Clone, Debug)]
pub struct DecodedRaster {
    pub rows: usize,
    pub cols: usize,
    pub values: Vec<f32>,
    pub geometry: GridGeometry,
}

impl DecodedRaster {
    pub fn value_at(&self, row: usize, col: usize) -> Option<f32> {
        if row >= self.rows || col >= self.cols {
            return None;
        }
        self.values.get(row * self.cols + col).copied()
    }
}

pub type ProductSet = HashMap<ProductKey, Option<Arc<DecodedRaster>>>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct SampleResult {
    pub precip_rate_in_hr: f64,
    pub accum_1hr_in: f64,
    pub accum_6hr_in: f64,
}

/// How a station is built; drives which threshold set applies.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StructureType {
    Underground,
    OpenCut,
    Elevated,
    /// At grade, embankment or otherwise open to coastal surge.
    AtGrade,
    Other(String),
}

impl From<String> for StructureType {
    fn from(value: String) -> Self {
        StructureType::from(value.as_str())
    }
}

impl From<&str> for StructureType {
    fn from(value: &str) -> Self {
        let normalized = value.trim().to_ascii_lowercase().replace(['-', '_'], " ");
        match normalized.as_str() {
            "subway" | "underground" => Self::Underground,
            "open cut" | "opencut" => Self::OpenCut,
            "elevated" | "viaduct" => Self::Elevated,
            "at grade" | "atgrade" | "embankment" | "coastal" => Self::AtGrade,
            _ => Self::Other(value.trim().to_string()),
        }
    }
}

impl From<StructureType> for String {
    fn from(value: StructureType) -> Self {
        match value {
            StructureType::Underground => "Subway".to_string(),
            StructureType::OpenCut => "Open Cut".to_string(),
            StructureType::Elevated => "Elevated".to_string(),
            StructureType::AtGrade => "At Grade".to_string(),
            StructureType::Other(name) => name,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Station {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub structure: StructureType,
    #[serde(default)]
    pub borough: Option<String>,
    #[serde(default)]
    pub coastal: bool,
}

impl Station {
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }

    pub fn is_coastal(&self) -> bool {
        self.coastal || COASTAL_STATIONS.contains(&self.name.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskTier {
    Low,
    AtRisk,
    High,
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Low => "LOW",
            Self::AtRisk => "AT_RISK",
            Self::High => "HIGH",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RiskAssessment {
    pub tier: RiskTier,
    pub reason: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ForecastTotals {
    pub total_6hr_in: f64,
    pub total_24hr_in: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecipSource {
    MrmsRealtime,
    MrmsArchive,
    Stage4Archive,
}

#[derive(Clone, Debug, Serialize)]
pub struct StationRisk {
    pub station_name: String,
    pub borough: Option<String>,
    pub structure: StructureType,
    pub latitude: f64,
    pub longitude: f64,
    pub is_coastal: bool,
    #[serde(flatten)]
    pub sample: SampleResult,
    pub tide_level_ft: Option<f64>,
    pub risk: RiskAssessment,
    pub forecast: Option<ForecastTotals>,
    pub predicted_risk_6hr: Option<RiskAssessment>,
    pub predicted_risk_24hr: Option<RiskAssessment>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RiskReport {
    pub generated_at: DateTime<Utc>,
    pub target_time: DateTime<Utc>,
    pub source: PrecipSource,
    pub station_count: usize,
    pub high_risk_count: usize,
    pub at_risk_count: usize,
    /// Raster files read for a historical report; empty when served from the
    /// near-real-time cache.
    pub source_urls: Vec<String>,
    pub stations: Vec<StationRisk>,
}
