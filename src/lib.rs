//! Samples NOAA precipitation rasters at transit stations and classifies
//! their flood risk.

pub mod cache;
pub mod config;
pub mod constants;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod forecast;
pub mod grib;
pub mod grid;
pub mod http_client;
pub mod locator;
pub mod risk;
pub mod sampler;
pub mod tides;
pub mod types;
pub mod utils;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use engine::{AssessmentRequest, FloodRiskEngine};
pub use error::{DecodeError, RetrievalError};
pub use http_client::{HttpTransport, Transport};
pub use types::{RiskReport, RiskTier, Station, StructureType};
