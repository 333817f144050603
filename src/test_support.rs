//! Scripted network and decoder doubles for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::cache::GridCoordinateCache;
use crate::error::{DecodeError, RetrievalError};
use crate::http_client::{ProbeMethod, Transport};
use crate::types::{DecodedRaster, FixedGrid, GridGeometry};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Probe(String, ProbeMethod),
    Bytes(String),
    Text(String),
}

/// Serves registered files and listings and records every call in order.
/// Anything unregistered answers as missing.
#[derive(Default)]
pub struct MockTransport {
    calls: Mutex<Vec<Call>>,
    files: HashMap<String, Vec<u8>>,
    texts: HashMap<String, String>,
    failing: HashSet<String>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, url: &str, payload: &str) -> Self {
        self.files.insert(url.to_string(), payload.as_bytes().to_vec());
        self
    }

    pub fn with_text(mut self, url: &str, body: &str) -> Self {
        self.texts.insert(url.to_string(), body.to_string());
        self
    }

    /// Every request to `url` fails as if the connection dropped.
    pub fn with_failure(mut self, url: &str) -> Self {
        self.failing.insert(url.to_string());
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn probed_urls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Probe(url, _) => Some(url),
                _ => None,
            })
            .collect()
    }

    pub fn downloaded_urls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Bytes(url) => Some(url),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(call);
    }

    fn check_failure(&self, url: &str) -> Result<(), RetrievalError> {
        if self.failing.contains(url) {
            return Err(RetrievalError::unavailable(format!("connection reset for {url}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn probe(&self, url: &str, method: ProbeMethod) -> Result<bool, RetrievalError> {
        self.record(Call::Probe(url.to_string(), method));
        self.check_failure(url)?;
        Ok(self.files.contains_key(url))
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, RetrievalError> {
        self.record(Call::Bytes(url.to_string()));
        self.check_failure(url)?;
        self.files
            .get(url)
            .cloned()
            .ok_or_else(|| RetrievalError::unavailable(format!("request failed (404) for {url}")))
    }

    async fn fetch_text(&self, url: &str) -> Result<String, RetrievalError> {
        self.record(Call::Text(url.to_string()));
        self.check_failure(url)?;
        self.texts
            .get(url)
            .cloned()
            .ok_or_else(|| RetrievalError::unavailable(format!("request failed (404) for {url}")))
    }
}

/// Decodes a payload holding one number into a single-cell raster, so every
/// point samples that value. Anything else is rejected as non-GRIB.
pub fn fake_decode(
    payload: &[u8],
    _coordinates: &GridCoordinateCache,
) -> Result<DecodedRaster, DecodeError> {
    let value = std::str::from_utf8(payload)
        .ok()
        .and_then(|text| text.trim().parse::<f32>().ok())
        .ok_or(DecodeError::NotGrib)?;
    Ok(single_cell_raster(value))
}

pub fn single_cell_raster(value: f32) -> DecodedRaster {
    DecodedRaster {
        rows: 1,
        cols: 1,
        values: vec![value],
        geometry: GridGeometry::Fixed(FixedGrid {
            rows: 1,
            cols: 1,
            first_lat_deg: 40.7,
            first_lon_deg360: 286.0,
            lat_step_deg: -0.01,
            lon_step_deg: 0.01,
        }),
    }
}
