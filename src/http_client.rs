use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::config::Config;
use crate::constants::USER_AGENT;
use crate::error::RetrievalError;

/// How a candidate URL is checked before the full download.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeMethod {
    /// HEAD; only 200 counts as present.
    Head,
    /// GET of the first byte; 200 or 206 counts as present.
    RangeGet,
}

/// Network seam for every remote read the engine makes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// `Ok(false)` means the server answered but the object is not there.
    async fn probe(&self, url: &str, method: ProbeMethod) -> Result<bool, RetrievalError>;

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, RetrievalError>;

    /// Listings and small JSON documents.
    async fn fetch_text(&self, url: &str) -> Result<String, RetrievalError>;
}

#[derive(Clone, Copy, Debug)]
pub struct Timeouts {
    pub download: Duration,
    pub listing: Duration,
    pub head: Duration,
    pub range_probe: Duration,
}

impl Timeouts {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            download: cfg.download_timeout,
            listing: cfg.listing_timeout,
            head: cfg.head_timeout,
            range_probe: cfg.range_probe_timeout,
        }
    }
}

pub struct HttpTransport {
    http: Client,
    timeouts: Timeouts,
}

impl HttpTransport {
    pub fn new(cfg: &Config) -> Result<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            timeouts: Timeouts::from_config(cfg),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn probe(&self, url: &str, method: ProbeMethod) -> Result<bool, RetrievalError> {
        let status = match method {
            ProbeMethod::Head => {
                self.http
                    .head(url)
                    .timeout(self.timeouts.head)
                    .send()
                    .await?
                    .status()
            }
            ProbeMethod::RangeGet => {
                self.http
                    .get(url)
                    .header(RANGE, "bytes=0-0")
                    .timeout(self.timeouts.range_probe)
                    .send()
                    .await?
                    .status()
            }
        };
        debug!("Probe {method:?} {url} -> {status}");
        Ok(probe_status_present(method, status))
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, RetrievalError> {
        let response = self
            .http
            .get(url)
            .timeout(self.timeouts.download)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(RetrievalError::unavailable(format!(
                "request failed ({}) for {url}",
                response.status()
            )));
        }

        let bytes = response.bytes().await?;
        Ok(bytes.to_vec())
    }

    async fn fetch_text(&self, url: &str) -> Result<String, RetrievalError> {
        let response = self
            .http
            .get(url)
            .timeout(self.timeouts.listing)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(RetrievalError::unavailable(format!(
                "request failed ({}) for {url}",
                response.status()
            )));
        }

        Ok(response.text().await?)
    }
}

fn probe_status_present(method: ProbeMethod, status: StatusCode) -> bool {
    match method {
        ProbeMethod::Head => status == StatusCode::OK,
        ProbeMethod::RangeGet => matches!(status, StatusCode::OK | StatusCode::PARTIAL_CONTENT),
    }
}
