use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to gunzip payload: {0}")]
    Gzip(#[from] std::io::Error),
    #[error("payload does not start with GRIB bytes")]
    NotGrib,
    #[error("GRIB payload truncated at offset {0}")]
    Truncated(usize),
    #[error("GRIB reader failed: {0}")]
    Grib(String),
    #[error("expected exactly one GRIB message, found {0}")]
    MessageCount(usize),
    #[error("unsupported grid definition template {0}")]
    UnsupportedGrid(u16),
    #[error("data-point mismatch: grid has {cells} cells, decoded {values} values")]
    ValueCount { cells: usize, values: usize },
}

/// Failure classes for raster retrieval.
///
/// `SourceUnavailable` and `Decode` are recovered by advancing the fallback
/// waterfall. `NoDataForWindow` is terminal for a historical request.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("no data within search window: {0}")]
    NoDataForWindow(String),
}

impl RetrievalError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::SourceUnavailable(message.into())
    }
}

impl From<reqwest::Error> for RetrievalError {
    fn from(error: reqwest::Error) -> Self {
        let url = error
            .url()
            .map(|url| url.to_string())
            .unwrap_or_else(|| "<unknown>".to_string());
        if error.is_timeout() {
            Self::SourceUnavailable(format!("timed out requesting {url}"))
        } else {
            Self::SourceUnavailable(format!("request for {url} failed: {error}"))
        }
    }
}
