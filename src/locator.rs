use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::cache::{GridCoordinateCache, RetrievalCaches};
use crate::config::Config;
use crate::constants::{
    ACCUMULATION_HOURS, HOURLY_MATCH_TOLERANCE_MINUTES, MRMS_FILE_SUFFIX, MRMS_LEVEL_TAG,
    MRMS_PRODUCTS, STAGE4_FILE_EXTENSIONS,
};
use crate::discovery::{
    bucket_object_url, extract_hrefs, find_latest_product_key, list_objects_for_prefix,
    prefer_hourly, product_prefix, select_nearest_file,
};
use crate::error::RetrievalError;
use crate::grib::{decode_raster, DecodeFn};
use crate::http_client::{ProbeMethod, Transport};
use crate::types::{DecodedRaster, ProductSet, RasterProduct};
use crate::utils::{floor_timestamp, format_timestamp_compact};

/// Offsets in minutes ordered by distance from the target: 0, -s, +s, -2s,
/// +2s, ... out to the window on both sides.
pub fn offset_sequence(step_minutes: i64, window_minutes: i64) -> Vec<i64> {
    let step = step_minutes.max(1);
    let mut offsets = vec![0];
    for multiple in 1..=window_minutes.max(0) / step {
        offsets.push(-multiple * step);
        offsets.push(multiple * step);
    }
    offsets
}

/// Product valid times to try for `target`, nearest first. The search is
/// centred on the interval boundary closest to the target and candidates are
/// ordered by their distance from the target itself; earlier wins a tie.
pub fn candidate_times(
    target: DateTime<Utc>,
    step_minutes: i64,
    window_minutes: i64,
) -> Vec<DateTime<Utc>> {
    let step_seconds = step_minutes.max(1) * 60;
    let nearest = floor_timestamp(target + Duration::seconds(step_seconds / 2), step_seconds);
    let mut candidates: Vec<DateTime<Utc>> = offset_sequence(step_minutes, window_minutes)
        .into_iter()
        .map(|offset| nearest + Duration::minutes(offset))
        .collect();
    candidates.sort_by_key(|candidate| (*candidate - target).num_seconds().abs());
    candidates
}

/// Downloads `url` and decodes it off the async runtime.
pub async fn download_and_decode(
    transport: &dyn Transport,
    decode: DecodeFn,
    coordinates: Arc<GridCoordinateCache>,
    url: &str,
) -> Result<DecodedRaster, RetrievalError> {
    let payload = transport.fetch_bytes(url).await?;
    let raster = tokio::task::spawn_blocking(move || decode(&payload, &coordinates))
        .await
        .map_err(|error| RetrievalError::unavailable(format!("decode task failed: {error}")))??;
    debug!("Decoded {}x{} raster from {url}", raster.rows, raster.cols);
    Ok(raster)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RealtimeStrategy {
    /// Newest object in the day-partitioned bucket prefix.
    BucketListing,
    /// The fixed `.latest` file on the HTTP server.
    LatestEndpoint,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MirrorLayout {
    /// `{base}/{product}/MRMS_{product}_00.00_{ts}.grib2.gz`
    Realtime,
    /// `{base}/{YYYY/MM/DD}/mrms/ncep/{product}/{product}_00.00_{ts}.grib2.gz`
    DatedArchive,
}

/// One server publishing MRMS files under guessable names.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mirror {
    pub base_url: String,
    pub layout: MirrorLayout,
    pub probe: ProbeMethod,
}

impl Mirror {
    pub fn realtime(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            layout: MirrorLayout::Realtime,
            probe: ProbeMethod::Head,
        }
    }

    pub fn archive(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            layout: MirrorLayout::DatedArchive,
            probe: ProbeMethod::RangeGet,
        }
    }

    pub fn url_for(&self, product: &RasterProduct, valid_time: DateTime<Utc>) -> String {
        let name = product.http_name;
        let timestamp = format_timestamp_compact(valid_time);
        match self.layout {
            MirrorLayout::Realtime => format!(
                "{}/{name}/MRMS_{name}_{MRMS_LEVEL_TAG}_{timestamp}{MRMS_FILE_SUFFIX}",
                self.base_url
            ),
            MirrorLayout::DatedArchive => format!(
                "{}/{}/mrms/ncep/{name}/{name}_{MRMS_LEVEL_TAG}_{timestamp}{MRMS_FILE_SUFFIX}",
                self.base_url,
                valid_time.format("%Y/%m/%d")
            ),
        }
    }
}

/// First existing file nearest to `target`. Each mirror's whole offset
/// sequence is probed before the next mirror is tried.
pub async fn find_nearest_url(
    transport: &dyn Transport,
    mirrors: &[Mirror],
    product: &RasterProduct,
    target: DateTime<Utc>,
    window_minutes: i64,
) -> Result<String, RetrievalError> {
    let candidates = candidate_times(target, product.interval_minutes, window_minutes);

    for mirror in mirrors {
        for valid_time in &candidates {
            let url = mirror.url_for(product, *valid_time);
            match transport.probe(&url, mirror.probe).await {
                Ok(true) => {
                    let offset = (*valid_time - target).num_minutes();
                    debug!("Found {} at offset {offset} min: {url}", product.key);
                    return Ok(url);
                }
                Ok(false) => {}
                Err(error) => debug!("Probe failed for {url}: {error}"),
            }
        }
        debug!(
            "No {} file within {window_minutes} min on {}",
            product.key, mirror.base_url
        );
    }

    Err(RetrievalError::NoDataForWindow(format!(
        "{} within {window_minutes} min of {}",
        product.key,
        target.to_rfc3339()
    )))
}

/// MRMS retrieval: cached near-real-time product set and time-targeted
/// lookups across archive mirrors.
pub struct MrmsLocator {
    transport: Arc<dyn Transport>,
    caches: Arc<RetrievalCaches>,
    decode: DecodeFn,
    bucket_url: String,
    http_base_url: String,
    strategies: Vec<RealtimeStrategy>,
    mirrors: Vec<Mirror>,
    search_window_minutes: i64,
}

impl MrmsLocator {
    pub fn new(cfg: &Config, transport: Arc<dyn Transport>, caches: Arc<RetrievalCaches>) -> Self {
        let mut mirrors: Vec<Mirror> = cfg
            .mrms_archive_base_urls
            .iter()
            .map(|base| Mirror::archive(base))
            .collect();
        mirrors.push(Mirror::realtime(&cfg.mrms_http_base_url));

        Self {
            transport,
            caches,
            decode: decode_raster,
            bucket_url: cfg.mrms_bucket_url.clone(),
            http_base_url: cfg.mrms_http_base_url.clone(),
            strategies: vec![RealtimeStrategy::BucketListing, RealtimeStrategy::LatestEndpoint],
            mirrors,
            search_window_minutes: cfg.search_window_minutes,
        }
    }

    pub fn with_decoder(mut self, decode: DecodeFn) -> Self {
        self.decode = decode;
        self
    }

    pub fn latest_url(&self, product: &RasterProduct) -> String {
        let name = product.http_name;
        format!(
            "{}/{name}/MRMS_{name}.latest{MRMS_FILE_SUFFIX}",
            self.http_base_url
        )
    }

    /// Near-real-time set as seen at `now`; served from cache while fresh.
    pub async fn fetch_products_as_of(&self, now: DateTime<Utc>) -> Arc<ProductSet> {
        self.caches
            .rasters
            .get_or_refresh(now, || self.refresh_products(now))
            .await
    }

    async fn refresh_products(&self, now: DateTime<Utc>) -> ProductSet {
        info!("Refreshing near-real-time MRMS products");
        let resolved = join_all(MRMS_PRODUCTS.iter().map(|product| async move {
            (product.key, self.fetch_latest(product, now).await)
        }))
        .await;
        resolved.into_iter().collect()
    }

    async fn fetch_latest(
        &self,
        product: &RasterProduct,
        now: DateTime<Utc>,
    ) -> Option<Arc<DecodedRaster>> {
        for strategy in &self.strategies {
            match self.try_strategy(*strategy, product, now).await {
                Ok(raster) => return Some(Arc::new(raster)),
                Err(error) => warn!("{strategy:?} failed for {}: {error}", product.key),
            }
        }
        warn!("No near-real-time source available for {}", product.key);
        None
    }

    async fn try_strategy(
        &self,
        strategy: RealtimeStrategy,
        product: &RasterProduct,
        now: DateTime<Utc>,
    ) -> Result<DecodedRaster, RetrievalError> {
        let url = match strategy {
            RealtimeStrategy::BucketListing => {
                let key =
                    find_latest_product_key(self.transport.as_ref(), &self.bucket_url, product, now)
                        .await?
                        .ok_or_else(|| {
                            RetrievalError::unavailable(format!(
                                "no {} objects listed in bucket",
                                product.key
                            ))
                        })?;
                bucket_object_url(&self.bucket_url, &key)
            }
            RealtimeStrategy::LatestEndpoint => self.latest_url(product),
        };
        self.download(&url).await
    }

    /// Products nearest `target`, each resolved independently. Fails only
    /// when no product could be found at all.
    pub async fn fetch_products_at(
        &self,
        target: DateTime<Utc>,
    ) -> Result<(ProductSet, Vec<String>), RetrievalError> {
        let resolved = join_all(MRMS_PRODUCTS.iter().map(|product| async move {
            let result = self.fetch_product_at(product, target).await;
            (product.key, result)
        }))
        .await;

        let mut products = ProductSet::new();
        let mut urls = Vec::new();
        for (key, result) in resolved {
            match result {
                Ok((url, raster)) => {
                    urls.push(url);
                    products.insert(key, Some(Arc::new(raster)));
                }
                Err(error) => {
                    warn!("MRMS {key} unavailable near {}: {error}", target.to_rfc3339());
                    products.insert(key, None);
                }
            }
        }

        if urls.is_empty() {
            return Err(RetrievalError::NoDataForWindow(format!(
                "no MRMS products within {} min of {}",
                self.search_window_minutes,
                target.to_rfc3339()
            )));
        }
        Ok((products, urls))
    }

    async fn fetch_product_at(
        &self,
        product: &RasterProduct,
        target: DateTime<Utc>,
    ) -> Result<(String, DecodedRaster), RetrievalError> {
        let url = find_nearest_url(
            self.transport.as_ref(),
            &self.mirrors,
            product,
            target,
            self.search_window_minutes,
        )
        .await?;
        let raster = self.download(&url).await?;
        Ok((url, raster))
    }

    async fn download(&self, url: &str) -> Result<DecodedRaster, RetrievalError> {
        download_and_decode(
            self.transport.as_ref(),
            self.decode,
            self.caches.coordinates.clone(),
            url,
        )
        .await
    }

    /// Bucket listing with a single key, then HEAD of the `.latest` file.
    pub async fn is_available(&self) -> bool {
        let product = &MRMS_PRODUCTS[0];
        match list_objects_for_prefix(
            self.transport.as_ref(),
            &self.bucket_url,
            &product_prefix(product),
            1,
            1,
        )
        .await
        {
            Ok(objects) if !objects.is_empty() => return true,
            Ok(_) => debug!("Bucket listing returned no {} objects", product.key),
            Err(error) => debug!("Bucket listing failed: {error}"),
        }

        self.transport
            .probe(&self.latest_url(product), ProbeMethod::Head)
            .await
            .unwrap_or(false)
    }
}

/// A Stage IV file chosen from a day listing.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ArchiveFile {
    pub day: NaiveDate,
    pub name: String,
    pub valid_time: DateTime<Utc>,
}

/// Rasters backing one historical Stage IV sample.
pub struct HourlyWindow {
    pub current_url: String,
    pub current: Arc<DecodedRaster>,
    /// Hours ending at the target, newest first; `None` where no file was read.
    pub hourly: Vec<Option<Arc<DecodedRaster>>>,
    pub hourly_urls: Vec<String>,
}

/// Stage IV hourly archive on day-partitioned directory listings.
pub struct Stage4Locator {
    transport: Arc<dyn Transport>,
    caches: Arc<RetrievalCaches>,
    decode: DecodeFn,
    mirrors: Vec<String>,
}

impl Stage4Locator {
    pub fn new(cfg: &Config, transport: Arc<dyn Transport>, caches: Arc<RetrievalCaches>) -> Self {
        Self {
            transport,
            caches,
            decode: decode_raster,
            mirrors: cfg.stage4_archive_base_urls.clone(),
        }
    }

    pub fn with_decoder(mut self, decode: DecodeFn) -> Self {
        self.decode = decode;
        self
    }

    pub fn day_directory(base_url: &str, day: NaiveDate) -> String {
        format!("{base_url}/{}/stage4/", day.format("%Y/%m/%d"))
    }

    /// Archive file names for one UTC day from the first mirror that answers.
    /// Completed days with files are cached for the life of the process.
    pub async fn list_day(&self, day: NaiveDate, now: DateTime<Utc>) -> Arc<Vec<String>> {
        if let Some(files) = self.caches.listings.get(day).await {
            return files;
        }

        let mut files = Vec::new();
        for base_url in &self.mirrors {
            let url = Self::day_directory(base_url, day);
            match self.transport.fetch_text(&url).await {
                Ok(html) if !html.trim().is_empty() => {
                    files = prefer_hourly(extract_hrefs(&html, &STAGE4_FILE_EXTENSIONS));
                    break;
                }
                Ok(_) => debug!("Empty Stage IV listing at {url}"),
                Err(error) => warn!("Stage IV directory fetch failed for {url}: {error}"),
            }
        }

        if !files.is_empty() && day < now.date_naive() {
            return self.caches.listings.insert(day, files).await;
        }
        Arc::new(files)
    }

    /// Nearest listed file to `target`, looking at the previous and then the
    /// next day when the target day lists no dated file.
    pub async fn nearest_archive_file(
        &self,
        target: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<ArchiveFile> {
        let target_day = target.date_naive();
        for day_offset in [0, -1, 1] {
            let day = target_day + Duration::days(day_offset);
            let files = self.list_day(day, now).await;
            match select_nearest_file(&files, target) {
                Some((name, valid_time)) => {
                    return Some(ArchiveFile {
                        day,
                        name,
                        valid_time,
                    });
                }
                None if files.is_empty() => {}
                None => debug!("No dated Stage IV files listed for {day}"),
            }
        }
        None
    }

    /// Range-probes each mirror for `file` and decodes from the first that
    /// serves it.
    pub async fn load_archive_raster(
        &self,
        file: &ArchiveFile,
    ) -> Result<(String, DecodedRaster), RetrievalError> {
        let mut last_error = None;
        for base_url in &self.mirrors {
            let url = format!("{}{}", Self::day_directory(base_url, file.day), file.name);
            match self.transport.probe(&url, ProbeMethod::RangeGet).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!("Stage IV file not on mirror: {url}");
                    continue;
                }
                Err(error) => {
                    debug!("Stage IV probe failed for {url}: {error}");
                    last_error = Some(error);
                    continue;
                }
            }

            match download_and_decode(
                self.transport.as_ref(),
                self.decode,
                self.caches.coordinates.clone(),
                &url,
            )
            .await
            {
                Ok(raster) => return Ok((url, raster)),
                Err(error) => {
                    warn!("Stage IV file unusable at {url}: {error}");
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            RetrievalError::unavailable(format!("{} not found on any mirror", file.name))
        }))
    }

    /// Raster nearest `target` plus the hourly files for the six hours
    /// ending there. Only the target raster is required.
    pub async fn hourly_window(
        &self,
        target: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<HourlyWindow, RetrievalError> {
        let current_file = self.nearest_archive_file(target, now).await.ok_or_else(|| {
            RetrievalError::NoDataForWindow(format!(
                "no Stage IV files listed near {}",
                target.to_rfc3339()
            ))
        })?;
        let (current_url, current) = self.load_archive_raster(&current_file).await?;
        let current = Arc::new(current);
        info!("Stage IV raster for {}: {current_url}", target.to_rfc3339());

        let mut loaded: HashMap<ArchiveFile, (String, Arc<DecodedRaster>)> = HashMap::new();
        loaded.insert(current_file, (current_url.clone(), current.clone()));
        let mut counted = HashSet::new();
        let mut hourly = Vec::with_capacity(ACCUMULATION_HOURS as usize);
        let mut hourly_urls = Vec::new();

        for hour in 0..ACCUMULATION_HOURS {
            let hour_time = target - Duration::hours(hour);
            match self
                .hour_raster(hour_time, now, &mut loaded, &mut counted)
                .await
            {
                Some((url, raster)) => {
                    hourly_urls.push(url);
                    hourly.push(Some(raster));
                }
                None => {
                    warn!(
                        "Stage IV hour {} missing; counting it as zero",
                        hour_time.to_rfc3339()
                    );
                    hourly.push(None);
                }
            }
        }

        Ok(HourlyWindow {
            current_url,
            current,
            hourly,
            hourly_urls,
        })
    }

    /// File for one hour of the accumulation: within tolerance of the hour
    /// and not already counted for another hour.
    async fn hour_raster(
        &self,
        hour_time: DateTime<Utc>,
        now: DateTime<Utc>,
        loaded: &mut HashMap<ArchiveFile, (String, Arc<DecodedRaster>)>,
        counted: &mut HashSet<ArchiveFile>,
    ) -> Option<(String, Arc<DecodedRaster>)> {
        let file = self.nearest_archive_file(hour_time, now).await?;
        if (file.valid_time - hour_time).num_minutes().abs() > HOURLY_MATCH_TOLERANCE_MINUTES {
            debug!("{} is too far from hour {}", file.name, hour_time.to_rfc3339());
            return None;
        }
        if counted.contains(&file) {
            debug!("{} already counted", file.name);
            return None;
        }

        let entry = match loaded.get(&file) {
            Some(entry) => entry.clone(),
            None => match self.load_archive_raster(&file).await {
                Ok((url, raster)) => {
                    let entry = (url, Arc::new(raster));
                    loaded.insert(file.clone(), entry.clone());
                    entry
                }
                Err(error) => {
                    warn!("Stage IV hour file {} failed: {error}", file.name);
                    return None;
                }
            },
        };
        counted.insert(file);
        Some(entry)
    }
}
