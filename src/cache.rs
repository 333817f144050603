use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock as StdRwLock};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::error::DecodeError;
use crate::grib::PolarStereographicGrid;
use crate::types::{LatLonGrid, ProductSet};

/// Process-lifetime caches shared by the locators. Built once at startup.
pub struct RetrievalCaches {
    pub rasters: RasterCache,
    pub listings: ListingCache,
    pub coordinates: Arc<GridCoordinateCache>,
}

impl RetrievalCaches {
    pub fn new(raster_ttl: Duration) -> Self {
        Self {
            rasters: RasterCache::new(raster_ttl),
            listings: ListingCache::default(),
            coordinates: Arc::new(GridCoordinateCache::new()),
        }
    }
}

struct CachedProductSet {
    fetched_at: DateTime<Utc>,
    products: Arc<ProductSet>,
}

/// Near-real-time product set, refreshed as a unit once older than the TTL.
pub struct RasterCache {
    ttl: Duration,
    entry: RwLock<Option<CachedProductSet>>,
    refresh: Mutex<()>,
}

impl RasterCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    pub async fn get_fresh(&self, now: DateTime<Utc>) -> Option<Arc<ProductSet>> {
        let entry = self.entry.read().await;
        let cached = entry.as_ref()?;
        if now - cached.fetched_at < self.ttl {
            Some(cached.products.clone())
        } else {
            None
        }
    }

    pub async fn store(&self, products: ProductSet, fetched_at: DateTime<Utc>) -> Arc<ProductSet> {
        let products = Arc::new(products);
        *self.entry.write().await = Some(CachedProductSet {
            fetched_at,
            products: products.clone(),
        });
        products
    }

    /// Returns the cached set while fresh, otherwise runs `refresh` once even
    /// when several callers arrive together. Sets where every product failed
    /// are returned but not stored.
    pub async fn get_or_refresh<F, Fut>(&self, now: DateTime<Utc>, refresh: F) -> Arc<ProductSet>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ProductSet>,
    {
        if let Some(products) = self.get_fresh(now).await {
            return products;
        }

        let _guard = self.refresh.lock().await;
        if let Some(products) = self.get_fresh(now).await {
            return products;
        }

        let products = refresh().await;
        if products.values().all(Option::is_none) {
            debug!("Not caching product set with no available rasters");
            return Arc::new(products);
        }
        self.store(products, now).await
    }
}

/// Archive directory listings per UTC day. Past days never change, so there
/// is no expiry.
#[derive(Default)]
pub struct ListingCache {
    days: RwLock<HashMap<NaiveDate, Arc<Vec<String>>>>,
}

impl ListingCache {
    pub async fn get(&self, day: NaiveDate) -> Option<Arc<Vec<String>>> {
        self.days.read().await.get(&day).cloned()
    }

    pub async fn insert(&self, day: NaiveDate, files: Vec<String>) -> Arc<Vec<String>> {
        let files = Arc::new(files);
        self.days.write().await.insert(day, files.clone());
        files
    }
}

/// Coordinates of the most recently decoded projected grid. Reused only when
/// the next file declares the identical geometry.
pub struct GridCoordinateCache {
    latest: StdRwLock<Option<(PolarStereographicGrid, Arc<LatLonGrid>)>>,
}

impl Default for GridCoordinateCache {
    fn default() -> Self {
        Self::new()
    }
}

impl GridCoordinateCache {
    pub fn new() -> Self {
        Self {
            latest: StdRwLock::new(None),
        }
    }

    pub fn coordinates_for(
        &self,
        definition: &PolarStereographicGrid,
    ) -> Result<Arc<LatLonGrid>, DecodeError> {
        {
            let latest = self
                .latest
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some((cached_definition, latlons)) = latest.as_ref() {
                if cached_definition == definition {
                    return Ok(latlons.clone());
                }
                debug!(
                    "Grid geometry changed from {}x{} to {}x{}; re-deriving coordinates",
                    cached_definition.rows, cached_definition.cols, definition.rows, definition.cols
                );
            }
        }

        let latlons = Arc::new(definition.derive_latlons()?);
        let mut latest = self
            .latest
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *latest = Some((*definition, latlons.clone()));
        Ok(latlons)
    }
}
