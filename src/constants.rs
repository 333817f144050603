use crate::types::{ProductKey, RasterProduct};

pub const MRMS_BUCKET_URL: &str = "https://noaa-mrms-pds.s3.amazonaws.com";
pub const MRMS_HTTP_BASE_URL: &str = "https://mrms.ncep.noaa.gov/2D";
pub const MRMS_ARCHIVE_BASE_URL: &str =
    "https://mtarchive.geol.iastate.edu/thredds/fileServer/mtarchive";
pub const MRMS_CONUS_PREFIX: &str = "CONUS";
pub const MRMS_LEVEL_TAG: &str = "00.00";
pub const MRMS_FILE_SUFFIX: &str = ".grib2.gz";

pub const STAGE4_ARCHIVE_BASE_URLS: &str =
    "https://mesonet.agron.iastate.edu/archive/data,https://mesonet2.agron.iastate.edu/archive/data";
pub const STAGE4_FILE_EXTENSIONS: [&str; 7] = [
    ".grb", ".grb2", ".grib", ".grib2", ".grb2.gz", ".grib2.gz", ".gz",
];
pub const STAGE4_HOURLY_MARKER: &str = ".01h.";
pub const HOURLY_MATCH_TOLERANCE_MINUTES: i64 = 30;
pub const ACCUMULATION_HOURS: i64 = 6;

pub const NOAA_TIDES_BASE_URL: &str = "https://api.tidesandcurrents.noaa.gov/api/prod/datagetter";
pub const NOAA_BATTERY_STATION: &str = "8518750";
pub const NWS_BASE_URL: &str = "https://api.weather.gov";

pub const MRMS_PRODUCTS: [RasterProduct; 3] = [
    RasterProduct {
        key: ProductKey::PrecipRate,
        bucket_name: "PrecipRate",
        http_name: "PrecipRate",
        interval_minutes: 2,
    },
    RasterProduct {
        key: ProductKey::Qpe01H,
        bucket_name: "MultiSensor_QPE_01H_Pass2",
        http_name: "MultiSensor_QPE_01H_Pass2",
        interval_minutes: 60,
    },
    RasterProduct {
        key: ProductKey::Qpe06H,
        bucket_name: "MultiSensor_QPE_06H_Pass2",
        http_name: "MultiSensor_QPE_06H_Pass2",
        interval_minutes: 60,
    },
];

pub const SENTINEL_MIN_VALID: f64 = 0.0;
pub const SENTINEL_MAX_VALID: f64 = 1000.0;
pub const MM_PER_INCH: f64 = 25.4;
/// Rasters carry f32 millimetres, so a cell on a limit converts to just
/// under it in inches. Values this close to a limit count as meeting it.
pub const THRESHOLD_TOLERANCE_IN: f64 = 1e-6;

pub const COORD_KEY_DECIMALS: i32 = 3;
pub const DEFAULT_FORECAST_CONCURRENCY: usize = 10;

pub const DEFAULT_DOWNLOAD_TIMEOUT_SECONDS: u64 = 30;
pub const DEFAULT_LISTING_TIMEOUT_SECONDS: u64 = 20;
pub const DEFAULT_HEAD_TIMEOUT_SECONDS: u64 = 10;
pub const DEFAULT_RANGE_PROBE_TIMEOUT_SECONDS: u64 = 15;
pub const DEFAULT_RASTER_CACHE_TTL_SECONDS: u64 = 300;
pub const DEFAULT_SEARCH_WINDOW_MINUTES: i64 = 360;
pub const HISTORICAL_CUTOFF_MINUTES: i64 = 5;

pub const MAX_LISTING_DAY_LOOKBACK: i64 = 1;
pub const MAX_LISTING_PAGES: usize = 4;

pub const DEFAULT_TIDE_HIGH_LEVEL_FT: f64 = 5.0;
pub const TIDE_SEARCH_WINDOW_MINUTES: i64 = 30;

pub const COASTAL_STATIONS: [&str; 12] = [
    "Broad Channel",
    "Howard Beach-JFK Airport",
    "Rockaway Park-Beach 116 St",
    "Beach 67 St",
    "Beach 60 St",
    "Beach 44 St",
    "Beach 36 St",
    "Beach 25 St",
    "Far Rockaway-Mott Av",
    "South Ferry",
    "Whitehall St-South Ferry",
    "Coney Island-Stillwell Av",
];

pub const USER_AGENT: &str = "precip-risk/0.1";
