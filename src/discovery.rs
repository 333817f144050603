use std::ops::Range;
use std::sync::OnceLock;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use regex::Regex;

use crate::constants::{
    MAX_LISTING_DAY_LOOKBACK, MAX_LISTING_PAGES, MRMS_CONUS_PREFIX, MRMS_FILE_SUFFIX,
    MRMS_LEVEL_TAG, STAGE4_HOURLY_MARKER,
};
use crate::error::RetrievalError;
use crate::http_client::Transport;
use crate::types::RasterProduct;

#[derive(Clone, Debug, PartialEq)]
pub struct BucketObject {
    pub key: String,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Newest object key for `product`, looking at today's prefix and then
/// yesterday's.
pub async fn find_latest_product_key(
    transport: &dyn Transport,
    bucket_url: &str,
    product: &RasterProduct,
    now: DateTime<Utc>,
) -> Result<Option<String>, RetrievalError> {
    for day_offset in 0..=MAX_LISTING_DAY_LOOKBACK {
        let day = (now - Duration::days(day_offset)).format("%Y%m%d").to_string();
        let prefix = format!("{}{day}/", product_prefix(product));
        let objects =
            list_objects_for_prefix(transport, bucket_url, &prefix, 1000, MAX_LISTING_PAGES)
                .await?;
        if let Some(key) = newest_grib_key(objects) {
            return Ok(Some(key));
        }
    }
    Ok(None)
}

pub fn product_prefix(product: &RasterProduct) -> String {
    format!(
        "{MRMS_CONUS_PREFIX}/{}_{MRMS_LEVEL_TAG}/",
        product.bucket_name
    )
}

pub fn bucket_object_url(bucket_url: &str, key: &str) -> String {
    format!("{bucket_url}/{key}")
}

pub async fn list_objects_for_prefix(
    transport: &dyn Transport,
    bucket_url: &str,
    prefix: &str,
    max_keys: usize,
    max_pages: usize,
) -> Result<Vec<BucketObject>, RetrievalError> {
    let mut objects = Vec::new();
    let mut continuation_token: Option<String> = None;

    for _ in 0..max_pages.max(1) {
        let mut url = format!(
            "{bucket_url}/?list-type=2&prefix={}&max-keys={max_keys}",
            urlencoding::encode(prefix)
        );
        if let Some(token) = continuation_token.as_ref() {
            url.push_str("&continuation-token=");
            url.push_str(&urlencoding::encode(token));
        }

        let xml = transport.fetch_text(&url).await?;
        objects.extend(parse_bucket_objects(&xml));

        let is_truncated = parse_xml_tag_value(&xml, "IsTruncated")
            .map(|value| value == "true")
            .unwrap_or(false);
        if !is_truncated {
            break;
        }

        continuation_token = parse_xml_tag_value(&xml, "NextContinuationToken");
        if continuation_token.is_none() {
            break;
        }
    }

    Ok(objects)
}

pub fn parse_bucket_objects(xml: &str) -> Vec<BucketObject> {
    static CONTENTS: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(contents) = CONTENTS
        .get_or_init(|| Regex::new(r"(?s)<Contents>(.*?)</Contents>").ok())
        .as_ref()
    else {
        return Vec::new();
    };

    contents
        .captures_iter(xml)
        .filter_map(|captures| {
            let block = captures.get(1)?.as_str();
            let key = parse_xml_tag_value(block, "Key")?;
            let last_modified = parse_xml_tag_value(block, "LastModified")
                .and_then(|value| DateTime::parse_from_rfc3339(&value).ok())
                .map(|value| value.with_timezone(&Utc));
            Some(BucketObject { key, last_modified })
        })
        .collect()
}

/// Most recently modified `.grib2.gz` key; the key itself breaks ties.
pub fn newest_grib_key(objects: Vec<BucketObject>) -> Option<String> {
    objects
        .into_iter()
        .filter(|object| object.key.ends_with(MRMS_FILE_SUFFIX))
        .max_by(|left, right| {
            (left.last_modified, &left.key).cmp(&(right.last_modified, &right.key))
        })
        .map(|object| object.key)
}

fn parse_xml_tag_values(xml: &str, tag_name: &str) -> Vec<String> {
    let Ok(regex) = Regex::new(&format!(r"<{0}>([^<]+)</{0}>", regex::escape(tag_name))) else {
        return Vec::new();
    };
    regex
        .captures_iter(xml)
        .filter_map(|captures| captures.get(1).map(|value| value.as_str().to_string()))
        .collect()
}

fn parse_xml_tag_value(xml: &str, tag_name: &str) -> Option<String> {
    parse_xml_tag_values(xml, tag_name).into_iter().next()
}

/// File names linked from a directory-listing page, limited to `extensions`.
pub fn extract_hrefs(html: &str, extensions: &[&str]) -> Vec<String> {
    static HREF: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(href) = HREF
        .get_or_init(|| Regex::new(r#"href="([^"]+)""#).ok())
        .as_ref()
    else {
        return Vec::new();
    };

    href.captures_iter(html)
        .filter_map(|captures| captures.get(1).map(|value| value.as_str()))
        .filter(|link| !link.contains('/') && !link.starts_with('?'))
        .filter(|link| extensions.iter().any(|extension| link.ends_with(extension)))
        .map(str::to_string)
        .collect()
}

/// Keeps only hourly accumulations when the listing has any.
pub fn prefer_hourly(files: Vec<String>) -> Vec<String> {
    if files.iter().any(|name| name.contains(STAGE4_HOURLY_MARKER)) {
        files
            .into_iter()
            .filter(|name| name.contains(STAGE4_HOURLY_MARKER))
            .collect()
    } else {
        files
    }
}

/// Timestamp embedded in an archive file name: a 10, 12 or 14 digit run
/// (`YYYYMMDDHH[MM[SS]]`), else `YYYYMMDD` and `HH` joined by `.`, `_` or `-`.
pub fn parse_filename_timestamp(name: &str) -> Option<DateTime<Utc>> {
    static DIGIT_RUN: OnceLock<Option<Regex>> = OnceLock::new();
    static SPLIT_HOUR: OnceLock<Option<Regex>> = OnceLock::new();

    if let Some(digit_run) = DIGIT_RUN
        .get_or_init(|| Regex::new(r"\d{10,14}").ok())
        .as_ref()
    {
        if let Some(timestamp) = digit_run
            .find_iter(name)
            .find_map(|run| datetime_from_digits(run.as_str()))
        {
            return Some(timestamp);
        }
    }

    let split_hour = SPLIT_HOUR
        .get_or_init(|| Regex::new(r"(\d{8})[._-](\d{2})").ok())
        .as_ref()?;
    let captures = split_hour.captures(name)?;
    let digits = format!("{}{}", captures.get(1)?.as_str(), captures.get(2)?.as_str());
    datetime_from_digits(&digits)
}

fn datetime_from_digits(digits: &str) -> Option<DateTime<Utc>> {
    let field = |range: Range<usize>| digits.get(range)?.parse::<u32>().ok();
    let (minute, second) = match digits.len() {
        10 => (0, 0),
        12 => (field(10..12)?, 0),
        14 => (field(10..12)?, field(12..14)?),
        _ => return None,
    };
    let year = digits.get(0..4)?.parse::<i32>().ok()?;
    let date = NaiveDate::from_ymd_opt(year, field(4..6)?, field(6..8)?)?;
    let naive = date.and_hms_opt(field(8..10)?, minute, second)?;
    Some(Utc.from_utc_datetime(&naive))
}

/// File whose parsed time is closest to `target`. Unparseable names are
/// skipped; the earlier listing entry wins a tie.
pub fn select_nearest_file(
    files: &[String],
    target: DateTime<Utc>,
) -> Option<(String, DateTime<Utc>)> {
    let mut best: Option<(&String, DateTime<Utc>, i64)> = None;
    for name in files {
        let Some(timestamp) = parse_filename_timestamp(name) else {
            continue;
        };
        let distance = (timestamp - target).num_seconds().abs();
        match best {
            Some((_, _, best_distance)) if best_distance <= distance => {}
            _ => best = Some((name, timestamp, distance)),
        }
    }
    best.map(|(name, timestamp, _)| (name.clone(), timestamp))
}
