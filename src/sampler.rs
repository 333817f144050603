use std::sync::Arc;

use crate::constants::{MM_PER_INCH, SENTINEL_MAX_VALID, SENTINEL_MIN_VALID};
use crate::grid::cells_for;
use crate::types::{DecodedRaster, GeoPoint, ProductKey, ProductSet, SampleResult};

/// Raw cell value in millimetres with no-data and out-of-range flags zeroed.
pub fn sanitize_mm(raw: f32) -> f64 {
    let value = raw as f64;
    if !value.is_finite() || value < SENTINEL_MIN_VALID || value > SENTINEL_MAX_VALID {
        0.0
    } else {
        value
    }
}

pub fn mm_to_inches(mm: f64) -> f64 {
    mm / MM_PER_INCH
}

/// Sanitized millimetre values for each point; zeros when the raster is
/// missing.
pub fn sample_mm(raster: Option<&DecodedRaster>, points: &[GeoPoint]) -> Vec<f64> {
    let Some(raster) = raster else {
        return vec![0.0; points.len()];
    };
    cells_for(raster, points)
        .into_iter()
        .map(|cell| {
            cell.and_then(|(row, col)| raster.value_at(row, col))
                .map(sanitize_mm)
                .unwrap_or(0.0)
        })
        .collect()
}

/// Near-real-time or MRMS-at-time sampling: each product read directly.
pub fn sample_products(products: &ProductSet, points: &[GeoPoint]) -> Vec<SampleResult> {
    let product = |key: ProductKey| {
        sample_mm(
            products.get(&key).and_then(|raster| raster.as_deref()),
            points,
        )
    };
    let rates = product(ProductKey::PrecipRate);
    let one_hour = product(ProductKey::Qpe01H);
    let six_hour = product(ProductKey::Qpe06H);

    (0..points.len())
        .map(|idx| SampleResult {
            precip_rate_in_hr: mm_to_inches(rates[idx]),
            accum_1hr_in: mm_to_inches(one_hour[idx]),
            accum_6hr_in: mm_to_inches(six_hour[idx]),
        })
        .collect()
}

/// Sums the hours that could be read; missing hours count as zero.
pub fn accumulate_inches(hourly_mm: &[Option<f64>]) -> f64 {
    mm_to_inches(hourly_mm.iter().flatten().sum())
}

/// Hourly-archive sampling: the target hour gives rate and 1-hour total, and
/// up to six hourly rasters ending at the target hour give the 6-hour total.
pub fn sample_hourly_window(
    current: &DecodedRaster,
    hourly: &[Option<Arc<DecodedRaster>>],
    points: &[GeoPoint],
) -> Vec<SampleResult> {
    let current_mm = sample_mm(Some(current), points);
    let hourly_mm: Vec<Option<Vec<f64>>> = hourly
        .iter()
        .map(|raster| {
            raster
                .as_deref()
                .map(|raster| sample_mm(Some(raster), points))
        })
        .collect();

    current_mm
        .iter()
        .enumerate()
        .map(|(idx, mm)| {
            let per_hour: Vec<Option<f64>> = hourly_mm
                .iter()
                .map(|values| values.as_ref().map(|values| values[idx]))
                .collect();
            let inches = mm_to_inches(*mm);
            SampleResult {
                precip_rate_in_hr: inches,
                accum_1hr_in: inches,
                accum_6hr_in: accumulate_inches(&per_hour),
            }
        })
        .collect()
}
