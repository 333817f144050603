use crate::types::{DecodedRaster, FixedGrid, GeoPoint, GridGeometry, LatLonGrid};
use crate::utils::{clamp_index, shortest_lon_delta_degrees, to_lon360};

impl FixedGrid {
    /// Nearest cell for a coordinate. Points outside the extent snap to the
    /// closest edge row/column.
    pub fn index_of(&self, lat: f64, lon: f64) -> (usize, usize) {
        let row = if self.lat_step_deg == 0.0 {
            0
        } else {
            clamp_index((lat - self.first_lat_deg) / self.lat_step_deg, self.rows)
        };
        (row, clamp_index(self.lon_offset_cells(lon), self.cols))
    }

    fn lon_offset_cells(&self, lon: f64) -> f64 {
        let step = self.lon_step_deg.abs();
        if step == 0.0 {
            return 0.0;
        }
        let span = self.cols.saturating_sub(1) as f64 * step;
        let direction = if self.lon_step_deg < 0.0 { -1.0 } else { 1.0 };
        let mut delta = ((to_lon360(lon) - self.first_lon_deg360) * direction).rem_euclid(360.0);
        // West of the first column wraps to just under 360; pull it back negative.
        if delta > span + (360.0 - span) / 2.0 {
            delta -= 360.0;
        }
        delta / step
    }
}

/// Brute-force nearest cell over explicit coordinate arrays. Longitudes on
/// both sides are compared in 0..360 with the shortest signed delta.
pub fn nearest_index(grid: &LatLonGrid, lat: f64, lon: f64) -> Option<(usize, usize)> {
    if grid.cols == 0 || !lat.is_finite() || !lon.is_finite() {
        return None;
    }
    let target_lon = to_lon360(lon);
    let mut best: Option<(usize, f64)> = None;

    for (idx, (cell_lat, cell_lon)) in grid.lats.iter().zip(grid.lons.iter()).enumerate() {
        let cell_lat = *cell_lat as f64;
        let cell_lon = *cell_lon as f64;
        if !cell_lat.is_finite() || !cell_lon.is_finite() {
            continue;
        }
        let dlat = cell_lat - lat;
        let dlon = shortest_lon_delta_degrees(to_lon360(cell_lon), target_lon);
        let dist = dlat * dlat + dlon * dlon;
        match best {
            Some((_, best_dist)) if best_dist <= dist => {}
            _ => best = Some((idx, dist)),
        }
    }

    best.map(|(idx, _)| (idx / grid.cols, idx % grid.cols))
}

/// Cell lookup for a batch of points against one raster.
pub fn cells_for(raster: &DecodedRaster, points: &[GeoPoint]) -> Vec<Option<(usize, usize)>> {
    match &raster.geometry {
        GridGeometry::Fixed(grid) => points
            .iter()
            .map(|point| Some(grid.index_of(point.lat, point.lon)))
            .collect(),
        GridGeometry::Irregular(grid) => points
            .iter()
            .map(|point| nearest_index(grid, point.lat, point.lon))
            .collect(),
    }
}
