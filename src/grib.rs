use std::f64::consts::FRAC_PI_2;
use std::f64::consts::FRAC_PI_4;
use std::io::{Cursor, Read};

use flate2::read::GzDecoder;

use crate::cache::GridCoordinateCache;
use crate::error::DecodeError;
use crate::types::{DecodedRaster, FixedGrid, GridGeometry, LatLonGrid};
use crate::utils::to_lon360;

/// Signature shared by the real decoder and test doubles.
pub type DecodeFn = fn(&[u8], &GridCoordinateCache) -> Result<DecodedRaster, DecodeError>;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PolarStereographicGrid {
    pub rows: usize,
    pub cols: usize,
    pub la1_deg: f64,
    pub lo1_deg360: f64,
    pub lad_deg: f64,
    pub lov_deg360: f64,
    pub dx_m: f64,
    pub dy_m: f64,
    pub south_pole: bool,
    pub scanning_mode: u8,
    pub earth_radius_m: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GridDefinition {
    LatLon(FixedGrid),
    PolarStereographic(PolarStereographicGrid),
}

impl GridDefinition {
    pub fn shape(&self) -> (usize, usize) {
        match self {
            Self::LatLon(grid) => (grid.rows, grid.cols),
            Self::PolarStereographic(grid) => (grid.rows, grid.cols),
        }
    }
}

pub fn decode_raster(
    payload: &[u8],
    coordinates: &GridCoordinateCache,
) -> Result<DecodedRaster, DecodeError> {
    let grib = gunzip_if_needed(payload)?;
    let definition = read_grid_definition(&grib)?;
    let values = decode_first_message(&grib)?;

    let (rows, cols) = definition.shape();
    if values.len() != rows * cols {
        return Err(DecodeError::ValueCount {
            cells: rows * cols,
            values: values.len(),
        });
    }

    let geometry = match definition {
        GridDefinition::LatLon(grid) => GridGeometry::Fixed(grid),
        GridDefinition::PolarStereographic(grid) => {
            GridGeometry::Irregular(coordinates.coordinates_for(&grid)?)
        }
    };

    Ok(DecodedRaster {
        rows,
        cols,
        values,
        geometry,
    })
}

pub fn gunzip_if_needed(payload: &[u8]) -> Result<Vec<u8>, DecodeError> {
    if !payload.starts_with(&GZIP_MAGIC) {
        return Ok(payload.to_vec());
    }
    let mut decoder = GzDecoder::new(Cursor::new(payload));
    let mut grib = Vec::new();
    decoder.read_to_end(&mut grib)?;
    Ok(grib)
}

fn decode_first_message(buffer: &[u8]) -> Result<Vec<f32>, DecodeError> {
    let grib2 = grib::from_reader(Cursor::new(buffer))
        .map_err(|error| DecodeError::Grib(error.to_string()))?;

    let message_count = grib2.iter().count();
    if message_count != 1 {
        return Err(DecodeError::MessageCount(message_count));
    }
    let (_, submessage) = grib2
        .iter()
        .next()
        .ok_or(DecodeError::MessageCount(0))?;

    let decoder = grib::Grib2SubmessageDecoder::from(submessage)
        .map_err(|error| DecodeError::Grib(error.to_string()))?;
    let values = decoder
        .dispatch()
        .map_err(|error| DecodeError::Grib(error.to_string()))?;
    Ok(values.collect())
}

/// Walks the GRIB2 sections up to the first grid definition (section 3).
pub fn read_grid_definition(buffer: &[u8]) -> Result<GridDefinition, DecodeError> {
    if buffer.len() < 20 {
        return Err(DecodeError::Truncated(buffer.len()));
    }
    if &buffer[0..4] != b"GRIB" {
        return Err(DecodeError::NotGrib);
    }
    if buffer[7] != 2 {
        return Err(DecodeError::Grib(format!(
            "GRIB edition {} is not supported",
            buffer[7]
        )));
    }

    let mut pointer = 16_usize;
    while pointer + 5 <= buffer.len() {
        if &buffer[pointer..pointer + 4] == b"7777" {
            break;
        }

        let section_length = read_u32_be(buffer, pointer)? as usize;
        let section_number = buffer[pointer + 4];
        if section_length < 5 || pointer + section_length > buffer.len() {
            return Err(DecodeError::Truncated(pointer));
        }

        if section_number == 3 {
            let template_number = read_u16_be(buffer, pointer + 12)?;
            return match template_number {
                0 => read_latlon_template(buffer, pointer).map(GridDefinition::LatLon),
                20 => read_polar_stereographic_template(buffer, pointer)
                    .map(GridDefinition::PolarStereographic),
                other => Err(DecodeError::UnsupportedGrid(other)),
            };
        }

        pointer += section_length;
    }

    Err(DecodeError::Grib("GRIB section 3 missing".to_string()))
}

fn read_latlon_template(buffer: &[u8], pointer: usize) -> Result<FixedGrid, DecodeError> {
    let nx = read_u32_be(buffer, pointer + 30)? as usize;
    let ny = read_u32_be(buffer, pointer + 34)? as usize;
    let la1_deg = read_grib_signed_scaled_int32(buffer, pointer + 46)?;
    let lo1_deg360 = to_lon360(read_grib_signed_scaled_int32(buffer, pointer + 50)?);
    let di_deg = read_u32_be(buffer, pointer + 63)? as f64 / 1_000_000.0;
    let dj_deg = read_u32_be(buffer, pointer + 67)? as f64 / 1_000_000.0;
    let scanning_mode = read_u8(buffer, pointer + 71)?;

    let lat_step_deg = if scanning_mode & 0x40 == 0 {
        -dj_deg.abs()
    } else {
        dj_deg.abs()
    };
    let lon_step_deg = if scanning_mode & 0x80 == 0 {
        di_deg.abs()
    } else {
        -di_deg.abs()
    };

    Ok(FixedGrid {
        rows: ny,
        cols: nx,
        first_lat_deg: la1_deg,
        first_lon_deg360: lo1_deg360,
        lat_step_deg,
        lon_step_deg,
    })
}

fn read_polar_stereographic_template(
    buffer: &[u8],
    pointer: usize,
) -> Result<PolarStereographicGrid, DecodeError> {
    let earth_shape = read_u8(buffer, pointer + 14)?;
    let earth_radius_m = match earth_shape {
        0 => 6_367_470.0,
        1 => {
            let scale = read_u8(buffer, pointer + 15)? as i32;
            let value = read_u32_be(buffer, pointer + 16)? as f64;
            value / 10_f64.powi(scale)
        }
        _ => 6_371_229.0,
    };

    let nx = read_u32_be(buffer, pointer + 30)? as usize;
    let ny = read_u32_be(buffer, pointer + 34)? as usize;
    let la1_deg = read_grib_signed_scaled_int32(buffer, pointer + 38)?;
    let lo1_deg360 = to_lon360(read_u32_be(buffer, pointer + 42)? as f64 / 1_000_000.0);
    let lad_deg = read_grib_signed_scaled_int32(buffer, pointer + 47)?;
    let lov_deg360 = to_lon360(read_u32_be(buffer, pointer + 51)? as f64 / 1_000_000.0);
    let dx_m = read_u32_be(buffer, pointer + 55)? as f64 / 1_000.0;
    let dy_m = read_u32_be(buffer, pointer + 59)? as f64 / 1_000.0;
    let projection_centre = read_u8(buffer, pointer + 63)?;
    let scanning_mode = read_u8(buffer, pointer + 64)?;

    Ok(PolarStereographicGrid {
        rows: ny,
        cols: nx,
        la1_deg,
        lo1_deg360,
        lad_deg,
        lov_deg360,
        dx_m,
        dy_m,
        south_pole: projection_centre & 0x80 != 0,
        scanning_mode,
        earth_radius_m,
    })
}

impl PolarStereographicGrid {
    /// Per-cell coordinates on a spherical earth, row-major in scan order.
    pub fn derive_latlons(&self) -> Result<LatLonGrid, DecodeError> {
        if self.south_pole {
            return Err(DecodeError::UnsupportedGrid(20));
        }

        let lad = self.lad_deg.to_radians();
        let lov = self.lov_deg360.to_radians();
        let scale = self.earth_radius_m * (1.0 + lad.sin());

        let rho_of = |lat: f64| scale * (FRAC_PI_4 - lat / 2.0).tan();
        let first_rho = rho_of(self.la1_deg.to_radians());
        let first_dl = self.lo1_deg360.to_radians() - lov;
        let x0 = first_rho * first_dl.sin();
        let y0 = -first_rho * first_dl.cos();

        let x_step = if self.scanning_mode & 0x80 == 0 {
            self.dx_m
        } else {
            -self.dx_m
        };
        let y_step = if self.scanning_mode & 0x40 != 0 {
            self.dy_m
        } else {
            -self.dy_m
        };

        let cells = self.rows * self.cols;
        let mut lats = Vec::with_capacity(cells);
        let mut lons = Vec::with_capacity(cells);
        for j in 0..self.rows {
            let y = y0 + j as f64 * y_step;
            for i in 0..self.cols {
                let x = x0 + i as f64 * x_step;
                let rho = x.hypot(y);
                let lat = FRAC_PI_2 - 2.0 * (rho / scale).atan();
                let lon = lov + x.atan2(-y);
                lats.push(lat.to_degrees() as f32);
                lons.push(to_lon360(lon.to_degrees()) as f32);
            }
        }

        Ok(LatLonGrid {
            rows: self.rows,
            cols: self.cols,
            lats,
            lons,
        })
    }
}

fn read_u8(buffer: &[u8], offset: usize) -> Result<u8, DecodeError> {
    buffer
        .get(offset)
        .copied()
        .ok_or(DecodeError::Truncated(offset))
}

fn read_u16_be(buffer: &[u8], offset: usize) -> Result<u16, DecodeError> {
    if offset + 2 > buffer.len() {
        return Err(DecodeError::Truncated(offset));
    }
    Ok(u16::from_be_bytes([buffer[offset], buffer[offset + 1]]))
}

fn read_u32_be(buffer: &[u8], offset: usize) -> Result<u32, DecodeError> {
    if offset + 4 > buffer.len() {
        return Err(DecodeError::Truncated(offset));
    }
    Ok(u32::from_be_bytes([
        buffer[offset],
        buffer[offset + 1],
        buffer[offset + 2],
        buffer[offset + 3],
    ]))
}

fn read_grib_signed_scaled_int32(buffer: &[u8], offset: usize) -> Result<f64, DecodeError> {
    let raw = read_u32_be(buffer, offset)?;
    let sign = if (raw & 0x8000_0000) != 0 { -1.0 } else { 1.0 };
    let magnitude = (raw & 0x7fff_ffff) as f64;
    Ok(sign * magnitude / 1_000_000.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn put_u32(buffer: &mut [u8], offset: usize, value: u32) {
        buffer[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    }

    fn put_signed(buffer: &mut [u8], offset: usize, degrees: f64) {
        let magnitude = (degrees.abs() * 1_000_000.0).round() as u32;
        let raw = if degrees < 0.0 {
            magnitude | 0x8000_0000
        } else {
            magnitude
        };
        put_u32(buffer, offset, raw);
    }

    fn grib_with_section3(section3: Vec<u8>) -> Vec<u8> {
        let mut buffer = b"GRIB".to_vec();
        buffer.extend_from_slice(&[0, 0, 0, 2]);
        buffer.extend_from_slice(&0_u64.to_be_bytes());
        buffer.extend(section3);
        buffer.extend_from_slice(b"7777");
        buffer
    }

    fn latlon_section3() -> Vec<u8> {
        let mut section = vec![0_u8; 72];
        put_u32(&mut section, 0, 72);
        section[4] = 3;
        section[12..14].copy_from_slice(&0_u16.to_be_bytes());
        put_u32(&mut section, 30, 7000);
        put_u32(&mut section, 34, 3500);
        put_signed(&mut section, 46, 54.995);
        put_signed(&mut section, 50, 230.005);
        put_u32(&mut section, 63, 10_000);
        put_u32(&mut section, 67, 10_000);
        section[71] = 0;
        section
    }

    fn polar_section3() -> Vec<u8> {
        let mut section = vec![0_u8; 65];
        put_u32(&mut section, 0, 65);
        section[4] = 3;
        section[12..14].copy_from_slice(&20_u16.to_be_bytes());
        section[14] = 6;
        put_u32(&mut section, 30, 4);
        put_u32(&mut section, 34, 3);
        put_signed(&mut section, 38, 40.0);
        put_u32(&mut section, 42, 255_000_000);
        put_signed(&mut section, 47, 60.0);
        put_u32(&mut section, 51, 255_000_000);
        put_u32(&mut section, 55, 4_762_500);
        put_u32(&mut section, 59, 4_762_500);
        section[63] = 0;
        section[64] = 0x40;
        section
    }

    fn section(number: u8, body: &[u8]) -> Vec<u8> {
        let mut section = ((body.len() + 5) as u32).to_be_bytes().to_vec();
        section.push(number);
        section.extend_from_slice(body);
        section
    }

    /// One-degree lat/lon grid with its first cell at 41N 75W.
    fn small_latlon_section3(cols: u32, rows: u32, points: u32) -> Vec<u8> {
        let mut section = vec![0_u8; 72];
        put_u32(&mut section, 0, 72);
        section[4] = 3;
        put_u32(&mut section, 6, points);
        put_u32(&mut section, 30, cols);
        put_u32(&mut section, 34, rows);
        put_signed(&mut section, 46, 41.0);
        put_signed(&mut section, 50, 285.0);
        put_u32(&mut section, 63, 1_000_000);
        put_u32(&mut section, 67, 1_000_000);
        section
    }

    /// A complete message with 8-bit simple packing (template 5.0) and no
    /// bitmap.
    fn simple_packed_message(cols: u32, rows: u32, values: &[u8]) -> Vec<u8> {
        let points = values.len() as u32;
        let mut body = section(1, &[0_u8; 16]);
        body.extend(small_latlon_section3(cols, rows, points));
        body.extend(section(4, &[0_u8; 29]));

        let mut representation = points.to_be_bytes().to_vec();
        representation.extend_from_slice(&0_u16.to_be_bytes());
        representation.extend_from_slice(&0.0_f32.to_be_bytes());
        // binary scale, decimal scale, 8 bits per value, floating point
        representation.extend_from_slice(&[0, 0, 0, 0, 8, 0]);
        body.extend(section(5, &representation));
        body.extend(section(6, &[0xff]));
        body.extend(section(7, values));

        let total_length = (16 + body.len() + 4) as u64;
        let mut message = b"GRIB".to_vec();
        message.extend_from_slice(&[0, 0, 0, 2]);
        message.extend_from_slice(&total_length.to_be_bytes());
        message.extend(body);
        message.extend_from_slice(b"7777");
        message
    }

    #[test]
    fn reads_latlon_grid_definition() {
        let buffer = grib_with_section3(latlon_section3());
        let definition = read_grid_definition(&buffer).expect("definition");
        let GridDefinition::LatLon(grid) = definition else {
            panic!("expected lat/lon grid");
        };
        assert_eq!(grid.rows, 3500);
        assert_eq!(grid.cols, 7000);
        assert!((grid.first_lat_deg - 54.995).abs() < 1e-9);
        assert!((grid.first_lon_deg360 - 230.005).abs() < 1e-9);
        assert!((grid.lat_step_deg + 0.01).abs() < 1e-12);
        assert!((grid.lon_step_deg - 0.01).abs() < 1e-12);
    }

    #[test]
    fn reads_polar_stereographic_definition_and_derives_coordinates() {
        let buffer = grib_with_section3(polar_section3());
        let GridDefinition::PolarStereographic(grid) =
            read_grid_definition(&buffer).expect("definition")
        else {
            panic!("expected polar stereographic grid");
        };
        assert_eq!((grid.rows, grid.cols), (3, 4));
        assert_eq!(grid.earth_radius_m, 6_371_229.0);

        let latlons = grid.derive_latlons().expect("latlons");
        assert_eq!(latlons.lats.len(), 12);
        assert!((latlons.lats[0] as f64 - 40.0).abs() < 1e-3);
        assert!((latlons.lons[0] as f64 - 255.0).abs() < 1e-3);
        // scanning north-bound: each row sits further north
        assert!(latlons.lats[4] > latlons.lats[0]);
        assert!(latlons.lats[8] > latlons.lats[4]);
        // eastward along the row
        assert!(latlons.lons[1] > latlons.lons[0]);
    }

    #[test]
    fn rejects_unsupported_templates_and_non_grib_payloads() {
        let mut section = latlon_section3();
        section[12..14].copy_from_slice(&30_u16.to_be_bytes());
        let buffer = grib_with_section3(section);
        assert!(matches!(
            read_grid_definition(&buffer),
            Err(DecodeError::UnsupportedGrid(30))
        ));

        let html = b"<html><body>not found</body></html>";
        assert!(matches!(
            read_grid_definition(html),
            Err(DecodeError::NotGrib)
        ));
    }

    #[test]
    fn gunzip_passes_plain_payloads_through() {
        let plain = b"GRIB-plain".to_vec();
        assert_eq!(gunzip_if_needed(&plain).expect("plain"), plain);

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&plain).expect("write");
        let zipped = encoder.finish().expect("finish");
        assert_eq!(gunzip_if_needed(&zipped).expect("gunzip"), plain);
    }

    #[test]
    fn corrupt_gzip_is_a_decode_error() {
        let corrupt = [0x1f, 0x8b, 0x08, 0x00, 0x01, 0x02];
        assert!(matches!(
            gunzip_if_needed(&corrupt),
            Err(DecodeError::Gzip(_))
        ));
    }

    #[test]
    fn decode_raster_surfaces_decode_errors() {
        let cache = GridCoordinateCache::new();
        let result = decode_raster(b"<html><body>503 Service Unavailable</body></html>", &cache);
        assert!(matches!(result, Err(DecodeError::NotGrib)));
    }

    #[test]
    fn decodes_a_simple_packed_message() {
        let cache = GridCoordinateCache::new();
        let message = simple_packed_message(2, 2, &[0, 5, 13, 25]);

        let raster = decode_raster(&message, &cache).expect("raster");
        assert_eq!((raster.rows, raster.cols), (2, 2));
        assert_eq!(raster.values, vec![0.0, 5.0, 13.0, 25.0]);
        assert_eq!(raster.value_at(1, 1), Some(25.0));
        assert!(matches!(
            raster.geometry,
            GridGeometry::Fixed(grid) if grid.first_lat_deg == 41.0 && grid.lat_step_deg == -1.0
        ));

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&message).expect("write");
        let zipped = encoder.finish().expect("finish");
        let unzipped = decode_raster(&zipped, &cache).expect("gzipped raster");
        assert_eq!(unzipped.values, raster.values);
    }

    #[test]
    fn payload_with_two_messages_is_rejected() {
        let message = simple_packed_message(2, 2, &[1, 2, 3, 4]);
        let doubled = [message.clone(), message].concat();
        assert!(matches!(
            decode_raster(&doubled, &GridCoordinateCache::new()),
            Err(DecodeError::MessageCount(2))
        ));
    }

    #[test]
    fn decoded_values_must_fill_the_grid() {
        let message = simple_packed_message(3, 2, &[1, 2, 3, 4]);
        assert!(matches!(
            decode_raster(&message, &GridCoordinateCache::new()),
            Err(DecodeError::ValueCount {
                cells: 6,
                values: 4
            })
        ));
    }
}
