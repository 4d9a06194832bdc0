//! Geo index: 64-bit Morton/Z-order interleave over quantized lat/lon.
//!
//! Points are stored as sibling fields (`field_lat`, `field_lon`). The
//! entry key embeds the Morton code, so a bounding-box scan is a single
//! key-range walk between the codes of the box corners — a superset of
//! the box, tightened by decoding each candidate's code and checking the
//! box exactly. Radius queries walk the bounding box of the circle and
//! Haversine-filter with Earth radius 6371 km; the boundary distance is
//! inclusive.
//!
//! Quantization is 32 bits per axis (about 4e-8 degrees, sub-millimeter
//! on the ground), so filtering on dequantized coordinates is exact for
//! any practical radius.

use crate::catalog::{IndexConfig, IndexDescriptor};
use crate::keys::{index_prefix, prefix, CF_INDEX};
use byteorder::{BigEndian, ByteOrder};
use themis_core::error::{Result, ThemisError};
use themis_core::limits::EARTH_RADIUS_KM;
use themis_core::types::Direction;
use themis_core::value::Value;
use themis_storage::{Snapshot, Store, StoreTxn};

/// Quantize a coordinate into 32 bits over its legal range.
fn quantize(value: f64, min: f64, max: f64) -> u32 {
    let clamped = value.clamp(min, max);
    let scaled = (clamped - min) / (max - min);
    (scaled * u32::MAX as f64).round() as u32
}

fn dequantize(q: u32, min: f64, max: f64) -> f64 {
    min + (q as f64 / u32::MAX as f64) * (max - min)
}

/// Spread the bits of `v` so they occupy the even positions.
fn spread(v: u32) -> u64 {
    let mut x = v as u64;
    x = (x | (x << 16)) & 0x0000_FFFF_0000_FFFF;
    x = (x | (x << 8)) & 0x00FF_00FF_00FF_00FF;
    x = (x | (x << 4)) & 0x0F0F_0F0F_0F0F_0F0F;
    x = (x | (x << 2)) & 0x3333_3333_3333_3333;
    x = (x | (x << 1)) & 0x5555_5555_5555_5555;
    x
}

fn unspread(x: u64) -> u32 {
    let mut v = x & 0x5555_5555_5555_5555;
    v = (v | (v >> 1)) & 0x3333_3333_3333_3333;
    v = (v | (v >> 2)) & 0x0F0F_0F0F_0F0F_0F0F;
    v = (v | (v >> 4)) & 0x00FF_00FF_00FF_00FF;
    v = (v | (v >> 8)) & 0x0000_FFFF_0000_FFFF;
    v = (v | (v >> 16)) & 0x0000_0000_FFFF_FFFF;
    v as u32
}

/// 64-bit Morton code of a point. Latitude takes the even bit
/// positions, longitude the odd ones.
pub fn morton_encode(lat: f64, lon: f64) -> u64 {
    let qlat = quantize(lat, -90.0, 90.0);
    let qlon = quantize(lon, -180.0, 180.0);
    spread(qlat) | (spread(qlon) << 1)
}

/// Inverse of [`morton_encode`], up to quantization.
pub fn morton_decode(code: u64) -> (f64, f64) {
    let qlat = unspread(code);
    let qlon = unspread(code >> 1);
    (
        dequantize(qlat, -90.0, 90.0),
        dequantize(qlon, -180.0, 180.0),
    )
}

/// Great-circle distance in kilometers.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}

fn fields(descriptor: &IndexDescriptor) -> Result<(&str, &str)> {
    match &descriptor.config {
        IndexConfig::Geo {
            field_lat,
            field_lon,
        } => Ok((field_lat, field_lon)),
        _ => Err(ThemisError::internal(format!(
            "index '{}' is not a geo index",
            descriptor.name
        ))),
    }
}

fn point_of(descriptor: &IndexDescriptor, value: &Value) -> Result<Option<(f64, f64)>> {
    let (field_lat, field_lon) = fields(descriptor)?;
    let lat = value.get_path(field_lat).and_then(Value::as_f64);
    let lon = value.get_path(field_lon).and_then(Value::as_f64);
    match (lat, lon) {
        (Some(lat), Some(lon)) => {
            if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
                return Err(ThemisError::schema_violation(format!(
                    "coordinates ({}, {}) are outside the legal range",
                    lat, lon
                )));
            }
            Ok(Some((lat, lon)))
        }
        // One sibling without the other is a malformed point.
        (Some(_), None) | (None, Some(_)) => Err(ThemisError::schema_violation(format!(
            "record has only one of {}/{}",
            field_lat, field_lon
        ))),
        (None, None) => Ok(None),
    }
}

fn entry_key(descriptor: &IndexDescriptor, code: u64, pk: &str) -> Vec<u8> {
    let mut key = index_prefix(prefix::GEO, &descriptor.name);
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, code);
    key.extend_from_slice(&buf);
    key.extend_from_slice(pk.as_bytes());
    key
}

/// Stage the index mutation for one record change.
pub fn apply(
    txn: &mut StoreTxn,
    descriptor: &IndexDescriptor,
    pk: &str,
    before: Option<&Value>,
    after: Option<&Value>,
) -> Result<()> {
    let old = match before {
        Some(v) => point_of(descriptor, v)?,
        None => None,
    };
    let new = match after {
        Some(v) => point_of(descriptor, v)?,
        None => None,
    };
    let old_code = old.map(|(lat, lon)| morton_encode(lat, lon));
    let new_code = new.map(|(lat, lon)| morton_encode(lat, lon));
    if old_code == new_code {
        return Ok(());
    }
    if let Some(code) = old_code {
        txn.delete(CF_INDEX, &entry_key(descriptor, code, pk))?;
    }
    if let Some(code) = new_code {
        txn.put(CF_INDEX, &entry_key(descriptor, code, pk), b"")?;
    }
    Ok(())
}

/// A geo scan hit: pk plus the indexed point (dequantized).
#[derive(Debug, Clone, PartialEq)]
pub struct GeoHit {
    /// Primary key.
    pub pk: String,
    /// Latitude of the indexed point.
    pub lat: f64,
    /// Longitude of the indexed point.
    pub lon: f64,
}

/// Bounding-box scan: pks of points inside the box, sorted by pk.
pub fn scan_bbox(
    store: &Store,
    snapshot: &Snapshot,
    descriptor: &IndexDescriptor,
    min_lat: f64,
    min_lon: f64,
    max_lat: f64,
    max_lon: f64,
) -> Result<Vec<GeoHit>> {
    if min_lat > max_lat || min_lon > max_lon {
        return Err(ThemisError::schema_violation(
            "bounding box minimum exceeds maximum",
        ));
    }
    let base = index_prefix(prefix::GEO, &descriptor.name);
    let lo_code = morton_encode(min_lat, min_lon);
    let hi_code = morton_encode(max_lat, max_lon);

    let mut lo_key = base.clone();
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, lo_code);
    lo_key.extend_from_slice(&buf);
    let mut hi_key = base.clone();
    BigEndian::write_u64(&mut buf, hi_code.saturating_add(1));
    hi_key.extend_from_slice(&buf);

    // The Morton range is a superset of the box; the decoded coordinate
    // check tightens it to the exact box. A small epsilon absorbs the
    // quantization round-trip at the box edge.
    const EDGE_EPS: f64 = 1e-6;
    let mut hits = Vec::new();
    for (key, _) in store.range_iter(
        CF_INDEX,
        &lo_key,
        Some(&hi_key),
        snapshot,
        Direction::Forward,
        None,
    ) {
        let suffix = &key[base.len()..];
        let code = BigEndian::read_u64(&suffix[..8]);
        let (lat, lon) = morton_decode(code);
        if lat >= min_lat - EDGE_EPS
            && lat <= max_lat + EDGE_EPS
            && lon >= min_lon - EDGE_EPS
            && lon <= max_lon + EDGE_EPS
        {
            hits.push(GeoHit {
                pk: String::from_utf8_lossy(&suffix[8..]).into_owned(),
                lat,
                lon,
            });
        }
    }
    hits.sort_by(|a, b| a.pk.cmp(&b.pk));
    Ok(hits)
}

/// Radius scan: pks of points within `radius_km` of the center
/// (inclusive at the boundary), sorted by ascending distance.
pub fn scan_radius(
    store: &Store,
    snapshot: &Snapshot,
    descriptor: &IndexDescriptor,
    lat: f64,
    lon: f64,
    radius_km: f64,
) -> Result<Vec<(GeoHit, f64)>> {
    if radius_km < 0.0 {
        return Err(ThemisError::schema_violation("radius must be non-negative"));
    }
    // Bounding box of the circle; degrees of longitude shrink with
    // latitude.
    let deg_per_km_lat = 360.0 / (2.0 * std::f64::consts::PI * EARTH_RADIUS_KM);
    let dlat = radius_km * deg_per_km_lat;
    let cos_lat = lat.to_radians().cos().max(1e-9);
    let dlon = radius_km * deg_per_km_lat / cos_lat;

    let hits = scan_bbox(
        store,
        snapshot,
        descriptor,
        (lat - dlat).max(-90.0),
        (lon - dlon).max(-180.0),
        (lat + dlat).min(90.0),
        (lon + dlon).min(180.0),
    )?;

    const BOUNDARY_EPS: f64 = 1e-9;
    let mut within: Vec<(GeoHit, f64)> = hits
        .into_iter()
        .filter_map(|hit| {
            let d = haversine_km(lat, lon, hit.lat, hit.lon);
            (d <= radius_km + BOUNDARY_EPS).then_some((hit, d))
        })
        .collect();
    within.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
    Ok(within)
}
