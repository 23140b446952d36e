use std::collections::BTreeSet;

use crate::error::ConfigError;
use crate::region::{Centroid, Region};
use crate::tile::{center_indices, tiles_per_axis, TileCoord, MAX_ZOOM};

/// Ground resolution at the equator at zoom 0, in meters per pixel.
const EQUATOR_METERS_PER_PIXEL: f64 = 156_543.033_92;
const TILE_SIZE_PX: f64 = 256.0;

/// Bounds of the half-width, in tiles, of the square planned around a centroid.
pub const MIN_RADIUS_TILES: i64 = 5;
pub const MAX_RADIUS_TILES: i64 = 50;

/// Ground size of one tile at `lat` degrees and `zoom`, in meters.
pub fn meters_per_tile(lat: f64, zoom: u8) -> f64 {
    let meters_per_pixel =
        EQUATOR_METERS_PER_PIXEL * lat.to_radians().cos() / 2_f64.powi(i32::from(zoom));
    meters_per_pixel * TILE_SIZE_PX
}

/// Half-width of the planned square in tiles: `round(radius / tile size)`
/// clamped to `[5, 50]`.
pub fn radius_tiles(lat: f64, radius_km: f64, zoom: u8) -> i64 {
    let tiles = (radius_km * 1000.0 / meters_per_tile(lat, zoom)).round();
    if tiles.is_finite() {
        (tiles as i64).clamp(MIN_RADIUS_TILES, MAX_RADIUS_TILES)
    } else {
        MAX_RADIUS_TILES
    }
}

/// Creates an iterator over all tiles of the square covering a disc of
/// `radius_km` around `centroid` at one zoom level, row by row.
///
/// Indices outside `[0, 2^z)` are dropped.
///
/// # Example
/// ```rust
/// # use planning_tile_harvester::{plan_zoom, Centroid};
/// let hanoi = Centroid { lat: 21.0285, lon: 105.8542 };
/// assert_eq!(plan_zoom(hanoi, 5.0, 12).count(), 121);
/// ```
pub fn plan_zoom(
    centroid: Centroid,
    radius_km: f64,
    zoom: u8,
) -> impl Iterator<Item = TileCoord> {
    let n = tiles_per_axis(zoom).map_or(0, |n| n as i64);
    let (cx, cy) = center_indices(centroid.lat, centroid.lon, zoom);
    let r = radius_tiles(centroid.lat, radius_km, zoom);

    let xs = (cx - r).max(0)..=(cx + r).min(n - 1);
    let ys = (cy - r).max(0)..=(cy + r).min(n - 1);

    ys.flat_map(move |y| {
        xs.clone().map(move |x| TileCoord {
            z: zoom,
            x: x as u32,
            y: y as u32,
        })
    })
}

/// Checks a zoom set and returns it sorted and deduplicated.
pub fn normalize_zooms(zooms: &[u8]) -> Result<Vec<u8>, ConfigError> {
    let set: BTreeSet<u8> = zooms.iter().copied().collect();
    if let Some(&bad) = set.iter().find(|&&z| z > MAX_ZOOM) {
        return Err(ConfigError::InvalidZoom(bad));
    }

    Ok(set.into_iter().collect())
}

/// Every tile to fetch for `region` over `zooms`, in `(z, y, x)` ascending
/// order.
pub fn plan_region(region: &Region, zooms: &[u8]) -> Result<Vec<TileCoord>, ConfigError> {
    let zooms = normalize_zooms(zooms)?;

    Ok(zooms
        .into_iter()
        .flat_map(|z| plan_zoom(region.centroid, region.radius_km, z))
        .collect())
}
