use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, f64::consts::PI, fmt};

/// Deepest zoom level any planning layer is served at.
pub const MAX_ZOOM: u8 = 22;

/// Latitude limit of the Web-Mercator projection.
pub const MAX_LAT: f64 = 85.051_128_78;

/// A slippy-map tile with x, y and z-coordinate.
/// ref: https://wiki.openstreetmap.org/wiki/Slippy_map_tilenames
///
/// Ordered row-major: by zoom, then row (`y`), then column (`x`).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TileCoord {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    /// Returns `None` unless `z <= 22` and `x, y < 2^z`.
    pub fn new(z: u8, x: u32, y: u32) -> Option<Self> {
        let n = tiles_per_axis(z)?;
        if u64::from(x) < n && u64::from(y) < n {
            Some(Self { z, x, y })
        } else {
            None
        }
    }

    /// Tile containing the given point, clamped into the grid.
    ///
    /// Latitudes beyond the Web-Mercator limit are clamped to it.
    pub fn from_lat_lon(lat: f64, lon: f64, zoom: u8) -> Option<Self> {
        let n = tiles_per_axis(zoom)? as i64;
        let (x, y) = center_indices(lat, lon, zoom);

        Some(Self {
            z: zoom,
            x: x.clamp(0, n - 1) as u32,
            y: y.clamp(0, n - 1) as u32,
        })
    }
}

impl Ord for TileCoord {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.z, self.y, self.x).cmp(&(other.z, other.y, other.x))
    }
}

impl PartialOrd for TileCoord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// `2^z`, or `None` above [`MAX_ZOOM`].
pub fn tiles_per_axis(zoom: u8) -> Option<u64> {
    if zoom > MAX_ZOOM {
        None
    } else {
        Some(1u64 << zoom)
    }
}

/// Unclamped Web-Mercator tile indices of a point at `zoom`.
///
/// `x = floor((lon + 180) / 360 * n)`,
/// `y = floor((1 - asinh(tan(lat)) / π) / 2 * n)`.
pub fn center_indices(lat: f64, lon: f64, zoom: u8) -> (i64, i64) {
    let lat = lat.clamp(-MAX_LAT, MAX_LAT);

    // scale factor
    let n = 2_f64.powi(i32::from(zoom));
    let lat_rad = lat.to_radians();

    let x = ((lon + 180_f64) / 360_f64 * n).floor();
    let y = ((1_f64 - lat_rad.tan().asinh() / PI) / 2_f64 * n).floor();

    (x as i64, y as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_grid() {
        assert!(TileCoord::new(0, 0, 0).is_some());
        assert!(TileCoord::new(0, 1, 0).is_none());
        assert!(TileCoord::new(12, 4095, 4095).is_some());
        assert!(TileCoord::new(12, 4096, 0).is_none());
        assert!(TileCoord::new(23, 0, 0).is_none());
    }

    #[test]
    fn tile_index() {
        let tile = TileCoord::from_lat_lon(50.7929, 6.0402, 18).unwrap();
        assert_eq!((tile.x, tile.y), (135470, 87999));
    }

    #[test]
    fn hanoi_at_zoom_12() {
        let tile = TileCoord::from_lat_lon(21.0285, 105.8542, 12).unwrap();
        assert_eq!((tile.x, tile.y), (3252, 1803));
    }

    #[test]
    fn clamps_edges() {
        let tile = TileCoord::from_lat_lon(89.9, 180.0, 4).unwrap();
        assert_eq!((tile.x, tile.y), (15, 0));
    }

    #[test]
    fn row_major_order() {
        let mut tiles = vec![
            TileCoord::new(2, 1, 0).unwrap(),
            TileCoord::new(1, 0, 1).unwrap(),
            TileCoord::new(2, 0, 1).unwrap(),
            TileCoord::new(2, 0, 0).unwrap(),
        ];
        tiles.sort();
        assert_eq!(
            tiles,
            vec![
                TileCoord::new(1, 0, 1).unwrap(),
                TileCoord::new(2, 0, 0).unwrap(),
                TileCoord::new(2, 1, 0).unwrap(),
                TileCoord::new(2, 0, 1).unwrap(),
            ]
        );
    }
}
