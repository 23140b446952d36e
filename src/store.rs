//! On-disk tile tree layout.
//!
//! A tile lives at `<root>/<region>/<variant folder>[/<subregion>]/<z>/<x>_<y>.<ext>`,
//! the subregion segment being present only for the per-district annual plan.
//! The relative path is the tile's only identity, which is what makes fetch
//! and publication resumable.

use serde::Serialize;
use std::{
    collections::BTreeMap,
    ffi::OsStr,
    path::{Component, Path, PathBuf},
};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::StoreError;
use crate::tile::TileCoord;
use crate::variant::Variant;

/// Default tile root, relative to the working directory.
pub const DEFAULT_TILE_ROOT: &str = "tiles/cities";

/// Existence cache file, a sibling of the tile root.
pub const CACHE_FILE_NAME: &str = ".file_cache.txt";

/// Upload resume state, a sibling of the tile root.
pub const RESUME_FILE_NAME: &str = ".upload_state.json";

/// Suffix of in-flight downloads.
pub const PARTIAL_SUFFIX: &str = ".part";

/// One tile on disk, identified by its path below the tile root.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalTile {
    pub region_id: String,
    pub variant: Variant,
    pub subregion_id: Option<String>,
    pub coord: TileCoord,
    pub ext: String,
}

impl LocalTile {
    /// `<region>/<folder>[/<subregion>]`.
    pub fn combination(&self) -> String {
        match &self.subregion_id {
            Some(sub) => format!("{}/{}/{}", self.region_id, self.variant.folder(), sub),
            None => format!("{}/{}", self.region_id, self.variant.folder()),
        }
    }

    /// Path below the tile root, always `/`-separated.
    pub fn relative_path(&self) -> String {
        format!(
            "{}/{}/{}_{}.{}",
            self.combination(),
            self.coord.z,
            self.coord.x,
            self.coord.y,
            self.ext
        )
    }

    pub fn absolute(&self, root: &Path) -> PathBuf {
        let mut path = root.join(&self.region_id);
        path.push(self.variant.folder());
        if let Some(sub) = &self.subregion_id {
            path.push(sub);
        }
        path.push(self.coord.z.to_string());
        path.push(format!("{}_{}.{}", self.coord.x, self.coord.y, self.ext));
        path
    }

    /// `[<prefix>/]<relative path>`.
    pub fn object_key(&self, prefix: &str) -> String {
        join_key(prefix, &self.relative_path())
    }

    /// Reconstructs a tile from an absolute path below `root`.
    pub fn parse(root: &Path, path: &Path) -> Option<Self> {
        let relative = path.strip_prefix(root).ok()?;
        let segments = relative
            .components()
            .map(|c| match c {
                Component::Normal(s) => s.to_str(),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()?;

        Self::from_segments(&segments)
    }

    /// Reconstructs a tile from a `/`-separated relative path.
    pub fn parse_relative(relative: &str) -> Option<Self> {
        let segments: Vec<&str> = relative.trim_start_matches('/').split('/').collect();
        Self::from_segments(&segments)
    }

    fn from_segments(segments: &[&str]) -> Option<Self> {
        let (region, folder, subregion, zoom, file) = match *segments {
            [region, folder, zoom, file] => (region, folder, None, zoom, file),
            [region, folder, sub, zoom, file] if folder == Variant::AnnualPlan2025.folder() => {
                (region, folder, Some(sub), zoom, file)
            }
            _ => return None,
        };

        let variant = Variant::from_folder(folder)?;
        if region.is_empty() || subregion.is_some_and(str::is_empty) {
            return None;
        }

        let z: u8 = zoom.parse().ok()?;
        let (stem, ext) = file.rsplit_once('.')?;
        let (x, y) = stem.split_once('_')?;
        let coord = TileCoord::new(z, x.parse().ok()?, y.parse().ok()?)?;
        if ext.is_empty() {
            return None;
        }

        Some(Self {
            region_id: region.to_owned(),
            variant,
            subregion_id: subregion.map(str::to_owned),
            coord,
            ext: ext.to_owned(),
        })
    }
}

/// Joins a configured key prefix and a relative key with a single `/`.
pub fn join_key(prefix: &str, relative: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        relative.to_owned()
    } else {
        format!("{}/{}", prefix, relative)
    }
}

/// Directory holding the sibling state files of `root`.
pub fn state_dir(root: &Path) -> PathBuf {
    match root.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_owned(),
        _ => PathBuf::from("."),
    }
}

/// Temporary file a download is streamed into before the atomic rename.
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_owned();
    name.push(PARTIAL_SUFFIX);
    dest.with_file_name(name)
}

/// A recognised tile file found while walking the tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScannedTile {
    pub tile: LocalTile,
    pub path: PathBuf,
    pub size: u64,
}

/// Result of walking the tile tree.
#[derive(Debug, Default)]
pub struct Scan {
    pub tiles: Vec<ScannedTile>,
    /// Files below the root that do not follow the layout.
    pub unrecognized: Vec<PathBuf>,
}

fn is_hidden(name: &OsStr) -> bool {
    name.to_str().map_or(false, |s| s.starts_with('.'))
}

/// Walks the tile tree. A missing root yields an empty scan.
///
/// Blocking; call from `spawn_blocking` in async code.
pub fn scan_tiles(root: &Path) -> Result<Scan, StoreError> {
    let mut scan = Scan::default();
    if !root.exists() {
        return Ok(scan);
    }

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let name = entry.file_name();
        if is_hidden(name) || name.to_str().map_or(false, |s| s.ends_with(PARTIAL_SUFFIX)) {
            continue;
        }

        match LocalTile::parse(root, path) {
            Some(tile) => {
                let size = entry.metadata().map_err(StoreError::from)?.len();
                scan.tiles.push(ScannedTile {
                    tile,
                    path: path.to_owned(),
                    size,
                });
            }
            None => {
                debug!(path = %path.display(), "skipping file outside the tile layout");
                scan.unrecognized.push(path.to_owned());
            }
        }
    }

    Ok(scan)
}

/// Deletes temporary files an interrupted run left behind.
///
/// Blocking; call from `spawn_blocking` in async code.
pub fn sweep_partials(root: &Path) -> Result<usize, StoreError> {
    if !root.exists() {
        return Ok(0);
    }

    let mut removed = 0;
    for entry in WalkDir::new(root) {
        let entry = entry?;
        let is_partial = entry
            .file_name()
            .to_str()
            .map_or(false, |s| s.ends_with(PARTIAL_SUFFIX));
        if entry.file_type().is_file() && is_partial {
            std::fs::remove_file(entry.path()).map_err(|e| StoreError::io(entry.path(), e))?;
            removed += 1;
        }
    }

    if removed > 0 {
        warn!(removed, "removed partial downloads from a previous run");
    }

    Ok(removed)
}

/// File and byte counts of one `(region, folder[, subregion], zoom)` bucket.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct InventoryEntry {
    pub files: u64,
    pub bytes: u64,
}

/// Summary of what is on disk.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Inventory {
    /// Keyed by `<region>/<folder>[/<subregion>]/<z>`.
    pub entries: BTreeMap<String, InventoryEntry>,
    pub total_files: u64,
    pub total_bytes: u64,
    pub unrecognized: u64,
}

impl Inventory {
    pub fn from_scan(scan: &Scan) -> Self {
        let mut inventory = Self {
            unrecognized: scan.unrecognized.len() as u64,
            ..Self::default()
        };

        for scanned in &scan.tiles {
            let key = format!("{}/{}", scanned.tile.combination(), scanned.tile.coord.z);
            let entry = inventory.entries.entry(key).or_default();
            entry.files += 1;
            entry.bytes += scanned.size;
            inventory.total_files += 1;
            inventory.total_bytes += scanned.size;
        }

        inventory
    }
}

/// Walks the tree and summarises it.
pub fn inventory(root: &Path) -> Result<Inventory, StoreError> {
    scan_tiles(root).map(|scan| Inventory::from_scan(&scan))
}
