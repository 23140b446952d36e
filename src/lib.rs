//! Harvest planning-map tiles of Vietnamese provinces and cities to your disk
//! and publish them to S3-compatible storage.
//!
//! **Use with caution.** Planning portals are not built for bulk download;
//! keep the rate limits conservative.
//!
//! # Usage
//!
//! The `tile-harvester` binary has four subcommands: `plan`, `fetch`,
//! `publish` and `inventory`. Each one documents itself via `-h` / `--help`.
//!
//! The crate is also available as a library.
//!
//! # CLI Example
//!
//! ```bash
//! tile-harvester fetch \
//!   --input regions.json \
//!   --zoom 12..14 \
//!   --tiles ./tiles/cities \
//!   --workers 50 \
//!   --rate 250
//!
//! STORAGE_BUCKET=planning tile-harvester publish --tiles ./tiles/cities --prefix tiles
//! ```
//!
//! # Library Example
//!
//! ```rust
//! use planning_tile_harvester::{build_descriptors, summarize, DescriptorFilter, TemplateRegistry};
//!
//! let registry = TemplateRegistry::from_json(r#"{
//!     "regions": [{
//!         "id": "hanoi",
//!         "centroid": { "lat": 21.0285, "lon": 105.8542 },
//!         "radius_km": 5,
//!         "variants": {
//!             "qh-2030": { "templates": ["https://tiles.example.vn/qh-2030/{z}/{x}/{y}.png"] }
//!         }
//!     }]
//! }"#)?;
//!
//! let descriptors = build_descriptors(&registry, &[12], &DescriptorFilter::default())?;
//! assert_eq!(descriptors.len(), 121);
//! assert_eq!(summarize(&descriptors).by_combination["hanoi/qh-2030"], 121);
//! # Ok::<(), planning_tile_harvester::ConfigError>(())
//! ```

mod cache;
mod config;
mod context;
mod descriptor;
mod error;
mod fetch;
mod image;
mod logging;
mod planner;
mod progress;
pub mod publish;
mod rate;
mod region;
mod registry;
mod report;
mod retry;
mod slug;
mod source;
mod stats;
mod store;
mod template;
mod tile;
mod variant;

pub use cache::{ExistenceCache, DEFAULT_CACHE_MAX_AGE};
pub use config::{
    FetchConfig, HttpConfig, PublishConfig, PublishOptions, StorageConfig,
    DEFAULT_STORAGE_REGION, ENV_ACCESS_KEY, ENV_BUCKET, ENV_ENDPOINT, ENV_REGION,
    ENV_SECRET_KEY, MAX_PUBLISH_PARALLELISM, STORAGE_CONFIG_FILE_NAME,
};
pub use context::RunContext;
pub use descriptor::{
    build_descriptors, dedupe, summarize, DescriptorFilter, PlanSummary, TileDescriptor,
    ESTIMATED_TILE_BYTES,
};
pub use error::{ConfigError, ExitStatus, FailureReason, RunError, StoreError};
pub use fetch::{FetchOutcome, FetchResult, Fetcher};
pub use image::{sniff, validate, ImageKind, DEFAULT_MIN_TILE_BYTES};
pub use logging::{default_directive, init_logging};
pub use planner::{
    meters_per_tile, normalize_zooms, plan_region, plan_zoom, radius_tiles, MAX_RADIUS_TILES,
    MIN_RADIUS_TILES,
};
pub use progress::{ProgressEvent, ProgressHook};
pub use publish::{
    ExistenceMode, Publisher, PublishFilters, S3Store, UploadOutcome, UploadReport,
    UploadResult, UPLOAD_REPORT_FILE_NAME,
};
pub use rate::RateLimiter;
pub use region::{Centroid, Region, Subregion};
pub use registry::{Misfiled, TemplateRegistry};
pub use report::{
    text_sibling, write_report, FetchFailure, FetchReport, RegionCounts, FETCH_REPORT_FILE_NAME,
};
pub use retry::RetryPolicy;
pub use slug::slugify;
pub use source::{parse_retry_after, HttpTileSource, TileResponse, TileSource};
pub use stats::{RunStats, StatsSnapshot};
pub use store::{
    inventory, join_key, scan_tiles, state_dir, sweep_partials, Inventory, InventoryEntry,
    LocalTile, Scan, ScannedTile, DEFAULT_TILE_ROOT,
};
pub use template::UrlTemplate;
pub use tile::{TileCoord, MAX_LAT, MAX_ZOOM};
pub use variant::{classify, Variant};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_index() {
        let tile = TileCoord::from_lat_lon(50.7929, 6.0402, 18).unwrap();
        assert_eq!((tile.x, tile.y), (135470, 87999));
    }

    #[test]
    fn out_of_range_zoom_is_rejected() {
        assert!(TileCoord::from_lat_lon(21.0, 105.0, MAX_ZOOM + 1).is_none());
        assert!(matches!(
            normalize_zooms(&[12, 23]),
            Err(ConfigError::InvalidZoom(23))
        ));
    }
}
