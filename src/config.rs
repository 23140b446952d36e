use serde::Deserialize;
use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};
use url::Url;

use crate::cache::DEFAULT_CACHE_MAX_AGE;
use crate::error::ConfigError;
use crate::image::DEFAULT_MIN_TILE_BYTES;
use crate::publish::{ExistenceMode, PublishFilters};
use crate::retry::RetryPolicy;
use crate::source::BROWSER_USER_AGENT;
use crate::store::DEFAULT_TILE_ROOT;

/// Settings of the shared tile-server client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpConfig {
    pub connect_timeout: Duration,
    /// Overall timeout of one request, body included.
    pub request_timeout: Duration,
    /// Target size of the whole pool. `reqwest` has no global cap, so this is
    /// enforced through the number of workers.
    pub pool_max_total: usize,
    pub pool_max_idle_per_host: usize,
    pub keepalive: Duration,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(15),
            pool_max_total: 50,
            pool_max_idle_per_host: 20,
            keepalive: Duration::from_secs(60),
            user_agent: BROWSER_USER_AGENT.to_owned(),
        }
    }
}

/// Tile fetching configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct FetchConfig {
    /// Root of the tile tree; state files live next to it.
    pub tile_root: PathBuf,

    /// Zoom levels to plan.
    pub zooms: Vec<u8>,

    /// Maximum number of tiles fetched in parallel.
    pub workers: usize,

    /// Outbound requests per second; `0` disables the limiter.
    pub rate_per_second: u32,

    pub http: HttpConfig,

    pub retry: RetryPolicy,

    /// Bodies of this many bytes or fewer are rejected.
    pub min_tile_bytes: u64,

    /// Flush the existence cache after this many downloads.
    pub cache_flush_every: usize,

    /// Persisted cache older than this is rebuilt from the tree.
    pub cache_max_age: Duration,

    /// Re-download tiles that are on disk but missing from the cache.
    pub fetch_existing: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            tile_root: PathBuf::from(DEFAULT_TILE_ROOT),
            zooms: Vec::new(),
            workers: 50,
            rate_per_second: 250,
            http: HttpConfig::default(),
            retry: RetryPolicy::default(),
            min_tile_bytes: DEFAULT_MIN_TILE_BYTES,
            cache_flush_every: 100,
            cache_max_age: DEFAULT_CACHE_MAX_AGE,
            fetch_existing: false,
        }
    }
}

/// Upper bound on upload parallelism; storage providers throttle beyond it.
pub const MAX_PUBLISH_PARALLELISM: usize = 15;

/// Knobs of one publish run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishOptions {
    /// Concurrent uploads, at most [`MAX_PUBLISH_PARALLELISM`].
    pub parallelism: usize,
    pub dry_run: bool,
    /// List every combination, even in per-object mode, and skip without
    /// probing the ones whose local keys all appear in the listing.
    pub skip_existing_combinations: bool,
    pub existence: ExistenceMode,
    /// Files above this size go through multipart upload.
    pub multipart_threshold: u64,
    pub part_size: u64,
    /// Rewrite the resume file after this many results.
    pub resume_flush_every: usize,
    pub retry: RetryPolicy,
    /// Written into every object's `uploader-version` metadata.
    pub uploader_version: String,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            parallelism: 10,
            dry_run: false,
            skip_existing_combinations: false,
            existence: ExistenceMode::BatchPrefix,
            multipart_threshold: 25 * 1024 * 1024,
            part_size: 8 * 1024 * 1024,
            resume_flush_every: 50,
            retry: RetryPolicy::default(),
            uploader_version: format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        }
    }
}

impl PublishOptions {
    pub fn effective_parallelism(&self) -> usize {
        self.parallelism.clamp(1, MAX_PUBLISH_PARALLELISM)
    }
}

/// Tile publication configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishConfig {
    pub tile_root: PathBuf,
    /// Key prefix; may be empty.
    pub prefix: String,
    pub filters: PublishFilters,
    pub options: PublishOptions,
    /// Provider API calls per second, listings included; `0` disables it.
    pub rate_per_second: u32,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            tile_root: PathBuf::from(DEFAULT_TILE_ROOT),
            prefix: String::new(),
            filters: PublishFilters::default(),
            options: PublishOptions::default(),
            rate_per_second: 200,
        }
    }
}

pub const ENV_ACCESS_KEY: &str = "STORAGE_ACCESS_KEY";
pub const ENV_SECRET_KEY: &str = "STORAGE_SECRET_KEY";
pub const ENV_ENDPOINT: &str = "STORAGE_ENDPOINT";
pub const ENV_BUCKET: &str = "STORAGE_BUCKET";
pub const ENV_REGION: &str = "STORAGE_REGION";

/// Region used when none is configured.
pub const DEFAULT_STORAGE_REGION: &str = "us-east-1";

/// Name of the storage config file looked up next to the tile root.
pub const STORAGE_CONFIG_FILE_NAME: &str = "storage.json";

/// Connection settings of an S3-compatible bucket.
#[derive(Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub endpoint: Url,
    pub bucket: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("endpoint", &self.endpoint.as_str())
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("access_key", &"<redacted>")
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

impl StorageConfig {
    /// Reads the `STORAGE_*` environment, falling back per key to `file`.
    pub fn from_env(file: Option<&Path>) -> Result<Self, ConfigError> {
        Self::from_sources(|key| std::env::var(key).ok(), file)
    }

    /// Resolves every setting from `env` first, then from the JSON `file`
    /// (same key names, the file being optional).
    pub fn from_sources(
        env: impl Fn(&str) -> Option<String>,
        file: Option<&Path>,
    ) -> Result<Self, ConfigError> {
        let from_file = match file {
            Some(path) if path.exists() => read_storage_file(path)?,
            _ => HashMap::new(),
        };

        let lookup = |key: &'static str| -> Option<String> {
            env(key)
                .or_else(|| from_file.get(key).cloned())
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
        };
        let require =
            |key: &'static str| lookup(key).ok_or(ConfigError::MissingStorageSetting(key));

        let access_key = require(ENV_ACCESS_KEY)?;
        let secret_key = require(ENV_SECRET_KEY)?;
        let raw_endpoint = require(ENV_ENDPOINT)?;
        let bucket = require(ENV_BUCKET)?;
        let region = lookup(ENV_REGION).unwrap_or_else(|| DEFAULT_STORAGE_REGION.to_owned());

        Ok(Self {
            endpoint: parse_endpoint(&raw_endpoint)?,
            bucket,
            region,
            access_key,
            secret_key,
        })
    }
}

fn read_storage_file(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    #[derive(Deserialize)]
    #[serde(transparent)]
    struct StorageFile(HashMap<String, serde_json::Value>);

    let to_error = |reason: String| ConfigError::StorageConfigFile {
        path: path.to_owned(),
        reason,
    };

    let raw = std::fs::read_to_string(path).map_err(|e| to_error(e.to_string()))?;
    let StorageFile(values) = serde_json::from_str(&raw).map_err(|e| to_error(e.to_string()))?;

    Ok(values
        .into_iter()
        .filter_map(|(key, value)| match value {
            serde_json::Value::String(s) => Some((key, s)),
            serde_json::Value::Null => None,
            other => Some((key, other.to_string())),
        })
        .collect())
}

/// Accepts a bare host as `https://<host>`.
fn parse_endpoint(raw: &str) -> Result<Url, ConfigError> {
    let with_scheme = if raw.contains("://") {
        raw.to_owned()
    } else {
        format!("https://{}", raw)
    };

    let invalid = |reason: String| ConfigError::InvalidEndpoint {
        endpoint: raw.to_owned(),
        reason,
    };

    let url = Url::parse(&with_scheme).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(invalid(format!("unsupported scheme `{}`", other))),
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host".to_owned()));
    }

    Ok(url)
}
