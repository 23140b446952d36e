//! Concurrent tile acquisition.
//!
//! Descriptors are fetched by a bounded pool of in-flight futures, each one
//! doing a whole tile (request, streaming write, validation, rename) before
//! picking the next. Results then pass through a single coordinating stage
//! that owns every write to the existence cache.

use bytes::Bytes;
use futures::{
    prelude::*,
    stream::{self, BoxStream},
};
use serde::{Deserialize, Serialize};
use std::{
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::{
    fs,
    io::{AsyncWriteExt, BufWriter},
};
use tracing::{debug, info, warn};

use crate::cache::ExistenceCache;
use crate::config::FetchConfig;
use crate::context::RunContext;
use crate::descriptor::{dedupe, TileDescriptor};
use crate::error::{FailureReason, RunError, StoreError};
use crate::image::{is_acceptable_content_type, sniff, validate, SNIFF_LEN};
use crate::progress::{notify, ProgressEvent, ProgressHook};
use crate::report::FetchReport;
use crate::source::TileSource;
use crate::store::{partial_path, sweep_partials};

const WRITE_BUFFER_BYTES: usize = 64 * 1024;

/// What happened to one tile.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum FetchResult {
    Downloaded { size: u64 },
    Cached { size: u64 },
    Failed { reason: FailureReason },
}

impl FetchResult {
    pub fn is_success(&self) -> bool {
        !matches!(self, FetchResult::Failed { .. })
    }
}

/// A descriptor together with its result.
#[derive(Clone, Debug)]
pub struct FetchOutcome {
    pub descriptor: TileDescriptor,
    pub result: FetchResult,
    /// Requests issued for this tile; `0` for cache hits.
    pub attempts: u32,
}

/// Materializes tile descriptors as validated files below the tile root.
pub struct Fetcher<S> {
    ctx: RunContext<S>,
    config: FetchConfig,
    cache: Arc<ExistenceCache>,
    hook: Option<ProgressHook>,
    downloads_since_flush: AtomicUsize,
}

impl<S: TileSource> Fetcher<S> {
    /// Prepares the tile root: creates it, removes partial downloads of an
    /// interrupted run and opens the existence cache (unless `ctx` carries
    /// one already).
    pub async fn new(mut ctx: RunContext<S>, config: FetchConfig) -> Result<Self, StoreError> {
        let root = config.tile_root.clone();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| StoreError::io(&root, e))?;

        let sweep_root = root.clone();
        tokio::task::spawn_blocking(move || sweep_partials(&sweep_root))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))??;

        let cache = match ctx.cache.clone() {
            Some(cache) => cache,
            None => {
                let cache = Arc::new(ExistenceCache::open(&root, config.cache_max_age).await?);
                ctx.cache = Some(Arc::clone(&cache));
                cache
            }
        };

        Ok(Self {
            ctx,
            config,
            cache,
            hook: None,
            downloads_since_flush: AtomicUsize::new(0),
        })
    }

    pub fn with_hook(mut self, hook: ProgressHook) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn cache(&self) -> &ExistenceCache {
        &self.cache
    }

    pub fn context(&self) -> &RunContext<S> {
        &self.ctx
    }

    pub fn tile_root(&self) -> &Path {
        &self.config.tile_root
    }

    /// Fetches every descriptor, yielding one outcome per unique descriptor
    /// in completion order.
    ///
    /// Descriptors sharing a local path are merged before anything is
    /// requested. Once the run is cancelled, tiles not yet started come back
    /// as `Failed { Cancelled }`.
    pub fn fetch_all(
        &self,
        descriptors: Vec<TileDescriptor>,
    ) -> impl Stream<Item = FetchOutcome> + '_ {
        let descriptors = dedupe(descriptors);
        let workers = self.config.workers.max(1);

        stream::iter(descriptors)
            .map(move |descriptor| self.fetch_one(descriptor))
            .buffer_unordered(workers)
            // `then` polls one record at a time, so downloads in flight wait
            // while a periodic cache flush is written.
            .then(move |outcome| self.record(outcome))
    }

    /// Drives [`Fetcher::fetch_all`] to completion, flushes the cache and
    /// returns the report.
    pub async fn run(&self, descriptors: Vec<TileDescriptor>) -> Result<FetchReport, RunError> {
        let mut report = FetchReport::start();
        let started = ProgressEvent::Started {
            total: descriptors.len() as u64,
        };
        if let Err(reason) = notify(self.hook.as_ref(), &started) {
            warn!(%reason, "ignoring failed progress hook");
        }

        info!(
            tiles = descriptors.len(),
            workers = self.config.workers,
            root = %self.config.tile_root.display(),
            "starting fetch"
        );

        let outcomes = self.fetch_all(descriptors);
        futures::pin_mut!(outcomes);
        while let Some(outcome) = outcomes.next().await {
            report.record(&outcome);
        }

        self.shutdown().await?;
        report.finish(self.ctx.cancel.is_cancelled());

        info!(
            downloaded = report.downloaded,
            cached = report.cached,
            failed = report.failed,
            "fetch finished"
        );

        Ok(report)
    }

    /// Persists the existence cache.
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        self.downloads_since_flush.store(0, Ordering::Relaxed);
        self.cache.flush().await
    }

    async fn fetch_one(&self, descriptor: TileDescriptor) -> FetchOutcome {
        let outcome = |result, attempts| FetchOutcome {
            descriptor: descriptor.clone(),
            result,
            attempts,
        };

        if self.ctx.cancel.is_cancelled() {
            return outcome(
                FetchResult::Failed {
                    reason: FailureReason::Cancelled,
                },
                0,
            );
        }

        let relative = descriptor.relative_path();
        let dest = descriptor.local_tile().absolute(&self.config.tile_root);

        if self.cache.contains(&relative).await {
            match fs::metadata(&dest).await {
                Ok(meta) if meta.is_file() => {
                    return outcome(FetchResult::Cached { size: meta.len() }, 0);
                }
                _ => debug!(path = %relative, "cached tile is gone from disk, fetching again"),
            }
        } else if !self.config.fetch_existing {
            if let Some(size) = existing_valid_tile(&dest, self.config.min_tile_bytes).await {
                return outcome(FetchResult::Cached { size }, 0);
            }
        }

        let url = match descriptor.url() {
            Ok(url) => url,
            Err(reason) => return outcome(FetchResult::Failed { reason }, 0),
        };

        let (result, attempts) = self
            .config
            .retry
            .run(&self.ctx.cancel, |attempt| {
                debug!(
                    region = %descriptor.region_id,
                    variant = %descriptor.variant,
                    z = descriptor.coord.z,
                    x = descriptor.coord.x,
                    y = descriptor.coord.y,
                    attempt,
                    "fetching tile"
                );
                self.attempt(&url, &dest)
            })
            .await;

        self.ctx.stats.record_retries(attempts);
        let result = match result {
            Ok(size) => FetchResult::Downloaded { size },
            Err(reason) => {
                warn!(url = %url, path = %relative, attempts, %reason, "tile failed");
                FetchResult::Failed { reason }
            }
        };

        outcome(result, attempts)
    }

    /// One request: download into a temporary file, validate, rename.
    async fn attempt(&self, url: &str, dest: &Path) -> Result<u64, FailureReason> {
        self.ctx.limiter.acquire().await;
        self.ctx.stats.record_request();

        let response = self.ctx.client.get(url).await?;
        if response.status != 200 {
            let retry_after_ms = response
                .retry_after
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
            return Err(FailureReason::from_status(response.status, retry_after_ms));
        }
        if !is_acceptable_content_type(response.content_type.as_deref()) {
            return Err(FailureReason::invalid_image(format!(
                "unexpected content type {}",
                response.content_type.unwrap_or_default()
            )));
        }

        write_tile(response.body, dest, self.config.min_tile_bytes).await
    }

    /// Single-writer stage: cache insertion, periodic flushes, stats and the
    /// progress hook.
    async fn record(&self, mut outcome: FetchOutcome) -> FetchOutcome {
        if let Err(reason) = notify(self.hook.as_ref(), &ProgressEvent::Fetched(&outcome)) {
            // The tile itself may be fine; the cache below still reflects disk.
            if let FetchResult::Downloaded { .. } | FetchResult::Cached { .. } = outcome.result {
                self.cache.insert(outcome.descriptor.relative_path()).await;
            }
            outcome.result = FetchResult::Failed { reason };
        }

        match outcome.result {
            FetchResult::Downloaded { size } => {
                self.ctx.stats.record_downloaded(size);
                self.cache.insert(outcome.descriptor.relative_path()).await;

                let since = self.downloads_since_flush.fetch_add(1, Ordering::Relaxed) + 1;
                if since >= self.config.cache_flush_every.max(1) {
                    self.downloads_since_flush.store(0, Ordering::Relaxed);
                    if let Err(e) = self.cache.flush().await {
                        warn!(error = %e, "failed flushing existence cache");
                    }
                }
            }
            FetchResult::Cached { .. } => {
                self.ctx.stats.record_cached();
                self.cache.insert(outcome.descriptor.relative_path()).await;
            }
            FetchResult::Failed { .. } => self.ctx.stats.record_fetch_failed(),
        }

        outcome
    }
}

/// Size of a tile already on disk that passes validation.
async fn existing_valid_tile(path: &Path, min_len: u64) -> Option<u64> {
    let meta = fs::metadata(path).await.ok()?;
    if !meta.is_file() {
        return None;
    }

    let mut header = [0u8; SNIFF_LEN];
    let mut file = fs::File::open(path).await.ok()?;
    let read = tokio::io::AsyncReadExt::read(&mut file, &mut header)
        .await
        .ok()?;

    validate(meta.len(), &header[..read], min_len).ok()?;
    Some(meta.len())
}

/// Streams `body` into `<dest>.part`, validates it and renames it into place.
/// Nothing is left behind on failure.
pub(crate) async fn write_tile(
    body: BoxStream<'static, Result<Bytes, FailureReason>>,
    dest: &Path,
    min_len: u64,
) -> Result<u64, FailureReason> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(FailureReason::disk)?;
    }

    let tmp = partial_path(dest);
    let written = match stream_to_file(body, &tmp, min_len).await {
        Ok(len) => len,
        Err(reason) => {
            remove_quietly(&tmp).await;
            return Err(reason);
        }
    };

    if let Err(e) = fs::rename(&tmp, dest).await {
        remove_quietly(&tmp).await;
        return Err(FailureReason::disk(e));
    }

    Ok(written)
}

async fn stream_to_file(
    mut body: BoxStream<'static, Result<Bytes, FailureReason>>,
    tmp: &Path,
    min_len: u64,
) -> Result<u64, FailureReason> {
    let file = fs::File::create(tmp).await.map_err(FailureReason::disk)?;
    let mut writer = BufWriter::with_capacity(WRITE_BUFFER_BYTES, file);
    let mut header = Vec::with_capacity(SNIFF_LEN);
    let mut len = 0u64;

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        if header.len() < SNIFF_LEN {
            let take = (SNIFF_LEN - header.len()).min(chunk.len());
            header.extend_from_slice(&chunk[..take]);

            // Bail out early on bodies that are clearly not images.
            if header.len() == SNIFF_LEN && sniff(&header).is_none() {
                return Err(FailureReason::invalid_image("unrecognized magic bytes"));
            }
        }

        len += chunk.len() as u64;
        writer.write_all(&chunk).await.map_err(FailureReason::disk)?;
    }

    writer.flush().await.map_err(FailureReason::disk)?;
    writer
        .into_inner()
        .sync_all()
        .await
        .map_err(FailureReason::disk)?;

    validate(len, &header, min_len)?;
    Ok(len)
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed removing temporary file");
        }
    }
}
