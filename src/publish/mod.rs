//! Reflects the local tile tree into an S3-compatible bucket.
//!
//! Publication walks the tree, resolves for every file whether its object
//! already exists (resume file, prefix listing, `HEAD` probe) and uploads the
//! rest with a bounded pool, smallest files first. Results are consumed by a
//! single loop that owns the report and the resume file.

mod metadata;
mod object_store;
mod report;
mod resume;
mod s3;
mod sigv4;

pub use metadata::{content_type_for, tile_detail, tile_headers, tile_metadata, Md5Digest};
pub use object_store::{
    CompletedPart, Listing, ObjectHeaders, ObjectStore, PutObject, MAX_LIST_KEYS,
};
pub use report::{UploadFailure, UploadReport, UPLOAD_REPORT_FILE_NAME};
pub use resume::{PartialStats, ResumeState};
pub use s3::S3Store;
pub use sigv4::Signer;

use bytes::Bytes;
use chrono::Utc;
use futures::{prelude::*, stream};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    future::Future,
    path::{Path, PathBuf},
};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::config::PublishOptions;
use crate::context::RunContext;
use crate::error::{ConfigError, FailureReason, RunError, StoreError};
use crate::progress::{notify, ProgressEvent, ProgressHook};
use crate::retry::RetryPolicy;
use crate::store::{join_key, scan_tiles, LocalTile, ScannedTile};
use crate::variant::Variant;

/// How the publisher finds out whether an object already exists.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExistenceMode {
    /// One listing per combination; unknown keys fall back to `HEAD`.
    #[default]
    BatchPrefix,
    /// `HEAD` every candidate.
    PerObject,
}

/// Structural filters; `None` means everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublishFilters {
    pub regions: Option<BTreeSet<String>>,
    pub variants: Option<BTreeSet<Variant>>,
    pub zooms: Option<BTreeSet<u8>>,
}

impl PublishFilters {
    pub fn matches(&self, tile: &LocalTile) -> bool {
        self.regions
            .as_ref()
            .map_or(true, |r| r.contains(&tile.region_id))
            && self
                .variants
                .as_ref()
                .map_or(true, |v| v.contains(&tile.variant))
            && self
                .zooms
                .as_ref()
                .map_or(true, |z| z.contains(&tile.coord.z))
    }
}

/// What happened to one object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum UploadResult {
    Uploaded { bytes: u64 },
    SkippedExisting,
    /// Dry run only.
    WouldUpload { bytes: u64 },
    Failed { reason: FailureReason, attempts: u32 },
}

#[derive(Clone, Debug)]
pub struct UploadOutcome {
    pub key: String,
    pub tile: LocalTile,
    pub result: UploadResult,
}

/// A file that still needs work after the listing pass.
#[derive(Debug)]
struct Candidate {
    tile: LocalTile,
    path: PathBuf,
    size: u64,
    key: String,
    /// Existence unknown; `HEAD` before uploading.
    probe: bool,
}

/// Publishes tile trees through an [`ObjectStore`].
pub struct Publisher<O> {
    ctx: RunContext<O>,
    hook: Option<ProgressHook>,
}

impl<O: ObjectStore> Publisher<O> {
    pub fn new(ctx: RunContext<O>) -> Self {
        Self { ctx, hook: None }
    }

    pub fn with_hook(mut self, hook: ProgressHook) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn context(&self) -> &RunContext<O> {
        &self.ctx
    }

    /// Fails with a configuration error unless the bucket answers.
    pub async fn check_bucket(&self, retry: &RetryPolicy) -> Result<(), ConfigError> {
        let (result, _) = self.call(retry, || self.ctx.client.head_bucket()).await;
        result.map_err(|reason| ConfigError::UnreachableBucket {
            bucket: self.ctx.client.bucket().to_owned(),
            reason,
        })
    }

    /// Uploads every tile below `root` that passes `filters` and is not in
    /// the bucket yet, under `[<prefix>/]<relative path>`.
    pub async fn publish(
        &self,
        root: &Path,
        prefix: &str,
        filters: &PublishFilters,
        options: &PublishOptions,
    ) -> Result<UploadReport, RunError> {
        let bucket = self.ctx.client.bucket().to_owned();
        let prefix = prefix.trim_matches('/');
        let mut report = UploadReport::start(&bucket, prefix, options.dry_run);

        self.check_bucket(&options.retry).await?;

        let scan_root = root.to_owned();
        let scan = tokio::task::spawn_blocking(move || scan_tiles(&scan_root))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))??;
        if !scan.unrecognized.is_empty() {
            warn!(
                count = scan.unrecognized.len(),
                "files outside the tile layout are not published"
            );
        }

        let tiles: Vec<ScannedTile> = scan
            .tiles
            .into_iter()
            .filter(|scanned| filters.matches(&scanned.tile))
            .collect();

        if let Err(reason) = notify(
            self.hook.as_ref(),
            &ProgressEvent::Started {
                total: tiles.len() as u64,
            },
        ) {
            warn!(%reason, "ignoring failed progress hook");
        }

        let resume_path = ResumeState::file_for(root);
        let mut resume = ResumeState::load(&resume_path, &bucket, prefix).await?;

        let (skipped, mut candidates) = self.resolve(tiles, prefix, &resume, options).await;
        candidates.sort_by_key(|c| c.size);

        info!(
            bucket = %bucket,
            prefix,
            skipped = skipped.len(),
            candidates = candidates.len(),
            dry_run = options.dry_run,
            "starting publish"
        );

        let mut since_flush = 0usize;
        for outcome in skipped {
            self.record(outcome, &mut report, &mut resume);
        }

        let uploads = stream::iter(candidates)
            .map(|candidate| self.upload_one(candidate, options))
            .buffer_unordered(options.effective_parallelism());
        futures::pin_mut!(uploads);

        while let Some(outcome) = uploads.next().await {
            self.record(outcome, &mut report, &mut resume);

            since_flush += 1;
            if !options.dry_run && since_flush >= options.resume_flush_every.max(1) {
                since_flush = 0;
                if let Err(e) = resume.save(&resume_path).await {
                    warn!(error = %e, "failed saving upload state");
                }
            }
        }

        if !options.dry_run {
            resume.save(&resume_path).await?;
        }

        report.finish(self.ctx.cancel.is_cancelled());
        info!(
            uploaded = report.uploaded,
            skipped = report.skipped_existing,
            would_upload = report.would_upload.len(),
            failed = report.failed,
            "publish finished"
        );

        Ok(report)
    }

    /// Splits the tiles into objects known to exist and candidates, using
    /// the resume state and, in batch mode, one listing per combination.
    async fn resolve(
        &self,
        tiles: Vec<ScannedTile>,
        prefix: &str,
        resume: &ResumeState,
        options: &PublishOptions,
    ) -> (Vec<UploadOutcome>, Vec<Candidate>) {
        let mut by_combination: BTreeMap<String, Vec<ScannedTile>> = BTreeMap::new();
        for scanned in tiles {
            by_combination
                .entry(scanned.tile.combination())
                .or_default()
                .push(scanned);
        }

        let mut skipped = Vec::new();
        let mut candidates = Vec::new();

        for (combination, files) in by_combination {
            let mut rest = Vec::new();

            for scanned in files {
                let key = scanned.tile.object_key(prefix);
                if resume.contains(&key) {
                    skipped.push(UploadOutcome {
                        key,
                        tile: scanned.tile,
                        result: UploadResult::SkippedExisting,
                    });
                } else {
                    rest.push((key, scanned));
                }
            }
            if rest.is_empty() {
                continue;
            }

            let wants_listing = options.existence == ExistenceMode::BatchPrefix
                || options.skip_existing_combinations;
            let listing = if wants_listing {
                let list_prefix = format!("{}/", join_key(prefix, &combination));
                let (listing, _) = self
                    .call(&options.retry, || {
                        self.ctx.client.list_prefix(&list_prefix, MAX_LIST_KEYS)
                    })
                    .await;

                match listing {
                    Ok(listing) => Some(listing),
                    Err(reason) => {
                        warn!(
                            combination = %combination,
                            %reason,
                            "listing failed, checking objects one by one"
                        );
                        None
                    }
                }
            } else {
                None
            };

            let existing: HashSet<&str> = listing
                .as_ref()
                .map(|l| l.keys.iter().map(String::as_str).collect())
                .unwrap_or_default();

            // Only keys of this combination's own files count; other zooms,
            // extensions or stale objects under the prefix do not.
            let confirmed = rest
                .iter()
                .filter(|(key, _)| existing.contains(key.as_str()))
                .count();
            if options.skip_existing_combinations && confirmed == rest.len() {
                info!(combination = %combination, "combination already published, skipping");
            }

            // Per-object mode probes every key the listing did not confirm.
            let complete = options.existence == ExistenceMode::BatchPrefix
                && listing.as_ref().map_or(false, |l| !l.truncated);

            for (key, scanned) in rest {
                if existing.contains(key.as_str()) {
                    skipped.push(UploadOutcome {
                        key,
                        tile: scanned.tile,
                        result: UploadResult::SkippedExisting,
                    });
                } else {
                    candidates.push(Candidate {
                        tile: scanned.tile,
                        path: scanned.path,
                        size: scanned.size,
                        key,
                        probe: !complete,
                    });
                }
            }
        }

        (skipped, candidates)
    }

    async fn upload_one(&self, candidate: Candidate, options: &PublishOptions) -> UploadOutcome {
        let outcome = |result| UploadOutcome {
            key: candidate.key.clone(),
            tile: candidate.tile.clone(),
            result,
        };
        let failed = |reason, attempts| outcome(UploadResult::Failed { reason, attempts });

        if self.ctx.cancel.is_cancelled() {
            return failed(FailureReason::Cancelled, 0);
        }

        let key = candidate.key.as_str();
        if candidate.probe {
            let (exists, attempts) = self
                .call(&options.retry, || self.ctx.client.head_object(key))
                .await;
            match exists {
                Ok(true) => return outcome(UploadResult::SkippedExisting),
                Ok(false) => {}
                Err(reason) => return failed(reason, attempts),
            }
        }

        if options.dry_run {
            return outcome(UploadResult::WouldUpload {
                bytes: candidate.size,
            });
        }

        let body = match fs::read(&candidate.path).await {
            Ok(body) => Bytes::from(body),
            Err(e) => return failed(FailureReason::disk(e), 0),
        };
        let size = body.len() as u64;
        let digest = Md5Digest::of(&body);
        let metadata = tile_metadata(
            &candidate.tile,
            &digest.hex,
            size,
            Utc::now(),
            &options.uploader_version,
        );
        let headers = tile_headers(metadata, &candidate.tile.ext);

        let (result, attempts) = if size > options.multipart_threshold {
            self.upload_multipart(key, &headers, body, options).await
        } else {
            self.call(&options.retry, || {
                self.ctx.client.put_object(PutObject {
                    key: key.to_owned(),
                    headers: headers.clone(),
                    content_md5: digest.base64.clone(),
                    body: body.clone(),
                })
            })
            .await
        };

        match result {
            Ok(()) => {
                debug!(key, bytes = size, attempts, "uploaded");
                outcome(UploadResult::Uploaded { bytes: size })
            }
            Err(reason) => {
                warn!(key, attempts, %reason, "upload failed");
                failed(reason, attempts)
            }
        }
    }

    async fn upload_multipart(
        &self,
        key: &str,
        headers: &ObjectHeaders,
        body: Bytes,
        options: &PublishOptions,
    ) -> (Result<(), FailureReason>, u32) {
        let client = &self.ctx.client;
        let (upload_id, attempts) = self
            .call(&options.retry, || client.create_multipart(key, headers))
            .await;
        let upload_id = match upload_id {
            Ok(id) => id,
            Err(reason) => return (Err(reason), attempts),
        };

        let part_size = usize::try_from(options.part_size.max(1)).unwrap_or(usize::MAX);
        let mut parts = Vec::new();
        let mut offset = 0;
        let mut part_number = 1u32;

        while offset < body.len() {
            let end = offset.saturating_add(part_size).min(body.len());
            let part = body.slice(offset..end);

            let (etag, attempts) = self
                .call(&options.retry, || {
                    client.upload_part(key, &upload_id, part_number, part.clone())
                })
                .await;
            match etag {
                Ok(etag) => parts.push(CompletedPart { part_number, etag }),
                Err(reason) => {
                    self.abort_multipart(key, &upload_id).await;
                    return (Err(reason), attempts);
                }
            }

            offset = end;
            part_number += 1;
        }

        let (done, attempts) = self
            .call(&options.retry, || {
                client.complete_multipart(key, &upload_id, &parts)
            })
            .await;
        if let Err(reason) = done {
            self.abort_multipart(key, &upload_id).await;
            return (Err(reason), attempts);
        }

        debug!(key, parts = parts.len(), "completed multipart upload");
        (Ok(()), attempts)
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) {
        self.ctx.limiter.acquire().await;
        self.ctx.stats.record_request();
        if let Err(reason) = self.ctx.client.abort_multipart(key, upload_id).await {
            warn!(key, upload_id, %reason, "failed aborting multipart upload");
        }
    }

    /// One provider call under the retry policy, each attempt paced by the
    /// rate limiter.
    async fn call<T, F, Fut>(&self, retry: &RetryPolicy, mut op: F) -> (Result<T, FailureReason>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FailureReason>>,
    {
        let limiter = &self.ctx.limiter;
        let stats = &self.ctx.stats;

        let (result, attempts) = retry
            .run(&self.ctx.cancel, |_| {
                let request = op();
                async move {
                    limiter.acquire().await;
                    stats.record_request();
                    request.await
                }
            })
            .await;

        stats.record_retries(attempts);
        (result, attempts)
    }

    /// Single-writer bookkeeping of one result.
    fn record(
        &self,
        mut outcome: UploadOutcome,
        report: &mut UploadReport,
        resume: &mut ResumeState,
    ) {
        let hook_result = notify(self.hook.as_ref(), &ProgressEvent::Published(&outcome));

        match &outcome.result {
            UploadResult::Uploaded { bytes } => {
                self.ctx.stats.record_uploaded(*bytes);
                resume.mark_present(&outcome.key);
                resume.partial_stats.uploaded += 1;
                resume.partial_stats.bytes_uploaded += bytes;
            }
            UploadResult::SkippedExisting => {
                self.ctx.stats.record_skipped();
                resume.mark_present(&outcome.key);
                resume.partial_stats.skipped_existing += 1;
            }
            UploadResult::WouldUpload { .. } => {}
            UploadResult::Failed { .. } => {
                self.ctx.stats.record_upload_failed();
                resume.partial_stats.failed += 1;
            }
        }

        if let Err(reason) = hook_result {
            outcome.result = UploadResult::Failed {
                reason,
                attempts: 0,
            };
        }

        report.record(&outcome);
    }
}
