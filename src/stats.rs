use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Run-wide counters, shared by every worker and only touched through atomic adds.
#[derive(Debug, Default)]
pub struct RunStats {
    requests: AtomicU64,
    retries: AtomicU64,
    downloaded: AtomicU64,
    cached: AtomicU64,
    fetch_failed: AtomicU64,
    bytes_downloaded: AtomicU64,
    uploaded: AtomicU64,
    skipped_existing: AtomicU64,
    upload_failed: AtomicU64,
    bytes_uploaded: AtomicU64,
}

/// Point-in-time copy of [`RunStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub retries: u64,
    pub downloaded: u64,
    pub cached: u64,
    pub fetch_failed: u64,
    pub bytes_downloaded: u64,
    pub uploaded: u64,
    pub skipped_existing: u64,
    pub upload_failed: u64,
    pub bytes_uploaded: u64,
}

impl RunStats {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retries(&self, attempts: u32) {
        let retries = u64::from(attempts.saturating_sub(1));
        self.retries.fetch_add(retries, Ordering::Relaxed);
    }

    pub fn record_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(1, Ordering::Relaxed);
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_cached(&self) {
        self.cached.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch_failed(&self) {
        self.fetch_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_uploaded(&self, bytes: u64) {
        self.uploaded.fetch_add(1, Ordering::Relaxed);
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped_existing.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upload_failed(&self) {
        self.upload_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            downloaded: self.downloaded.load(Ordering::Relaxed),
            cached: self.cached.load(Ordering::Relaxed),
            fetch_failed: self.fetch_failed.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            uploaded: self.uploaded.load(Ordering::Relaxed),
            skipped_existing: self.skipped_existing.load(Ordering::Relaxed),
            upload_failed: self.upload_failed.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
        }
    }
}
