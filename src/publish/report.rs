use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{fmt::Write as _, path::Path};

use super::{UploadOutcome, UploadResult};
use crate::error::{ExitStatus, FailureReason, StoreError};
use crate::report::{classify, write_report};

/// Default report file name of the publish phase, next to the tile root.
pub const UPLOAD_REPORT_FILE_NAME: &str = "upload_report.json";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UploadFailure {
    pub key: String,
    pub reason: FailureReason,
    pub attempts: u32,
}

/// Result of a publish run.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UploadReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub bucket: String,
    pub prefix: String,
    pub dry_run: bool,
    pub cancelled: bool,
    pub uploaded: u64,
    pub skipped_existing: u64,
    pub failed: u64,
    pub bytes_uploaded: u64,
    /// Keys a dry run would have uploaded.
    pub would_upload: Vec<String>,
    pub failures: Vec<UploadFailure>,
}

impl UploadReport {
    pub fn start(bucket: &str, prefix: &str, dry_run: bool) -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            bucket: bucket.to_owned(),
            prefix: prefix.to_owned(),
            dry_run,
            cancelled: false,
            uploaded: 0,
            skipped_existing: 0,
            failed: 0,
            bytes_uploaded: 0,
            would_upload: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn record(&mut self, outcome: &UploadOutcome) {
        match &outcome.result {
            UploadResult::Uploaded { bytes } => {
                self.uploaded += 1;
                self.bytes_uploaded += bytes;
            }
            UploadResult::SkippedExisting => self.skipped_existing += 1,
            UploadResult::WouldUpload { .. } => self.would_upload.push(outcome.key.clone()),
            UploadResult::Failed { reason, attempts } => {
                self.failed += 1;
                self.failures.push(UploadFailure {
                    key: outcome.key.clone(),
                    reason: reason.clone(),
                    attempts: *attempts,
                });
            }
        }
    }

    pub fn finish(&mut self, cancelled: bool) {
        self.finished_at = Some(Utc::now());
        self.cancelled = cancelled;
        self.would_upload.sort();
        self.failures.sort_by(|a, b| a.key.cmp(&b.key));
    }

    pub fn total(&self) -> u64 {
        self.uploaded + self.skipped_existing + self.failed + self.would_upload.len() as u64
    }

    pub fn exit_status(&self) -> ExitStatus {
        let succeeded = self.uploaded + self.skipped_existing + self.would_upload.len() as u64;
        classify(
            self.cancelled,
            self.total(),
            succeeded,
            self.failures.iter().map(|f| &f.reason),
        )
    }

    pub fn summary(&self) -> String {
        let mut text = String::new();
        let _ = writeln!(
            text,
            "publish to s3://{}/{}{}",
            self.bucket,
            self.prefix,
            if self.dry_run { " (dry run)" } else { "" }
        );
        let _ = writeln!(text, "started  {}", self.started_at.to_rfc3339());
        if let Some(finished) = self.finished_at {
            let _ = writeln!(text, "finished {}", finished.to_rfc3339());
        }
        if self.dry_run {
            let _ = writeln!(
                text,
                "would upload {}, skipped (existing) {}, failed {}",
                self.would_upload.len(),
                self.skipped_existing,
                self.failed
            );
        } else {
            let _ = writeln!(
                text,
                "uploaded {} ({}), skipped (existing) {}, failed {}{}",
                self.uploaded,
                pretty_bytes::converter::convert(self.bytes_uploaded as f64),
                self.skipped_existing,
                self.failed,
                if self.cancelled { " (cancelled)" } else { "" }
            );
        }
        for failure in &self.failures {
            let _ = writeln!(
                text,
                "  FAILED {} after {} attempt(s): {}",
                failure.key, failure.attempts, failure.reason
            );
        }
        text
    }

    pub async fn write(&self, path: &Path) -> Result<(), StoreError> {
        write_report(path, self, &self.summary()).await
    }
}
