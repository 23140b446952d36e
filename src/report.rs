//! Machine-readable run reports, one JSON document per phase plus a
//! human-readable `.txt` sibling.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    collections::BTreeMap,
    fmt::Write as _,
    path::{Path, PathBuf},
};
use tokio::fs;

use crate::error::{ExitStatus, FailureReason, StoreError};
use crate::fetch::{FetchOutcome, FetchResult};

/// Default report file name of the fetch phase, next to the tile root.
pub const FETCH_REPORT_FILE_NAME: &str = "fetch_report.json";

/// Per-region tally.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RegionCounts {
    pub downloaded: u64,
    pub cached: u64,
    pub failed: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FetchFailure {
    pub path: String,
    pub url: Option<String>,
    pub reason: FailureReason,
    pub attempts: u32,
}

/// Result of a fetch run.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FetchReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancelled: bool,
    pub downloaded: u64,
    pub cached: u64,
    pub failed: u64,
    pub bytes_downloaded: u64,
    pub failures: Vec<FetchFailure>,
    pub by_region: BTreeMap<String, RegionCounts>,
}

impl FetchReport {
    pub fn start() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            cancelled: false,
            downloaded: 0,
            cached: 0,
            failed: 0,
            bytes_downloaded: 0,
            failures: Vec::new(),
            by_region: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, outcome: &FetchOutcome) {
        let region = self
            .by_region
            .entry(outcome.descriptor.region_id.clone())
            .or_default();

        match &outcome.result {
            FetchResult::Downloaded { size } => {
                self.downloaded += 1;
                self.bytes_downloaded += size;
                region.downloaded += 1;
            }
            FetchResult::Cached { .. } => {
                self.cached += 1;
                region.cached += 1;
            }
            FetchResult::Failed { reason } => {
                self.failed += 1;
                region.failed += 1;
                self.failures.push(FetchFailure {
                    path: outcome.descriptor.relative_path(),
                    url: outcome.descriptor.url().ok(),
                    reason: reason.clone(),
                    attempts: outcome.attempts,
                });
            }
        }
    }

    pub fn finish(&mut self, cancelled: bool) {
        self.finished_at = Some(Utc::now());
        self.cancelled = cancelled;
        self.failures.sort_by(|a, b| a.path.cmp(&b.path));
    }

    pub fn total(&self) -> u64 {
        self.downloaded + self.cached + self.failed
    }

    /// How the run should be reported to a caller.
    pub fn exit_status(&self) -> ExitStatus {
        classify(
            self.cancelled,
            self.total(),
            self.downloaded + self.cached,
            self.failures.iter().map(|f| &f.reason),
        )
    }

    pub fn summary(&self) -> String {
        let mut text = String::new();
        let _ = writeln!(text, "fetch started  {}", self.started_at.to_rfc3339());
        if let Some(finished) = self.finished_at {
            let _ = writeln!(text, "fetch finished {}", finished.to_rfc3339());
        }
        let _ = writeln!(
            text,
            "downloaded {} ({}), cached {}, failed {}{}",
            self.downloaded,
            pretty_bytes::converter::convert(self.bytes_downloaded as f64),
            self.cached,
            self.failed,
            if self.cancelled { " (cancelled)" } else { "" }
        );
        for (region, counts) in &self.by_region {
            let _ = writeln!(
                text,
                "  {:<24} downloaded {:>7}  cached {:>7}  failed {:>7}",
                region, counts.downloaded, counts.cached, counts.failed
            );
        }
        for failure in &self.failures {
            let _ = writeln!(
                text,
                "  FAILED {} after {} attempt(s): {}",
                failure.path, failure.attempts, failure.reason
            );
        }
        text
    }

    pub async fn write(&self, path: &Path) -> Result<(), StoreError> {
        write_report(path, self, &self.summary()).await
    }
}

/// Shared exit classification of both phases.
///
/// Cancellation wins; a run that attempted nothing is a configuration
/// problem; any success with failures is partial; failures only, all of them
/// transport-like, mean the remote side was unreachable.
pub(crate) fn classify<'a>(
    cancelled: bool,
    total: u64,
    succeeded: u64,
    mut failures: impl Iterator<Item = &'a FailureReason>,
) -> ExitStatus {
    let failed = total - succeeded.min(total);
    if cancelled {
        ExitStatus::Cancelled
    } else if total == 0 {
        ExitStatus::ConfigError
    } else if failed == 0 {
        ExitStatus::Success
    } else if succeeded == 0 && failures.all(FailureReason::is_transport_like) {
        ExitStatus::TransportFailure
    } else {
        ExitStatus::PartialFailure
    }
}

/// Text sibling of a JSON report: same name, `.txt` extension.
pub fn text_sibling(path: &Path) -> PathBuf {
    path.with_extension("txt")
}

/// Writes `report` as pretty JSON to `path` and `text` next to it, each
/// through a temporary file and a rename.
pub async fn write_report<T: Serialize>(
    path: &Path,
    report: &T,
    text: &str,
) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(report).map_err(|source| StoreError::Serialize {
        path: path.to_owned(),
        source,
    })?;

    write_atomic(path, &json).await?;
    write_atomic(&text_sibling(path), text.as_bytes()).await
}

/// Replaces `path` with `contents` via `<path>.tmp` and a rename.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::io(parent, e))?;
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_owned();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    fs::write(&tmp, contents)
        .await
        .map_err(|e| StoreError::io(&tmp, e))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| StoreError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::TileDescriptor;
    use crate::template::UrlTemplate;
    use crate::tile::TileCoord;
    use crate::variant::Variant;
    use tempfile::TempDir;

    fn outcome(x: u32, result: FetchResult) -> FetchOutcome {
        FetchOutcome {
            descriptor: TileDescriptor {
                region_id: "hanoi".into(),
                variant: Variant::MasterPlan2030,
                subregion_id: None,
                coord: TileCoord::new(12, x, 1803).unwrap(),
                template: UrlTemplate::parse("https://tiles.example/hanoi/qh-2030/{z}/{x}/{y}.png")
                    .unwrap(),
            },
            result,
            attempts: 1,
        }
    }

    #[test]
    fn exit_classification() {
        let transport = FailureReason::transport("timed out");
        let not_found = FailureReason::HttpStatus { code: 404 };

        assert_eq!(classify(false, 0, 0, std::iter::empty()), ExitStatus::ConfigError);
        assert_eq!(classify(false, 5, 5, std::iter::empty()), ExitStatus::Success);
        assert_eq!(
            classify(false, 5, 4, [&not_found].into_iter()),
            ExitStatus::PartialFailure
        );
        assert_eq!(
            classify(false, 2, 0, [&transport, &transport].into_iter()),
            ExitStatus::TransportFailure
        );
        assert_eq!(
            classify(false, 2, 0, [&transport, &not_found].into_iter()),
            ExitStatus::PartialFailure
        );
        assert_eq!(classify(true, 5, 5, std::iter::empty()), ExitStatus::Cancelled);
    }

    #[test]
    fn tallies_by_region() {
        let mut report = FetchReport::start();
        report.record(&outcome(1, FetchResult::Downloaded { size: 300 }));
        report.record(&outcome(2, FetchResult::Cached { size: 300 }));
        report.record(&outcome(
            3,
            FetchResult::Failed {
                reason: FailureReason::HttpStatus { code: 404 },
            },
        ));
        report.finish(false);

        assert_eq!(report.total(), 3);
        assert_eq!(report.bytes_downloaded, 300);
        assert_eq!(
            report.by_region["hanoi"],
            RegionCounts {
                downloaded: 1,
                cached: 1,
                failed: 1
            }
        );
        assert_eq!(report.failures[0].path, "hanoi/qh-2030/12/3_1803.png");
        assert_eq!(
            report.failures[0].url.as_deref(),
            Some("https://tiles.example/hanoi/qh-2030/12/3/1803.png")
        );
        assert_eq!(report.exit_status(), ExitStatus::PartialFailure);
    }

    #[tokio::test]
    async fn writes_json_and_text() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(FETCH_REPORT_FILE_NAME);
        let mut report = FetchReport::start();
        report.record(&outcome(1, FetchResult::Downloaded { size: 300 }));
        report.finish(false);

        report.write(&path).await.unwrap();

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(json["downloaded"], 1);
        assert_eq!(json["by_region"]["hanoi"]["downloaded"], 1);
        let text = std::fs::read_to_string(text_sibling(&path)).unwrap();
        assert!(text.contains("downloaded 1"));
    }
}
