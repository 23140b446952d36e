use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};
use tokio::fs;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::report::write_atomic;
use crate::store::{state_dir, RESUME_FILE_NAME};

/// Counters carried across interrupted publish runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialStats {
    pub uploaded: u64,
    pub skipped_existing: u64,
    pub failed: u64,
    pub bytes_uploaded: u64,
}

/// Keys known to be in the bucket, persisted next to the tile root.
///
/// Only valid for the bucket and prefix it was written for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeState {
    pub bucket: String,
    pub prefix: String,
    pub uploaded_keys: BTreeSet<String>,
    pub partial_stats: PartialStats,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ResumeState {
    pub fn new(bucket: &str, prefix: &str) -> Self {
        Self {
            bucket: bucket.to_owned(),
            prefix: prefix.to_owned(),
            uploaded_keys: BTreeSet::new(),
            partial_stats: PartialStats::default(),
            updated_at: None,
        }
    }

    pub fn file_for(tile_root: &Path) -> PathBuf {
        state_dir(tile_root).join(RESUME_FILE_NAME)
    }

    /// Loads the state at `path`. A missing, unreadable or foreign file yields
    /// a fresh state; only I/O errors other than "not found" are fatal.
    pub async fn load(path: &Path, bucket: &str, prefix: &str) -> Result<Self, StoreError> {
        let raw = match fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::new(bucket, prefix))
            }
            Err(e) => return Err(StoreError::io(path, e)),
        };

        let state: Self = match serde_json::from_slice(&raw) {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable upload state");
                return Ok(Self::new(bucket, prefix));
            }
        };

        if state.bucket != bucket || state.prefix != prefix {
            warn!(
                path = %path.display(),
                recorded_bucket = %state.bucket,
                recorded_prefix = %state.prefix,
                "upload state belongs to another bucket or prefix, starting over"
            );
            return Ok(Self::new(bucket, prefix));
        }

        debug!(keys = state.uploaded_keys.len(), "loaded upload state");
        Ok(state)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.uploaded_keys.contains(key)
    }

    pub fn mark_present(&mut self, key: &str) {
        self.uploaded_keys.insert(key.to_owned());
    }

    pub async fn save(&mut self, path: &Path) -> Result<(), StoreError> {
        self.updated_at = Some(Utc::now());
        let json = serde_json::to_vec_pretty(self).map_err(|source| StoreError::Serialize {
            path: path.to_owned(),
            source,
        })?;
        write_atomic(path, &json).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = ResumeState::file_for(&dir.path().join("cities"));
        assert_eq!(path, dir.path().join(RESUME_FILE_NAME));

        let mut state = ResumeState::new("planning", "tiles");
        state.mark_present("tiles/hanoi/qh-2030/12/1_2.png");
        state.partial_stats.uploaded = 1;
        state.save(&path).await.unwrap();

        let loaded = ResumeState::load(&path, "planning", "tiles").await.unwrap();
        assert!(loaded.contains("tiles/hanoi/qh-2030/12/1_2.png"));
        assert_eq!(loaded.partial_stats.uploaded, 1);

        let foreign = ResumeState::load(&path, "other", "tiles").await.unwrap();
        assert!(foreign.uploaded_keys.is_empty());
    }

    #[tokio::test]
    async fn garbage_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(RESUME_FILE_NAME);
        std::fs::write(&path, b"{not json").unwrap();

        let state = ResumeState::load(&path, "planning", "").await.unwrap();
        assert!(state.uploaded_keys.is_empty());
    }
}
