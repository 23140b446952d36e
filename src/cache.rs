use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};
use tokio::{fs, sync::RwLock};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::{scan_tiles, state_dir, CACHE_FILE_NAME};

/// How old the persisted cache may be before it is rebuilt from the tree.
pub const DEFAULT_CACHE_MAX_AGE: Duration = Duration::from_secs(60 * 60);

/// Set of relative tile paths known to be on disk.
///
/// A hit means the tile was downloaded and validated before; a miss only
/// means "unknown". Persisted next to the tile root as one path per line.
#[derive(Debug)]
pub struct ExistenceCache {
    file: PathBuf,
    entries: RwLock<HashSet<String>>,
}

impl ExistenceCache {
    /// An empty cache persisted at `file`.
    pub fn empty(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            entries: RwLock::new(HashSet::new()),
        }
    }

    /// Location of the cache file belonging to `tile_root`.
    pub fn file_for(tile_root: &Path) -> PathBuf {
        state_dir(tile_root).join(CACHE_FILE_NAME)
    }

    /// Loads the persisted cache when it is younger than `max_age`, otherwise
    /// rebuilds it by walking the tile tree.
    pub async fn open(tile_root: &Path, max_age: Duration) -> Result<Self, StoreError> {
        let file = Self::file_for(tile_root);

        if let Some(entries) = load_fresh(&file, max_age).await? {
            info!(entries = entries.len(), path = %file.display(), "loaded existence cache");
            return Ok(Self {
                file,
                entries: RwLock::new(entries),
            });
        }

        let root = tile_root.to_owned();
        let scan = tokio::task::spawn_blocking(move || scan_tiles(&root))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))??;

        let entries: HashSet<String> = scan
            .tiles
            .iter()
            .map(|scanned| scanned.tile.relative_path())
            .collect();
        info!(entries = entries.len(), "rebuilt existence cache from tile tree");

        Ok(Self {
            file,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.file
    }

    pub async fn contains(&self, relative_path: &str) -> bool {
        self.entries.read().await.contains(relative_path)
    }

    /// Returns whether the path was new.
    pub async fn insert(&self, relative_path: String) -> bool {
        self.entries.write().await.insert(relative_path)
    }

    pub async fn remove(&self, relative_path: &str) -> bool {
        self.entries.write().await.remove(relative_path)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Atomically replaces the cache file with the current contents.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let mut lines: Vec<String> = self.entries.read().await.iter().cloned().collect();
        lines.sort_unstable();

        let mut body = lines.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }

        if let Some(parent) = self.file.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }

        let tmp = self.file.with_extension("txt.tmp");
        fs::write(&tmp, body)
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;
        fs::rename(&tmp, &self.file)
            .await
            .map_err(|e| StoreError::io(&self.file, e))?;

        debug!(entries = lines.len(), path = %self.file.display(), "flushed existence cache");
        Ok(())
    }
}

async fn load_fresh(file: &Path, max_age: Duration) -> Result<Option<HashSet<String>>, StoreError> {
    let meta = match fs::metadata(file).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(file, e)),
    };

    let age = meta
        .modified()
        .ok()
        .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
        .unwrap_or_default();
    if age > max_age {
        debug!(?age, "existence cache is stale");
        return Ok(None);
    }

    let raw = fs::read_to_string(file)
        .await
        .map_err(|e| StoreError::io(file, e))?;

    Ok(Some(
        raw.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn rebuilds_from_tree_when_missing() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("cities");
        let tile = root.join("hanoi/qh-2030/12/3252_1803.png");
        std::fs::create_dir_all(tile.parent().unwrap()).unwrap();
        std::fs::write(&tile, vec![1u8; 128]).unwrap();

        let cache = ExistenceCache::open(&root, DEFAULT_CACHE_MAX_AGE)
            .await
            .unwrap();
        assert_eq!(cache.len().await, 1);
        assert!(cache.contains("hanoi/qh-2030/12/3252_1803.png").await);
        assert_eq!(cache.path(), dir.path().join(CACHE_FILE_NAME));
    }

    #[tokio::test]
    async fn flush_then_reload() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("cities");

        let cache = ExistenceCache::empty(ExistenceCache::file_for(&root));
        assert!(cache.insert("a/qh-2030/3/1_2.png".into()).await);
        assert!(!cache.insert("a/qh-2030/3/1_2.png".into()).await);
        cache.insert("a/qh-2030/3/1_3.png".into()).await;
        cache.flush().await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join(CACHE_FILE_NAME)).unwrap();
        assert_eq!(raw, "a/qh-2030/3/1_2.png\na/qh-2030/3/1_3.png\n");

        // The tree is empty, so only a load from the file can find these.
        let reloaded = ExistenceCache::open(&root, DEFAULT_CACHE_MAX_AGE)
            .await
            .unwrap();
        assert_eq!(reloaded.len().await, 2);
    }

    #[tokio::test]
    async fn stale_file_is_ignored() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("cities");
        let file = dir.path().join(CACHE_FILE_NAME);
        std::fs::write(&file, "x/qh-2030/3/1_2.png\n").unwrap();
        let two_hours_ago = SystemTime::now() - Duration::from_secs(2 * 60 * 60);
        std::fs::File::options()
            .write(true)
            .open(&file)
            .unwrap()
            .set_modified(two_hours_ago)
            .unwrap();

        let cache = ExistenceCache::open(&root, DEFAULT_CACHE_MAX_AGE)
            .await
            .unwrap();
        assert!(cache.is_empty().await);
    }
}
