//! Batch files, search cache, refresh queue, quota counter and HTTP fetch utilities.

use std::path::{Path, PathBuf};

use anyhow::Context;
use jobwatch_core::{EnrichedBatch, JobsBatch};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

mod cache;
mod http;
mod sqlite;

pub use cache::{
    CacheEntry, CacheLookup, CacheStore, QuotaStore, RefreshQueue, RefreshRequest, RefreshStatus,
};
pub use http::{
    classify_reqwest_error, classify_status, retry_with_backoff, BackoffPolicy, FetchError,
    FetchedResponse, HttpClientConfig, HttpFetcher, RetryDisposition, TokenBucket,
    TokenBucketConfig,
};
pub use sqlite::SqliteStore;

pub const CRATE_NAME: &str = "jobwatch-storage";

pub const BATCH_FILE: &str = "jobs.json";
pub const SEEN_INDEX_FILE: &str = "seen_index.json";
pub const ENRICHED_FILE: &str = "jobs_enriched.json";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("serializing {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("writing {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Replace `path` with `bytes` through a temp file in the same directory and a
/// rename, so readers see either the old or the new content, never a partial file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    let write_err = |source| PersistenceError::Write {
        path: path.to_path_buf(),
        source,
    };
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).await.map_err(write_err)?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let result = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, path).await
    }
    .await;

    if let Err(err) = result {
        let _ = fs::remove_file(&temp_path).await;
        return Err(write_err(err));
    }
    Ok(())
}

async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistenceError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| PersistenceError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, &bytes).await
}

/// Output directory holding the batch document and its side files.
#[derive(Debug, Clone)]
pub struct BatchStore {
    dir: PathBuf,
}

impl BatchStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn batch_path(&self) -> PathBuf {
        self.dir.join(BATCH_FILE)
    }

    pub fn seen_index_path(&self) -> PathBuf {
        self.dir.join(SEEN_INDEX_FILE)
    }

    pub fn enriched_path(&self) -> PathBuf {
        self.dir.join(ENRICHED_FILE)
    }

    pub async fn persist_batch(&self, batch: &JobsBatch) -> Result<PathBuf, PersistenceError> {
        let path = self.batch_path();
        write_json_atomic(&path, batch).await?;
        Ok(path)
    }

    pub async fn persist_enriched(&self, batch: &EnrichedBatch) -> Result<PathBuf, PersistenceError> {
        let path = self.enriched_path();
        write_json_atomic(&path, batch).await?;
        Ok(path)
    }

    pub async fn persist_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), PersistenceError> {
        write_json_atomic(path, value).await
    }

    /// Strictly parsed batch for readers; `None` when no batch was ever written.
    pub async fn load_batch(&self) -> anyhow::Result<Option<JobsBatch>> {
        let path = self.batch_path();
        let Some(text) = read_if_exists(&path).await? else {
            return Ok(None);
        };
        let batch = serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(batch))
    }
}

/// File contents, or `None` when the file does not exist.
pub async fn read_if_exists(path: &Path) -> anyhow::Result<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    #[tokio::test]
    async fn atomic_write_replaces_whole_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested/out.json");
        write_atomic(&path, b"first version").await.expect("first write");
        write_atomic(&path, b"second").await.expect("second write");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");

        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn failed_write_leaves_previous_batch_untouched() {
        let dir = tempdir().expect("tempdir");
        let store = BatchStore::new(dir.path());
        let generated_at = Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).single().unwrap();
        store
            .persist_batch(&JobsBatch::new(generated_at, vec![]))
            .await
            .expect("persist");
        let before = std::fs::read_to_string(store.batch_path()).unwrap();

        // A directory squatting on the target path makes the rename fail.
        let blocked = BatchStore::new(dir.path().join("blocked"));
        std::fs::create_dir_all(blocked.batch_path()).unwrap();
        let err = blocked
            .persist_batch(&JobsBatch::new(generated_at, vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Write { .. }));

        assert_eq!(std::fs::read_to_string(store.batch_path()).unwrap(), before);
    }

    #[tokio::test]
    async fn missing_batch_loads_as_none() {
        let dir = tempdir().expect("tempdir");
        let store = BatchStore::new(dir.path());
        assert!(store.load_batch().await.unwrap().is_none());

        let generated_at = Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).single().unwrap();
        store
            .persist_batch(&JobsBatch::new(generated_at, vec![]))
            .await
            .unwrap();
        let loaded = store.load_batch().await.unwrap().unwrap();
        assert_eq!(loaded.generated_at, generated_at);
        assert_eq!(loaded.total, 0);
    }
}
