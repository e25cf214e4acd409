//! Durable snapshot store
//!
//! Persists the last successfully fetched payload for every cache key as a
//! JSON file, so the proxy can keep answering when upstream is down or after
//! a restart.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::data::{CacheKey, Category};
use crate::error::StoreError;

/// Default time limit for a single snapshot operation
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Record stored on disk for one cache key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord<T = Value> {
    pub category: Category,
    pub sub_key: String,
    /// When the payload was fetched from upstream
    pub fetched_at: DateTime<Utc>,
    pub payload: T,
}

/// Reads and writes snapshot files under a root directory
///
/// Layout is `<root>/<category>/<encoded sub-key>.json`. Writes go to a
/// temporary file that is synced and then renamed over the target, so a
/// crash mid-write leaves the previous snapshot intact.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
    timeout: Duration,
}

impl SnapshotStore {
    /// Creates a store in the XDG-compliant cache directory
    ///
    /// Uses `~/.cache/statcache/snapshots` on Linux. Returns `None` if no
    /// home directory can be determined.
    pub fn new() -> Option<Self> {
        let dirs = ProjectDirs::from("", "", "statcache")?;
        Some(Self::with_dir(dirs.cache_dir().join("snapshots")))
    }

    /// Creates a store rooted at a custom directory
    pub fn with_dir(root: PathBuf) -> Self {
        Self {
            root,
            timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Sets the time limit applied to each save and load
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the snapshot file path for a key
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.root
            .join(key.category.slug())
            .join(format!("{}.json", encode_sub_key(&key.sub_key)))
    }

    /// Persists `payload` for `key`, replacing any previous snapshot
    pub async fn save(
        &self,
        key: &CacheKey,
        payload: &Value,
        fetched_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let record = SnapshotRecord {
            category: key.category,
            sub_key: key.sub_key.clone(),
            fetched_at,
            payload,
        };
        let json = serde_json::to_vec(&record).map_err(StoreError::Encode)?;
        let path = self.path_for(key);

        tokio::time::timeout(self.timeout, write_atomic(&path, &json))
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))??;

        debug!(path = %path.display(), "snapshot saved");
        Ok(())
    }

    /// Loads the snapshot for `key`
    ///
    /// Returns `Ok(None)` if no snapshot was ever saved for the key.
    pub async fn load(&self, key: &CacheKey) -> Result<Option<SnapshotRecord>, StoreError> {
        let path = self.path_for(key);

        let read = tokio::time::timeout(self.timeout, fs::read(&path))
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?;

        let bytes = match read {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Io(e)),
        };

        let record: SnapshotRecord =
            serde_json::from_slice(&bytes).map_err(StoreError::Decode)?;
        debug!(path = %path.display(), "snapshot loaded");
        Ok(Some(record))
    }
}

/// Writes `contents` to `path` via a synced temporary file and a rename
async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let tmp = path.with_extension("json.tmp");
    let result: std::io::Result<()> = async {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, path).await
    }
    .await;

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp).await;
        return Err(StoreError::Io(e));
    }
    Ok(())
}

/// Encodes a sub-key into a collision-free file stem
///
/// ASCII alphanumerics, `-` and `.` pass through (a leading `.` is escaped);
/// every other byte becomes `_XX` in hex. The empty sub-key maps to `_`,
/// which no non-empty sub-key can produce.
fn encode_sub_key(sub_key: &str) -> String {
    if sub_key.is_empty() {
        return "_".to_string();
    }
    let mut out = String::with_capacity(sub_key.len());
    for (i, byte) in sub_key.bytes().enumerate() {
        let plain = byte.is_ascii_alphanumeric() || byte == b'-' || (byte == b'.' && i > 0);
        if plain {
            out.push(byte as char);
        } else {
            out.push_str(&format!("_{:02x}", byte));
        }
    }
    out
}
