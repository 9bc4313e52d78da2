use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};

/// Byte range of one URL, end exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RangeKey {
    pub url: String,
    pub start: u64,
    pub end: u64,
}

impl RangeKey {
    pub fn new(url: &str, start: u64, end: u64) -> Self {
        Self {
            url: url.to_string(),
            start,
            end,
        }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Content-addressed storage for fetched ranges. Stores are best-effort: a
/// failed write is logged and the range is simply fetched again next time.
#[async_trait]
pub trait RangeStore: Send + Sync {
    async fn get(&self, key: &RangeKey) -> Option<Bytes>;
    async fn put(&self, key: &RangeKey, data: Bytes);
}

#[derive(Default)]
pub struct MemoryStore {
    ranges: RwLock<HashMap<RangeKey, Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ranges.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RangeStore for MemoryStore {
    async fn get(&self, key: &RangeKey) -> Option<Bytes> {
        self.ranges.read().ok()?.get(key).cloned()
    }

    async fn put(&self, key: &RangeKey, data: Bytes) {
        if let Ok(mut ranges) = self.ranges.write() {
            ranges.insert(key.clone(), data);
        }
    }
}

/// One file per range under `<root>/<sha256(url)>/<start>-<end>.bin`.
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &RangeKey) -> PathBuf {
        let digest = Sha256::digest(key.url.as_bytes());
        self.root
            .join(format!("{:x}", digest))
            .join(format!("{}-{}.bin", key.start, key.end))
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut temp = path.to_path_buf();
    temp.set_extension("bin.tmp");
    temp
}

#[async_trait]
impl RangeStore for DiskStore {
    async fn get(&self, key: &RangeKey) -> Option<Bytes> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            // A short file is a torn write from an earlier run.
            Ok(data) if data.len() as u64 == key.len() => Some(Bytes::from(data)),
            Ok(data) => {
                tracing::warn!(
                    path = %path.display(),
                    expected = key.len(),
                    actual = data.len(),
                    "ignoring truncated range file"
                );
                None
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read range file");
                None
            }
        }
    }

    async fn put(&self, key: &RangeKey, data: Bytes) {
        let path = self.path_for(key);
        if let Some(dir) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                tracing::error!(
                    path = %dir.display(),
                    error = %e,
                    "failed to create range cache directory"
                );
                return;
            }
        }

        let temp_path = temp_path_for(&path);
        let result = async {
            tokio::fs::write(&temp_path, &data).await?;
            tokio::fs::rename(&temp_path, &path).await
        }
        .await;

        match result {
            Ok(()) => {
                tracing::trace!(path = %path.display(), bytes = data.len(), "wrote range file");
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to write range file");
                let _ = tokio::fs::remove_file(&temp_path).await;
            }
        }
    }
}
