use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::{CacheConfig, Config};
use crate::media::{Demuxer, TsDemuxer};
use crate::range::RangeCache;
use crate::worker::{spawn_worker, WorkerHandle, WorkerSettings};

struct FileEntry {
    worker: WorkerHandle,
    refs: usize,
    generation: u64,
}

#[derive(Default)]
struct Files {
    entries: HashMap<String, FileEntry>,
    next_generation: u64,
}

struct Inner {
    settings: WorkerSettings,
    cache_config: CacheConfig,
    range: Arc<RangeCache>,
    demuxer: Arc<dyn Demuxer>,
    files: Mutex<Files>,
}

/// Per-URL decode workers, shared by every coordinator. A worker lives as
/// long as some [`FileHandle`] for its URL does.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    pub fn new(config: &Config, range_cache: Arc<RangeCache>, demuxer: Arc<dyn Demuxer>) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings: WorkerSettings::from_config(config),
                cache_config: config.cache.clone(),
                range: range_cache,
                demuxer,
                files: Mutex::new(Files::default()),
            }),
        }
    }

    /// HTTP range cache and the MPEG-TS demuxer, as configured.
    pub fn from_config(config: &Config) -> Self {
        let range = Arc::new(RangeCache::from_config(&config.range));
        let demuxer = Arc::new(TsDemuxer::new(&config.decode));
        Self::new(config, range, demuxer)
    }

    pub fn cache_config(&self) -> &CacheConfig {
        &self.inner.cache_config
    }

    fn files(&self) -> MutexGuard<'_, Files> {
        self.inner
            .files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a handle on the worker for `url`, starting one if there is
    /// none or the current one failed to index the file.
    pub fn acquire(&self, url: &str) -> FileHandle {
        let mut files = self.files();

        if let Some(entry) = files.entries.get_mut(url) {
            if !entry.worker.is_failed() {
                entry.refs += 1;
                return FileHandle {
                    registry: self.clone(),
                    url: url.to_string(),
                    generation: entry.generation,
                    worker: entry.worker.clone(),
                };
            }
            tracing::info!(url = %url, generation = entry.generation, "replacing failed worker");
        }

        files.next_generation += 1;
        let generation = files.next_generation;
        let worker = spawn_worker(
            url.to_string(),
            self.inner.settings,
            Arc::clone(&self.inner.range),
            Arc::clone(&self.inner.demuxer),
        );
        files.entries.insert(
            url.to_string(),
            FileEntry {
                worker: worker.clone(),
                refs: 1,
                generation,
            },
        );
        tracing::info!(url = %url, generation, "opened file");

        FileHandle {
            registry: self.clone(),
            url: url.to_string(),
            generation,
            worker,
        }
    }

    fn release(&self, url: &str, generation: u64) {
        let mut files = self.files();
        let Some(entry) = files.entries.get_mut(url) else {
            return;
        };
        // A replaced entry's handles no longer count.
        if entry.generation != generation {
            return;
        }

        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0 {
            files.entries.remove(url);
            tracing::info!(url = %url, generation, "closed file");
        }
    }

    /// URLs with a live worker, sorted.
    pub fn open_files(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.files().entries.keys().cloned().collect();
        urls.sort();
        urls
    }

    pub fn ref_count(&self, url: &str) -> usize {
        self.files().entries.get(url).map_or(0, |e| e.refs)
    }
}

/// One reference to a file's worker. Dropping the last handle for a URL
/// tears the worker down.
pub struct FileHandle {
    registry: Registry,
    url: String,
    generation: u64,
    worker: WorkerHandle,
}

impl FileHandle {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn worker(&self) -> &WorkerHandle {
        &self.worker
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        self.registry.release(&self.url, self.generation);
    }
}
