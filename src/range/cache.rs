use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::{Bytes, BytesMut};

use super::fetch::{HttpFetcher, RangeFetcher};
use super::store::{DiskStore, MemoryStore, RangeKey, RangeStore};
use crate::config::RangeConfig;
use crate::error::Result;

/// `(url, start, end) -> bytes`, backed by a persistent store and a fetcher.
pub struct RangeCache {
    store: Arc<dyn RangeStore>,
    fetcher: Arc<dyn RangeFetcher>,
    lengths: Mutex<HashMap<String, u64>>,
}

impl RangeCache {
    pub fn new(store: Arc<dyn RangeStore>, fetcher: Arc<dyn RangeFetcher>) -> Self {
        Self {
            store,
            fetcher,
            lengths: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &RangeConfig) -> Self {
        let store: Arc<dyn RangeStore> = match &config.cache_dir {
            Some(dir) => Arc::new(DiskStore::new(dir)),
            None => Arc::new(MemoryStore::new()),
        };
        let fetcher = Arc::new(HttpFetcher::new(config.user_agent.clone()));
        Self::new(store, fetcher)
    }

    pub async fn content_length(&self, url: &str) -> Result<u64> {
        if let Some(len) = self.cached_length(url) {
            return Ok(len);
        }

        let len = self.fetcher.content_length(url).await?;
        self.lengths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.to_string(), len);
        Ok(len)
    }

    fn cached_length(&self, url: &str) -> Option<u64> {
        self.lengths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .copied()
    }

    pub async fn load(&self, url: &str, start: u64, end: u64) -> Result<Bytes> {
        let key = RangeKey::new(url, start, end);
        if let Some(data) = self.store.get(&key).await {
            tracing::trace!(url = %url, start, end, "range cache hit");
            return Ok(data);
        }

        let data = self.fetcher.fetch(url, start, end).await?;
        self.store.put(&key, data.clone()).await;
        Ok(data)
    }

    /// Looks up the size of `url` and returns a block-aligned view of it.
    pub async fn open(self: &Arc<Self>, url: &str, block_size: u64) -> Result<ByteSource> {
        let len = self.content_length(url).await?;
        Ok(ByteSource {
            url: Arc::from(url),
            len,
            block_size: block_size.max(1),
            cache: Arc::clone(self),
        })
    }
}

/// Random access to one resource. Every read is split into whole blocks so
/// that all cache keys for a URL line up, whoever asked for the bytes.
#[derive(Clone)]
pub struct ByteSource {
    url: Arc<str>,
    len: u64,
    block_size: u64,
    cache: Arc<RangeCache>,
}

impl ByteSource {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    fn blocks(&self, start: u64, end: u64) -> RangeInclusive<u64> {
        (start / self.block_size)..=((end - 1) / self.block_size)
    }

    async fn block(&self, index: u64) -> Result<Bytes> {
        let start = index * self.block_size;
        let end = (start + self.block_size).min(self.len);
        self.cache.load(&self.url, start, end).await
    }

    /// Bytes `start..end`, clamped to the resource length.
    pub async fn read(&self, start: u64, end: u64) -> Result<Bytes> {
        let end = end.min(self.len);
        if start >= end {
            return Ok(Bytes::new());
        }

        let mut out = BytesMut::with_capacity((end - start) as usize);
        for index in self.blocks(start, end) {
            let block = self.block(index).await?;
            let block_start = index * self.block_size;
            let from = start.saturating_sub(block_start) as usize;
            let to = ((end - block_start) as usize).min(block.len());
            if from < to {
                out.extend_from_slice(&block[from..to]);
            }
        }
        Ok(out.freeze())
    }

    /// Makes `start..end` resident without copying it out.
    pub async fn prefetch(&self, start: u64, end: u64) -> Result<()> {
        let end = end.min(self.len);
        if start >= end {
            return Ok(());
        }
        for index in self.blocks(start, end) {
            self.block(index).await?;
        }
        Ok(())
    }
}
