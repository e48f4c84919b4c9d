use std::io;
use std::sync::Arc;

use serde::Deserialize;
use tokio::runtime::Handle;

use crate::codec::{Image, ImageCodec};
use crate::config::Config;
use crate::utils::clock::Clock;

use super::{
    CacheEntry, CacheKey, CleanupStats, DiskCache, DiskWorker, HybridCache, MemoryCache,
};

/// Which tiers a cache operation applies to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageStrategy {
    /// Only the in-memory tier.
    Memory,
    /// Only the disk tier.
    Disk,
    /// Memory in front of disk.
    #[default]
    Hybrid,
}

impl StorageStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Disk => "disk",
            Self::Hybrid => "hybrid",
        }
    }
}

/// Dispatches cache operations to the tiers selected by a [`StorageStrategy`].
#[derive(Debug, Clone)]
pub struct CacheCoordinator {
    memory: Arc<MemoryCache>,
    disk: DiskWorker,
    hybrid: HybridCache,
}

impl CacheCoordinator {
    pub fn new(memory: Arc<MemoryCache>, disk: Arc<DiskCache>, runtime: Handle) -> Self {
        let disk = DiskWorker::new(disk, runtime);
        let hybrid = HybridCache::new(Arc::clone(&memory), disk.clone());
        Self {
            memory,
            disk,
            hybrid,
        }
    }

    pub fn from_config(
        config: &Config,
        codec: Arc<dyn ImageCodec>,
        clock: Arc<dyn Clock>,
        runtime: Handle,
    ) -> Self {
        let memory = MemoryCache::new(config.caches.memory_capacity, Arc::clone(&clock));
        let disk = DiskCache::from_config(config, codec, clock);
        Self::new(Arc::new(memory), Arc::new(disk), runtime)
    }

    pub fn memory(&self) -> &MemoryCache {
        &self.memory
    }

    pub fn disk(&self) -> &DiskCache {
        self.disk.disk()
    }

    /// Stores `entry` in the selected tiers. Disk writes happen in the background.
    pub fn store(&self, entry: CacheEntry, strategy: StorageStrategy) {
        match strategy {
            StorageStrategy::Memory => self.memory.store(entry),
            StorageStrategy::Disk => self.disk.schedule(move |disk| {
                if let Err(e) = disk.store(&entry) {
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        key = %entry.key,
                        "Failed to write image to disk cache",
                    );
                }
            }),
            StorageStrategy::Hybrid => self.hybrid.store(entry),
        }
    }

    pub async fn retrieve_image(&self, key: &CacheKey, strategy: StorageStrategy) -> Option<Image> {
        self.retrieve_entry(key, strategy)
            .await
            .map(|entry| entry.image)
    }

    pub async fn retrieve_entry(
        &self,
        key: &CacheKey,
        strategy: StorageStrategy,
    ) -> Option<CacheEntry> {
        metric!(counter("caches.access") += 1, "storage" => strategy.as_str());
        match strategy {
            StorageStrategy::Memory => {
                let entry = self.memory.retrieve_entry(key);
                if entry.is_some() {
                    metric!(counter("caches.memory.hit") += 1);
                }
                entry
            }
            StorageStrategy::Disk => {
                let key = key.clone();
                self.disk
                    .run(move |disk| disk.retrieve_entry(&key))
                    .await
                    .flatten()
            }
            StorageStrategy::Hybrid => self.hybrid.retrieve_entry(key).await,
        }
    }

    pub fn remove(&self, key: &CacheKey, strategy: StorageStrategy) {
        match strategy {
            StorageStrategy::Memory => self.memory.remove(key),
            StorageStrategy::Disk => {
                let key = key.clone();
                self.disk.schedule(move |disk| disk.remove(&key));
            }
            StorageStrategy::Hybrid => self.hybrid.remove(key),
        }
    }

    pub fn clear(&self, strategy: StorageStrategy) {
        match strategy {
            StorageStrategy::Memory => self.memory.remove_all(),
            StorageStrategy::Disk => self.disk.schedule(DiskCache::remove_all),
            StorageStrategy::Hybrid => self.hybrid.remove_all(),
        }
    }

    /// Records `etag` as the validator of the entry for `key`.
    ///
    /// The image itself is left untouched. Entries that are not cached are ignored.
    pub fn store_etag(&self, key: &CacheKey, etag: &str, strategy: StorageStrategy) {
        if matches!(strategy, StorageStrategy::Memory | StorageStrategy::Hybrid) {
            self.memory.update_etag(key, Some(etag.to_owned()));
        }
        if matches!(strategy, StorageStrategy::Disk | StorageStrategy::Hybrid) {
            let key = key.clone();
            let etag = etag.to_owned();
            self.disk.schedule(move |disk| {
                if let Err(e) = disk.update_etag(&key, Some(etag)) {
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        key = %key,
                        "Failed to update validator in disk cache",
                    );
                }
            });
        }
    }

    /// Returns the validator stored with the entry for `key`.
    pub async fn retrieve_etag(&self, key: &CacheKey, strategy: StorageStrategy) -> Option<String> {
        self.retrieve_entry(key, strategy)
            .await
            .and_then(|entry| entry.etag)
    }

    /// Reacts to memory pressure by shrinking the memory tier.
    pub fn reclaim_memory(&self) -> usize {
        self.memory.reclaim()
    }

    /// Waits until all background disk operations scheduled so far have finished.
    pub async fn flush(&self) {
        self.disk.flush().await;
    }

    /// Runs a [`DiskCache::cleanup`] pass on the blocking pool.
    pub async fn cleanup(&self) -> io::Result<CleanupStats> {
        self.disk
            .run(DiskCache::cleanup)
            .await
            .unwrap_or_else(|| Err(io::Error::other("cleanup task failed")))
    }
}
