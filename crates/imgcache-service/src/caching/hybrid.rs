use std::sync::Arc;

use tokio::runtime::Handle;
use tokio_util::task::TaskTracker;

use crate::codec::Image;

use super::{CacheEntry, CacheKey, DiskCache, MemoryCache};

/// Runs [`DiskCache`] operations on the blocking thread pool.
///
/// Operations may be scheduled from any thread. [`flush`](Self::flush) waits for everything
/// scheduled so far.
///
/// Every operation runs as its own blocking task, so operations scheduled back to back do not
/// necessarily run in that order. The [`DiskCache`] lock only makes each of them atomic.
#[derive(Debug, Clone)]
pub struct DiskWorker {
    disk: Arc<DiskCache>,
    runtime: Handle,
    tasks: TaskTracker,
}

impl DiskWorker {
    pub fn new(disk: Arc<DiskCache>, runtime: Handle) -> Self {
        let tasks = TaskTracker::new();
        // A closed tracker still tracks new tasks, closing it only lets `wait` complete.
        tasks.close();
        Self {
            disk,
            runtime,
            tasks,
        }
    }

    pub fn disk(&self) -> &Arc<DiskCache> {
        &self.disk
    }

    /// Runs `f` in the background, without waiting for it.
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce(&DiskCache) + Send + 'static,
    {
        let disk = Arc::clone(&self.disk);
        let token = self.tasks.token();
        self.runtime.spawn_blocking(move || {
            let _token = token;
            f(&disk)
        });
    }

    /// Runs `f` on the blocking pool and waits for its result.
    ///
    /// Returns `None` if the operation panicked.
    pub async fn run<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&DiskCache) -> R + Send + 'static,
        R: Send + 'static,
    {
        let disk = Arc::clone(&self.disk);
        let token = self.tasks.token();
        let result = self
            .runtime
            .spawn_blocking(move || {
                let _token = token;
                f(&disk)
            })
            .await;

        match result {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!(error = &e as &dyn std::error::Error, "Disk operation failed");
                None
            }
        }
    }

    /// Waits until all scheduled operations have finished.
    pub async fn flush(&self) {
        self.tasks.wait().await;
    }
}

/// Memory in front of disk.
///
/// Reads check memory first and promote disk hits into memory. Writes and removals apply to
/// memory right away and to disk in the background, disk failures are logged and otherwise
/// ignored.
///
/// Background disk operations are unordered with respect to each other. A [`store`](Self::store)
/// quickly followed by a [`remove`](Self::remove) or [`remove_all`](Self::remove_all) may leave
/// the entry on disk, to be promoted again by a later read. Call [`flush`](Self::flush) in
/// between where the order matters.
#[derive(Debug, Clone)]
pub struct HybridCache {
    memory: Arc<MemoryCache>,
    disk: DiskWorker,
}

impl HybridCache {
    pub fn new(memory: Arc<MemoryCache>, disk: DiskWorker) -> Self {
        Self { memory, disk }
    }

    pub fn store(&self, entry: CacheEntry) {
        self.memory.store(entry.clone());
        self.disk.schedule(move |disk| {
            if let Err(e) = disk.store(&entry) {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    key = %entry.key,
                    "Failed to write image to disk cache",
                );
            }
        });
    }

    pub async fn retrieve(&self, key: &CacheKey) -> Option<Image> {
        self.retrieve_entry(key).await.map(|entry| entry.image)
    }

    pub async fn retrieve_entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        if let Some(entry) = self.memory.retrieve_entry(key) {
            metric!(counter("caches.memory.hit") += 1);
            return Some(entry);
        }

        let lookup = key.clone();
        let entry = self
            .disk
            .run(move |disk| disk.retrieve_entry(&lookup))
            .await
            .flatten()?;

        tracing::trace!(key = %key, "Promoting disk hit into memory");
        self.memory.store(entry.clone());
        Some(entry)
    }

    pub fn remove(&self, key: &CacheKey) {
        self.memory.remove(key);
        let key = key.clone();
        self.disk.schedule(move |disk| disk.remove(&key));
    }

    pub fn remove_all(&self) {
        self.memory.remove_all();
        self.disk.schedule(DiskCache::remove_all);
    }

    /// Waits until all background disk operations scheduled so far have finished.
    pub async fn flush(&self) {
        self.disk.flush().await;
    }
}
