//! # Image caching
//!
//! Fetched images are kept in two tiers, so that repeated requests neither hit the network nor
//! decode the same bytes again.
//!
//! ## Cache Tiers
//!
//! - The [`MemoryCache`] holds decoded images, bounded by their decoded footprint. It evicts
//!   least recently used entries on its own when full, and drops the least valuable half of its
//!   entries when asked to [`reclaim`](MemoryCache::reclaim) memory.
//! - The [`DiskCache`] holds encoded images together with a small JSON metadata record (creation
//!   time, last access, ETag). It expires entries according to the configured
//!   [`ExpirationPolicy`] and evicts the least recently accessed entries once it grows beyond its
//!   capacity, down to 80% of it.
//! - The [`HybridCache`] puts memory in front of disk. Disk hits are promoted into memory,
//!   disk writes happen on the blocking thread pool.
//!
//! The [`CacheCoordinator`] is the single entry point used by the rest of the crate. Each call
//! names a [`StorageStrategy`] that selects the tiers it applies to.
//!
//! ### Layout
//!
//! Entries are addressed by a [`CacheKey`], the SHA-256 digest of the image URL. Below the
//! configured `cache_dir`, entries live at `images/aa/bbccdd/eeff....img` with the metadata
//! record next to it as `.meta`. In-progress writes go to `tmp/` and are renamed into place.
//!
//! ### Metrics
//!
//! - `caches.access`: All accesses, tagged with the storage strategy.
//! - `caches.memory.hit`: Accesses served by the memory tier.
//! - `caches.disk.hit` / `caches.disk.miss`: Lookups in the disk tier.
//! - `caches.disk.write`: Images written to disk, `caches.disk.size` their size.
//! - `caches.disk.expired` / `caches.disk.evicted`: Entries removed by expiration and by the
//!   capacity sweep.
//! - `caches.memory.evicted` / `caches.memory.reclaimed`: Entries dropped from memory.

mod cache_error;
mod cache_key;
mod cleanup;
mod coordinator;
mod disk;
mod entry;
mod expiration;
mod fs;
mod hybrid;
mod memory;

pub use cache_error::DiskCacheError;
pub use cache_key::CacheKey;
pub use cleanup::CleanupStats;
pub use coordinator::{CacheCoordinator, StorageStrategy};
pub use disk::DiskCache;
pub use entry::{CacheEntry, Metadata};
pub use expiration::ExpirationPolicy;
pub use hybrid::{DiskWorker, HybridCache};
pub use memory::MemoryCache;
