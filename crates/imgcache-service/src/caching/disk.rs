//! The persistent tier.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use crate::codec::{Image, ImageCodec};
use crate::config::Config;
use crate::utils::clock::Clock;

use super::fs::{
    PAYLOAD_EXTENSION, catch_not_found, has_extension, metadata_path, read_metadata,
    remove_if_exists, write_atomic, write_metadata,
};
use super::{CacheEntry, CacheKey, DiskCacheError, ExpirationPolicy, Metadata};

/// After an overflow, entries are evicted until the cache is back at this share of its capacity.
const LOW_WATER_PERCENT: u64 = 80;

/// A bounded, persisted map of encoded images.
///
/// Every entry is a pair of sibling files below the `images` directory: the encoded payload and
/// a JSON metadata record. Writes go through temporary files in the `tmp` directory and are
/// renamed into place. All operations on one instance are serialized by a single lock.
pub struct DiskCache {
    images_dir: PathBuf,
    tmp_dir: PathBuf,
    capacity: u64,
    expiration: ExpirationPolicy,
    encode_quality: u8,
    codec: Arc<dyn ImageCodec>,
    clock: Arc<dyn Clock>,
    lock: Mutex<()>,
}

impl std::fmt::Debug for DiskCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskCache")
            .field("images_dir", &self.images_dir)
            .field("capacity", &self.capacity)
            .field("expiration", &self.expiration)
            .finish()
    }
}

impl DiskCache {
    /// Creates a disk tier rooted at `cache_dir`.
    ///
    /// Missing directories are created right away, and again whenever an operation finds them
    /// missing.
    pub fn new(
        cache_dir: &Path,
        capacity: u64,
        expiration: ExpirationPolicy,
        codec: Arc<dyn ImageCodec>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cache = Self {
            images_dir: cache_dir.join("images"),
            tmp_dir: cache_dir.join("tmp"),
            capacity,
            expiration,
            encode_quality: 80,
            codec,
            clock,
            lock: Mutex::new(()),
        };

        if let Err(e) = cache.ensure_directories() {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                "Failed to create disk cache directories",
            );
        }
        cache
    }

    pub fn from_config(config: &Config, codec: Arc<dyn ImageCodec>, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            &config.cache_dir(),
            config.caches.disk_capacity,
            config.caches.expiration,
            codec,
            clock,
        )
        .with_encode_quality(config.caches.disk_encode_quality)
    }

    /// Sets the quality used when encoding payloads.
    pub fn with_encode_quality(mut self, quality: u8) -> Self {
        self.encode_quality = quality;
        self
    }

    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub(super) fn expiration(&self) -> ExpirationPolicy {
        self.expiration
    }

    pub(super) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Returns the path of the payload file for `key`.
    pub fn payload_path(&self, key: &CacheKey) -> PathBuf {
        let mut path = self.images_dir.join(key.cache_path());
        path.set_extension(PAYLOAD_EXTENSION);
        path
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_directories(&self) -> Result<(), DiskCacheError> {
        for path in [&self.images_dir, &self.tmp_dir] {
            fs::create_dir_all(path).map_err(|source| DiskCacheError::CreateDirectory {
                path: path.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Persists `entry`, replacing a previous entry for the same key.
    ///
    /// After the write, the least recently used entries are evicted if the cache exceeds its
    /// capacity.
    pub fn store(&self, entry: &CacheEntry) -> Result<(), DiskCacheError> {
        let payload = self
            .codec
            .encode(&entry.image, self.encode_quality)
            .ok_or(DiskCacheError::Encode)?;
        let metadata = Metadata::for_entry(entry);

        let _guard = self.lock();
        self.ensure_directories()?;

        let payload_path = self.payload_path(&entry.key);
        write_metadata(&self.tmp_dir, &payload_path, &metadata).map_err(DiskCacheError::Metadata)?;

        if let Err(e) = write_atomic(&self.tmp_dir, &payload_path, &payload) {
            // Never leave a record without its payload behind. A previous payload would now be
            // paired with the new record, so it goes as well.
            self.remove_pair(&payload_path);
            return Err(DiskCacheError::Write(e));
        }

        tracing::trace!(key = %entry.key, size = payload.len(), "Stored image on disk");
        metric!(counter("caches.disk.write") += 1);
        metric!(histogram("caches.disk.size") = payload.len() as u64);

        self.enforce_capacity();
        Ok(())
    }

    pub fn retrieve(&self, key: &CacheKey) -> Option<Image> {
        self.retrieve_entry(key).map(|entry| entry.image)
    }

    /// Looks up `key`, decoding the payload and recording the access.
    ///
    /// Broken entries, that is orphaned payloads, unreadable metadata, expired entries and
    /// payloads that fail to decode, are removed and reported as a miss.
    pub fn retrieve_entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        let _guard = self.lock();
        if let Err(e) = self.ensure_directories() {
            tracing::error!(error = &e as &dyn std::error::Error, "Disk cache unavailable");
            return None;
        }

        let payload_path = self.payload_path(key);
        let entry = self.load_entry(key, &payload_path);
        match entry {
            Some(_) => metric!(counter("caches.disk.hit") += 1),
            None => metric!(counter("caches.disk.miss") += 1),
        }
        entry
    }

    fn load_entry(&self, key: &CacheKey, payload_path: &Path) -> Option<CacheEntry> {
        let payload = match catch_not_found(|| fs::read(payload_path)) {
            Ok(Some(payload)) => payload,
            Ok(None) => return None,
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %payload_path.display(),
                    "Failed to read cached image",
                );
                return None;
            }
        };

        let mut metadata = match read_metadata(payload_path) {
            Ok(Some(metadata)) => metadata,
            Ok(None) => {
                tracing::debug!(key = %key, "Removing cached image without metadata");
                self.remove_pair(payload_path);
                return None;
            }
            Err(e) => {
                tracing::debug!(
                    error = &e as &dyn std::error::Error,
                    key = %key,
                    "Removing cached image with unreadable metadata",
                );
                self.remove_pair(payload_path);
                return None;
            }
        };

        let now = self.clock.now();
        if self.expiration.is_expired(metadata.created_at, now) {
            tracing::debug!(key = %key, "Removing expired image");
            self.remove_pair(payload_path);
            metric!(counter("caches.disk.expired") += 1);
            return None;
        }

        let Some(image) = self.codec.decode(&payload) else {
            tracing::debug!(key = %key, "Removing cached image that fails to decode");
            self.remove_pair(payload_path);
            return None;
        };

        let last_accessed_at = now.max(metadata.created_at);
        metadata.last_accessed_at = Some(last_accessed_at);
        if let Err(e) = write_metadata(&self.tmp_dir, payload_path, &metadata) {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                key = %key,
                "Failed to update access time of cached image",
            );
        }

        Some(CacheEntry {
            key: key.clone(),
            image,
            byte_size: payload.len() as u64,
            etag: metadata.etag,
            created_at: metadata.created_at,
            last_accessed_at,
            access_count: 0,
        })
    }

    /// Replaces the validator stored with `key`, leaving the image untouched.
    ///
    /// Returns `false` if there is no entry for `key`.
    pub fn update_etag(&self, key: &CacheKey, etag: Option<String>) -> Result<bool, DiskCacheError> {
        let _guard = self.lock();
        self.ensure_directories()?;

        let payload_path = self.payload_path(key);
        if !payload_path.is_file() {
            return Ok(false);
        }
        let mut metadata = match read_metadata(&payload_path).map_err(DiskCacheError::Metadata)? {
            Some(metadata) => metadata,
            None => return Ok(false),
        };

        metadata.etag = etag;
        write_metadata(&self.tmp_dir, &payload_path, &metadata).map_err(DiskCacheError::Metadata)?;
        Ok(true)
    }

    pub fn remove(&self, key: &CacheKey) {
        let _guard = self.lock();
        self.remove_pair(&self.payload_path(key));
    }

    /// Removes every entry.
    pub fn remove_all(&self) {
        let _guard = self.lock();
        if let Err(e) = catch_not_found(|| fs::remove_dir_all(&self.images_dir)) {
            tracing::error!(error = &e as &dyn std::error::Error, "Failed to clear disk cache");
        }
        if let Err(e) = self.ensure_directories() {
            tracing::error!(error = &e as &dyn std::error::Error, "Failed to recreate disk cache");
        }
    }

    /// The total size of all image payloads in bytes.
    pub fn total_size(&self) -> u64 {
        let _guard = self.lock();
        self.payloads().map(|payload| payload.size).sum()
    }

    fn remove_pair(&self, payload_path: &Path) {
        for path in [metadata_path(payload_path), payload_path.to_path_buf()] {
            if let Err(e) = remove_if_exists(&path) {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %path.display(),
                    "Failed to remove cache file",
                );
            }
        }
    }

    /// Lists all payload files, skipping metadata records.
    fn payloads(&self) -> impl Iterator<Item = PayloadFile> + '_ {
        WalkDir::new(&self.images_dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| has_extension(entry.path(), PAYLOAD_EXTENSION))
            .filter_map(|entry| {
                let file_metadata = entry.metadata().ok()?;
                Some(PayloadFile {
                    size: file_metadata.len(),
                    modified: file_metadata.modified().ok(),
                    path: entry.into_path(),
                })
            })
    }

    /// Evicts least recently used entries once the cache exceeds its capacity.
    ///
    /// Must be called with the lock held.
    fn enforce_capacity(&self) {
        let payloads: Vec<_> = self.payloads().collect();
        let mut total: u64 = payloads.iter().map(|payload| payload.size).sum();
        if total <= self.capacity {
            return;
        }

        let low_water = self.capacity.saturating_mul(LOW_WATER_PERCENT) / 100;
        let mut ordered: Vec<_> = payloads
            .into_iter()
            .map(|payload| (payload.last_used(), payload))
            .collect();
        ordered.sort_by(|a, b| a.0.cmp(&b.0));

        let mut evicted: i64 = 0;
        for (_, payload) in ordered {
            if total <= low_water {
                break;
            }
            self.remove_pair(&payload.path);
            total = total.saturating_sub(payload.size);
            evicted += 1;
        }

        tracing::debug!(evicted, remaining_bytes = total, "Evicted images from disk cache");
        metric!(counter("caches.disk.evicted") += evicted);
    }
}

struct PayloadFile {
    path: PathBuf,
    size: u64,
    modified: Option<SystemTime>,
}

impl PayloadFile {
    /// The access time recorded in the metadata, falling back to the file modification time.
    ///
    /// Entries without any usable timestamp sort first and are evicted first.
    fn last_used(&self) -> Option<DateTime<Utc>> {
        match read_metadata(&self.path) {
            Ok(Some(metadata)) => Some(metadata.last_used()),
            _ => self.modified.map(DateTime::<Utc>::from),
        }
    }
}
