use std::fs::{read_dir, remove_dir, remove_dir_all};
use std::io;
use std::path::Path;

use super::DiskCache;
use super::fs::{
    METADATA_EXTENSION, PAYLOAD_EXTENSION, catch_not_found, has_extension, metadata_path,
    payload_path, read_metadata, remove_if_exists,
};

/// The outcome of a [`DiskCache::cleanup`] pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    pub removed_dirs: usize,
    pub removed_files: usize,
    pub removed_bytes: u64,

    pub retained_files: usize,
    pub retained_bytes: u64,
}

impl DiskCache {
    /// Walks the whole cache and removes everything that can no longer be served.
    ///
    /// That is expired entries, payloads without metadata, metadata without payloads, leftover
    /// temporary files and empty directories.
    pub fn cleanup(&self) -> io::Result<CleanupStats> {
        let _guard = self.lock();
        tracing::info!("Cleaning up disk cache at `{}`", self.images_dir().display());

        // No write is in progress while we hold the lock, so every temp file is stale.
        if let Some(()) = catch_not_found(|| remove_dir_all(self.tmp_dir()))? {
            tracing::debug!("Removed temporary files");
        }
        std::fs::create_dir_all(self.tmp_dir())?;

        let mut stats = CleanupStats::default();
        self.cleanup_directory_recursive(self.images_dir(), &mut stats)?;

        tracing::info!(
            "Retained {} files, totaling {} bytes",
            stats.retained_files,
            stats.retained_bytes,
        );
        tracing::info!(
            "Removed {} directories and {} files, totaling {} bytes",
            stats.removed_dirs,
            stats.removed_files,
            stats.removed_bytes
        );

        metric!(gauge("caches.size.files") = stats.retained_files as u64);
        metric!(gauge("caches.size.bytes") = stats.retained_bytes);
        metric!(counter("caches.size.files_removed") += stats.removed_files as i64);
        metric!(counter("caches.size.bytes_removed") += stats.removed_bytes as i64);

        Ok(stats)
    }

    /// Cleans up the directory recursively, returning `true` if the directory is left empty after cleanup.
    fn cleanup_directory_recursive(
        &self,
        directory: &Path,
        stats: &mut CleanupStats,
    ) -> io::Result<bool> {
        let entries = match catch_not_found(|| read_dir(directory))? {
            Some(x) => x,
            None => {
                tracing::warn!("Directory not found: `{}`", directory.display());
                return Ok(true);
            }
        };
        tracing::debug!("Cleaning directory `{}`", directory.display());

        let mut is_empty = true;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                let mut dir_is_empty = self.cleanup_directory_recursive(&path, stats)?;
                if dir_is_empty {
                    if let Err(e) = remove_dir(&path) {
                        tracing::error!(
                            error = &e as &dyn std::error::Error,
                            path = %path.display(),
                            "Failed to clean cache directory",
                        );
                        dir_is_empty = false;
                    } else {
                        stats.removed_dirs += 1;
                    }
                }
                is_empty &= dir_is_empty;
            } else {
                match self.try_cleanup_path(&path, stats) {
                    Err(e) => {
                        tracing::error!(
                            error = &e as &dyn std::error::Error,
                            path = %path.display(),
                            "Failed to clean cache file",
                        );
                        is_empty = false;
                    }
                    Ok(file_removed) => is_empty &= file_removed,
                }
            }
        }

        Ok(is_empty)
    }

    /// Tries to clean up the file at `path`, returning `true` if it was removed.
    fn try_cleanup_path(&self, path: &Path, stats: &mut CleanupStats) -> io::Result<bool> {
        tracing::trace!("Checking file `{}`", path.display());
        let Some(file_metadata) = catch_not_found(|| path.metadata())? else {
            // Removed together with its sibling earlier in this pass.
            return Ok(true);
        };
        let size = file_metadata.len();

        let keep = if has_extension(path, PAYLOAD_EXTENSION) {
            self.is_live(path)
        } else if has_extension(path, METADATA_EXTENSION) {
            let payload_path = payload_path(path);
            payload_path.is_file() && self.is_live(&payload_path)
        } else {
            false
        };

        if keep {
            stats.retained_bytes += size;
            stats.retained_files += 1;
            return Ok(false);
        }

        tracing::debug!("Removing file `{}`", path.display());
        if remove_if_exists(path)? {
            stats.removed_bytes += size;
            stats.removed_files += 1;
        }

        // An expired or orphaned payload takes its metadata record along.
        if has_extension(path, PAYLOAD_EXTENSION) {
            let metadata_path = metadata_path(path);
            if let Some(metadata) = catch_not_found(|| metadata_path.metadata())? {
                if remove_if_exists(&metadata_path)? {
                    stats.removed_bytes += metadata.len();
                    stats.removed_files += 1;
                }
            }
        }

        Ok(true)
    }

    /// Whether the pair belonging to `payload_path` has readable, unexpired metadata.
    fn is_live(&self, payload_path: &Path) -> bool {
        match read_metadata(payload_path) {
            Ok(Some(metadata)) => !self
                .expiration()
                .is_expired(metadata.created_at, self.now()),
            _ => false,
        }
    }
}
