//! File system helpers shared by the disk tier and its cleanup.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use super::Metadata;

/// File extension of image payloads.
pub const PAYLOAD_EXTENSION: &str = "img";
/// File extension of metadata records.
pub const METADATA_EXTENSION: &str = "meta";

// `cleanup` or `remove_all` may remove the directories we are operating in from under us,
// so the fs operations below are retried a couple of times.
const MAX_RETRIES: usize = 2;

/// Returns the path of the metadata record belonging to `payload_path`.
pub fn metadata_path(payload_path: &Path) -> PathBuf {
    payload_path.with_extension(METADATA_EXTENSION)
}

/// Returns the path of the payload belonging to `metadata_path`.
pub fn payload_path(metadata_path: &Path) -> PathBuf {
    metadata_path.with_extension(PAYLOAD_EXTENSION)
}

pub fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension().is_some_and(|ext| ext == extension)
}

/// Creates a new temporary file inside of `tmp_dir`.
fn tempfile_in(tmp_dir: &Path) -> io::Result<NamedTempFile> {
    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = fs::create_dir_all(tmp_dir) {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                path = %tmp_dir.display(),
                "Failed to create temp directory",
            );
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match tempfile::Builder::new().prefix("tmp").tempfile_in(tmp_dir) {
            Ok(temp_file) => return Ok(temp_file),
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %tmp_dir.display(),
                    "Failed to create temp file",
                );
                if retries > MAX_RETRIES {
                    return Err(e);
                }
            }
        }
    }
}

/// Moves `temp_file` to `cache_path`, creating parent directories as needed.
fn persist_tempfile(mut temp_file: NamedTempFile, cache_path: &Path) -> io::Result<()> {
    let parent = cache_path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;

    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = fs::create_dir_all(parent) {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                path = %parent.display(),
                "Failed to create cache directory",
            );
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(cache_path) {
            Ok(_) => return Ok(()),
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    path = %cache_path.display(),
                    "Failed to persist cache file",
                );
                if retries > MAX_RETRIES {
                    return Err(err);
                }
            }
        }
    }
}

/// Atomically replaces the contents of `path` with `contents`.
///
/// The data is first written to a temporary file in `tmp_dir`, which must live on the same file
/// system as `path`, and then renamed into place. Readers never observe a partial file.
pub fn write_atomic(tmp_dir: &Path, path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut temp_file = tempfile_in(tmp_dir)?;
    temp_file.write_all(contents)?;
    temp_file.flush()?;
    persist_tempfile(temp_file, path)
}

/// Writes the metadata record for the payload at `payload_path`.
pub fn write_metadata(tmp_dir: &Path, payload_path: &Path, metadata: &Metadata) -> io::Result<()> {
    let contents = serde_json::to_vec(metadata)?;
    write_atomic(tmp_dir, &metadata_path(payload_path), &contents)
}

/// Reads the metadata record for the payload at `payload_path`.
///
/// Returns `Ok(None)` if there is no record.
pub fn read_metadata(payload_path: &Path) -> io::Result<Option<Metadata>> {
    catch_not_found(|| {
        let contents = fs::read(metadata_path(payload_path))?;
        Ok(serde_json::from_slice(&contents)?)
    })
}

/// Removes `path`, treating a missing file as success.
///
/// Returns `true` if a file was removed.
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    Ok(catch_not_found(|| fs::remove_file(path))?.is_some())
}

pub fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
