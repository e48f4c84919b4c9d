use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// An error that happens while writing to the disk tier.
///
/// Reads never fail with this error, a broken or unreadable entry is a cache miss.
#[derive(Debug, Error)]
pub enum DiskCacheError {
    /// The cache directory, or one of the fan-out directories below it, could not be created.
    #[error("failed to create cache directory `{}`", path.display())]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The image payload could not be written.
    #[error("failed to write image payload")]
    Write(#[source] io::Error),
    /// The metadata record could not be written or rewritten.
    #[error("failed to write entry metadata")]
    Metadata(#[source] io::Error),
    /// The image could not be encoded for persistence.
    #[error("failed to encode image")]
    Encode,
    /// A metadata record exists but does not parse.
    #[error("corrupted entry metadata")]
    Corrupted(#[source] serde_json::Error),
}
