use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use url::Url;

/// The stable identity of a cached image.
///
/// A key is the SHA-256 digest of a canonical identifier, usually the source URL. Equality and
/// hashing only look at the digest, the identifier is kept around for logging.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    identifier: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identifier)
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl CacheKey {
    /// Creates a key for an arbitrary identifier.
    pub fn new(identifier: impl Into<String>) -> Self {
        let identifier = identifier.into();
        let hash: [u8; 32] = Sha256::digest(identifier.as_bytes()).into();

        Self {
            identifier: identifier.into(),
            hash,
        }
    }

    /// Creates the key for an image fetched from `url`.
    pub fn from_url(url: &Url) -> Self {
        Self::new(url.as_str())
    }

    /// Returns the identifier this key was created from.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Returns the relative path for this cache key.
    ///
    /// The relative path is a sha-256 hash hex-formatted like so:
    /// `aa/bbccdd/eeff...`
    pub fn cache_path(&self) -> String {
        let mut path = format!("{:02x}/", self.hash[0]);
        for b in &self.hash[1..4] {
            let _ = write!(path, "{b:02x}");
        }
        path.push('/');
        for b in &self.hash[4..] {
            let _ = write!(path, "{b:02x}");
        }
        path
    }
}
