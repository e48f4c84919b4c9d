use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::Image;

use super::CacheKey;

/// A cached image together with its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub image: Image,
    /// The cost of this entry in bytes, as accounted by the tier it was read from.
    pub byte_size: u64,
    /// The validator the origin sent along with the image.
    pub etag: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    /// How often the entry was read. Only tracked by the memory tier.
    pub access_count: u64,
}

impl CacheEntry {
    /// Creates a fresh entry, accounted by its decoded size.
    pub fn new(key: CacheKey, image: Image, etag: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            key,
            byte_size: image.decoded_size(),
            image,
            etag,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
        }
    }
}

/// The metadata record persisted next to every image payload on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_accessed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl Metadata {
    pub fn for_entry(entry: &CacheEntry) -> Self {
        Self {
            created_at: entry.created_at,
            last_accessed_at: Some(entry.last_accessed_at),
            etag: entry.etag.clone(),
        }
    }

    /// The time used to order entries for eviction.
    pub fn last_used(&self) -> DateTime<Utc> {
        self.last_accessed_at.unwrap_or(self.created_at)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_metadata_format() {
        let created_at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let metadata = Metadata {
            created_at,
            last_accessed_at: None,
            etag: Some("\"abc\"".into()),
        };

        let json = serde_json::to_string(&metadata).unwrap();
        assert_eq!(json, r#"{"created_at":1700000000123,"etag":"\"abc\""}"#);

        let parsed: Metadata = serde_json::from_str(r#"{"created_at":1700000000123}"#).unwrap();
        assert_eq!(parsed.created_at, created_at);
        assert_eq!(parsed.last_used(), created_at);
        assert_eq!(parsed.etag, None);
    }
}
