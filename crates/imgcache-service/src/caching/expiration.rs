use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;

/// Decides when a cache entry becomes stale, based on its creation time.
///
/// In configuration files this is written as one of `never`, `always_expired`,
/// `{days: 7}` or `{fixed_date: "2030-01-01T00:00:00Z"}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawExpirationPolicy")]
pub enum ExpirationPolicy {
    /// Entries never expire.
    Never,
    /// Entries expire the given number of days after they were created.
    Days(u32),
    /// Entries expire once the clock passes the given date, regardless of their age.
    FixedDate(DateTime<Utc>),
    /// Entries are stale as soon as they are written.
    AlwaysExpired,
}

impl Default for ExpirationPolicy {
    fn default() -> Self {
        Self::Days(7)
    }
}

impl ExpirationPolicy {
    /// Returns `true` if an entry created at `created_at` is stale at `now`.
    pub fn is_expired(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match *self {
            Self::Never => false,
            Self::Days(days) => now - created_at >= TimeDelta::days(i64::from(days)),
            Self::FixedDate(date) => now >= date,
            Self::AlwaysExpired => true,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawExpirationPolicy {
    Named(String),
    Days { days: u32 },
    FixedDate { fixed_date: DateTime<Utc> },
}

impl TryFrom<RawExpirationPolicy> for ExpirationPolicy {
    type Error = String;

    fn try_from(raw: RawExpirationPolicy) -> Result<Self, Self::Error> {
        match raw {
            RawExpirationPolicy::Named(name) => match name.as_str() {
                "never" => Ok(Self::Never),
                "always_expired" => Ok(Self::AlwaysExpired),
                other => Err(format!(
                    "unknown expiration policy `{other}`, expected `never`, `always_expired`, \
                     `days` or `fixed_date`"
                )),
            },
            RawExpirationPolicy::Days { days } => Ok(Self::Days(days)),
            RawExpirationPolicy::FixedDate { fixed_date } => Ok(Self::FixedDate(fixed_date)),
        }
    }
}
