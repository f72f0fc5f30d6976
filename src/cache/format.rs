//! Shared store record format.
//!
//! A cached settings copy is two keys: the raw document under
//! [`SETTINGS_KEY`] and its download time under [`LAST_STORE_KEY`]. The
//! document is written first, so a reader that sees a fresh timestamp also
//! sees the document it belongs to.

use crate::clock::Clock;
use crate::protocol::models::SettingsDocument;
use crate::AdapterError;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Raw settings JSON.
pub const SETTINGS_KEY: &str = "QFSettings";

/// RFC 3339 time the settings were downloaded.
pub const LAST_STORE_KEY: &str = "QFLast_store";

/// Refresh lock.
pub const LOCK_KEY: &str = "QFLock";

/// State of the refresh lock. An absent lock key is `Unlocked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// A process is downloading settings.
    Locked,
    /// Nobody is downloading.
    Unlocked,
}

impl LockState {
    /// Stored value.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Locked => "Locked",
            Self::Unlocked => "Unlocked",
        }
    }

    /// Interpret a stored value; a missing or `Unlocked` value is unlocked.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            None | Some("Unlocked") => Self::Unlocked,
            // Includes a lock file whose contents are still being written.
            Some(_) => Self::Locked,
        }
    }
}

/// A parsed settings document with its download time.
#[derive(Debug, Clone)]
pub struct CachedSettings {
    /// The document, shared with in-flight requests.
    pub document: Arc<SettingsDocument>,

    /// When the document was downloaded.
    pub fetched_at: DateTime<Utc>,
}

impl CachedSettings {
    /// Wrap a document downloaded at `fetched_at`.
    pub fn new(document: Arc<SettingsDocument>, fetched_at: DateTime<Utc>) -> Self {
        Self {
            document,
            fetched_at,
        }
    }

    /// Rebuild a cached copy from the two store values.
    pub fn from_store(settings_json: &str, timestamp: &str) -> Result<Self, AdapterError> {
        let fetched_at = decode_timestamp(timestamp)?;
        let document = SettingsDocument::from_json(settings_json)?;
        Ok(Self::new(Arc::new(document), fetched_at))
    }

    /// Seconds since download.
    pub fn age_seconds(&self, clock: &dyn Clock) -> i64 {
        clock
            .now_utc()
            .signed_duration_since(self.fetched_at)
            .num_seconds()
    }

    /// Whether the copy is younger than `lifetime_seconds`.
    ///
    /// A download time slightly ahead of this process's clock counts as fresh.
    pub fn is_fresh(&self, lifetime_seconds: i64, clock: &dyn Clock) -> bool {
        self.age_seconds(clock) < lifetime_seconds
    }
}

/// Encode a download time for [`LAST_STORE_KEY`].
pub fn encode_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339()
}

/// Decode a [`LAST_STORE_KEY`] value.
pub fn decode_timestamp(value: &str) -> Result<DateTime<Utc>, AdapterError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AdapterError::CacheIO(format!("Invalid cache timestamp {:?}: {}", value, e)))
}
