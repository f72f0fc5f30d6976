//! Queuegate configuration.

use serde::{Deserialize, Deserializer};
use std::path::PathBuf;
use std::time::Duration;

/// Placeholder text shipped in vendor sample configs.
const PLACEHOLDER_MARKER: &str = "REPLACE WITH";

/// How the adapter treats a queue whose rules match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AdapterMode {
    /// Consult the adapter server before letting the visitor through.
    #[default]
    Safe,
    /// Send the visitor straight to the queue server.
    Simple,
}

impl AdapterMode {
    /// Parse a mode string as it appears in settings documents.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "safe" => Some(Self::Safe),
            "simple" => Some(Self::Simple),
            _ => None,
        }
    }
}

/// Which requests emit decision traces.
///
/// Deserializes from a boolean, the strings `"true"` / `"false"`, or an IP
/// address string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugSetting {
    /// `true` traces every request, `false` none.
    Flag(bool),
    /// Only requests from this remote address are traced.
    Ip(String),
}

impl Default for DebugSetting {
    fn default() -> Self {
        Self::Flag(false)
    }
}

impl<'de> Deserialize<'de> for DebugSetting {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            Text(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Flag(enabled) => Self::Flag(enabled),
            Raw::Text(text) => {
                let text = text.trim();
                if text.eq_ignore_ascii_case("true") {
                    Self::Flag(true)
                } else if text.is_empty() || text.eq_ignore_ascii_case("false") {
                    Self::Flag(false)
                } else {
                    Self::Ip(text.to_string())
                }
            }
        })
    }
}

impl DebugSetting {
    /// Whether decision traces are enabled for a request from `remote_addr`.
    pub fn applies_to(&self, remote_addr: &str) -> bool {
        match self {
            Self::Flag(enabled) => *enabled,
            Self::Ip(ip) => ip == remote_addr,
        }
    }
}

/// What to do with the page when no settings could ever be loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Serve the page.
    #[default]
    Open,
    /// Block the page.
    Closed,
}

/// What to do when a safe-mode adapter consult fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdapterFailurePolicy {
    /// Leave the queue unresolved and move on to the next queue.
    #[default]
    Proceed,
    /// Redirect the visitor to the queue server as simple mode would.
    SendToQueue,
}

/// Configuration for the admission adapter.
///
/// Account credentials are shown on the Your Account page of the vendor
/// portal. Everything else has a sensible default via [`AdapterConfig::new`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Account system name.
    pub account: String,

    /// Account secret, used only in the settings download path.
    pub account_secret: String,

    /// Host serving `queue-fair-settings.json`.
    pub files_server: String,

    /// Passed query strings are valid this many seconds either side of now.
    pub query_time_limit_seconds: u64,

    /// Decision trace scope.
    pub debug: DebugSetting,

    /// Network timeout for settings and adapter reads, in seconds.
    /// Also bounds how many poll intervals a waiter spends on another refresher.
    pub read_timeout_seconds: u64,

    /// Directory for the shared settings store.
    /// `None` uses `dirs::data_dir()/queuegate/<account>`.
    pub settings_cache_location: Option<PathBuf>,

    /// How long a downloaded settings document is used before refreshing.
    pub settings_cache_lifetime_minutes: u64,

    /// Redirect once to remove a validated passed string from the URL.
    pub strip_passed_string: bool,

    /// Default mode for matched queues; queues may override it.
    pub adapter_mode: AdapterMode,

    /// Page policy when settings are unavailable.
    pub settings_failure_policy: FailurePolicy,

    /// Queue policy when a safe-mode consult fails.
    pub adapter_failure_policy: AdapterFailurePolicy,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            account: String::new(),
            account_secret: String::new(),
            files_server: "files.queue-fair.net".to_string(),
            query_time_limit_seconds: 30,
            debug: DebugSetting::Flag(false),
            read_timeout_seconds: 5,
            settings_cache_location: Some(PathBuf::from("./QFCache")),
            settings_cache_lifetime_minutes: 5,
            strip_passed_string: true,
            adapter_mode: AdapterMode::Safe,
            settings_failure_policy: FailurePolicy::Open,
            adapter_failure_policy: AdapterFailurePolicy::Proceed,
        }
    }
}

impl AdapterConfig {
    /// Create a configuration for an account with vendor defaults.
    pub fn new(account: impl Into<String>, account_secret: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            account_secret: account_secret.into(),
            ..Self::default()
        }
    }

    /// Network read timeout.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_seconds)
    }

    /// Settings lifetime in seconds.
    pub fn settings_lifetime_seconds(&self) -> i64 {
        (self.settings_cache_lifetime_minutes * 60) as i64
    }

    /// Validate configuration for obvious errors.
    pub fn validate(&self) -> Result<(), crate::AdapterError> {
        if self.account.trim().is_empty() || self.account.contains(PLACEHOLDER_MARKER) {
            return Err(crate::AdapterError::ConfigError(
                "account must be set to the account system name".to_string(),
            ));
        }
        if self.account_secret.trim().is_empty() || self.account_secret.contains(PLACEHOLDER_MARKER)
        {
            return Err(crate::AdapterError::ConfigError(
                "account_secret must be set".to_string(),
            ));
        }
        if self.account.contains('/') || self.account_secret.contains('/') {
            return Err(crate::AdapterError::ConfigError(
                "account and account_secret cannot contain '/'".to_string(),
            ));
        }
        if self.files_server.trim().is_empty() {
            return Err(crate::AdapterError::ConfigError(
                "files_server cannot be empty".to_string(),
            ));
        }
        if self.read_timeout_seconds == 0 {
            return Err(crate::AdapterError::ConfigError(
                "read_timeout_seconds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
