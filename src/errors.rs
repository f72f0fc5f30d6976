//! Queuegate error types.

use thiserror::Error;

/// Errors that can occur while loading settings or consulting the vendor.
///
/// None of these reach the page-serving path: the controller logs them and
/// degrades to a decision.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Configuration is invalid.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// HTTP transport error talking to the files or adapter server.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A vendor response could not be interpreted.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The settings document failed load-time validation.
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    /// Shared store I/O error.
    #[error("Cache I/O error: {0}")]
    CacheIO(String),
}
