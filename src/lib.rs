//! # Queuegate
//!
//! **Queue-Fair virtual waiting room adapter for Rust web servers.**
//!
//! Queuegate decides on every page request whether a visitor may see the
//! page or must first wait in a queue. Queue definitions and their activation
//! rules are downloaded from the vendor and cached; visitors who have been
//! through a queue carry an HMAC-signed passage token that is verified
//! locally, without a network call.
//!
//! ## Features
//!
//! - **Signed passage tokens** - HMAC-SHA256 over the visitor identifier and
//!   token fields, compared in constant time
//! - **Activation rules** - ordered And/Or rule lists over domain, path,
//!   query, cookies, or the full URL, with variants
//! - **Coordinated settings cache** - one download per account at a time,
//!   shared between processes through a lock file
//! - **Fail-soft** - vendor outages never error the page; settings loss is an
//!   explicit outcome with a configurable policy
//!
//! ## Quickstart
//!
//! ```no_run
//! use queuegate::{AdapterConfig, AdmissionController, RequestContext, Service};
//!
//! struct Page;
//!
//! impl Service for Page {
//!     fn get_cookie(&self, _name: &str) -> Option<String> {
//!         None
//!     }
//!     fn set_cookie(&mut self, _: &str, _: &str, _: i64, _: &str, _: Option<&str>) {}
//!     fn redirect(&mut self, _location: &str) {}
//! }
//!
//! fn main() -> Result<(), queuegate::AdapterError> {
//!     let controller = AdmissionController::new(AdapterConfig::new("acme", "account-secret"))?;
//!
//!     let request = RequestContext::new(
//!         "https://shop.example.com/sale",
//!         "203.0.113.9",
//!         "Mozilla/5.0",
//!     );
//!     if controller.go(&request, &mut Page) {
//!         // Serve the page.
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! - `account` / `account_secret` - from the vendor portal
//! - `query_time_limit_seconds` - how long a passed query string is accepted
//! - `settings_cache_location` - directory shared by all processes on a host
//! - `settings_failure_policy` - serve or block pages when settings are unavailable
//!
//! See [`AdapterConfig`] for full documentation.

#![deny(missing_docs)]

// Core modules
pub mod clock;
pub mod config;
pub mod errors;

// Crypto layer
pub mod crypto;

// Protocol layer
pub mod protocol;

// Client layer
pub mod client;

// Cache layer
pub mod cache;

// Policy layer
pub mod policy;

// Host seam
pub mod service;

// Controller (main public API)
pub mod controller;

// Re-exports for public API
pub use cache::settings::SettingsCache;
pub use cache::store::{FileStore, MemoryStore, SharedStore};
pub use client::http::{BlockingHttpClient, VendorClient};
pub use clock::{Clock, SystemClock};
pub use config::{AdapterConfig, AdapterFailurePolicy, AdapterMode, DebugSetting, FailurePolicy};
pub use controller::{Admission, AdmissionController};
pub use crypto::token::PassageToken;
pub use errors::AdapterError;
pub use protocol::models::SettingsDocument;
pub use service::{RequestContext, Service};

#[cfg(any(test, feature = "test-seams"))]
pub use clock::MockClock;
#[cfg(any(test, feature = "test-seams"))]
pub use service::{CookieWrite, Effect, RecordingService};
