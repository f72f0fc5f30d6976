//! Reqwest-based HTTP client for the vendor files and adapter servers.
//!
//! Both endpoints are plain GETs returning JSON. Requests and connects are
//! bounded by the configured read timeout; a timed-out request is a failure
//! and is never retried within the same page request.

use crate::config::AdapterConfig;
use crate::crypto::identifier::process_identifier;
use crate::protocol::models::Queue;
use crate::AdapterError;
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, USER_AGENT};
use std::time::Duration;
use url::form_urlencoded;

/// Transport used for settings downloads and adapter consults.
pub trait VendorClient: Send + Sync {
    /// GET `url` and return the body of a 2xx response.
    fn get_text(&self, url: &str) -> Result<String, AdapterError>;
}

/// Blocking reqwest client.
pub struct BlockingHttpClient {
    client: Client,
    user_agent: String,
    timeout: Duration,
}

impl BlockingHttpClient {
    /// Create a client whose request and connect timeouts are the configured
    /// read timeout.
    pub fn new(config: &AdapterConfig) -> Result<Self, AdapterError> {
        Self::with_timeout(config.read_timeout())
    }

    /// Create a client with an explicit timeout.
    pub fn with_timeout(timeout: Duration) -> Result<Self, AdapterError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| AdapterError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            user_agent: build_user_agent(),
            timeout,
        })
    }

    /// Configured timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl VendorClient for BlockingHttpClient {
    fn get_text(&self, url: &str) -> Result<String, AdapterError> {
        let response = self
            .client
            .get(url)
            .header(USER_AGENT, &self.user_agent)
            .header(ACCEPT, "application/json")
            .send()
            .map_err(|e| AdapterError::Transport(format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AdapterError::Transport(format!(
                "Unexpected status {}",
                status.as_u16()
            )));
        }

        response
            .text()
            .map_err(|e| AdapterError::Transport(format!("Failed to read body: {}", e)))
    }
}

/// Build the User-Agent sent to vendor servers.
///
/// Format: `queuegate/<version>`
pub fn build_user_agent() -> String {
    format!("queuegate/{}", env!("CARGO_PKG_VERSION"))
}

/// Form-encode a query parameter value.
pub fn encode(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Decode a form-encoded value, `+` included. Invalid UTF-8 is an error.
pub fn decode(value: &str) -> Result<String, AdapterError> {
    let spaced = value.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|decoded| decoded.into_owned())
        .map_err(|e| AdapterError::Protocol(format!("Invalid encoding: {}", e)))
}

/// Settings document URL for the configured account.
///
/// The account secret is part of the path, so this URL must never be logged.
pub fn settings_url(config: &AdapterConfig) -> String {
    format!(
        "https://{}/{}/{}/queue-fair-settings.json",
        config.files_server, config.account, config.account_secret
    )
}

/// Adapter consult URL for one visitor and queue.
///
/// `uid` is omitted until the vendor has assigned one.
pub fn adapter_url(queue: &Queue, remote_addr: &str, uid: Option<&str>, user_agent: &str) -> String {
    let mut url = format!(
        "https://{}/adapter/{}?ipaddress={}",
        queue.adapter_server,
        queue.name,
        encode(remote_addr)
    );

    if let Some(uid) = uid {
        url.push_str("&uid=");
        url.push_str(&encode(uid));
    }

    url.push_str("&identifier=");
    url.push_str(&encode(process_identifier(user_agent)));
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::models::SettingsDocument;

    fn test_queue() -> Queue {
        let doc = SettingsDocument::from_json(
            r#"{"queues":[{"name":"acme-sale","adapterServer":"acme.queue-fair.net"}]}"#,
        )
        .unwrap();
        doc.queues.into_iter().next().unwrap()
    }

    #[test]
    fn test_build_user_agent() {
        let ua = build_user_agent();
        assert_eq!(ua, format!("queuegate/{}", env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_settings_url() {
        let config = AdapterConfig::new("acme", "s3cret");
        assert_eq!(
            settings_url(&config),
            "https://files.queue-fair.net/acme/s3cret/queue-fair-settings.json"
        );
    }

    #[test]
    fn test_adapter_url_without_uid() {
        let url = adapter_url(&test_queue(), "203.0.113.9", None, "Mozilla/5.0 (X11)");
        assert_eq!(
            url,
            "https://acme.queue-fair.net/adapter/acme-sale?ipaddress=203.0.113.9&identifier=Mozilla%2F5.0+%28X11%29"
        );
    }

    #[test]
    fn test_adapter_url_with_uid_and_qualifier() {
        let ua = "Mozilla/5.0 (Linux; Android) [FBAN/FBIOS;FBAV/1]";
        let url = adapter_url(&test_queue(), "::1", Some("u 1&2"), ua);
        assert!(url.contains("ipaddress=%3A%3A1"));
        assert!(url.contains("&uid=u+1%262&"));
        assert!(url.ends_with(&format!("identifier={}", encode("Mozilla/5.0 (Linux; Android) "))));
    }

    #[test]
    fn test_decode() {
        assert_eq!(decode("qfqid%3D1%26qfts%3D2").unwrap(), "qfqid=1&qfts=2");
        assert_eq!(decode("a+b%2Bc").unwrap(), "a b+c");
        assert!(decode("%FF").is_err());
    }

    #[test]
    fn test_client_creation() {
        let config = AdapterConfig::new("acme", "s3cret");
        let client = BlockingHttpClient::new(&config).unwrap();
        assert_eq!(client.timeout(), Duration::from_secs(5));
    }
}
