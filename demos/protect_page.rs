//! Protecting a page with a waiting room.
//!
//! This example runs one admission check for a URL and prints what the host
//! would do with the response.
//!
//! # Running
//!
//! ```bash
//! export QUEUEGATE_ACCOUNT="your-account"
//! export QUEUEGATE_SECRET="your-account-secret"
//! RUST_LOG=queuegate=debug cargo run --example protect_page -- https://shop.example.com/sale
//! ```

use queuegate::{AdapterConfig, AdapterError, AdmissionController, RequestContext, Service};
use std::collections::HashMap;
use tracing_subscriber::EnvFilter;

/// Stand-in for a framework response: cookies in, headers out.
#[derive(Default)]
struct DemoPage {
    cookies: HashMap<String, String>,
    headers: Vec<String>,
}

impl Service for DemoPage {
    fn get_cookie(&self, name: &str) -> Option<String> {
        self.cookies.get(name).cloned()
    }

    fn set_cookie(
        &mut self,
        name: &str,
        value: &str,
        lifetime_seconds: i64,
        path: &str,
        domain: Option<&str>,
    ) {
        let mut header = format!(
            "Set-Cookie: {}={}; Max-Age={}; Path={}; SameSite=None; Secure",
            name, value, lifetime_seconds, path
        );
        if let Some(domain) = domain {
            header.push_str(&format!("; Domain={}", domain));
        }
        self.headers.push(header);
    }

    fn redirect(&mut self, location: &str) {
        self.headers.push(format!("Location: {}", location));
    }

    fn set_no_cache(&mut self) {
        self.headers
            .push("Cache-Control: no-store, max-age=0".to_string());
    }
}

fn main() -> Result<(), AdapterError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let account = std::env::var("QUEUEGATE_ACCOUNT").unwrap_or_default();
    let secret = std::env::var("QUEUEGATE_SECRET").unwrap_or_default();
    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "https://shop.example.com/".to_string());

    let mut config = AdapterConfig::new(account, secret);
    config.settings_cache_location = Some(std::env::temp_dir().join("queuegate-demo"));

    // Configuration errors surface here, before any request is handled.
    let controller = AdmissionController::new(config)?;

    let request = RequestContext::new(&url, "203.0.113.9", "Mozilla/5.0 (demo)");
    let mut page = DemoPage::default();
    let serve = controller.go(&request, &mut page);

    for header in &page.headers {
        println!("{}", header);
    }
    if serve {
        println!("✓ Serving {}", url);
    } else {
        println!("✗ Page withheld");
    }
    Ok(())
}
