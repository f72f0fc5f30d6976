//! Host web framework seam.
//!
//! The controller never touches HTTP directly. It reads cookies and emits
//! cookie writes and redirects through [`Service`], which the host implements
//! over its own request and response types.

use crate::policy::component::query_of;

/// Cookie and redirect operations on the current request.
pub trait Service {
    /// Value of a request cookie.
    fn get_cookie(&self, name: &str) -> Option<String>;

    /// Set a response cookie. A zero lifetime clears it.
    fn set_cookie(
        &mut self,
        name: &str,
        value: &str,
        lifetime_seconds: i64,
        path: &str,
        domain: Option<&str>,
    );

    /// Redirect the visitor.
    fn redirect(&mut self, location: &str);

    /// Mark the response uncacheable. Called once, before the first cookie
    /// write or redirect of a request.
    fn set_no_cache(&mut self) {}
}

/// What the controller needs to know about a request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Full requested URL, as the visitor sees it.
    pub requested_url: String,

    /// Raw query string, without the `?`.
    pub query: String,

    /// Visitor address; behind a proxy, the forwarded client address.
    pub remote_addr: String,

    /// Visitor User-Agent.
    pub user_agent: String,

    /// Label passed to the queue server as `qfx`.
    pub extra: Option<String>,
}

impl RequestContext {
    /// Describe a request. The query is taken from the URL.
    pub fn new(
        requested_url: impl Into<String>,
        remote_addr: impl Into<String>,
        user_agent: impl Into<String>,
    ) -> Self {
        let requested_url = requested_url.into();
        let query = query_of(&requested_url).to_string();
        Self {
            requested_url,
            query,
            remote_addr: remote_addr.into(),
            user_agent: user_agent.into(),
            extra: None,
        }
    }

    /// Use a query string other than the URL's, e.g. one rewritten by a proxy.
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }

    /// Attach an extra label for the queue server.
    pub fn with_extra(mut self, extra: impl Into<String>) -> Self {
        self.extra = Some(extra.into()).filter(|e: &String| !e.is_empty());
        self
    }
}

/// A cookie written through [`RecordingService`].
#[cfg(any(test, feature = "test-seams"))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieWrite {
    /// Cookie name.
    pub name: String,
    /// Cookie value.
    pub value: String,
    /// Max-age in seconds.
    pub lifetime_seconds: i64,
    /// Cookie path.
    pub path: String,
    /// Cookie domain; `None` is host-only.
    pub domain: Option<String>,
}

/// A response side effect, in the order it was issued.
#[cfg(any(test, feature = "test-seams"))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Cookie written, by name.
    Cookie(String),
    /// Redirect issued, by location.
    Redirect(String),
}

/// In-memory [`Service`] that records every side effect.
#[cfg(any(test, feature = "test-seams"))]
#[derive(Debug, Default)]
pub struct RecordingService {
    /// Cookies the visitor sent.
    pub request_cookies: std::collections::HashMap<String, String>,
    /// Names passed to `get_cookie`, in order.
    pub cookie_reads: std::cell::RefCell<Vec<String>>,
    /// Cookies written, in order.
    pub cookie_writes: Vec<CookieWrite>,
    /// Redirects issued, in order.
    pub redirects: Vec<String>,
    /// Cookie writes and redirects interleaved as issued.
    pub effects: Vec<Effect>,
    /// Number of `set_no_cache` calls.
    pub no_cache_calls: usize,
}

#[cfg(any(test, feature = "test-seams"))]
impl RecordingService {
    /// Service with no request cookies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a request cookie.
    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_cookies.insert(name.into(), value.into());
        self
    }

    /// Last write of the named cookie.
    pub fn written(&self, name: &str) -> Option<&CookieWrite> {
        self.cookie_writes.iter().rev().find(|c| c.name == name)
    }
}

#[cfg(any(test, feature = "test-seams"))]
impl Service for RecordingService {
    fn get_cookie(&self, name: &str) -> Option<String> {
        self.cookie_reads.borrow_mut().push(name.to_string());
        self.request_cookies.get(name).cloned()
    }

    fn set_cookie(
        &mut self,
        name: &str,
        value: &str,
        lifetime_seconds: i64,
        path: &str,
        domain: Option<&str>,
    ) {
        self.effects.push(Effect::Cookie(name.to_string()));
        self.cookie_writes.push(CookieWrite {
            name: name.to_string(),
            value: value.to_string(),
            lifetime_seconds,
            path: path.to_string(),
            domain: domain.map(str::to_string),
        });
    }

    fn redirect(&mut self, location: &str) {
        self.effects.push(Effect::Redirect(location.to_string()));
        self.redirects.push(location.to_string());
    }

    fn set_no_cache(&mut self) {
        self.no_cache_calls += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_context_takes_query_from_url() {
        let request = RequestContext::new(
            "https://shop.example.com/sale?qfqid=1&qfq=acme-sale",
            "203.0.113.9",
            "Mozilla/5.0",
        );
        assert_eq!(request.query, "qfqid=1&qfq=acme-sale");
        assert_eq!(request.extra, None);
    }

    #[test]
    fn test_request_context_overrides() {
        let request = RequestContext::new("https://shop.example.com/", "::1", "ua")
            .with_query("a=b")
            .with_extra("vip");
        assert_eq!(request.query, "a=b");
        assert_eq!(request.extra.as_deref(), Some("vip"));

        let blank = RequestContext::new("https://shop.example.com/", "::1", "ua").with_extra("");
        assert_eq!(blank.extra, None);
    }

    #[test]
    fn test_recording_service() {
        let mut service = RecordingService::new().with_cookie("a", "1");
        assert_eq!(service.get_cookie("a").as_deref(), Some("1"));
        assert_eq!(service.get_cookie("b"), None);

        service.set_cookie("a", "2", 60, "/", None);
        service.set_cookie("a", "", 0, "/", Some(".example.com"));
        assert_eq!(service.written("a").unwrap().lifetime_seconds, 0);
        assert_eq!(service.cookie_writes.len(), 2);
        // Writes do not change what the visitor sent.
        assert_eq!(service.get_cookie("a").as_deref(), Some("1"));

        service.redirect("https://q.example/");
        assert_eq!(
            service.effects,
            vec![
                Effect::Cookie("a".to_string()),
                Effect::Cookie("a".to_string()),
                Effect::Redirect("https://q.example/".to_string()),
            ]
        );
        assert_eq!(*service.cookie_reads.borrow(), vec!["a", "b", "a"]);
    }
}
