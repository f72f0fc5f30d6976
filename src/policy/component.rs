//! Request component extraction for activation rules.
//!
//! Path and query are cut from the raw URL string rather than a parsed URL,
//! so percent-encoding and dot segments reach the rule exactly as requested.

use crate::protocol::models::{Component, Rule};
use url::Url;

/// Extract the part of the request a rule inspects.
///
/// Returns `None` only when the component is absent: an unparsable host for
/// `Domain`, or a cookie that is not set.
pub fn extract_component<F>(rule: &Rule, request_url: &str, cookie: &F) -> Option<String>
where
    F: Fn(&str) -> Option<String> + ?Sized,
{
    match rule.component {
        Component::Domain => host_of(request_url),
        Component::Path => Some(path_of(request_url).to_string()),
        Component::Query => Some(query_of(request_url).to_string()),
        Component::Cookie => rule.name.as_deref().and_then(cookie),
        Component::Url => Some(request_url.to_string()),
    }
}

/// URL host, lowercased by the URL parser.
pub fn host_of(request_url: &str) -> Option<String> {
    Url::parse(request_url)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
}

/// URL path with scheme, host, and port removed and query and fragment cut.
/// An empty path is `/`.
pub fn path_of(request_url: &str) -> &str {
    let rest = request_url
        .strip_prefix("https://")
        .or_else(|| request_url.strip_prefix("http://"))
        .unwrap_or(request_url);

    let authority_end = rest
        .find(|c| matches!(c, '/' | '?' | '#'))
        .unwrap_or(rest.len());
    let mut path = &rest[authority_end..];

    if let Some(pos) = path.find('#') {
        path = &path[..pos];
    }
    if let Some(pos) = path.find('?') {
        path = &path[..pos];
    }

    if path.is_empty() {
        "/"
    } else {
        path
    }
}

/// Everything after the first `?`, or empty.
pub fn query_of(request_url: &str) -> &str {
    request_url
        .find('?')
        .map(|pos| &request_url[pos + 1..])
        .unwrap_or("")
}
