//! Passage token verification and generation.
//!
//! A passage token is a form-encoded field set ending in `qfh=<hex hmac>`.
//! The HMAC covers the normalized visitor identifier followed by every byte
//! of the token that precedes the final `qfh=`:
//!
//! ```text
//! qfqid=<id>&qfts=<unix>&qfa=<account>&qfq=<queue>&qfpt=<type>&qfh=<hmac>
//! \__________________________ signed ________________________/
//! ```
//!
//! Cookies carry the token as their value. Query strings carry it after
//! arbitrary other parameters, so the signed region starts at the last
//! `qfqid=` marker instead of the start of the string.
//!
//! Verification is total: every malformed input is a rejection, never a
//! panic or an error the caller has to handle.

use crate::clock::Clock;
use crate::crypto::{
    freshness::{check_cookie_age, check_query_window, WindowViolation},
    hash::{create_hash, hashes_match},
    identifier::process_identifier,
};
use thiserror::Error;
use url::form_urlencoded;

/// Hash field marker; the signed region ends where it starts.
pub const HASH_MARKER: &str = "qfh=";

/// Queue identifier marker; the query signed region starts here.
pub const QUEUE_ID_MARKER: &str = "qfqid=";

/// Queue name marker in passed query strings.
pub const QUEUE_NAME_MARKER: &str = "qfq=";

/// Default pass type for locally generated tokens.
pub const DEFAULT_PASS_TYPE: &str = "SafeGuard";

/// Why a token was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenRejection {
    /// No `qfh` field.
    #[error("no hash in token")]
    MissingHash,

    /// Nothing precedes the hash, so nothing was signed.
    #[error("token has an empty signed region")]
    EmptyPayload,

    /// No `qfqid` marker before the hash.
    #[error("no queue identifier in token")]
    MissingQueueIdentifier,

    /// No `qfts` field.
    #[error("no timestamp in token")]
    MissingTimestamp,

    /// `qfts` is not an integer.
    #[error("timestamp {0:?} is not numeric")]
    MalformedTimestamp(String),

    /// The recomputed hash differs from `qfh`.
    #[error("hash mismatch")]
    HashMismatch,

    /// The timestamp is outside its validity window.
    #[error("timestamp outside window: {0:?}")]
    Window(WindowViolation),
}

/// Sign `payload` for a visitor.
///
/// Returns the hex HMAC-SHA256 of `process_identifier(identifier) ++ payload`.
pub fn sign(secret: &str, identifier: &str, payload: &str) -> String {
    let mut data = String::with_capacity(identifier.len() + payload.len());
    data.push_str(process_identifier(identifier));
    data.push_str(payload);
    create_hash(secret, &data)
}

/// First value of a form field, decoded.
fn form_field(token: &str, key: &str) -> Option<String> {
    form_urlencoded::parse(token.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

fn parse_timestamp(token: &str) -> Result<i64, TokenRejection> {
    let raw = form_field(token, "qfts").ok_or(TokenRejection::MissingTimestamp)?;
    raw.trim()
        .parse::<i64>()
        .map_err(|_| TokenRejection::MalformedTimestamp(raw))
}

fn check_signature(
    secret: &str,
    identifier: &str,
    signed: &str,
    given_hash: &str,
) -> Result<(), TokenRejection> {
    let expected = sign(secret, identifier, signed);
    if !hashes_match(given_hash, &expected) {
        return Err(TokenRejection::HashMismatch);
    }
    Ok(())
}

/// Check a cookie token, reporting why it was rejected.
pub fn check_cookie_token<C: Clock + ?Sized>(
    secret: &str,
    lifetime_minutes: u64,
    cookie: &str,
    identifier: &str,
    clock: &C,
) -> Result<(), TokenRejection> {
    let given_hash = form_field(cookie, "qfh").ok_or(TokenRejection::MissingHash)?;
    let hash_pos = cookie.rfind(HASH_MARKER).ok_or(TokenRejection::MissingHash)?;
    if hash_pos == 0 {
        return Err(TokenRejection::EmptyPayload);
    }

    check_signature(secret, identifier, &cookie[..hash_pos], &given_hash)?;

    let issued_at = parse_timestamp(cookie)?;
    check_cookie_age(issued_at, lifetime_minutes, clock).map_err(TokenRejection::Window)
}

/// Check a passed query string, reporting why it was rejected.
pub fn check_query_token<C: Clock + ?Sized>(
    queue_secret: &str,
    query: &str,
    identifier: &str,
    time_limit_seconds: u64,
    clock: &C,
) -> Result<(), TokenRejection> {
    let hash_pos = query.rfind(HASH_MARKER).ok_or(TokenRejection::MissingHash)?;
    let given_hash = form_field(query, "qfh").ok_or(TokenRejection::MissingHash)?;

    let id_pos = query
        .rfind(QUEUE_ID_MARKER)
        .filter(|pos| *pos < hash_pos)
        .ok_or(TokenRejection::MissingQueueIdentifier)?;

    let timestamp = parse_timestamp(query)?;
    check_query_window(timestamp, time_limit_seconds, clock).map_err(TokenRejection::Window)?;

    check_signature(queue_secret, identifier, &query[id_pos..hash_pos], &given_hash)
}

/// Verify a passage cookie. Any defect yields `false`.
pub fn verify_cookie_token<C: Clock + ?Sized>(
    secret: &str,
    lifetime_minutes: u64,
    cookie: &str,
    identifier: &str,
    clock: &C,
) -> bool {
    match check_cookie_token(secret, lifetime_minutes, cookie, identifier, clock) {
        Ok(()) => true,
        Err(reason) => {
            tracing::debug!(%reason, "passage cookie rejected");
            false
        }
    }
}

/// Verify a passed query string. Any defect yields `false`.
pub fn verify_query_token<C: Clock + ?Sized>(
    queue_secret: &str,
    query: &str,
    identifier: &str,
    time_limit_seconds: u64,
    clock: &C,
) -> bool {
    match check_query_token(queue_secret, query, identifier, time_limit_seconds, clock) {
        Ok(()) => true,
        Err(reason) => {
            tracing::debug!(%reason, "passed query string rejected");
            false
        }
    }
}

/// Builder for signed passage tokens.
///
/// Produces the same field layout the queue servers issue, so the result is
/// accepted both as a cookie value and as a passed query string.
#[derive(Debug, Clone)]
pub struct PassageToken {
    account: String,
    queue_name: String,
    queue_id: String,
    pass_type: String,
    issued_at: i64,
}

impl PassageToken {
    /// Start a token for `queue_name` issued at `issued_at` (unix seconds).
    pub fn new(
        account: impl Into<String>,
        queue_name: impl Into<String>,
        queue_id: impl Into<String>,
        issued_at: i64,
    ) -> Self {
        Self {
            account: account.into(),
            queue_name: queue_name.into(),
            queue_id: queue_id.into(),
            pass_type: DEFAULT_PASS_TYPE.to_string(),
            issued_at,
        }
    }

    /// Override the pass type (`qfpt`).
    pub fn pass_type(mut self, pass_type: impl Into<String>) -> Self {
        self.pass_type = pass_type.into();
        self
    }

    /// The signed region, including the trailing separator.
    pub fn payload(&self) -> String {
        let issued_at = self.issued_at.to_string();
        let mut payload = String::new();
        for (key, value) in [
            ("qfqid", self.queue_id.as_str()),
            ("qfts", issued_at.as_str()),
            ("qfa", self.account.as_str()),
            ("qfq", self.queue_name.as_str()),
            ("qfpt", self.pass_type.as_str()),
        ] {
            payload.push_str(key);
            payload.push('=');
            payload.extend(form_urlencoded::byte_serialize(value.as_bytes()));
            payload.push('&');
        }
        payload
    }

    /// Sign for a visitor and return the complete token.
    pub fn sign(&self, secret: &str, identifier: &str) -> String {
        let payload = self.payload();
        let hash = sign(secret, identifier, &payload);
        format!("{}{}{}", payload, HASH_MARKER, hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;

    const SECRET: &str = "queue-secret-0123";
    const UA: &str = "Mozilla/5.0 (X11; Linux x86_64) Firefox/120.0";
    const NOW: i64 = 1_736_942_400;

    fn token_at(issued_at: i64) -> String {
        PassageToken::new("acme", "acme-sale", "b2c1d0e9", issued_at).sign(SECRET, UA)
    }

    #[test]
    fn test_token_layout() {
        let token = token_at(NOW);
        assert!(token.starts_with("qfqid=b2c1d0e9&qfts=1736942400&qfa=acme&qfq=acme-sale&qfpt=SafeGuard&qfh="));
        let hash = token.rsplit("qfh=").next().unwrap();
        assert_eq!(hash.len(), 64);
    }

    #[test]
    fn test_payload_values_are_form_encoded() {
        let token = PassageToken::new("acme", "a b&c", "id", NOW).payload();
        assert!(token.contains("qfq=a+b%26c&"));
    }

    #[test]
    fn test_cookie_valid() {
        let clock = MockClock::at_unix(NOW + 60);
        assert!(verify_cookie_token(SECRET, 20, &token_at(NOW), UA, &clock));
    }

    #[test]
    fn test_cookie_valid_until_lifetime_boundary() {
        let token = token_at(NOW);
        let at_limit = MockClock::at_unix(NOW + 20 * 60);
        let past_limit = MockClock::at_unix(NOW + 20 * 60 + 1);
        assert!(verify_cookie_token(SECRET, 20, &token, UA, &at_limit));
        assert_eq!(
            check_cookie_token(SECRET, 20, &token, UA, &past_limit),
            Err(TokenRejection::Window(WindowViolation::Expired {
                age_seconds: 20 * 60 + 1
            }))
        );
    }

    #[test]
    fn test_cookie_any_payload_mutation_fails() {
        let clock = MockClock::at_unix(NOW);
        let token = token_at(NOW);
        let hash_pos = token.rfind(HASH_MARKER).unwrap();

        for i in 0..hash_pos {
            let mut bytes = token.clone().into_bytes();
            bytes[i] = if bytes[i] == b'x' { b'y' } else { b'x' };
            let tampered = String::from_utf8(bytes).unwrap();
            assert!(
                !verify_cookie_token(SECRET, 20, &tampered, UA, &clock),
                "mutation at byte {} was accepted",
                i
            );
        }
    }

    #[test]
    fn test_cookie_wrong_secret() {
        let clock = MockClock::at_unix(NOW);
        assert_eq!(
            check_cookie_token("other-secret", 20, &token_at(NOW), UA, &clock),
            Err(TokenRejection::HashMismatch)
        );
    }

    #[test]
    fn test_cookie_bound_to_identifier() {
        let clock = MockClock::at_unix(NOW);
        assert!(!verify_cookie_token(SECRET, 20, &token_at(NOW), "curl/8.0", &clock));
    }

    #[test]
    fn test_cookie_identifier_qualifier_ignored() {
        let clock = MockClock::at_unix(NOW);
        let with_qualifier = format!("{} [FBAN/FBIOS]", UA);
        assert!(verify_cookie_token(SECRET, 20, &token_at(NOW), &with_qualifier, &clock));
    }

    #[test]
    fn test_cookie_malformed_inputs() {
        let clock = MockClock::at_unix(NOW);
        assert_eq!(
            check_cookie_token(SECRET, 20, "", UA, &clock),
            Err(TokenRejection::MissingHash)
        );
        assert_eq!(
            check_cookie_token(SECRET, 20, "qfts=1&qfq=x", UA, &clock),
            Err(TokenRejection::MissingHash)
        );
        assert_eq!(
            check_cookie_token(SECRET, 20, "qfh=abc", UA, &clock),
            Err(TokenRejection::EmptyPayload)
        );
        assert!(!verify_cookie_token(SECRET, 20, "%%%qfh=\u{0}", UA, &clock));
    }

    #[test]
    fn test_cookie_non_numeric_timestamp() {
        let clock = MockClock::at_unix(NOW);
        let payload = "qfqid=1&qfts=soon&qfq=q&";
        let cookie = format!("{}qfh={}", payload, sign(SECRET, UA, payload));
        assert_eq!(
            check_cookie_token(SECRET, 20, &cookie, UA, &clock),
            Err(TokenRejection::MalformedTimestamp("soon".to_string()))
        );
    }

    #[test]
    fn test_query_valid_with_leading_parameters() {
        let clock = MockClock::at_unix(NOW + 5);
        let query = format!("utm_source=mail&{}", token_at(NOW));
        assert!(verify_query_token(SECRET, &query, UA, 30, &clock));
    }

    #[test]
    fn test_query_window_both_directions() {
        let token = token_at(NOW);
        assert!(!verify_query_token(SECRET, &token, UA, 30, &MockClock::at_unix(NOW + 31)));
        assert!(!verify_query_token(SECRET, &token, UA, 30, &MockClock::at_unix(NOW - 31)));
        assert!(verify_query_token(SECRET, &token, UA, 30, &MockClock::at_unix(NOW - 30)));
    }

    #[test]
    fn test_query_missing_markers() {
        let clock = MockClock::at_unix(NOW);
        assert_eq!(
            check_query_token(SECRET, "qfts=1", UA, 30, &clock),
            Err(TokenRejection::MissingHash)
        );
        let no_id = format!("qfts={}&qfq=q&qfh=abc", NOW);
        assert_eq!(
            check_query_token(SECRET, &no_id, UA, 30, &clock),
            Err(TokenRejection::MissingQueueIdentifier)
        );
        let no_ts = "qfqid=1&qfq=q&qfh=abc";
        assert_eq!(
            check_query_token(SECRET, no_ts, UA, 30, &clock),
            Err(TokenRejection::MissingTimestamp)
        );
    }

    #[test]
    fn test_query_tampered_queue_name() {
        let clock = MockClock::at_unix(NOW);
        let query = token_at(NOW).replace("qfq=acme-sale", "qfq=acme-vip");
        assert_eq!(
            check_query_token(SECRET, &query, UA, 30, &clock),
            Err(TokenRejection::HashMismatch)
        );
    }

    #[test]
    fn test_sign_matches_manual_construction() {
        let expected = create_hash(SECRET, &format!("{}{}", UA, "qfqid=1&"));
        assert_eq!(sign(SECRET, UA, "qfqid=1&"), expected);
    }
}
