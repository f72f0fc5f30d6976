//! Passage timestamp windows.
//!
//! Cookie tokens expire a fixed number of minutes after issue. Query tokens
//! are only accepted close to the current time, in both directions, since
//! they travel in URLs that can be bookmarked or shared.

use crate::clock::Clock;

/// Why a timestamp falls outside its window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowViolation {
    /// Issued too long ago.
    Expired {
        /// Age of the token in seconds.
        age_seconds: i64,
    },
    /// Issued too far in the future.
    FromFuture {
        /// How far ahead of now the timestamp is.
        ahead_seconds: i64,
    },
}

/// Check a cookie token's issue time against its passed lifetime.
///
/// Valid while `now - issued_at <= lifetime_minutes * 60`. Future timestamps
/// are not bounded here; the hash binds them to the queue secret.
pub fn check_cookie_age<C: Clock + ?Sized>(
    issued_at: i64,
    lifetime_minutes: u64,
    clock: &C,
) -> Result<(), WindowViolation> {
    let age_seconds = clock.unix_seconds().saturating_sub(issued_at);
    let lifetime_seconds = (lifetime_minutes as i64).saturating_mul(60);

    if age_seconds > lifetime_seconds {
        return Err(WindowViolation::Expired { age_seconds });
    }

    Ok(())
}

/// Check a query token's timestamp is within `limit_seconds` of now.
pub fn check_query_window<C: Clock + ?Sized>(
    timestamp: i64,
    limit_seconds: u64,
    clock: &C,
) -> Result<(), WindowViolation> {
    let now = clock.unix_seconds();
    let limit = limit_seconds as i64;

    if timestamp > now.saturating_add(limit) {
        return Err(WindowViolation::FromFuture {
            ahead_seconds: timestamp.saturating_sub(now),
        });
    }

    if timestamp < now.saturating_sub(limit) {
        return Err(WindowViolation::Expired {
            age_seconds: now.saturating_sub(timestamp),
        });
    }

    Ok(())
}
