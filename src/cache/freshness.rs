//! Freshness policy
//!
//! Decides whether a cached value may be served without a refresh.

use chrono::{DateTime, Duration, Utc};

/// Timestamp of an entry that was never fetched
pub const NEVER_FETCHED: DateTime<Utc> = DateTime::UNIX_EPOCH;

/// Returns true if an entry fetched at `fetched_at` is still fresh at `now`
///
/// The boundary is inclusive: an entry whose age is exactly `ttl` is fresh.
/// The `NEVER_FETCHED` sentinel is never fresh, whatever the TTL.
pub fn is_fresh(fetched_at: DateTime<Utc>, now: DateTime<Utc>, ttl: Duration) -> bool {
    if fetched_at == NEVER_FETCHED {
        return false;
    }
    now.signed_duration_since(fetched_at) <= ttl
}
