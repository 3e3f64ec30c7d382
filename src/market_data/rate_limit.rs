// =============================================================================
// Rate-Limit Tracker — backs off after the quote API answers 429
// =============================================================================
//
// The public quote API throttles per IP and answers `429 Too Many Requests`,
// usually with a `Retry-After` header in seconds.  After such a response the
// tracker arms a cooldown; until it expires every fetch fails fast with
// `FetchError::RateLimited` instead of hitting the API again.
//
// State lives in atomics so any task may query it without locking.
// =============================================================================

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::Serialize;
use tracing::{debug, warn};

/// Cooldown applied when a 429 carries no usable `Retry-After`.
const DEFAULT_COOLDOWN_SECS: u64 = 60;
/// Upper bound on any cooldown, whatever the server asks for.
const MAX_COOLDOWN_SECS: u64 = 600;

/// Thread-safe cooldown tracker backed by atomic counters.
pub struct RateLimitTracker {
    cooldown_until_ms: AtomicI64,
    throttled_total: AtomicU32,
}

/// Serialisable view of the tracker for the status feed.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitSnapshot {
    pub cooling_down: bool,
    pub cooldown_remaining_secs: u64,
    pub throttled_total: u32,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            cooldown_until_ms: AtomicI64::new(0),
            throttled_total: AtomicU32::new(0),
        }
    }

    /// Inspect a response; a 429 arms the cooldown.
    pub fn observe(&self, status: StatusCode, headers: &HeaderMap, now_ms: i64) {
        if status != StatusCode::TOO_MANY_REQUESTS {
            return;
        }

        let retry_after = headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_COOLDOWN_SECS)
            .min(MAX_COOLDOWN_SECS);

        let until = now_ms + (retry_after as i64) * 1000;
        self.cooldown_until_ms.fetch_max(until, Ordering::Relaxed);
        let total = self.throttled_total.fetch_add(1, Ordering::Relaxed) + 1;

        warn!(
            retry_after_secs = retry_after,
            throttled_total = total,
            "quote API rate limit hit — cooling down"
        );
    }

    /// `Err(remaining_secs)` while a cooldown is active.
    pub fn check(&self, now_ms: i64) -> Result<(), u64> {
        let until = self.cooldown_until_ms.load(Ordering::Relaxed);
        if now_ms >= until {
            return Ok(());
        }
        let remaining = ((until - now_ms) as u64).div_ceil(1000);
        debug!(remaining_secs = remaining, "request suppressed during cooldown");
        Err(remaining)
    }

    pub fn snapshot(&self, now_ms: i64) -> RateLimitSnapshot {
        let remaining = self.check(now_ms).err().unwrap_or(0);
        RateLimitSnapshot {
            cooling_down: remaining > 0,
            cooldown_remaining_secs: remaining,
            throttled_total: self.throttled_total.load(Ordering::Relaxed),
        }
    }
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("cooldown_until_ms", &self.cooldown_until_ms.load(Ordering::Relaxed))
            .field("throttled_total", &self.throttled_total.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn success_does_not_arm_cooldown() {
        let t = RateLimitTracker::new();
        t.observe(StatusCode::OK, &HeaderMap::new(), 1_000);
        assert!(t.check(1_000).is_ok());
        assert_eq!(t.snapshot(1_000).throttled_total, 0);
    }

    #[test]
    fn retry_after_header_sets_cooldown() {
        let t = RateLimitTracker::new();
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("30"));
        t.observe(StatusCode::TOO_MANY_REQUESTS, &headers, 0);

        assert_eq!(t.check(0), Err(30));
        assert_eq!(t.check(29_500), Err(1));
        assert!(t.check(30_000).is_ok());
    }

    #[test]
    fn missing_header_uses_default_and_cap_applies() {
        let t = RateLimitTracker::new();
        t.observe(StatusCode::TOO_MANY_REQUESTS, &HeaderMap::new(), 0);
        assert_eq!(t.check(0), Err(DEFAULT_COOLDOWN_SECS));

        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("86400"));
        t.observe(StatusCode::TOO_MANY_REQUESTS, &headers, 0);
        assert_eq!(t.check(0), Err(MAX_COOLDOWN_SECS));

        let snap = t.snapshot(0);
        assert!(snap.cooling_down);
        assert_eq!(snap.throttled_total, 2);
    }
}
