//! In-memory per-client rate limiting.
//!
//! Clients are identified by a fingerprint of IP and User-Agent. Two
//! rolling windows apply: 100 requests per minute and 1000 per day.
//! `is_allowed` is linearizable: the whole check-and-record runs under one
//! mutex. Entries idle for 24 hours are swept.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

pub const MINUTE_LIMIT: usize = 100;
pub const DAY_LIMIT: usize = 1000;

const MINUTE: Duration = Duration::from_secs(60);
const DAY: Duration = Duration::from_secs(86_400);

/// Outcome of a rate-limit check. On denial carries the seconds the client
/// should wait before retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited { retry_after_secs: u64 },
}

#[derive(Debug)]
pub struct RateLimiter {
    requests: Mutex<HashMap<String, Vec<Instant>>>,
    minute_limit: usize,
    day_limit: usize,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(MINUTE_LIMIT, DAY_LIMIT)
    }
}

impl RateLimiter {
    pub fn new(minute_limit: usize, day_limit: usize) -> Self {
        Self {
            requests: Mutex::new(HashMap::new()),
            minute_limit,
            day_limit,
        }
    }

    /// Check both windows and record the request when admitted.
    pub fn is_allowed(&self, client_id: &str) -> RateDecision {
        let now = Instant::now();
        let mut requests = self.requests.lock();
        let history = requests.entry(client_id.to_string()).or_default();
        history.retain(|t| now.duration_since(*t) < DAY);

        let minute_count = history
            .iter()
            .filter(|t| now.duration_since(**t) < MINUTE)
            .count();
        if minute_count >= self.minute_limit {
            // The minute window clears when its oldest member ages out.
            let oldest_in_minute = history
                .iter()
                .filter(|t| now.duration_since(**t) < MINUTE)
                .min()
                .copied();
            let retry_after = oldest_in_minute
                .map(|t| MINUTE.saturating_sub(now.duration_since(t)).as_secs() + 1)
                .unwrap_or(60)
                .min(60);
            return RateDecision::Limited {
                retry_after_secs: retry_after,
            };
        }

        if history.len() >= self.day_limit {
            return RateDecision::Limited {
                retry_after_secs: 60,
            };
        }

        history.push(now);
        RateDecision::Allowed
    }

    /// Drop clients with no requests in the last 24 hours.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut requests = self.requests.lock();
        let before = requests.len();
        requests.retain(|_, history| {
            history.retain(|t| now.duration_since(*t) < DAY);
            !history.is_empty()
        });
        before - requests.len()
    }

    /// Admin reset: forget everything.
    pub fn reset(&self) {
        self.requests.lock().clear();
    }

    pub fn tracked_clients(&self) -> usize {
        self.requests.lock().len()
    }
}

/// Client fingerprint: first 16 hex chars of sha256("ip:user_agent").
pub fn client_fingerprint(ip: &str, user_agent: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ip.as_bytes());
    hasher.update(b":");
    hasher.update(user_agent.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_of_101_trips_the_minute_window() {
        let limiter = RateLimiter::default();
        for i in 0..100 {
            assert_eq!(
                limiter.is_allowed("client"),
                RateDecision::Allowed,
                "request {} should pass",
                i + 1
            );
        }
        match limiter.is_allowed("client") {
            RateDecision::Limited { retry_after_secs } => {
                assert!(retry_after_secs <= 60);
                assert!(retry_after_secs >= 1);
            }
            RateDecision::Allowed => panic!("request 101 must be limited"),
        }
    }

    #[test]
    fn clients_are_isolated() {
        let limiter = RateLimiter::new(2, 1000);
        assert_eq!(limiter.is_allowed("a"), RateDecision::Allowed);
        assert_eq!(limiter.is_allowed("a"), RateDecision::Allowed);
        assert!(matches!(
            limiter.is_allowed("a"),
            RateDecision::Limited { .. }
        ));
        assert_eq!(limiter.is_allowed("b"), RateDecision::Allowed);
    }

    #[test]
    fn day_limit_applies_beyond_minute_window() {
        let limiter = RateLimiter::new(1000, 3);
        for _ in 0..3 {
            assert_eq!(limiter.is_allowed("c"), RateDecision::Allowed);
        }
        assert!(matches!(
            limiter.is_allowed("c"),
            RateDecision::Limited { .. }
        ));
    }

    #[test]
    fn reset_clears_all_clients() {
        let limiter = RateLimiter::new(1, 1);
        let _ = limiter.is_allowed("a");
        assert!(matches!(
            limiter.is_allowed("a"),
            RateDecision::Limited { .. }
        ));
        limiter.reset();
        assert_eq!(limiter.is_allowed("a"), RateDecision::Allowed);
    }

    #[test]
    fn fingerprint_is_stable_and_16_hex() {
        let fp1 = client_fingerprint("203.0.113.9", "curl/8.0");
        let fp2 = client_fingerprint("203.0.113.9", "curl/8.0");
        assert_eq!(fp1, fp2);
        assert_eq!(fp1.len(), 16);
        assert!(fp1.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(fp1, client_fingerprint("203.0.113.9", "firefox"));
    }
}
