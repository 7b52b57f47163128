//! Per-user sliding-window rate limiting.
//!
//! Checked before any graph invocation; a rejected request has no side
//! effects. A limit of 0 disables the quota entirely.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Sliding one-minute window per user.
pub struct RateLimiter {
    requests_per_minute: u32,
    window: Duration,
    entries: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        Self {
            requests_per_minute,
            window: Duration::from_secs(60),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record a request for `user_id`. Returns false when the quota is
    /// exhausted (the request is not recorded in that case).
    pub fn check(&self, user_id: &str) -> bool {
        if self.requests_per_minute == 0 {
            return true;
        }
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let window = entries.entry(user_id.to_string()).or_default();
        while let Some(front) = window.front() {
            if now.duration_since(*front) > self.window {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() >= self.requests_per_minute as usize {
            return false;
        }
        window.push_back(now);
        true
    }

    pub fn limit(&self) -> u32 {
        self.requests_per_minute
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_limit_is_unlimited() {
        let limiter = RateLimiter::new(0);
        for _ in 0..1000 {
            assert!(limiter.check("alice"));
        }
    }

    #[test]
    fn quota_is_enforced_per_user() {
        let limiter = RateLimiter::new(3);
        assert!(limiter.check("alice"));
        assert!(limiter.check("alice"));
        assert!(limiter.check("alice"));
        assert!(!limiter.check("alice"));
        // Other users are unaffected
        assert!(limiter.check("bob"));
    }

    #[test]
    fn rejected_requests_do_not_consume_quota() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.check("alice"));
        for _ in 0..10 {
            assert!(!limiter.check("alice"));
        }
    }
}
