//! Sliding-window request throttle.
//!
//! Each key owns the timestamps of its accepted requests inside the current
//! window. A check prunes timestamps older than `now - window`, then accepts
//! the request if fewer than `max_requests` remain.

use crate::config::{RateLimitConfig, RateLimitPolicy};
use bridge_proto::BridgeError;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Endpoint class a request is throttled under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    /// AI invocations (command execution).
    Ai,
    /// General reads.
    General,
    /// Session control: attach, stop, resize.
    Session,
}

impl fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EndpointClass::Ai => "ai",
            EndpointClass::General => "general",
            EndpointClass::Session => "session",
        };
        f.write_str(s)
    }
}

/// Client identity plus endpoint class, displayed as `identity:class`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub identity: String,
    pub class: EndpointClass,
}

impl RateLimitKey {
    pub fn new(identity: impl Into<String>, class: EndpointClass) -> Self {
        Self {
            identity: identity.into(),
            class,
        }
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.identity, self.class)
    }
}

/// Outcome of a single check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Unix milliseconds at which the oldest counted request leaves the window.
    pub reset_at_ms: u64,
    /// Seconds until a slot frees up. Only set on rejection.
    pub retry_after_secs: Option<u64>,
    pub window_ms: u64,
}

impl RateLimitDecision {
    /// Turns a rejected decision into the response handed to the client.
    pub fn rejection(&self) -> Option<RateLimitRejection> {
        let retry_after_secs = self.retry_after_secs?;
        Some(RateLimitRejection {
            retry_after_secs,
            limit: self.limit,
            remaining: self.remaining,
            reset_at_ms: self.reset_at_ms,
            window_ms: self.window_ms,
        })
    }
}

/// The 429 response for a throttled request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRejection {
    pub retry_after_secs: u64,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at_ms: u64,
    pub window_ms: u64,
}

impl RateLimitRejection {
    pub fn status(&self) -> u16 {
        429
    }

    /// Response headers in the order they are emitted.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Retry-After", self.retry_after_secs.to_string()),
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_at_ms.to_string()),
        ]
    }

    pub fn body(&self) -> serde_json::Value {
        serde_json::json!({
            "error": "Too many requests, please try again later.",
            "retryAfter": self.retry_after_secs,
            "limit": self.limit,
            "windowMs": self.window_ms,
        })
    }
}

impl From<RateLimitRejection> for BridgeError {
    fn from(rejection: RateLimitRejection) -> Self {
        BridgeError::Throttled {
            retry_after_secs: rejection.retry_after_secs,
            limit: rejection.limit,
            window_ms: rejection.window_ms,
        }
    }
}

#[derive(Debug, Default)]
struct RateLimitEntry {
    /// Accepted request times, oldest first.
    timestamps: VecDeque<u64>,
    /// Unix milliseconds after which the entry holds nothing.
    reset_at_ms: u64,
}

/// Keyed sliding-window limiter. Entries are created lazily and removed by
/// [`RateLimiter::sweep_at`] once their window has fully elapsed.
#[derive(Debug)]
pub struct RateLimiter {
    ai: RateLimitPolicy,
    general: RateLimitPolicy,
    session: RateLimitPolicy,
    entries: Mutex<HashMap<RateLimitKey, RateLimitEntry>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            ai: config.ai,
            general: config.general,
            session: config.session,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self, class: EndpointClass) -> RateLimitPolicy {
        match class {
            EndpointClass::Ai => self.ai,
            EndpointClass::General => self.general,
            EndpointClass::Session => self.session,
        }
    }

    /// Checks and, if allowed, counts a request at the current time.
    pub fn check(&self, key: &RateLimitKey) -> RateLimitDecision {
        self.check_at(key, now_ms())
    }

    /// Checks against an explicit clock reading.
    pub fn check_at(&self, key: &RateLimitKey, now_ms: u64) -> RateLimitDecision {
        let policy = self.policy(key.class);
        let window_start = now_ms.saturating_sub(policy.window_ms);

        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = entries.entry(key.clone()).or_default();

        while entry
            .timestamps
            .front()
            .is_some_and(|&ts| ts <= window_start)
        {
            entry.timestamps.pop_front();
        }

        let count = entry.timestamps.len() as u32;
        if count < policy.max_requests {
            entry.timestamps.push_back(now_ms);
            entry.reset_at_ms = now_ms + policy.window_ms;
            let oldest = entry.timestamps.front().copied().unwrap_or(now_ms);
            return RateLimitDecision {
                allowed: true,
                limit: policy.max_requests,
                remaining: policy.max_requests - count - 1,
                reset_at_ms: oldest + policy.window_ms,
                retry_after_secs: None,
                window_ms: policy.window_ms,
            };
        }

        let oldest = entry.timestamps.front().copied().unwrap_or(now_ms);
        let reset_at_ms = oldest + policy.window_ms;
        let retry_after_secs = reset_at_ms.saturating_sub(now_ms).div_ceil(1000).max(1);

        debug!(key = %key, retry_after_secs, "Rate limit exceeded");

        RateLimitDecision {
            allowed: false,
            limit: policy.max_requests,
            remaining: 0,
            reset_at_ms,
            retry_after_secs: Some(retry_after_secs),
            window_ms: policy.window_ms,
        }
    }

    /// Checks a key and converts a rejection into [`BridgeError::Throttled`].
    pub fn enforce(&self, key: &RateLimitKey) -> Result<RateLimitDecision, BridgeError> {
        let decision = self.check(key);
        match decision.rejection() {
            Some(rejection) => Err(rejection.into()),
            None => Ok(decision),
        }
    }

    /// Drops entries whose window has fully elapsed. Returns how many went.
    pub fn sweep_at(&self, now_ms: u64) -> usize {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| entry.reset_at_ms > now_ms);
        before - entries.len()
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(now_ms())
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Spawns a task that sweeps on a fixed interval until aborted.
    pub fn spawn_sweeper(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = self.sweep();
                if removed > 0 {
                    debug!(removed, "Swept idle rate-limit entries");
                }
            }
        })
    }
}

fn now_ms() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_millis() as u64,
        Err(e) => {
            warn!(error = %e, "System clock before Unix epoch");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(&RateLimitConfig::default())
    }

    #[test]
    fn test_key_display() {
        let key = RateLimitKey::new("client1", EndpointClass::Ai);
        assert_eq!(key.to_string(), "client1:ai");
    }

    #[test]
    fn test_eleventh_request_rejected() {
        let limiter = limiter();
        let key = RateLimitKey::new("client1", EndpointClass::Ai);
        let start = 1_700_000_000_000;

        for i in 0..10 {
            let decision = limiter.check_at(&key, start + i * 100);
            assert!(decision.allowed, "request {i} should pass");
            assert_eq!(decision.remaining, 9 - i as u32);
        }

        let decision = limiter.check_at(&key, start + 2000);
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        let retry_after = decision.retry_after_secs.unwrap();
        assert!((58..=60).contains(&retry_after), "retry_after = {retry_after}");
        assert_eq!(decision.reset_at_ms, start + 60_000);
    }

    #[test]
    fn test_window_slides() {
        let limiter = limiter();
        let key = RateLimitKey::new("client1", EndpointClass::Ai);
        let start = 1_000_000;

        for i in 0..10 {
            assert!(limiter.check_at(&key, start + i).allowed);
        }
        assert!(!limiter.check_at(&key, start + 59_999).allowed);
        // First timestamp has left the window
        assert!(limiter.check_at(&key, start + 60_000).allowed);
    }

    #[test]
    fn test_classes_and_identities_are_independent() {
        let limiter = limiter();
        let ai = RateLimitKey::new("client1", EndpointClass::Ai);
        let general = RateLimitKey::new("client1", EndpointClass::General);
        let other = RateLimitKey::new("client2", EndpointClass::Ai);

        for _ in 0..10 {
            assert!(limiter.check_at(&ai, 5_000).allowed);
        }
        assert!(!limiter.check_at(&ai, 5_000).allowed);
        assert!(limiter.check_at(&general, 5_000).allowed);
        assert!(limiter.check_at(&other, 5_000).allowed);
    }

    #[test]
    fn test_sweep_removes_elapsed_entries() {
        let limiter = limiter();
        limiter.check_at(&RateLimitKey::new("a", EndpointClass::Ai), 0);
        limiter.check_at(&RateLimitKey::new("b", EndpointClass::Ai), 30_000);
        assert_eq!(limiter.tracked_keys(), 2);

        assert_eq!(limiter.sweep_at(60_000), 1);
        assert_eq!(limiter.tracked_keys(), 1);
        assert_eq!(limiter.sweep_at(90_000), 1);
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn test_rejection_response() {
        let limiter = limiter();
        let key = RateLimitKey::new("client1", EndpointClass::Ai);
        for _ in 0..10 {
            limiter.check_at(&key, 10_000);
        }
        let rejection = limiter.check_at(&key, 10_500).rejection().unwrap();

        assert_eq!(rejection.status(), 429);
        let body = rejection.body();
        assert_eq!(body["retryAfter"], 60);
        assert_eq!(body["limit"], 10);
        assert_eq!(body["windowMs"], 60_000);

        let headers = rejection.headers();
        assert_eq!(headers[0], ("Retry-After", "60".to_string()));
        assert_eq!(headers[2], ("X-RateLimit-Remaining", "0".to_string()));

        let err: BridgeError = rejection.into();
        assert_eq!(err.kind_name(), "throttled");
    }
}
