//! Fixed-window rate limiting over a [`BoundedCache`].
//!
//! Memory stays bounded under key churn: the least recently seen clients are
//! evicted first and idle windows expire after one window length.

use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

use super::bounded::BoundedCache;

/// Rate limit configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Name used as a metrics label.
    pub name: String,
    /// Requests allowed per window.
    pub limit: u64,
    pub window: Duration,
    /// Distinct keys tracked at once.
    pub max_keys: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            limit: 60,
            window: Duration::from_secs(60),
            max_keys: 10_000,
        }
    }
}

/// Rate limit check result.
#[derive(Debug, Clone)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// When the current window resets
    pub reset_at: DateTime<Utc>,
    /// Seconds to wait before retrying (if rate limited)
    pub retry_after_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    started: Instant,
    count: u64,
}

/// Fixed-window limiter keyed by an arbitrary string.
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<BoundedCache<String, WindowEntry>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let windows = BoundedCache::new(config.max_keys, config.window);
        Self {
            config,
            windows: Mutex::new(windows),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count one request against `key` and report whether it is allowed.
    pub fn check(&self, key: &str) -> RateLimitResult {
        let now = Instant::now();
        let window = self.config.window;

        let entry = {
            let mut windows = self.windows.lock();
            match windows.get_mut(key) {
                Some(entry) if now.duration_since(entry.started) < window => {
                    entry.count += 1;
                    *entry
                }
                _ => {
                    let fresh = WindowEntry {
                        started: now,
                        count: 1,
                    };
                    windows.set(key.to_string(), fresh);
                    fresh
                }
            }
        };

        let limit = self.config.limit;
        let allowed = entry.count <= limit;
        let remaining_window = window.saturating_sub(now.duration_since(entry.started));
        let reset_at = Utc::now()
            + chrono::Duration::from_std(remaining_window).unwrap_or_else(|_| chrono::Duration::zero());

        counter!(
            "rate_limit_checks_total",
            "limiter" => self.config.name.clone(),
            "allowed" => allowed.to_string(),
        )
        .increment(1);

        RateLimitResult {
            allowed,
            limit,
            remaining: limit.saturating_sub(entry.count),
            reset_at,
            retry_after_secs: (!allowed).then(|| remaining_window.as_secs().max(1)),
        }
    }

    /// Forget a key's window, e.g. after a successful login.
    pub fn reset(&self, key: &str) {
        self.windows.lock().delete(key);
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().len()
    }

    /// Clean up expired windows.
    pub fn cleanup_expired(&self) -> usize {
        self.windows.lock().purge_expired()
    }
}
