//! Fixed-window counter state and the quota arithmetic shared by every backing.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TurnstileError;

/// Longest accepted window: one year.
pub const MAX_WINDOW_MS: u64 = 365 * 24 * 60 * 60 * 1000;

/// Quota for one call category: at most `max_requests` per `window_ms`.
///
/// Both values are positive and the window is at most [`MAX_WINDOW_MS`];
/// construction and deserialization reject anything else, so an invalid
/// table fails at startup rather than per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRateLimitConfig")]
pub struct RateLimitConfig {
    window_ms: u64,
    max_requests: u64,
}

#[derive(Deserialize)]
struct RawRateLimitConfig {
    window_ms: u64,
    max_requests: u64,
}

impl TryFrom<RawRateLimitConfig> for RateLimitConfig {
    type Error = TurnstileError;

    fn try_from(raw: RawRateLimitConfig) -> Result<Self, Self::Error> {
        Self::new(raw.window_ms, raw.max_requests)
    }
}

impl RateLimitConfig {
    /// Create a validated config.
    pub fn new(window_ms: u64, max_requests: u64) -> crate::error::Result<Self> {
        if window_ms == 0 || window_ms > MAX_WINDOW_MS {
            return Err(TurnstileError::InvalidLimit {
                field: "window_ms",
                value: window_ms,
            });
        }
        if max_requests == 0 {
            return Err(TurnstileError::InvalidLimit {
                field: "max_requests",
                value: max_requests,
            });
        }
        Ok(Self {
            window_ms,
            max_requests,
        })
    }

    /// Const constructor for tables known to be valid at compile time.
    pub(crate) const fn from_parts(window_ms: u64, max_requests: u64) -> Self {
        Self {
            window_ms,
            max_requests,
        }
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Window end for a window opened at `now_ms`.
    pub fn window_end(&self, now_ms: i64) -> i64 {
        let window = i64::try_from(self.window_ms).unwrap_or(i64::MAX);
        now_ms.saturating_add(window)
    }

    /// Same window with a different quota. Non-positive quotas are clamped to 1.
    pub fn with_max_requests(&self, max_requests: u64) -> Self {
        Self {
            window_ms: self.window_ms,
            max_requests: max_requests.max(1),
        }
    }
}

/// Per-key window state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterEntry {
    /// Requests observed since the window opened
    pub count: u64,
    /// Absolute end of the window (epoch milliseconds)
    pub reset_time_ms: i64,
}

impl CounterEntry {
    /// Open a window at `now_ms` holding the first request.
    pub fn open(now_ms: i64, config: &RateLimitConfig) -> Self {
        Self {
            count: 1,
            reset_time_ms: config.window_end(now_ms),
        }
    }

    /// A window is over once `now` is strictly past its end.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.reset_time_ms < now_ms
    }
}

/// Outcome of a single allow/deny query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    /// Requests left in the window, never negative
    pub remaining: u64,
    /// Absolute end of the window (epoch milliseconds)
    pub reset_time_ms: i64,
}

impl Decision {
    /// Derive the decision for the `count`-th request of a window.
    pub fn from_count(count: u64, config: &RateLimitConfig, reset_time_ms: i64) -> Self {
        Self {
            allowed: count <= config.max_requests,
            remaining: config.max_requests.saturating_sub(count),
            reset_time_ms,
        }
    }

    /// What to report when the backing could not answer: allowed, full quota.
    pub fn fail_open(config: &RateLimitConfig, now_ms: i64) -> Self {
        Self {
            allowed: true,
            remaining: config.max_requests,
            reset_time_ms: config.window_end(now_ms),
        }
    }

    /// Window end in whole seconds since the epoch, rounded up.
    pub fn reset_secs(&self) -> i64 {
        ceil_secs(self.reset_time_ms)
    }

    /// Seconds until the window ends, rounded up; zero once it has ended.
    pub fn retry_after_secs(&self, now_ms: i64) -> i64 {
        ceil_secs(self.reset_time_ms.saturating_sub(now_ms).max(0))
    }
}

fn ceil_secs(ms: i64) -> i64 {
    let secs = ms / 1000;
    if ms > 0 && ms % 1000 != 0 {
        secs + 1
    } else {
        secs
    }
}
