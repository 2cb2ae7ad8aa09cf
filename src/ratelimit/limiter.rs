//! In-memory fixed-window rate limiter.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::backend::RateLimiterBackend;
use super::clock::{Clock, SystemClock};
use super::counter::{CounterEntry, Decision, RateLimitConfig};
use super::key::ThrottleKey;
use crate::error::Result;

/// The process-wide counter store.
///
/// All requests within `[reset_time - window, reset_time)` share one count,
/// so a burst straddling a window boundary can admit up to twice the quota.
/// Entries are locked per key for the whole read-increment-write sequence.
#[derive(Debug)]
pub struct RateLimiter {
    counters: DashMap<ThrottleKey, CounterEntry>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a rate limiter driven by the wall clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            clock,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Count one request for `key` and decide whether it fits the quota.
    pub fn is_allowed(&self, key: &ThrottleKey, config: &RateLimitConfig) -> Decision {
        let now = self.clock.now_ms();

        let mut entry = self
            .counters
            .entry(key.clone())
            .or_insert_with(|| CounterEntry {
                count: 0,
                reset_time_ms: now,
            });

        if entry.count == 0 || entry.is_expired(now) {
            *entry = CounterEntry::open(now, config);
            trace!(key = %key, reset_time_ms = entry.reset_time_ms, "Opened rate limit window");
            return Decision::from_count(1, config, entry.reset_time_ms);
        }

        entry.count += 1;
        let decision = Decision::from_count(entry.count, config, entry.reset_time_ms);

        if !decision.allowed {
            debug!(
                key = %key,
                count = entry.count,
                limit = config.max_requests(),
                "Rate limit exceeded"
            );
        }

        decision
    }

    /// Drop every entry whose window has already ended.
    ///
    /// Returns how many entries were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.counters.len();
        self.counters.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.counters.len())
    }

    /// Current count for a key, if it has an entry.
    pub fn get_counter_value(&self, key: &ThrottleKey) -> Option<u64> {
        self.counters.get(key).map(|entry| entry.count)
    }

    pub fn contains(&self, key: &ThrottleKey) -> bool {
        self.counters.contains_key(key)
    }

    /// Clear all counters.
    pub fn clear(&self) {
        self.counters.clear();
    }

    /// Get the number of tracked keys.
    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimiterBackend for RateLimiter {
    async fn is_allowed(&self, key: &ThrottleKey, config: &RateLimitConfig) -> Result<Decision> {
        Ok(RateLimiter::is_allowed(self, key, config))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
