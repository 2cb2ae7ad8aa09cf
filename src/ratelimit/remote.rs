//! Redis-backed fixed-window rate limiter.
//!
//! Counters live in Redis so several service instances share one quota.
//! Expiry is delegated to key TTLs, so no sweeper runs for this backing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tokio::sync::OnceCell;
use tracing::{debug, info, trace};

use super::backend::RateLimiterBackend;
use super::clock::{Clock, SystemClock};
use super::counter::{Decision, RateLimitConfig};
use super::key::ThrottleKey;
use crate::error::{Result, TurnstileError};

/// Default prefix for counter keys.
pub const DEFAULT_KEY_PREFIX: &str = "rate_limit";

/// Increment the counter, open the window on the first hit, and report
/// `{count, pttl}`. A key that lost its TTL gets a fresh one.
const FIXED_WINDOW_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

pub struct RedisRateLimiter {
    client: redis::Client,
    /// Shared by every check once established; reconnects on its own
    connection: OnceCell<ConnectionManager>,
    script: Script,
    key_prefix: String,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl RedisRateLimiter {
    /// Create a limiter for the Redis server at `url`.
    ///
    /// No connection is made here. One connection is established by
    /// [`connect`](Self::connect) or by the first check, and reused after.
    pub fn new(url: &str, key_prefix: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
            script: Script::new(FIXED_WINDOW_SCRIPT),
            key_prefix: key_prefix.into(),
            timeout,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The Redis key a throttling key is stored under.
    pub fn redis_key(&self, key: &ThrottleKey) -> String {
        format!("{}:{}", self.key_prefix, key)
    }

    /// Establish the shared connection without the per-check timeout.
    pub async fn connect(&self) -> Result<()> {
        self.connection().await.map(|_| ())
    }

    pub fn is_connected(&self) -> bool {
        self.connection.initialized()
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                let manager = ConnectionManager::new(self.client.clone()).await?;
                info!(prefix = %self.key_prefix, "Connected to redis");
                Ok::<_, TurnstileError>(manager)
            })
            .await?;
        Ok(manager.clone())
    }

    async fn increment(&self, redis_key: &str, window_ms: u64) -> Result<(u64, i64)> {
        let mut conn = self.connection().await?;
        let (count, ttl): (u64, i64) = self
            .script
            .key(redis_key)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok((count, ttl))
    }
}

impl std::fmt::Debug for RedisRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisRateLimiter")
            .field("key_prefix", &self.key_prefix)
            .field("timeout", &self.timeout)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[async_trait]
impl RateLimiterBackend for RedisRateLimiter {
    async fn is_allowed(&self, key: &ThrottleKey, config: &RateLimitConfig) -> Result<Decision> {
        let redis_key = self.redis_key(key);
        trace!(key = %redis_key, window_ms = config.window_ms(), "Checking remote rate limit");

        let (count, ttl) = tokio::time::timeout(
            self.timeout,
            self.increment(&redis_key, config.window_ms()),
        )
        .await
        .map_err(|_| TurnstileError::BackendTimeout(self.timeout))??;

        if count == 0 {
            return Err(TurnstileError::Backend(format!(
                "counter {} reported a zero count",
                redis_key
            )));
        }

        let reset_time_ms = self.clock.now_ms().saturating_add(ttl.max(0));
        let decision = Decision::from_count(count, config, reset_time_ms);

        if !decision.allowed {
            debug!(
                key = %redis_key,
                count = count,
                limit = config.max_requests(),
                "Remote rate limit exceeded"
            );
        }

        Ok(decision)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
