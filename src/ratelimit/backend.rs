//! Rate limiter trait for abstracting in-memory and remote counter backings.

use async_trait::async_trait;

use super::counter::{Decision, RateLimitConfig};
use super::key::ThrottleKey;
use crate::error::Result;

/// Trait for rate limiter implementations.
///
/// This trait abstracts over the in-process `RateLimiter` and the
/// `RedisRateLimiter` so the HTTP layer can work with either. An `Err`
/// means the backing could not answer; callers fail open on it.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Count one request for `key` and decide whether it fits `config`.
    async fn is_allowed(&self, key: &ThrottleKey, config: &RateLimitConfig) -> Result<Decision>;

    /// Short name for logs and health output.
    fn name(&self) -> &'static str;
}
