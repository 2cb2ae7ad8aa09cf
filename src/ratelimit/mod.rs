//! Rate limiting logic and state management.

mod backend;
mod clock;
mod counter;
mod key;
mod limiter;
mod remote;
mod rules;
mod sweeper;

pub use backend::RateLimiterBackend;
pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{CounterEntry, Decision, RateLimitConfig, MAX_WINDOW_MS};
pub use key::{Identity, KeyStrategy, RequestMeta, ThrottleKey, DEFAULT_ROLE};
pub use limiter::RateLimiter;
pub use remote::{RedisRateLimiter, DEFAULT_KEY_PREFIX};
pub use rules::{Category, RateLimitTable, RoleTier};
pub use sweeper::{Sweeper, SweeperHandle, DEFAULT_SWEEP_INTERVAL};
