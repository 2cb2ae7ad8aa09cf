//! HTTP surface: the throttling middleware and the hosted endpoints.

mod identity;
mod middleware;
mod server;
mod service;

use std::sync::Arc;

pub use identity::{forwarded_identity, identity_from_headers, ROLE_HEADER, USER_HEADER};
pub use middleware::{rate_limit, RateLimitPolicy};
pub use server::HttpServer;
pub use service::router;

use crate::ratelimit::{Category, Clock, RateLimitTable, RateLimiterBackend};

/// Shared state handed to every route and policy.
#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<dyn RateLimiterBackend>,
    pub table: Arc<RateLimitTable>,
    pub clock: Arc<dyn Clock>,
    /// Raise quotas for roles with a registered tier
    pub role_adjustment: bool,
}

impl AppState {
    pub fn new(
        backend: Arc<dyn RateLimiterBackend>,
        table: Arc<RateLimitTable>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            backend,
            table,
            clock,
            role_adjustment: false,
        }
    }

    pub fn with_role_adjustment(mut self, enabled: bool) -> Self {
        self.role_adjustment = enabled;
        self
    }

    /// A middleware policy for `category` sharing this state's backend and table.
    pub fn policy(&self, category: Category) -> RateLimitPolicy {
        RateLimitPolicy::new(
            self.backend.clone(),
            self.table.clone(),
            self.clock.clone(),
            category,
        )
        .with_role_adjustment(self.role_adjustment)
    }
}
