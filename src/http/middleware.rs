//! Throttling middleware for axum routers.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{HeaderName, HeaderValue, RETRY_AFTER};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{debug, trace, warn};

use crate::ratelimit::{
    Category, Clock, Decision, Identity, KeyStrategy, RateLimitConfig, RateLimitTable,
    RateLimiterBackend, RequestMeta, ThrottleKey,
};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Everything one throttled route needs: where to count, which quota, how to key.
#[derive(Clone)]
pub struct RateLimitPolicy {
    backend: Arc<dyn RateLimiterBackend>,
    table: Arc<RateLimitTable>,
    clock: Arc<dyn Clock>,
    category: Category,
    strategy: KeyStrategy,
    role_adjustment: bool,
}

impl RateLimitPolicy {
    pub fn new(
        backend: Arc<dyn RateLimiterBackend>,
        table: Arc<RateLimitTable>,
        clock: Arc<dyn Clock>,
        category: Category,
    ) -> Self {
        Self {
            backend,
            table,
            clock,
            category,
            strategy: KeyStrategy::Default,
            role_adjustment: false,
        }
    }

    pub fn with_strategy(mut self, strategy: KeyStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_role_adjustment(mut self, enabled: bool) -> Self {
        self.role_adjustment = enabled;
        self
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Key and effective quota for a request.
    ///
    /// Counters are scoped by category so each category keeps its own window.
    /// Redis keys therefore read `rate_limit:{category}|{key}`, not `rate_limit:{key}`.
    pub fn resolve(&self, request: &RequestMeta<'_>) -> (ThrottleKey, RateLimitConfig) {
        let key = self.strategy.derive(request).scoped(self.category.as_str());
        let role = request.identity.map(Identity::effective_role);
        let config = self.table.resolve(self.category, role, self.role_adjustment);
        (key, config)
    }

    /// Ask the backend. `None` means it failed and the call should proceed unthrottled.
    pub async fn check(&self, key: &ThrottleKey, config: &RateLimitConfig) -> Option<Decision> {
        match self.backend.is_allowed(key, config).await {
            Ok(decision) => Some(decision),
            Err(e) => {
                warn!(
                    backend = self.backend.name(),
                    key = %key,
                    category = %self.category,
                    error = %e,
                    "Rate limiter failed, allowing request"
                );
                None
            }
        }
    }
}

/// Middleware entry point, for `axum::middleware::from_fn_with_state`.
///
/// Denied calls never reach the inner handler.
pub async fn rate_limit(
    State(policy): State<RateLimitPolicy>,
    request: Request,
    next: Next,
) -> Response {
    let (key, config) = {
        let meta = RequestMeta::new(request.headers())
            .with_identity(request.extensions().get::<Identity>())
            .with_peer(
                request
                    .extensions()
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|info| info.0),
            );
        policy.resolve(&meta)
    };

    trace!(
        key = %key,
        category = %policy.category(),
        limit = config.max_requests(),
        "Checking rate limit"
    );

    let Some(decision) = policy.check(&key, &config).await else {
        return next.run(request).await;
    };

    if !decision.allowed {
        debug!(key = %key, category = %policy.category(), "Rejecting request over quota");
        return rejection(&config, &decision, policy.now_ms());
    }

    let mut response = next.run(request).await;
    set_limit_headers(response.headers_mut(), &config, &decision);
    response
}

/// The standard 429 for a denied call.
pub fn rejection(config: &RateLimitConfig, decision: &Decision, now_ms: i64) -> Response {
    let retry_after = decision.retry_after_secs(now_ms);
    let body = json!({
        "error": "Rate limit exceeded",
        "retryAfter": retry_after,
    });

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
    set_limit_headers(headers, config, decision);
    response
}

pub fn set_limit_headers(headers: &mut HeaderMap, config: &RateLimitConfig, decision: &Decision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(config.max_requests()));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_secs()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, TurnstileError};
    use crate::ratelimit::{ManualClock, RateLimiter};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;

    const START: i64 = 1_700_000_000_000;

    struct FailingBackend;

    #[async_trait]
    impl RateLimiterBackend for FailingBackend {
        async fn is_allowed(
            &self,
            _key: &ThrottleKey,
            _config: &RateLimitConfig,
        ) -> Result<Decision> {
            Err(TurnstileError::Backend("connection refused".to_string()))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    fn table(yaml: &str) -> Arc<RateLimitTable> {
        Arc::new(RateLimitTable::from_yaml(yaml).unwrap())
    }

    fn app(policy: RateLimitPolicy, hits: Arc<AtomicUsize>) -> Router {
        Router::new()
            .route(
                "/",
                get(move || {
                    let hits = hits.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        "ok"
                    }
                }),
            )
            .layer(axum::middleware::from_fn_with_state(policy, rate_limit))
    }

    fn request_from(ip: &str) -> Request {
        axum::http::Request::builder()
            .uri("/")
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap()
    }

    fn header(response: &Response, name: &str) -> String {
        response.headers()[name].to_str().unwrap().to_string()
    }

    const THREE_PER_MINUTE: &str = r#"
limits:
  general:
    window_ms: 60000
    max_requests: 3
"#;

    #[tokio::test]
    async fn test_allowed_requests_carry_headers() {
        let clock = Arc::new(ManualClock::new(START));
        let limiter = Arc::new(RateLimiter::with_clock(clock.clone()));
        let policy =
            RateLimitPolicy::new(limiter, table(THREE_PER_MINUTE), clock, Category::General);
        let hits = Arc::new(AtomicUsize::new(0));
        let app = app(policy, hits.clone());

        let response = app.clone().oneshot(request_from("1.2.3.4")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "x-ratelimit-limit"), "3");
        assert_eq!(header(&response, "x-ratelimit-remaining"), "2");
        assert_eq!(
            header(&response, "x-ratelimit-reset"),
            ((START + 60_000) / 1000).to_string()
        );
        assert!(response.headers().get(RETRY_AFTER).is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_over_quota_is_rejected_without_calling_handler() {
        let clock = Arc::new(ManualClock::new(START));
        let limiter = Arc::new(RateLimiter::with_clock(clock.clone()));
        let policy = RateLimitPolicy::new(
            limiter,
            table(THREE_PER_MINUTE),
            clock.clone(),
            Category::General,
        );
        let hits = Arc::new(AtomicUsize::new(0));
        let app = app(policy, hits.clone());

        for _ in 0..3 {
            let response = app.clone().oneshot(request_from("1.2.3.4")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        clock.advance(Duration::from_millis(15_000));
        let response = app.clone().oneshot(request_from("1.2.3.4")).await.unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header(&response, "retry-after"), "45");
        assert_eq!(header(&response, "x-ratelimit-remaining"), "0");
        assert_eq!(header(&response, "x-ratelimit-limit"), "3");
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], "Rate limit exceeded");
        assert_eq!(body["retryAfter"], 45);

        // Another address has its own counter.
        let response = app.clone().oneshot(request_from("5.6.7.8")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_window_reset_readmits() {
        let clock = Arc::new(ManualClock::new(START));
        let limiter = Arc::new(RateLimiter::with_clock(clock.clone()));
        let policy = RateLimitPolicy::new(
            limiter,
            table(THREE_PER_MINUTE),
            clock.clone(),
            Category::General,
        );
        let app = app(policy, Arc::new(AtomicUsize::new(0)));

        for _ in 0..4 {
            app.clone().oneshot(request_from("1.2.3.4")).await.unwrap();
        }
        clock.advance(Duration::from_millis(60_001));

        let response = app.clone().oneshot(request_from("1.2.3.4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "x-ratelimit-remaining"), "2");
    }

    #[tokio::test]
    async fn test_backend_failure_fails_open() {
        let clock = Arc::new(ManualClock::new(START));
        let policy = RateLimitPolicy::new(
            Arc::new(FailingBackend),
            table(THREE_PER_MINUTE),
            clock,
            Category::General,
        );
        let hits = Arc::new(AtomicUsize::new(0));
        let app = app(policy, hits.clone());

        for _ in 0..5 {
            let response = app.clone().oneshot(request_from("1.2.3.4")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get("x-ratelimit-limit").is_none());
        }
        assert_eq!(hits.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_role_adjustment_raises_limit_header() {
        let yaml = r#"
limits:
  admin:
    window_ms: 60000
    max_requests: 100
role_tiers:
  admin:
    multiplier: 3
    ceiling: 250
"#;
        let clock = Arc::new(ManualClock::new(START));
        let limiter = Arc::new(RateLimiter::with_clock(clock.clone()));
        let policy = RateLimitPolicy::new(limiter.clone(), table(yaml), clock, Category::Admin)
            .with_strategy(KeyStrategy::RoleBased)
            .with_role_adjustment(true);
        let app = app(policy, Arc::new(AtomicUsize::new(0)));

        let mut request = request_from("1.2.3.4");
        request
            .extensions_mut()
            .insert(Identity::new("u1").with_role("admin"));
        let response = app.clone().oneshot(request).await.unwrap();

        assert_eq!(header(&response, "x-ratelimit-limit"), "250");
        assert_eq!(header(&response, "x-ratelimit-remaining"), "249");
        assert!(limiter.contains(&ThrottleKey::new("admin|admin:u1").unwrap()));

        // Without an identity the base quota applies to the address key.
        let response = app.clone().oneshot(request_from("1.2.3.4")).await.unwrap();
        assert_eq!(header(&response, "x-ratelimit-limit"), "100");
        assert!(limiter.contains(&ThrottleKey::new("admin|ip:1.2.3.4").unwrap()));
    }

    #[tokio::test]
    async fn test_categories_count_separately() {
        let clock = Arc::new(ManualClock::new(START));
        let limiter = Arc::new(RateLimiter::with_clock(clock.clone()));
        let table = Arc::new(RateLimitTable::builtin());
        let hits = Arc::new(AtomicUsize::new(0));

        let upload =
            RateLimitPolicy::new(limiter.clone(), table.clone(), clock.clone(), Category::Upload);
        let search = RateLimitPolicy::new(limiter.clone(), table, clock, Category::Search);

        let upload_response = app(upload, hits.clone())
            .oneshot(request_from("1.2.3.4"))
            .await
            .unwrap();
        let search_response = app(search, hits).oneshot(request_from("1.2.3.4")).await.unwrap();

        assert_eq!(header(&upload_response, "x-ratelimit-remaining"), "19");
        assert_eq!(header(&search_response, "x-ratelimit-remaining"), "29");
        assert_eq!(limiter.counter_count(), 2);
    }
}
