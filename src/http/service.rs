//! Hosted endpoints.
//!
//! `/v1/ratelimit` lets services outside this process share the limiter:
//! they name a key and a category and get the decision back.

use std::collections::BTreeMap;

use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument, warn};

use super::identity::forwarded_identity;
use super::middleware::rate_limit;
use super::AppState;
use crate::error::TurnstileError;
use crate::ratelimit::{Category, Decision, KeyStrategy, RateLimitConfig, RoleTier, ThrottleKey};

/// Build the service router.
pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/health", get(health))
        .route_layer(from_fn_with_state(state.policy(Category::Public), rate_limit));

    let admin = Router::new()
        .route("/v1/limits", get(limits))
        .route_layer(from_fn_with_state(
            state
                .policy(Category::Admin)
                .with_strategy(KeyStrategy::RoleBased),
            rate_limit,
        ));

    let decisions = Router::new().route("/v1/ratelimit", post(should_rate_limit));

    Router::new()
        .merge(public)
        .merge(admin)
        .merge(decisions)
        .layer(from_fn(forwarded_identity))
        .with_state(state)
}

/// Errors surfaced to API callers.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
}

impl From<TurnstileError> for ApiError {
    fn from(err: TurnstileError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckRequest {
    pub key: String,
    pub category: String,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResponse {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_time: i64,
    pub limit: u64,
}

impl CheckResponse {
    fn new(decision: &Decision, config: &RateLimitConfig) -> Self {
        Self {
            allowed: decision.allowed,
            remaining: decision.remaining,
            reset_time: decision.reset_time_ms,
            limit: config.max_requests(),
        }
    }
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "backend": state.backend.name(),
    }))
}

/// Decide whether a caller-supplied key may proceed.
#[instrument(skip_all, fields(category = %request.category))]
async fn should_rate_limit(
    State(state): State<AppState>,
    Json(request): Json<CheckRequest>,
) -> Result<Json<CheckResponse>, ApiError> {
    let Some(key) = ThrottleKey::new(request.key) else {
        warn!("Received rate limit request with empty key");
        return Err(ApiError::BadRequest("key is required".to_string()));
    };
    let category: Category = request.category.parse()?;

    let policy = state.policy(category);
    let config = state
        .table
        .resolve(category, request.role.as_deref(), state.role_adjustment);
    let key = key.scoped(category.as_str());

    let decision = match policy.check(&key, &config).await {
        Some(decision) => decision,
        None => Decision::fail_open(&config, policy.now_ms()),
    };

    debug!(
        key = %key,
        allowed = decision.allowed,
        remaining = decision.remaining,
        "Rate limit decision made"
    );

    Ok(Json(CheckResponse::new(&decision, &config)))
}

#[derive(Debug, Serialize)]
struct LimitsResponse {
    limits: BTreeMap<Category, RateLimitConfig>,
    role_tiers: BTreeMap<String, RoleTier>,
    role_adjustment: bool,
}

async fn limits(State(state): State<AppState>) -> Json<LimitsResponse> {
    Json(LimitsResponse {
        limits: state.table.limits(),
        role_tiers: state.table.role_tiers(),
        role_adjustment: state.role_adjustment,
    })
}
