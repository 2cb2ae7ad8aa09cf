//! Caller identity handed over by an authenticating proxy in front of the service.

use axum::extract::Request;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;

use crate::ratelimit::Identity;

pub const USER_HEADER: &str = "x-forwarded-user";
pub const ROLE_HEADER: &str = "x-forwarded-role";

/// Read the identity headers, if a user id is present.
pub fn identity_from_headers(headers: &HeaderMap) -> Option<Identity> {
    let id = header_value(headers, USER_HEADER)?;
    let identity = Identity::new(id);
    Some(match header_value(headers, ROLE_HEADER) {
        Some(role) => identity.with_role(role.to_ascii_lowercase()),
        None => identity,
    })
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Attach an [`Identity`] extension for downstream layers.
///
/// Must sit outside any rate limit layer that keys on identity.
pub async fn forwarded_identity(mut request: Request, next: Next) -> Response {
    if let Some(identity) = identity_from_headers(request.headers()) {
        request.extensions_mut().insert(identity);
    }
    next.run(request).await
}
