use crate::config::AppState;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

/// Extract the bearer token from the authorization header
pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Whether `headers` satisfy the configured token. No token configured lets everything through.
pub fn is_authorized(expected: Option<&str>, headers: &HeaderMap) -> bool {
    match expected {
        Some(expected) => extract_bearer(headers) == Some(expected),
        None => true,
    }
}

/// Reject requests without the shared agent token
pub async fn require_token(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if !is_authorized(state.token.as_deref(), req.headers()) {
        tracing::warn!("Rejected unauthenticated request to {}", req.uri().path());
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(req).await)
}
