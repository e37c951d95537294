//! Authentication and request logging middleware

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use crate::error::{GatewayError, GatewayResult};
use crate::state::AppState;
use lendahand_auth::IdentityError;

/// Validate the bearer token and stash the caller's identity in request
/// extensions for the handlers downstream.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let token = require_bearer(request.headers())?;

    let identity = state
        .authenticator
        .verify_token(&token)
        .await
        .map_err(|err| match err {
            IdentityError::Database(err) => GatewayError::DatabaseError(err.to_string()),
            other => GatewayError::AuthenticationFailed(other.to_string()),
        })?;

    request.extensions_mut().insert(identity);

    Ok(next.run(request).await)
}

/// Extract the token from an `Authorization: Bearer` header.
pub fn require_bearer(headers: &HeaderMap) -> GatewayResult<String> {
    let value = headers
        .get(AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .ok_or_else(|| {
            GatewayError::AuthenticationFailed("missing authorization header".to_string())
        })?;

    let mut parts = value.split_whitespace();
    let scheme = parts.next().unwrap_or("");
    if !scheme.eq_ignore_ascii_case("Bearer") {
        return Err(GatewayError::AuthenticationFailed(
            "invalid authorization scheme".to_string(),
        ));
    }

    let token = parts.next().unwrap_or("");
    if token.is_empty() {
        return Err(GatewayError::AuthenticationFailed(
            "missing bearer token".to_string(),
        ));
    }

    Ok(token.to_string())
}

/// Log method, path, status and latency for every request.
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();

    let start = std::time::Instant::now();
    let response = next.run(request).await;
    let duration = start.elapsed();

    tracing::info!(
        method = %method,
        uri = %uri,
        status = %response.status(),
        duration_ms = duration.as_millis(),
        "request completed"
    );

    response
}
