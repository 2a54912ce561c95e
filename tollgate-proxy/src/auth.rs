//! Bearer-key authentication and pre-admission rate limiting.
//!
//! Both are axum middleware layered onto the `/v1` routes. `authenticate`
//! resolves the API key into a [`User`] and stores it in the request
//! extensions as [`AuthUser`]; `enforce_rate_limits` reads it back and
//! rejects the request before it can take a queue slot.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use tollgate_core::{LimitDecision, User};
use tracing::{debug, warn};

use crate::error::ProxyError;
use crate::metrics;
use crate::state::AppState;

/// The authenticated caller
#[derive(Debug, Clone)]
pub struct AuthUser(pub User);

/// Extract the token from an `Authorization: Bearer <key>` header value
fn bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Resolve the bearer key into a user
pub async fn authenticate(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ProxyError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ProxyError::Auth("Missing Authorization header".to_string()))?;

    let token = bearer_token(header)
        .ok_or_else(|| ProxyError::Auth("Authorization header must be 'Bearer <api_key>'".to_string()))?;

    let user = state.users.find_by_api_key(token).await?.ok_or_else(|| {
        debug!("Rejected unknown API key");
        ProxyError::Auth("Invalid API key".to_string())
    })?;

    request.extensions_mut().insert(AuthUser(user));
    Ok(next.run(request).await)
}

/// Deny the request when any of the caller's token caps is exhausted
pub async fn enforce_rate_limits(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ProxyError> {
    let user_id = request
        .extensions()
        .get::<AuthUser>()
        .map(|AuthUser(user)| user.id.clone())
        .ok_or_else(|| ProxyError::Internal("rate limiting ran before authentication".to_string()))?;

    if let LimitDecision::Denied { reason, limit, used } = state.limiter.check(&user_id).await? {
        warn!(user_id = %user_id, reason = %reason, limit, used, "Rate limit exceeded");
        metrics::record_rate_limited(reason.as_str());
        return Err(ProxyError::RateLimited { reason, limit, used });
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token("Bearer sk-123"), Some("sk-123"));
        assert_eq!(bearer_token("bearer   sk-123 "), Some("sk-123"));
        assert_eq!(bearer_token("Basic dXNlcjpwYXNz"), None);
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("sk-123"), None);
    }
}
