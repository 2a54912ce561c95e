//! Admin routes: users, rate-limit policies and the queue snapshot.
//!
//! These routes carry no authentication of their own; deployments are
//! expected to keep `/admin` behind their own access control.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use bytes::Bytes;
use tollgate_core::QueueStatus;
use tracing::info;

use super::parse_json;
use crate::error::ProxyError;
use crate::state::AppState;
use crate::types::admin::{CreateUserRequest, CreateUserResponse, LimitsResponse, SetLimitsRequest};

/// Create a user and issue an API key
///
/// POST /admin/users
pub async fn create_user(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<CreateUserResponse>), ProxyError> {
    let request: CreateUserRequest = parse_json(&body)?;
    let name = request.name.as_deref().map(str::trim).unwrap_or_default();
    if name.is_empty() {
        return Err(ProxyError::InvalidRequest("name is required".to_string()));
    }

    let user = state.users.create_user(name).await?;
    info!(user_id = %user.id, name = %user.name, "Created user");

    Ok((StatusCode::CREATED, Json(user.into())))
}

/// Create or replace a user's rate-limit policy
///
/// POST /admin/limits
pub async fn set_limits(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<LimitsResponse>, ProxyError> {
    let request: SetLimitsRequest = parse_json(&body)?;
    let update = request.into_update().map_err(ProxyError::InvalidRequest)?;

    let policy = state.policies.upsert_policy(update).await?;
    info!(
        user_id = %policy.user_id,
        tokens_per_minute = ?policy.tokens_per_minute,
        tokens_per_day = ?policy.tokens_per_day,
        tokens_lifetime = ?policy.tokens_lifetime,
        priority = policy.priority,
        "Saved rate limit policy"
    );

    Ok(Json(policy.into()))
}

/// Fetch a user's rate-limit policy
///
/// GET /admin/limits/{user_id}
pub async fn get_limits(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<LimitsResponse>, ProxyError> {
    state
        .policies
        .policy(&user_id)
        .await?
        .map(|policy| Json(policy.into()))
        .ok_or_else(|| ProxyError::NotFound(format!("No rate limit policy for user {}", user_id)))
}

/// Admission queue snapshot
///
/// GET /admin/queue
pub async fn queue_status(State(state): State<Arc<AppState>>) -> Json<QueueStatus> {
    Json(state.queue.status())
}
