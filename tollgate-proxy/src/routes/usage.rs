//! Usage summary route.

use std::sync::Arc;

use axum::{extract::State, Extension, Json};
use tracing::debug;

use crate::auth::AuthUser;
use crate::error::ProxyError;
use crate::state::AppState;
use crate::types::admin::UsageResponse;

/// Per-model token totals for the caller
///
/// GET /v1/usage
pub async fn usage(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user)): Extension<AuthUser>,
) -> Result<Json<UsageResponse>, ProxyError> {
    debug!(user_id = %user.id, "Handling GET /v1/usage");

    let usage = state.ledger.usage_by_model(&user.id).await?;
    Ok(Json(UsageResponse { user_id: user.id, usage }))
}
