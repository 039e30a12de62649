//! Operator routes for webhook event visibility and replay.
//!
//! These routes are protected by the `admin` role claim.

use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use serde::Deserialize;

use billbridge_billing::{EventRecord, ExceptionRecord, ReplayResult};

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

impl ListQuery {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(50).clamp(1, 500)
    }
}

pub async fn list_events(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<EventRecord>>> {
    auth_user.require_admin()?;
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;
    Ok(Json(billing.webhooks.recent_events(query.limit()).await?))
}

pub async fn list_unprocessed_events(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<EventRecord>>> {
    auth_user.require_admin()?;
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;
    Ok(Json(
        billing.webhooks.unprocessed_events(query.limit()).await?,
    ))
}

pub async fn list_exceptions(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<ExceptionRecord>>> {
    auth_user.require_admin()?;
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;
    Ok(Json(
        billing.webhooks.recent_exceptions(query.limit()).await?,
    ))
}

/// Re-run a stored event's handler from its stored payload.
pub async fn replay_event(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(stripe_id): Path<String>,
) -> ApiResult<Json<ReplayResult>> {
    auth_user.require_admin()?;
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    let result = billing.webhooks.replay(&stripe_id).await?;
    tracing::info!(
        admin = %auth_user.email,
        event_id = %stripe_id,
        success = result.success,
        "Webhook event replayed by operator"
    );
    Ok(Json(result))
}
