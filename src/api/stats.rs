//! Usage counters and the admin rate-limit reset.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use super::{ApiError, AppState, MetricsSnapshot};

/// Aggregate API usage statistics.
#[utoipa::path(
    get,
    path = "/api/stats",
    responses(
        (status = 200, description = "Usage counters", body = MetricsSnapshot)
    ),
    tag = "stats"
)]
pub async fn usage_stats(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ResetResponse {
    pub status: String,
    pub tracked_clients_before: usize,
}

/// Clear the rate-limit table. Requires the configured admin token in the
/// X-Admin-Token header.
#[utoipa::path(
    post,
    path = "/api/reset-rate-limit",
    responses(
        (status = 200, description = "Rate limits cleared", body = ResetResponse),
        (status = 403, description = "Missing or wrong admin token", body = super::ErrorResponse)
    ),
    tag = "stats"
)]
pub async fn reset_rate_limit(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ResetResponse>, ApiError> {
    let Some(expected) = &state.admin_token else {
        return Err(ApiError::Forbidden(
            "Admin endpoints are disabled (no admin token configured)".into(),
        ));
    };
    let provided = headers
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if provided != expected {
        return Err(ApiError::Forbidden("Invalid admin token".into()));
    }

    let before = state.rate_limiter.tracked_clients();
    state.rate_limiter.reset();
    Ok(Json(ResetResponse {
        status: "ok".into(),
        tracked_clients_before: before,
    }))
}
