//! GET /health.

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use utoipa::ToSchema;

use super::AppState;

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// "healthy" or "degraded".
    pub status: String,
    pub timestamp: String,
    pub components: HealthComponents,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthComponents {
    /// "healthy" / "unhealthy".
    pub db: String,
    /// Circuit breaker state: "closed" / "open" / "half_open".
    pub cache: String,
}

/// Service health, including the database and cache-breaker state.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service health", body = HealthResponse)
    ),
    tag = "health"
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let db_ok = state.store.ping().await;
    let cache_state = state.cache.breaker_state();
    let status = if db_ok && cache_state == "closed" {
        "healthy"
    } else if db_ok {
        // The serving path works without the cache, just slower.
        "degraded"
    } else {
        "unhealthy"
    };
    Json(HealthResponse {
        status: status.to_string(),
        timestamp: Utc::now().to_rfc3339(),
        components: HealthComponents {
            db: if db_ok { "healthy" } else { "unhealthy" }.to_string(),
            cache: cache_state.to_string(),
        },
    })
}
