//! Route information endpoints: intermediate stops and popular routes.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::cache::{cache_key, CacheTtl};
use super::{ApiError, AppState, FieldError};
use crate::ingest::normalize::is_valid_crs;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RouteStop {
    pub location: String,
    pub stop_sequence: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_arrival: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_departure: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RouteStopsResponse {
    pub origin: String,
    pub destination: String,
    /// "timetable" when a future-timetable import answered, else "observed".
    pub data_source: String,
    pub stops: Vec<RouteStop>,
}

/// Ordered intermediate stops for a route.
#[utoipa::path(
    get,
    path = "/api/routes/{origin}/{destination}/stops",
    params(
        ("origin" = String, Path, description = "Origin CRS code"),
        ("destination" = String, Path, description = "Destination CRS code")
    ),
    responses(
        (status = 200, description = "Ordered stops", body = RouteStopsResponse),
        (status = 404, description = "Route unknown", body = super::ErrorResponse),
        (status = 422, description = "Invalid CRS code", body = super::ErrorResponse)
    ),
    tag = "routes"
)]
pub async fn route_stops(
    State(state): State<AppState>,
    Path((origin, destination)): Path<(String, String)>,
) -> Result<Json<RouteStopsResponse>, ApiError> {
    let mut errors = Vec::new();
    if !is_valid_crs(&origin) {
        errors.push(FieldError {
            field: "origin".into(),
            message: "must be a 3-letter uppercase CRS code".into(),
        });
    }
    if !is_valid_crs(&destination) {
        errors.push(FieldError {
            field: "destination".into(),
            message: "must be a 3-letter uppercase CRS code".into(),
        });
    }
    if !errors.is_empty() {
        return Err(ApiError::Validation(errors));
    }

    let result = state
        .store
        .route_stops(&origin, &destination)
        .await
        .map_err(ApiError::internal)?;
    let Some((stops, data_source)) = result else {
        return Err(ApiError::NotFound(format!(
            "No stop data recorded for {origin}-{destination}"
        )));
    };

    Ok(Json(RouteStopsResponse {
        origin,
        destination,
        data_source: data_source.to_string(),
        stops: stops
            .into_iter()
            .map(|s| RouteStop {
                location: s.location,
                stop_sequence: s.stop_sequence,
                scheduled_arrival: s.scheduled_arrival,
                scheduled_departure: s.scheduled_departure,
            })
            .collect(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct PopularQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    10
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PopularRoute {
    pub origin: String,
    pub destination: String,
    pub total_services: i64,
    pub on_time_percentage: f64,
    pub avg_delay_minutes: f64,
    pub reliability_grade: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PopularRoutesResponse {
    pub routes: Vec<PopularRoute>,
}

/// Most-observed routes with their latest statistics, cached for 30 minutes.
#[utoipa::path(
    get,
    path = "/api/routes/popular",
    responses(
        (status = 200, description = "Popular routes", body = PopularRoutesResponse)
    ),
    tag = "routes"
)]
pub async fn popular_routes(
    State(state): State<AppState>,
    Query(query): Query<PopularQuery>,
) -> Result<Json<PopularRoutesResponse>, ApiError> {
    let limit = query.limit.clamp(1, 50);
    let limit_str = limit.to_string();
    let key = cache_key("popular_routes", &[("limit", &limit_str)]);
    if let Some(payload) = state.cache.get(&key).await {
        if let Ok(response) = serde_json::from_str::<PopularRoutesResponse>(&payload) {
            return Ok(Json(response));
        }
    }

    let rows = state
        .store
        .top_routes(limit)
        .await
        .map_err(ApiError::internal)?;
    let response = PopularRoutesResponse {
        routes: rows
            .into_iter()
            .map(|r| PopularRoute {
                origin: r.origin,
                destination: r.destination,
                total_services: r.total_services,
                on_time_percentage: r.on_time_percentage,
                avg_delay_minutes: r.avg_delay_minutes,
                reliability_grade: r.reliability_grade,
            })
            .collect(),
    };
    if let Ok(payload) = serde_json::to_string(&response) {
        state
            .cache
            .put(&key, &payload, CacheTtl::PopularRoutes)
            .await;
    }
    Ok(Json(response))
}
