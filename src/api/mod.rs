//! HTTP serving layer.
//!
//! The router wires the prediction, feedback, stats, and route endpoints
//! over shared state. A single middleware stamps every response with a
//! request id and processing time and feeds the usage counters; the
//! rate-limit middleware guards only the expensive POST endpoints.

pub mod cache;
pub mod circuit;
pub mod fares_view;
pub mod feedback;
pub mod health;
pub mod predictions;
pub mod rate_limit;
pub mod recommend;
pub mod routes;
pub mod stats;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::store::Store;
use cache::ResponseCache;
use fares_view::FareService;
use rate_limit::{client_fingerprint, RateDecision, RateLimiter};

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub cache: Arc<ResponseCache>,
    pub rate_limiter: Arc<RateLimiter>,
    pub metrics: Arc<ApiMetrics>,
    pub fare_service: Arc<FareService>,
    pub admin_token: Option<String>,
}

impl AppState {
    pub fn new(store: Store, fare_service: FareService, admin_token: Option<String>) -> Self {
        Self {
            cache: Arc::new(ResponseCache::new(store.clone())),
            store,
            rate_limiter: Arc::new(RateLimiter::default()),
            metrics: Arc::new(ApiMetrics::new()),
            fare_service: Arc::new(fare_service),
            admin_token,
        }
    }
}

/// Usage counters surfaced by GET /api/stats.
pub struct ApiMetrics {
    started_at: Instant,
    total_requests: AtomicU64,
    error_count: AtomicU64,
    rate_limit_hits: AtomicU64,
    total_processing_micros: AtomicU64,
}

impl ApiMetrics {
    fn new() -> Self {
        Self {
            started_at: Instant::now(),
            total_requests: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            rate_limit_hits: AtomicU64::new(0),
            total_processing_micros: AtomicU64::new(0),
        }
    }

    fn record(&self, status: StatusCode, elapsed_micros: u64) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_processing_micros
            .fetch_add(elapsed_micros, Ordering::Relaxed);
        if status.is_server_error() {
            self.error_count.fetch_add(1, Ordering::Relaxed);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            self.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let requests = self.total_requests.load(Ordering::Relaxed);
        let micros = self.total_processing_micros.load(Ordering::Relaxed);
        MetricsSnapshot {
            total_requests: requests,
            total_errors: self.error_count.load(Ordering::Relaxed),
            rate_limit_hits: self.rate_limit_hits.load(Ordering::Relaxed),
            avg_processing_ms: if requests > 0 {
                (micros as f64 / requests as f64) / 1000.0
            } else {
                0.0
            },
            uptime_seconds: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub total_errors: u64,
    pub rate_limit_hits: u64,
    pub avg_processing_ms: f64,
    pub uptime_seconds: f64,
}

/// Request id attached by the observability middleware: 16 random hex chars.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

pub fn new_request_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

#[derive(Debug, Serialize, ToSchema)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<FieldError>>,
}

/// Error envelope for every failure a handler can produce.
#[derive(Debug)]
pub enum ApiError {
    Validation(Vec<FieldError>),
    RateLimited { retry_after_secs: u64 },
    NotFound(String),
    Forbidden(String),
    Internal(String),
}

impl ApiError {
    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        warn!(error = %err, "Internal error serving request");
        ApiError::Internal("An unexpected error occurred. Please try again later.".to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(details) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(ErrorResponse {
                    error: "validation_failed".into(),
                    message: "One or more request fields are invalid".into(),
                    request_id: None,
                    details: Some(details),
                }),
            )
                .into_response(),
            ApiError::RateLimited { retry_after_secs } => {
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(ErrorResponse {
                        error: "rate_limited".into(),
                        message: format!(
                            "Rate limit exceeded, retry in {retry_after_secs} seconds"
                        ),
                        request_id: None,
                        details: None,
                    }),
                )
                    .into_response();
                if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                    response.headers_mut().insert("retry-after", value);
                }
                response
            }
            ApiError::NotFound(message) => (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse {
                    error: "not_found".into(),
                    message,
                    request_id: None,
                    details: None,
                }),
            )
                .into_response(),
            ApiError::Forbidden(message) => (
                StatusCode::FORBIDDEN,
                Json(ErrorResponse {
                    error: "forbidden".into(),
                    message,
                    request_id: None,
                    details: None,
                }),
            )
                .into_response(),
            ApiError::Internal(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "internal_error".into(),
                    message,
                    request_id: None,
                    details: None,
                }),
            )
                .into_response(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let rate_limited = Router::new()
        .route("/predict", post(predictions::predict_endpoint))
        .route("/feedback", post(feedback::submit_feedback))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            enforce_rate_limit,
        ));

    let api = Router::new()
        .merge(rate_limited)
        .route("/stats", get(stats::usage_stats))
        .route("/reset-rate-limit", post(stats::reset_rate_limit))
        .route(
            "/routes/:origin/:destination/stops",
            get(routes::route_stops),
        )
        .route("/routes/popular", get(routes::popular_routes));

    Router::new()
        .route("/health", get(health::health_check))
        .nest("/api", api)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            observability,
        ))
        .with_state(state)
}

/// Stamp X-Request-ID / X-Process-Time, log the request, feed the counters.
async fn observability(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let start = Instant::now();
    let request_id = new_request_id();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    request
        .extensions_mut()
        .insert(RequestId(request_id.clone()));

    let mut response = next.run(request).await;

    let elapsed = start.elapsed();
    let status = response.status();
    state.metrics.record(status, elapsed.as_micros() as u64);

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert("x-request-id", value);
    }
    let millis = format!("{:.2}", elapsed.as_secs_f64() * 1000.0);
    if let Ok(value) = HeaderValue::from_str(&millis) {
        headers.insert("x-process-time", value);
    }
    info!(
        method = %method,
        path = %path,
        status = status.as_u16(),
        elapsed_ms = %millis,
        request_id = %request_id,
        "Request handled"
    );
    response
}

/// Per-client limiter on the POST endpoints.
async fn enforce_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let user_agent = request
        .headers()
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let client_id = client_fingerprint(&ip, &user_agent);

    match state.rate_limiter.is_allowed(&client_id) {
        RateDecision::Allowed => next.run(request).await,
        RateDecision::Limited { retry_after_secs } => {
            ApiError::RateLimited { retry_after_secs }.into_response()
        }
    }
}
