//! POST /api/feedback.
//!
//! Feedback rows are stored for offline analysis only; they never feed the
//! statistics tables.

use axum::extract::State;
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::{new_request_id, ApiError, AppState, FieldError, RequestId};

const MAX_COMMENT_CHARS: usize = 500;

#[derive(Debug, Deserialize, ToSchema)]
pub struct FeedbackRequest {
    /// The prediction request this feedback refers to.
    pub request_id: String,
    /// Actual delay experienced, minutes.
    #[serde(default)]
    pub actual_delay_minutes: Option<i64>,
    #[serde(default)]
    pub was_cancelled: bool,
    /// Rating, 1-5.
    pub rating: i64,
    #[serde(default)]
    pub comment: Option<String>,
}

impl FeedbackRequest {
    fn validate(&self) -> Result<(), Vec<FieldError>> {
        let mut errors = Vec::new();
        if self.request_id.trim().is_empty() {
            errors.push(FieldError {
                field: "request_id".into(),
                message: "must not be empty".into(),
            });
        }
        if !(1..=5).contains(&self.rating) {
            errors.push(FieldError {
                field: "rating".into(),
                message: "must be between 1 and 5".into(),
            });
        }
        if let Some(comment) = &self.comment {
            if comment.chars().count() > MAX_COMMENT_CHARS {
                errors.push(FieldError {
                    field: "comment".into(),
                    message: format!("must be at most {MAX_COMMENT_CHARS} characters"),
                });
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct FeedbackResponse {
    pub feedback_id: String,
    pub received_at: String,
}

/// Record feedback about a previous prediction.
#[utoipa::path(
    post,
    path = "/api/feedback",
    request_body = FeedbackRequest,
    responses(
        (status = 201, description = "Feedback stored", body = FeedbackResponse),
        (status = 422, description = "Invalid input", body = super::ErrorResponse),
        (status = 429, description = "Rate limit exceeded", body = super::ErrorResponse)
    ),
    tag = "feedback"
)]
pub async fn submit_feedback(
    State(state): State<AppState>,
    Extension(_request_id): Extension<RequestId>,
    Json(request): Json<FeedbackRequest>,
) -> Result<(StatusCode, Json<FeedbackResponse>), ApiError> {
    request.validate().map_err(ApiError::Validation)?;

    let feedback_id = format!("fb_{}", new_request_id());
    let received_at = Utc::now();
    state
        .store
        .insert_feedback(
            &feedback_id,
            &request.request_id,
            request.actual_delay_minutes,
            request.was_cancelled,
            request.rating,
            request.comment.as_deref(),
            received_at,
        )
        .await
        .map_err(ApiError::internal)?;

    Ok((
        StatusCode::CREATED,
        Json(FeedbackResponse {
            feedback_id,
            received_at: received_at.to_rfc3339(),
        }),
    ))
}
