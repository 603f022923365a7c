//! POST /api/predict — the main serving endpoint.

use axum::extract::State;
use axum::{Extension, Json};
use chrono::{Days, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::cache::{cache_key, CacheTtl};
use super::fares_view::FareComparison;
use super::recommend::{build_recommendations, Recommendation};
use super::{ApiError, AppState, FieldError, RequestId};
use crate::ingest::normalize::is_valid_crs;
use crate::predict::{self, Prediction};

/// How far ahead a journey may be queried, days.
const MAX_LOOKAHEAD_DAYS: u64 = 90;

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct PredictRequest {
    /// Origin station CRS code, e.g. "EUS".
    pub origin: String,
    /// Destination station CRS code, e.g. "MAN".
    pub destination: String,
    /// Departure date, YYYY-MM-DD, today to today+90.
    pub departure_date: String,
    /// Departure time, HH:MM (24-hour).
    pub departure_time: String,
    #[serde(default)]
    pub include_fares: bool,
    /// Optional operator (TOC) code narrowing the prediction.
    #[serde(default)]
    pub operator: Option<String>,
}

#[derive(Debug)]
pub struct ValidatedPredict {
    pub origin: String,
    pub destination: String,
    pub departure: NaiveDateTime,
    pub departure_date: String,
    pub departure_time: String,
    pub include_fares: bool,
    pub operator: Option<String>,
}

impl PredictRequest {
    pub fn validate(self) -> Result<ValidatedPredict, Vec<FieldError>> {
        let mut errors = Vec::new();

        if !is_valid_crs(&self.origin) {
            errors.push(FieldError {
                field: "origin".into(),
                message: "must be a 3-letter uppercase CRS code".into(),
            });
        }
        if !is_valid_crs(&self.destination) {
            errors.push(FieldError {
                field: "destination".into(),
                message: "must be a 3-letter uppercase CRS code".into(),
            });
        }

        let date = match self.departure_date.parse::<NaiveDate>() {
            Ok(date) => {
                let today = Utc::now().date_naive();
                if date < today {
                    errors.push(FieldError {
                        field: "departure_date".into(),
                        message: "must not be in the past".into(),
                    });
                    None
                } else if date > today + Days::new(MAX_LOOKAHEAD_DAYS) {
                    errors.push(FieldError {
                        field: "departure_date".into(),
                        message: format!("must be within {MAX_LOOKAHEAD_DAYS} days"),
                    });
                    None
                } else {
                    Some(date)
                }
            }
            Err(_) => {
                errors.push(FieldError {
                    field: "departure_date".into(),
                    message: "must be YYYY-MM-DD".into(),
                });
                None
            }
        };

        let time = match NaiveTime::parse_from_str(&self.departure_time, "%H:%M") {
            Ok(time) if self.departure_time.len() == 5 => Some(time),
            _ => {
                errors.push(FieldError {
                    field: "departure_time".into(),
                    message: "must be HH:MM (24-hour)".into(),
                });
                None
            }
        };

        match (date, time) {
            (Some(date), Some(time)) if errors.is_empty() => Ok(ValidatedPredict {
                origin: self.origin,
                destination: self.destination,
                departure: date.and_time(time),
                departure_date: self.departure_date,
                departure_time: self.departure_time,
                include_fares: self.include_fares,
                operator: self.operator,
            }),
            _ => Err(errors),
        }
    }
}

/// The cacheable part of a prediction response; the request-scoped envelope
/// (id, timing) is rebuilt per request.
#[derive(Debug, Serialize, Deserialize)]
struct CachedCore {
    prediction: Prediction,
    fares: Option<FareComparison>,
    recommendations: Vec<Recommendation>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PredictionResponse {
    pub request_id: String,
    pub origin: String,
    pub destination: String,
    pub departure_datetime: String,
    pub prediction: Prediction,
    pub fares: Option<FareComparison>,
    pub recommendations: Vec<Recommendation>,
    pub explanation: String,
    pub metadata: ResponseMetadata,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ResponseMetadata {
    pub processing_time_ms: f64,
    pub cache_hit: bool,
}

/// Predict the delay for a journey and optionally compare fares.
#[utoipa::path(
    post,
    path = "/api/predict",
    request_body = PredictRequest,
    responses(
        (status = 200, description = "Prediction with optional fares", body = PredictionResponse),
        (status = 422, description = "Invalid input", body = super::ErrorResponse),
        (status = 429, description = "Rate limit exceeded", body = super::ErrorResponse),
        (status = 500, description = "Internal error", body = super::ErrorResponse)
    ),
    tag = "predictions"
)]
pub async fn predict_endpoint(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Json(request): Json<PredictRequest>,
) -> Result<Json<PredictionResponse>, ApiError> {
    let started = std::time::Instant::now();
    let validated = request.validate().map_err(ApiError::Validation)?;

    let include_fares_str = validated.include_fares.to_string();
    let key = cache_key(
        "prediction",
        &[
            ("origin", &validated.origin),
            ("destination", &validated.destination),
            ("departure_date", &validated.departure_date),
            ("departure_time", &validated.departure_time),
            ("include_fares", &include_fares_str),
            ("operator", validated.operator.as_deref().unwrap_or("")),
        ],
    );

    let (core, cache_hit) = match state.cache.get(&key).await {
        Some(payload) => match serde_json::from_str::<CachedCore>(&payload) {
            Ok(core) => (core, true),
            // A stale schema in the cache is a miss, not an error.
            Err(_) => (compute_core(&state, &validated).await?, false),
        },
        None => {
            let core = compute_core(&state, &validated).await?;
            if let Ok(payload) = serde_json::to_string(&core) {
                state.cache.put(&key, &payload, CacheTtl::Prediction).await;
            }
            (core, false)
        }
    };

    let explanation = core.prediction.explanation.clone();
    Ok(Json(PredictionResponse {
        request_id: request_id.0,
        origin: validated.origin,
        destination: validated.destination,
        departure_datetime: validated.departure.format("%Y-%m-%dT%H:%M:%S").to_string(),
        prediction: core.prediction,
        fares: core.fares,
        recommendations: core.recommendations,
        explanation,
        metadata: ResponseMetadata {
            processing_time_ms: started.elapsed().as_secs_f64() * 1000.0,
            cache_hit,
        },
    }))
}

/// The prediction and the fare lookup run concurrently and join here.
async fn compute_core(
    state: &AppState,
    request: &ValidatedPredict,
) -> Result<CachedCore, ApiError> {
    let prediction_fut = predict::predict(
        &state.store,
        &request.origin,
        &request.destination,
        request.departure,
        request.operator.as_deref(),
    );
    let fares_fut = async {
        if request.include_fares {
            state
                .fare_service
                .comparison(&request.origin, &request.destination)
                .await
        } else {
            None
        }
    };
    let (prediction, fares) = tokio::join!(prediction_fut, fares_fut);
    let prediction = prediction.map_err(ApiError::internal)?;
    let recommendations = build_recommendations(&prediction, fares.as_ref());
    Ok(CachedCore {
        prediction,
        fares,
        recommendations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(origin: &str, date: &str, time: &str) -> PredictRequest {
        PredictRequest {
            origin: origin.into(),
            destination: "MAN".into(),
            departure_date: date.into(),
            departure_time: time.into(),
            include_fares: false,
            operator: None,
        }
    }

    fn tomorrow() -> String {
        (Utc::now().date_naive() + Days::new(1)).to_string()
    }

    #[test]
    fn valid_request_passes() {
        let validated = request("EUS", &tomorrow(), "09:30").validate().unwrap();
        assert_eq!(validated.origin, "EUS");
        assert_eq!(validated.departure.format("%H:%M").to_string(), "09:30");
    }

    #[test]
    fn lowercase_crs_is_rejected() {
        let errors = request("eus", &tomorrow(), "09:30").validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "origin");
    }

    #[test]
    fn past_date_is_rejected() {
        let errors = request("EUS", "2020-01-01", "09:30")
            .validate()
            .unwrap_err();
        assert!(errors.iter().any(|e| e.field == "departure_date"));
    }

    #[test]
    fn far_future_date_is_rejected() {
        let date = (Utc::now().date_naive() + Days::new(120)).to_string();
        let errors = request("EUS", &date, "09:30").validate().unwrap_err();
        assert!(errors.iter().any(|e| e.field == "departure_date"));
    }

    #[test]
    fn bad_time_is_rejected() {
        for time in ["9:30am", "25:00", "0930", "09:61"] {
            let errors = request("EUS", &tomorrow(), time).validate().unwrap_err();
            assert!(
                errors.iter().any(|e| e.field == "departure_time"),
                "{time} should be rejected"
            );
        }
    }

    #[test]
    fn multiple_errors_are_collected() {
        let errors = request("e", "not-a-date", "nope").validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }
}
