//! End-to-end scenarios: seeded store -> aggregator -> HTTP API.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{Datelike, Days, NaiveDate, Utc, Weekday};
use serde_json::{json, Value};
use tower::ServiceExt;

use railfair::api::fares_view::FareService;
use railfair::api::{self, AppState};
use railfair::ingest::normalize::{parse_hhmm_utc, NormalizedMetric, NormalizedStop};
use railfair::stats::Aggregator;
use railfair::store::Store;

async fn test_state() -> (AppState, Store) {
    let store = Store::connect_in_memory().await.unwrap();
    let state = AppState::new(
        store.clone(),
        FareService::read_only(store.clone()),
        Some("secret-admin".to_string()),
    );
    (state, store)
}

fn app(state: AppState) -> Router {
    api::router(state)
}

/// 1000 arrivals at MAN for EUS-MAN: 70% within 5 minutes, mean delay 4.2.
async fn seed_route(store: &Store) {
    let date = NaiveDate::from_ymd_opt(2025, 11, 10).unwrap();
    let metric = NormalizedMetric {
        origin: "EUS".into(),
        destination: "MAN".into(),
        scheduled_departure: Some("0900".into()),
        scheduled_arrival: Some("1110".into()),
        toc_code: "VT".into(),
        matched_services_count: 1000,
        rids: vec![],
    };

    let mut stops = Vec::new();
    for i in 0..1000u32 {
        let delay: i64 = if i < 350 {
            1
        } else if i < 700 {
            5
        } else {
            7
        };
        let sched = parse_hhmm_utc(date, "0900");
        stops.push(NormalizedStop {
            rid: format!("R{i:04}"),
            date_of_service: date,
            toc_code: "VT".into(),
            location: "MAN".into(),
            stop_sequence: 5,
            scheduled_departure: sched,
            scheduled_arrival: sched,
            actual_departure: sched,
            actual_arrival: sched.map(|t| t + chrono::Duration::minutes(delay)),
            departure_delay_minutes: Some(delay as i32),
            arrival_delay_minutes: Some(delay as i32),
            cancellation_reason: None,
        });
    }
    store.commit_batch(&[metric], &stops).await.unwrap();

    Aggregator::with_calculation_date(store.clone(), date)
        .recompute()
        .await
        .unwrap();
}

fn next_weekday(target: Weekday) -> NaiveDate {
    let mut date = Utc::now().date_naive() + Days::new(1);
    while date.weekday() != target {
        date = date + Days::new(1);
    }
    date
}

fn predict_body(origin: &str, destination: &str, date: NaiveDate, time: &str) -> Body {
    Body::from(
        json!({
            "origin": origin,
            "destination": destination,
            "departure_date": date.to_string(),
            "departure_time": time,
        })
        .to_string(),
    )
}

async fn post_predict(app: &Router, body: Body) -> (StatusCode, Value, axum::http::HeaderMap) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/predict")
                .header("content-type", "application/json")
                .body(body)
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value, headers)
}

#[tokio::test]
async fn well_sampled_route_gets_high_confidence_prediction() {
    let (state, store) = test_state().await;
    seed_route(&store).await;
    let app = app(state);

    let tuesday = next_weekday(Weekday::Tue);
    let (status, body, headers) =
        post_predict(&app, predict_body("EUS", "MAN", tuesday, "09:30")).await;
    assert_eq!(status, StatusCode::OK);

    let prediction = &body["prediction"];
    assert_eq!(prediction["confidence"], "HIGH");
    assert_eq!(prediction["sample_size"], 1000);
    assert_eq!(prediction["is_degraded"], false);

    // Mean delay 4.2 scaled by the 1.15 morning-peak factor.
    let expected = prediction["expected_delay_minutes"].as_f64().unwrap();
    assert!((4.5..=5.5).contains(&expected), "expected {expected}");
    assert_eq!(expected, 4.8);

    // 0.70 base through the inverse adjustment: 0.70 * (2 - 1.15).
    let on_time = prediction["on_time_probability"].as_f64().unwrap();
    assert!((on_time - 0.595).abs() < 1e-9, "on_time {on_time}");

    // Observability headers ride on every response.
    let request_id = headers.get("x-request-id").unwrap().to_str().unwrap();
    assert_eq!(request_id.len(), 16);
    assert!(request_id.bytes().all(|b| b.is_ascii_hexdigit()));
    assert!(headers.contains_key("x-process-time"));

    assert_eq!(body["metadata"]["cache_hit"], false);
    // An identical request is answered from the cache.
    let (_, body2, _) = post_predict(&app, predict_body("EUS", "MAN", tuesday, "09:30")).await;
    assert_eq!(body2["metadata"]["cache_hit"], true);
    assert_eq!(
        body2["prediction"]["expected_delay_minutes"],
        body["prediction"]["expected_delay_minutes"]
    );
}

#[tokio::test]
async fn unknown_route_degrades_to_industry_floor() {
    let (state, _) = test_state().await;
    let app = app(state);

    // Midday on a weekday: adjustment factors are neutral.
    let tuesday = next_weekday(Weekday::Tue);
    let (status, body, _) = post_predict(&app, predict_body("XXX", "YYY", tuesday, "12:00")).await;
    assert_eq!(status, StatusCode::OK);

    let prediction = &body["prediction"];
    assert_eq!(prediction["is_degraded"], true);
    assert_eq!(prediction["degradation_reason"], "no_route_data");
    assert_eq!(prediction["confidence"], "VERY_LOW");
    assert_eq!(prediction["level"], "industry_floor");
    let on_time = prediction["on_time_probability"].as_f64().unwrap();
    assert!((on_time - 0.64).abs() < 1e-9);
    assert_eq!(prediction["expected_delay_minutes"].as_f64().unwrap(), 4.0);
}

#[tokio::test]
async fn weekend_queries_scale_by_the_weekend_factor() {
    let (state, store) = test_state().await;
    seed_route(&store).await;
    let app = app(state);

    let tuesday = next_weekday(Weekday::Tue);
    let (_, tue_body, _) = post_predict(&app, predict_body("EUS", "MAN", tuesday, "09:30")).await;
    let tue_delay = tue_body["prediction"]["expected_delay_minutes"]
        .as_f64()
        .unwrap();
    assert_eq!(tue_delay, 4.8);

    let saturday = next_weekday(Weekday::Sat);
    let (_, sat_body, _) = post_predict(&app, predict_body("EUS", "MAN", saturday, "09:30")).await;
    let sat_delay = sat_body["prediction"]["expected_delay_minutes"]
        .as_f64()
        .unwrap();
    // 4.2 * 1.15 * 0.90 rounded to one decimal.
    assert_eq!(sat_delay, 4.3);
    assert!(sat_delay < tue_delay);
}

#[tokio::test]
async fn request_101_in_a_burst_is_rate_limited() {
    let (state, store) = test_state().await;
    seed_route(&store).await;
    let app = app(state);
    let tuesday = next_weekday(Weekday::Tue);

    for i in 0..100 {
        let (status, _, _) =
            post_predict(&app, predict_body("EUS", "MAN", tuesday, "09:30")).await;
        assert_eq!(status, StatusCode::OK, "request {} should pass", i + 1);
    }
    let (status, _, headers) =
        post_predict(&app, predict_body("EUS", "MAN", tuesday, "09:30")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = headers
        .get("retry-after")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after <= 60);
}

#[tokio::test]
async fn invalid_input_returns_422_with_field_errors() {
    let (state, _) = test_state().await;
    let app = app(state);

    let body = Body::from(
        json!({
            "origin": "eus",
            "destination": "MANCHESTER",
            "departure_date": "2020-01-01",
            "departure_time": "9am",
        })
        .to_string(),
    );
    let (status, value, _) = post_predict(&app, body).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(value["error"], "validation_failed");
    let details = value["details"].as_array().unwrap();
    let fields: Vec<&str> = details
        .iter()
        .map(|d| d["field"].as_str().unwrap())
        .collect();
    assert!(fields.contains(&"origin"));
    assert!(fields.contains(&"destination"));
    assert!(fields.contains(&"departure_date"));
    assert!(fields.contains(&"departure_time"));
}

#[tokio::test]
async fn feedback_is_stored_with_201() {
    let (state, _) = test_state().await;
    let app = app(state);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/feedback")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({
                        "request_id": "abcdef0123456789",
                        "actual_delay_minutes": 15,
                        "was_cancelled": false,
                        "rating": 4,
                        "comment": "Prediction was fairly accurate"
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value: Value = serde_json::from_slice(&bytes).unwrap();
    assert!(value["feedback_id"].as_str().unwrap().starts_with("fb_"));
    assert!(value["received_at"].is_string());
}

#[tokio::test]
async fn health_reports_components() {
    let (state, _) = test_state().await;
    let app = app(state);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(value["status"], "healthy");
    assert_eq!(value["components"]["db"], "healthy");
    assert_eq!(value["components"]["cache"], "closed");
}

#[tokio::test]
async fn reset_rate_limit_requires_admin_token() {
    let (state, _) = test_state().await;
    let app = app(state);

    let request = |token: Option<&str>| {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/reset-rate-limit");
        if let Some(token) = token {
            builder = builder.header("x-admin-token", token);
        }
        builder.body(Body::empty()).unwrap()
    };

    let response = app.clone().oneshot(request(None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let response = app.clone().oneshot(request(Some("wrong"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let response = app
        .oneshot(request(Some("secret-admin")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn route_stops_prefer_timetable_over_observed() {
    let (state, store) = test_state().await;

    // Observed service calling at EUS, MKC, MAN.
    let date = NaiveDate::from_ymd_opt(2025, 11, 10).unwrap();
    let sched = parse_hhmm_utc(date, "0900");
    let stops: Vec<NormalizedStop> = ["EUS", "MKC", "MAN"]
        .iter()
        .enumerate()
        .map(|(i, loc)| NormalizedStop {
            rid: "R9000".into(),
            date_of_service: date,
            toc_code: "VT".into(),
            location: (*loc).into(),
            stop_sequence: i as i64,
            scheduled_departure: sched,
            scheduled_arrival: sched,
            actual_departure: None,
            actual_arrival: None,
            departure_delay_minutes: None,
            arrival_delay_minutes: None,
            cancellation_reason: None,
        })
        .collect();
    store.commit_batch(&[], &stops).await.unwrap();

    let app = app(state);
    let get_stops = |app: Router| async move {
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/routes/EUS/MAN/stops")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice::<Value>(&bytes).unwrap())
    };

    let (status, value) = get_stops(app.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["data_source"], "observed");
    let locations: Vec<&str> = value["stops"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["location"].as_str().unwrap())
        .collect();
    assert_eq!(locations, vec!["EUS", "MKC", "MAN"]);

    // A future-timetable import takes precedence once present.
    sqlx::query(
        "INSERT INTO timetable_stops (origin, destination, stop_sequence, location)
         VALUES ('EUS', 'MAN', 0, 'EUS'), ('EUS', 'MAN', 1, 'WFJ'), ('EUS', 'MAN', 2, 'MAN')",
    )
    .execute(store.pool())
    .await
    .unwrap();

    let (_, value) = get_stops(app).await;
    assert_eq!(value["data_source"], "timetable");
    let locations: Vec<&str> = value["stops"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["location"].as_str().unwrap())
        .collect();
    assert_eq!(locations, vec!["EUS", "WFJ", "MAN"]);
}

#[tokio::test]
async fn unknown_route_stops_is_404() {
    let (state, _) = test_state().await;
    let app = app(state);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/routes/AAA/BBB/stops")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn rerunning_the_aggregator_reproduces_every_numeric_field() {
    let (_, store) = test_state().await;
    seed_route(&store).await;
    let first = store.latest_route_stat("EUS", "MAN").await.unwrap().unwrap();

    let date = NaiveDate::from_ymd_opt(2025, 11, 10).unwrap();
    Aggregator::with_calculation_date(store.clone(), date)
        .recompute()
        .await
        .unwrap();
    let second = store.latest_route_stat("EUS", "MAN").await.unwrap().unwrap();

    assert_eq!(first.total_services, second.total_services);
    assert_eq!(first.on_time_percentage, second.on_time_percentage);
    assert_eq!(first.time_to_5_percentage, second.time_to_5_percentage);
    assert_eq!(first.avg_delay_minutes, second.avg_delay_minutes);
    assert_eq!(first.median_delay_minutes, second.median_delay_minutes);
    assert_eq!(first.std_delay_minutes, second.std_delay_minutes);
    assert_eq!(first.reliability_score, second.reliability_score);
    assert_eq!(first.hourly_stats, second.hourly_stats);
    assert_eq!(first.day_of_week_stats, second.day_of_week_stats);

    // The seeded split: PPM-5 70%, PPM-10 100%, mean 4.2, grade B.
    assert_eq!(first.time_to_5_percentage, 70.0);
    assert_eq!(first.time_to_10_percentage, 100.0);
    assert!((first.avg_delay_minutes - 4.2).abs() < 1e-9);
    assert_eq!(first.reliability_grade, "B");
}

#[tokio::test]
async fn api_stats_counts_requests_and_rate_limit_hits() {
    let (state, _) = test_state().await;
    let app = app(state);

    let tuesday = next_weekday(Weekday::Tue);
    let _ = post_predict(&app, predict_body("XXX", "YYY", tuesday, "12:00")).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/stats")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value: Value = serde_json::from_slice(&bytes).unwrap();
    assert!(value["total_requests"].as_u64().unwrap() >= 1);
    assert_eq!(value["rate_limit_hits"].as_u64().unwrap(), 0);
    assert!(value["avg_processing_ms"].as_f64().unwrap() >= 0.0);
}
