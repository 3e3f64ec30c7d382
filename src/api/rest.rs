// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Status endpoints live under `/api/v1/`.  The two logging endpoints keep the
// paths the browser dashboard already posts to:
//
//   POST /api/logPrice       {price, movingAverage7, movingAverage30, rsi, timestamp?}
//   POST /api/logPrediction  {prediction}
//
// Both validate every numeric field before touching the ledger: a missing,
// non-numeric or non-finite value is a 400 and nothing is written.  Other
// methods on these paths get axum's 405.
//
// CORS is permissive; the dashboard is served from a different origin.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::error::{IndicatorError, PipelineError};
use crate::types::{LedgerRecord, PredictionRecord, LEDGER_TIME_FORMAT};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Status ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        // ── Ledger logging ──────────────────────────────────────────
        .route("/api/logPrice", post(log_price))
        .route("/api/logPrediction", post(log_prediction))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    cycle_in_flight: bool,
    uptime_secs: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        cycle_in_flight: state.scheduler.is_in_flight(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        server_time: Utc::now().timestamp_millis(),
    };
    Json(resp)
}

// =============================================================================
// Full state snapshot
// =============================================================================

async fn full_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

// =============================================================================
// Ledger logging
// =============================================================================

async fn log_price(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Response {
    let body = match payload {
        Ok(Json(body)) => body,
        Err(rejection) => return bad_request(rejection.body_text()),
    };

    let record = match price_record_from(&body, Utc::now()) {
        Ok(record) => record,
        Err(e) => return bad_request(e.to_string()),
    };

    if let Err(e) = state.ledger.append_price(&record) {
        return ledger_failure(&state, e.into());
    }

    state.record_manual_row();
    info!(price = record.price, timestamp = %record.timestamp, "price logged via API");
    (
        StatusCode::OK,
        Json(json!({ "message": "Price logged successfully" })),
    )
        .into_response()
}

async fn log_prediction(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Response {
    let body = match payload {
        Ok(Json(body)) => body,
        Err(rejection) => return bad_request(rejection.body_text()),
    };

    let prediction = match finite_field(&body, "prediction") {
        Ok(p) => p,
        Err(e) => return bad_request(e.to_string()),
    };

    let record = PredictionRecord::ahead_of(Utc::now(), prediction);
    if let Err(e) = state.ledger.append_prediction(&record) {
        return ledger_failure(&state, e.into());
    }

    state.record_manual_row();
    info!(prediction, timestamp = %record.timestamp, "prediction logged via API");
    (
        StatusCode::OK,
        Json(json!({ "message": "Prediction logged successfully" })),
    )
        .into_response()
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

fn ledger_failure(state: &AppState, e: PipelineError) -> Response {
    warn!(kind = e.kind(), error = %e, "ledger append from API failed");
    state.push_error_with_code(e.to_string(), Some(e.kind().to_string()));
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
        .into_response()
}

// =============================================================================
// Payload validation
// =============================================================================

fn invalid(msg: impl Into<String>) -> IndicatorError {
    IndicatorError::InvalidInput(msg.into())
}

/// Require `name` to be a finite JSON number.
fn finite_field(body: &Value, name: &str) -> Result<f64, IndicatorError> {
    match body.get(name) {
        Some(Value::Number(n)) => n
            .as_f64()
            .filter(|v| v.is_finite())
            .ok_or_else(|| invalid(format!("'{name}' must be a finite number"))),
        Some(Value::Null) | None => Err(invalid(format!("'{name}' is required"))),
        Some(_) => Err(invalid(format!("'{name}' must be a number"))),
    }
}

/// Accepts epoch milliseconds, RFC 3339 or the ledger's own format (UTC).
fn parse_timestamp(value: Option<&Value>, now: DateTime<Utc>) -> Result<DateTime<Utc>, IndicatorError> {
    match value {
        None | Some(Value::Null) => Ok(now),
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| invalid(format!("'timestamp' {n} is not valid epoch milliseconds"))),
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|_| NaiveDateTime::parse_from_str(s, LEDGER_TIME_FORMAT).map(|n| n.and_utc()))
            .map_err(|_| invalid(format!("'timestamp' {s:?} is not a recognised date"))),
        Some(_) => Err(invalid("'timestamp' must be a number or string")),
    }
}

fn price_record_from(body: &Value, now: DateTime<Utc>) -> Result<LedgerRecord, IndicatorError> {
    Ok(LedgerRecord {
        timestamp: parse_timestamp(body.get("timestamp"), now)?,
        price: finite_field(body, "price")?,
        ma7: finite_field(body, "movingAverage7")?,
        ma30: finite_field(body, "movingAverage30")?,
        rsi: finite_field(body, "rsi")?,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::test_state;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn log_price_appends_row() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let app = router(state.clone());

        let resp = app
            .oneshot(post_json(
                "/api/logPrice",
                r#"{"price":50000.126,"movingAverage7":49900,"movingAverage30":49000.5,"rsi":55.5,"timestamp":"2024-05-01 12:00:00"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["message"], "Price logged successfully");

        let content = std::fs::read_to_string(state.ledger.price_path()).unwrap();
        assert_eq!(content, "2024-05-01 12:00:00,50000.13,49900.00,49000.50,55.50\n");
        assert_eq!(state.build_snapshot().manual_rows, 1);
    }

    #[tokio::test]
    async fn log_price_rejects_missing_field_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let app = router(state.clone());

        let resp = app
            .oneshot(post_json(
                "/api/logPrice",
                r#"{"price":50000,"movingAverage7":49900,"rsi":55}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert!(body["error"].as_str().unwrap().contains("movingAverage30"));
        assert!(!state.ledger.price_path().exists());
    }

    #[tokio::test]
    async fn log_price_rejects_string_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let resp = app
            .oneshot(post_json(
                "/api/logPrice",
                r#"{"price":"50000","movingAverage7":1,"movingAverage30":1,"rsi":1}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn malformed_json_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let resp = app
            .oneshot(post_json("/api/logPrediction", "{not json"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(resp).await.get("error").is_some());
    }

    #[tokio::test]
    async fn log_prediction_stamps_one_minute_ahead() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let app = router(state.clone());
        let before = Utc::now();

        let resp = app
            .oneshot(post_json("/api/logPrediction", r#"{"prediction":51234.5}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let content = std::fs::read_to_string(state.ledger.prediction_path()).unwrap();
        let line = content.trim_end();
        assert!(line.ends_with(",51234.50"), "{line}");
        let (ts, _) = line.split_once(',').unwrap();
        let ts = NaiveDateTime::parse_from_str(ts, LEDGER_TIME_FORMAT).unwrap().and_utc();
        let ahead = ts - before;
        assert!(ahead >= chrono::Duration::seconds(59) && ahead <= chrono::Duration::seconds(61));
    }

    #[tokio::test]
    async fn get_on_logging_path_is_method_not_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let resp = app
            .oneshot(Request::builder().uri("/api/logPrice").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn ledger_failure_is_server_error() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the ledger directory should be.
        std::fs::write(dir.path().join("public"), b"x").unwrap();
        let state = test_state(dir.path());
        let app = router(state.clone());

        let resp = app
            .oneshot(post_json("/api/logPrediction", r#"{"prediction":1.0}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(state.recent_errors.read()[0].code.as_deref(), Some("IOError"));
    }

    #[tokio::test]
    async fn health_and_state_respond() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/api/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["cycle_in_flight"], false);

        let resp = app
            .oneshot(Request::builder().uri("/api/v1/state").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["asset"], "bitcoin");
        assert_eq!(body["pipeline"]["phase"], "Idle");
    }

    #[test]
    fn timestamp_formats() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(parse_timestamp(None, now).unwrap(), now);
        let ms = json!(1714564800000i64);
        assert_eq!(parse_timestamp(Some(&ms), now).unwrap().timestamp(), 1714564800);
        let rfc = json!("2024-05-01T12:00:00+02:00");
        assert_eq!(
            parse_timestamp(Some(&rfc), now).unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
        );
        assert!(parse_timestamp(Some(&json!("yesterday")), now).is_err());
        assert!(parse_timestamp(Some(&json!(true)), now).is_err());
    }
}
