//! HTTP wire surface: `/v1/fill`, `/v1/intent`, `/v1/postback`,
//! `/v1/reports`, `/v1/delivery`, `/healthz` (spec §6).

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;

use flyback_schema::schemas::REPORT_VIEW;
use flyback_types::FlybackError;
use tracing::warn;

use crate::commands::{self, CommandError};
use crate::state::AppState;

/// `CommandError` is the axum handler boundary `FlybackError`'s own doc
/// comment names — every crate-local command error converts into the
/// shared taxonomy here before being turned into a wire response.
impl From<CommandError> for FlybackError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Invalid(code) => FlybackError::Validation { message: code.clone(), code },
            CommandError::WriteDisabled => FlybackError::Contention("write_disabled".into()),
            CommandError::TokenNotFound => FlybackError::Referential("token_not_found".into()),
            CommandError::Expired => FlybackError::Conflict("expired".into()),
            CommandError::AlreadyExpired => FlybackError::Conflict("already_expired".into()),
            CommandError::Engine(e) => FlybackError::Fatal(e.to_string()),
        }
    }
}

/// Wire mapping for the shared error taxonomy (spec §4.M / §7).
fn flyback_error_response(err: FlybackError) -> Response {
    let (status, code) = match &err {
        FlybackError::Validation { code, .. } => (StatusCode::BAD_REQUEST, code.clone()),
        FlybackError::Referential(code) => (StatusCode::NOT_FOUND, code.clone()),
        FlybackError::Conflict(code) => (StatusCode::GONE, code.clone()),
        FlybackError::Contention(code) => (StatusCode::SERVICE_UNAVAILABLE, code.clone()),
        FlybackError::Delivery(_) => (StatusCode::BAD_GATEWAY, "delivery_error".to_string()),
        FlybackError::Fatal(_) | FlybackError::Io(_) | FlybackError::Serde(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "internal_error".to_string())
        }
    };
    (status, Json(json!({ "error": code }))).into_response()
}

#[derive(Debug, Deserialize)]
pub struct FillRequest {
    publisher_id: String,
    size: Option<String>,
}

async fn fill_handler(State(state): State<AppState>, Json(req): Json<FillRequest>) -> Response {
    match commands::fill(&state, &req.publisher_id, req.size).await {
        Ok(reply) => (StatusCode::OK, Json(reply)).into_response(),
        Err(e) => flyback_error_response(e.into()),
    }
}

#[derive(Debug, Deserialize)]
pub struct IntentRequest {
    campaign: String,
    publisher: String,
    creative: String,
    intent_type: String,
    dwell_seconds: Option<f64>,
    interaction_count: Option<u32>,
    parent_intent_id: Option<String>,
}

async fn intent_handler(State(state): State<AppState>, Json(req): Json<IntentRequest>) -> Response {
    match commands::intent(
        &state,
        &req.campaign,
        &req.publisher,
        &req.creative,
        &req.intent_type,
        req.dwell_seconds,
        req.interaction_count,
        req.parent_intent_id,
    )
    .await
    {
        Ok(reply) => (StatusCode::OK, Json(reply)).into_response(),
        Err(e) => flyback_error_response(e.into()),
    }
}

#[derive(Debug, Deserialize)]
pub struct PostbackQuery {
    token_id: String,
    value: Option<f64>,
    stage: Option<String>,
    outcome_type: Option<String>,
}

async fn postback_handler(State(state): State<AppState>, Query(q): Query<PostbackQuery>) -> Response {
    match commands::postback(&state, &q.token_id, q.value, q.stage, q.outcome_type).await {
        Ok(reply) => (StatusCode::OK, Json(reply)).into_response(),
        Err(e) => flyback_error_response(e.into()),
    }
}

#[derive(Debug, Deserialize)]
pub struct ReportsQuery {
    publisher_id: String,
    #[serde(default)]
    include_selections: bool,
}

async fn reports_handler(State(state): State<AppState>, Query(q): Query<ReportsQuery>) -> Response {
    let view = state.engine.read_view().await;
    let selections = if q.include_selections { state.selection.last_decisions(50).await } else { Vec::new() };
    let cursor = state.delivery.cursor().await;
    let dlq_depth = state.delivery.dlq_depth().await.unwrap_or(0);
    let delivery_health = Some(flyback_selection::DeliveryHealth { cursor, dlq_depth });

    match flyback_selection::build_report(&view, &state.registry, &q.publisher_id, 10, selections, delivery_health) {
        Some(report) => {
            match serde_json::to_value(&report) {
                Ok(value) => {
                    if let Err(violations) = REPORT_VIEW.validate(&value) {
                        let message = violations.into_iter().map(|v| v.to_string()).collect::<Vec<_>>().join("; ");
                        warn!(publisher_id = %q.publisher_id, %message, "report view failed schema validation");
                    }
                }
                Err(e) => warn!(publisher_id = %q.publisher_id, error = %e, "report view failed to serialize for validation"),
            }
            (StatusCode::OK, Json(report)).into_response()
        }
        None => (StatusCode::NOT_FOUND, Json(json!({ "error": "publisher_unknown" }))).into_response(),
    }
}

#[derive(Debug, Serialize)]
struct DlqSummary {
    count: u64,
    last_entry: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct DeliveryStatus {
    last_delivered_seq: u64,
    last_attempt_at: Option<chrono::DateTime<chrono::Utc>>,
    last_event_seq: u64,
    delivery_lag: u64,
    retry_count: u32,
    dlq: DlqSummary,
}

async fn delivery_handler(State(state): State<AppState>) -> Response {
    let cursor = state.delivery.cursor().await;
    let last_event_seq = state.engine.read_view().await.applied_seq;
    let dlq_depth = state.delivery.dlq_depth().await.unwrap_or(0);
    let body = DeliveryStatus {
        last_delivered_seq: cursor.last_delivered_seq,
        last_attempt_at: cursor.last_attempt_at,
        last_event_seq,
        delivery_lag: last_event_seq.saturating_sub(cursor.last_delivered_seq),
        retry_count: cursor.retry_count,
        dlq: DlqSummary { count: dlq_depth, last_entry: None },
    };
    (StatusCode::OK, Json(body)).into_response()
}

async fn healthz_handler(State(state): State<AppState>) -> Response {
    let role = format!("{:?}", state.config.role).to_lowercase();
    (StatusCode::OK, Json(json!({ "status": "ok", "role": role }))).into_response()
}

/// Build the router, attaching rate limiting, security headers, and
/// request-id assignment in the order the teacher's service applies
/// `TraceLayer` + its own middleware stack.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/fill", post(fill_handler))
        .route("/v1/intent", post(intent_handler))
        .route("/v1/postback", get(postback_handler))
        .route("/v1/reports", get(reports_handler))
        .route("/v1/delivery", get(delivery_handler))
        .route("/healthz", get(healthz_handler))
        .layer(axum::middleware::from_fn(crate::middleware::security_headers))
        .layer(axum::middleware::from_fn(crate::middleware::request_id))
        .layer(axum::middleware::from_fn_with_state(state.clone(), crate::middleware::rate_limit))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
