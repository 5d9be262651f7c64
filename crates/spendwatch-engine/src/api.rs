//! Operational HTTP API.
//!
//! Read endpoints expose budget state, job progress, and active alerts.
//! Mutating endpoints (budget changes, manual alert resolution) require the
//! configured admin token; with no token configured they are disabled.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use spendwatch_core::{CostCategory, JobRequest, SpendWatchError};
use std::sync::Arc;
use uuid::Uuid;

use crate::alerts::AlertEngine;
use crate::anomaly::AnomalyAnalyzer;
use crate::ledger::BudgetLedger;
use crate::tracker::{JobAdmission, JobTracker};

/// Shared state handed to every handler.
pub struct AppState {
    pub ledger: Arc<BudgetLedger>,
    pub tracker: Arc<JobTracker>,
    pub analyzer: Arc<AnomalyAnalyzer>,
    pub alerts: Arc<AlertEngine>,
    pub admin_token: Option<String>,
}

/// API error response body.
#[derive(Debug, Serialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Serialize)]
struct ApiErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

/// Build a JSON error response.
fn api_error(status: StatusCode, message: &str) -> Response {
    let body = ApiError {
        error: ApiErrorDetail {
            message: message.to_string(),
            error_type: "api_error".to_string(),
        },
    };
    (status, Json(body)).into_response()
}

/// Map a core error onto an HTTP response.
fn error_response(err: &SpendWatchError) -> Response {
    let status = match err {
        SpendWatchError::Validation(_) => StatusCode::BAD_REQUEST,
        SpendWatchError::NotFound { .. } => StatusCode::NOT_FOUND,
        SpendWatchError::ExternalService(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, &err.to_string())
}

/// Check the `x-admin-token` header against the configured token.
fn authorize_admin(state: &AppState, headers: &HeaderMap) -> Option<Response> {
    let Some(expected) = &state.admin_token else {
        return Some(api_error(
            StatusCode::FORBIDDEN,
            "admin endpoints are disabled (no admin_token configured)",
        ));
    };
    let provided = headers
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if provided != expected {
        return Some(api_error(StatusCode::UNAUTHORIZED, "invalid admin token"));
    }
    None
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health`
///
/// Probes every repository; any failure makes the service unhealthy.
async fn health(State(state): State<Arc<AppState>>) -> Response {
    let checks = tokio::join!(
        state.ledger.health_check(),
        state.tracker.health_check(),
        state.alerts.health_check(),
    );
    match checks {
        (Ok(()), Ok(()), Ok(())) => Json(serde_json::json!({"status": "ok"})).into_response(),
        (a, b, c) => {
            let err = [a.err(), b.err(), c.err()]
                .into_iter()
                .flatten()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            api_error(StatusCode::SERVICE_UNAVAILABLE, &err)
        }
    }
}

/// `GET /api/v1/budget`
async fn budget_status(State(state): State<Arc<AppState>>) -> Response {
    match state.ledger.status().await {
        Ok(status) => Json(status).into_response(),
        Err(e) => error_response(&e),
    }
}

/// `GET /api/v1/budget/projection`
async fn budget_projection(State(state): State<Arc<AppState>>) -> Response {
    let remaining = match state.ledger.status().await {
        Ok(status) => status.remaining_usd,
        Err(e) => return error_response(&e),
    };
    match state.analyzer.projection(remaining).await {
        Ok(projection) => Json(projection).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Request body for `PUT /api/v1/budget`.
#[derive(Debug, Deserialize)]
struct SetBudgetRequest {
    total_budget_usd: f64,
}

/// `PUT /api/v1/budget` (admin)
async fn set_budget(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SetBudgetRequest>,
) -> Response {
    if let Some(denied) = authorize_admin(&state, &headers) {
        return denied;
    }
    match state.ledger.set_budget(body.total_budget_usd).await {
        Ok(status) => Json(status).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Request body for `POST /api/v1/jobs`.
#[derive(Debug, Deserialize)]
struct SubmitJobRequest {
    category: CostCategory,
    payload: serde_json::Value,
    estimated_cost_usd: f64,
    session_id: Option<String>,
}

/// `POST /api/v1/jobs`
///
/// An admission denial is not an error: it comes back as `402` with the
/// denial reason so clients can show budget feedback.
async fn submit_job(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SubmitJobRequest>,
) -> Response {
    let request = JobRequest {
        category: body.category,
        payload: body.payload,
    };
    match state
        .tracker
        .create_job(body.session_id, request, body.estimated_cost_usd)
        .await
    {
        Ok(JobAdmission::Admitted(job)) => (StatusCode::CREATED, Json(job)).into_response(),
        Ok(JobAdmission::Denied(decision)) => {
            (StatusCode::PAYMENT_REQUIRED, Json(decision)).into_response()
        }
        Err(e) => error_response(&e),
    }
}

/// `GET /api/v1/jobs/:id/progress`
async fn job_progress(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    match state.tracker.job_progress(id).await {
        Ok(progress) => Json(progress).into_response(),
        Err(e) => error_response(&e),
    }
}

/// `POST /api/v1/jobs/:id/cancel`
async fn cancel_job(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match state.tracker.cancel_job(id).await {
        Ok(job) => Json(job).into_response(),
        Err(e) => error_response(&e),
    }
}

/// `GET /api/v1/alerts/active`
async fn active_alerts(State(state): State<Arc<AppState>>) -> Response {
    match state.alerts.active_alerts().await {
        Ok(alerts) => Json(alerts).into_response(),
        Err(e) => error_response(&e),
    }
}

/// `GET /api/v1/alerts/cost`
async fn cost_alerts(State(state): State<Arc<AppState>>) -> Response {
    Json(state.analyzer.unresolved_alerts().await).into_response()
}

/// `POST /api/v1/alerts/:id/resolve` (admin)
async fn resolve_alert(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Response {
    if let Some(denied) = authorize_admin(&state, &headers) {
        return denied;
    }
    match state.alerts.resolve_alert(id).await {
        Ok(()) => Json(serde_json::json!({"resolved": true})).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Assemble the operational router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/budget", get(budget_status).put(set_budget))
        .route("/api/v1/budget/projection", get(budget_projection))
        .route("/api/v1/jobs", post(submit_job))
        .route("/api/v1/jobs/:id/progress", get(job_progress))
        .route("/api/v1/jobs/:id/cancel", post(cancel_job))
        .route("/api/v1/alerts/active", get(active_alerts))
        .route("/api/v1/alerts/cost", get(cost_alerts))
        .route("/api/v1/alerts/:id/resolve", post(resolve_alert))
        .with_state(state)
}
