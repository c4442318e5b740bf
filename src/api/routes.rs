//! REST endpoints for expression submission and the worker task protocol.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, Query, State},
    http::{StatusCode, request::Parts},
    response::IntoResponse,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tracing::{debug, info};
use uuid::Uuid;

use super::types::{
    ApiError, CalculateRequest, CalculateResponse, ClaimQuery, ErrorBody, ExpressionListResponse,
    ExpressionResponse, ExpressionView, SubmitResultRequest, SubmitResultResponse, TaskResponse,
};
use crate::model::{ExpressionId, WorkerCapabilities};
use crate::scheduler::Scheduler;

/// Header carrying the caller's identity, set by whatever authenticates them.
pub const OWNER_HEADER: &str = "x-user-id";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
}

/// Build the Axum router with the client and worker routes.
pub fn api_routes(scheduler: Arc<Scheduler>) -> Router {
    let state = AppState { scheduler };

    Router::new()
        .route("/health", get(health))
        .route("/api/v1/calculate", post(calculate))
        .route("/api/v1/expressions", get(list_expressions))
        .route("/api/v1/expressions/{id}", get(get_expression))
        .route("/internal/task", get(claim_task).post(submit_result))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Opaque id of the authenticated caller.
#[derive(Debug, Clone)]
pub struct OwnerId(pub String);

impl<S: Send + Sync> FromRequestParts<S> for OwnerId {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(OWNER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| OwnerId(v.to_string()))
            .ok_or_else(|| ApiError::unauthorized(format!("missing {OWNER_HEADER} header")))
    }
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "distcalc"
    }))
}

// ── Client endpoints ────────────────────────────────────────────────────

async fn calculate(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Json(body): Json<CalculateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let id = state
        .scheduler
        .submit_expression(&owner, &body.expression)
        .await?;
    Ok((StatusCode::CREATED, Json(CalculateResponse { id })))
}

async fn list_expressions(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
) -> Result<Json<ExpressionListResponse>, ApiError> {
    let expressions = state
        .scheduler
        .list_expressions(&owner)
        .await?
        .into_iter()
        .map(ExpressionView::new)
        .collect();
    Ok(Json(ExpressionListResponse { expressions }))
}

async fn get_expression(
    State(state): State<AppState>,
    _owner: OwnerId,
    Path(id): Path<String>,
) -> Result<Json<ExpressionResponse>, ApiError> {
    let id: ExpressionId = id
        .parse()
        .map_err(|_| ApiError::bad_request("Invalid expression ID"))?;

    let Some(expression) = state.scheduler.get_expression(id).await? else {
        return Err(ApiError::not_found("Expression not found"));
    };
    let tasks = state.scheduler.list_tasks(id).await?;

    Ok(Json(ExpressionResponse {
        expression: ExpressionView::new(expression).with_tasks(tasks),
    }))
}

// ── Worker endpoints ────────────────────────────────────────────────────

async fn claim_task(
    State(state): State<AppState>,
    Query(query): Query<ClaimQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let operators = query.parse_operators().map_err(ApiError::bad_request)?;
    let worker_id = query
        .worker_id
        .clone()
        .unwrap_or_else(|| format!("anonymous-{}", Uuid::new_v4()));
    let worker = WorkerCapabilities::new(worker_id).with_operators(operators);

    match state.scheduler.claim_next(&worker).await? {
        Some(task) => Ok((StatusCode::OK, Json(TaskResponse { task })).into_response()),
        None => {
            debug!(worker = %worker.worker_id, "Claim found nothing ready");
            Ok((
                StatusCode::NOT_FOUND,
                Json(ErrorBody {
                    error: "no tasks available".to_string(),
                    code: None,
                }),
            )
                .into_response())
        }
    }
}

async fn submit_result(
    State(state): State<AppState>,
    Json(body): Json<SubmitResultRequest>,
) -> Result<Json<SubmitResultResponse>, ApiError> {
    let (task_id, outcome) = body.into_outcome()?;
    let receipt = state.scheduler.submit_result(task_id, outcome).await?;

    info!(
        task_id,
        expression_id = receipt.expression_id,
        expression_status = %receipt.expression_status,
        "Result accepted"
    );
    Ok(Json(SubmitResultResponse {
        status: "accepted".to_string(),
        expression_status: receipt.expression_status,
    }))
}
