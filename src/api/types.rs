//! Request and response bodies for the HTTP API.
//!
//! Shared by the router and by the HTTP worker client, so both sides agree on
//! the wire format.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{Error, TaskError};
use crate::model::{
    ClaimedTask, Expression, ExpressionId, ExpressionStatus, Operand, Operator, Task, TaskId,
    TaskOutcome, TaskStatus,
};

// ── Client API ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculateRequest {
    pub expression: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculateResponse {
    pub id: ExpressionId,
}

/// Public view of an expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpressionView {
    pub id: ExpressionId,
    pub expression: String,
    pub status: ExpressionStatus,
    pub result: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Only present on single-expression lookups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<TaskView>>,
}

impl ExpressionView {
    pub fn new(expression: Expression) -> Self {
        Self {
            id: expression.id,
            expression: expression.text,
            status: expression.status,
            result: expression.result,
            error: expression.error,
            created_at: expression.created_at,
            updated_at: expression.updated_at,
            tasks: None,
        }
    }

    pub fn with_tasks(mut self, tasks: Vec<Task>) -> Self {
        self.tasks = Some(tasks.into_iter().map(TaskView::from).collect());
        self
    }
}

/// Public view of a task inside an expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub id: TaskId,
    pub order: u32,
    pub operation: Operator,
    pub arg1: Operand,
    pub arg2: Operand,
    pub status: TaskStatus,
    pub result: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
}

impl From<Task> for TaskView {
    fn from(task: Task) -> Self {
        Self {
            id: task.id,
            order: task.order,
            operation: task.operator,
            arg1: task.arg1,
            arg2: task.arg2,
            status: task.status,
            result: task.result,
            error: task.error,
            attempts: task.attempts,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpressionListResponse {
    pub expressions: Vec<ExpressionView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpressionResponse {
    pub expression: ExpressionView,
}

// ── Worker API ──────────────────────────────────────────────────────────

/// Query string of `GET /internal/task`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClaimQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    /// Comma-separated operator names or symbols. Absent means all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operators: Option<String>,
}

impl ClaimQuery {
    /// Parse the `operators` list.
    pub fn parse_operators(&self) -> Result<Vec<Operator>, String> {
        match &self.operators {
            None => Ok(Vec::new()),
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::parse::<Operator>)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResponse {
    pub task: ClaimedTask,
}

/// Body of `POST /internal/task`: exactly one of `result` or `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResultRequest {
    pub id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SubmitResultRequest {
    pub fn from_outcome(id: TaskId, outcome: TaskOutcome) -> Self {
        match outcome {
            TaskOutcome::Value(v) => Self {
                id,
                result: Some(v),
                error: None,
            },
            TaskOutcome::Failed(reason) => Self {
                id,
                result: None,
                error: Some(reason),
            },
        }
    }

    pub fn into_outcome(self) -> Result<(TaskId, TaskOutcome), TaskError> {
        match (self.result, self.error) {
            (Some(v), None) => Ok((self.id, TaskOutcome::Value(v))),
            (None, Some(reason)) => Ok((self.id, TaskOutcome::Failed(reason))),
            _ => Err(TaskError::InvalidOutcome { id: self.id }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResultResponse {
    pub status: String,
    pub expression_status: ExpressionStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    /// Set for task protocol rejections, see [`TaskError::code`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

// ── Errors ──────────────────────────────────────────────────────────────

/// An error rendered as `{"error": "..."}` with a status code.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: Option<&'static str>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            code: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match &e {
            Error::Syntax(_) | Error::Graph(_) | Error::Computation(_) => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
            }
            Error::Task(task_error) => Self::from(task_error.clone()),
            Error::Database(_) | Error::Agent(_) => {
                error!(error = %e, "Request failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }
}

impl From<TaskError> for ApiError {
    fn from(e: TaskError) -> Self {
        let status = match e {
            TaskError::NotFound { .. } => StatusCode::NOT_FOUND,
            TaskError::AlreadyCompleted { .. }
            | TaskError::NotClaimed { .. }
            | TaskError::ClaimConflict { .. } => StatusCode::CONFLICT,
            TaskError::InvalidOutcome { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        };
        Self {
            code: Some(e.code()),
            ..Self::new(status, e.to_string())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
                code: self.code.map(str::to_string),
            }),
        )
            .into_response()
    }
}
