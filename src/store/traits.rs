//! `TaskStore` trait — the single source of truth for expression and task state.
//!
//! Every state change is a conditional transition evaluated inside the store,
//! so correctness does not depend on how many schedulers share it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::model::{
    Expression, ExpressionId, ExpressionStatus, Task, TaskId, TaskOutcome, TaskSpec,
    WorkerCapabilities,
};

/// Backend-agnostic persistence for expressions and their tasks.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Expressions ─────────────────────────────────────────────────

    /// Persist a new expression in `pending` status together with its tasks.
    /// Tasks become visible to claimers all at once.
    async fn create_expression(
        &self,
        owner_id: &str,
        text: &str,
        tasks: &[TaskSpec],
    ) -> Result<ExpressionId, DatabaseError>;

    /// Get an expression by ID.
    async fn get_expression(&self, id: ExpressionId) -> Result<Option<Expression>, DatabaseError>;

    /// All expressions owned by `owner_id`, newest first.
    async fn list_expressions(&self, owner_id: &str) -> Result<Vec<Expression>, DatabaseError>;

    /// `pending → in_progress`. Returns false if the expression was not pending.
    async fn mark_expression_in_progress(&self, id: ExpressionId) -> Result<bool, DatabaseError>;

    /// Move a non-terminal expression to `completed` or `failed`.
    ///
    /// Returns false if the expression was already terminal, so the result is
    /// written at most once.
    async fn finish_expression(
        &self,
        id: ExpressionId,
        status: ExpressionStatus,
        result: Option<f64>,
        error: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Get a task by ID.
    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, DatabaseError>;

    /// Tasks of an expression in ascending evaluation order.
    async fn list_tasks(&self, expression_id: ExpressionId) -> Result<Vec<Task>, DatabaseError>;

    /// Atomically claim the ready task with the smallest order.
    ///
    /// Ready means `pending`, owned by a non-terminal expression, accepted by
    /// `worker`, and every referenced task is completed with a result. The
    /// selection and the `pending → claimed` transition are one statement.
    /// The stored lease runs until `lease_until` plus the task's own
    /// `operation_time_ms`.
    async fn claim_next_task(
        &self,
        worker: &WorkerCapabilities,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<Task>, DatabaseError>;

    /// `claimed → completed` with the worker's outcome.
    /// Returns false if the task was not in `claimed` status.
    async fn complete_task(
        &self,
        id: TaskId,
        outcome: &TaskOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Return claims whose lease expired at or before `now` to `pending`.
    /// Returns the number of tasks released.
    async fn release_expired_claims(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError>;
}
