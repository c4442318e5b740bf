//! libSQL backend — async `TaskStore` implementation.
//!
//! Supports local file and in-memory databases. Every lifecycle transition is
//! a single conditional `UPDATE`, so several orchestrator processes may share
//! one database file.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use libsql::params::Params;
use libsql::{Connection, Database as LibSqlDatabase, Value, params};
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::model::{
    Expression, ExpressionId, ExpressionStatus, Operand, Operator, Task, TaskId, TaskOutcome,
    TaskSpec, TaskStatus, WorkerCapabilities,
};
use crate::store::migrations;
use crate::store::traits::TaskStore;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Task ids per expression, in evaluation order.
    async fn task_ids_for(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<HashMap<ExpressionId, Vec<TaskId>>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("task_ids: {e}")))?;

        let mut ids: HashMap<ExpressionId, Vec<TaskId>> = HashMap::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => {
                    let expression_id = int_col(&row, 0)?;
                    ids.entry(expression_id).or_default().push(int_col(&row, 1)?);
                }
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("task_ids: {e}"))),
            }
        }
        Ok(ids)
    }
}

/// Insert one chunk of tasks with a single multi-row statement.
async fn insert_task_chunk(
    conn: &Connection,
    expression_id: ExpressionId,
    chunk: &[TaskSpec],
) -> Result<u64, libsql::Error> {
    let mut sql = String::from(
        "INSERT INTO tasks (expression_id, ordinal, operator, arg1_value, arg1_ref, arg2_value, arg2_ref, status, operation_time_ms) VALUES ",
    );
    let mut values: Vec<Value> = Vec::with_capacity(chunk.len() * TASK_INSERT_PARAMS);
    for (i, task) in chunk.iter().enumerate() {
        if i > 0 {
            sql.push_str(", ");
        }
        let base = i * TASK_INSERT_PARAMS;
        sql.push_str(&format!(
            "(?{}, ?{}, ?{}, ?{}, ?{}, ?{}, ?{}, 'pending', ?{})",
            base + 1,
            base + 2,
            base + 3,
            base + 4,
            base + 5,
            base + 6,
            base + 7,
            base + 8,
        ));

        let (arg1_value, arg1_ref) = operand_columns(task.arg1);
        let (arg2_value, arg2_ref) = operand_columns(task.arg2);
        values.extend([
            Value::Integer(expression_id),
            Value::Integer(task.order as i64),
            Value::Text(task.operator.symbol().to_string()),
            arg1_value,
            arg1_ref,
            arg2_value,
            arg2_ref,
            Value::Integer(task.operation_time_ms as i64),
        ]);
    }

    conn.execute(&sql, Params::Positional(values)).await
}

/// Remove an expression that was never published, together with its tasks.
async fn discard_expression(conn: &Connection, id: ExpressionId) -> Result<(), libsql::Error> {
    conn.execute("DELETE FROM tasks WHERE expression_id = ?1", params![id])
        .await?;
    conn.execute("DELETE FROM expressions WHERE id = ?1", params![id])
        .await?;
    Ok(())
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

fn column(row: &libsql::Row, idx: i32) -> Result<Value, DatabaseError> {
    row.get_value(idx)
        .map_err(|e| DatabaseError::Query(format!("read column {idx}: {e}")))
}

fn int_col(row: &libsql::Row, idx: i32) -> Result<i64, DatabaseError> {
    match column(row, idx)? {
        Value::Integer(i) => Ok(i),
        other => Err(DatabaseError::Serialization(format!(
            "column {idx}: expected integer, got {other:?}"
        ))),
    }
}

fn text_col(row: &libsql::Row, idx: i32) -> Result<String, DatabaseError> {
    match column(row, idx)? {
        Value::Text(s) => Ok(s),
        other => Err(DatabaseError::Serialization(format!(
            "column {idx}: expected text, got {other:?}"
        ))),
    }
}

fn opt_int_col(row: &libsql::Row, idx: i32) -> Result<Option<i64>, DatabaseError> {
    Ok(match column(row, idx)? {
        Value::Integer(i) => Some(i),
        _ => None,
    })
}

fn opt_real_col(row: &libsql::Row, idx: i32) -> Result<Option<f64>, DatabaseError> {
    Ok(match column(row, idx)? {
        Value::Real(v) => Some(v),
        Value::Integer(i) => Some(i as f64),
        _ => None,
    })
}

fn opt_text_col(row: &libsql::Row, idx: i32) -> Result<Option<String>, DatabaseError> {
    Ok(match column(row, idx)? {
        Value::Text(s) => Some(s),
        _ => None,
    })
}

/// Convert `Option<f64>` to libsql Value.
fn opt_real(v: Option<f64>) -> Value {
    match v {
        Some(v) => Value::Real(v),
        None => Value::Null,
    }
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> Value {
    match s {
        Some(s) => Value::Text(s.to_string()),
        None => Value::Null,
    }
}

/// Split an operand into its `(value, ref)` column pair.
fn operand_columns(operand: Operand) -> (Value, Value) {
    match operand {
        Operand::Literal(v) => (Value::Real(v), Value::Null),
        Operand::Task(order) => (Value::Null, Value::Integer(order as i64)),
    }
}

fn operand_from_columns(
    value: Option<f64>,
    reference: Option<i64>,
    task_id: TaskId,
) -> Result<Operand, DatabaseError> {
    match (value, reference) {
        (_, Some(order)) => Ok(Operand::Task(order as u32)),
        (Some(v), None) => Ok(Operand::Literal(v)),
        (None, None) => Err(DatabaseError::Serialization(format!(
            "task {task_id} has an operand with neither value nor reference"
        ))),
    }
}

/// Map a libsql Row to a Task.
///
/// Column order matches TASK_COLUMNS.
fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let id = int_col(row, 0)?;
    let operator_str = text_col(row, 3)?;
    let status_str = text_col(row, 8)?;

    let operator: Operator = operator_str
        .parse()
        .map_err(|e: String| DatabaseError::Serialization(e))?;
    let status: TaskStatus = status_str
        .parse()
        .map_err(|e: String| DatabaseError::Serialization(e))?;

    Ok(Task {
        id,
        expression_id: int_col(row, 1)?,
        order: int_col(row, 2)? as u32,
        operator,
        arg1: operand_from_columns(opt_real_col(row, 4)?, opt_int_col(row, 5)?, id)?,
        arg2: operand_from_columns(opt_real_col(row, 6)?, opt_int_col(row, 7)?, id)?,
        status,
        result: opt_real_col(row, 9)?,
        error: opt_text_col(row, 10)?,
        operation_time_ms: int_col(row, 11)?.max(0) as u64,
        claimed_by: opt_text_col(row, 12)?,
        claimed_at: parse_optional_datetime(&opt_text_col(row, 13)?),
        lease_expires_at: opt_int_col(row, 14)?.and_then(millis_to_datetime),
        attempts: int_col(row, 15)?.max(0) as u32,
        completed_at: parse_optional_datetime(&opt_text_col(row, 16)?),
    })
}

/// Map a libsql Row to an Expression.
///
/// Column order matches EXPRESSION_COLUMNS.
/// `task_ids` is left empty; callers fill it from the tasks table.
fn row_to_expression(row: &libsql::Row) -> Result<Expression, DatabaseError> {
    let status: ExpressionStatus = text_col(row, 3)?
        .parse()
        .map_err(|e: String| DatabaseError::Serialization(e))?;

    Ok(Expression {
        id: int_col(row, 0)?,
        owner_id: text_col(row, 1)?,
        text: text_col(row, 2)?,
        status,
        result: opt_real_col(row, 4)?,
        error: opt_text_col(row, 5)?,
        task_ids: Vec::new(),
        created_at: parse_datetime(&text_col(row, 6)?),
        updated_at: parse_datetime(&text_col(row, 7)?),
    })
}

/// `AND t.operator IN (...)` for a restricted worker, empty otherwise.
///
/// Only operator symbols from the enum are interpolated.
fn operator_filter(worker: &WorkerCapabilities) -> String {
    if worker.operators.is_empty() {
        return String::new();
    }
    let symbols: Vec<String> = worker
        .operators
        .iter()
        .map(|op| format!("'{}'", op.symbol()))
        .collect();
    format!("AND t.operator IN ({})", symbols.join(", "))
}

// ── Trait implementation ────────────────────────────────────────────

const TASK_COLUMNS: &str = "id, expression_id, ordinal, operator, arg1_value, arg1_ref, arg2_value, arg2_ref, status, result, error, operation_time_ms, claimed_by, claimed_at, lease_expires_at, attempts, completed_at";

const EXPRESSION_COLUMNS: &str =
    "id, owner_id, expression, status, result, error, created_at, updated_at";

/// Positional parameters per inserted task row.
const TASK_INSERT_PARAMS: usize = 8;

/// Highest parameter index SQLite accepts in one statement.
const SQLITE_MAX_VARIABLES: usize = 32766;

/// Task rows per INSERT statement.
const TASK_INSERT_CHUNK: usize = SQLITE_MAX_VARIABLES / TASK_INSERT_PARAMS;

#[async_trait]
impl TaskStore for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Expressions ─────────────────────────────────────────────────

    async fn create_expression(
        &self,
        owner_id: &str,
        text: &str,
        tasks: &[TaskSpec],
    ) -> Result<ExpressionId, DatabaseError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();

        let mut rows = conn
            .query(
                "INSERT INTO expressions (owner_id, expression, status, created_at, updated_at)
                 VALUES (?1, ?2, 'pending', ?3, ?3) RETURNING id",
                params![owner_id, text, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_expression: {e}")))?;

        let id = match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("create_expression: {e}")))?
        {
            Some(row) => int_col(&row, 0)?,
            None => {
                return Err(DatabaseError::Query(
                    "create_expression: insert returned no id".to_string(),
                ));
            }
        };
        drop(rows);

        // The expression stays unclaimable (task_count NULL) until every chunk is in.
        for (chunk_index, chunk) in tasks.chunks(TASK_INSERT_CHUNK).enumerate() {
            if let Err(e) = insert_task_chunk(conn, id, chunk).await {
                if let Err(cleanup) = discard_expression(conn, id).await {
                    warn!(expression_id = id, error = %cleanup, "Failed to remove expression after task insert failure");
                }
                return Err(DatabaseError::Query(format!(
                    "create_expression tasks (chunk {chunk_index}): {e}"
                )));
            }
        }

        if let Err(e) = conn
            .execute(
                "UPDATE expressions SET task_count = ?2 WHERE id = ?1",
                params![id, tasks.len() as i64],
            )
            .await
        {
            if let Err(cleanup) = discard_expression(conn, id).await {
                warn!(expression_id = id, error = %cleanup, "Failed to remove unpublished expression");
            }
            return Err(DatabaseError::Query(format!("create_expression publish: {e}")));
        }

        debug!(expression_id = id, tasks = tasks.len(), "Expression inserted into DB");
        Ok(id)
    }

    async fn get_expression(&self, id: ExpressionId) -> Result<Option<Expression>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {EXPRESSION_COLUMNS} FROM expressions WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_expression: {e}")))?;

        let mut expression = match rows.next().await {
            Ok(Some(row)) => row_to_expression(&row)?,
            Ok(None) => return Ok(None),
            Err(e) => return Err(DatabaseError::Query(format!("get_expression: {e}"))),
        };
        drop(rows);

        let mut ids = self
            .task_ids_for(
                "SELECT expression_id, id FROM tasks WHERE expression_id = ?1 ORDER BY ordinal ASC",
                params![id],
            )
            .await?;
        expression.task_ids = ids.remove(&id).unwrap_or_default();
        Ok(Some(expression))
    }

    async fn list_expressions(&self, owner_id: &str) -> Result<Vec<Expression>, DatabaseError> {
        let mut ids = self
            .task_ids_for(
                "SELECT t.expression_id, t.id FROM tasks t
                 JOIN expressions e ON e.id = t.expression_id
                 WHERE e.owner_id = ?1
                 ORDER BY t.expression_id ASC, t.ordinal ASC",
                params![owner_id],
            )
            .await?;

        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {EXPRESSION_COLUMNS} FROM expressions
                     WHERE owner_id = ?1 AND task_count IS NOT NULL
                     ORDER BY id DESC"
                ),
                params![owner_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_expressions: {e}")))?;

        let mut expressions = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => {
                    let mut expression = row_to_expression(&row)?;
                    expression.task_ids = ids.remove(&expression.id).unwrap_or_default();
                    expressions.push(expression);
                }
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("list_expressions: {e}"))),
            }
        }
        Ok(expressions)
    }

    async fn mark_expression_in_progress(&self, id: ExpressionId) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let count = self
            .conn()
            .execute(
                "UPDATE expressions SET status = 'in_progress', updated_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![now, id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_expression_in_progress: {e}")))?;

        if count > 0 {
            debug!(expression_id = id, "Expression in progress");
        }
        Ok(count > 0)
    }

    async fn finish_expression(
        &self,
        id: ExpressionId,
        status: ExpressionStatus,
        result: Option<f64>,
        error: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        if !status.is_terminal() {
            return Err(DatabaseError::Query(format!(
                "finish_expression: {status} is not a terminal status"
            )));
        }

        let now = Utc::now().to_rfc3339();
        let count = self
            .conn()
            .execute(
                "UPDATE expressions SET status = ?1, result = ?2, error = ?3, updated_at = ?4
                 WHERE id = ?5 AND status IN ('pending', 'in_progress')",
                params![status.as_str(), opt_real(result), opt_text(error), now, id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("finish_expression: {e}")))?;

        Ok(count > 0)
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_task(&row).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_task: {e}"))),
        }
    }

    async fn list_tasks(&self, expression_id: ExpressionId) -> Result<Vec<Task>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE expression_id = ?1 ORDER BY ordinal ASC"
                ),
                params![expression_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tasks: {e}")))?;

        let mut tasks = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => tasks.push(row_to_task(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("list_tasks: {e}"))),
            }
        }
        Ok(tasks)
    }

    async fn claim_next_task(
        &self,
        worker: &WorkerCapabilities,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<Task>, DatabaseError> {
        let conn = self.conn();
        let sql = format!(
            "UPDATE tasks
             SET status = 'claimed', claimed_by = ?1, claimed_at = ?2,
                 lease_expires_at = ?3 + operation_time_ms,
                 attempts = attempts + 1
             WHERE id = (
                 SELECT t.id FROM tasks t
                 JOIN expressions e ON e.id = t.expression_id
                 WHERE t.status = 'pending'
                   AND e.status IN ('pending', 'in_progress')
                   AND e.task_count IS NOT NULL
                   {filter}
                   AND NOT EXISTS (
                       SELECT 1 FROM tasks d
                       WHERE d.expression_id = t.expression_id
                         AND d.ordinal IN (t.arg1_ref, t.arg2_ref)
                         AND (d.status != 'completed' OR d.result IS NULL)
                   )
                 ORDER BY t.ordinal ASC, t.expression_id ASC
                 LIMIT 1
             )
             AND status = 'pending'
             RETURNING {TASK_COLUMNS}",
            filter = operator_filter(worker),
        );

        let mut rows = conn
            .query(
                &sql,
                params![
                    worker.worker_id.as_str(),
                    now.to_rfc3339(),
                    lease_until.timestamp_millis()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_next_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let task = row_to_task(&row)?;
                debug!(task_id = task.id, worker = %worker.worker_id, "Task claimed in DB");
                Ok(Some(task))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("claim_next_task: {e}"))),
        }
    }

    async fn complete_task(
        &self,
        id: TaskId,
        outcome: &TaskOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let (result, error) = match outcome {
            TaskOutcome::Value(v) => (Some(*v), None),
            TaskOutcome::Failed(reason) => (None, Some(reason.as_str())),
        };

        let count = self
            .conn()
            .execute(
                "UPDATE tasks
                 SET status = 'completed', result = ?1, error = ?2, completed_at = ?3,
                     lease_expires_at = NULL
                 WHERE id = ?4 AND status = 'claimed'",
                params![opt_real(result), opt_text(error), now.to_rfc3339(), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_task: {e}")))?;

        if count > 0 {
            debug!(task_id = id, "Task completed in DB");
        }
        Ok(count > 0)
    }

    async fn release_expired_claims(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE tasks
                 SET status = 'pending', claimed_by = NULL, claimed_at = NULL, lease_expires_at = NULL
                 WHERE status = 'claimed' AND lease_expires_at IS NOT NULL AND lease_expires_at <= ?1",
                params![now.timestamp_millis()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_expired_claims: {e}")))?;

        if count > 0 {
            info!(count, "Released expired task claims");
        }
        Ok(count as usize)
    }
}
