//! Domain model — expressions, tasks and their lifecycle states.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ComputationError;

/// Numeric identifier of a persisted expression.
pub type ExpressionId = i64;

/// Numeric identifier of a persisted task.
pub type TaskId = i64;

/// One of the four supported binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "+")]
    Add,
    #[serde(rename = "-")]
    Subtract,
    #[serde(rename = "*")]
    Multiply,
    #[serde(rename = "/")]
    Divide,
}

impl Operator {
    pub const ALL: [Operator; 4] = [
        Operator::Add,
        Operator::Subtract,
        Operator::Multiply,
        Operator::Divide,
    ];

    /// Map a source character to an operator.
    pub fn from_symbol(ch: char) -> Option<Self> {
        match ch {
            '+' => Some(Self::Add),
            '-' => Some(Self::Subtract),
            '*' => Some(Self::Multiply),
            '/' => Some(Self::Divide),
            _ => None,
        }
    }

    pub fn symbol(&self) -> char {
        match self {
            Self::Add => '+',
            Self::Subtract => '-',
            Self::Multiply => '*',
            Self::Divide => '/',
        }
    }

    /// Long name, used where the symbol is awkward (query strings, env vars).
    pub fn name(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Subtract => "subtract",
            Self::Multiply => "multiply",
            Self::Divide => "divide",
        }
    }

    /// Binding strength: `*` and `/` bind tighter than `+` and `-`.
    pub fn precedence(&self) -> u8 {
        match self {
            Self::Add | Self::Subtract => 1,
            Self::Multiply | Self::Divide => 2,
        }
    }

    /// Apply the operator. Division by zero and overflow to infinity are errors,
    /// never a default value.
    pub fn apply(&self, lhs: f64, rhs: f64) -> Result<f64, ComputationError> {
        let value = match self {
            Self::Add => lhs + rhs,
            Self::Subtract => lhs - rhs,
            Self::Multiply => lhs * rhs,
            Self::Divide => {
                if rhs == 0.0 {
                    return Err(ComputationError::DivisionByZero { dividend: lhs });
                }
                lhs / rhs
            }
        };

        if value.is_finite() {
            Ok(value)
        } else {
            Err(ComputationError::NonFinite {
                lhs,
                operator: self.symbol(),
                rhs,
            })
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

impl FromStr for Operator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut chars = s.chars();
        if let (Some(ch), None) = (chars.next(), chars.next()) {
            if let Some(op) = Self::from_symbol(ch) {
                return Ok(op);
            }
        }
        Self::ALL
            .into_iter()
            .find(|op| op.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown operator: {s}"))
    }
}

/// A task input: either a literal, or the result of an earlier task in the
/// same expression, identified by that task's evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    Literal(f64),
    Task(u32),
}

impl Operand {
    /// The referenced task order, if this operand is not a literal.
    pub fn reference(&self) -> Option<u32> {
        match self {
            Self::Literal(_) => None,
            Self::Task(order) => Some(*order),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(v) => write!(f, "{v}"),
            Self::Task(order) => write!(f, "<t{order}>"),
        }
    }
}

/// Task lifecycle. Transitions are pending → claimed → completed; an expired
/// lease is the only way back from claimed to pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a worker.
    Pending,
    /// Held by exactly one worker under a lease.
    Claimed,
    /// Result (or computation error) recorded.
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "claimed" => Ok(Self::Claimed),
            "completed" => Ok(Self::Completed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Expression lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpressionStatus {
    /// Submitted, no task claimed yet.
    Pending,
    /// At least one task has been claimed.
    InProgress,
    /// Every task completed; `result` is set.
    Completed,
    /// A task recorded a computation error.
    Failed,
}

impl ExpressionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for ExpressionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExpressionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown expression status: {other}")),
        }
    }
}

/// A task as produced by the graph builder, before it has an id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSpec {
    pub order: u32,
    pub operator: Operator,
    pub arg1: Operand,
    pub arg2: Operand,
    /// Simulated latency for this operator, in milliseconds.
    pub operation_time_ms: u64,
}

/// A persisted task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub expression_id: ExpressionId,
    pub order: u32,
    pub operator: Operator,
    pub arg1: Operand,
    pub arg2: Operand,
    pub status: TaskStatus,
    pub result: Option<f64>,
    pub error: Option<String>,
    pub operation_time_ms: u64,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Task orders this task depends on.
    pub fn dependencies(&self) -> impl Iterator<Item = u32> + '_ {
        [self.arg1, self.arg2].into_iter().filter_map(|a| a.reference())
    }
}

/// A persisted expression.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Expression {
    pub id: ExpressionId,
    pub owner_id: String,
    pub text: String,
    pub status: ExpressionStatus,
    pub result: Option<f64>,
    pub error: Option<String>,
    pub task_ids: Vec<TaskId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Who is asking for work and which operators it will compute.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerCapabilities {
    pub worker_id: String,
    /// Accepted operators. Empty means all.
    pub operators: Vec<Operator>,
}

impl WorkerCapabilities {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            operators: Vec::new(),
        }
    }

    pub fn with_operators(mut self, operators: Vec<Operator>) -> Self {
        self.operators = operators;
        self
    }
}

/// A task handed to a worker, with every reference already resolved to a number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimedTask {
    pub id: TaskId,
    pub expression_id: ExpressionId,
    pub order: u32,
    pub operation: Operator,
    pub arg1: f64,
    pub arg2: f64,
    pub operation_time: u64,
}

/// What a worker reports for a task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Value(f64),
    Failed(String),
}

impl From<Result<f64, ComputationError>> for TaskOutcome {
    fn from(result: Result<f64, ComputationError>) -> Self {
        match result {
            Ok(v) => TaskOutcome::Value(v),
            Err(e) => TaskOutcome::Failed(e.to_string()),
        }
    }
}

/// Acknowledgement for an accepted submission.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitReceipt {
    pub task_id: TaskId,
    pub expression_id: ExpressionId,
    /// Expression status after aggregation ran.
    pub expression_status: ExpressionStatus,
}
