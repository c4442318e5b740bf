//! Error types for distcalc.

use crate::model::TaskId;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Syntax error: {0}")]
    Syntax(#[from] SyntaxError),

    #[error("Task graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Computation error: {0}")]
    Computation(#[from] ComputationError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Malformed expression text. Surfaced to the submitter; nothing is persisted.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyntaxError {
    #[error("expression is empty")]
    Empty,

    #[error("invalid character '{ch}' at position {position}")]
    InvalidCharacter { ch: char, position: usize },

    #[error("invalid number '{literal}' at position {position}")]
    InvalidNumber { literal: String, position: usize },

    #[error("unmatched '(' at position {position}")]
    UnmatchedOpenParen { position: usize },

    #[error("unmatched ')' at position {position}")]
    UnmatchedCloseParen { position: usize },

    #[error("operator '{operator}' at position {position} is missing an operand")]
    MissingOperand { operator: char, position: usize },

    #[error("expression ends with operator '{operator}' at position {position}")]
    TrailingOperator { operator: char, position: usize },

    #[error("empty parentheses at position {position}")]
    EmptyParens { position: usize },

    #[error("unexpected '{token}' at position {position}")]
    UnexpectedToken { token: String, position: usize },
}

/// Invariant violation while building or folding a task graph.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
    #[error("operator '{operator}' found fewer than two values on the stack")]
    StackUnderflow { operator: char },

    #[error("postfix sequence produced no value")]
    Empty,

    #[error("expression applies no operator")]
    BareLiteral,

    #[error("{count} values left on the stack after the last operator")]
    DanglingValues { count: usize },

    #[error("task {order} references task {reference}, which is not earlier in evaluation order")]
    ForwardReference { order: u32, reference: u32 },

    #[error("task {order} has no recorded result")]
    MissingResult { order: u32 },
}

/// Failure computing a single operator application.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ComputationError {
    #[error("division by zero ({dividend} / 0)")]
    DivisionByZero { dividend: f64 },

    #[error("result of {lhs} {operator} {rhs} is not a finite number")]
    NonFinite { lhs: f64, operator: char, rhs: f64 },
}

/// Rejections from the claim/submit boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: TaskId },

    #[error("Task {id} already completed")]
    AlreadyCompleted { id: TaskId },

    #[error("Task {id} is not claimed (lease may have expired)")]
    NotClaimed { id: TaskId },

    #[error("Task {id} was claimed by another worker first")]
    ClaimConflict { id: TaskId },

    #[error("Submission for task {id} must carry exactly one of result or error")]
    InvalidOutcome { id: TaskId },
}

impl TaskError {
    /// Stable machine-readable name, carried in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            TaskError::NotFound { .. } => "task_not_found",
            TaskError::AlreadyCompleted { .. } => "already_completed",
            TaskError::NotClaimed { .. } => "not_claimed",
            TaskError::ClaimConflict { .. } => "claim_conflict",
            TaskError::InvalidOutcome { .. } => "invalid_outcome",
        }
    }

    /// Inverse of [`TaskError::code`].
    pub fn from_code(code: &str, id: TaskId) -> Option<Self> {
        match code {
            "task_not_found" => Some(TaskError::NotFound { id }),
            "already_completed" => Some(TaskError::AlreadyCompleted { id }),
            "not_claimed" => Some(TaskError::NotClaimed { id }),
            "claim_conflict" => Some(TaskError::ClaimConflict { id }),
            "invalid_outcome" => Some(TaskError::InvalidOutcome { id }),
            _ => None,
        }
    }
}

/// Worker-side transport errors.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Request to orchestrator failed: {0}")]
    Transport(String),

    #[error("Orchestrator returned {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("Invalid response from orchestrator: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for AgentError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            AgentError::Decode(e.to_string())
        } else {
            AgentError::Transport(e.to_string())
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
