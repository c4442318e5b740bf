//! Expression parsing — tokenizer, shunting-yard conversion, task graph builder.
//!
//! `decompose()` is the path used at submission time; `solve()` evaluates the
//! same postfix sequence directly and is the reference for checking that a
//! distributed run produced the right value.

pub mod graph;
pub mod postfix;
pub mod solve;
pub mod tokenizer;

pub use graph::build_tasks;
pub use postfix::{PostfixItem, format_postfix, to_postfix};
pub use solve::evaluate_postfix;
pub use tokenizer::{Token, TokenKind, tokenize};

use crate::config::OperationTimes;
use crate::error::Error;
use crate::model::TaskSpec;

/// Parse `expression` into postfix order.
pub fn parse(expression: &str) -> Result<Vec<PostfixItem>, Error> {
    let tokens = tokenize(expression)?;
    Ok(to_postfix(&tokens)?)
}

/// Parse `expression` and split it into ordered binary tasks.
pub fn decompose(expression: &str, times: &OperationTimes) -> Result<Vec<TaskSpec>, Error> {
    let postfix = parse(expression)?;
    Ok(build_tasks(&postfix, times)?)
}

/// Evaluate `expression` in-process.
pub fn solve(expression: &str) -> Result<f64, Error> {
    evaluate_postfix(&parse(expression)?)
}
