//! Result aggregation — folds completed task results into an expression value.

use std::collections::HashMap;

use crate::error::GraphError;
use crate::model::{Operand, Task, TaskStatus};

/// Where an expression stands given the current state of its tasks.
#[derive(Debug, Clone, PartialEq)]
pub enum Aggregate {
    /// Every task completed; the last task's result.
    Completed(f64),
    /// A task recorded a computation error.
    Failed(String),
    /// Some tasks are still pending or claimed.
    Incomplete,
}

/// Resolve `operand` of the task at `order` against results of earlier tasks.
pub fn resolve_operand(
    operand: Operand,
    order: u32,
    results: &HashMap<u32, f64>,
) -> Result<f64, GraphError> {
    match operand {
        Operand::Literal(v) => Ok(v),
        Operand::Task(reference) if reference >= order => {
            Err(GraphError::ForwardReference { order, reference })
        }
        Operand::Task(reference) => results
            .get(&reference)
            .copied()
            .ok_or(GraphError::MissingResult { order: reference }),
    }
}

/// Fold the tasks of one expression.
///
/// Tasks may arrive in any order. A recorded error wins over completeness, so
/// an expression fails as soon as any of its tasks does.
pub fn aggregate(tasks: &[Task]) -> Result<Aggregate, GraphError> {
    let mut ordered: Vec<&Task> = tasks.iter().collect();
    ordered.sort_by_key(|t| t.order);

    if let Some(failed) = ordered.iter().find(|t| t.error.is_some()) {
        let reason = failed.error.clone().unwrap_or_default();
        return Ok(Aggregate::Failed(reason));
    }

    if ordered.iter().any(|t| t.status != TaskStatus::Completed) {
        return Ok(Aggregate::Incomplete);
    }

    let mut results: HashMap<u32, f64> = HashMap::with_capacity(ordered.len());
    let mut last = None;
    for task in ordered {
        // Every reference must point at an earlier, already folded task.
        resolve_operand(task.arg1, task.order, &results)?;
        resolve_operand(task.arg2, task.order, &results)?;

        let value = task
            .result
            .ok_or(GraphError::MissingResult { order: task.order })?;
        results.insert(task.order, value);
        last = Some(value);
    }

    last.map(Aggregate::Completed).ok_or(GraphError::Empty)
}
