//! Task graph builder — turns a postfix sequence into ordered binary tasks.

use super::postfix::PostfixItem;
use crate::config::OperationTimes;
use crate::error::GraphError;
use crate::model::{Operand, TaskSpec};

/// Emit one task per operator application.
///
/// Walks `postfix` with a stack of pending values. Each operator pops its two
/// operands (the first pushed becomes `arg1`), becomes a task with the next
/// `order`, and pushes a reference to its own result. References therefore
/// always point at a strictly smaller order.
pub fn build_tasks(
    postfix: &[PostfixItem],
    times: &OperationTimes,
) -> Result<Vec<TaskSpec>, GraphError> {
    let mut stack: Vec<Operand> = Vec::new();
    let mut tasks: Vec<TaskSpec> = Vec::new();

    for item in postfix {
        match *item {
            PostfixItem::Number(value) => stack.push(Operand::Literal(value)),
            PostfixItem::Operator(operator) => {
                let (Some(arg2), Some(arg1)) = (stack.pop(), stack.pop()) else {
                    return Err(GraphError::StackUnderflow {
                        operator: operator.symbol(),
                    });
                };
                let order = tasks.len() as u32;
                tasks.push(TaskSpec {
                    order,
                    operator,
                    arg1,
                    arg2,
                    operation_time_ms: times.for_operator(operator).as_millis() as u64,
                });
                stack.push(Operand::Task(order));
            }
        }
    }

    match stack.as_slice() {
        [] => Err(GraphError::Empty),
        [Operand::Task(_)] => Ok(tasks),
        [Operand::Literal(_)] => Err(GraphError::BareLiteral),
        values => Err(GraphError::DanglingValues {
            count: values.len(),
        }),
    }
}
