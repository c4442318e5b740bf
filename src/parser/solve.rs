//! Direct postfix evaluation, without building tasks.

use super::postfix::PostfixItem;
use crate::error::{Error, GraphError};

/// Evaluate a postfix sequence on a value stack.
pub fn evaluate_postfix(postfix: &[PostfixItem]) -> Result<f64, Error> {
    let mut stack: Vec<f64> = Vec::with_capacity(postfix.len());

    for item in postfix {
        match *item {
            PostfixItem::Number(value) => stack.push(value),
            PostfixItem::Operator(operator) => {
                let (Some(rhs), Some(lhs)) = (stack.pop(), stack.pop()) else {
                    return Err(GraphError::StackUnderflow {
                        operator: operator.symbol(),
                    }
                    .into());
                };
                stack.push(operator.apply(lhs, rhs)?);
            }
        }
    }

    match stack.as_slice() {
        [value] => Ok(*value),
        [] => Err(GraphError::Empty.into()),
        values => Err(GraphError::DanglingValues {
            count: values.len(),
        }
        .into()),
    }
}
