//! Infix → postfix conversion (shunting-yard) with operand/operator validation.

use std::fmt;

use super::tokenizer::{Token, TokenKind};
use crate::error::SyntaxError;
use crate::model::Operator;

/// One element of a postfix sequence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PostfixItem {
    Number(f64),
    Operator(Operator),
}

impl fmt::Display for PostfixItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(v) => write!(f, "{v}"),
            Self::Operator(op) => write!(f, "{op}"),
        }
    }
}

/// Render a postfix sequence as space separated text, e.g. `2 3 4 * +`.
pub fn format_postfix(items: &[PostfixItem]) -> String {
    items
        .iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

enum Stacked {
    Operator(Operator, usize),
    Paren(usize),
}

/// Convert infix tokens to postfix order.
///
/// The token stream must alternate operand / operator, where an operand is a
/// number or a parenthesised group. Anything else is a `SyntaxError`, so the
/// result always evaluates with at least two values available per operator.
pub fn to_postfix(tokens: &[Token]) -> Result<Vec<PostfixItem>, SyntaxError> {
    let mut output = Vec::with_capacity(tokens.len());
    let mut stack: Vec<Stacked> = Vec::new();
    let mut expect_operand = true;
    let mut prev: Option<&Token> = None;

    for token in tokens {
        match token.kind {
            TokenKind::Number(value) => {
                if !expect_operand {
                    return Err(unexpected(token));
                }
                output.push(PostfixItem::Number(value));
                expect_operand = false;
            }
            TokenKind::LParen => {
                if !expect_operand {
                    return Err(unexpected(token));
                }
                stack.push(Stacked::Paren(token.position));
            }
            TokenKind::Operator(op) => {
                if expect_operand {
                    return Err(SyntaxError::MissingOperand {
                        operator: op.symbol(),
                        position: token.position,
                    });
                }
                while let Some(Stacked::Operator(top, _)) = stack.last() {
                    if top.precedence() < op.precedence() {
                        break;
                    }
                    output.push(PostfixItem::Operator(*top));
                    stack.pop();
                }
                stack.push(Stacked::Operator(op, token.position));
                expect_operand = true;
            }
            TokenKind::RParen => {
                if expect_operand {
                    return Err(match prev.map(|p| p.kind) {
                        Some(TokenKind::LParen) => SyntaxError::EmptyParens {
                            position: prev.map(|p| p.position).unwrap_or(token.position),
                        },
                        Some(TokenKind::Operator(op)) => SyntaxError::MissingOperand {
                            operator: op.symbol(),
                            position: prev.map(|p| p.position).unwrap_or(token.position),
                        },
                        _ => SyntaxError::UnmatchedCloseParen {
                            position: token.position,
                        },
                    });
                }
                loop {
                    match stack.pop() {
                        Some(Stacked::Operator(op, _)) => output.push(PostfixItem::Operator(op)),
                        Some(Stacked::Paren(_)) => break,
                        None => {
                            return Err(SyntaxError::UnmatchedCloseParen {
                                position: token.position,
                            });
                        }
                    }
                }
            }
        }
        prev = Some(token);
    }

    if expect_operand {
        return Err(match prev {
            None => SyntaxError::Empty,
            Some(Token {
                kind: TokenKind::Operator(op),
                position,
            }) => SyntaxError::TrailingOperator {
                operator: op.symbol(),
                position: *position,
            },
            Some(Token { position, .. }) => SyntaxError::UnmatchedOpenParen {
                position: *position,
            },
        });
    }

    while let Some(entry) = stack.pop() {
        match entry {
            Stacked::Operator(op, _) => output.push(PostfixItem::Operator(op)),
            Stacked::Paren(position) => return Err(SyntaxError::UnmatchedOpenParen { position }),
        }
    }

    Ok(output)
}

fn unexpected(token: &Token) -> SyntaxError {
    SyntaxError::UnexpectedToken {
        token: token.kind.to_string(),
        position: token.position,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::tokenizer::tokenize;

    fn postfix(input: &str) -> Result<String, SyntaxError> {
        to_postfix(&tokenize(input)?).map(|items| format_postfix(&items))
    }

    #[test]
    fn precedence() {
        assert_eq!(postfix("2+3*4").unwrap(), "2 3 4 * +");
        assert_eq!(postfix("2*3+4").unwrap(), "2 3 * 4 +");
        assert_eq!(postfix("10/2+3*4").unwrap(), "10 2 / 3 4 * +");
    }

    #[test]
    fn left_associativity() {
        assert_eq!(postfix("8-3-2").unwrap(), "8 3 - 2 -");
        assert_eq!(postfix("16/4/2").unwrap(), "16 4 / 2 /");
        assert_eq!(postfix("2*3/4").unwrap(), "2 3 * 4 /");
    }

    #[test]
    fn parentheses() {
        assert_eq!(postfix("(2+3)*4").unwrap(), "2 3 + 4 *");
        assert_eq!(postfix("2*(3+(4-1))").unwrap(), "2 3 4 1 - + *");
        assert_eq!(postfix("((7))").unwrap(), "7");
    }

    #[test]
    fn trailing_operator() {
        assert_eq!(
            postfix("3+").unwrap_err(),
            SyntaxError::TrailingOperator { operator: '+', position: 1 }
        );
    }

    #[test]
    fn operator_missing_operand() {
        assert_eq!(
            postfix("3+*4").unwrap_err(),
            SyntaxError::MissingOperand { operator: '*', position: 2 }
        );
        assert_eq!(
            postfix("-3").unwrap_err(),
            SyntaxError::MissingOperand { operator: '-', position: 0 }
        );
        assert_eq!(
            postfix("(3+)").unwrap_err(),
            SyntaxError::MissingOperand { operator: '+', position: 2 }
        );
    }

    #[test]
    fn unmatched_parentheses() {
        assert_eq!(
            postfix("(3+4").unwrap_err(),
            SyntaxError::UnmatchedOpenParen { position: 0 }
        );
        assert_eq!(
            postfix("3+4)").unwrap_err(),
            SyntaxError::UnmatchedCloseParen { position: 3 }
        );
        assert_eq!(
            postfix("2*(").unwrap_err(),
            SyntaxError::UnmatchedOpenParen { position: 2 }
        );
        assert!(matches!(
            postfix(")").unwrap_err(),
            SyntaxError::UnmatchedCloseParen { position: 0 }
        ));
    }

    #[test]
    fn empty_parentheses() {
        assert_eq!(postfix("()").unwrap_err(), SyntaxError::EmptyParens { position: 0 });
    }

    #[test]
    fn adjacent_operands() {
        assert!(matches!(
            postfix("3 4").unwrap_err(),
            SyntaxError::UnexpectedToken { position: 2, .. }
        ));
        assert!(matches!(
            postfix("2(3)").unwrap_err(),
            SyntaxError::UnexpectedToken { position: 1, .. }
        ));
        assert!(matches!(
            postfix("(1)(2)").unwrap_err(),
            SyntaxError::UnexpectedToken { position: 3, .. }
        ));
    }
}
