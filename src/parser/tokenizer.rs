//! Expression tokenizer.

use std::fmt;

use crate::error::SyntaxError;
use crate::model::Operator;

/// Token payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TokenKind {
    Number(f64),
    Operator(Operator),
    LParen,
    RParen,
}

/// A token and the character position where it starts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub position: usize,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(v) => write!(f, "{v}"),
            Self::Operator(op) => write!(f, "{op}"),
            Self::LParen => f.write_str("("),
            Self::RParen => f.write_str(")"),
        }
    }
}

/// Split `input` into number, operator and parenthesis tokens.
///
/// Whitespace separates tokens and is otherwise ignored. Positions are
/// zero-based character offsets into `input`.
pub fn tokenize(input: &str) -> Result<Vec<Token>, SyntaxError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().enumerate().peekable();

    while let Some((position, ch)) = chars.next() {
        if ch.is_whitespace() {
            continue;
        }

        if ch.is_ascii_digit() || ch == '.' {
            let mut literal = String::from(ch);
            while let Some(&(_, next)) = chars.peek() {
                if next.is_ascii_digit() || next == '.' {
                    literal.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token {
                kind: TokenKind::Number(parse_number(&literal, position)?),
                position,
            });
            continue;
        }

        let kind = match ch {
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            other => match Operator::from_symbol(other) {
                Some(op) => TokenKind::Operator(op),
                None => return Err(SyntaxError::InvalidCharacter { ch, position }),
            },
        };
        tokens.push(Token { kind, position });
    }

    if tokens.is_empty() {
        return Err(SyntaxError::Empty);
    }
    Ok(tokens)
}

fn parse_number(literal: &str, position: usize) -> Result<f64, SyntaxError> {
    let invalid = || SyntaxError::InvalidNumber {
        literal: literal.to_string(),
        position,
    };

    if literal.matches('.').count() > 1 || !literal.chars().any(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    literal.parse::<f64>().map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        tokenize(input).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn numbers_and_operators() {
        assert_eq!(
            kinds("2+3*4"),
            vec![
                TokenKind::Number(2.0),
                TokenKind::Operator(Operator::Add),
                TokenKind::Number(3.0),
                TokenKind::Operator(Operator::Multiply),
                TokenKind::Number(4.0),
            ]
        );
    }

    #[test]
    fn whitespace_is_skipped_and_positions_kept() {
        let tokens = tokenize(" 12 /\t(3.5 - 1) ").unwrap();
        let positions: Vec<usize> = tokens.iter().map(|t| t.position).collect();
        assert_eq!(positions, vec![1, 4, 6, 7, 11, 13, 14]);
        assert_eq!(tokens[0].kind, TokenKind::Number(12.0));
        assert_eq!(tokens[3].kind, TokenKind::Number(3.5));
    }

    #[test]
    fn decimal_forms() {
        assert_eq!(kinds("0.25"), vec![TokenKind::Number(0.25)]);
        assert_eq!(kinds(".5"), vec![TokenKind::Number(0.5)]);
        assert_eq!(kinds("5."), vec![TokenKind::Number(5.0)]);
    }

    #[test]
    fn rejects_second_decimal_point() {
        let err = tokenize("1+1.2.3").unwrap_err();
        assert_eq!(
            err,
            SyntaxError::InvalidNumber {
                literal: "1.2.3".into(),
                position: 2
            }
        );
    }

    #[test]
    fn rejects_lone_dot() {
        assert!(matches!(
            tokenize("3 + ."),
            Err(SyntaxError::InvalidNumber { position: 4, .. })
        ));
    }

    #[test]
    fn rejects_invalid_character_with_position() {
        assert_eq!(
            tokenize("2 + x").unwrap_err(),
            SyntaxError::InvalidCharacter { ch: 'x', position: 4 }
        );
        assert_eq!(
            tokenize("2^3").unwrap_err(),
            SyntaxError::InvalidCharacter { ch: '^', position: 1 }
        );
    }

    #[test]
    fn empty_input() {
        assert_eq!(tokenize("").unwrap_err(), SyntaxError::Empty);
        assert_eq!(tokenize("   ").unwrap_err(), SyntaxError::Empty);
    }

    #[test]
    fn restartable() {
        assert_eq!(tokenize("(1+2)").unwrap(), tokenize("(1+2)").unwrap());
    }
}
