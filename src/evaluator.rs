//! Arithmetic evaluation for request payloads.
//!
//! A recursive-descent parser over an immutable byte slice. Each rule takes
//! the current cursor and returns `(value, next_cursor)`, so there is no
//! parser object and no shared state. Whitespace is removed before parsing.
//!
//! ```text
//! expr   := term (('+' | '-') term)*
//! term   := factor (('*' | '/') factor)*
//! factor := ('+' | '-') factor | '(' expr ')' | number
//! number := [0-9.]+
//! ```

use thiserror::Error;

/// Deepest nesting of unary operators and parentheses we accept.
const MAX_DEPTH: usize = 256;

/// Which side of the boundary an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The input was rejected before parsing.
    Validation,
    /// The input was parsed (or partly parsed) and evaluation failed.
    Evaluation,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("empty expression")]
    Empty,
    #[error(
        "invalid expression: only numbers and + - * / ( ) . are allowed (found '{found}' at position {position})"
    )]
    InvalidInput { found: char, position: usize },
    #[error("division by zero at position {position}")]
    DivisionByZero { position: usize },
    #[error("malformed number '{literal}' at position {position}")]
    MalformedNumber { literal: String, position: usize },
    #[error("unexpected character '{found}' at position {position}")]
    UnexpectedCharacter { found: char, position: usize },
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unmatched parenthesis at position {position}")]
    UnmatchedParenthesis { position: usize },
    #[error("unexpected trailing input '{rest}' at position {position}")]
    TrailingInput { rest: String, position: usize },
    #[error("expression nested too deeply")]
    TooDeep,
    #[error("result is not a finite number")]
    NonFinite,
}

impl EvalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EvalError::Empty | EvalError::InvalidInput { .. } => ErrorKind::Validation,
            _ => ErrorKind::Evaluation,
        }
    }
}

/// Evaluate and format in one step. This is what the worker calls.
pub fn calculate(text: &str) -> Result<String, EvalError> {
    evaluate(text).map(format_value)
}

/// Evaluate an arithmetic expression.
pub fn evaluate(text: &str) -> Result<f64, EvalError> {
    validate(text)?;
    // "2 3" is 23. Parse error positions refer to the compacted text.
    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let src = compact.as_bytes();
    let (value, pos) = expression(src, 0, 0)?;
    if pos < src.len() {
        if src[pos] == b')' {
            return Err(EvalError::UnmatchedParenthesis { position: pos });
        }
        return Err(EvalError::TrailingInput {
            rest: compact[pos..].to_string(),
            position: pos,
        });
    }
    if !value.is_finite() {
        return Err(EvalError::NonFinite);
    }
    Ok(value)
}

/// Render integral values without a decimal point.
pub fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

fn validate(text: &str) -> Result<(), EvalError> {
    if text.trim().is_empty() {
        return Err(EvalError::Empty);
    }
    match text.char_indices().find(|(_, c)| !is_allowed(*c)) {
        Some((position, found)) => Err(EvalError::InvalidInput { found, position }),
        None => Ok(()),
    }
}

fn is_allowed(c: char) -> bool {
    c.is_ascii_digit() || c.is_ascii_whitespace() || "+-*/().".contains(c)
}

/// Consume `byte` if it is the next character.
fn eat(src: &[u8], pos: usize, byte: u8) -> Option<usize> {
    (src.get(pos) == Some(&byte)).then_some(pos + 1)
}

fn expression(src: &[u8], pos: usize, depth: usize) -> Result<(f64, usize), EvalError> {
    let (mut value, mut pos) = term(src, pos, depth)?;
    loop {
        if let Some(next) = eat(src, pos, b'+') {
            let (rhs, after) = term(src, next, depth)?;
            value += rhs;
            pos = after;
        } else if let Some(next) = eat(src, pos, b'-') {
            let (rhs, after) = term(src, next, depth)?;
            value -= rhs;
            pos = after;
        } else {
            return Ok((value, pos));
        }
    }
}

fn term(src: &[u8], pos: usize, depth: usize) -> Result<(f64, usize), EvalError> {
    let (mut value, mut pos) = factor(src, pos, depth)?;
    loop {
        if let Some(next) = eat(src, pos, b'*') {
            let (rhs, after) = factor(src, next, depth)?;
            value *= rhs;
            pos = after;
        } else if let Some(next) = eat(src, pos, b'/') {
            let (rhs, after) = factor(src, next, depth)?;
            if rhs == 0.0 {
                return Err(EvalError::DivisionByZero { position: next });
            }
            value /= rhs;
            pos = after;
        } else {
            return Ok((value, pos));
        }
    }
}

fn factor(src: &[u8], pos: usize, depth: usize) -> Result<(f64, usize), EvalError> {
    if depth > MAX_DEPTH {
        return Err(EvalError::TooDeep);
    }
    if let Some(next) = eat(src, pos, b'+') {
        return factor(src, next, depth + 1);
    }
    if let Some(next) = eat(src, pos, b'-') {
        let (value, after) = factor(src, next, depth + 1)?;
        return Ok((-value, after));
    }

    let start = pos;
    if let Some(next) = eat(src, start, b'(') {
        let (value, after) = expression(src, next, depth + 1)?;
        return match eat(src, after, b')') {
            Some(closed) => Ok((value, closed)),
            None => Err(EvalError::UnmatchedParenthesis { position: start }),
        };
    }

    match src.get(start) {
        Some(b) if b.is_ascii_digit() || *b == b'.' => number(src, start),
        Some(b) => Err(EvalError::UnexpectedCharacter {
            found: *b as char,
            position: start,
        }),
        None => Err(EvalError::UnexpectedEnd),
    }
}

fn number(src: &[u8], start: usize) -> Result<(f64, usize), EvalError> {
    let mut end = start;
    while end < src.len() && (src[end].is_ascii_digit() || src[end] == b'.') {
        end += 1;
    }
    // validated input is ASCII, so any byte range is valid UTF-8
    let literal = String::from_utf8_lossy(&src[start..end]).into_owned();
    match literal.parse::<f64>() {
        Ok(value) => Ok((value, end)),
        Err(_) => Err(EvalError::MalformedNumber {
            literal,
            position: start,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence() {
        assert_eq!(calculate("2+3*4").unwrap(), "14");
        assert_eq!(calculate("(2+3)*4").unwrap(), "20");
        assert_eq!(calculate("-2+3").unwrap(), "1");
    }

    #[test]
    fn left_associative() {
        assert_eq!(calculate("10-4-3").unwrap(), "3");
        assert_eq!(calculate("100/10/5").unwrap(), "2");
        assert_eq!(calculate("2*3/4").unwrap(), "1.5");
    }

    #[test]
    fn unary_operators() {
        assert_eq!(calculate("--3").unwrap(), "3");
        assert_eq!(calculate("+4").unwrap(), "4");
        assert_eq!(calculate("-(2+3)").unwrap(), "-5");
        assert_eq!(calculate("2*-3").unwrap(), "-6");
    }

    #[test]
    fn whitespace_is_ignored() {
        assert_eq!(calculate("  2 +\t3 * ( 4 - 1 ) ").unwrap(), "11");
    }

    #[test]
    fn decimals() {
        assert_eq!(calculate("1.5+1.5").unwrap(), "3");
        assert_eq!(calculate("10/4").unwrap(), "2.5");
        assert_eq!(calculate(".5*2").unwrap(), "1");
        assert_eq!(calculate("0.1+0.2").unwrap(), "0.30000000000000004");
    }

    #[test]
    fn negative_zero_renders_as_zero() {
        assert_eq!(calculate("-0").unwrap(), "0");
    }

    #[test]
    fn division_by_zero() {
        let err = evaluate("5/0").unwrap_err();
        assert_eq!(err, EvalError::DivisionByZero { position: 2 });
        assert_eq!(err.kind(), ErrorKind::Evaluation);
        assert!(matches!(
            evaluate("1/(2-2)"),
            Err(EvalError::DivisionByZero { .. })
        ));
    }

    #[test]
    fn invalid_characters_rejected_before_parsing() {
        let err = evaluate("2+x").unwrap_err();
        assert_eq!(
            err,
            EvalError::InvalidInput {
                found: 'x',
                position: 2
            }
        );
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("only numbers"));
    }

    #[test]
    fn empty_input() {
        assert_eq!(evaluate(""), Err(EvalError::Empty));
        assert_eq!(evaluate("   "), Err(EvalError::Empty));
    }

    #[test]
    fn malformed_number() {
        assert_eq!(
            evaluate("1.2.3+1"),
            Err(EvalError::MalformedNumber {
                literal: "1.2.3".to_string(),
                position: 0
            })
        );
        assert!(matches!(
            evaluate("."),
            Err(EvalError::MalformedNumber { .. })
        ));
    }

    #[test]
    fn unmatched_parentheses() {
        assert_eq!(
            evaluate("(2+3"),
            Err(EvalError::UnmatchedParenthesis { position: 0 })
        );
        assert_eq!(
            evaluate("2+3)"),
            Err(EvalError::UnmatchedParenthesis { position: 3 })
        );
    }

    #[test]
    fn blanks_inside_numbers_are_dropped() {
        assert_eq!(calculate("2 3").unwrap(), "23");
        assert_eq!(calculate("1 . 5").unwrap(), "1.5");
        assert_eq!(calculate("1 0 / 4").unwrap(), "2.5");
    }

    #[test]
    fn error_positions_ignore_blanks() {
        assert_eq!(
            evaluate("6 / 0"),
            Err(EvalError::DivisionByZero { position: 2 })
        );
    }

    #[test]
    fn trailing_input() {
        assert!(matches!(
            evaluate("(1)(2)"),
            Err(EvalError::TrailingInput { position: 3, .. })
        ));
    }

    #[test]
    fn unexpected_character_and_end() {
        assert_eq!(
            evaluate("2+*3"),
            Err(EvalError::UnexpectedCharacter {
                found: '*',
                position: 2
            })
        );
        assert_eq!(evaluate("2+"), Err(EvalError::UnexpectedEnd));
    }

    #[test]
    fn deep_nesting_is_bounded() {
        let deep = format!("{}1", "-".repeat(MAX_DEPTH + 10));
        assert_eq!(evaluate(&deep), Err(EvalError::TooDeep));
    }

    #[test]
    fn overflow_is_not_finite() {
        let huge = "9".repeat(400);
        assert_eq!(evaluate(&format!("{huge}*{huge}")), Err(EvalError::NonFinite));
    }

    #[test]
    fn format_value_integral_and_fractional() {
        assert_eq!(format_value(42.0), "42");
        assert_eq!(format_value(-7.0), "-7");
        assert_eq!(format_value(2.25), "2.25");
    }
}
