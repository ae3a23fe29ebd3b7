//! Shared types, errors, and numbers for the nstrm runtime.
//!
//! This crate provides the leaf types used across all other nstrm crates:
//! - `NstrmError`: unified error taxonomy, positioned when the source span is known
//! - `Position`: byte span of an expression in the program text
//! - `Number`: integer/float numeric values used by literals and arithmetic
//! - [`ast`]: the expression tree the interpreter evaluates, loadable from JSON

pub mod ast;

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::Path;

pub use ast::{Expr, ExprKind, Literal, Program};

// ---------------------------------------------------------------------------
// Position: byte span in the source text
// ---------------------------------------------------------------------------

/// Half-open byte span `[begin, end)` of an expression in the source text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub begin: usize,
    pub end: usize,
}

impl Position {
    pub fn new(begin: usize, end: usize) -> Self {
        Self { begin, end }
    }

    /// 1-based line and column of `begin` within `source`.
    pub fn line_col(&self, source: &str) -> (usize, usize) {
        let mut line = 1;
        let mut col = 0;
        for byte in source.bytes().take(self.begin) {
            if byte == b'\n' {
                line += 1;
                col = 0;
            }
            col += 1;
        }
        (line, col)
    }

    /// The text covered by this span, or an empty string when out of range.
    pub fn snippet<'a>(&self, source: &'a str) -> &'a str {
        source.get(self.begin..self.end).unwrap_or("")
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.begin, self.end)
    }
}

// ---------------------------------------------------------------------------
// NstrmError
// ---------------------------------------------------------------------------

/// Unified error type for all nstrm subsystems.
#[derive(Debug, thiserror::Error)]
pub enum NstrmError {
    // === Construction Errors ===
    #[error("cannot use {found} as a {role} at {pos}")]
    NotCoercible {
        role: &'static str,
        found: &'static str,
        pos: Position,
    },

    #[error("{name} is undefined")]
    Undefined { name: String, pos: Position },

    #[error("{name} is not a function")]
    NotCallable { name: String, pos: Position },

    #[error("{name}: expected {expected} arguments, got {got}")]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("{name} was called after it was released")]
    Released { name: String },

    #[error("{found} cannot be used as a condition")]
    NotCondition { found: &'static str },

    #[error("type mismatch in {op}: {message}")]
    TypeMismatch { op: String, message: String },

    // === Runtime Errors ===
    #[error("{message}")]
    Runtime { pos: Position, message: String },

    #[error("pipe error: {0}")]
    Pipe(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl NstrmError {
    /// Source span attached to the error, if any.
    pub fn position(&self) -> Option<Position> {
        match self {
            NstrmError::NotCoercible { pos, .. }
            | NstrmError::Undefined { pos, .. }
            | NstrmError::NotCallable { pos, .. }
            | NstrmError::Runtime { pos, .. } => Some(*pos),
            _ => None,
        }
    }

    /// Attach `pos` to an error that has no position yet.
    pub fn at(self, pos: Position) -> Self {
        if self.position().is_some() {
            self
        } else {
            NstrmError::Runtime {
                pos,
                message: self.to_string(),
            }
        }
    }

    /// Render the error against the program text: line, column, and the
    /// offending snippet, followed by the message.
    pub fn render(&self, source: &str) -> String {
        match self.position() {
            Some(pos) => {
                let (line, col) = pos.line_col(source);
                format!(
                    "line: {line}, Column: {col}\n{}\nError: {self}",
                    pos.snippet(source)
                )
            }
            None => format!("Error: {self}"),
        }
    }
}

/// A convenience alias for `Result<T, NstrmError>`.
pub type Result<T> = std::result::Result<T, NstrmError>;

// ---------------------------------------------------------------------------
// Number
// ---------------------------------------------------------------------------

/// Numeric value. Integer arithmetic stays integral until it cannot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub fn as_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Float(f) => f,
        }
    }

    /// Truncating conversion to an integer.
    pub fn to_int(self) -> i64 {
        match self {
            Number::Int(i) => i,
            Number::Float(f) => f as i64,
        }
    }

    pub fn add(self, rhs: Number) -> Number {
        match (self, rhs) {
            (Number::Int(a), Number::Int(b)) => a
                .checked_add(b)
                .map(Number::Int)
                .unwrap_or(Number::Float(a as f64 + b as f64)),
            (a, b) => Number::Float(a.as_f64() + b.as_f64()),
        }
    }

    pub fn sub(self, rhs: Number) -> Number {
        match (self, rhs) {
            (Number::Int(a), Number::Int(b)) => a
                .checked_sub(b)
                .map(Number::Int)
                .unwrap_or(Number::Float(a as f64 - b as f64)),
            (a, b) => Number::Float(a.as_f64() - b.as_f64()),
        }
    }

    pub fn mul(self, rhs: Number) -> Number {
        match (self, rhs) {
            (Number::Int(a), Number::Int(b)) => a
                .checked_mul(b)
                .map(Number::Int)
                .unwrap_or(Number::Float(a as f64 * b as f64)),
            (a, b) => Number::Float(a.as_f64() * b.as_f64()),
        }
    }

    /// Division; exact integer quotients stay integers.
    pub fn div(self, rhs: Number) -> Result<Number> {
        match (self, rhs) {
            (_, Number::Int(0)) => Err(NstrmError::Other("division by zero".into())),
            (Number::Int(a), Number::Int(b)) if a.checked_rem(b) == Some(0) => Ok(Number::Int(a / b)),
            (a, b) => Ok(Number::Float(a.as_f64() / b.as_f64())),
        }
    }

    pub fn rem(self, rhs: Number) -> Result<Number> {
        match (self, rhs) {
            (Number::Int(_), Number::Int(0)) => {
                Err(NstrmError::Other("division by zero".into()))
            }
            (Number::Int(a), Number::Int(b)) => a
                .checked_rem(b)
                .map(Number::Int)
                .ok_or_else(|| NstrmError::Other(format!("{a} MOD {b} overflows"))),
            (a, b) => Err(NstrmError::TypeMismatch {
                op: "MOD".into(),
                message: format!("{a} and {b} must both be integers"),
            }),
        }
    }
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        self.partial_cmp(other) == Some(Ordering::Equal)
    }
}

impl PartialOrd for Number {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => Some(a.cmp(b)),
            (a, b) => a.as_f64().partial_cmp(&b.as_f64()),
        }
    }
}

impl From<i64> for Number {
    fn from(i: i64) -> Self {
        Number::Int(i)
    }
}

impl From<f64> for Number {
    fn from(f: f64) -> Self {
        Number::Float(f)
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Number::Int(i) => write!(f, "{i}"),
            Number::Float(x) => write!(f, "{x}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Program loading
// ---------------------------------------------------------------------------

/// Read a JSON-encoded program from `path`.
pub fn load_program(path: &Path) -> Result<Program> {
    let data = std::fs::read_to_string(path)?;
    parse_program(&data)
}

/// Decode a program from JSON. Accepts either `{"body": [...]}` or a bare
/// array of expressions.
pub fn parse_program(json: &str) -> Result<Program> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    let program = if value.is_array() {
        Program {
            body: serde_json::from_value(value)?,
        }
    } else {
        serde_json::from_value(value)?
    };
    Ok(program)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_col_counts_newlines() {
        let source = "a = 1\nb = seq(3) | collect()\n";
        let pos = Position::new(10, 16);
        assert_eq!(pos.line_col(source), (2, 5));
        assert_eq!(pos.snippet(source), "seq(3)");
    }

    #[test]
    fn render_includes_location_and_message() {
        let source = "x | y";
        let err = NstrmError::Undefined {
            name: "y".into(),
            pos: Position::new(4, 5),
        };
        let rendered = err.render(source);
        assert!(rendered.starts_with("line: 1, Column: 4\ny\n"));
        assert!(rendered.ends_with("Error: y is undefined"));
    }

    #[test]
    fn at_only_positions_unpositioned_errors() {
        let err = NstrmError::Other("boom".into()).at(Position::new(3, 7));
        assert_eq!(err.position(), Some(Position::new(3, 7)));

        let already = NstrmError::Undefined {
            name: "f".into(),
            pos: Position::new(1, 2),
        }
        .at(Position::new(9, 9));
        assert_eq!(already.position(), Some(Position::new(1, 2)));
    }

    #[test]
    fn integer_arithmetic_stays_integral() {
        let a = Number::Int(7);
        let b = Number::Int(2);
        assert_eq!(a.add(b), Number::Int(9));
        assert_eq!(a.mul(b), Number::Int(14));
        assert!(matches!(a.div(b).unwrap(), Number::Float(f) if f == 3.5));
        assert!(matches!(Number::Int(8).div(b).unwrap(), Number::Int(4)));
        assert!(matches!(a.rem(b).unwrap(), Number::Int(1)));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        assert!(Number::Int(1).div(Number::Int(0)).is_err());
        assert!(Number::Int(1).rem(Number::Int(0)).is_err());
    }

    #[test]
    fn mixed_comparison_uses_float_semantics() {
        assert_eq!(Number::Int(2), Number::Float(2.0));
        assert!(Number::Int(1) < Number::Float(1.5));
    }

    #[test]
    fn load_program_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prog.json");
        std::fs::write(&path, r#"[{"kind": {"type": "literal", "value": 42}}]"#).unwrap();

        let program = load_program(&path).unwrap();
        assert_eq!(program.body.len(), 1);
        assert!(matches!(
            program.body[0].kind,
            ExprKind::Literal {
                value: Literal::Number(Number::Int(42))
            }
        ));
    }
}
