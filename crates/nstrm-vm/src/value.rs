//! Runtime values.

use std::cmp::Ordering;
use std::fmt;

use nstrm_pipe::{Counted, Handle, Ref, Role};
use nstrm_types::{Literal, Number};

use crate::function::Function;

/// A dynamically typed value.
///
/// Cloning a `Function` or `Stage` takes a counted lease on the underlying
/// resource and dropping the clone gives it back.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<Value>),
    Function(Function),
    Stage(Handle<Value>),
}

impl Value {
    pub fn int(i: i64) -> Self {
        Value::Number(Number::Int(i))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Function(_) => "function",
            Value::Stage(h) => match h.role() {
                Role::Producer => "producer",
                Role::Filter => "filter",
                Role::Consumer => "consumer",
                Role::Terminal => "terminal",
                Role::Hub => "channel",
                Role::Port => "port",
            },
        }
    }

    /// Interest counter of the resource behind this value, if it has one.
    pub fn refs(&self) -> Option<&Ref> {
        match self {
            Value::Function(f) => Some(f.refs()),
            Value::Stage(h) => Some(h.refs()),
            _ => None,
        }
    }

    /// Give up every lease this value holds, recursively. The value stays
    /// usable but no longer keeps anything alive.
    pub fn release(&mut self) {
        match self {
            Value::Function(f) => f.release(),
            Value::Stage(h) => h.release(),
            Value::Array(items) => items.iter_mut().for_each(Value::release),
            _ => {}
        }
    }

    /// A copy that holds no leases.
    pub fn uncounted(&self) -> Value {
        match self {
            Value::Function(f) => Value::Function(f.uncounted()),
            Value::Stage(h) => Value::Stage(h.uncounted()),
            Value::Array(items) => Value::Array(items.iter().map(Value::uncounted).collect()),
            other => other.clone(),
        }
    }

    pub fn as_number(&self) -> Option<Number> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Structural equality. Numbers compare by value, arrays element-wise,
    /// functions and stages by identity.
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.equals(y))
            }
            (Value::Function(a), Value::Function(b)) => a.same(b),
            (Value::Stage(a), Value::Stage(b)) => a.same_stage(b),
            _ => false,
        }
    }

    /// Ordering for the comparison built-ins; only numbers are ordered.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

impl From<&Literal> for Value {
    fn from(literal: &Literal) -> Self {
        match literal {
            Literal::Nil => Value::Nil,
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Number(n) => Value::Number(*n),
            Literal::String(s) => Value::String(s.clone()),
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => f.write_str(s),
            Value::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Function(func) => write!(f, "<function {}>", func.name()),
            Value::Stage(h) => write!(f, "<{} {}>", self.kind_name(), h.id()),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{s:?}"),
            Value::Array(items) => f.debug_list().entries(items).finish(),
            other => write!(f, "{other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arrays_compare_element_wise() {
        let a = Value::Array(vec![Value::int(1), Value::from("x")]);
        let b = Value::Array(vec![Value::Number(Number::Float(1.0)), Value::from("x")]);
        assert!(a.equals(&b));
        assert!(!a.equals(&Value::Array(vec![Value::int(1)])));
        assert!(Value::Nil.equals(&Value::Nil));
        assert!(!Value::Nil.equals(&Value::Bool(false)));
    }

    #[test]
    fn only_numbers_are_ordered() {
        assert_eq!(Value::int(1).compare(&Value::int(2)), Some(Ordering::Less));
        assert_eq!(Value::from("a").compare(&Value::from("b")), None);
    }

    #[test]
    fn display_matches_print_format() {
        let v = Value::Array(vec![Value::int(1), Value::from("two"), Value::Nil]);
        assert_eq!(v.to_string(), "[1 two nil]");
        assert_eq!(format!("{v:?}"), "[1, \"two\", nil]");
    }
}
