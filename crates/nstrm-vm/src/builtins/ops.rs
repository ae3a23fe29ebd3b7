//! Operators. The front end lowers infix syntax to calls of these names.

use std::cmp::Ordering;

use nstrm_types::{NstrmError, Number, Result};

use super::{arity, define};
use crate::env::Env;
use crate::value::Value;

fn binary<F>(env: &Env, name: &'static str, op: F)
where
    F: Fn(&Value, &Value) -> Result<Value> + Send + Sync + 'static,
{
    define(env, name, move |args| match args.as_slice() {
        [a, b] => op(a, b),
        _ => Err(arity(name, 2, args.len())),
    });
}

fn mismatch(op: &str, a: &Value, b: &Value) -> NstrmError {
    NstrmError::TypeMismatch {
        op: op.to_string(),
        message: format!("unsupported operands {} and {}", a.kind_name(), b.kind_name()),
    }
}

fn numbers(op: &str, a: &Value, b: &Value) -> Result<(Number, Number)> {
    match (a.as_number(), b.as_number()) {
        (Some(x), Some(y)) => Ok((x, y)),
        _ => Err(mismatch(op, a, b)),
    }
}

fn ordered(op: &'static str, env: &Env, test: fn(Ordering) -> bool) {
    binary(env, op, move |a, b| {
        a.compare(b)
            .map(|ord| Value::Bool(test(ord)))
            .ok_or_else(|| mismatch(op, a, b))
    });
}

fn logical(op: &'static str, env: &Env, test: fn(bool, bool) -> bool) {
    binary(env, op, move |a, b| match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => Ok(Value::Bool(test(*x, *y))),
        _ => Err(mismatch(op, a, b)),
    });
}

pub(crate) fn load(env: &Env) {
    binary(env, "append", |array, element| match array {
        Value::Array(items) => {
            let mut items = items.clone();
            items.push(element.clone());
            Ok(Value::Array(items))
        }
        other => Err(mismatch("append", other, element)),
    });

    binary(env, "ADD", |a, b| {
        let (x, y) = numbers("ADD", a, b)?;
        Ok(Value::Number(x.add(y)))
    });
    binary(env, "SUB", |a, b| {
        let (x, y) = numbers("SUB", a, b)?;
        Ok(Value::Number(x.sub(y)))
    });
    binary(env, "MUL", |a, b| {
        let (x, y) = numbers("MUL", a, b)?;
        Ok(Value::Number(x.mul(y)))
    });
    binary(env, "DIV", |a, b| {
        let (x, y) = numbers("DIV", a, b)?;
        Ok(Value::Number(x.div(y)?))
    });
    binary(env, "MOD", |a, b| {
        let (x, y) = numbers("MOD", a, b)?;
        Ok(Value::Number(x.rem(y)?))
    });

    binary(env, "==", |a, b| Ok(Value::Bool(a.equals(b))));
    binary(env, "!=", |a, b| Ok(Value::Bool(!a.equals(b))));
    ordered("<", env, Ordering::is_lt);
    ordered("<=", env, Ordering::is_le);
    ordered(">", env, Ordering::is_gt);
    ordered(">=", env, Ordering::is_ge);

    logical("and", env, |x, y| x && y);
    logical("or", env, |x, y| x || y);
}
