//! Stream constructors: ranges, hubs, and the stock consumers.

use nstrm_pipe::{Consumer, Hub, Producer, Valve};
use nstrm_types::{NstrmError, Result};
use tokio::sync::mpsc;

use super::{arity, define};
use crate::env::Env;
use crate::value::Value;

fn int_arg(name: &str, value: &Value) -> Result<i64> {
    value
        .as_number()
        .map(|n| n.to_int())
        .ok_or_else(|| NstrmError::TypeMismatch {
            op: name.to_string(),
            message: format!("expected a number, got {}", value.kind_name()),
        })
}

/// Producer of `start..=end`.
pub fn range(start: i64, end: i64) -> Value {
    let origin = Valve::new();
    let producer = Producer::new(origin.clone());
    tokio::spawn(async move {
        for i in start..=end {
            if !origin.send(Value::int(i)).await {
                tracing::debug!(at = i, "seq stopped early");
                break;
            }
        }
        origin.close();
    });
    Value::Stage(producer)
}

pub(crate) fn load(env: &Env) {
    define(env, "seq", |args| match args.as_slice() {
        [end] => Ok(range(1, int_arg("seq", end)?)),
        [start, end] => Ok(range(int_arg("seq", start)?, int_arg("seq", end)?)),
        _ => Err(arity("seq", 2, args.len())),
    });

    define(env, "chan", |_| Ok(Value::Stage(Hub::new())));

    define(env, "last", |args| {
        let initial = args.into_iter().next().unwrap_or_default();
        Ok(Value::Stage(Consumer::new(
            move |mut input: mpsc::Receiver<Value>| async move {
                let mut ret = initial;
                while let Some(value) = input.recv().await {
                    ret = value;
                }
                ret
            },
        )))
    });

    define(env, "collect", |_| {
        Ok(Value::Stage(Consumer::new(
            |mut input: mpsc::Receiver<Value>| async move {
                let mut items = Vec::new();
                while let Some(value) = input.recv().await {
                    items.push(value);
                }
                Value::Array(items)
            },
        )))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::force;
    use nstrm_pipe::connect_pc;

    async fn collect_range(start: i64, end: i64) -> Value {
        let Value::Stage(source) = range(start, end) else {
            unreachable!()
        };
        let sink = Consumer::new(|mut input: mpsc::Receiver<Value>| async move {
            let mut items = Vec::new();
            while let Some(value) = input.recv().await {
                items.push(value);
            }
            Value::Array(items)
        });
        let terminal = connect_pc(&source, &sink).unwrap();
        drop((source, sink));
        force(Value::Stage(terminal)).await
    }

    #[tokio::test]
    async fn range_is_inclusive() {
        let got = collect_range(2, 4).await;
        let want = Value::Array(vec![Value::int(2), Value::int(3), Value::int(4)]);
        assert!(got.equals(&want));
    }

    #[tokio::test]
    async fn empty_range_ends_immediately() {
        assert!(collect_range(3, 1).await.equals(&Value::Array(vec![])));
    }

    #[test]
    fn seq_rejects_strings() {
        let err = int_arg("seq", &Value::from("x")).unwrap_err();
        assert!(matches!(err, NstrmError::TypeMismatch { .. }));
    }
}
