//! Coercion of values into pipeline stages, and evaluation of pipe
//! expressions.
//!
//! Which role an operand plays depends on where it sits: the first operand
//! produces, the last consumes, everything in between filters. The pipe
//! flags turn an open end into a filter.

use nstrm_pipe::{
    connect_fc, connect_ff, connect_pc, connect_pf, Consumer, Filter, Handle, PipeError, Producer,
    Ref, Role, Valve,
};
use nstrm_types::{Expr, NstrmError, Position, Result};
use tokio::sync::mpsc;

use crate::env::{Env, Faults};
use crate::eval::{eval, force, Outcome, Signal};
use crate::function::Function;
use crate::value::Value;

fn not_coercible(role: &'static str, value: &Value, pos: Position) -> NstrmError {
    NstrmError::NotCoercible {
        role,
        found: value.kind_name(),
        pos,
    }
}

fn wiring(err: PipeError, pos: Position) -> NstrmError {
    NstrmError::Runtime {
        pos,
        message: err.to_string(),
    }
}

/// Park a freshly built stage on the scope and hand it back.
fn parked(stage: Handle<Value>, env: &Env) -> Handle<Value> {
    env.decref_later(Value::Stage(stage.clone()));
    stage
}

// ---------------------------------------------------------------------------
// Coercions
// ---------------------------------------------------------------------------

pub fn as_producer(pos: Position, value: Value, env: &Env) -> Result<Handle<Value>> {
    match value {
        Value::Stage(stage) if stage.role().emits() => Ok(stage),
        Value::Stage(stage) if stage.role() == Role::Terminal => {
            Ok(parked(terminal_producer(stage, env), env))
        }
        Value::Function(function) => Ok(parked(
            producer_function(pos, function, env.faults()),
            env,
        )),
        Value::Array(items) => Ok(parked(array_producer(items), env)),
        other => Err(not_coercible("producer", &other, pos)),
    }
}

pub fn as_filter(pos: Position, value: Value, env: &Env) -> Result<Handle<Value>> {
    match value {
        Value::Stage(stage) if stage.role().emits() && stage.role().accepts() => Ok(stage),
        Value::Function(function) => {
            Ok(parked(filter_function(pos, function, env.faults()), env))
        }
        Value::Stage(stage) if stage.role() == Role::Consumer => {
            Ok(parked(consumer_filter(pos, stage, env)?, env))
        }
        other => Err(not_coercible("filter", &other, pos)),
    }
}

pub fn as_consumer(pos: Position, value: Value, env: &Env) -> Result<Handle<Value>> {
    match value {
        Value::Stage(stage) if stage.role().accepts() && stage.role().resolves() => Ok(stage),
        Value::Function(function) => Ok(parked(
            consumer_function(pos, function, env.faults()),
            env,
        )),
        other => Err(not_coercible("consumer", &other, pos)),
    }
}

// ---------------------------------------------------------------------------
// Stage builders
// ---------------------------------------------------------------------------

/// Emits each element, then ends.
pub fn array_producer(items: Vec<Value>) -> Handle<Value> {
    let origin = Valve::new();
    let producer = Producer::new(origin.clone());
    tokio::spawn(async move {
        for item in items {
            if !origin.send(item).await {
                break;
            }
        }
        origin.close();
    });
    producer
}

/// Emits the terminal's result once it settles. A terminal takes no further
/// endpoints, so it is forced right away; it is also joined by the scope.
fn terminal_producer(terminal: Handle<Value>, env: &Env) -> Handle<Value> {
    env.run_later(&terminal);
    let origin = Valve::new();
    let producer = Producer::new(origin.clone());
    let probe = terminal.uncounted();
    drop(terminal);
    tokio::spawn(async move {
        let result = force(Value::Stage(probe)).await;
        if !result.is_nil() {
            origin.send(result).await;
        }
        origin.close();
    });
    producer
}

/// Calls `function` with no arguments until it closes. Each non-nil return
/// value is emitted; `emit` inside the body writes to the same output.
pub fn producer_function(pos: Position, function: Function, faults: Faults) -> Handle<Value> {
    let origin = Valve::new();
    let producer = Producer::new(origin.clone());
    tokio::spawn(async move {
        loop {
            match function.call(pos, Vec::new(), origin.clone()).await {
                Ok(value) => {
                    if !value.is_nil() && !origin.send(value).await {
                        break;
                    }
                }
                Err(Signal::Skip) => {}
                Err(Signal::Close(value)) => {
                    if !value.is_nil() {
                        origin.send(value).await;
                    }
                    break;
                }
                Err(Signal::Error(err)) => {
                    faults.report(err);
                    break;
                }
            }
        }
        origin.close();
    });
    producer
}

/// Calls `function` once per input value. Non-nil return values are
/// emitted; `skip` drops the item and `close` ends the stage.
pub fn filter_function(pos: Position, function: Function, faults: Faults) -> Handle<Value> {
    Filter::new(move |mut input: mpsc::Receiver<Value>, out: Valve<Value>| async move {
        while let Some(value) = input.recv().await {
            let arg = force(value).await;
            match function.call(pos, vec![arg], out.clone()).await {
                Ok(value) => {
                    if !value.is_nil() && !out.send(value).await {
                        return;
                    }
                }
                Err(Signal::Skip) => {}
                Err(Signal::Close(value)) => {
                    if !value.is_nil() {
                        out.send(value).await;
                    }
                    return;
                }
                Err(Signal::Error(err)) => {
                    faults.report(err);
                    return;
                }
            }
        }
    })
}

/// Calls `function` once per input value. Only `close v` sets the result;
/// running out of input yields `Nil`.
pub fn consumer_function(pos: Position, function: Function, faults: Faults) -> Handle<Value> {
    Consumer::new(move |mut input: mpsc::Receiver<Value>| async move {
        while let Some(value) = input.recv().await {
            let arg = force(value).await;
            match function.call(pos, vec![arg], Valve::closed()).await {
                Ok(_) | Err(Signal::Skip) => {}
                Err(Signal::Close(result)) => return result,
                Err(Signal::Error(err)) => {
                    faults.report(err);
                    return Value::Nil;
                }
            }
        }
        Value::Nil
    })
}

/// Feed everything into `consumer`, then emit its result. The consumer is
/// started with the filter and told to exit once the filter's input ends;
/// it is also joined by the scope.
fn consumer_filter(pos: Position, consumer: Handle<Value>, env: &Env) -> Result<Handle<Value>> {
    env.run_later(&consumer);
    let inbound = consumer.new_source().map_err(|err| wiring(err, pos))?;
    let probe = consumer.uncounted();
    drop(consumer);
    Ok(Filter::new(
        move |mut input: mpsc::Receiver<Value>, out: Valve<Value>| async move {
            probe.run(&Ref::new());
            let mut accepted = true;
            while let Some(value) = input.recv().await {
                if !inbound.send(value).await {
                    accepted = false;
                    break;
                }
            }
            if accepted {
                inbound.send_eof().await;
            }
            probe.notify_exit();
            if let Ok(Some(result)) = probe.result().await {
                out.send(result).await;
            }
        },
    ))
}

// ---------------------------------------------------------------------------
// Pipe expressions
// ---------------------------------------------------------------------------

/// Evaluate the operands of `a | b | ...` and wire them together.
///
/// A closed chain (producer to consumer) is registered to run with the
/// scope; an open chain is returned as a stage for later wiring.
pub async fn run_pipe_expr(
    pos: Position,
    args: &[Expr],
    first_filter: bool,
    last_filter: bool,
    env: &Env,
) -> Outcome {
    if args.len() < 2 {
        return Err(NstrmError::Runtime {
            pos,
            message: format!("pipe needs at least two operands, got {}", args.len()),
        }
        .into());
    }
    let mut operands = Vec::with_capacity(args.len());
    for arg in args {
        operands.push(eval(arg, env).await?);
    }

    let last = operands.len() - 1;
    let mut operands = operands.into_iter().zip(args);

    let head_open = first_filter;
    let mut head = match operands.next() {
        Some((value, arg)) if head_open => as_filter(arg.pos, value, env)?,
        Some((value, arg)) => as_producer(arg.pos, value, env)?,
        None => return Ok(Value::Nil),
    };

    for (i, (value, arg)) in operands.enumerate() {
        let is_last = i + 1 == last;
        let joined = match (head_open, is_last, last_filter) {
            (true, false, _) | (true, true, true) => {
                connect_ff(&head, &*as_filter(arg.pos, value, env)?)
            }
            (true, true, false) => connect_fc(&head, &*as_consumer(arg.pos, value, env)?),
            (false, false, _) | (false, true, true) => {
                connect_pf(&head, &*as_filter(arg.pos, value, env)?)
            }
            (false, true, false) => connect_pc(&head, &*as_consumer(arg.pos, value, env)?),
        }
        .map_err(|err| wiring(err, pos))?;
        head = parked(joined, env);
    }

    if !first_filter && !last_filter {
        env.run_later(&head);
    }
    tracing::debug!(scope = %env.id(), role = %head.role(), "Pipe built");
    Ok(Value::Stage(head))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nstrm_types::Number;

    fn double() -> Function {
        Function::builtin("double", |args| match args.first() {
            Some(Value::Number(n)) => Ok(Value::Number(n.mul(Number::Int(2)))),
            _ => Ok(Value::Nil),
        })
    }

    #[tokio::test]
    async fn arrays_become_producers() {
        let env = Env::root();
        let stage = as_producer(Position::default(), Value::Array(vec![]), &env).unwrap();
        assert_eq!(stage.role(), Role::Producer);
    }

    #[tokio::test]
    async fn numbers_are_not_coercible() {
        let env = Env::root();
        let err = as_consumer(Position::new(1, 2), Value::int(1), &env).unwrap_err();
        assert!(matches!(
            err,
            NstrmError::NotCoercible {
                role: "consumer",
                found: "number",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn functions_become_filters() {
        let env = Env::root();
        let filter = as_filter(Position::default(), Value::Function(double()), &env).unwrap();
        assert_eq!(filter.role(), Role::Filter);

        let source = array_producer(vec![Value::int(1), Value::int(2)]);
        let collect = Consumer::new(|mut rx: mpsc::Receiver<Value>| async move {
            let mut all = Vec::new();
            while let Some(v) = rx.recv().await {
                all.push(v);
            }
            Value::Array(all)
        });
        let head = connect_pf(&source, &filter).unwrap();
        let terminal = connect_pc(&head, &collect).unwrap();
        drop((source, filter, collect, head));

        let result = force(Value::Stage(terminal)).await;
        let expected = Value::Array(vec![Value::int(2), Value::int(4)]);
        assert!(result.equals(&expected));
    }

    #[tokio::test]
    async fn consumer_used_as_filter_emits_its_result() {
        let env = Env::root();
        let counter = Consumer::new(|mut rx: mpsc::Receiver<Value>| async move {
            let mut n = 0;
            while rx.recv().await.is_some() {
                n += 1;
            }
            Value::int(n)
        });
        let filter = as_filter(Position::default(), Value::Stage(counter), &env).unwrap();
        assert_eq!(filter.role(), Role::Filter);

        let source = array_producer(vec![Value::int(5), Value::int(6), Value::int(7)]);
        let collect = Consumer::new(|mut rx: mpsc::Receiver<Value>| async move {
            let mut all = Vec::new();
            while let Some(v) = rx.recv().await {
                all.push(v);
            }
            Value::Array(all)
        });
        let head = connect_pf(&source, &filter).unwrap();
        let terminal = connect_pc(&head, &collect).unwrap();
        drop((source, filter, collect, head));

        let result = force(Value::Stage(terminal)).await;
        assert!(result.equals(&Value::Array(vec![Value::int(3)])));
    }
}
