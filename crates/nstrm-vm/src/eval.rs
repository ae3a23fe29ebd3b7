//! Tree-walking evaluator.

use futures_core::future::BoxFuture;
use nstrm_pipe::{Ref, Role, Valve};
use nstrm_types::{Expr, ExprKind, NstrmError, Program};

use crate::adapt::run_pipe_expr;
use crate::env::Env;
use crate::function::Function;
use crate::value::Value;

/// Non-local exits. `Skip` drops the current item, `Close` ends the
/// running stage with a final value (`Nil` for none), `Error` aborts.
#[derive(Debug)]
pub enum Signal {
    Skip,
    Close(Value),
    Error(NstrmError),
}

impl From<NstrmError> for Signal {
    fn from(err: NstrmError) -> Self {
        Signal::Error(err)
    }
}

/// Result of evaluating an expression.
pub type Outcome = std::result::Result<Value, Signal>;

/// Evaluate the top level of `program` in `env`, then leave the scope and
/// wait for everything it started.
pub async fn execute(program: &Program, env: Env) -> nstrm_types::Result<()> {
    match eval_list(&program.body, &env).await {
        Ok(_) | Err(Signal::Skip) | Err(Signal::Close(_)) => {
            env.run_wait(Value::Nil).await;
            Ok(())
        }
        Err(Signal::Error(err)) => Err(err),
    }
}

/// Evaluate `exprs` in order; the last value is the result.
pub async fn eval_list(exprs: &[Expr], env: &Env) -> Outcome {
    let mut ret = Value::Nil;
    for expr in exprs {
        ret = eval(expr, env).await?;
    }
    Ok(ret)
}

pub fn eval<'a>(expr: &'a Expr, env: &'a Env) -> BoxFuture<'a, Outcome> {
    Box::pin(async move {
        match &expr.kind {
            ExprKind::Literal { value } => Ok(Value::from(value)),

            ExprKind::Var { name } => {
                let value = env.lookup(name).ok_or_else(|| NstrmError::Undefined {
                    name: name.clone(),
                    pos: expr.pos,
                })?;
                env.decref_later(value.clone());
                Ok(value)
            }

            ExprKind::Bind { name, expr: inner } => {
                let value = eval(inner, env).await?;
                env.define(name, value.clone());
                Ok(value)
            }

            ExprKind::Call { name, args } => {
                let callee = env.lookup(name).ok_or_else(|| NstrmError::Undefined {
                    name: name.clone(),
                    pos: expr.pos,
                })?;
                env.decref_later(callee.clone());
                let Value::Function(function) = callee else {
                    return Err(NstrmError::NotCallable {
                        name: name.clone(),
                        pos: expr.pos,
                    }
                    .into());
                };

                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    let value = eval(arg, env).await?;
                    values.push(force(value).await);
                }

                let outcome = function.call(expr.pos, values, Valve::closed()).await;
                if let Ok(ret) | Err(Signal::Close(ret)) = &outcome {
                    env.decref_later(ret.clone());
                }
                outcome
            }

            ExprKind::Pipe {
                args,
                first_filter,
                last_filter,
            } => run_pipe_expr(expr.pos, args, *first_filter, *last_filter, env).await,

            ExprKind::Block { params, body } => {
                let function = Value::Function(Function::user(
                    params.clone(),
                    body.clone(),
                    env.child(),
                ));
                env.decref_later(function.clone());
                Ok(function)
            }

            ExprKind::If {
                cond,
                then,
                otherwise,
            } => {
                let value = eval_list(cond, env).await?;
                if condition(value).await? {
                    eval_list(then, env).await
                } else {
                    eval_list(otherwise, env).await
                }
            }

            ExprKind::While { cond, body } => {
                let outer = env.child();
                let outcome = run_while(cond, body, &outer).await;
                outer.run(Value::Nil);
                outcome
            }

            ExprKind::Array { elements } => {
                let mut items = Vec::with_capacity(elements.len());
                for element in elements {
                    items.push(eval(element, env).await?);
                }
                Ok(Value::Array(items))
            }

            ExprKind::Wait => {
                env.flush().await;
                Ok(Value::Nil)
            }

            ExprKind::Close { value } => {
                let value = match value {
                    Some(inner) => eval(inner, env).await?,
                    None => Value::Nil,
                };
                Err(Signal::Close(value))
            }

            ExprKind::Emit { values } => {
                for inner in values {
                    let value = eval(inner, env).await?;
                    if !env.send(value).await {
                        tracing::debug!(scope = %env.id(), "Emit found no reader, closing");
                        return Err(Signal::Close(Value::Nil));
                    }
                }
                Ok(Value::Nil)
            }

            ExprKind::Skip => Err(Signal::Skip),
        }
    })
}

/// Loop body. Conditions run in `outer`; every iteration gets its own
/// scope, run once the iteration's value is known.
async fn run_while(cond: &[Expr], body: &[Expr], outer: &Env) -> Outcome {
    let mut ret = Value::Nil;
    loop {
        let value = eval_list(cond, outer).await?;
        if !condition(value).await? {
            return Ok(ret);
        }
        let iteration = outer.child();
        match eval_list(body, &iteration).await {
            Ok(value) => {
                iteration.run(value.clone());
                ret = value;
            }
            Err(signal) => {
                iteration.run(Value::Nil);
                return Err(signal);
            }
        }
    }
}

/// Resolve a terminal pipeline to its result: run it, tell it no more
/// endpoints are coming, wait, and read the result. Anything else is
/// returned as is.
pub fn force(value: Value) -> BoxFuture<'static, Value> {
    Box::pin(async move {
        match value {
            Value::Stage(stage) if stage.role() == Role::Terminal => {
                let join = Ref::new();
                stage.run(&join);
                stage.notify_exit();
                join.wait().await;
                match stage.result().await {
                    Ok(Some(result)) => force(result).await,
                    _ => Value::Nil,
                }
            }
            other => other,
        }
    })
}

/// Truthiness: `Nil` is false, booleans are themselves, terminals are
/// forced first. Anything else is an error.
pub async fn condition(value: Value) -> nstrm_types::Result<bool> {
    match force(value).await {
        Value::Nil => Ok(false),
        Value::Bool(b) => Ok(b),
        other => Err(NstrmError::NotCondition {
            found: other.kind_name(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::{self, Console};
    use nstrm_types::ast::build::*;

    async fn eval_in(exprs: Vec<Expr>) -> (Outcome, Env) {
        let env = Env::root();
        builtins::load(&env, Console::sink());
        let outcome = eval_list(&exprs, &env).await;
        (outcome, env)
    }

    #[tokio::test]
    async fn binding_and_lookup() {
        let (outcome, env) = eval_in(vec![bind("x", int(4)), var("x")]).await;
        assert!(outcome.unwrap().equals(&Value::int(4)));
        assert!(env.lookup("x").is_some());
    }

    #[tokio::test]
    async fn undefined_variable_is_positioned() {
        let (outcome, _) = eval_in(vec![var("nope").at(nstrm_types::Position::new(3, 7))]).await;
        match outcome {
            Err(Signal::Error(NstrmError::Undefined { name, pos })) => {
                assert_eq!(name, "nope");
                assert_eq!(pos.begin, 3);
            }
            other => panic!("expected undefined error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn calling_a_number_is_an_error() {
        let (outcome, _) = eval_in(vec![bind("n", int(1)), call("n", vec![])]).await;
        assert!(matches!(
            outcome,
            Err(Signal::Error(NstrmError::NotCallable { .. }))
        ));
    }

    #[tokio::test]
    async fn block_call_binds_parameters() {
        let (outcome, _) = eval_in(vec![
            bind(
                "add",
                block(&["a", "b"], vec![call("ADD", vec![var("a"), var("b")])]),
            ),
            call("add", vec![int(2), int(5)]),
        ])
        .await;
        assert!(outcome.unwrap().equals(&Value::int(7)));
    }

    #[tokio::test]
    async fn if_picks_a_branch() {
        let (outcome, _) = eval_in(vec![if_else(
            call("<", vec![int(1), int(2)]),
            vec![string("yes")],
            vec![string("no")],
        )])
        .await;
        assert!(outcome.unwrap().equals(&Value::from("yes")));
    }

    #[tokio::test]
    async fn non_boolean_condition_is_an_error() {
        let (outcome, _) = eval_in(vec![if_else(int(1), vec![], vec![])]).await;
        assert!(matches!(
            outcome,
            Err(Signal::Error(NstrmError::NotCondition { found: "number" }))
        ));
    }

    #[tokio::test]
    async fn while_counts_up() {
        let (outcome, env) = eval_in(vec![
            bind("i", int(0)),
            while_loop(
                call("<", vec![var("i"), int(5)]),
                vec![bind("i", call("ADD", vec![var("i"), int(1)]))],
            ),
        ])
        .await;
        assert!(outcome.unwrap().equals(&Value::int(5)));
        assert!(env.lookup("i").unwrap().equals(&Value::int(5)));
    }

    #[tokio::test]
    async fn close_and_skip_are_signals() {
        let (outcome, _) = eval_in(vec![close(Some(int(3)))]).await;
        assert!(matches!(outcome, Err(Signal::Close(v)) if v.equals(&Value::int(3))));

        let (outcome, _) = eval_in(vec![skip()]).await;
        assert!(matches!(outcome, Err(Signal::Skip)));
    }

    #[tokio::test]
    async fn emit_outside_a_pipeline_closes() {
        let (outcome, _) = eval_in(vec![emit(vec![int(1)])]).await;
        assert!(matches!(outcome, Err(Signal::Close(Value::Nil))));
    }

    #[tokio::test]
    async fn terminal_arguments_are_forced() {
        let (outcome, _) = eval_in(vec![call(
            "append",
            vec![pipe(vec![array(vec![int(1), int(2)]), call("collect", vec![])]), int(3)],
        )])
        .await;
        let expected = Value::Array(vec![Value::int(1), Value::int(2), Value::int(3)]);
        assert!(outcome.unwrap().equals(&expected));
    }
}
