//! First-class functions: user blocks and native built-ins behind one
//! counted handle.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use nstrm_pipe::{Lease, Ref, Valve};
use nstrm_types::{Expr, NstrmError, Position};

use crate::env::Env;
use crate::eval::{eval_list, Outcome, Signal};
use crate::value::Value;

// ---------------------------------------------------------------------------
// Callable
// ---------------------------------------------------------------------------

/// Something that can be invoked with positional arguments.
///
/// `out` is the valve `emit` writes to while the call runs; calls made
/// outside a pipeline get a closed valve.
#[async_trait]
pub trait Callable: Send + Sync {
    fn name(&self) -> &str;

    async fn call(&self, pos: Position, args: Vec<Value>, out: Valve<Value>) -> Outcome;

    /// Drop whatever the callable captured. Called once, when the last
    /// lease on the function goes away.
    fn release(&self) {}
}

// ---------------------------------------------------------------------------
// Function
// ---------------------------------------------------------------------------

struct FunctionCore {
    callable: Box<dyn Callable>,
    refs: Ref,
    gone: AtomicBool,
}

/// Counted handle to a callable. Clones take a lease; once every lease is
/// gone the function is released and further calls fail.
pub struct Function {
    core: Arc<FunctionCore>,
    lease: Option<Lease>,
}

impl Function {
    pub fn new(callable: impl Callable + 'static) -> Self {
        let core = Arc::new(FunctionCore {
            callable: Box::new(callable),
            refs: Ref::new(),
            gone: AtomicBool::new(false),
        });
        let lease = Some(core.refs.lease());

        let watched = core.clone();
        tokio::spawn(async move {
            watched.refs.wait().await;
            watched.gone.store(true, Ordering::Release);
            watched.callable.release();
            tracing::debug!(function = watched.callable.name(), "Function released");
        });

        Self { core, lease }
    }

    pub fn user(params: Vec<String>, body: Vec<Expr>, captured: Env) -> Self {
        Self::new(UserFunction {
            params,
            body,
            captured: Mutex::new(Some(captured)),
        })
    }

    pub fn builtin<F>(name: &str, body: F) -> Self
    where
        F: Fn(Vec<Value>) -> nstrm_types::Result<Value> + Send + Sync + 'static,
    {
        Self::new(BuiltinFunction {
            name: name.to_string(),
            body: Box::new(body),
        })
    }

    pub fn name(&self) -> &str {
        self.core.callable.name()
    }

    pub fn is_gone(&self) -> bool {
        self.core.gone.load(Ordering::Acquire)
    }

    pub fn refs(&self) -> &Ref {
        &self.core.refs
    }

    pub fn release(&mut self) {
        self.lease = None;
    }

    pub fn uncounted(&self) -> Self {
        Self {
            core: self.core.clone(),
            lease: None,
        }
    }

    pub fn same(&self, other: &Function) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    pub async fn call(&self, pos: Position, args: Vec<Value>, out: Valve<Value>) -> Outcome {
        if self.is_gone() {
            return Err(Signal::Error(
                NstrmError::Released {
                    name: self.name().to_string(),
                }
                .at(pos),
            ));
        }
        self.core.callable.call(pos, args, out).await
    }
}

impl Clone for Function {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            lease: Some(self.core.refs.lease()),
        }
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name())
            .field("counted", &self.lease.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// UserFunction
// ---------------------------------------------------------------------------

/// A block closed over the scope it was written in.
pub struct UserFunction {
    params: Vec<String>,
    body: Vec<Expr>,
    captured: Mutex<Option<Env>>,
}

#[async_trait]
impl Callable for UserFunction {
    fn name(&self) -> &str {
        "block"
    }

    async fn call(&self, pos: Position, args: Vec<Value>, out: Valve<Value>) -> Outcome {
        if args.len() != self.params.len() {
            return Err(Signal::Error(
                NstrmError::Arity {
                    name: self.name().to_string(),
                    expected: self.params.len(),
                    got: args.len(),
                }
                .at(pos),
            ));
        }
        let captured = self
            .captured
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(captured) = captured else {
            return Err(Signal::Error(
                NstrmError::Released {
                    name: self.name().to_string(),
                }
                .at(pos),
            ));
        };

        let env = captured.child();
        drop(captured);
        env.set_out(out);
        for (name, arg) in self.params.iter().zip(args) {
            env.define(name, arg);
        }

        let outcome = eval_list(&self.body, &env).await;
        let ret = match &outcome {
            Ok(value) | Err(Signal::Close(value)) => value.clone(),
            Err(_) => Value::Nil,
        };
        env.run(ret);
        outcome
    }

    fn release(&self) {
        let captured = self
            .captured
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(captured);
    }
}

// ---------------------------------------------------------------------------
// BuiltinFunction
// ---------------------------------------------------------------------------

type NativeFn = Box<dyn Fn(Vec<Value>) -> nstrm_types::Result<Value> + Send + Sync>;

/// A native function. Errors it returns are positioned at the call site.
pub struct BuiltinFunction {
    name: String,
    body: NativeFn,
}

#[async_trait]
impl Callable for BuiltinFunction {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, pos: Position, args: Vec<Value>, _out: Valve<Value>) -> Outcome {
        (self.body)(args).map_err(|err| Signal::Error(err.at(pos)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn builtin_errors_carry_call_position() {
        let f = Function::builtin("fail", |_| Err(NstrmError::Other("nope".into())));
        let pos = Position::new(2, 6);
        match f.call(pos, vec![], Valve::closed()).await {
            Err(Signal::Error(err)) => assert_eq!(err.position(), Some(pos)),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn released_function_refuses_calls() {
        let f = Function::builtin("id", |mut args| Ok(args.pop().unwrap_or_default()));
        let probe = f.uncounted();
        drop(f);

        tokio::time::timeout(Duration::from_secs(1), async {
            while !probe.is_gone() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("function should be released");

        let outcome = probe.call(Position::default(), vec![], Valve::closed()).await;
        assert!(matches!(
            outcome,
            Err(Signal::Error(NstrmError::Runtime { .. }))
        ));
    }

    #[tokio::test]
    async fn clones_are_counted() {
        let f = Function::builtin("id", |_| Ok(Value::Nil));
        let copy = f.clone();
        assert_eq!(f.refs().count(), 2);
        drop(copy);
        assert_eq!(f.refs().count(), 1);
        assert!(f.same(&f.uncounted()));
    }
}
