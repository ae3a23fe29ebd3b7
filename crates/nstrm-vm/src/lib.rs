//! Interpreter for nstrm programs.
//!
//! - [`value`]: dynamic values; functions and stages are counted
//! - [`function`]: user blocks and native built-ins
//! - [`env`]: the scope tree and its run/release lifecycle
//! - [`gc`]: reference helpers over values
//! - [`adapt`]: coercing values into stages and wiring pipe expressions
//! - [`eval`]: the evaluator
//! - [`builtins`]: the built-in catalog

pub mod adapt;
pub mod builtins;
pub mod env;
pub mod eval;
pub mod function;
pub mod gc;
pub mod value;

pub use builtins::Console;
pub use env::{Env, Faults};
pub use eval::{eval, eval_list, execute, force, Outcome, Signal};
pub use function::{Callable, Function};
pub use value::Value;
