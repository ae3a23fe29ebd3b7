//! Built-in catalog.
//!
//! - [`io`]: `STDOUT`, `STDIN`, `upper`
//! - [`util`]: `seq`, `chan`, `last`, `collect`
//! - [`ops`]: `append`, arithmetic, comparison, boolean operators

pub mod io;
pub mod ops;
pub mod util;

use nstrm_types::{NstrmError, Result};

use crate::env::Env;
use crate::function::Function;
use crate::value::Value;

pub use io::{load_lines, load_stdin, Captured, Console};

/// Define every built-in except `STDIN` in `env`.
pub fn load(env: &Env, console: Console) {
    io::load(env, console);
    util::load(env);
    ops::load(env);
}

/// Bind a native function under `name`.
pub(crate) fn define<F>(env: &Env, name: &'static str, body: F)
where
    F: Fn(Vec<Value>) -> Result<Value> + Send + Sync + 'static,
{
    env.define_builtin(name, Value::Function(Function::builtin(name, body)));
}

pub(crate) fn arity(name: &str, expected: usize, got: usize) -> NstrmError {
    NstrmError::Arity {
        name: name.to_string(),
        expected,
        got,
    }
}
