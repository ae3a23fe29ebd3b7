//! Console and line-input built-ins.

use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

use nstrm_pipe::{Producer, Valve};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use super::{arity, define};
use crate::env::Env;
use crate::value::Value;

/// Where `STDOUT` writes. Cloning shares the writer.
#[derive(Clone)]
pub struct Console {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Console {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    /// Discards everything.
    pub fn sink() -> Self {
        Self::new(std::io::sink())
    }

    /// A console writing into memory, and the handle to read it back.
    pub fn capture() -> (Self, Captured) {
        let captured = Captured::default();
        (Self::new(captured.clone()), captured)
    }

    pub fn println(&self, line: &str) -> std::io::Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{line}")?;
        writer.flush()
    }
}

/// In-memory output of [`Console::capture`].
#[derive(Clone, Default)]
pub struct Captured {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl Captured {
    pub fn contents(&self) -> String {
        let buf = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buf).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_string).collect()
    }
}

impl Write for Captured {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub(crate) fn load(env: &Env, console: Console) {
    define(env, "STDOUT", move |args| {
        for value in &args {
            console.println(&value.to_string())?;
        }
        Ok(Value::Nil)
    });

    define(env, "upper", |args| match args.into_iter().next() {
        Some(Value::String(s)) => Ok(Value::String(s.to_uppercase())),
        Some(other) => Ok(other),
        None => Err(arity("upper", 1, 0)),
    });
}

/// Bind `name` to a producer of the lines read from `reader`.
pub fn load_lines<R>(env: &Env, name: &str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let origin = Valve::new();
    let producer = Producer::new(origin.clone());
    let source = name.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if !origin.send(Value::String(line)).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(source = %source, error = %err, "Line input failed");
                    break;
                }
            }
        }
        tracing::debug!(source = %source, "Line input ended");
        origin.close();
    });
    env.define_builtin(name, Value::Stage(producer));
}

/// Bind `STDIN` to the process's standard input.
pub fn load_stdin(env: &Env) {
    load_lines(env, "STDIN", tokio::io::stdin());
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stdout_prints_each_argument_on_its_own_line() {
        let env = Env::root();
        let (console, captured) = Console::capture();
        load(&env, console);
        let Some(Value::Function(print)) = env.lookup("STDOUT") else {
            panic!("STDOUT should be a function");
        };
        print
            .call(
                Default::default(),
                vec![Value::int(1), Value::from("two")],
                Valve::closed(),
            )
            .await
            .unwrap();
        assert_eq!(captured.lines(), vec!["1", "two"]);
    }

    #[tokio::test]
    async fn lines_become_a_producer() {
        let env = Env::root();
        load_lines(&env, "INPUT", &b"alpha\nbeta\n"[..]);
        let Some(Value::Stage(stage)) = env.lookup("INPUT") else {
            panic!("INPUT should be a stage");
        };
        assert_eq!(stage.role(), nstrm_pipe::Role::Producer);
    }
}
