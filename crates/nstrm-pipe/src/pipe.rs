//! The closed set of stage variants, their capabilities, and counted handles.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use futures_core::future::BoxFuture;
use uuid::Uuid;

use crate::consumer::Consumer;
use crate::filter::Filter;
use crate::hub::Hub;
use crate::producer::Producer;
use crate::refcount::{Counted, Lease, Ref};
use crate::stage::Payload;
use crate::valve::Valve;
use crate::{PipeError, Result};

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

/// What a stage can do from the outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Producer,
    Filter,
    Consumer,
    /// Closed pipeline: only a result, no endpoints.
    Terminal,
    Hub,
    /// Consumer and producer joined side by side: a bidirectional endpoint.
    Port,
}

impl Role {
    /// Accepts sinks (`add_sink`).
    pub fn emits(self) -> bool {
        matches!(self, Role::Producer | Role::Filter | Role::Hub | Role::Port)
    }

    /// Hands out source valves (`new_source`).
    pub fn accepts(self) -> bool {
        matches!(self, Role::Filter | Role::Consumer | Role::Hub | Role::Port)
    }

    /// Has a result.
    pub fn resolves(self) -> bool {
        matches!(
            self,
            Role::Consumer | Role::Terminal | Role::Hub | Role::Port
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Producer => "producer",
            Role::Filter => "filter",
            Role::Consumer => "consumer",
            Role::Terminal => "terminal",
            Role::Hub => "hub",
            Role::Port => "port",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Composite
// ---------------------------------------------------------------------------

/// Two stages wired together by a connector. Holds its children without
/// counting them and forwards every operation to the child that still
/// exposes the capability.
pub struct Composite<T> {
    pub(crate) id: Uuid,
    pub(crate) role: Role,
    pub(crate) left: Pipe<T>,
    pub(crate) right: Pipe<T>,
    pub(crate) refs: Ref,
}

impl<T: Payload> Composite<T> {
    pub fn left(&self) -> &Pipe<T> {
        &self.left
    }

    pub fn right(&self) -> &Pipe<T> {
        &self.right
    }

    /// Child that takes new sinks. A port keeps its producer on the right.
    fn sink_end(&self) -> &Pipe<T> {
        &self.right
    }

    /// Child that hands out new sources.
    fn source_end(&self) -> &Pipe<T> {
        &self.left
    }

    /// Child that owns the result.
    fn result_end(&self) -> &Pipe<T> {
        match self.role {
            Role::Port => &self.left,
            _ => &self.right,
        }
    }
}

// ---------------------------------------------------------------------------
// Pipe
// ---------------------------------------------------------------------------

/// Any stage. Cloning a `Pipe` does not count as interest; use [`Handle`]
/// for that.
pub enum Pipe<T> {
    Producer(Producer<T>),
    Filter(Filter<T>),
    Consumer(Consumer<T>),
    Hub(Hub<T>),
    Composite(Arc<Composite<T>>),
}

impl<T> Clone for Pipe<T> {
    fn clone(&self) -> Self {
        match self {
            Pipe::Producer(p) => Pipe::Producer(Producer {
                core: p.core.clone(),
            }),
            Pipe::Filter(f) => Pipe::Filter(Filter {
                core: f.core.clone(),
            }),
            Pipe::Consumer(c) => Pipe::Consumer(Consumer {
                core: c.core.clone(),
            }),
            Pipe::Hub(h) => Pipe::Hub(Hub {
                core: h.core.clone(),
            }),
            Pipe::Composite(c) => Pipe::Composite(c.clone()),
        }
    }
}

impl<T: Payload> Pipe<T> {
    pub fn role(&self) -> Role {
        match self {
            Pipe::Producer(_) => Role::Producer,
            Pipe::Filter(_) => Role::Filter,
            Pipe::Consumer(_) => Role::Consumer,
            Pipe::Hub(_) => Role::Hub,
            Pipe::Composite(c) => c.role,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Pipe::Producer(p) => p.core.life.id,
            Pipe::Filter(f) => f.core.life.id,
            Pipe::Consumer(c) => c.core.life.id,
            Pipe::Hub(h) => h.core.life.id,
            Pipe::Composite(c) => c.id,
        }
    }

    /// Start the stage and register it with `join`. Internal tasks start on
    /// the first call only; every call registers.
    pub fn run(&self, join: &Ref) {
        match self {
            Pipe::Producer(p) => p.run(join),
            Pipe::Filter(f) => f.run(join),
            Pipe::Consumer(c) => c.run(join),
            Pipe::Hub(h) => h.run(join),
            Pipe::Composite(c) => {
                c.left.run(join);
                c.right.run(join);
            }
        }
    }

    /// No further endpoints will be attached; drain and finish.
    pub fn notify_exit(&self) {
        match self {
            Pipe::Producer(p) => p.notify_exit(),
            Pipe::Filter(f) => f.notify_exit(),
            Pipe::Consumer(c) => c.notify_exit(),
            Pipe::Hub(h) => h.notify_exit(),
            Pipe::Composite(c) => {
                c.left.notify_exit();
                c.right.notify_exit();
            }
        }
    }

    pub fn add_sink(&self, sink: Valve<T>) -> Result<()> {
        match self {
            Pipe::Producer(p) => p.add_sink(sink),
            Pipe::Filter(f) => f.add_sink(sink),
            Pipe::Hub(h) => h.add_sink(sink),
            Pipe::Composite(c) if c.role.emits() => return c.sink_end().add_sink(sink),
            _ => return Err(self.lacks("add_sink")),
        }
        Ok(())
    }

    pub fn new_source(&self) -> Result<Valve<T>> {
        match self {
            Pipe::Filter(f) => Ok(f.new_source()),
            Pipe::Consumer(c) => Ok(c.new_source()),
            Pipe::Hub(h) => Ok(h.new_source()),
            Pipe::Composite(c) if c.role.accepts() => c.source_end().new_source(),
            _ => Err(self.lacks("new_source")),
        }
    }

    /// Wait for the stage's result. `Ok(None)` means it settled without a
    /// value.
    pub fn result(&self) -> BoxFuture<'_, Result<Option<T>>> {
        Box::pin(async move {
            match self {
                Pipe::Consumer(c) => Ok(c.result().await),
                Pipe::Hub(h) => Ok(h.result().await),
                Pipe::Composite(c) if c.role.resolves() => c.result_end().result().await,
                _ => Err(self.lacks("result")),
            }
        })
    }

    fn lacks(&self, op: &'static str) -> PipeError {
        PipeError::Unsupported {
            op,
            role: self.role(),
        }
    }
}

impl<T: Payload> Counted for Pipe<T> {
    fn refs(&self) -> &Ref {
        match self {
            Pipe::Producer(p) => &p.core.life.refs,
            Pipe::Filter(f) => &f.core.life.refs,
            Pipe::Consumer(c) => &c.core.life.refs,
            Pipe::Hub(h) => &h.core.life.refs,
            Pipe::Composite(c) => &c.refs,
        }
    }
}

impl<T: Payload> fmt::Debug for Pipe<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipe")
            .field("role", &self.role())
            .field("id", &self.id())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// A pipe plus one unit of interest in it.
///
/// Cloning takes another lease; dropping releases it. When the last lease on
/// a primitive stage goes away the stage is told to exit.
pub struct Handle<T> {
    pipe: Pipe<T>,
    lease: Option<Lease>,
}

impl<T: Payload> Handle<T> {
    /// Take a new lease on `pipe`.
    pub fn new(pipe: Pipe<T>) -> Self {
        let lease = Some(pipe.lease());
        Self { pipe, lease }
    }

    pub(crate) fn with_lease(pipe: Pipe<T>, lease: Lease) -> Self {
        Self {
            pipe,
            lease: Some(lease),
        }
    }

    /// Another handle to the same pipe that holds no lease.
    pub fn uncounted(&self) -> Self {
        Self {
            pipe: self.pipe.clone(),
            lease: None,
        }
    }

    /// Drop this handle's lease but keep the handle usable.
    pub fn release(&mut self) {
        self.lease = None;
    }

    pub fn is_counted(&self) -> bool {
        self.lease.is_some()
    }

    pub fn pipe(&self) -> &Pipe<T> {
        &self.pipe
    }

    pub fn same_stage(&self, other: &Handle<T>) -> bool {
        self.pipe.refs().same(other.pipe.refs())
    }
}

impl<T: Payload> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Handle::new(self.pipe.clone())
    }
}

impl<T: Payload> Deref for Handle<T> {
    type Target = Pipe<T>;

    fn deref(&self) -> &Pipe<T> {
        &self.pipe
    }
}

impl<T: Payload> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("role", &self.pipe.role())
            .field("id", &self.pipe.id())
            .field("counted", &self.is_counted())
            .finish()
    }
}
