//! Machinery shared by every primitive stage: the run/exit lifecycle, the
//! source intake counter, and the fan-out loop that feeds sinks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::refcount::{Lease, Ref};
use crate::valve::{Frame, Frames, Valve};

/// Bound for anything that flows through a pipeline.
pub trait Payload: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Payload for T {}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Unstarted → Running → Draining → Done bookkeeping for one stage.
///
/// `refs` counts outside interest; a monitor task turns its zero crossing
/// into an exit notification. `tasks` counts the stage's internal tasks and
/// is what callers of `run` join on.
pub(crate) struct Lifecycle {
    pub id: Uuid,
    pub kind: &'static str,
    pub refs: Ref,
    tasks: Ref,
    exit: Arc<watch::Sender<bool>>,
    started: AtomicBool,
}

impl Lifecycle {
    /// Create the lifecycle and the creator's lease on it.
    pub fn new(kind: &'static str) -> (Self, Lease) {
        let (exit, _) = watch::channel(false);
        let life = Self {
            id: Uuid::new_v4(),
            kind,
            refs: Ref::new(),
            tasks: Ref::new(),
            exit: Arc::new(exit),
            started: AtomicBool::new(false),
        };
        let lease = life.refs.lease();
        (life, lease)
    }

    /// Spawn the task that notifies exit once interest drains to zero.
    pub fn monitor(&self) {
        let refs = self.refs.clone();
        let exit = self.exit.clone();
        let (id, kind) = (self.id, self.kind);
        tokio::spawn(async move {
            refs.wait().await;
            if signal_exit(&exit) {
                tracing::debug!(stage = %id, kind, "No interest left, exit notified");
            }
        });
    }

    /// True exactly once: for the caller that moves the stage to Running.
    pub fn start(&self) -> bool {
        let first = self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            tracing::debug!(stage = %self.id, kind = self.kind, "Stage run");
        }
        first
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn notify_exit(&self) {
        if signal_exit(&self.exit) {
            tracing::debug!(stage = %self.id, kind = self.kind, "Exit notified");
        }
    }

    pub fn exit_signal(&self) -> watch::Receiver<bool> {
        self.exit.subscribe()
    }

    /// Lease for one internal task; the stage is Done when all are dropped.
    pub fn task(&self) -> Lease {
        self.tasks.lease()
    }

    /// Hold `join` until every internal task has finished.
    pub fn join(&self, join: &Ref) {
        let ticket = join.lease();
        let tasks = self.tasks.clone();
        let (id, kind) = (self.id, self.kind);
        tokio::spawn(async move {
            tasks.wait().await;
            tracing::debug!(stage = %id, kind, "Stage done");
            drop(ticket);
        });
    }

    pub async fn done(&self) {
        self.tasks.wait().await
    }
}

fn signal_exit(exit: &watch::Sender<bool>) -> bool {
    exit.send_if_modified(|flag| {
        let changed = !*flag;
        *flag = true;
        changed
    })
}

/// Resolves once the flag is raised; used for exit and end signals.
pub(crate) async fn exit_notified(exit: &mut watch::Receiver<bool>) {
    let _ = exit.wait_for(|e| *e).await;
}

// ---------------------------------------------------------------------------
// Intake: counted inbound sources sharing one reader valve
// ---------------------------------------------------------------------------

struct IntakeState {
    sources: usize,
    finished: bool,
}

/// Every source of a stage writes into the same reader valve and ends with
/// one EOF; the count says how many EOFs are still due.
pub(crate) struct Intake<T> {
    reader: Valve<T>,
    state: Mutex<IntakeState>,
}

impl<T: Payload> Intake<T> {
    pub fn new() -> Self {
        Self {
            reader: Valve::new(),
            state: Mutex::new(IntakeState {
                sources: 0,
                finished: false,
            }),
        }
    }

    pub fn reader(&self) -> &Valve<T> {
        &self.reader
    }

    /// Register one more source. After the merge loop has ended the source
    /// gets a closed valve so its writer evicts it on first send.
    pub fn new_source(&self) -> Valve<T> {
        let mut state = lock(&self.state);
        if state.finished {
            return Valve::closed();
        }
        state.sources += 1;
        self.reader.clone()
    }

    /// Record one EOF. Returns true when the intake is now finished.
    pub fn source_ended(&self, exitable: bool) -> bool {
        let mut state = lock(&self.state);
        state.sources = state.sources.saturating_sub(1);
        if exitable && state.sources == 0 {
            state.finished = true;
        }
        state.finished
    }

    /// Called on exit notification. Returns true when no sources remain.
    pub fn settle(&self) -> bool {
        let mut state = lock(&self.state);
        if state.sources == 0 {
            state.finished = true;
        }
        state.finished
    }

    /// Stop accepting sources and close the reader so writers evict it.
    pub fn finish(&self) {
        lock(&self.state).finished = true;
        self.reader.close();
    }
}

// ---------------------------------------------------------------------------
// Outlet: sink registration
// ---------------------------------------------------------------------------

enum OutletState<T> {
    Pending(Vec<Valve<T>>),
    Running(mpsc::UnboundedSender<Valve<T>>),
    Finished,
}

/// Sink list of a stage. Before the fan-out loop starts sinks are collected
/// here; afterwards they are handed to the loop over a channel.
pub(crate) struct Outlet<T> {
    state: Mutex<OutletState<T>>,
}

impl<T: Payload> Outlet<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(OutletState::Pending(Vec::new())),
        }
    }

    pub fn add_sink(&self, sink: Valve<T>) {
        let mut state = lock(&self.state);
        match &mut *state {
            OutletState::Pending(sinks) => sinks.push(sink),
            OutletState::Running(tx) => {
                if let Err(rejected) = tx.send(sink) {
                    close_sink(rejected.0);
                }
            }
            OutletState::Finished => close_sink(sink),
        }
    }

    /// Move to Running and take the sinks registered so far.
    fn open(&self) -> (Vec<Valve<T>>, mpsc::UnboundedReceiver<Valve<T>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = lock(&self.state);
        let sinks = match std::mem::replace(&mut *state, OutletState::Running(tx)) {
            OutletState::Pending(sinks) => sinks,
            _ => Vec::new(),
        };
        (sinks, rx)
    }

    /// Stop accepting sinks; returns any that raced in after the loop ended.
    fn close(&self, late: &mut mpsc::UnboundedReceiver<Valve<T>>) -> Vec<Valve<T>> {
        *lock(&self.state) = OutletState::Finished;
        let mut stragglers = Vec::new();
        while let Ok(sink) = late.try_recv() {
            stragglers.push(sink);
        }
        stragglers
    }
}

/// A sink attached after the stream ended still gets its EOF.
fn close_sink<T: Payload>(sink: Valve<T>) {
    tokio::spawn(async move {
        sink.send_eof().await;
    });
}

// ---------------------------------------------------------------------------
// Fan-out
// ---------------------------------------------------------------------------

/// Source of values for the fan-out loop. `None` ends the stream.
pub(crate) trait Feed<T>: Send {
    fn next(&mut self) -> impl std::future::Future<Output = Option<T>> + Send;
}

impl<T: Payload> Feed<T> for Frames<T> {
    async fn next(&mut self) -> Option<T> {
        match self.recv().await? {
            Frame::Item(v) => Some(v),
            Frame::Eof => None,
        }
    }
}

impl<T: Payload> Feed<T> for mpsc::UnboundedReceiver<T> {
    async fn next(&mut self) -> Option<T> {
        self.recv().await
    }
}

/// Offer `value` to every sink, keeping the ones that accepted it. Gives the
/// value back when no sink took it.
async fn deliver<T: Payload>(sinks: &mut Vec<Valve<T>>, value: T) -> Option<T> {
    let mut kept = Vec::with_capacity(sinks.len());
    for sink in sinks.drain(..) {
        if sink.send(value.clone()).await {
            kept.push(sink);
        }
    }
    *sinks = kept;
    if sinks.is_empty() {
        Some(value)
    } else {
        None
    }
}

/// Broadcast everything from `input` to the outlet's sinks.
///
/// At most one value is pending at a time; while it is pending no further
/// input is read. Sinks whose send fails are evicted. After exit has been
/// notified and no sink remains, `origin` is closed so upstream stops. When
/// the input ends every remaining sink receives EOF.
pub(crate) async fn fan_out<T: Payload>(
    life_id: Uuid,
    outlet: &Outlet<T>,
    mut input: impl Feed<T>,
    origin: Option<Valve<T>>,
    mut exit: watch::Receiver<bool>,
) {
    let (mut sinks, mut late) = outlet.open();
    let mut pending: Option<T> = None;
    let mut exitable = *exit.borrow();

    loop {
        if let Some(value) = pending.take() {
            pending = if sinks.is_empty() {
                Some(value)
            } else {
                deliver(&mut sinks, value).await
            };
        }
        if exitable && sinks.is_empty() {
            tracing::debug!(stage = %life_id, "No sinks left after exit, closing origin");
            if let Some(origin) = &origin {
                origin.close();
            }
            break;
        }
        tokio::select! {
            biased;
            Some(sink) = late.recv() => sinks.push(sink),
            _ = exit_notified(&mut exit), if !exitable => exitable = true,
            next = input.next(), if pending.is_none() => match next {
                Some(value) => pending = Some(value),
                None => break,
            },
            else => break,
        }
    }

    sinks.extend(outlet.close(&mut late));
    tracing::debug!(stage = %life_id, sinks = sinks.len(), "Stream ended, sending EOF");
    for sink in sinks {
        sink.send_eof().await;
    }
}
