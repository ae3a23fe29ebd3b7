//! Filter: merges its sources, runs a user transform over the merged
//! sequence, and fans the transform's output out to its sinks.

use std::future::Future;
use std::sync::{Arc, Mutex};

use futures_core::future::BoxFuture;
use tokio::sync::{mpsc, watch};

use crate::pipe::{Handle, Pipe};
use crate::refcount::Ref;
use crate::stage::{exit_notified, fan_out, lock, Intake, Lifecycle, Outlet, Payload};
use crate::valve::{Frame, Valve};

type Transform<T> = Box<dyn FnOnce(mpsc::Receiver<T>, Valve<T>) -> BoxFuture<'static, ()> + Send>;

pub(crate) struct FilterCore<T> {
    pub life: Lifecycle,
    transform: Mutex<Option<Transform<T>>>,
    intake: Intake<T>,
    outlet: Outlet<T>,
}

#[derive(Clone)]
pub struct Filter<T> {
    pub(crate) core: Arc<FilterCore<T>>,
}

impl<T: Payload> Filter<T> {
    /// The transform reads merged input until the channel ends and writes
    /// results to the output valve; a failed write means nobody is listening.
    pub fn new<F, Fut>(transform: F) -> Handle<T>
    where
        F: FnOnce(mpsc::Receiver<T>, Valve<T>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (life, lease) = Lifecycle::new("filter");
        let transform: Transform<T> =
            Box::new(move |rx: mpsc::Receiver<T>, out: Valve<T>| -> BoxFuture<'static, ()> {
                Box::pin(transform(rx, out))
            });
        let core = Arc::new(FilterCore {
            life,
            transform: Mutex::new(Some(transform)),
            intake: Intake::new(),
            outlet: Outlet::new(),
        });
        core.life.monitor();
        Handle::with_lease(Pipe::Filter(Filter { core }), lease)
    }

    pub fn add_sink(&self, sink: Valve<T>) {
        self.core.outlet.add_sink(sink);
    }

    pub fn new_source(&self) -> Valve<T> {
        self.core.intake.new_source()
    }

    pub fn notify_exit(&self) {
        self.core.life.notify_exit();
    }

    pub fn run(&self, join: &Ref) {
        let core = &self.core;
        if core.life.start() {
            if let Some(transform) = lock(&core.transform).take() {
                self.spawn_tasks(transform);
            }
        }
        core.life.join(join);
    }

    fn spawn_tasks(&self, transform: Transform<T>) {
        let (tx, rx) = mpsc::channel(1);
        let output = Valve::new();
        let (ended_tx, ended) = watch::channel(false);

        // transform
        let task = self.core.life.task();
        let id = self.core.life.id;
        let out = output.clone();
        let running = tokio::spawn(transform(rx, out.clone()));
        tokio::spawn(async move {
            if let Err(err) = running.await {
                tracing::error!(stage = %id, error = %err, "Filter transform failed");
            }
            out.close();
            let _ = ended_tx.send(true);
            drop(task);
        });

        // read half
        let task = self.core.life.task();
        let core = self.core.clone();
        tokio::spawn(async move {
            merge(&core, tx, ended).await;
            drop(task);
        });

        // write half
        let task = self.core.life.task();
        let core = self.core.clone();
        tokio::spawn(async move {
            let input = output.rchan();
            fan_out(
                core.life.id,
                &core.outlet,
                input,
                Some(output),
                core.life.exit_signal(),
            )
            .await;
            drop(task);
        });
    }
}

/// Forward every value from the reader valve to the transform until all
/// sources have ended after exit, or the transform stops.
async fn merge<T: Payload>(
    core: &FilterCore<T>,
    tx: mpsc::Sender<T>,
    mut ended: watch::Receiver<bool>,
) {
    let frames = core.intake.reader().rchan();
    let mut exit = core.life.exit_signal();
    let mut exitable = false;
    let mut halted = ended.clone();

    'merge: loop {
        tokio::select! {
            biased;
            _ = exit_notified(&mut ended) => break,
            _ = exit_notified(&mut exit), if !exitable => {
                exitable = true;
                if core.intake.settle() {
                    break;
                }
            }
            frame = frames.recv() => match frame {
                Some(Frame::Eof) => {
                    if core.intake.source_ended(exitable) {
                        break;
                    }
                }
                Some(Frame::Item(value)) => {
                    tokio::select! {
                        biased;
                        _ = exit_notified(&mut halted) => break 'merge,
                        sent = tx.send(value) => if sent.is_err() {
                            break 'merge;
                        }
                    }
                }
                None => break,
            },
        }
    }

    tracing::debug!(stage = %core.life.id, "Filter input drained");
    core.intake.finish();
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
