//! Consumer: merges its sources into one sequence and folds it with a user
//! reducer. The reducer's return value is the stage's result.

use std::future::Future;
use std::sync::{Arc, Mutex};

use futures_core::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::pipe::{Handle, Pipe};
use crate::refcount::Ref;
use crate::stage::{exit_notified, lock, Intake, Lifecycle, Payload};
use crate::valve::{Frame, Valve};

type Reducer<T> = Box<dyn FnOnce(mpsc::Receiver<T>) -> BoxFuture<'static, T> + Send>;

/// `None` until the reducer settles; `Some(None)` if it failed.
type Settled<T> = Option<Option<T>>;

pub(crate) struct ConsumerCore<T> {
    pub life: Lifecycle,
    reducer: Mutex<Option<Reducer<T>>>,
    intake: Intake<T>,
    result: watch::Sender<Settled<T>>,
}

#[derive(Clone)]
pub struct Consumer<T> {
    pub(crate) core: Arc<ConsumerCore<T>>,
}

impl<T: Payload> Consumer<T> {
    /// The reducer reads the merged input until the channel ends. It may
    /// return early, in which case the inbound valve closes and writers
    /// evict it.
    pub fn new<F, Fut>(reducer: F) -> Handle<T>
    where
        F: FnOnce(mpsc::Receiver<T>) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (life, lease) = Lifecycle::new("consumer");
        let reducer: Reducer<T> =
            Box::new(move |rx: mpsc::Receiver<T>| -> BoxFuture<'static, T> {
                Box::pin(reducer(rx))
            });
        let (result, _) = watch::channel(None);
        let core = Arc::new(ConsumerCore {
            life,
            reducer: Mutex::new(Some(reducer)),
            intake: Intake::new(),
            result,
        });
        core.life.monitor();
        Handle::with_lease(Pipe::Consumer(Consumer { core }), lease)
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
            if let Some(reducer) = lock(&core.reducer).take() {
                let (tx, rx) = mpsc::channel(1);
                let reducing = tokio::spawn(reducer(rx));
                let task = core.life.task();
                let core = self.core.clone();
                tokio::spawn(async move {
                    let settled = merge(&core, tx, reducing).await;
                    core.result.send_replace(Some(settled));
                    drop(task);
                });
            }
        }
        core.life.join(join);
    }

    /// Wait for the reducer's value. `None` if the reducer failed.
    pub async fn result(&self) -> Option<T> {
        let mut rx = self.core.result.subscribe();
        let settled = match rx.wait_for(|settled| settled.is_some()).await {
            Ok(settled) => settled.clone().flatten(),
            Err(_) => None,
        };
        settled
    }
}

/// Feed the reducer until every source has ended after exit, then wait for
/// its value. Ends early if the reducer returns first.
async fn merge<T: Payload>(
    core: &ConsumerCore<T>,
    tx: mpsc::Sender<T>,
    mut reducing: JoinHandle<T>,
) -> Option<T> {
    let id = core.life.id;
    let frames = core.intake.reader().rchan();
    let mut exit = core.life.exit_signal();
    let mut exitable = false;
    let mut tx = Some(tx);

    let joined = 'merge: loop {
        tokio::select! {
            biased;
            joined = &mut reducing => break joined,
            _ = exit_notified(&mut exit), if !exitable => {
                exitable = true;
                if core.intake.settle() {
                    tracing::debug!(stage = %id, "No sources at exit, closing reducer input");
                    tx = None;
                }
            }
            frame = frames.recv(), if tx.is_some() => match frame {
                Some(Frame::Eof) => {
                    if core.intake.source_ended(exitable) {
                        tracing::debug!(stage = %id, "Last source ended, closing reducer input");
                        tx = None;
                    }
                }
                Some(Frame::Item(value)) => {
                    if let Some(sender) = &tx {
                        tokio::select! {
                            biased;
                            joined = &mut reducing => break 'merge joined,
                            sent = sender.send(value) => if sent.is_err() {
                                tx = None;
                            }
                        }
                    }
                }
                None => tx = None,
            },
        }
    };

    core.intake.finish();
    match joined {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::error!(stage = %id, error = %err, "Consumer reducer failed");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn summer() -> Handle<i64> {
        Consumer::new(|mut rx: mpsc::Receiver<i64>| async move {
            let mut total = 0;
            while let Some(v) = rx.recv().await {
                total += v;
            }
            total
        })
    }

    async fn write_all(valve: Valve<i64>, values: Vec<i64>) {
        for v in values {
            if !valve.send(v).await {
                return;
            }
        }
        valve.send_eof().await;
    }

    #[tokio::test]
    async fn folds_every_source_into_one_result() {
        let consumer = summer();
        let a = consumer.new_source().unwrap();
        let b = consumer.new_source().unwrap();
        let join = Ref::new();
        consumer.run(&join);
        consumer.notify_exit();

        tokio::spawn(write_all(a, vec![1, 2]));
        tokio::spawn(write_all(b, vec![3]));
        join.wait().await;
        assert_eq!(consumer.result().await.unwrap(), Some(6));
    }

    #[tokio::test]
    async fn no_sources_at_exit_yields_empty_fold() {
        let consumer = summer();
        let join = Ref::new();
        consumer.run(&join);
        let probe = consumer.uncounted();
        drop(consumer);

        tokio::time::timeout(Duration::from_secs(1), join.wait())
            .await
            .expect("consumer with no sources should finish once released");
        assert_eq!(probe.result().await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn early_return_closes_inbound_valve() {
        let consumer = Consumer::new(|mut rx: mpsc::Receiver<i64>| async move {
            rx.recv().await.unwrap_or_default()
        });
        let input = consumer.new_source().unwrap();
        let join = Ref::new();
        consumer.run(&join);

        assert!(input.send(9).await);
        join.wait().await;
        assert_eq!(consumer.result().await.unwrap(), Some(9));
        assert!(!input.send(10).await, "reader valve should be closed");
        let late = consumer.new_source().unwrap();
        assert!(late.is_closed());
    }

    #[tokio::test]
    async fn panicking_reducer_settles_without_value() {
        let consumer = Consumer::new(|_rx: mpsc::Receiver<i64>| async move {
            let missing: Option<i64> = None;
            missing.expect("reducer exploded")
        });
        let join = Ref::new();
        consumer.run(&join);
        consumer.notify_exit();
        join.wait().await;
        assert_eq!(consumer.result().await.unwrap(), None);
    }
}
