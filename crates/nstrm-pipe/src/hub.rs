//! Channel hub: an unbounded many-to-many relay.
//!
//! Every source feeds one buffer; every buffered value is rebroadcast to the
//! sinks registered at the time. The hub does not hold its caller's join
//! counter, so a pipeline ending in a hub does not keep a scope alive.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::pipe::{Handle, Pipe};
use crate::refcount::Ref;
use crate::stage::{exit_notified, fan_out, Intake, Lifecycle, Outlet, Payload};
use crate::valve::{Frame, Valve};

pub(crate) struct HubCore<T> {
    pub life: Lifecycle,
    intake: Intake<T>,
    outlet: Outlet<T>,
}

#[derive(Clone)]
pub struct Hub<T> {
    pub(crate) core: Arc<HubCore<T>>,
}

impl<T: Payload> Hub<T> {
    pub fn new() -> Handle<T> {
        let (life, lease) = Lifecycle::new("hub");
        let core = Arc::new(HubCore {
            life,
            intake: Intake::new(),
            outlet: Outlet::new(),
        });
        core.life.monitor();
        Handle::with_lease(Pipe::Hub(Hub { core }), lease)
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

    /// Start relaying. The join counter is deliberately left alone.
    pub fn run(&self, _join: &Ref) {
        if !self.core.life.start() {
            return;
        }
        let (buffer_tx, buffer_rx) = mpsc::unbounded_channel();

        let task = self.core.life.task();
        let core = self.core.clone();
        tokio::spawn(async move {
            intake(&core, buffer_tx).await;
            drop(task);
        });

        let task = self.core.life.task();
        let core = self.core.clone();
        tokio::spawn(async move {
            fan_out(
                core.life.id,
                &core.outlet,
                buffer_rx,
                None,
                core.life.exit_signal(),
            )
            .await;
            drop(task);
        });
    }

    /// Resolves once nobody holds the hub and its relay has stopped.
    pub async fn result(&self) -> Option<T> {
        self.core.life.refs.wait().await;
        if self.core.life.is_started() {
            self.core.life.done().await;
        }
        None
    }
}

/// Buffer everything the sources send. Ends once exit has been notified and
/// no source remains, or when the relay side is gone.
async fn intake<T: Payload>(core: &HubCore<T>, buffer: mpsc::UnboundedSender<T>) {
    let frames = core.intake.reader().rchan();
    let mut exit = core.life.exit_signal();
    let mut exitable = false;

    loop {
        tokio::select! {
            biased;
            _ = exit_notified(&mut exit), if !exitable => {
                exitable = true;
                if core.intake.settle() {
                    break;
                }
            }
            _ = buffer.closed() => break,
            frame = frames.recv() => match frame {
                Some(Frame::Item(value)) => {
                    if buffer.send(value).is_err() {
                        break;
                    }
                }
                Some(Frame::Eof) => {
                    if core.intake.source_ended(exitable) {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    tracing::debug!(stage = %core.life.id, "Hub intake closed");
    core.intake.finish();
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn buffers_until_a_sink_arrives() {
        let hub = Hub::new();
        let input = hub.new_source().unwrap();
        hub.run(&Ref::new());

        for v in ["a", "b", "c"] {
            assert!(input.send(v).await, "hub intake never blocks on sinks");
        }
        input.send_eof().await;

        let sink = Valve::new();
        hub.add_sink(sink.clone()).unwrap();
        drop(hub);

        let mut got = Vec::new();
        while let Some(Frame::Item(v)) = sink.receive().await {
            got.push(v);
        }
        assert_eq!(got, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn run_does_not_hold_the_join_counter() {
        let hub: Handle<i32> = Hub::new();
        let join = Ref::new();
        hub.run(&join);
        assert_eq!(join.count(), 0);
        tokio::time::timeout(Duration::from_millis(100), join.wait())
            .await
            .expect("join should not wait for a hub");
    }

    #[tokio::test]
    async fn result_resolves_after_release() {
        let hub: Handle<i32> = Hub::new();
        hub.run(&Ref::new());
        let probe = hub.uncounted();
        let waiting = tokio::spawn(async move { probe.result().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());
        drop(hub);
        let settled = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .expect("hub result should resolve once released")
            .unwrap();
        assert_eq!(settled.unwrap(), None);
    }
}
