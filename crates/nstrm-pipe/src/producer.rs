//! Producer: broadcasts the values of one origin valve to every sink.

use std::sync::Arc;

use crate::pipe::{Handle, Pipe};
use crate::refcount::Ref;
use crate::stage::{fan_out, Lifecycle, Outlet, Payload};
use crate::valve::Valve;

pub(crate) struct ProducerCore<T> {
    pub life: Lifecycle,
    origin: Valve<T>,
    outlet: Outlet<T>,
}

#[derive(Clone)]
pub struct Producer<T> {
    pub(crate) core: Arc<ProducerCore<T>>,
}

impl<T: Payload> Producer<T> {
    /// Wrap `origin`. Whoever writes to the origin closes it to end the stream.
    pub fn new(origin: Valve<T>) -> Handle<T> {
        let (life, lease) = Lifecycle::new("producer");
        let core = Arc::new(ProducerCore {
            life,
            origin,
            outlet: Outlet::new(),
        });
        core.life.monitor();
        Handle::with_lease(Pipe::Producer(Producer { core }), lease)
    }

    pub fn add_sink(&self, sink: Valve<T>) {
        self.core.outlet.add_sink(sink);
    }

    pub fn run(&self, join: &Ref) {
        let core = &self.core;
        if core.life.start() {
            let task = core.life.task();
            let core = self.core.clone();
            tokio::spawn(async move {
                let input = core.origin.rchan();
                fan_out(
                    core.life.id,
                    &core.outlet,
                    input,
                    Some(core.origin.clone()),
                    core.life.exit_signal(),
                )
                .await;
                drop(task);
            });
        }
        core.life.join(join);
    }

    pub fn notify_exit(&self) {
        self.core.life.notify_exit();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::valve::Frame;
    use std::time::Duration;

    fn feed(values: Vec<i32>) -> Valve<i32> {
        let origin = Valve::new();
        let writer = origin.clone();
        tokio::spawn(async move {
            for v in values {
                if !writer.send(v).await {
                    return;
                }
            }
            writer.close();
        });
        origin
    }

    async fn drain(sink: Valve<i32>) -> Vec<i32> {
        let mut got = Vec::new();
        while let Some(frame) = sink.receive().await {
            match frame {
                Frame::Item(v) => got.push(v),
                Frame::Eof => break,
            }
        }
        got
    }

    #[tokio::test]
    async fn broadcasts_to_every_sink_then_eof() {
        let producer = Producer::new(feed(vec![1, 2, 3]));
        let (a, b) = (Valve::new(), Valve::new());
        producer.add_sink(a.clone()).unwrap();
        producer.add_sink(b.clone()).unwrap();

        let join = Ref::new();
        producer.run(&join);
        drop(producer);

        let (got_a, got_b) = tokio::join!(drain(a), drain(b));
        assert_eq!(got_a, vec![1, 2, 3]);
        assert_eq!(got_b, vec![1, 2, 3]);
        tokio::time::timeout(Duration::from_secs(1), join.wait())
            .await
            .expect("producer should finish");
    }

    #[tokio::test]
    async fn exit_without_sinks_closes_origin() {
        let origin = Valve::new();
        let producer = Producer::new(origin.clone());
        let join = Ref::new();
        producer.run(&join);
        drop(producer);

        tokio::time::timeout(Duration::from_secs(1), join.wait())
            .await
            .expect("producer with no sinks should stop after exit");
        assert!(origin.is_closed());
        assert!(!origin.send(1).await);
    }

    #[tokio::test]
    async fn late_sink_after_end_gets_eof() {
        let producer = Producer::new(feed(vec![]));
        let join = Ref::new();
        producer.run(&join);
        producer.notify_exit();
        join.wait().await;

        let late = Valve::new();
        producer.add_sink(late.clone()).unwrap();
        assert_eq!(late.receive().await, Some(Frame::Eof));
    }

    #[tokio::test]
    async fn run_twice_starts_once_but_joins_both() {
        let producer = Producer::new(feed(vec![5]));
        let sink = Valve::new();
        producer.add_sink(sink.clone()).unwrap();

        let join = Ref::new();
        producer.run(&join);
        producer.run(&join);
        assert_eq!(join.count(), 2);
        drop(producer);

        assert_eq!(drain(sink).await, vec![5]);
        join.wait().await;
    }
}
