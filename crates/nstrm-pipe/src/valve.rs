//! Synchronous, closable, single-value hand-off transport.
//!
//! A send completes only when a receiver has taken the frame, so a stage can
//! never run ahead of its downstream. Closing is a one-way broadcast: every
//! pending and future send fails, every pending and future receive ends.

use std::sync::{Arc, OnceLock};

use tokio::sync::{mpsc, oneshot, watch, Mutex};

/// One unit on the wire: a value, or the end-of-stream marker.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame<T> {
    Item(T),
    Eof,
}

struct Offer<T> {
    frame: Frame<T>,
    ack: oneshot::Sender<()>,
}

struct ValveInner<T> {
    tx: mpsc::Sender<Offer<T>>,
    rx: Mutex<mpsc::Receiver<Offer<T>>>,
    closed: watch::Sender<bool>,
    frames: OnceLock<Frames<T>>,
}

/// Cloning a `Valve` yields another handle to the same transport.
pub struct Valve<T> {
    inner: Arc<ValveInner<T>>,
}

impl<T> Clone for Valve<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Valve<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(ValveInner {
                tx,
                rx: Mutex::new(rx),
                closed,
                frames: OnceLock::new(),
            }),
        }
    }

    /// A valve that is closed from the start. Sends fail and receives end
    /// immediately; used as the output of calls made outside any pipeline.
    pub fn closed() -> Self {
        let valve = Self::new();
        valve.close();
        valve
    }

    /// Hand `value` to a receiver. Returns `false` if the valve closed first.
    pub async fn send(&self, value: T) -> bool {
        self.offer(Frame::Item(value)).await
    }

    /// Hand the end-of-stream marker to a receiver.
    pub async fn send_eof(&self) -> bool {
        self.offer(Frame::Eof).await
    }

    async fn offer(&self, frame: Frame<T>) -> bool {
        let mut closed = self.inner.closed.subscribe();
        if *closed.borrow() {
            return false;
        }
        let (ack, mut acked) = oneshot::channel();

        tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => return false,
            sent = self.inner.tx.send(Offer { frame, ack }) => {
                if sent.is_err() {
                    return false;
                }
            }
        }

        tokio::select! {
            biased;
            taken = &mut acked => taken.is_ok(),
            // A receiver that acked just before the close still counts.
            _ = closed.wait_for(|c| *c) => acked.try_recv().is_ok(),
        }
    }

    /// Wait for the next frame. `None` means the valve is closed.
    pub async fn receive(&self) -> Option<Frame<T>> {
        let mut closed = self.inner.closed.subscribe();
        let mut rx = tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => return None,
            guard = self.inner.rx.lock() => guard,
        };
        loop {
            tokio::select! {
                biased;
                _ = closed.wait_for(|c| *c) => return None,
                offer = rx.recv() => {
                    let offer = offer?;
                    // The sender gave up after a close; the frame was never delivered.
                    if offer.ack.send(()).is_ok() {
                        return Some(offer.frame);
                    }
                }
            }
        }
    }

    /// Idempotent close.
    pub fn close(&self) {
        self.inner.closed.send_if_modified(|closed| {
            let changed = !*closed;
            *closed = true;
            changed
        });
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Read end of the valve's forwarding task, started on first use.
    /// Every call shares the same task; the frames end when the valve
    /// closes.
    pub fn rchan(&self) -> Frames<T> {
        self.inner
            .frames
            .get_or_init(|| {
                let (tx, rx) = mpsc::channel(1);
                let valve = self.clone();
                tokio::spawn(async move {
                    while let Some(frame) = valve.receive().await {
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                });
                Frames {
                    rx: Arc::new(Mutex::new(rx)),
                }
            })
            .clone()
    }

    /// True when both handles refer to one transport.
    pub fn same(&self, other: &Valve<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Buffered frames forwarded from a valve. Clones share one reader.
pub struct Frames<T> {
    rx: Arc<Mutex<mpsc::Receiver<Frame<T>>>>,
}

impl<T> Clone for Frames<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<T: Send> Frames<T> {
    /// Next frame, or `None` once the valve has closed and the buffer is
    /// drained.
    pub async fn recv(&self) -> Option<Frame<T>> {
        self.rx.lock().await.recv().await
    }
}

impl<T: Send + 'static> Default for Valve<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Valve<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Valve")
            .field("closed", &*self.inner.closed.borrow())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn send_completes_when_received() {
        let valve = Valve::new();
        let sender = {
            let valve = valve.clone();
            tokio::spawn(async move { valve.send(7).await })
        };
        assert_eq!(valve.receive().await, Some(Frame::Item(7)));
        assert!(sender.await.unwrap());
    }

    #[tokio::test]
    async fn send_blocks_without_receiver() {
        let valve: Valve<i32> = Valve::new();
        let pending = tokio::time::timeout(Duration::from_millis(50), valve.send(1)).await;
        assert!(pending.is_err(), "rendezvous send must wait for a receiver");
    }

    #[tokio::test]
    async fn close_fails_pending_send() {
        let valve = Valve::new();
        let sender = {
            let valve = valve.clone();
            tokio::spawn(async move { valve.send(1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        valve.close();
        assert!(!sender.await.unwrap());
        assert_eq!(valve.receive().await, None);
    }

    #[tokio::test]
    async fn after_close_send_fails_and_receive_ends() {
        let valve = Valve::new();
        valve.close();
        valve.close();
        assert!(valve.is_closed());
        assert!(!valve.send(3).await);
        assert!(!valve.send_eof().await);
        assert_eq!(valve.receive().await, None);
    }

    #[tokio::test]
    async fn closed_valve_never_delivers() {
        let valve: Valve<&str> = Valve::closed();
        assert!(!valve.send("x").await);
        assert_eq!(valve.receive().await, None);
        let rx = valve.rchan();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn each_send_is_received_exactly_once_in_order() {
        let valve = Valve::new();
        let sender = {
            let valve = valve.clone();
            tokio::spawn(async move {
                for i in 0..5 {
                    assert!(valve.send(i).await);
                }
                assert!(valve.send_eof().await);
                valve.close();
            })
        };

        let rx = valve.rchan();
        let mut got = Vec::new();
        while let Some(frame) = rx.recv().await {
            match frame {
                Frame::Item(v) => got.push(v),
                Frame::Eof => break,
            }
        }
        sender.await.unwrap();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn rchan_shares_one_forwarding_task() {
        let valve = Valve::new();
        let first = valve.rchan();
        let second = valve.rchan();
        let sender = {
            let valve = valve.clone();
            tokio::spawn(async move {
                assert!(valve.send(1).await);
                assert!(valve.send(2).await);
                valve.close();
            })
        };

        assert_eq!(first.recv().await, Some(Frame::Item(1)));
        assert_eq!(second.recv().await, Some(Frame::Item(2)));
        sender.await.unwrap();
        assert_eq!(first.recv().await, None);
        assert_eq!(second.recv().await, None);
    }
}
