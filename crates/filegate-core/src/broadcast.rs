//! One-to-many message fan-out with terminal replay.
//!
//! Every subscriber owns an unbounded channel, so a slow consumer never
//! blocks the publisher and a consumer that goes away is simply pruned on
//! the next publish. The broadcaster remembers the last message; once it is
//! closed, new subscribers receive that message and then end-of-stream.

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Inner<T> {
    subscribers: Vec<mpsc::UnboundedSender<T>>,
    last: Option<T>,
    closed: bool,
}

/// Fans published messages out to every live subscriber, in order.
pub struct Broadcaster<T> {
    inner: Mutex<Inner<T>>,
}

impl<T: Clone> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Broadcaster<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                subscribers: Vec::new(),
                last: None,
                closed: false,
            }),
        }
    }

    /// Publishes `msg` and returns how many subscribers received it.
    ///
    /// Publishing after [`Broadcaster::close`] is ignored.
    pub fn publish(&self, msg: T) -> usize {
        let mut inner = self.inner.lock();
        if inner.closed {
            return 0;
        }
        inner.subscribers.retain(|tx| tx.send(msg.clone()).is_ok());
        inner.last = Some(msg);
        inner.subscribers.len()
    }

    /// Subscribes from this point on.
    ///
    /// After close, the subscription yields the last message (if any) and
    /// then ends.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        if inner.closed {
            if let Some(last) = inner.last.clone() {
                let _ = tx.send(last);
            }
        } else {
            inner.subscribers.push(tx);
        }
        Subscription { rx }
    }

    /// Publishes `msg` as the last message and closes, atomically.
    ///
    /// A subscriber either receives `msg` live or gets it replayed.
    pub fn finish(&self, msg: T) -> usize {
        let mut inner = self.inner.lock();
        if inner.closed {
            return 0;
        }
        inner.subscribers.retain(|tx| tx.send(msg.clone()).is_ok());
        let delivered = inner.subscribers.len();
        inner.last = Some(msg);
        inner.closed = true;
        inner.subscribers.clear();
        delivered
    }

    /// Ends every subscription. Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn last(&self) -> Option<T> {
        self.inner.lock().last.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

/// The receiving half of a [`Broadcaster`] subscription.
///
/// Dropping it deregisters the subscriber.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    /// Next message, or `None` once the broadcaster closed.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Like [`Subscription::recv`] but gives up when `cancel` fires.
    pub async fn recv_or_cancel(&mut self, cancel: &CancellationToken) -> Option<T> {
        tokio::select! {
            msg = self.rx.recv() => msg,
            () = cancel.cancelled() => None,
        }
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}
