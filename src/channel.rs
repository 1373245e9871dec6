use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Waker};

use futures_util::future::poll_fn;

use crate::config::Watermarks;

/// Simple mpsc channel with low/high watermark backpressure.
///
/// The sending side reports not-ready once the queue length reaches the
/// high watermark, and becomes ready again only after the consumer has
/// drained it below the low watermark. `send()` itself never blocks; a
/// producer that wants backpressure awaits `ready()` (or `send_when_ready()`)
/// between sends.
pub(crate) struct Receiver<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        let mut lock = self.inner.lock().unwrap();

        lock.wake_all();
    }
}

pub(crate) fn channel<T>(watermarks: Watermarks) -> (Sender<T>, Receiver<T>) {
    let inner = Arc::new(Mutex::new(Inner::new(watermarks)));

    let weak = Arc::downgrade(&inner);

    (Sender { inner: weak }, Receiver { inner })
}

impl<T> Receiver<T> {
    pub fn poll_recv(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<T>> {
        let this = self.get_mut();

        let mut lock = this.inner.lock().unwrap();

        match lock.poll_dequeue(cx) {
            Poll::Pending => {
                if Arc::weak_count(&this.inner) == 0 {
                    // no more senders around
                    None.into()
                } else {
                    Poll::Pending
                }
            }

            r => r,
        }
    }

    pub async fn recv(&mut self) -> Option<T> {
        poll_fn(|cx| Pin::new(&mut *self).poll_recv(cx)).await
    }
}

pub(crate) struct Sender<T> {
    inner: Weak<Mutex<Inner<T>>>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Sender {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Sender<T> {
    pub fn poll_ready(self: Pin<&Self>, cx: &mut Context) -> Poll<bool> {
        let this = self.get_ref();

        if let Some(inner) = this.inner.upgrade() {
            let mut lock = inner.lock().unwrap();
            lock.poll_ready(cx)
        } else {
            false.into()
        }
    }

    /// Wait until the queue is below the watermarks (or the receiver is
    /// gone). Returns false when the receiver is gone.
    pub async fn ready(&self) -> bool {
        poll_fn(|cx| Pin::new(&*self).poll_ready(cx)).await
    }

    /// Enqueue without waiting. Returns false when the receiver is gone.
    pub fn send(&self, t: T) -> bool {
        if let Some(inner) = self.inner.upgrade() {
            let mut lock = inner.lock().unwrap();

            lock.enqueue(t);

            true
        } else {
            false
        }
    }

    /// Apply backpressure, then enqueue. Returns false when the receiver
    /// is gone.
    pub async fn send_when_ready(&self, t: T) -> bool {
        if !self.ready().await {
            return false;
        }
        self.send(t)
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let c = Arc::weak_count(&inner);

            if c == 1 {
                // no more senders to wake receiver
                let mut lock = inner.lock().unwrap();
                lock.wake_all()
            }
        }
    }
}

struct Inner<T> {
    queue: VecDeque<T>,
    watermarks: Watermarks,
    /// Set when the queue filled up to the high watermark; cleared only
    /// once the consumer drains it below the low watermark.
    paused: bool,
    // We could have separate send and receive wakers. I feel like
    // that creates potential race conditions. In 99.9% of cases
    // there will only be one receiver and one sender anyway.
    wakers: Vec<Waker>,
}

impl<T> Inner<T> {
    fn new(watermarks: Watermarks) -> Self {
        Inner {
            queue: VecDeque::new(),
            watermarks,
            paused: false,
            wakers: Vec::new(),
        }
    }

    fn poll_ready(&mut self, cx: &mut Context) -> Poll<bool> {
        if self.queue.len() >= self.watermarks.high {
            self.paused = true;
        }

        if self.paused {
            self.wakers.push(cx.waker().clone());
            Poll::Pending
        } else {
            true.into()
        }
    }

    fn enqueue(&mut self, t: T) {
        self.queue.push_back(t);
        self.wake_all();
    }

    fn poll_dequeue(&mut self, cx: &mut Context) -> Poll<Option<T>> {
        if let Some(t) = self.queue.pop_front() {
            if self.paused && self.queue.len() < self.watermarks.low {
                self.paused = false;
            }
            self.wake_all();
            Some(t).into()
        } else {
            // draining to empty always resumes the producer.
            self.paused = false;
            self.wakers.push(cx.waker().clone());
            Poll::Pending
        }
    }

    fn wake_all(&mut self) {
        for w in self.wakers.drain(..) {
            w.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;

    fn marks(low: usize, high: usize) -> Watermarks {
        Watermarks { low, high }
    }

    fn poll_once<F: Future + Unpin>(fut: &mut F) -> Poll<F::Output> {
        let waker = std::task::Waker::noop();
        let mut cx = Context::from_waker(waker);
        Pin::new(fut).poll(&mut cx)
    }

    #[tokio::test]
    async fn send_and_recv_in_order() {
        let (tx, mut rx) = channel(marks(2, 10));

        assert!(tx.send(1));
        assert!(tx.send(2));
        assert!(tx.send(3));

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(3));
    }

    #[tokio::test]
    async fn recv_none_after_all_senders_dropped() {
        let (tx, mut rx) = channel(marks(2, 10));

        assert!(tx.send(7));
        drop(tx);

        assert_eq!(rx.recv().await, Some(7));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn send_fails_after_receiver_dropped() {
        let (tx, rx) = channel(marks(2, 10));
        drop(rx);

        assert!(!tx.send(1));
        assert!(!tx.send_when_ready(2).await);
    }

    #[tokio::test]
    async fn producer_pauses_at_high_and_resumes_below_low() {
        let (tx, mut rx) = channel(marks(2, 4));

        for i in 0..4 {
            assert!(tx.send_when_ready(i).await);
        }

        // queue is at the high watermark now, ready() must stall.
        let mut fut = Box::pin(tx.ready());
        assert!(poll_once(&mut fut).is_pending());

        // one dequeue leaves 3 elements, still >= low, still paused.
        assert_eq!(rx.recv().await, Some(0));
        let mut fut = Box::pin(tx.ready());
        assert!(poll_once(&mut fut).is_pending());

        // dropping below low resumes the producer.
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        let mut fut = Box::pin(tx.ready());
        assert_eq!(poll_once(&mut fut), Poll::Ready(true));
    }

    #[tokio::test]
    async fn cloned_senders_keep_channel_open() {
        let (tx, mut rx) = channel(marks(2, 10));
        let tx2 = tx.clone();

        drop(tx);
        assert!(tx2.send(42));
        assert_eq!(rx.recv().await, Some(42));

        drop(tx2);
        assert_eq!(rx.recv().await, None);
    }
}
