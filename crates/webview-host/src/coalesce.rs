//! Latest-wins rate limiter: at most one pending item, at most one timer,
//! flushes spaced by a minimum interval.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

type Handler<T> = Box<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

struct Slot<T> {
    pending: Option<T>,
    timer: Option<JoinHandle<()>>,
    /// The handler is executing; the timer task must not be aborted.
    running: bool,
    last_flush: Option<Instant>,
    closed: bool,
}

struct Inner<T> {
    min_interval: Duration,
    handler: Handler<T>,
    slot: Mutex<Slot<T>>,
}

impl<T> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct Coalescer<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> Coalescer<T> {
    pub fn new<F, Fut>(min_interval: Duration, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                min_interval,
                handler: Box::new(move |item| handler(item).boxed()),
                slot: Mutex::new(Slot {
                    pending: None,
                    timer: None,
                    running: false,
                    last_flush: None,
                    closed: false,
                }),
            }),
        }
    }

    /// Store `item` as the pending one, scheduling a flush if none is
    /// scheduled. Returns true when an older pending item was superseded.
    pub fn offer(&self, item: T) -> bool {
        let mut slot = self.inner.lock();
        if slot.closed {
            return false;
        }
        let superseded = slot.pending.replace(item).is_some();
        if slot.timer.is_none() {
            let delay = slot
                .last_flush
                .map(|at| self.inner.min_interval.saturating_sub(at.elapsed()))
                .unwrap_or(Duration::ZERO);
            slot.timer = Some(tokio::spawn(run_timer(Arc::clone(&self.inner), delay)));
        }
        superseded
    }

    #[cfg(test)]
    pub fn has_pending(&self) -> bool {
        self.inner.lock().pending.is_some()
    }

    #[cfg(test)]
    pub fn last_flush(&self) -> Option<Instant> {
        self.inner.lock().last_flush
    }

    /// Drop the pending item and stop scheduling. A flush already running is
    /// left to finish; nothing is flushed afterwards.
    pub fn cancel(&self) {
        let mut slot = self.inner.lock();
        slot.closed = true;
        slot.pending = None;
        if !slot.running {
            if let Some(timer) = slot.timer.take() {
                timer.abort();
            }
        }
    }
}

impl<T> Drop for Coalescer<T> {
    fn drop(&mut self) {
        let mut slot = self.inner.lock();
        slot.closed = true;
        slot.pending = None;
    }
}

async fn run_timer<T: Send + 'static>(inner: Arc<Inner<T>>, mut delay: Duration) {
    loop {
        if !delay.is_zero() {
            time::sleep(delay).await;
        }

        let item = {
            let mut slot = inner.lock();
            match slot.pending.take() {
                Some(item) if !slot.closed => {
                    slot.running = true;
                    item
                }
                _ => {
                    slot.timer = None;
                    return;
                }
            }
        };

        (inner.handler)(item).await;

        let mut slot = inner.lock();
        slot.running = false;
        slot.last_flush = Some(Instant::now());
        if slot.closed || slot.pending.is_none() {
            slot.timer = None;
            return;
        }
        delay = inner.min_interval;
    }
}
