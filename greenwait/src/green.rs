//! Green threads: futures scheduled by the runtime's own workers.
//!
//! A green thread suspends by awaiting an [`IoWait`](crate::wait::IoWait);
//! its waker is the owner back-reference stored in the wait queue, and waking
//! it puts the thread back on the executor's run queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::task::{Context, Poll, Waker};

use futures::future::BoxFuture;
use metrics::gauge;
use parking_lot::Mutex;

use crate::executor::ExecutorHandle;
use crate::waker::thread_waker;

/// Not queued, waiting for a wake.
const IDLE: u8 = 0;
/// Sitting in a run queue.
const SCHEDULED: u8 = 1;
/// Being polled by a worker.
const POLLING: u8 = 2;
/// Woken while being polled; the worker reschedules it.
const NOTIFIED: u8 = 3;
const COMPLETED: u8 = 4;

pub(crate) static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(1);

pub type ThreadFuture = BoxFuture<'static, ()>;

/// A future scheduled as one green thread.
pub struct GreenThread {
    /// Process-unique id, for diagnostics.
    pub id: usize,
    state: AtomicU8,
    // Only the worker that moved the state to POLLING touches this.
    future: Mutex<Option<ThreadFuture>>,
}

impl GreenThread {
    /// A new thread, already in the `SCHEDULED` state; the caller must push
    /// it onto a run queue.
    pub fn new(future: ThreadFuture) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(SCHEDULED),
            future: Mutex::new(Some(future)),
        })
    }

    /// Marks the thread runnable. Returns `true` if the caller must enqueue
    /// it; `false` if it is already queued, running (it will be rescheduled)
    /// or finished.
    pub(crate) fn schedule(&self) -> bool {
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            let next = match state {
                IDLE => SCHEDULED,
                POLLING => NOTIFIED,
                _ => return false,
            };
            match self
                .state
                .compare_exchange_weak(state, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next == SCHEDULED,
                Err(actual) => state = actual,
            }
        }
    }

    // Built per poll rather than cached: a cached waker would hold an Arc
    // to the thread itself and keep finished threads alive.
    pub(crate) fn waker(self: &Arc<Self>, handle: &Arc<ExecutorHandle>) -> Waker {
        thread_waker(self.clone(), handle.clone())
    }

    /// Polls the thread once. Returns `true` if it has to go back on a run
    /// queue because it was woken mid-poll.
    pub(crate) fn run(self: &Arc<Self>, handle: &Arc<ExecutorHandle>) -> bool {
        if self
            .state
            .compare_exchange(SCHEDULED, POLLING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let waker = self.waker(handle);
        let mut cx = Context::from_waker(&waker);
        let mut slot = self.future.lock();
        let Some(future) = slot.as_mut() else {
            self.state.store(COMPLETED, Ordering::Release);
            return false;
        };

        match future.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {
                *slot = None;
                self.state.store(COMPLETED, Ordering::Release);
                gauge!("greenwait_threads_pending_current").decrement(1.0);
                false
            }
            Poll::Pending => {
                drop(slot);
                match self
                    .state
                    .compare_exchange(POLLING, IDLE, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => false,
                    Err(_) => {
                        // NOTIFIED: a wake arrived while we were polling.
                        self.state.store(SCHEDULED, Ordering::Release);
                        true
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for GreenThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GreenThread")
            .field("id", &self.id)
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish()
    }
}
