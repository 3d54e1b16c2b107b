//! Suspending on the wait queue.
//!
//! [`IoWait`] is the suspension point of a green thread: the first poll
//! enqueues the descriptor and parks, the wake delivered by the dispatcher
//! (or a drain) lets the next poll claim the result. Dropping a parked
//! `IoWait` dequeues it.

use std::future::Future;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread;

use super::descriptor::{Deadline, WaitDescriptor};
use super::io_queue::{IoWaitQueue, Resumed};
use super::queue::WaitHandle;
use crate::error::Result;
use crate::waker::unpark_waker;

enum State {
    Idle(WaitDescriptor),
    Parked(WaitHandle),
    Done,
}

#[must_use = "futures do nothing unless awaited"]
pub struct IoWait {
    queue: Arc<IoWaitQueue>,
    state: State,
}

impl IoWait {
    pub fn new(queue: Arc<IoWaitQueue>, descriptor: WaitDescriptor) -> Self {
        Self {
            queue,
            state: State::Idle(descriptor),
        }
    }

    pub fn readable(queue: Arc<IoWaitQueue>, fd: RawFd, deadline: Deadline) -> Self {
        let mut descriptor = WaitDescriptor::new(deadline);
        descriptor.watch_read(fd);
        Self::new(queue, descriptor)
    }

    pub fn writable(queue: Arc<IoWaitQueue>, fd: RawFd, deadline: Deadline) -> Self {
        let mut descriptor = WaitDescriptor::new(deadline);
        descriptor.watch_write(fd);
        Self::new(queue, descriptor)
    }

    pub fn sleep_until(queue: Arc<IoWaitQueue>, deadline: Deadline) -> Self {
        Self::new(queue, WaitDescriptor::sleep(deadline))
    }
}

impl Future for IoWait {
    type Output = Result<Resumed>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match std::mem::replace(&mut this.state, State::Done) {
            State::Idle(descriptor) => match this.queue.enqueue(descriptor, cx.waker().clone()) {
                Ok(handle) => {
                    this.state = State::Parked(handle);
                    Poll::Pending
                }
                Err(err) => Poll::Ready(Err(err)),
            },
            State::Parked(handle) => match this.queue.take_resumed(handle, cx.waker()) {
                Some(resumed) => Poll::Ready(Ok(resumed)),
                None => {
                    this.state = State::Parked(handle);
                    Poll::Pending
                }
            },
            State::Done => panic!("greenwait: IoWait polled after completion"),
        }
    }
}

impl Drop for IoWait {
    fn drop(&mut self) {
        if let State::Parked(handle) = self.state {
            self.queue.dequeue(handle);
        }
    }
}

/// Parks the calling OS thread on `queue` until the wait is serviced.
pub fn wait_blocking(queue: &Arc<IoWaitQueue>, descriptor: WaitDescriptor) -> Result<Resumed> {
    let waker = unpark_waker(thread::current());
    let handle = queue.enqueue(descriptor, waker.clone())?;
    loop {
        if let Some(resumed) = queue.take_resumed(handle, &waker) {
            return Ok(resumed);
        }
        thread::park();
    }
}
