//! Wakers are the owner handles the wait queue stores: waking one resumes
//! the parked thread it belongs to.

use crate::executor::ExecutorHandle;
use crate::green::GreenThread;
use std::sync::Arc;
use std::task::{RawWaker, RawWakerVTable, Waker};
use std::thread::Thread;

/* --- 1. GREEN THREAD WAKER (re-injects into the executor) --- */
pub struct WakerData {
    thread: Arc<GreenThread>,
    handle: Arc<ExecutorHandle>,
}

impl WakerData {
    fn resume(&self) {
        if self.thread.schedule() {
            self.handle.enqueue(self.thread.clone());
        }
    }
}

pub fn thread_waker(thread: Arc<GreenThread>, handle: Arc<ExecutorHandle>) -> Waker {
    let data = Box::new(WakerData { thread, handle });
    let ptr = Box::into_raw(data) as *const ();
    unsafe { Waker::from_raw(RawWaker::new(ptr, &VTABLE)) }
}

unsafe fn clone(data: *const ()) -> RawWaker {
    // Borrowed: the waker keeps its own reference
    let data = unsafe { &*(data as *const WakerData) };
    let cloned = Box::new(WakerData {
        thread: data.thread.clone(),
        handle: data.handle.clone(),
    });
    RawWaker::new(Box::into_raw(cloned) as *const (), &VTABLE)
}

unsafe fn wake(data: *const ()) {
    // Owned: dropped at the end of this call
    let data = unsafe { Box::from_raw(data as *mut WakerData) };
    data.resume();
}

unsafe fn wake_by_ref(data: *const ()) {
    let data = unsafe { &*(data as *const WakerData) };
    data.resume();
}

unsafe fn drop(data: *const ()) {
    let _ = unsafe { Box::from_raw(data as *mut WakerData) };
}

static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);

/* --- 2. UNPARK WAKER (OS threads: block_on, wait_blocking) --- */

/// Creates a waker that unparks a specific OS thread.
pub fn unpark_waker(thread: Thread) -> Waker {
    let ptr = Box::into_raw(Box::new(thread)) as *const ();
    unsafe { Waker::from_raw(RawWaker::new(ptr, &UNPARK_VTABLE)) }
}

unsafe fn clone_unpark(ptr: *const ()) -> RawWaker {
    let thread = unsafe { (*(ptr as *const Thread)).clone() };
    RawWaker::new(Box::into_raw(Box::new(thread)) as *const (), &UNPARK_VTABLE)
}

unsafe fn wake_unpark(ptr: *const ()) {
    let thread = unsafe { *Box::from_raw(ptr as *mut Thread) };
    thread.unpark();
}

unsafe fn wake_unpark_by_ref(ptr: *const ()) {
    let thread = unsafe { &*(ptr as *const Thread) };
    thread.unpark();
}

unsafe fn drop_unpark(ptr: *const ()) {
    let _ = unsafe { Box::from_raw(ptr as *mut Thread) };
}

static UNPARK_VTABLE: RawWakerVTable =
    RawWakerVTable::new(clone_unpark, wake_unpark, wake_unpark_by_ref, drop_unpark);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn unpark_waker_wakes_parked_thread() {
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        let waiter = thread::spawn(move || {
            while !flag.load(Ordering::Acquire) {
                thread::park();
            }
        });

        let waker = unpark_waker(waiter.thread().clone());
        let clone = waker.clone();
        thread::sleep(Duration::from_millis(5));
        done.store(true, Ordering::Release);
        clone.wake_by_ref();
        std::mem::drop(clone);
        waker.wake();
        waiter.join().unwrap();
    }
}
