//! Concurrent enqueue/dequeue churn against a live dispatcher.

use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use futures::task::{ArcWake, waker};
use rand::Rng;

use greenwait::dispatcher;
use greenwait::wait::{Deadline, IoWaitQueue, WaitDescriptor, WakeReason};

const THREADS: usize = 4;
const ROUNDS: usize = 200;

#[derive(Default)]
struct WakeCount(AtomicUsize);

impl ArcWake for WakeCount {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn every_wait_is_resumed_at_most_once() {
    let queue = IoWaitQueue::new().unwrap();
    let dispatcher = dispatcher::spawn(queue.clone(), Duration::from_millis(2)).unwrap();
    let (_tx, rx) = mio::unix::pipe::new().unwrap();
    let idle_fd = rx.as_raw_fd();

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let queue = queue.clone();
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                let mut ledger = Vec::with_capacity(ROUNDS);

                for _ in 0..ROUNDS {
                    let count = Arc::new(WakeCount::default());
                    let owner = waker(count.clone());

                    let deadline = Deadline::after(Duration::from_micros(rng.gen_range(0..3_000)));
                    let mut desc = WaitDescriptor::sleep(deadline);
                    if rng.gen_bool(0.5) {
                        desc.watch_read(idle_fd);
                    }
                    let handle = queue.enqueue(desc, owner.clone()).unwrap();

                    if rng.gen_bool(0.5) {
                        for _ in 0..rng.gen_range(0..50) {
                            thread::yield_now();
                        }
                        // A wait that was already resumed keeps its single wake.
                        let expected_wakes = if queue.dequeue(handle) { 0 } else { 1 };
                        ledger.push((count, expected_wakes));
                    } else {
                        let resumed = loop {
                            if let Some(resumed) = queue.take_resumed(handle, &owner) {
                                break resumed;
                            }
                            thread::yield_now();
                        };
                        assert_eq!(resumed.reason, WakeReason::TimedOut);
                        assert!(!resumed.descriptor.any_ready());
                        ledger.push((count, 1));
                    }
                }
                ledger
            })
        })
        .collect();

    let ledgers: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    assert!(queue.is_empty());
    assert_eq!(queue.drain(), 0);
    dispatcher.join().unwrap();

    for (count, expected_wakes) in ledgers.into_iter().flatten() {
        assert_eq!(count.0.load(Ordering::SeqCst), expected_wakes);
    }
}
