use std::os::fd::AsRawFd;
use std::thread;
use std::time::{Duration, Instant};

use greenwait::WaitError;
use greenwait::shutdown;
use greenwait::wait::{Deadline, IoWaitQueue, WaitDescriptor, WakeReason, wait_blocking};

fn wait_for_pending(queue: &IoWaitQueue, count: usize) {
    let give_up = Instant::now() + Duration::from_secs(5);
    while queue.len() < count {
        assert!(Instant::now() < give_up, "waiters never parked");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn drain_all_force_wakes_parked_threads_without_a_dispatcher() {
    let queue = IoWaitQueue::new().unwrap();
    let (tx, rx) = mio::unix::pipe::new().unwrap();
    let (read_fd, write_fd) = (rx.as_raw_fd(), tx.as_raw_fd());

    let waiters: Vec<_> = (0..3)
        .map(|i| {
            let queue = queue.clone();
            thread::spawn(move || {
                let mut desc = WaitDescriptor::new(Deadline::after(Duration::from_secs(60)));
                desc.watch_read(read_fd);
                if i == 1 {
                    desc.watch_write(write_fd).watch_except(read_fd);
                }
                wait_blocking(&queue, desc).unwrap()
            })
        })
        .collect();

    wait_for_pending(&queue, 3);
    assert!(shutdown::drain_all() >= 3);

    for waiter in waiters {
        let resumed = waiter.join().unwrap();
        assert_eq!(resumed.reason, WakeReason::Forced);
        assert!(resumed.descriptor.read_set().iter().all(|slot| slot.is_ready()));
        assert!(resumed.descriptor.write_set().iter().all(|slot| slot.is_ready()));
        assert!(resumed.descriptor.except_set().iter().all(|slot| slot.is_ready()));
    }
    assert!(queue.is_empty());
    assert!(queue.is_draining());
}

#[test]
fn drained_queue_rejects_new_waits() {
    let queue = IoWaitQueue::new().unwrap();
    queue.drain();

    let err = wait_blocking(&queue, WaitDescriptor::sleep(Deadline::Never)).unwrap_err();
    assert!(matches!(err, WaitError::Draining));
    assert!(queue.is_empty());
}
