//! Process-wide shutdown hook.
//!
//! Every [`IoWaitQueue`] registers itself here on construction. At teardown
//! [`drain_all`] force-wakes every parked thread on every live queue from the
//! calling thread, so nothing stays parked even if no dispatcher can run
//! anymore.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::wait::IoWaitQueue;

static LIVE_QUEUES: Mutex<Vec<Weak<IoWaitQueue>>> = Mutex::new(Vec::new());

pub(crate) fn register(queue: &Arc<IoWaitQueue>) {
    let mut queues = LIVE_QUEUES.lock();
    queues.retain(|q| q.strong_count() > 0);
    queues.push(Arc::downgrade(queue));
}

/// Drains every live wait queue. Returns the number of threads woken.
pub fn drain_all() -> usize {
    // Upgrade under the lock, drain outside it: draining wakes owners,
    // which may construct new queues.
    let queues: Vec<Arc<IoWaitQueue>> = LIVE_QUEUES
        .lock()
        .iter()
        .filter_map(Weak::upgrade)
        .collect();

    let woken = queues.iter().map(|queue| queue.drain()).sum();
    log::debug!("shutdown drained {} queues, woke {woken} threads", queues.len());
    woken
}
