//! The shared I/O wait queue.
//!
//! Green threads enqueue descriptors here and park; the dispatcher takes a
//! snapshot of the flattened fd arrays, polls, and hands readiness back
//! through [`complete_cycle`](IoWaitQueue::complete_cycle). One lock covers
//! the pending set, the flattened arrays and the completion table, which
//! makes enqueue, dequeue, aggregation and the dispatcher's resume step
//! mutually exclusive.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::task::Waker;
use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use parking_lot::Mutex;

use super::aggregate::{FdArrays, Offsets, SlotRef};
use super::descriptor::{Deadline, ReadySets, SetKind, WaitDescriptor};
use super::queue::{WaitHandle, WaitQueue};
use super::signal::Signal;
use super::slot::FdSlot;
use crate::dispatcher;
use crate::error::{Result, WaitError};
use crate::event_log::{EventLevel, EventLog, record_event};
use crate::shutdown;

/// Why a parked thread was resumed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WakeReason {
    /// At least one slot was reported ready by the OS.
    Ready,
    /// The deadline passed without readiness.
    TimedOut,
    /// Woken unconditionally (shutdown or a failed poll). Every slot carries
    /// the ready bit but nothing is actually guaranteed ready.
    Forced,
    /// One of the descriptors was rejected by the OS as invalid.
    Failed,
}

impl WakeReason {
    /// Label used in metrics and log lines.
    pub fn as_str(self) -> &'static str {
        match self {
            WakeReason::Ready => "ready",
            WakeReason::TimedOut => "timed_out",
            WakeReason::Forced => "forced",
            WakeReason::Failed => "failed",
        }
    }
}

/// A serviced wait, handed back to its owner.
#[derive(Debug)]
pub struct Resumed {
    /// The descriptor as enqueued, with the ready bit set on every slot the
    /// OS reported (or on every slot for a forced wake).
    pub descriptor: WaitDescriptor,
    pub reason: WakeReason,
}

impl Resumed {
    pub fn ready_sets(&self) -> ReadySets {
        self.descriptor.ready_sets()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum QueueState {
    Running,
    Draining,
}

/// Per-slot result of one multiplex call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SlotEvent {
    Ready,
    Invalid,
}

/// What the dispatcher learned from one multiplex call.
pub(crate) enum PollOutcome {
    Events(Vec<(SlotRef, SlotEvent)>),
    /// The call failed as a whole; no slot can be blamed.
    Failed(io::Error),
}

/// Everything the dispatcher needs for one blocking call.
pub(crate) struct Snapshot {
    pub signal_fd: std::os::fd::RawFd,
    pub slots: Vec<(FdSlot, SlotRef)>,
    pub timeout: Duration,
}

pub(crate) enum Cycle {
    Poll(Snapshot),
    Exit,
}

struct Inner {
    pending: WaitQueue<Waker>,
    arrays: FdArrays,
    // Membership of the I/O waits changed since the last rebuild.
    dirty: bool,
    resumed: HashMap<WaitHandle, Resumed>,
    state: QueueState,
    // Set while the dispatcher is blocked; the latest instant it will wake.
    sleeping_until: Option<Deadline>,
    signaled: bool,
}

impl Inner {
    fn aggregate(&mut self) {
        if self.dirty {
            self.arrays.rebuild(&self.pending);
            self.dirty = false;
        }
    }
}

/// The queue shared by every green thread of a runtime and its dispatcher.
///
/// Threads park here with [`enqueue`](IoWaitQueue::enqueue); the dispatcher
/// polls the aggregated descriptors and moves serviced waits into a
/// completion table their owners claim with
/// [`take_resumed`](IoWaitQueue::take_resumed).
pub struct IoWaitQueue {
    /// Pending set, flattened arrays and completions, under one lock.
    inner: Mutex<Inner>,
    /// Interrupts the dispatcher's blocking poll.
    signal: Signal,
    /// Runtime event log; `None` until the runtime is booted with one.
    event_log: Option<Arc<EventLog>>,
}

impl IoWaitQueue {
    /// A queue without an event log, registered with the shutdown hook.
    pub fn new() -> Result<Arc<Self>> {
        Self::with_event_log(None)
    }

    pub fn with_event_log(event_log: Option<Arc<EventLog>>) -> Result<Arc<Self>> {
        let queue = Arc::new(Self {
            inner: Mutex::new(Inner {
                pending: WaitQueue::new(),
                arrays: FdArrays::default(),
                dirty: false,
                resumed: HashMap::new(),
                state: QueueState::Running,
                sleeping_until: None,
                signaled: false,
            }),
            signal: Signal::new()?,
            event_log,
        });
        shutdown::register(&queue);
        Ok(queue)
    }

    /// Parks `descriptor` until the dispatcher or a drain resumes it, at which
    /// point `owner` is woken.
    ///
    /// Ready bits left over from an earlier wait are cleared. Fails with
    /// [`WaitError::Draining`] once the queue is shutting down.
    pub fn enqueue(&self, mut descriptor: WaitDescriptor, owner: Waker) -> Result<WaitHandle> {
        descriptor.clear_ready();
        let kind = descriptor.kind();
        let deadline = descriptor.deadline();
        let has_slots = descriptor.slot_count() > 0;

        let mut inner = self.inner.lock();
        if inner.state == QueueState::Draining {
            return Err(WaitError::Draining);
        }
        let handle = inner.pending.insert(descriptor, owner);
        if has_slots {
            inner.dirty = true;
        }

        // Interrupt the dispatcher if it would otherwise sleep past this
        // deadline, or if it is polling a set that lacks these descriptors.
        let notify = match inner.sleeping_until {
            Some(wake_at) => (deadline < wake_at || has_slots) && !inner.signaled,
            None => false,
        };
        if notify {
            inner.signaled = true;
        }
        drop(inner);

        if notify {
            self.signal.notify();
        }
        counter!("greenwait_waits_enqueued_total", "kind" => kind.as_str()).increment(1);
        log::trace!("enqueued {} wait {handle:?}, deadline {deadline:?}", kind.as_str());
        gauge!("greenwait_waits_pending_current").increment(1.0);
        Ok(handle)
    }

    /// Removes a wait that has not been serviced yet.
    ///
    /// Returns `false` if the handle is unknown or the wait was already
    /// resumed; in the latter case the unclaimed result is discarded.
    pub fn dequeue(&self, handle: WaitHandle) -> bool {
        let mut inner = self.inner.lock();
        match inner.pending.remove(handle) {
            Some((descriptor, _owner)) => {
                if descriptor.slot_count() > 0 {
                    inner.dirty = true;
                }
                gauge!("greenwait_waits_pending_current").decrement(1.0);
                true
            }
            None => {
                inner.resumed.remove(&handle);
                false
            }
        }
    }

    /// Claims the result of a resumed wait.
    ///
    /// While the wait is still pending, `waker` replaces the stored owner if
    /// it would wake a different task, and `None` is returned.
    pub fn take_resumed(&self, handle: WaitHandle, waker: &Waker) -> Option<Resumed> {
        let mut inner = self.inner.lock();
        if let Some(resumed) = inner.resumed.remove(&handle) {
            return Some(resumed);
        }
        if let Some(owner) = inner.pending.owner_mut(handle) {
            if !owner.will_wake(waker) {
                *owner = waker.clone();
            }
        }
        None
    }

    pub fn is_pending(&self, handle: WaitHandle) -> bool {
        self.inner.lock().pending.contains(handle)
    }

    /// Earliest pending deadline, `Never` when nothing is pending.
    pub fn next_deadline(&self) -> Deadline {
        self.inner.lock().pending.next_deadline()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_draining(&self) -> bool {
        self.inner.lock().state == QueueState::Draining
    }

    /// Where `handle`'s slots currently begin in the flattened arrays.
    ///
    /// Re-aggregates first if membership changed, so the offsets are valid
    /// until the next enqueue or dequeue.
    pub fn offsets(&self, handle: WaitHandle) -> Option<Offsets> {
        let mut inner = self.inner.lock();
        inner.aggregate();
        inner.arrays.offsets(handle)
    }

    /// Copy of one flattened array after re-aggregating.
    pub fn flattened(&self, kind: SetKind) -> Vec<FdSlot> {
        let mut inner = self.inner.lock();
        inner.aggregate();
        inner.arrays.set(kind).to_vec()
    }

    /// Shutdown transition: rejects further enqueues, forces every pending
    /// descriptor ready and wakes its owner with [`WakeReason::Forced`].
    ///
    /// Runs entirely on the calling thread and never waits for the
    /// dispatcher. Returns the number of threads woken.
    pub fn drain(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.state = QueueState::Draining;
        let drained = inner.pending.drain();
        inner.dirty = true;

        let mut owners = Vec::with_capacity(drained.len());
        for (handle, mut descriptor, owner) in drained {
            descriptor.mark_all_ready();
            inner.resumed.insert(
                handle,
                Resumed {
                    descriptor,
                    reason: WakeReason::Forced,
                },
            );
            owners.push(owner);
        }
        drop(inner);

        let count = owners.len();
        for owner in owners {
            owner.wake();
        }
        // Let a running dispatcher notice the state change and exit.
        self.signal.notify();

        counter!("greenwait_waits_resumed_total", "reason" => WakeReason::Forced.as_str())
            .increment(count as u64);
        gauge!("greenwait_waits_pending_current").decrement(count as f64);
        record_event!(
            self.event_log,
            EventLevel::Minimal,
            "wait queue drained, {count} threads force-woken"
        );
        count
    }

    /// Starts a dispatch cycle: re-aggregates, snapshots the flattened
    /// arrays and computes the timeout for the blocking call.
    pub(crate) fn prepare_cycle(&self, max_poll_interval: Duration) -> Cycle {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if inner.state == QueueState::Draining {
            return Cycle::Exit;
        }

        self.signal.clear();
        inner.signaled = false;
        inner.aggregate();

        let next_deadline = inner.pending.next_deadline();
        let timeout = dispatcher::poll_timeout(next_deadline, now, max_poll_interval);
        inner.sleeping_until = Some(Deadline::At(now + timeout));

        Cycle::Poll(Snapshot {
            signal_fd: self.signal.fd(),
            slots: inner.arrays.iter().collect(),
            timeout,
        })
    }

    /// Finishes a dispatch cycle: scatters readiness into the owning
    /// descriptors, then resumes every wait that is ready, failed or expired.
    ///
    /// Returns the number of threads resumed.
    pub(crate) fn complete_cycle(&self, outcome: PollOutcome) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.sleeping_until = None;

        let mut failed = HashSet::new();
        let mut touched = Vec::new();
        let mut forced = false;
        match outcome {
            PollOutcome::Events(events) => {
                for (slot_ref, event) in events {
                    // Waits dequeued while the dispatcher was blocked are
                    // simply absent now.
                    let Some(descriptor) = inner.pending.get_mut(slot_ref.handle) else {
                        continue;
                    };
                    match event {
                        SlotEvent::Ready => {
                            if let Some(slot) = descriptor.slot_mut(slot_ref.kind, slot_ref.index) {
                                slot.mark_ready();
                                touched.push(slot_ref.handle);
                            }
                        }
                        SlotEvent::Invalid => {
                            if failed.insert(slot_ref.handle) {
                                touched.push(slot_ref.handle);
                            }
                        }
                    }
                }
            }
            PollOutcome::Failed(err) => {
                log::warn!("multiplex call failed ({err}), force-waking all waiters");
                counter!("greenwait_poll_errors_total").increment(1);
                record_event!(
                    self.event_log,
                    EventLevel::Events,
                    "multiplex call failed: {err}; forcing {} waiters",
                    inner.pending.len()
                );
                forced = true;
            }
        }

        // Only expired waits and waits hit by an event can resume, unless
        // the whole call failed.
        let candidates: Vec<WaitHandle> = if forced {
            inner.pending.iter().map(|(handle, _)| handle).collect()
        } else {
            let mut seen = HashSet::new();
            inner
                .pending
                .expired(now)
                .into_iter()
                .chain(touched)
                .filter(|handle| seen.insert(*handle))
                .collect()
        };

        let mut resume = Vec::with_capacity(candidates.len());
        for handle in candidates {
            let Some(descriptor) = inner.pending.get(handle) else {
                continue;
            };
            let reason = if forced {
                WakeReason::Forced
            } else if failed.contains(&handle) {
                WakeReason::Failed
            } else if descriptor.any_ready() {
                WakeReason::Ready
            } else if descriptor.deadline().is_elapsed(now) {
                WakeReason::TimedOut
            } else {
                continue;
            };
            resume.push((handle, reason));
        }

        let mut owners = Vec::with_capacity(resume.len());
        for (handle, reason) in resume {
            let Some((mut descriptor, owner)) = inner.pending.remove(handle) else {
                continue;
            };
            if descriptor.slot_count() > 0 {
                inner.dirty = true;
            }
            if reason == WakeReason::Forced {
                descriptor.mark_all_ready();
            }
            if reason == WakeReason::Failed {
                log::warn!("wait {handle:?} resumed after an invalid descriptor");
            }
            counter!("greenwait_waits_resumed_total", "reason" => reason.as_str()).increment(1);
            inner.resumed.insert(handle, Resumed { descriptor, reason });
            owners.push(owner);
        }
        drop(inner);

        let count = owners.len();
        gauge!("greenwait_waits_pending_current").decrement(count as f64);
        if count > 0 {
            log::debug!("dispatcher resumed {count} threads");
            record_event!(
                self.event_log,
                EventLevel::Verbose,
                "dispatch cycle resumed {count} threads"
            );
        }
        for owner in owners {
            owner.wake();
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker;

    fn io_wait(reads: &[i32], writes: &[i32]) -> WaitDescriptor {
        let mut desc = WaitDescriptor::new(Deadline::Never);
        for fd in reads {
            desc.watch_read(*fd);
        }
        for fd in writes {
            desc.watch_write(*fd);
        }
        desc
    }

    #[test]
    fn aggregation_tracks_membership() {
        let queue = IoWaitQueue::new().unwrap();
        let a = queue.enqueue(io_wait(&[20, 21], &[]), noop_waker()).unwrap();
        let b = queue.enqueue(io_wait(&[], &[22]), noop_waker()).unwrap();

        assert_eq!(queue.flattened(SetKind::Read).len(), 2);
        assert_eq!(queue.flattened(SetKind::Write).len(), 1);
        assert_eq!(queue.offsets(a).map(|o| o.read), Some(0));
        let b_offsets = queue.offsets(b).unwrap();
        assert_eq!(b_offsets.of(SetKind::Read), 2);
        assert_eq!(b_offsets.of(SetKind::Write), 0);

        assert!(queue.dequeue(a));
        assert!(!queue.dequeue(a));
        assert_eq!(queue.offsets(a), None);
        assert_eq!(queue.offsets(b), Some(Offsets::default()));
        assert!(queue.flattened(SetKind::Read).is_empty());
        assert_eq!(queue.flattened(SetKind::Write)[0].fd(), 22);
        queue.drain();
    }

    #[test]
    fn stale_ready_bits_are_cleared_on_enqueue() {
        let queue = IoWaitQueue::new().unwrap();
        let mut desc = io_wait(&[5], &[]);
        desc.mark_all_ready();
        let handle = queue.enqueue(desc, noop_waker()).unwrap();

        assert!(!queue.flattened(SetKind::Read)[0].is_ready());
        assert_eq!(queue.complete_cycle(PollOutcome::Events(Vec::new())), 0);
        assert!(queue.is_pending(handle));
        queue.drain();
    }

    #[test]
    fn readiness_is_scattered_to_the_owner() {
        let queue = IoWaitQueue::new().unwrap();
        let a = queue.enqueue(io_wait(&[30, 31], &[]), noop_waker()).unwrap();
        let b = queue.enqueue(io_wait(&[32], &[]), noop_waker()).unwrap();

        let Cycle::Poll(snapshot) = queue.prepare_cycle(Duration::from_millis(5)) else {
            panic!("queue is not draining");
        };
        assert_eq!(snapshot.slots.len(), 3);
        assert!(snapshot.timeout <= Duration::from_millis(5));
        let (_, second) = snapshot.slots[1];

        let resumed = queue.complete_cycle(PollOutcome::Events(vec![(second, SlotEvent::Ready)]));
        assert_eq!(resumed, 1);
        assert!(queue.is_pending(b));

        let result = queue.take_resumed(a, &noop_waker()).unwrap();
        assert_eq!(result.reason, WakeReason::Ready);
        let bits: Vec<bool> = result.descriptor.read_set().iter().map(|s| s.is_ready()).collect();
        assert_eq!(bits, [false, true]);
        assert!(queue.take_resumed(a, &noop_waker()).is_none());
        queue.drain();
    }

    #[test]
    fn dequeued_snapshot_entries_are_skipped_and_ready_beats_expiry() {
        let queue = IoWaitQueue::new().unwrap();
        let gone = queue.enqueue(io_wait(&[33], &[]), noop_waker()).unwrap();
        let mut late = WaitDescriptor::new(Deadline::At(Instant::now()));
        late.watch_read(34);
        let late = queue.enqueue(late, noop_waker()).unwrap();

        let Cycle::Poll(snapshot) = queue.prepare_cycle(Duration::from_millis(5)) else {
            panic!("queue is not draining");
        };
        assert_eq!(snapshot.slots.len(), 2);
        assert!(queue.dequeue(gone));

        let events = snapshot
            .slots
            .iter()
            .map(|&(_, owner)| (owner, SlotEvent::Ready))
            .collect();
        assert_eq!(queue.complete_cycle(PollOutcome::Events(events)), 1);

        let result = queue.take_resumed(late, &noop_waker()).unwrap();
        assert_eq!(result.reason, WakeReason::Ready);
        assert!(result.descriptor.read_set()[0].is_ready());
        assert!(queue.take_resumed(gone, &noop_waker()).is_none());
        assert!(queue.is_empty());
        queue.drain();
    }

    #[test]
    fn invalid_slot_fails_only_its_owner() {
        let queue = IoWaitQueue::new().unwrap();
        let bad = queue.enqueue(io_wait(&[40], &[]), noop_waker()).unwrap();
        let good = queue.enqueue(io_wait(&[41], &[]), noop_waker()).unwrap();

        let Cycle::Poll(snapshot) = queue.prepare_cycle(Duration::from_millis(5)) else {
            panic!("queue is not draining");
        };
        let (_, bad_slot) = snapshot.slots[0];
        queue.complete_cycle(PollOutcome::Events(vec![(bad_slot, SlotEvent::Invalid)]));

        let result = queue.take_resumed(bad, &noop_waker()).unwrap();
        assert_eq!(result.reason, WakeReason::Failed);
        assert!(queue.is_pending(good));
        queue.drain();
    }

    #[test]
    fn failed_poll_forces_everyone() {
        let queue = IoWaitQueue::new().unwrap();
        let handles: Vec<_> = (50..53)
            .map(|fd| queue.enqueue(io_wait(&[fd], &[]), noop_waker()).unwrap())
            .collect();

        let err = io::Error::from_raw_os_error(libc::ENOMEM);
        assert_eq!(queue.complete_cycle(PollOutcome::Failed(err)), 3);
        for handle in handles {
            let result = queue.take_resumed(handle, &noop_waker()).unwrap();
            assert_eq!(result.reason, WakeReason::Forced);
            assert!(result.descriptor.read_set()[0].is_ready());
        }
        assert!(queue.is_empty());
        queue.drain();
    }

    #[test]
    fn expired_sleep_times_out() {
        let queue = IoWaitQueue::new().unwrap();
        let past = WaitDescriptor::sleep(Deadline::At(Instant::now()));
        let later = WaitDescriptor::sleep(Deadline::after(Duration::from_secs(60)));
        let past = queue.enqueue(past, noop_waker()).unwrap();
        let later = queue.enqueue(later, noop_waker()).unwrap();

        assert_eq!(queue.complete_cycle(PollOutcome::Events(Vec::new())), 1);
        let result = queue.take_resumed(past, &noop_waker()).unwrap();
        assert_eq!(result.reason, WakeReason::TimedOut);
        assert!(!result.ready_sets().any());
        assert!(queue.is_pending(later));
        queue.drain();
    }

    #[test]
    fn drain_rejects_new_waits() {
        let queue = IoWaitQueue::new().unwrap();
        let handle = queue.enqueue(io_wait(&[60], &[61]), noop_waker()).unwrap();
        assert_eq!(queue.drain(), 1);
        assert!(queue.is_draining());
        assert!(matches!(
            queue.enqueue(io_wait(&[62], &[]), noop_waker()),
            Err(WaitError::Draining)
        ));
        assert!(matches!(queue.prepare_cycle(Duration::from_millis(1)), Cycle::Exit));

        let result = queue.take_resumed(handle, &noop_waker()).unwrap();
        assert_eq!(result.reason, WakeReason::Forced);
        assert!(result.ready_sets().read && result.ready_sets().write);
    }
}
