//! Deadline-ordered arena of pending waits.
//!
//! The base structure shared by every wait reason. It is not synchronized;
//! [`IoWaitQueue`](super::IoWaitQueue) wraps it in a lock.

use std::collections::BTreeSet;
use std::time::Instant;

use slab::Slab;

use super::descriptor::{Deadline, WaitDescriptor};

/// Stable reference to an enqueued descriptor.
///
/// The enqueue sequence number makes handles unique for the lifetime of a
/// queue, so a handle whose arena slot has been reused never matches the new
/// occupant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WaitHandle {
    key: usize,
    seq: u64,
}


struct Entry<O> {
    seq: u64,
    descriptor: WaitDescriptor,
    owner: O,
}

/// Pending descriptors ordered by ascending deadline, FIFO among equal
/// deadlines. `O` identifies the parked thread to resume.
pub struct WaitQueue<O> {
    entries: Slab<Entry<O>>,
    // (deadline, enqueue seq, arena key)
    order: BTreeSet<(Deadline, u64, usize)>,
    next_seq: u64,
}

impl<O> Default for WaitQueue<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O> WaitQueue<O> {
    pub fn new() -> Self {
        Self {
            entries: Slab::new(),
            order: BTreeSet::new(),
            next_seq: 0,
        }
    }

    pub fn insert(&mut self, descriptor: WaitDescriptor, owner: O) -> WaitHandle {
        let seq = self.next_seq;
        self.next_seq += 1;

        let deadline = descriptor.deadline();
        let key = self.entries.insert(Entry {
            seq,
            descriptor,
            owner,
        });
        self.order.insert((deadline, seq, key));

        WaitHandle { key, seq }
    }

    pub fn remove(&mut self, handle: WaitHandle) -> Option<(WaitDescriptor, O)> {
        if !self.contains(handle) {
            return None;
        }
        let entry = self.entries.remove(handle.key);
        self.order
            .remove(&(entry.descriptor.deadline(), entry.seq, handle.key));
        Some((entry.descriptor, entry.owner))
    }

    pub fn contains(&self, handle: WaitHandle) -> bool {
        self.entries
            .get(handle.key)
            .is_some_and(|entry| entry.seq == handle.seq)
    }

    pub fn get(&self, handle: WaitHandle) -> Option<&WaitDescriptor> {
        self.entry(handle).map(|entry| &entry.descriptor)
    }

    pub fn get_mut(&mut self, handle: WaitHandle) -> Option<&mut WaitDescriptor> {
        self.entry_mut(handle).map(|entry| &mut entry.descriptor)
    }

    pub fn owner_mut(&mut self, handle: WaitHandle) -> Option<&mut O> {
        self.entry_mut(handle).map(|entry| &mut entry.owner)
    }

    /// Earliest pending deadline, `Never` when empty.
    pub fn next_deadline(&self) -> Deadline {
        self.order
            .first()
            .map_or(Deadline::Never, |(deadline, _, _)| *deadline)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pending waits in deadline order.
    pub fn iter(&self) -> impl Iterator<Item = (WaitHandle, &WaitDescriptor)> + '_ {
        self.order.iter().map(|&(_, seq, key)| {
            (WaitHandle { key, seq }, &self.entries[key].descriptor)
        })
    }

    /// Handles whose deadline has elapsed at `now`, in non-decreasing
    /// deadline order.
    pub fn expired(&self, now: Instant) -> Vec<WaitHandle> {
        self.order
            .iter()
            .take_while(|(deadline, _, _)| deadline.is_elapsed(now))
            .map(|&(_, seq, key)| WaitHandle { key, seq })
            .collect()
    }

    /// Removes every pending wait, in deadline order.
    pub fn drain(&mut self) -> Vec<(WaitHandle, WaitDescriptor, O)> {
        let order = std::mem::take(&mut self.order);
        order
            .into_iter()
            .map(|(_, seq, key)| {
                let entry = self.entries.remove(key);
                (WaitHandle { key, seq }, entry.descriptor, entry.owner)
            })
            .collect()
    }

    fn entry(&self, handle: WaitHandle) -> Option<&Entry<O>> {
        self.entries
            .get(handle.key)
            .filter(|entry| entry.seq == handle.seq)
    }

    fn entry_mut(&mut self, handle: WaitHandle) -> Option<&mut Entry<O>> {
        self.entries
            .get_mut(handle.key)
            .filter(|entry| entry.seq == handle.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn at(base: Instant, ms: u64) -> WaitDescriptor {
        WaitDescriptor::sleep(Deadline::At(base + Duration::from_millis(ms)))
    }

    #[test]
    fn orders_by_deadline_then_enqueue_order() {
        let base = Instant::now();
        let mut queue = WaitQueue::new();
        let late = queue.insert(at(base, 30), "late");
        let first_tie = queue.insert(at(base, 10), "tie-a");
        let never = queue.insert(WaitDescriptor::sleep(Deadline::Never), "never");
        let second_tie = queue.insert(at(base, 10), "tie-b");

        let order: Vec<WaitHandle> = queue.iter().map(|(h, _)| h).collect();
        assert_eq!(order, [first_tie, second_tie, late, never]);
        assert_eq!(
            queue.next_deadline(),
            Deadline::At(base + Duration::from_millis(10))
        );
    }

    #[test]
    fn empty_queue_never_expires() {
        let queue: WaitQueue<()> = WaitQueue::new();
        assert_eq!(queue.next_deadline(), Deadline::Never);
        assert!(queue.expired(Instant::now()).is_empty());
    }

    #[test]
    fn expired_stops_at_first_future_deadline() {
        let base = Instant::now();
        let mut queue = WaitQueue::new();
        let a = queue.insert(at(base, 5), ());
        let b = queue.insert(at(base, 15), ());
        queue.insert(at(base, 50), ());

        assert_eq!(queue.expired(base + Duration::from_millis(20)), [a, b]);
        assert!(queue.expired(base).is_empty());
    }

    #[test]
    fn removed_handle_is_gone_and_not_aliased() {
        let base = Instant::now();
        let mut queue = WaitQueue::new();
        let old = queue.insert(at(base, 5), 1);
        assert_eq!(queue.remove(old).map(|(_, o)| o), Some(1));
        assert!(queue.remove(old).is_none());

        // The arena slot is recycled but the stale handle must not match.
        let new = queue.insert(at(base, 5), 2);
        assert_ne!(old, new);
        assert!(!queue.contains(old));
        assert!(queue.get(old).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn drain_empties_in_order() {
        let base = Instant::now();
        let mut queue = WaitQueue::new();
        queue.insert(at(base, 20), 'b');
        queue.insert(at(base, 10), 'a');

        let owners: Vec<char> = queue.drain().into_iter().map(|(_, _, o)| o).collect();
        assert_eq!(owners, ['a', 'b']);
        assert!(queue.is_empty());
        assert_eq!(queue.next_deadline(), Deadline::Never);
    }
}
