//! Per-thread wait descriptors.
//!
//! A green thread builds a [`WaitDescriptor`] right before it yields, hands it
//! to the wait queue, and gets it back (with ready bits filled in) when the
//! dispatcher resumes it.

use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use super::slot::FdSlot;

/// Absolute point on the monotonic clock after which a wait is abandoned.
///
/// `Never` sorts after every finite deadline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Deadline {
    At(Instant),
    Never,
}

impl Deadline {
    /// A deadline `timeout` from now. Saturates to `Never` on overflow.
    pub fn after(timeout: Duration) -> Self {
        Instant::now()
            .checked_add(timeout)
            .map_or(Deadline::Never, Deadline::At)
    }

    pub fn is_elapsed(&self, now: Instant) -> bool {
        match self {
            Deadline::At(at) => *at <= now,
            Deadline::Never => false,
        }
    }

    /// Time left until the deadline, zero if already elapsed, `None` for `Never`.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        match self {
            Deadline::At(at) => Some(at.saturating_duration_since(now)),
            Deadline::Never => None,
        }
    }
}

impl From<Instant> for Deadline {
    fn from(at: Instant) -> Self {
        Deadline::At(at)
    }
}

/// Which of the three interest sets a slot belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SetKind {
    Read,
    Write,
    Except,
}

impl SetKind {
    pub const ALL: [SetKind; 3] = [SetKind::Read, SetKind::Write, SetKind::Except];

    pub(crate) fn index(self) -> usize {
        match self {
            SetKind::Read => 0,
            SetKind::Write => 1,
            SetKind::Except => 2,
        }
    }
}

/// Interest sets of an I/O wait. An empty `Vec` means no interest in that
/// direction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IoWaitData {
    /// Descriptors to watch for readability.
    read: Vec<FdSlot>,
    /// Descriptors to watch for writability.
    write: Vec<FdSlot>,
    /// Descriptors to watch for exceptional conditions.
    except: Vec<FdSlot>,
}

impl IoWaitData {
    pub fn set(&self, kind: SetKind) -> &[FdSlot] {
        match kind {
            SetKind::Read => &self.read,
            SetKind::Write => &self.write,
            SetKind::Except => &self.except,
        }
    }

    fn set_mut(&mut self, kind: SetKind) -> &mut Vec<FdSlot> {
        match kind {
            SetKind::Read => &mut self.read,
            SetKind::Write => &mut self.write,
            SetKind::Except => &mut self.except,
        }
    }

    /// Total number of slots over all three sets.
    pub fn slot_count(&self) -> usize {
        self.read.len() + self.write.len() + self.except.len()
    }

    fn mark_all_ready(&mut self) {
        for kind in SetKind::ALL {
            self.set_mut(kind).iter_mut().for_each(FdSlot::mark_ready);
        }
    }

    fn clear_ready(&mut self) {
        for kind in SetKind::ALL {
            self.set_mut(kind).iter_mut().for_each(FdSlot::clear_ready);
        }
    }
}

/// The reason a thread is parked, with its variant-specific payload.
///
/// Queue code that needs per-variant behavior matches on this; adding a
/// variant makes every such match fail to compile until it handles the new
/// case.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WaitData {
    /// Waiting for descriptor readiness.
    Io(IoWaitData),
    /// Waiting for the deadline only.
    Sleep,
}

/// Variant tag of [`WaitData`], used as the `kind` metric label.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WaitKind {
    Io,
    Sleep,
}

impl WaitKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WaitKind::Io => "io",
            WaitKind::Sleep => "sleep",
        }
    }
}

impl WaitData {
    pub fn kind(&self) -> WaitKind {
        match self {
            WaitData::Io(_) => WaitKind::Io,
            WaitData::Sleep => WaitKind::Sleep,
        }
    }
}

/// Which interest sets had at least one ready slot when the thread was
/// resumed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReadySets {
    pub read: bool,
    pub write: bool,
    pub except: bool,
}

impl ReadySets {
    pub fn any(&self) -> bool {
        self.read || self.write || self.except
    }
}

/// One thread's readiness interest and deadline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WaitDescriptor {
    /// When the wait gives up; `Never` waits indefinitely.
    deadline: Deadline,
    /// Why the thread is parked.
    data: WaitData,
}

impl WaitDescriptor {
    /// An I/O wait with empty interest sets.
    pub fn new(deadline: Deadline) -> Self {
        Self {
            deadline,
            data: WaitData::Io(IoWaitData::default()),
        }
    }

    /// A deadline-only wait.
    pub fn sleep(deadline: Deadline) -> Self {
        Self {
            deadline,
            data: WaitData::Sleep,
        }
    }

    pub fn watch_read(&mut self, fd: RawFd) -> &mut Self {
        self.watch(SetKind::Read, fd)
    }

    pub fn watch_write(&mut self, fd: RawFd) -> &mut Self {
        self.watch(SetKind::Write, fd)
    }

    pub fn watch_except(&mut self, fd: RawFd) -> &mut Self {
        self.watch(SetKind::Except, fd)
    }

    /// Adds `fd` to the `kind` interest set. Turns a sleep into an I/O wait.
    pub fn watch(&mut self, kind: SetKind, fd: RawFd) -> &mut Self {
        if let WaitData::Sleep = self.data {
            self.data = WaitData::Io(IoWaitData::default());
        }
        if let WaitData::Io(io) = &mut self.data {
            io.set_mut(kind).push(FdSlot::new(fd));
        }
        self
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    pub fn data(&self) -> &WaitData {
        &self.data
    }

    pub fn kind(&self) -> WaitKind {
        self.data.kind()
    }

    pub fn set(&self, kind: SetKind) -> &[FdSlot] {
        match &self.data {
            WaitData::Io(io) => io.set(kind),
            WaitData::Sleep => &[],
        }
    }

    pub fn read_set(&self) -> &[FdSlot] {
        self.set(SetKind::Read)
    }

    pub fn write_set(&self) -> &[FdSlot] {
        self.set(SetKind::Write)
    }

    pub fn except_set(&self) -> &[FdSlot] {
        self.set(SetKind::Except)
    }

    pub fn slot_count(&self) -> usize {
        match &self.data {
            WaitData::Io(io) => io.slot_count(),
            WaitData::Sleep => 0,
        }
    }

    /// Sets the ready flag on every slot of all three sets.
    ///
    /// Used to force a wakeup outside the polling protocol, e.g. at shutdown
    /// when the dispatcher may no longer run. Raw descriptor numbers are left
    /// untouched; calling it again changes nothing.
    pub fn mark_all_ready(&mut self) {
        match &mut self.data {
            WaitData::Io(io) => io.mark_all_ready(),
            WaitData::Sleep => {}
        }
    }

    pub fn any_ready(&self) -> bool {
        self.ready_sets().any()
    }

    pub fn ready_sets(&self) -> ReadySets {
        let ready = |kind| self.set(kind).iter().any(|slot: &FdSlot| slot.is_ready());
        ReadySets {
            read: ready(SetKind::Read),
            write: ready(SetKind::Write),
            except: ready(SetKind::Except),
        }
    }

    pub(crate) fn slot_mut(&mut self, kind: SetKind, index: usize) -> Option<&mut FdSlot> {
        match &mut self.data {
            WaitData::Io(io) => io.set_mut(kind).get_mut(index),
            WaitData::Sleep => None,
        }
    }

    pub(crate) fn clear_ready(&mut self) {
        match &mut self.data {
            WaitData::Io(io) => io.clear_ready(),
            WaitData::Sleep => {}
        }
    }
}
