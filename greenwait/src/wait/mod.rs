//! The wait subsystem: descriptors, the deadline-ordered queue, and the
//! shared I/O queue the dispatcher polls.

mod aggregate;
mod descriptor;
mod future;
mod io_queue;
mod queue;
mod signal;
mod slot;

pub use aggregate::Offsets;
pub use descriptor::{
    Deadline, IoWaitData, ReadySets, SetKind, WaitData, WaitDescriptor, WaitKind,
};
pub use future::{IoWait, wait_blocking};
pub use io_queue::{IoWaitQueue, Resumed, WakeReason};
pub use queue::{WaitHandle, WaitQueue};
pub use slot::{FD_MASK, FdSlot, READY_BIT};

pub(crate) use io_queue::{Cycle, PollOutcome, SlotEvent};
