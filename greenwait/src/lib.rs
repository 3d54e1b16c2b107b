//! I/O readiness waiting for a green-thread runtime.
//!
//! Green threads about to block on a file descriptor publish their interest
//! into a shared wait queue and yield; one dispatcher thread merges every
//! waiter's descriptors into a single `poll(2)` call and resumes exactly the
//! threads whose descriptors became ready or whose deadline passed.
//!
//! - [`wait`]: wait descriptors, the deadline-ordered queue, the shared I/O
//!   queue and the [`IoWait`](wait::IoWait) suspension future
//! - [`dispatcher`]: the polling loop
//! - [`shutdown`]: the process-wide drain hook
//! - [`runtime`]: the executor, queue and dispatcher wired together
//! - [`net`]: TCP types that wait through the queue

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event_log;
pub mod executor;
pub mod green;
pub mod net;
pub mod runtime;
pub mod shutdown;
pub mod wait;
pub mod waker;

pub use config::RuntimeConfig;
pub use error::WaitError;
pub use runtime::{Runtime, spawn};
pub use wait::{Deadline, IoWaitQueue, WaitDescriptor, WakeReason};

pub use greenwait_macros::main;
