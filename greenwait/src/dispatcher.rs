//! The dispatcher: one dedicated OS thread that polls every parked green
//! thread's descriptors in a single `poll(2)` call and resumes the ones that
//! became ready or ran out of time.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use libc::{c_int, c_short, nfds_t, pollfd};

use crate::wait::{Cycle, Deadline, IoWaitQueue, PollOutcome, SetKind, SlotEvent};

/// Timeout for one blocking call: the time left until `next_deadline`,
/// capped at `max_poll_interval`, never negative.
pub fn poll_timeout(
    next_deadline: Deadline,
    now: Instant,
    max_poll_interval: Duration,
) -> Duration {
    next_deadline
        .remaining(now)
        .map_or(max_poll_interval, |left| left.min(max_poll_interval))
}

/// Starts the dispatcher for `queue` on its own thread.
///
/// The thread exits once the queue is drained.
pub fn spawn(queue: Arc<IoWaitQueue>, max_poll_interval: Duration) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("greenwait-dispatcher".into())
        .spawn(move || run_dispatcher_loop(&queue, max_poll_interval))
}

/// The dispatch loop. Blocks only inside `poll(2)`, for at most
/// `max_poll_interval` per cycle.
pub fn run_dispatcher_loop(queue: &IoWaitQueue, max_poll_interval: Duration) {
    let mut fds: Vec<pollfd> = Vec::new();

    loop {
        let snapshot = match queue.prepare_cycle(max_poll_interval) {
            Cycle::Poll(snapshot) => snapshot,
            Cycle::Exit => break,
        };

        fds.clear();
        fds.push(pollfd {
            fd: snapshot.signal_fd,
            events: libc::POLLIN,
            revents: 0,
        });
        fds.extend(snapshot.slots.iter().map(|(slot, owner)| pollfd {
            fd: slot.fd(),
            events: interest(owner.kind),
            revents: 0,
        }));

        let outcome = match poll(&mut fds, snapshot.timeout) {
            Ok(0) => PollOutcome::Events(Vec::new()),
            Ok(_) => {
                let events = fds[1..]
                    .iter()
                    .zip(&snapshot.slots)
                    .filter_map(|(fd, (_, owner))| classify(fd.revents).map(|ev| (*owner, ev)))
                    .collect();
                PollOutcome::Events(events)
            }
            // Interrupted: still check deadlines, then poll again.
            Err(err) if err.kind() == io::ErrorKind::Interrupted => PollOutcome::Events(Vec::new()),
            Err(err) => PollOutcome::Failed(err),
        };

        log::trace!(
            "dispatch cycle over {} slots, timeout {:?}",
            snapshot.slots.len(),
            snapshot.timeout
        );
        queue.complete_cycle(outcome);
    }

    log::debug!("dispatcher exiting, queue drained");
}

fn interest(kind: SetKind) -> c_short {
    match kind {
        SetKind::Read => libc::POLLIN,
        SetKind::Write => libc::POLLOUT,
        SetKind::Except => libc::POLLPRI,
    }
}

/// Maps `revents` to a slot event. Errors and hangups count as ready: the
/// owner observes them on its next read or write.
fn classify(revents: c_short) -> Option<SlotEvent> {
    if revents & libc::POLLNVAL != 0 {
        Some(SlotEvent::Invalid)
    } else if revents != 0 {
        Some(SlotEvent::Ready)
    } else {
        None
    }
}

fn poll(fds: &mut [pollfd], timeout: Duration) -> io::Result<usize> {
    // Round up so a sub-millisecond remainder doesn't turn into a busy loop.
    let millis = timeout.as_nanos().div_ceil(1_000_000).min(c_int::MAX as u128) as c_int;

    // SAFETY: `fds` is a valid, exclusively borrowed array of `fds.len()`
    // pollfd structs for the duration of the call.
    let res = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as nfds_t, millis) };
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_capped_and_clamped() {
        let now = Instant::now();
        let max = Duration::from_millis(10);

        assert_eq!(poll_timeout(Deadline::Never, now, max), max);
        assert_eq!(
            poll_timeout(Deadline::At(now + Duration::from_millis(3)), now, max),
            Duration::from_millis(3)
        );
        assert_eq!(
            poll_timeout(Deadline::At(now + Duration::from_secs(5)), now, max),
            max
        );
        assert_eq!(
            poll_timeout(Deadline::At(now), now + Duration::from_millis(1), max),
            Duration::ZERO
        );
    }

    #[test]
    fn revents_classification() {
        assert_eq!(classify(0), None);
        assert_eq!(classify(libc::POLLIN), Some(SlotEvent::Ready));
        assert_eq!(classify(libc::POLLHUP), Some(SlotEvent::Ready));
        assert_eq!(classify(libc::POLLERR | libc::POLLOUT), Some(SlotEvent::Ready));
        assert_eq!(classify(libc::POLLNVAL), Some(SlotEvent::Invalid));
    }

    #[test]
    fn interest_per_set() {
        assert_eq!(interest(SetKind::Read), libc::POLLIN);
        assert_eq!(interest(SetKind::Write), libc::POLLOUT);
        assert_eq!(interest(SetKind::Except), libc::POLLPRI);
    }
}
