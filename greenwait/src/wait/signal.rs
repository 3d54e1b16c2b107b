use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};

use mio::unix::pipe;

/// Self-pipe that interrupts the dispatcher's blocking multiplex call.
///
/// The read end sits in slot 0 of every poll set.
pub(crate) struct Signal {
    tx: pipe::Sender,
    rx: pipe::Receiver,
}

impl Signal {
    pub fn new() -> io::Result<Self> {
        // Both ends come back nonblocking.
        let (tx, rx) = pipe::new()?;
        Ok(Self { tx, rx })
    }

    pub fn notify(&self) {
        match (&self.tx).write(&[1]) {
            Ok(_) => {}
            // A full pipe already guarantees a wakeup.
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => log::warn!("failed to signal dispatcher: {err}"),
        }
    }

    /// Empties the pipe so the next poll blocks again.
    pub fn clear(&self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.rx).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }

    pub fn fd(&self) -> RawFd {
        self.rx.as_raw_fd()
    }
}
