use std::io;

use thiserror::Error;

/// Errors surfaced by the wait subsystem and the runtime around it.
#[derive(Error, Debug)]
pub enum WaitError {
    /// The queue is shutting down and accepts no new waits.
    #[error("wait queue is draining")]
    Draining,
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("metrics exporter: {0}")]
    Metrics(String),
}

impl From<WaitError> for io::Error {
    fn from(err: WaitError) -> Self {
        match err {
            WaitError::Io(err) => err,
            WaitError::Draining => io::Error::new(io::ErrorKind::BrokenPipe, err),
            WaitError::Metrics(_) => io::Error::other(err),
        }
    }
}

pub type Result<T, E = WaitError> = std::result::Result<T, E>;
