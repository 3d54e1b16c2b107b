//! Leveled runtime event log.
//!
//! An [`EventLog`] is created once at startup and handed to whatever needs to
//! record runtime events. Before that point there simply is no handle, so
//! callers hold an `Option<Arc<EventLog>>` and logging before boot is a
//! no-op.

use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

/// How much the event log records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventLevel {
    /// Record nothing.
    Off = 0,
    /// Startup and exit only.
    Minimal = 1,
    /// Interesting runtime events.
    Events = 2,
    /// Everything, including every dispatch cycle that resumed a thread.
    Verbose = 3,
}

/// A leveled log of runtime events, written one whole line at a time.
///
/// Each record is `"<ms since boot> <message>"`. Writers on different
/// threads never interleave within a line.
pub struct EventLog {
    /// Most detailed level recorded.
    level: EventLevel,
    /// Timestamps are relative to this instant.
    boot: Instant,
    // One lock per record so concurrent writers never interleave.
    sink: Mutex<Box<dyn Write + Send>>,
}

impl EventLog {
    /// Creates the log, stamping the boot instant now.
    ///
    /// # Arguments
    ///
    /// * `level` - Most detailed level to record
    /// * `sink` - Destination for the formatted lines
    pub fn new(level: EventLevel, sink: Box<dyn Write + Send>) -> Arc<Self> {
        Arc::new(Self {
            level,
            boot: Instant::now(),
            sink: Mutex::new(sink),
        })
    }

    /// An event log writing to standard error.
    pub fn stderr(level: EventLevel) -> Arc<Self> {
        Self::new(level, Box::new(io::stderr()))
    }

    pub fn level(&self) -> EventLevel {
        self.level
    }

    /// Whether a record at `level` would be written.
    pub fn enabled(&self, level: EventLevel) -> bool {
        level != EventLevel::Off && level <= self.level
    }

    /// Writes `"<ms since boot> <event>"` if `level` is enabled.
    pub fn record(&self, level: EventLevel, event: fmt::Arguments<'_>) {
        if !self.enabled(level) {
            return;
        }
        let elapsed = self.boot.elapsed().as_millis();
        let mut sink = self.sink.lock();
        if let Err(err) = writeln!(sink, "{elapsed} {event}") {
            log::warn!("event log write failed: {err}");
        }
    }

    pub fn flush(&self) -> io::Result<()> {
        self.sink.lock().flush()
    }
}

impl fmt::Debug for EventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLog")
            .field("level", &self.level)
            .finish_non_exhaustive()
    }
}

/// Records into an optional event log; does nothing when the log is absent.
macro_rules! record_event {
    ($log:expr, $level:expr, $($arg:tt)+) => {
        if let Some(log) = $log.as_ref() {
            log.record($level, format_args!($($arg)+));
        }
    };
}

pub(crate) use record_event;

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn filters_by_level() {
        let out = Shared::default();
        let log = EventLog::new(EventLevel::Events, Box::new(out.clone()));
        log.record(EventLevel::Minimal, format_args!("boot"));
        log.record(EventLevel::Verbose, format_args!("noise"));
        log.record(EventLevel::Off, format_args!("never"));

        let text = String::from_utf8(out.0.lock().clone()).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.trim_end().ends_with(" boot"));
    }

    #[test]
    fn concurrent_records_stay_whole() {
        let out = Shared::default();
        let log = EventLog::new(EventLevel::Verbose, Box::new(out.clone()));

        let writers: Vec<_> = (0..4)
            .map(|id| {
                let log = log.clone();
                thread::spawn(move || {
                    for n in 0..50 {
                        log.record(EventLevel::Events, format_args!("writer {id} event {n}"));
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let text = String::from_utf8(out.0.lock().clone()).unwrap();
        assert_eq!(text.lines().count(), 200);
        for line in text.lines() {
            let mut parts = line.splitn(2, ' ');
            assert!(parts.next().unwrap().parse::<u128>().is_ok());
            assert!(parts.next().unwrap().starts_with("writer "));
        }
    }

    #[test]
    fn absent_log_is_noop() {
        let log: Option<Arc<EventLog>> = None;
        record_event!(log, EventLevel::Minimal, "dropped {}", 1);
    }
}
