//! Runtime configuration.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::event_log::EventLog;

/// Upper bound on worker threads, whatever the machine reports.
const MAX_WORKERS: usize = 10;

/// Settings for [`Runtime::with_config`](crate::Runtime::with_config).
///
/// # Examples
///
/// ```ignore
/// let config = RuntimeConfig::default()
///     .max_poll_interval(Duration::from_millis(5))
///     .workers(2)
///     .event_log(EventLog::stderr(EventLevel::Events));
/// ```
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Longest a single blocking multiplex call may last.
    pub max_poll_interval: Duration,
    /// Number of executor worker threads running green threads.
    pub workers: usize,
    /// Serve Prometheus metrics on `127.0.0.1:<port>` when set.
    pub metrics_port: Option<u16>,
    /// Runtime event log shared with the wait queue.
    pub event_log: Option<Arc<EventLog>>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let workers = thread::available_parallelism().map_or(1, |n| n.get());
        Self {
            max_poll_interval: Duration::from_millis(10),
            workers: workers.clamp(1, MAX_WORKERS),
            metrics_port: None,
            event_log: None,
        }
    }
}

impl RuntimeConfig {
    pub fn max_poll_interval(mut self, interval: Duration) -> Self {
        self.max_poll_interval = interval;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.clamp(1, MAX_WORKERS);
        self
    }

    pub fn metrics_port(mut self, port: u16) -> Self {
        self.metrics_port = Some(port);
        self
    }

    pub fn event_log(mut self, log: Arc<EventLog>) -> Self {
        self.event_log = Some(log);
        self
    }
}
