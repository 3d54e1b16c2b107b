//! The green-thread runtime: executor workers, the wait queue, and the
//! dispatcher thread that services it.
//!
//! Handles are stored in thread-local storage so green threads can reach the
//! wait queue without threading it through every call.

use std::cell::RefCell;
use std::sync::Arc;
use std::task::Context;
use std::thread::{self, JoinHandle};
use std::{io, os::fd::RawFd};

use metrics::{counter, gauge};

use crate::config::RuntimeConfig;
use crate::dispatcher;
use crate::error::WaitError;
use crate::event_log::{EventLevel, record_event};
use crate::executor::{Executor, ExecutorHandle};
use crate::green::GreenThread;
use crate::wait::{Deadline, IoWait, IoWaitQueue};

thread_local! {
    static HANDLE: RefCell<Option<Arc<ExecutorHandle>>> = const { RefCell::new(None) };
    static QUEUE: RefCell<Option<Arc<IoWaitQueue>>> = const { RefCell::new(None) };
}

/// A running green-thread runtime.
///
/// Owns the executor workers, the I/O wait queue and the dispatcher thread
/// servicing it. Dropping the runtime shuts it down like
/// [`shutdown`](Runtime::shutdown).
pub struct Runtime {
    /// Worker pool polling green threads.
    executor: Executor,
    /// The queue every green thread of this runtime parks on.
    queue: Arc<IoWaitQueue>,
    /// Dispatcher thread; taken once the runtime stops.
    dispatcher: Option<JoinHandle<()>>,
    config: RuntimeConfig,
}

impl Runtime {
    /// Starts a runtime with the default configuration.
    pub fn new() -> io::Result<Self> {
        Self::with_config(RuntimeConfig::default())
    }

    /// Starts the dispatcher thread and the executor workers.
    ///
    /// Installs the Prometheus exporter first when `config.metrics_port` is
    /// set.
    ///
    /// # Arguments
    ///
    /// * `config` - Poll interval, worker count, metrics port and event log
    ///
    /// # Returns
    ///
    /// Returns `Ok(Runtime)` on success, or an IO error if a thread, the
    /// wake pipe or the exporter could not be set up.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let config = RuntimeConfig::default().workers(4);
    /// let runtime = Runtime::with_config(config)?;
    /// runtime.block_on(async {
    ///     greenwait::runtime::sleep_until(Deadline::after(Duration::from_millis(5))).await
    /// })?;
    /// ```
    pub fn with_config(config: RuntimeConfig) -> io::Result<Self> {
        if let Some(port) = config.metrics_port {
            metrics_exporter_prometheus::PrometheusBuilder::new()
                .with_http_listener(([127, 0, 0, 1], port))
                .install()
                .map_err(|e| WaitError::Metrics(e.to_string()))?;
            log::info!("metrics enabled at http://localhost:{port}/metrics");
        }

        let queue = IoWaitQueue::with_event_log(config.event_log.clone())?;
        let dispatcher = dispatcher::spawn(queue.clone(), config.max_poll_interval)?;
        let executor = Executor::new(config.workers)?;

        record_event!(
            config.event_log,
            EventLevel::Minimal,
            "runtime booted: {} workers, max poll interval {:?}",
            config.workers,
            config.max_poll_interval
        );

        let runtime = Self {
            executor,
            queue,
            dispatcher: Some(dispatcher),
            config,
        };
        runtime.enter();
        Ok(runtime)
    }

    /// Makes this runtime the current one for the calling thread. Worker
    /// threads pick it up whenever they poll one of its green threads.
    pub fn enter(&self) {
        enter_context(&self.executor.handle, &self.queue);
    }

    /// The wait queue this runtime's dispatcher services.
    pub fn io_queue(&self) -> &Arc<IoWaitQueue> {
        &self.queue
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Runs `fut` as a new green thread.
    ///
    /// # Arguments
    ///
    /// * `fut` - The future to spawn (must return `()`)
    ///
    /// # Examples
    ///
    /// ```ignore
    /// runtime.spawn(async {
    ///     let stream = TcpStream::connect(addr).await.unwrap();
    ///     stream.write_all(b"hello").await.unwrap();
    /// });
    /// ```
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        spawn_on(&self.executor.handle, &self.queue, fut);
    }

    /// Drives `fut` to completion on the calling OS thread, parking it while
    /// the future is pending.
    pub fn block_on<F>(&self, fut: F) -> F::Output
    where
        F: Future,
    {
        self.enter();
        let mut future = Box::pin(fut);
        let waker = crate::waker::unpark_waker(thread::current());
        let mut ctx = Context::from_waker(&waker);

        loop {
            match future.as_mut().poll(&mut ctx) {
                std::task::Poll::Ready(out) => break out,
                std::task::Poll::Pending => thread::park(),
            }
        }
    }

    /// Force-wakes every parked thread, then stops the dispatcher and the
    /// workers. Returns the number of threads force-woken.
    pub fn shutdown(mut self) -> usize {
        self.stop()
    }

    fn stop(&mut self) -> usize {
        let woken = self.queue.drain();
        if let Some(dispatcher) = self.dispatcher.take() {
            if dispatcher.join().is_err() {
                log::warn!("dispatcher thread panicked");
            }
        }
        self.executor.shutdown();
        record_event!(
            self.config.event_log,
            EventLevel::Minimal,
            "runtime stopped, {woken} threads force-woken"
        );
        woken
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if self.dispatcher.is_some() {
            self.stop();
        }
    }
}

fn enter_context(handle: &Arc<ExecutorHandle>, queue: &Arc<IoWaitQueue>) {
    HANDLE.with(|h| {
        let mut h = h.borrow_mut();
        if !h.as_ref().is_some_and(|cur| Arc::ptr_eq(cur, handle)) {
            *h = Some(handle.clone());
        }
    });
    QUEUE.with(|q| {
        let mut q = q.borrow_mut();
        if !q.as_ref().is_some_and(|cur| Arc::ptr_eq(cur, queue)) {
            *q = Some(queue.clone());
        }
    });
}

fn spawn_on<F>(handle: &Arc<ExecutorHandle>, queue: &Arc<IoWaitQueue>, fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    counter!("greenwait_threads_spawned_total").increment(1);
    gauge!("greenwait_threads_pending_current").increment(1.0);

    // A green thread may resume on any worker; make sure that worker has
    // the runtime context before each poll.
    let (h, q) = (handle.clone(), queue.clone());
    let mut fut = Box::pin(fut);
    let thread = GreenThread::new(Box::pin(futures::future::poll_fn(move |cx| {
        enter_context(&h, &q);
        fut.as_mut().poll(cx)
    })));
    handle.enqueue(thread);
}

/// Spawns a green thread from within a runtime context.
///
/// # Panics
///
/// Panics if called outside of a runtime context.
pub fn spawn<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let handle = HANDLE.with(|h| h.borrow().clone());
    let handle = handle.expect("greenwait: spawn called outside of a runtime context");
    spawn_on(&handle, &current_queue(), future);
}

/// The wait queue of the current runtime.
///
/// # Panics
///
/// Panics if called outside of a runtime context.
pub fn current_queue() -> Arc<IoWaitQueue> {
    QUEUE.with(|q| {
        q.borrow()
            .clone()
            .expect("greenwait: wait queue used outside of a runtime context")
    })
}

/// Waits until `fd` is readable or `deadline` passes.
pub fn readable(fd: RawFd, deadline: Deadline) -> IoWait {
    IoWait::readable(current_queue(), fd, deadline)
}

/// Waits until `fd` is writable or `deadline` passes.
pub fn writable(fd: RawFd, deadline: Deadline) -> IoWait {
    IoWait::writable(current_queue(), fd, deadline)
}

/// Parks the current green thread until `deadline`.
pub fn sleep_until(deadline: Deadline) -> IoWait {
    IoWait::sleep_until(current_queue(), deadline)
}
