//! The executor hosting green threads.
//!
//! A fixed pool of worker threads polls green threads from work-stealing
//! queues. A green thread resumed by the dispatcher lands in the global
//! injector and is picked up by whichever worker is free.

mod worker;

use self::worker::WorkerHandle;
use crate::green::GreenThread;
use crossbeam_queue::SegQueue;
use std::sync::OnceLock;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::thread::JoinHandle;

/// Shared state of the worker pool, reachable from every waker.
#[derive(Debug)]
pub struct ExecutorHandle {
    /// Global run queue; resumed and newly spawned threads land here.
    injector: SegQueue<Arc<GreenThread>>,
    workers: Vec<WorkerHandle>,
    /// Set once on shutdown; workers exit after their current poll.
    stopping: AtomicBool,
}

impl ExecutorHandle {
    pub fn enqueue(&self, thread: Arc<GreenThread>) {
        self.injector.push(thread);
        self.try_unpark_one();
    }

    pub fn try_unpark_one(&self) {
        for w in self.workers.iter() {
            if w.idle.swap(false, Ordering::Acquire) {
                w.wake();
                break;
            }
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Asks every worker to exit after its current poll.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        for w in self.workers.iter() {
            w.wake();
        }
    }
}

/// The worker pool and the join handles of its threads.
pub struct Executor {
    pub handle: Arc<ExecutorHandle>,
    joins: Vec<JoinHandle<()>>,
}

type SharedHandle = Arc<OnceLock<Arc<ExecutorHandle>>>;

impl Executor {
    pub fn new(num_workers: usize) -> std::io::Result<Self> {
        Self::start_with(num_workers, worker::Worker::start)
    }

    fn start_with<S>(num_workers: usize, mut start: S) -> std::io::Result<Self>
    where
        S: FnMut(usize, SharedHandle) -> std::io::Result<(WorkerHandle, JoinHandle<()>)>,
    {
        let num_workers = num_workers.max(1);
        let executor_handle: SharedHandle = Arc::new(OnceLock::new());

        let mut worker_handles = Vec::with_capacity(num_workers);
        let mut joins = Vec::with_capacity(num_workers);

        // Workers block until the shared handle is published below.
        for id in 0..num_workers {
            match start(id, executor_handle.clone()) {
                Ok((handle, join)) => {
                    worker_handles.push(handle);
                    joins.push(join);
                }
                Err(err) => {
                    // Publish a stopped handle so the workers already
                    // started see it and exit.
                    let _ = executor_handle.set(Arc::new(ExecutorHandle {
                        injector: SegQueue::new(),
                        workers: worker_handles,
                        stopping: AtomicBool::new(true),
                    }));
                    for join in joins {
                        if join.join().is_err() {
                            log::warn!("executor worker panicked");
                        }
                    }
                    return Err(err);
                }
            }
        }

        let handle = Arc::new(ExecutorHandle {
            injector: SegQueue::new(),
            workers: worker_handles,
            stopping: AtomicBool::new(false),
        });
        // Only this constructor sets the cell.
        let _ = executor_handle.set(handle.clone());

        Ok(Self { handle, joins })
    }

    /// Stops the workers and waits for them to exit.
    pub fn shutdown(&mut self) {
        self.handle.stop();
        for join in self.joins.drain(..) {
            if join.join().is_err() {
                log::warn!("executor worker panicked");
            }
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
