//! Worker threads of the executor.
//!
//! Each worker keeps a local FIFO of green threads and steals from its peers
//! when it runs dry. Threads resumed out of the wait queue arrive through the
//! global injector.

use crate::{executor::ExecutorHandle, green::GreenThread};
use crossbeam_deque::{Steal, Stealer, Worker as DequeWorker};
use std::{
    io,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

/// A handle other threads use to steal from or wake a worker.
#[derive(Debug)]
pub struct WorkerHandle {
    pub id: usize,
    pub stealer: Stealer<Arc<GreenThread>>,
    /// Set while the worker is parked.
    pub idle: Arc<AtomicBool>,
    thread: thread::Thread,
}

impl WorkerHandle {
    pub fn wake(&self) {
        self.thread.unpark();
    }
}

pub struct Worker {
    pub id: usize,
    local_q: DequeWorker<Arc<GreenThread>>,
    executor_handle: Arc<OnceLock<Arc<ExecutorHandle>>>,
    idle: Arc<AtomicBool>,
}

impl Worker {
    /// Spawns the worker thread. It waits for `executor_handle` to be set
    /// before touching any queue.
    pub fn start(
        id: usize,
        executor_handle: Arc<OnceLock<Arc<ExecutorHandle>>>,
    ) -> io::Result<(WorkerHandle, JoinHandle<()>)> {
        let local_q: DequeWorker<Arc<GreenThread>> = DequeWorker::new_fifo();
        let stealer = local_q.stealer();

        let idle_flag = Arc::new(AtomicBool::new(false));
        let idle_flag_clone = idle_flag.clone();

        let join = thread::Builder::new()
            .name(format!("greenwait-worker-{id}"))
            .spawn(move || {
                let mut worker = Worker {
                    id,
                    idle: idle_flag_clone,
                    local_q,
                    executor_handle,
                };
                worker.run();
            })?;

        let handle = WorkerHandle {
            id,
            idle: idle_flag,
            stealer,
            thread: join.thread().clone(),
        };
        Ok((handle, join))
    }

    /// Local queue, then the injector, then stealing; park when all are empty.
    fn run(&mut self) {
        let executor_handle = self.executor_handle.wait().clone();

        loop {
            if executor_handle.is_stopping() {
                break;
            }

            if let Some(thread) = self.local_q.pop() {
                if thread.run(&executor_handle) {
                    self.local_q.push(thread);
                }
                continue;
            }

            while let Some(thread) = executor_handle.injector.pop() {
                self.local_q.push(thread);
            }

            if !self.local_q.is_empty() {
                continue;
            }

            self.steal(&executor_handle);

            if !self.local_q.is_empty() {
                continue;
            }

            self.idle.store(true, Ordering::Release);

            // Recheck to avoid a lost wakeup.
            if !self.local_q.is_empty()
                || !executor_handle.injector.is_empty()
                || executor_handle.is_stopping()
            {
                self.idle.store(false, Ordering::Release);
                continue;
            }

            thread::park();

            self.idle.store(false, Ordering::Release);
        }
    }

    fn steal(&self, executor_handle: &ExecutorHandle) {
        let num_workers = executor_handle.workers.len();
        let start = rand::random::<u32>() as usize % num_workers;
        for i in 0..num_workers {
            let victim = &executor_handle.workers[(start + i) % num_workers];
            if victim.id == self.id {
                continue;
            }
            match victim.stealer.steal_batch(&self.local_q) {
                Steal::Success(_) => break,
                Steal::Retry | Steal::Empty => continue,
            }
        }
    }
}
