//! Bounded-concurrency task queue over a fixed worker pool.
//!
//! Workers are plain threads named `quiver-sched-N`. `schedule` refuses
//! tasks once shut down or when the queue is at capacity. One process-global
//! instance backs every read query's fan-out; services that need isolated
//! workers (background flush/optimize) construct their own.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use quiver_core::error::{Error, Result};

use crate::task::{TaskExt, TaskRef};

const DEFAULT_QUEUE_DEPTH: usize = 4096;

struct SchedulerInner {
    queue: Mutex<VecDeque<TaskRef>>,
    work_ready: Condvar,
    shutdown: Mutex<bool>,
    max_queue_depth: usize,
}

/// Fixed-pool work queue.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    concurrency: usize,
}

impl Scheduler {
    /// Pool with `concurrency` workers; 0 means hardware concurrency.
    pub fn new(concurrency: usize) -> Self {
        Self::with_queue_depth(concurrency, DEFAULT_QUEUE_DEPTH)
    }

    /// Pool with an explicit queue bound.
    pub fn with_queue_depth(concurrency: usize, max_queue_depth: usize) -> Self {
        let concurrency = if concurrency == 0 {
            Self::host_concurrency()
        } else {
            concurrency
        };
        let inner = Arc::new(SchedulerInner {
            queue: Mutex::new(VecDeque::new()),
            work_ready: Condvar::new(),
            shutdown: Mutex::new(false),
            max_queue_depth,
        });

        let mut workers = Vec::with_capacity(concurrency);
        for i in 0..concurrency {
            let inner = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name(format!("quiver-sched-{i}"))
                .spawn(move || worker_loop(inner))
                .expect("failed to spawn scheduler worker");
            workers.push(handle);
        }

        Scheduler {
            inner,
            workers: Mutex::new(workers),
            concurrency,
        }
    }

    /// Number of workers.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Hardware concurrency of the host.
    pub fn host_concurrency() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    /// Process-global scheduler shared by all query fan-out.
    pub fn global() -> Arc<Scheduler> {
        static GLOBAL: Lazy<Arc<Scheduler>> = Lazy::new(|| Arc::new(Scheduler::new(0)));
        GLOBAL.clone()
    }

    /// Enqueue a task. The task moves to `SCHEDULED`; a worker (or a
    /// cooperative stealer) will run it.
    pub fn schedule(&self, task: TaskRef) -> Result<()> {
        {
            let shutdown = self.inner.shutdown.lock();
            if *shutdown {
                return Err(Error::ScheduleError);
            }
            let mut queue = self.inner.queue.lock();
            if queue.len() >= self.inner.max_queue_depth {
                return Err(Error::ScheduleError);
            }
            // A refused task must stay INITIALIZED; the state flips only
            // once the queue accepts it
            if !task.core().mark_scheduled() {
                debug!(name = task.core().name(), "task was already scheduled");
                return Err(Error::ScheduleError);
            }
            queue.push_back(task);
        }
        self.inner.work_ready.notify_one();
        Ok(())
    }

    /// Stop accepting work and join the workers. Queued tasks still run.
    pub fn stop(&self) {
        {
            let mut shutdown = self.inner.shutdown.lock();
            *shutdown = true;
        }
        self.inner.work_ready.notify_all();
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(inner: Arc<SchedulerInner>) {
    loop {
        let task = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(task) = queue.pop_front() {
                    break Some(task);
                }
                if *inner.shutdown.lock() {
                    break None;
                }
                inner.work_ready.wait(&mut queue);
            }
        };
        match task {
            Some(task) => {
                // Errors live in the task's exit status; waiters observe them
                let _ = task.run_once();
            }
            None => return,
        }
    }
}
