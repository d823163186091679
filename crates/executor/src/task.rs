//! Tasks: the unit scheduled by the executor.
//!
//! A task moves through `INITIALIZED → SCHEDULED → RUNNING → FINISHED`.
//! `run_once` executes the payload exactly once no matter how many threads
//! enter it; losers of the race return immediately. `wait_finish` blocks
//! until `FINISHED` and returns the exit status, which stays observable for
//! every later caller.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use quiver_core::error::{Error, Result};

/// Shared task handle.
pub type TaskRef = Arc<dyn Task>;

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskStatus {
    /// Constructed, not yet accepted by a scheduler
    Initialized = 0,
    /// Accepted by a scheduler, waiting for a worker
    Scheduled = 1,
    /// Payload executing
    Running = 2,
    /// Payload done, exit status recorded
    Finished = 3,
}

impl TaskStatus {
    fn from_u8(v: u8) -> TaskStatus {
        match v {
            1 => TaskStatus::Scheduled,
            2 => TaskStatus::Running,
            3 => TaskStatus::Finished,
            _ => TaskStatus::Initialized,
        }
    }
}

/// State shared by every task implementation.
pub struct TaskCore {
    name: String,
    state: AtomicU8,
    exit: Mutex<Option<Error>>,
    done: Mutex<bool>,
    finished: Condvar,
}

impl TaskCore {
    /// Named core in `Initialized`.
    pub fn new(name: impl Into<String>) -> Self {
        TaskCore {
            name: name.into(),
            state: AtomicU8::new(TaskStatus::Initialized as u8),
            exit: Mutex::new(None),
            done: Mutex::new(false),
            finished: Condvar::new(),
        }
    }

    /// Task name, used in logs and worker traces.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    pub fn status(&self) -> TaskStatus {
        TaskStatus::from_u8(self.state.load(Ordering::Acquire))
    }

    fn try_enter_running(&self) -> bool {
        for from in [TaskStatus::Scheduled, TaskStatus::Initialized] {
            if self
                .state
                .compare_exchange(
                    from as u8,
                    TaskStatus::Running as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return true;
            }
        }
        false
    }

    /// Mark accepted by a scheduler. Fails when the task already left
    /// `Initialized`.
    pub(crate) fn mark_scheduled(&self) -> bool {
        self.state
            .compare_exchange(
                TaskStatus::Initialized as u8,
                TaskStatus::Scheduled as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn finish(&self, result: Result<()>) {
        *self.exit.lock() = result.err();
        self.state
            .store(TaskStatus::Finished as u8, Ordering::Release);
        let mut done = self.done.lock();
        *done = true;
        self.finished.notify_all();
    }
}

/// A schedulable unit of work.
pub trait Task: Send + Sync {
    /// Shared state.
    fn core(&self) -> &TaskCore;

    /// The payload. Runs at most once per task.
    fn execute(&self) -> Result<()>;
}

/// Blanket operations over any task.
pub trait TaskExt {
    /// Execute the payload if no other thread has; otherwise return `Ok`
    /// immediately. Returns the payload result when this call ran it.
    fn run_once(&self) -> Result<()>;

    /// Block until the task finishes; returns the recorded exit status.
    fn wait_finish(&self) -> Result<()>;

    /// Current state.
    fn status(&self) -> TaskStatus;

    /// Exit status after finish; `Ok` while unfinished.
    fn exit_status(&self) -> Result<()>;
}

impl<T: Task + ?Sized> TaskExt for T {
    fn run_once(&self) -> Result<()> {
        if !self.core().try_enter_running() {
            return Ok(());
        }
        let result = self.execute();
        self.core().finish(result.clone());
        result
    }

    fn wait_finish(&self) -> Result<()> {
        let core = self.core();
        let mut done = core.done.lock();
        while !*done {
            core.finished.wait(&mut done);
        }
        drop(done);
        self.exit_status()
    }

    fn status(&self) -> TaskStatus {
        self.core().status()
    }

    fn exit_status(&self) -> Result<()> {
        match self.core().exit.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Task wrapping a closure; used by the background loops and the tests.
pub struct ClosureTask {
    core: TaskCore,
    payload: Box<dyn Fn() -> Result<()> + Send + Sync>,
}

impl ClosureTask {
    /// Wrap `payload` under `name`.
    pub fn new<F>(name: impl Into<String>, payload: F) -> Arc<Self>
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        Arc::new(ClosureTask {
            core: TaskCore::new(name),
            payload: Box::new(payload),
        })
    }
}

impl Task for ClosureTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn execute(&self) -> Result<()> {
        (self.payload)()
    }
}
