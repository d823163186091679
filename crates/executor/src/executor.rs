//! Parallel executor with cooperative stealing.
//!
//! Given a task list, tasks 2..N go to the scheduler and task 1 runs on the
//! calling thread. The caller then walks the list again: any task a worker
//! has not picked up yet is executed right here (cooperative steal), then
//! awaited. This bounds the worst case at the sequential total, which is
//! what matters when the workers are saturated.

use std::sync::Arc;

use tracing::error;

use quiver_core::error::{Error, Result};

use crate::scheduler::Scheduler;
use crate::task::{TaskExt, TaskRef, TaskStatus};

/// Task-list executor bound to a scheduler.
pub struct Executor {
    scheduler: Arc<Scheduler>,
}

impl Executor {
    /// Executor over the given scheduler.
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Executor { scheduler }
    }

    /// Executor over the process-global scheduler.
    pub fn with_global_scheduler() -> Self {
        Executor::new(Scheduler::global())
    }

    /// Run a single task inline.
    pub fn execute_task(&self, task: &TaskRef) -> Result<()> {
        task.core().mark_scheduled();
        task.run_once()
    }

    /// Run a task list; returns the first non-ok exit status in task order.
    ///
    /// A task that never advanced past `INITIALIZED` (scheduler refused it)
    /// yields `ScheduleError` in its slot.
    pub fn execute_tasks(&self, tasks: &[TaskRef]) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }

        // Keep the head task; hand the rest to the workers
        let mut scheduled_all = true;
        for task in &tasks[1..] {
            if let Err(err) = self.scheduler.schedule(task.clone()) {
                // Remaining tasks stay INITIALIZED; wait_finish surfaces that
                error!(code = err.code(), "can't schedule task to run");
                scheduled_all = false;
                break;
            }
        }

        if scheduled_all {
            // Head task runs inline; its exit status is collected below
            let _ = self.execute_task(&tasks[0]);
        }

        self.wait_finish(tasks)
    }

    fn wait_finish(&self, tasks: &[TaskRef]) -> Result<()> {
        let mut first_error: Option<Error> = None;

        for task in tasks {
            if task.status() == TaskStatus::Initialized {
                // Never reached a scheduler; keep reclaiming the others
                first_error.get_or_insert(Error::ScheduleError);
                continue;
            }
            // Steal the task if no worker picked it up yet, then wait for
            // whoever runs it
            let _ = task.run_once();
            let exit = task.wait_finish();
            if let Err(err) = exit {
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
