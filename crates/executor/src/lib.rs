//! Task scheduling and parallel execution.
//!
//! Three pieces:
//! - Task: a named unit of work with an idempotent `run_once` and a
//!   `wait_finish` barrier
//! - Scheduler: bounded-concurrency work queue over a fixed worker pool
//! - Executor: fans a task list out to the scheduler, runs the head task
//!   inline, steals unstarted tasks cooperatively, aggregates the first error
//!
//! Background services also reuse `WaitNotifier` for cancellable sleeps.

#![warn(clippy::all)]

pub mod executor;
pub mod notifier;
pub mod scheduler;
pub mod task;

pub use executor::Executor;
pub use notifier::WaitNotifier;
pub use scheduler::Scheduler;
pub use task::{ClosureTask, Task, TaskExt, TaskRef, TaskStatus};
