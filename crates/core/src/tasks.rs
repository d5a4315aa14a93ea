//! Task façade over the scheduler
//!
//! 1. `LoopRunTask`: recurring work registered with a [`Scheduler`].
//! 2. `SingleTask`: one-shot work, either immediately or after a delay.
//!
//! Every unit of work is a closure returning a future. Synchronous work is
//! simply a closure whose future is already complete, so callers never tell
//! the runtime which kind they hand over.

use crate::dispatch::{self, TaskOutcome};
use crate::error::Result;
use crate::id_gen::TaskId;
use crate::scheduler::Scheduler;

use std::future::Future;
use std::time::Duration;
use tracing::trace;

/// Recurring task registration
#[derive(Debug, Clone)]
pub struct LoopRunTask {
    scheduler: Scheduler,
}

impl LoopRunTask {
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }

    /// Register `func` to run every `interval`
    pub fn register<F, Fut>(&self, func: F, interval: Duration) -> Result<TaskId>
    where
        F: Fn() -> Fut + 'static,
        Fut: Future + 'static,
        Fut::Output: TaskOutcome,
    {
        self.scheduler.register(func, interval)
    }

    pub fn unregister(&self, task_id: TaskId) {
        self.scheduler.unregister(task_id);
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}

/// One-shot task execution
pub struct SingleTask;

impl SingleTask {
    /// Start `fut` concurrently and return immediately
    pub fn run<F>(fut: F)
    where
        F: Future + 'static,
        F::Output: TaskOutcome,
    {
        dispatch::spawn_isolated("single-task", fut);
    }

    /// Start `func` once `delay` has elapsed, without blocking the caller.
    ///
    /// A zero delay still defers `func` until the caller yields.
    pub fn call_later<F, Fut>(delay: Duration, func: F)
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future + 'static,
        Fut::Output: TaskOutcome,
    {
        dispatch::spawn_isolated("delayed-task", async move {
            if !delay.is_zero() {
                monoio::time::sleep(delay).await;
            }
            trace!(delay_ms = delay.as_millis() as u64, "delayed task starting");
            func().await
        });
    }
}
