//! Isolated dispatch of units of work
//!
//! Every callback the runtime fires (scheduler ticks, one-shot tasks,
//! connection handlers) goes through this boundary. Errors and panics raised
//! by the work are logged here and never reach the scheduler loop.

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use tracing::{error, trace};

/// Boxed, non-`Send` unit of work
pub type LocalTask = Pin<Box<dyn Future<Output = anyhow::Result<()>>>>;

/// Output types accepted from scheduled work.
///
/// Infallible work returns `()`, fallible work returns any `Result<(), E>`
/// whose error converts into `anyhow::Error`.
pub trait TaskOutcome {
    fn into_result(self) -> anyhow::Result<()>;
}

impl TaskOutcome for () {
    fn into_result(self) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<E> TaskOutcome for std::result::Result<(), E>
where
    E: Into<anyhow::Error>,
{
    fn into_result(self) -> anyhow::Result<()> {
        self.map_err(Into::into)
    }
}

/// Box a future into a [`LocalTask`], normalizing its outcome
pub fn boxed<F>(fut: F) -> LocalTask
where
    F: Future + 'static,
    F::Output: TaskOutcome,
{
    Box::pin(async move { fut.await.into_result() })
}

/// Spawn `fut` on the current runtime as an independent unit of work.
///
/// Returns immediately; the work starts once the caller yields.
pub fn spawn_isolated<F>(label: impl Into<String>, fut: F)
where
    F: Future + 'static,
    F::Output: TaskOutcome,
{
    let label = label.into();
    // Detached: dropping the handle does not cancel the task
    let _ = monoio::spawn(async move {
        run_isolated(&label, fut).await;
    });
}

/// Drive `fut` to completion, logging any error or panic.
///
/// Returns `true` when the work completed successfully.
pub async fn run_isolated<F>(label: &str, fut: F) -> bool
where
    F: Future,
    F::Output: TaskOutcome,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(outcome) => match outcome.into_result() {
            Ok(()) => {
                trace!(task = label, "task completed");
                true
            }
            Err(e) => {
                error!(task = label, "task failed: {:#}", e);
                false
            }
        },
        Err(panic) => {
            error!(task = label, "task panicked: {}", panic_message(panic.as_ref()));
            false
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
