//! Cooperative heartbeat scheduler
//!
//! A single tick loop wakes up every `tick_interval` and fires each
//! registered task whose next-fire time has elapsed. Firings are spawned as
//! independent units of work so a slow callback never delays the tick loop or
//! other tasks.
//!
//! The scheduler is an explicit value: clone the handle into every component
//! that needs to register work. All state lives on the runtime thread.

use crate::config::SchedulerConfig;
use crate::dispatch::{self, LocalTask, TaskOutcome};
use crate::error::{CoreError, Result};
use crate::id_gen::{TaskId, TaskIdGen};

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

type TaskCallback = Rc<dyn Fn() -> LocalTask>;

/// Per-task flags shared between the registry and in-flight firings
#[derive(Debug, Default)]
struct TaskState {
    cancelled: Cell<bool>,
    running: Cell<bool>,
    fired: Cell<u64>,
}

struct ScheduledTask {
    callback: TaskCallback,
    interval: Duration,
    next_fire: Instant,
    state: Rc<TaskState>,
}

#[derive(Default)]
struct Registry {
    tasks: BTreeMap<TaskId, ScheduledTask>,
    ids: TaskIdGen,
    ticks: u64,
    loop_started: bool,
    shut_down: bool,
}

struct SchedulerInner {
    config: SchedulerConfig,
    registry: RefCell<Registry>,
}

/// Handle to the heartbeat scheduler
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<SchedulerInner>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Create a scheduler with the default 100ms tick
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        Self {
            inner: Rc::new(SchedulerInner {
                config,
                registry: RefCell::new(Registry::default()),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Register a recurring task.
    ///
    /// `callback` first fires roughly `interval` after registration and then
    /// every `interval`. Must be called from inside the monoio runtime: the
    /// tick loop is started lazily on the first registration.
    pub fn register<F, Fut>(&self, callback: F, interval: Duration) -> Result<TaskId>
    where
        F: Fn() -> Fut + 'static,
        Fut: Future + 'static,
        Fut::Output: TaskOutcome,
    {
        if interval.is_zero() {
            return Err(CoreError::InvalidInterval(interval));
        }

        let callback: TaskCallback = Rc::new(move || dispatch::boxed(callback()));

        let (task_id, start_loop) = {
            let mut registry = self.inner.registry.borrow_mut();
            if registry.shut_down {
                return Err(CoreError::SchedulerShutdown);
            }

            let task_id = registry.ids.next_id();
            registry.tasks.insert(
                task_id,
                ScheduledTask {
                    callback,
                    interval,
                    next_fire: Instant::now() + interval,
                    state: Rc::new(TaskState::default()),
                },
            );

            let start_loop = !registry.loop_started;
            registry.loop_started = true;
            (task_id, start_loop)
        };

        debug!(task = %task_id, interval_ms = interval.as_millis() as u64, "registered task");

        if start_loop {
            self.start_tick_loop();
        }

        Ok(task_id)
    }

    /// Remove a task. Unknown or already removed ids are ignored.
    ///
    /// A firing that already started runs to completion; a firing that was
    /// dispatched but has not started yet is dropped.
    pub fn unregister(&self, task_id: TaskId) {
        let removed = self.inner.registry.borrow_mut().tasks.remove(&task_id);
        if let Some(task) = removed {
            task.state.cancelled.set(true);
            debug!(task = %task_id, fired = task.state.fired.get(), "unregistered task");
        }
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.inner.registry.borrow().tasks.contains_key(&task_id)
    }

    /// Number of times a task has started a firing
    pub fn fire_count(&self, task_id: TaskId) -> Option<u64> {
        self.inner
            .registry
            .borrow()
            .tasks
            .get(&task_id)
            .map(|task| task.state.fired.get())
    }

    pub fn len(&self) -> usize {
        self.inner.registry.borrow().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ticks performed since the loop started
    pub fn tick_count(&self) -> u64 {
        self.inner.registry.borrow().ticks
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.registry.borrow().shut_down
    }

    /// Stop the tick loop and drop every task.
    ///
    /// Terminal: later registrations fail with `SchedulerShutdown`.
    pub fn shutdown(&self) {
        let mut registry = self.inner.registry.borrow_mut();
        if registry.shut_down {
            return;
        }
        registry.shut_down = true;
        for task in registry.tasks.values() {
            task.state.cancelled.set(true);
        }
        let dropped = registry.tasks.len();
        registry.tasks.clear();
        info!(tasks = dropped, ticks = registry.ticks, "scheduler shut down");
    }

    fn start_tick_loop(&self) {
        let weak: Weak<SchedulerInner> = Rc::downgrade(&self.inner);
        let tick_interval = self.inner.config.tick_interval;

        info!(tick_ms = tick_interval.as_millis() as u64, "scheduler tick loop started");

        let _ = monoio::spawn(async move {
            loop {
                monoio::time::sleep(tick_interval).await;
                // Every handle dropped: nothing left to drive
                let Some(inner) = weak.upgrade() else { break };
                let scheduler = Scheduler { inner };
                if !scheduler.tick() {
                    break;
                }
            }
            trace!("scheduler tick loop exited");
        });
    }

    /// Run one tick: dispatch every due task.
    ///
    /// Returns `false` once the scheduler has been shut down.
    pub(crate) fn tick(&self) -> bool {
        let now = Instant::now();

        let due: Vec<(TaskId, TaskCallback, Rc<TaskState>)> = {
            let mut registry = self.inner.registry.borrow_mut();
            if registry.shut_down {
                return false;
            }

            registry.ticks += 1;
            let alive_every = self.inner.config.alive_log_interval;
            if alive_every > 0 && registry.ticks % alive_every == 0 {
                info!(ticks = registry.ticks, tasks = registry.tasks.len(), "scheduler alive");
            }

            registry
                .tasks
                .iter_mut()
                .filter(|(_, task)| task.next_fire <= now)
                .map(|(id, task)| {
                    task.next_fire = now + task.interval;
                    (*id, task.callback.clone(), task.state.clone())
                })
                .collect()
        };

        for (task_id, callback, state) in due {
            if state.running.get() {
                debug!(task = %task_id, "previous firing still running, skipping");
                continue;
            }
            state.running.set(true);

            let _ = monoio::spawn(async move {
                // Unregistered between dispatch and start
                if state.cancelled.get() {
                    state.running.set(false);
                    return;
                }
                state.fired.set(state.fired.get() + 1);
                dispatch::run_isolated(&task_id.to_string(), callback()).await;
                state.running.set(false);
            });
        }

        true
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.inner.registry.borrow();
        f.debug_struct("Scheduler")
            .field("tick_interval", &self.inner.config.tick_interval)
            .field("tasks", &registry.tasks.len())
            .field("ticks", &registry.ticks)
            .field("shut_down", &registry.shut_down)
            .finish()
    }
}
