//! # tickstream core
//!
//! Cooperative scheduling runtime for streaming clients.
//!
//! ## Architecture
//!
//! 1. **Single-threaded async with monoio** - one cooperative thread of control
//! 2. **Heartbeat scheduler** - recurring tasks fired from a single tick loop
//! 3. **One-shot tasks** - immediate or delayed work with isolated failures
//! 4. **Unified logging** - tracing, optionally backed by ftlog

pub mod config;
pub mod cpu;
pub mod dispatch;
pub mod error;
pub mod id_gen;
pub mod logging;
pub mod runtime;
pub mod scheduler;
pub mod tasks;
pub mod timing;

// Re-export commonly used items
pub use config::{LogConfig, SchedulerConfig};
pub use dispatch::{spawn_isolated, LocalTask, TaskOutcome};
pub use error::{CoreError, Result};
pub use id_gen::{SessionId, TaskId};
pub use logging::{init_default_logging, init_logging};
pub use runtime::{RuntimeConfig, TickRuntime};
pub use scheduler::Scheduler;
pub use tasks::{LoopRunTask, SingleTask};
pub use timing::{nanos, PerfTimer, Timestamp};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{LogConfig, SchedulerConfig};
    pub use crate::error::CoreError;
    pub use crate::id_gen::{SessionId, TaskId};
    pub use crate::logging::{init_default_logging, init_logging};
    pub use crate::runtime::{RuntimeConfig, TickRuntime};
    pub use crate::scheduler::Scheduler;
    pub use crate::tasks::{LoopRunTask, SingleTask};
    pub use crate::timing::{nanos, PerfTimer, Timestamp};

    pub use monoio;
}
