//! Identifier types
//!
//! Task ids are sequential per scheduler; session ids are short nanoids used
//! to correlate log lines of one connection across reconnects.

use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Opaque identifier of a scheduled task
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Monotonic task id allocator
#[derive(Debug, Default)]
pub(crate) struct TaskIdGen {
    last: u64,
}

impl TaskIdGen {
    pub(crate) fn next_id(&mut self) -> TaskId {
        self.last += 1;
        TaskId::from_raw(self.last)
    }
}

/// Connection session identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionId {
    pub fn new() -> Self {
        Self(generate_id_with_prefix("WS"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generate a unique id with a prefix, e.g. `WS-V1StGXR8`
pub fn generate_id_with_prefix(prefix: &str) -> String {
    format!("{prefix}-{}", nanoid!(8, &nanoid::alphabet::SAFE))
}
