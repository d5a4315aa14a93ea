//! Single-threaded monoio runtime wrapper
//!
//! Everything in tickstream runs on one cooperative thread: the scheduler
//! tick loop, connection receive loops and every spawned callback. The
//! runtime is built with the timer driver enabled since the scheduler and
//! delayed tasks sleep on it.

use crate::cpu::bind_to_cpu_set;
use crate::error::{CoreError, Result};

use monoio::{FusionDriver, RuntimeBuilder};
use std::future::Future;
use tracing::{info, info_span, warn};

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// CPU core to bind to (None for no binding)
    pub cpu_core: Option<usize>,
    /// Label of the `runtime` span wrapping everything run on this runtime
    pub name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cpu_core: None,
            name: "tickstream-main".to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn with_cpu_core(mut self, cpu_core: Option<usize>) -> Self {
        self.cpu_core = cpu_core;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// tickstream runtime
pub struct TickRuntime {
    config: RuntimeConfig,
}

impl TickRuntime {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        if let Some(cpu_core) = config.cpu_core {
            if let Err(e) = bind_to_cpu_set(cpu_core) {
                warn!("Failed to bind to CPU core {}: {}", cpu_core, e);
            }
        }

        info!(runtime = %config.name, cpu_core = ?config.cpu_core, "runtime configured");
        Self { config }
    }

    /// Run `f()` to completion on a fresh runtime
    pub fn start<F, Fut>(self, f: F) -> Result<Fut::Output>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        let mut runtime = RuntimeBuilder::<FusionDriver>::new()
            .enable_timer()
            .build()
            .map_err(|e| CoreError::RuntimeError(format!("failed to build runtime: {e}")))?;

        let span = info_span!("runtime", name = %self.config.name);
        let _entered = span.enter();
        info!("runtime starting");
        let output = runtime.block_on(f());
        info!("runtime stopped");
        Ok(output)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }
}

impl Default for TickRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a default runtime and run `f()` on it
pub fn run<F, Fut>(f: F) -> Result<Fut::Output>
where
    F: FnOnce() -> Fut,
    Fut: Future,
{
    TickRuntime::new().start(f)
}
