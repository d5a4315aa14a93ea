//! Runtime configuration
//!
//! Plain structs with sensible defaults, builder-style overrides and
//! environment loading. Environment lookups go through a closure so that
//! tests can feed values without touching the process environment.

use crate::error::{CoreError, Result};
use std::time::Duration;

/// Environment variable prefix shared by every tickstream component
pub const ENV_PREFIX: &str = "TICKSTREAM_";

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Wake-up period of the tick loop
    pub tick_interval: Duration,
    /// Log an "alive" line every N ticks (0 disables)
    pub alive_log_interval: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            alive_log_interval: 600, // once a minute at the default tick
        }
    }
}

impl SchedulerConfig {
    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn with_alive_log_interval(mut self, ticks: u64) -> Self {
        self.alive_log_interval = ticks;
        self
    }

    /// Load from the process environment (after `.env`)
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup, falling back to defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(&env_key("TICK_INTERVAL_MS")) {
            let millis = raw.trim().parse::<u64>().map_err(|e| {
                CoreError::ConfigurationError(format!("TICK_INTERVAL_MS '{raw}': {e}"))
            })?;
            config.tick_interval = Duration::from_millis(millis);
        }

        if let Some(raw) = lookup(&env_key("ALIVE_LOG_TICKS")) {
            config.alive_log_interval = raw.trim().parse::<u64>().map_err(|e| {
                CoreError::ConfigurationError(format!("ALIVE_LOG_TICKS '{raw}': {e}"))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_interval.is_zero() {
            return Err(CoreError::InvalidInterval(self.tick_interval));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is not set
    pub level: String,
    /// Include source file and line in every record
    pub with_file: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            with_file: true,
        }
    }
}

impl LogConfig {
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_file(mut self, with_file: bool) -> Self {
        self.with_file = with_file;
        self
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(level) = lookup(&env_key("LOG_LEVEL")) {
            config.level = level;
        }
        config
    }
}

/// Prefixed environment key
pub fn env_key(name: &str) -> String {
    format!("{ENV_PREFIX}{name}")
}

/// Parse an interval given in (possibly fractional) seconds.
///
/// Negative, non-finite and unparsable values are rejected. Zero is allowed
/// here; callers decide whether zero means "disabled" or is an error.
pub fn parse_interval_secs(raw: &str) -> Result<Duration> {
    let secs = raw
        .trim()
        .parse::<f64>()
        .map_err(|e| CoreError::InvalidIntervalValue(format!("'{raw}': {e}")))?;

    if !secs.is_finite() || secs < 0.0 {
        return Err(CoreError::InvalidIntervalValue(format!("'{raw}' is not a non-negative number of seconds")));
    }

    Ok(Duration::from_secs_f64(secs))
}
