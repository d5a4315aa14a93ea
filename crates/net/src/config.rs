//! Connection configuration and reconnect policy

use crate::errors::{Result, StreamError};
use rand::Rng;
use std::time::Duration;
use tickstream_core::config::{env_key, parse_interval_secs};
use url::Url;

/// Backoff applied between consecutive failed connect attempts
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay added or removed at random (0.0 - 1.0)
    pub jitter_factor: f64,
    /// Bound on automatic attempts after consecutive failures; `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay before the next attempt given `failures` consecutive failures.
    ///
    /// The first attempt after a loss is immediate.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let exponent = (failures - 1).min(32) as i32;
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        let jitter = if self.jitter_factor > 0.0 && capped > 0.0 {
            let spread = capped * self.jitter_factor;
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };

        Duration::from_secs_f64((capped + jitter).max(0.0))
    }

    /// Whether an automatic attempt is still allowed after `failures`
    pub fn allows(&self, failures: u32) -> bool {
        self.max_attempts.map_or(true, |max| failures <= max)
    }

    pub fn validate(&self) -> Result<()> {
        if self.multiplier < 1.0 || !self.multiplier.is_finite() {
            return Err(StreamError::ConfigurationError(format!(
                "reconnect multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(StreamError::ConfigurationError(format!(
                "reconnect jitter must be within 0.0..=1.0, got {}",
                self.jitter_factor
            )));
        }
        if self.initial_delay > self.max_delay {
            return Err(StreamError::ConfigurationError(
                "reconnect initial delay exceeds max delay".to_string(),
            ));
        }
        Ok(())
    }
}

/// Streaming connection configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub url: Url,
    /// Watchdog period
    pub check_interval: Duration,
    /// Heartbeat period; zero disables the heartbeat tick
    pub heartbeat_interval: Duration,
    /// Upper bound on one connect attempt (TCP, TLS and upgrade)
    pub connect_timeout: Duration,
    /// HTTP CONNECT proxy
    pub proxy: Option<Url>,
    pub reconnect: ReconnectPolicy,
}

impl ConnectionConfig {
    pub fn new(url: &str) -> Result<Self> {
        let url = parse_ws_url(url)?;
        Ok(Self {
            url,
            check_interval: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            proxy: None,
            reconnect: ReconnectPolicy::default(),
        })
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_proxy(mut self, proxy: &str) -> Result<Self> {
        self.proxy = Some(Url::parse(proxy)?);
        Ok(self)
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Load from the process environment (after `.env`)
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. `TICKSTREAM_WS_URL` is required.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url_key = env_key("WS_URL");
        let url = lookup(&url_key)
            .ok_or_else(|| StreamError::ConfigurationError(format!("{url_key} is not set")))?;
        let mut config = Self::new(url.trim())?;

        if let Some(raw) = lookup(&env_key("CHECK_INTERVAL_SECS")) {
            config.check_interval = parse_interval_secs(&raw)?;
        }
        if let Some(raw) = lookup(&env_key("HEARTBEAT_INTERVAL_SECS")) {
            config.heartbeat_interval = parse_interval_secs(&raw)?;
        }
        if let Some(raw) = lookup(&env_key("PROXY")) {
            if !raw.trim().is_empty() {
                config = config.with_proxy(raw.trim())?;
            }
        }
        if let Some(raw) = lookup(&env_key("RECONNECT_MAX_ATTEMPTS")) {
            let max = raw.trim().parse::<u32>().map_err(|e| {
                StreamError::ConfigurationError(format!("RECONNECT_MAX_ATTEMPTS '{raw}': {e}"))
            })?;
            config.reconnect.max_attempts = Some(max);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.check_interval.is_zero() {
            return Err(StreamError::ConfigurationError(
                "check interval must be positive".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(StreamError::ConfigurationError(
                "connect timeout must be positive".to_string(),
            ));
        }
        if let Some(proxy) = &self.proxy {
            if proxy.scheme() != "http" {
                return Err(StreamError::ConfigurationError(format!(
                    "unsupported proxy scheme: {}",
                    proxy.scheme()
                )));
            }
        }
        self.reconnect.validate()
    }

    pub fn heartbeat_enabled(&self) -> bool {
        !self.heartbeat_interval.is_zero()
    }
}

fn parse_ws_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw)?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => return Err(StreamError::InvalidUrl(format!("unsupported scheme '{other}' in {raw}"))),
    }
    if url.host_str().is_none() {
        return Err(StreamError::InvalidUrl(format!("no host in {raw}")));
    }
    Ok(url)
}
