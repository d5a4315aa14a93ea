//! Shared fixtures for the tickstream integration suites
//!
//! Timing-sensitive suites run their bodies on a fresh runtime via
//! [`block_on`] so that each test owns its scheduler and timers, and are
//! marked `#[serial]` to keep wall-clock measurements stable.

use std::cell::Cell;
use std::future::Future;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tickstream_core::{LogConfig, Scheduler, SchedulerConfig};
use tickstream_net::{ConnectionConfig, Handlers, MemoryConnector, MemoryListener, ReconnectPolicy, StreamingConnection};

/// Tick period used by every fixture scheduler
pub const TICK: Duration = Duration::from_millis(5);

/// Run `f()` to completion on a fresh tickstream runtime
pub fn block_on<F, Fut>(f: F) -> Fut::Output
where
    F: FnOnce() -> Fut,
    Fut: Future,
{
    init_test_logging();
    tickstream_core::runtime::run(f).expect("failed to build test runtime")
}

/// Log at debug unless `RUST_LOG` says otherwise
pub fn init_test_logging() {
    tickstream_core::init_logging(&LogConfig::default().with_level("debug").with_file(false));
}

pub fn fast_scheduler() -> Scheduler {
    Scheduler::with_config(SchedulerConfig::default().with_tick_interval(TICK))
}

pub async fn sleep_ms(ms: u64) {
    monoio::time::sleep(Duration::from_millis(ms)).await;
}

/// Poll `condition` every tick until it holds or `deadline` elapses.
///
/// Returns whether the condition was met. Used where the first panic of a
/// run may stall the thread (backtrace capture) longer than a fixed sleep.
pub async fn wait_until(deadline: Duration, condition: impl Fn() -> bool) -> bool {
    let started = Instant::now();
    while !condition() {
        if started.elapsed() >= deadline {
            return false;
        }
        monoio::time::sleep(TICK).await;
    }
    true
}

/// Loopback connection config: watchdog every `check_ms`, no heartbeat,
/// short deterministic backoff
pub fn loopback_config(check_ms: u64) -> ConnectionConfig {
    ConnectionConfig::new("ws://loopback.test/stream")
        .expect("static url")
        .with_check_interval(Duration::from_millis(check_ms))
        .with_heartbeat_interval(Duration::ZERO)
        .with_reconnect(
            ReconnectPolicy::default()
                .with_initial_delay(Duration::from_millis(10))
                .with_max_delay(Duration::from_millis(40))
                .with_jitter(0.0),
        )
}

/// Connection over the loopback transport plus both transport ends
pub struct Loopback {
    pub conn: StreamingConnection,
    pub connector: MemoryConnector,
    pub listener: MemoryListener,
    pub scheduler: Scheduler,
}

impl Loopback {
    pub fn new(config: ConnectionConfig, handlers: Handlers) -> Self {
        let scheduler = fast_scheduler();
        let (connector, listener) = MemoryConnector::new();
        let conn = StreamingConnection::with_connector(config, scheduler.clone(), handlers, connector.clone());
        Self {
            conn,
            connector,
            listener,
            scheduler,
        }
    }
}

/// Shared counter usable from `Fn` callbacks
#[derive(Clone, Default)]
pub struct Counter(Rc<Cell<u32>>);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self) {
        self.0.set(self.0.get() + 1);
    }

    pub fn get(&self) -> u32 {
        self.0.get()
    }

    /// Callback incrementing this counter on each call
    pub fn callback(&self) -> impl Fn() -> std::future::Ready<()> + 'static {
        let counter = self.clone();
        move || {
            counter.incr();
            std::future::ready(())
        }
    }
}
