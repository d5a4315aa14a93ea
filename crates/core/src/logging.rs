//! Logging setup
//!
//! By default installs a `tracing-subscriber` formatter filtered by
//! `RUST_LOG`, falling back to the configured level. With the `ftlog`
//! feature, tracing events are forwarded through the `log` facade to ftlog's
//! buffered background writer instead.

use crate::config::LogConfig;
use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize logging once per process; later calls are ignored
pub fn init_logging(config: &LogConfig) {
    INIT.call_once(|| {
        #[cfg(feature = "ftlog")]
        init_ftlog(config);

        #[cfg(not(feature = "ftlog"))]
        init_tracing(config);
    });
}

/// Initialize logging with the configuration read from the environment
pub fn init_default_logging() {
    dotenv::dotenv().ok();
    init_logging(&LogConfig::from_lookup(|key| std::env::var(key).ok()));
}

#[cfg(feature = "ftlog")]
fn init_ftlog(config: &LogConfig) {
    let level = config.level.parse::<ftlog::LevelFilter>().unwrap_or(ftlog::LevelFilter::Info);
    match ftlog::builder().max_log_level(level).bounded(100_000, false).utc().try_init() {
        Ok(guard) => {
            // Flushes on drop; logging lives for the whole process
            Box::leak(Box::new(guard));
            tracing::info!("Initialized ftlog logging");
        }
        Err(e) => eprintln!("failed to initialize ftlog: {e}"),
    }
}

#[cfg(not(feature = "ftlog"))]
fn init_tracing(config: &LogConfig) {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(config.with_file)
        .with_line_number(config.with_file)
        .finish();

    // Another subscriber (e.g. a test harness) may already be installed
    if tracing::subscriber::set_global_default(subscriber).is_ok() {
        tracing::info!(level = %config.level, "Initialized tracing logging");
    }
}
