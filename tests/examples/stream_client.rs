//! Streaming client example
//!
//! Connects to `TICKSTREAM_WS_URL`, sends a JSON heartbeat, prints every
//! message for a while, then closes.
//!
//! ```text
//! TICKSTREAM_WS_URL=wss://stream.example.com/ws \
//! TICKSTREAM_HEARTBEAT_INTERVAL_SECS=5 \
//! cargo run -p tickstream-tests --example stream_client
//! ```

use std::time::Duration;

use serde_json::json;
use tickstream_core::prelude::*;
use tickstream_net::prelude::*;
use tracing::info;

const RUN_FOR: Duration = Duration::from_secs(60);

fn main() -> anyhow::Result<()> {
    init_default_logging();

    let config = ConnectionConfig::from_env()?;
    let scheduler_config = SchedulerConfig::from_env()?;

    TickRuntime::new().start(|| async move {
        info!("Starting stream client");
        info!("   URL: {}", config.url);
        info!("   Watchdog: {:?}", config.check_interval);
        info!("   Heartbeat: {:?}", config.heartbeat_interval);

        let scheduler = Scheduler::with_config(scheduler_config);
        let handlers = Handlers::new()
            .on_connected(|| async {
                info!("connected");
            })
            .on_text(|payload| async move {
                match payload {
                    TextPayload::Json(value) => info!("json: {}", value),
                    TextPayload::Raw(text) => info!("text: {}", text),
                }
            })
            .on_binary(|data| async move {
                info!("binary: {} bytes", data.len());
            });

        let conn = StreamingConnection::new(config, scheduler.clone(), handlers);
        conn.set_heartbeat_payload(HeartbeatPayload::Json(json!({"op": "ping"})))?;
        conn.initialize()?;

        monoio::time::sleep(RUN_FOR).await;

        let health = conn.health();
        info!("health: {}", serde_json::to_string(&health)?);

        conn.close().await;
        scheduler.shutdown();
        anyhow::Ok(())
    })?
}
