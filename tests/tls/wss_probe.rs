//! Manual probe for the monoio-native wss:// client
//!
//! Opens one socket to the URL given as first argument (or
//! `TICKSTREAM_WS_URL`), prints the first few inbound messages and closes.

use tickstream_core::runtime::run;
use tickstream_net::{Connector, Inbound, WsConnector};
use url::Url;

const MESSAGES: usize = 5;

fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tickstream_core::init_default_logging();

    let target = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("TICKSTREAM_WS_URL").ok())
        .unwrap_or_else(|| "wss://echo.websocket.org".to_string());
    let url = Url::parse(&target)?;

    run(|| async move {
        println!("Connecting to {url}");
        let mut socket = WsConnector::new().connect(&url, None).await?;
        println!("Handshake complete");

        for _ in 0..MESSAGES {
            match socket.reader.next_frame().await {
                Inbound::Text(text) => println!("text: {text}"),
                Inbound::Binary(data) => println!("binary: {} bytes", data.len()),
                other => {
                    println!("stream ended: {other:?}");
                    break;
                }
            }
        }

        socket.writer.close().await?;
        println!("Closed");
        anyhow::Ok(())
    })?
}
