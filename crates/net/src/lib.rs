//! # tickstream net
//!
//! Long-lived streaming connections on the tickstream scheduler.
//!
//! ## Features
//!
//! - **StreamingConnection**: watchdog, heartbeat and reconnect with backoff
//! - **WebSocket client**: monoio-native, `ws://` and `wss://` (rustls)
//! - **HTTP CONNECT proxy** support
//! - **Loopback transport** for tests and simulations

pub mod config;
pub mod connection;
pub mod errors;
pub mod handlers;
pub mod memory;
pub mod proxy;
pub mod tls;
pub mod transport;
pub mod websocket;

pub use config::{ConnectionConfig, ReconnectPolicy};
pub use connection::{ConnectionHealth, ConnectionState, HeartbeatPayload, StreamingConnection};
pub use errors::{Result, StreamError};
pub use handlers::{Handlers, TextPayload};
pub use memory::{MemoryConnector, MemoryListener, MemoryPeer};
pub use transport::{Connector, FrameReader, FrameWriter, Inbound, Outbound, Socket, SocketStatus};
pub use websocket::WsConnector;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{ConnectionConfig, ReconnectPolicy};
    pub use crate::connection::{ConnectionHealth, ConnectionState, HeartbeatPayload, StreamingConnection};
    pub use crate::errors::{Result, StreamError};
    pub use crate::handlers::{Handlers, TextPayload};
    pub use crate::websocket::WsConnector;
}
