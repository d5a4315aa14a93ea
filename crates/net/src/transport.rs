//! Transport seam between the connection state machine and sockets
//!
//! A [`Connector`] opens a [`Socket`]: a frame reader, a frame writer and a
//! shared closed flag. The connection owns all three exclusively; nothing
//! else touches the socket.

use crate::errors::Result;
use async_trait::async_trait;
use std::cell::Cell;
use std::rc::Rc;
use url::Url;

/// Inbound unit surfaced to the receive loop
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
    /// Peer sent a close frame
    Close { code: Option<u16>, reason: String },
    /// Local side started the close handshake
    Closing,
    /// Socket is gone (EOF or already closed)
    Closed,
    /// Transport or protocol failure
    Error(String),
    /// Anything the connection does not know how to handle
    Other(String),
}

impl Inbound {
    /// Short name used in log lines
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "TEXT",
            Self::Binary(_) => "BINARY",
            Self::Close { .. } => "CLOSE",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
            Self::Error(_) => "ERROR",
            Self::Other(_) => "OTHER",
        }
    }
}

/// Outbound data message
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Binary(Vec<u8>),
}

/// Closed flag shared by a socket's reader, writer and owner
#[derive(Debug, Clone, Default)]
pub struct SocketStatus(Rc<Cell<bool>>);

impl SocketStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.0.get()
    }

    pub fn mark_closed(&self) {
        self.0.set(true);
    }
}

/// Inbound half of a socket
#[async_trait(?Send)]
pub trait FrameReader {
    /// Next inbound unit. After `Close`, `Closed` or `Error` the reader keeps
    /// returning `Closed`.
    async fn next_frame(&mut self) -> Inbound;
}

/// Outbound half of a socket
#[async_trait(?Send)]
pub trait FrameWriter {
    async fn send(&mut self, message: Outbound) -> Result<()>;

    /// Start the close handshake and release the socket
    async fn close(&mut self) -> Result<()>;
}

/// An open socket
pub struct Socket {
    pub reader: Box<dyn FrameReader>,
    pub writer: Box<dyn FrameWriter>,
    pub status: SocketStatus,
}

/// Opens sockets to a target address
#[async_trait(?Send)]
pub trait Connector {
    async fn connect(&self, target: &Url, proxy: Option<&Url>) -> Result<Socket>;
}
