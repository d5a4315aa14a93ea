//! In-process loopback transport
//!
//! `MemoryConnector` hands out sockets backed by flume channels; every
//! connect attempt surfaces a [`MemoryPeer`] on the paired
//! [`MemoryListener`], which plays the server side. Used for simulations and
//! tests where no network is available.

use crate::errors::{Result, StreamError};
use crate::transport::{Connector, FrameReader, FrameWriter, Inbound, Outbound, Socket, SocketStatus};

use async_trait::async_trait;
use flume::{Receiver, Sender};
use std::cell::Cell;
use std::rc::Rc;
use tracing::debug;
use url::Url;

/// Client-side connector of the loopback transport
#[derive(Clone)]
pub struct MemoryConnector {
    accept_tx: Sender<MemoryPeer>,
    refuse: Rc<Cell<u32>>,
    attempts: Rc<Cell<u32>>,
}

/// Server side: yields one peer per successful connect
pub struct MemoryListener {
    accept_rx: Receiver<MemoryPeer>,
}

/// Server end of one loopback socket
pub struct MemoryPeer {
    pub url: Url,
    pub index: u32,
    inbound_tx: Sender<Inbound>,
    outbound_rx: Receiver<Outbound>,
    status: SocketStatus,
}

struct MemoryReader {
    inbound_rx: Receiver<Inbound>,
    status: SocketStatus,
    finished: bool,
}

struct MemoryWriter {
    outbound_tx: Sender<Outbound>,
    inbound_tx: Sender<Inbound>,
    status: SocketStatus,
}

impl MemoryConnector {
    pub fn new() -> (Self, MemoryListener) {
        let (accept_tx, accept_rx) = flume::unbounded();
        (
            Self {
                accept_tx,
                refuse: Rc::new(Cell::new(0)),
                attempts: Rc::new(Cell::new(0)),
            },
            MemoryListener { accept_rx },
        )
    }

    /// Refuse the next `count` connect attempts
    pub fn refuse_next(&self, count: u32) {
        self.refuse.set(count);
    }

    /// Connect attempts so far, refused ones included
    pub fn attempts(&self) -> u32 {
        self.attempts.get()
    }
}

#[async_trait(?Send)]
impl Connector for MemoryConnector {
    async fn connect(&self, target: &Url, _proxy: Option<&Url>) -> Result<Socket> {
        let index = self.attempts.get() + 1;
        self.attempts.set(index);

        if self.refuse.get() > 0 {
            self.refuse.set(self.refuse.get() - 1);
            return Err(StreamError::NetworkError(format!("connection refused: {target}")));
        }

        let (inbound_tx, inbound_rx) = flume::unbounded();
        let (outbound_tx, outbound_rx) = flume::unbounded();
        let status = SocketStatus::new();

        let peer = MemoryPeer {
            url: target.clone(),
            index,
            inbound_tx: inbound_tx.clone(),
            outbound_rx,
            status: status.clone(),
        };
        self.accept_tx
            .send(peer)
            .map_err(|_| StreamError::NetworkError("listener dropped".to_string()))?;

        debug!(url = %target, index, "loopback socket opened");

        Ok(Socket {
            reader: Box::new(MemoryReader {
                inbound_rx,
                status: status.clone(),
                finished: false,
            }),
            writer: Box::new(MemoryWriter {
                outbound_tx,
                inbound_tx,
                status: status.clone(),
            }),
            status,
        })
    }
}

impl MemoryListener {
    pub async fn accept(&self) -> Option<MemoryPeer> {
        self.accept_rx.recv_async().await.ok()
    }

    pub fn try_accept(&self) -> Option<MemoryPeer> {
        self.accept_rx.try_recv().ok()
    }
}

impl MemoryPeer {
    /// Deliver an inbound unit to the client; false once the client is gone
    pub fn push(&self, frame: Inbound) -> bool {
        self.inbound_tx.send(frame).is_ok()
    }

    pub fn push_text(&self, text: impl Into<String>) -> bool {
        self.push(Inbound::Text(text.into()))
    }

    /// Everything the client has sent so far
    pub fn drain_sent(&self) -> Vec<Outbound> {
        self.outbound_rx.try_iter().collect()
    }

    pub async fn recv(&self) -> Option<Outbound> {
        self.outbound_rx.recv_async().await.ok()
    }

    /// Kill the socket without any frame: reads and writes start failing
    pub fn reset(&self) {
        self.status.mark_closed();
    }

    pub fn is_closed(&self) -> bool {
        self.status.is_closed()
    }
}

#[async_trait(?Send)]
impl FrameReader for MemoryReader {
    async fn next_frame(&mut self) -> Inbound {
        if self.finished {
            return Inbound::Closed;
        }

        let frame = match self.inbound_rx.recv_async().await {
            Ok(frame) => frame,
            Err(_) => Inbound::Closed,
        };

        if matches!(frame, Inbound::Close { .. } | Inbound::Closed | Inbound::Error(_)) {
            self.status.mark_closed();
            self.finished = true;
        }
        frame
    }
}

#[async_trait(?Send)]
impl FrameWriter for MemoryWriter {
    async fn send(&mut self, message: Outbound) -> Result<()> {
        if self.status.is_closed() {
            return Err(StreamError::ConnectionReset("loopback socket closed".to_string()));
        }
        self.outbound_tx
            .send(message)
            .map_err(|_| StreamError::ConnectionReset("loopback peer dropped".to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        if !self.status.is_closed() {
            self.status.mark_closed();
            // Wake the reader the way a local close handshake would
            let _ = self.inbound_tx.send(Inbound::Closing);
        }
        Ok(())
    }
}
