//! Monoio-native WebSocket client
//!
//! RFC 6455 client over plain TCP (`ws://`) or rustls (`wss://`), optionally
//! through an HTTP CONNECT proxy. The socket is split once the upgrade
//! completes: [`WsReader`] yields whole messages, reassembling fragments and
//! answering pings itself; [`WsWriter`] sends data frames. Both write through
//! one sink guarded by an async mutex so auto-pongs never interleave with
//! outbound frames.

use crate::errors::{Result, StreamError};
use crate::proxy::{connect_via_proxy, find_head_end};
use crate::tls::{default_client_config, Drained, TlsSession};
use crate::transport::{Connector, FrameReader, FrameWriter, Inbound, Outbound, Socket, SocketStatus};

use async_trait::async_trait;
use base64::Engine;
use futures::lock::Mutex;
use monoio::io::{AsyncReadRent, AsyncWriteRent, AsyncWriteRentExt, OwnedReadHalf, OwnedWriteHalf, Splitable};
use monoio::net::TcpStream;
use rand::RngCore;
use rustls::ClientConfig;
use sha1::{Digest, Sha1};
use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use tickstream_core::PerfTimer;
use tracing::{debug, info, warn};
use url::Url;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const READ_CHUNK: usize = 8 * 1024;
const MAX_HANDSHAKE_RESPONSE: usize = 16 * 1024;

/// Largest frame or reassembled message accepted from a server
pub const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    /// Opcode this client does not implement (0x3-0x7, 0xB-0xF)
    Reserved(u8),
}

impl OpCode {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x0 => OpCode::Continuation,
            0x1 => OpCode::Text,
            0x2 => OpCode::Binary,
            0x8 => OpCode::Close,
            0x9 => OpCode::Ping,
            0xa => OpCode::Pong,
            other => OpCode::Reserved(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xa,
            OpCode::Reserved(value) => value,
        }
    }

    pub fn is_control(self) -> bool {
        self.as_u8() & 0x08 != 0
    }
}

/// WebSocket frame header
#[derive(Debug, Clone)]
pub struct FrameHeader {
    pub fin: bool,
    pub opcode: OpCode,
    pub mask: Option<[u8; 4]>,
    pub payload_len: u64,
}

/// WebSocket frame, payload always held unmasked
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Masked, final client frame
    fn client(opcode: OpCode, payload: Vec<u8>) -> Self {
        Self {
            header: FrameHeader {
                fin: true,
                opcode,
                mask: Some(generate_mask()),
                payload_len: payload.len() as u64,
            },
            payload,
        }
    }

    pub fn text(data: String) -> Self {
        Self::client(OpCode::Text, data.into_bytes())
    }

    pub fn binary(data: Vec<u8>) -> Self {
        Self::client(OpCode::Binary, data)
    }

    pub fn pong(data: Vec<u8>) -> Self {
        Self::client(OpCode::Pong, data)
    }

    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        Self::client(OpCode::Close, payload)
    }

    /// Serialize to wire bytes, masking the payload when a mask is set
    pub fn encode(&self) -> Vec<u8> {
        let len = self.payload.len();
        let mut out = Vec::with_capacity(len + 14);

        let fin = if self.header.fin { 0x80 } else { 0x00 };
        out.push(fin | self.header.opcode.as_u8());

        let mask_bit = if self.header.mask.is_some() { 0x80 } else { 0x00 };
        if len < 126 {
            out.push(mask_bit | len as u8);
        } else if len < 65536 {
            out.push(mask_bit | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            out.push(mask_bit | 127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }

        match self.header.mask {
            Some(mask) => {
                out.extend_from_slice(&mask);
                let start = out.len();
                out.extend_from_slice(&self.payload);
                apply_mask(&mut out[start..], &mask);
            }
            None => out.extend_from_slice(&self.payload),
        }
        out
    }

    /// Parse one frame from the front of `data`.
    ///
    /// `Ok(None)` means more bytes are needed. On success returns the frame
    /// and the number of bytes consumed.
    pub fn decode(data: &[u8]) -> Result<Option<(Self, usize)>> {
        if data.len() < 2 {
            return Ok(None);
        }

        let fin = data[0] & 0x80 != 0;
        if data[0] & 0x70 != 0 {
            return Err(StreamError::ProtocolError("reserved bits set without extension".to_string()));
        }
        let opcode = OpCode::from_u8(data[0] & 0x0f);
        let masked = data[1] & 0x80 != 0;

        let mut offset = 2;
        let payload_len = match data[1] & 0x7f {
            126 => {
                if data.len() < offset + 2 {
                    return Ok(None);
                }
                let len = u16::from_be_bytes([data[2], data[3]]) as u64;
                offset += 2;
                len
            }
            127 => {
                if data.len() < offset + 8 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&data[2..10]);
                offset += 8;
                u64::from_be_bytes(raw)
            }
            short => short as u64,
        };

        if payload_len > MAX_MESSAGE_LEN as u64 {
            return Err(StreamError::ProtocolError(format!("frame of {payload_len} bytes exceeds limit")));
        }
        if opcode.is_control() && (payload_len > 125 || !fin) {
            return Err(StreamError::ProtocolError("malformed control frame".to_string()));
        }

        let mask = if masked {
            if data.len() < offset + 4 {
                return Ok(None);
            }
            let mask = [data[offset], data[offset + 1], data[offset + 2], data[offset + 3]];
            offset += 4;
            Some(mask)
        } else {
            None
        };

        let end = offset + payload_len as usize;
        if data.len() < end {
            return Ok(None);
        }

        let mut payload = data[offset..end].to_vec();
        if let Some(mask) = &mask {
            apply_mask(&mut payload, mask);
        }

        Ok(Some((
            Frame {
                header: FrameHeader {
                    fin,
                    opcode,
                    mask,
                    payload_len,
                },
                payload,
            },
            end,
        )))
    }
}

fn generate_mask() -> [u8; 4] {
    rand::thread_rng().next_u32().to_be_bytes()
}

fn apply_mask(payload: &mut [u8], mask: &[u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

fn parse_close_payload(payload: &[u8]) -> (Option<u16>, String) {
    if payload.len() < 2 {
        return (None, String::new());
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    (Some(code), String::from_utf8_lossy(&payload[2..]).into_owned())
}

/// Random `Sec-WebSocket-Key`
pub fn generate_key() -> String {
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    base64::engine::general_purpose::STANDARD.encode(nonce)
}

/// Expected `Sec-WebSocket-Accept` for `key`
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

fn upgrade_request(url: &Url, key: &str) -> String {
    let path = if url.path().is_empty() { "/" } else { url.path() };
    let query = url.query().map(|q| format!("?{q}")).unwrap_or_default();
    let host = url.host_str().unwrap_or_default();
    let host_header = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    format!(
        "GET {path}{query} HTTP/1.1\r\n\
         Host: {host_header}\r\n\
         User-Agent: tickstream/0.1\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n"
    )
}

fn validate_upgrade_response(head: &str, key: &str) -> Result<()> {
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let status = status_line.split_whitespace().nth(1).unwrap_or_default();
    if status != "101" {
        return Err(StreamError::HandshakeFailed(format!("unexpected status: {status_line}")));
    }

    let headers: HashMap<String, String> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect();

    let upgrade_ok = headers
        .get("upgrade")
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    if !upgrade_ok {
        return Err(StreamError::HandshakeFailed("missing Upgrade: websocket".to_string()));
    }

    match headers.get("sec-websocket-accept") {
        Some(accept) if *accept == accept_key(key) => Ok(()),
        Some(_) => Err(StreamError::HandshakeFailed("invalid Sec-WebSocket-Accept".to_string())),
        None => Err(StreamError::HandshakeFailed("missing Sec-WebSocket-Accept".to_string())),
    }
}

/// Read half of the wire, decrypting when TLS is on
struct WireReader {
    half: OwnedReadHalf<TcpStream>,
    tls: Option<TlsSession>,
    eof: bool,
}

impl WireReader {
    /// Append received plaintext to `buf`. `Ok(0)` means end of stream.
    async fn fill(&mut self, buf: &mut Vec<u8>) -> Result<usize> {
        loop {
            if self.eof {
                return Ok(0);
            }

            let chunk = vec![0u8; READ_CHUNK];
            let (result, chunk) = self.half.read(chunk).await;
            let n = result.map_err(|e| StreamError::from_io("websocket read", e))?;
            if n == 0 {
                self.eof = true;
                return Ok(0);
            }

            match &self.tls {
                None => {
                    buf.extend_from_slice(&chunk[..n]);
                    return Ok(n);
                }
                Some(tls) => {
                    let before = buf.len();
                    if tls.decrypt(&chunk[..n], buf)? == Drained::PeerClosed {
                        self.eof = true;
                    }
                    let added = buf.len() - before;
                    if added > 0 {
                        return Ok(added);
                    }
                    // handshake or session records only
                }
            }
        }
    }
}

/// Write half of the wire, encrypting when TLS is on
struct WireWriter {
    half: OwnedWriteHalf<TcpStream>,
    tls: Option<TlsSession>,
}

impl WireWriter {
    async fn write(&mut self, bytes: Vec<u8>) -> Result<()> {
        let bytes = match &self.tls {
            Some(tls) => tls.encrypt(&bytes)?,
            None => bytes,
        };
        if bytes.is_empty() {
            return Ok(());
        }
        let (result, _) = self.half.write_all(bytes).await;
        result
            .map(|_| ())
            .map_err(|e| StreamError::from_io("websocket write", e))
    }

    async fn shutdown(&mut self) {
        if let Some(tls) = &self.tls {
            if let Ok(alert) = tls.close_notify() {
                if !alert.is_empty() {
                    let _ = self.half.write_all(alert).await;
                }
            }
        }
        let _ = self.half.shutdown().await;
    }
}

/// Outbound side shared by reader (pongs, close replies) and writer
#[derive(Clone)]
struct WsSink {
    wire: Rc<Mutex<WireWriter>>,
    close_sent: Rc<Cell<bool>>,
    status: SocketStatus,
}

impl WsSink {
    async fn send_frame(&self, frame: Frame) -> Result<()> {
        let mut wire = self.wire.lock().await;
        let result = wire.write(frame.encode()).await;
        if let Err(e) = &result {
            if e.is_connection_lost() {
                self.status.mark_closed();
            }
        }
        result
    }

    /// Send a close frame once, then half-close the TCP stream
    async fn close(&self, code: u16, reason: &str) {
        if self.close_sent.replace(true) {
            return;
        }
        let mut wire = self.wire.lock().await;
        if let Err(e) = wire.write(Frame::close(code, reason).encode()).await {
            debug!("close frame not delivered: {}", e);
        }
        wire.shutdown().await;
        self.status.mark_closed();
    }
}

/// Message-level reader over the split socket
pub struct WsReader {
    wire: WireReader,
    sink: WsSink,
    buffer: Vec<u8>,
    partial: Option<(OpCode, Vec<u8>)>,
    finished: bool,
}

impl WsReader {
    fn fail(&mut self, reason: String) -> Inbound {
        self.finished = true;
        self.sink.status.mark_closed();
        if self.sink.close_sent.get() {
            Inbound::Closing
        } else {
            Inbound::Error(reason)
        }
    }

    /// Feed one decoded frame; `Some` once a message is complete
    async fn on_frame(&mut self, frame: Frame) -> Option<Inbound> {
        match frame.header.opcode {
            OpCode::Text | OpCode::Binary if frame.header.fin => {
                if self.partial.is_some() {
                    return Some(self.fail("data frame inside a fragmented message".to_string()));
                }
                Some(self.complete(frame.header.opcode, frame.payload))
            }
            OpCode::Text | OpCode::Binary => {
                if self.partial.is_some() {
                    return Some(self.fail("nested fragmented message".to_string()));
                }
                self.partial = Some((frame.header.opcode, frame.payload));
                None
            }
            OpCode::Continuation => {
                let Some((opcode, mut data)) = self.partial.take() else {
                    return Some(self.fail("continuation without a started message".to_string()));
                };
                data.extend_from_slice(&frame.payload);
                if data.len() > MAX_MESSAGE_LEN {
                    return Some(self.fail("fragmented message exceeds limit".to_string()));
                }
                if frame.header.fin {
                    Some(self.complete(opcode, data))
                } else {
                    self.partial = Some((opcode, data));
                    None
                }
            }
            OpCode::Ping => {
                if self.sink.close_sent.get() {
                    return None;
                }
                debug!("ping received, sending pong");
                match self.sink.send_frame(Frame::pong(frame.payload)).await {
                    Ok(()) => None,
                    Err(e) => Some(self.fail(format!("pong failed: {e}"))),
                }
            }
            OpCode::Pong => {
                debug!(len = frame.payload.len(), "pong received");
                None
            }
            OpCode::Close => {
                let (code, reason) = parse_close_payload(&frame.payload);
                let initiated_locally = self.sink.close_sent.get();
                self.sink.close(code.unwrap_or(1000), "").await;
                self.finished = true;
                if initiated_locally {
                    Some(Inbound::Closing)
                } else {
                    Some(Inbound::Close { code, reason })
                }
            }
            OpCode::Reserved(value) => Some(Inbound::Other(format!("opcode {value:#x}"))),
        }
    }

    fn complete(&mut self, opcode: OpCode, data: Vec<u8>) -> Inbound {
        if opcode == OpCode::Text {
            match String::from_utf8(data) {
                Ok(text) => Inbound::Text(text),
                Err(_) => self.fail("invalid UTF-8 in text message".to_string()),
            }
        } else {
            Inbound::Binary(data)
        }
    }
}

#[async_trait(?Send)]
impl FrameReader for WsReader {
    async fn next_frame(&mut self) -> Inbound {
        loop {
            if self.finished {
                return Inbound::Closed;
            }

            match Frame::decode(&self.buffer) {
                Ok(Some((frame, used))) => {
                    self.buffer.drain(..used);
                    if let Some(inbound) = self.on_frame(frame).await {
                        return inbound;
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) => return self.fail(e.to_string()),
            }

            match self.wire.fill(&mut self.buffer).await {
                Ok(0) => {
                    self.finished = true;
                    self.sink.status.mark_closed();
                    return if self.sink.close_sent.get() {
                        Inbound::Closing
                    } else {
                        Inbound::Closed
                    };
                }
                Ok(_) => {}
                Err(e) => return self.fail(e.to_string()),
            }
        }
    }
}

/// Data-frame writer over the split socket
pub struct WsWriter {
    sink: WsSink,
}

#[async_trait(?Send)]
impl FrameWriter for WsWriter {
    async fn send(&mut self, message: Outbound) -> Result<()> {
        if self.sink.status.is_closed() || self.sink.close_sent.get() {
            return Err(StreamError::ConnectionClosed("websocket closed".to_string()));
        }
        let frame = match message {
            Outbound::Text(text) => Frame::text(text),
            Outbound::Binary(data) => Frame::binary(data),
        };
        self.sink.send_frame(frame).await
    }

    async fn close(&mut self) -> Result<()> {
        self.sink.close(1000, "normal closure").await;
        Ok(())
    }
}

/// Network connector producing WebSocket sockets
#[derive(Clone)]
pub struct WsConnector {
    tls_config: Arc<ClientConfig>,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl WsConnector {
    pub fn new() -> Self {
        Self {
            tls_config: default_client_config(),
        }
    }

    pub fn with_tls_config(tls_config: Arc<ClientConfig>) -> Self {
        Self { tls_config }
    }

    async fn open(&self, url: &Url, proxy: Option<&Url>) -> Result<Socket> {
        let host = url
            .host_str()
            .ok_or_else(|| StreamError::InvalidUrl(format!("no host in {url}")))?;
        let secure = match url.scheme() {
            "wss" => true,
            "ws" => false,
            other => return Err(StreamError::InvalidUrl(format!("unsupported scheme '{other}'"))),
        };
        let port = url
            .port_or_known_default()
            .ok_or_else(|| StreamError::InvalidUrl(format!("no port for {url}")))?;

        let mut stream = match proxy {
            Some(proxy) => connect_via_proxy(proxy, host, port).await?,
            None => TcpStream::connect(format!("{host}:{port}"))
                .await
                .map_err(|e| StreamError::from_io("TCP connect", e))?,
        };
        stream.set_nodelay(true).ok();
        debug!(host, port, "TCP connection established");

        let tls = if secure {
            Some(TlsSession::handshake(&mut stream, host, self.tls_config.clone()).await?)
        } else {
            None
        };

        let (read_half, write_half) = stream.into_split();
        let mut wire_reader = WireReader {
            half: read_half,
            tls: tls.clone(),
            eof: false,
        };
        let mut wire_writer = WireWriter {
            half: write_half,
            tls,
        };

        let key = generate_key();
        wire_writer.write(upgrade_request(url, &key).into_bytes()).await?;

        let mut buffer = Vec::with_capacity(READ_CHUNK);
        let head_end = loop {
            if let Some(end) = find_head_end(&buffer) {
                break end;
            }
            if buffer.len() > MAX_HANDSHAKE_RESPONSE {
                return Err(StreamError::HandshakeFailed("upgrade response too large".to_string()));
            }
            if wire_reader.fill(&mut buffer).await? == 0 {
                return Err(StreamError::HandshakeFailed("connection closed during upgrade".to_string()));
            }
        };

        let head = String::from_utf8_lossy(&buffer[..head_end]).into_owned();
        validate_upgrade_response(&head, &key)?;
        // Frames sent right behind the 101 response stay buffered
        buffer.drain(..head_end);

        let status = SocketStatus::new();
        let sink = WsSink {
            wire: Rc::new(Mutex::new(wire_writer)),
            close_sent: Rc::new(Cell::new(false)),
            status: status.clone(),
        };

        Ok(Socket {
            reader: Box::new(WsReader {
                wire: wire_reader,
                sink: sink.clone(),
                buffer,
                partial: None,
                finished: false,
            }),
            writer: Box::new(WsWriter { sink }),
            status,
        })
    }
}

#[async_trait(?Send)]
impl Connector for WsConnector {
    async fn connect(&self, target: &Url, proxy: Option<&Url>) -> Result<Socket> {
        let timer = PerfTimer::start("websocket_connect");
        match self.open(target, proxy).await {
            Ok(socket) => {
                timer.finish();
                info!(url = %target, "websocket connected");
                Ok(socket)
            }
            Err(e) => {
                warn!(url = %target, "websocket connect failed: {}", e);
                Err(e)
            }
        }
    }
}
