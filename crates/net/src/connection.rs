//! Streaming connection with watchdog, heartbeat and reconnect
//!
//! A `StreamingConnection` owns at most one socket at a time. Two scheduler
//! ticks keep it alive:
//! - the watchdog (`check_connection`) reconnects when the socket is gone
//! - the heartbeat (`send_heartbeat`) pushes the keep-alive payload
//!
//! Every (re)connect bumps a generation counter. The receive loop of an older
//! socket checks it before each dispatch, so frames from a superseded socket
//! never reach the handlers, and loss signals from it never trigger a second
//! reconnect.

use crate::config::ConnectionConfig;
use crate::errors::{Result, StreamError};
use crate::handlers::{Handlers, TextPayload};
use crate::transport::{Connector, FrameReader, FrameWriter, Inbound, Outbound, Socket, SocketStatus};
use crate::websocket::WsConnector;

use futures::channel::oneshot;
use futures::future::{self, Either};
use futures::lock::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::cell::{OnceCell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tickstream_core::{spawn_isolated, LoopRunTask, Scheduler, SessionId, TaskId, Timestamp};
use tracing::{debug, error, info, trace, warn};
use url::Url;

const SOCKET_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    /// Terminal, reached only through `close()`
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Keep-alive payload sent on every heartbeat tick
#[derive(Debug, Clone, PartialEq)]
pub enum HeartbeatPayload {
    /// Serialized and sent as a text frame
    Json(Value),
    Text(String),
}

impl HeartbeatPayload {
    fn to_outbound(&self) -> Result<Outbound> {
        match self {
            Self::Json(value) => Ok(Outbound::Text(serde_json::to_string(value)?)),
            Self::Text(text) => Ok(Outbound::Text(text.clone())),
        }
    }
}

/// Point-in-time view of a connection
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionHealth {
    pub state: ConnectionState,
    pub session: String,
    pub url: String,
    /// Successful connects after the first one
    pub reconnect_count: u64,
    pub consecutive_failures: u32,
    pub frames_received: u64,
    pub heartbeats_sent: u64,
    pub error_count: u64,
    pub connected_at: Option<Timestamp>,
}

impl ConnectionHealth {
    pub fn is_healthy(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

struct ActiveSocket {
    writer: Rc<Mutex<Box<dyn FrameWriter>>>,
    status: SocketStatus,
    /// Ends the socket's receive loop, which owns the read half
    stop_reader: oneshot::Sender<()>,
}

struct State {
    phase: ConnectionState,
    socket: Option<ActiveSocket>,
    generation: u64,
    /// Generation of an automatic reconnect still waiting out its backoff
    backoff: Option<u64>,
    initialized: bool,
    closed_by_caller: bool,
    watchdog: Option<TaskId>,
    heartbeat_task: Option<TaskId>,
    connects: u64,
    consecutive_failures: u32,
    frames_received: u64,
    heartbeats_sent: u64,
    error_count: u64,
    connected_at: Option<Timestamp>,
}

impl State {
    fn new() -> Self {
        Self {
            phase: ConnectionState::Disconnected,
            socket: None,
            generation: 0,
            backoff: None,
            initialized: false,
            closed_by_caller: false,
            watchdog: None,
            heartbeat_task: None,
            connects: 0,
            consecutive_failures: 0,
            frames_received: 0,
            heartbeats_sent: 0,
            error_count: 0,
            connected_at: None,
        }
    }
}

struct Inner {
    config: ConnectionConfig,
    session: SessionId,
    tasks: LoopRunTask,
    connector: Rc<dyn Connector>,
    handlers: Handlers,
    heartbeat: OnceCell<HeartbeatPayload>,
    state: RefCell<State>,
}

/// Long-lived streaming connection.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct StreamingConnection {
    inner: Rc<Inner>,
}

impl StreamingConnection {
    /// Connection over the network WebSocket transport
    pub fn new(config: ConnectionConfig, scheduler: Scheduler, handlers: Handlers) -> Self {
        Self::with_connector(config, scheduler, handlers, WsConnector::new())
    }

    pub fn with_connector<C>(config: ConnectionConfig, scheduler: Scheduler, handlers: Handlers, connector: C) -> Self
    where
        C: Connector + 'static,
    {
        Self {
            inner: Rc::new(Inner {
                config,
                session: SessionId::new(),
                tasks: LoopRunTask::new(scheduler),
                connector: Rc::new(connector),
                handlers,
                heartbeat: OnceCell::new(),
                state: RefCell::new(State::new()),
            }),
        }
    }

    pub fn url(&self) -> &Url {
        &self.inner.config.url
    }

    pub fn session(&self) -> &SessionId {
        &self.inner.session
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().phase
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn health(&self) -> ConnectionHealth {
        let state = self.inner.state.borrow();
        ConnectionHealth {
            state: state.phase,
            session: self.inner.session.to_string(),
            url: self.inner.config.url.to_string(),
            reconnect_count: state.connects.saturating_sub(1),
            consecutive_failures: state.consecutive_failures,
            frames_received: state.frames_received,
            heartbeats_sent: state.heartbeats_sent,
            error_count: state.error_count,
            connected_at: state.connected_at,
        }
    }

    /// Set the keep-alive payload. It can be set only once.
    pub fn set_heartbeat_payload(&self, payload: HeartbeatPayload) -> Result<()> {
        self.inner
            .heartbeat
            .set(payload)
            .map_err(|_| StreamError::HeartbeatAlreadySet)
    }

    /// Register the watchdog and heartbeat ticks and start the first connect.
    ///
    /// Returns once the work is scheduled; the connect itself runs
    /// concurrently. Calling it again is a no-op.
    pub fn initialize(&self) -> Result<()> {
        {
            let state = self.inner.state.borrow();
            if state.closed_by_caller {
                return Err(StreamError::ClosedByCaller);
            }
            if state.initialized {
                debug!(session = %self.inner.session, "already initialized");
                return Ok(());
            }
        }

        let weak = Rc::downgrade(&self.inner);
        let watchdog = self.inner.tasks.register(
            move || {
                let conn = upgrade(&weak);
                async move {
                    if let Some(conn) = conn {
                        conn.check_connection().await;
                    }
                }
            },
            self.inner.config.check_interval,
        )?;

        let heartbeat = if self.inner.config.heartbeat_enabled() {
            let weak = Rc::downgrade(&self.inner);
            let registered = self.inner.tasks.register(
                move || {
                    let conn = upgrade(&weak);
                    async move {
                        match conn {
                            Some(conn) => conn.send_heartbeat().await,
                            None => Ok(()),
                        }
                    }
                },
                self.inner.config.heartbeat_interval,
            );
            match registered {
                Ok(id) => Some(id),
                Err(e) => {
                    self.inner.tasks.unregister(watchdog);
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        {
            let mut state = self.inner.state.borrow_mut();
            state.initialized = true;
            state.watchdog = Some(watchdog);
            state.heartbeat_task = heartbeat;
        }

        info!(
            url = %self.inner.config.url,
            session = %self.inner.session,
            check_ms = self.inner.config.check_interval.as_millis() as u64,
            heartbeat_ms = self.inner.config.heartbeat_interval.as_millis() as u64,
            "connection initialized"
        );

        let conn = self.clone();
        spawn_isolated(format!("{}-connect", self.inner.session), async move {
            // Failures are logged by the attempt; the watchdog retries
            let _ = conn.connect().await;
        });
        Ok(())
    }

    /// Caller-initiated reconnect.
    ///
    /// Resets the failure counter, so it also re-arms automatic reconnects
    /// after `max_attempts` was exhausted. Supersedes an automatic reconnect
    /// still waiting out its backoff. No-op once closed or while a connect
    /// is in flight.
    pub async fn reconnect(&self) -> Result<()> {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.closed_by_caller {
                info!(session = %self.inner.session, "reconnect ignored: connection closed");
                return Ok(());
            }
            let backing_off = state.backoff == Some(state.generation);
            if state.phase == ConnectionState::Connecting && !backing_off {
                debug!(session = %self.inner.session, "reconnect ignored: connect in flight");
                return Ok(());
            }
            state.consecutive_failures = 0;
        }

        info!(url = %self.inner.config.url, session = %self.inner.session, "reconnecting on request");
        self.connect().await
    }

    /// Watchdog tick: reconnect when the socket is gone
    pub async fn check_connection(&self) {
        let (generation, reason) = {
            let state = self.inner.state.borrow();
            if !state.initialized || state.closed_by_caller {
                debug!(session = %self.inner.session, "watchdog: connection not active");
                return;
            }

            let reason = match (&state.socket, state.phase) {
                (Some(socket), _) if socket.status.is_closed() => Some("socket closed"),
                (Some(_), _) => None,
                (None, ConnectionState::Connecting) => None,
                (None, _) => Some("not connected"),
            };
            (state.generation, reason)
        };

        match reason {
            Some(reason) => {
                warn!(url = %self.inner.config.url, session = %self.inner.session, reason, "watchdog: connection lost");
                self.auto_reconnect(generation, reason).await;
            }
            None => trace!(session = %self.inner.session, "watchdog: healthy"),
        }
    }

    /// Heartbeat tick: send the keep-alive payload if one is set
    pub async fn send_heartbeat(&self) -> Result<()> {
        let (writer, generation) = {
            let state = self.inner.state.borrow();
            match &state.socket {
                Some(socket) => (socket.writer.clone(), state.generation),
                None => {
                    warn!(session = %self.inner.session, "heartbeat skipped: no socket");
                    return Ok(());
                }
            }
        };

        let Some(payload) = self.inner.heartbeat.get() else {
            return Ok(());
        };
        let message = payload.to_outbound()?;

        let result = writer.lock().await.send(message).await;
        match result {
            Ok(()) => {
                self.inner.state.borrow_mut().heartbeats_sent += 1;
                trace!(session = %self.inner.session, "heartbeat sent");
                Ok(())
            }
            Err(e) if e.is_connection_lost() => {
                self.inner.state.borrow_mut().error_count += 1;
                error!(url = %self.inner.config.url, session = %self.inner.session, "heartbeat failed: {}", e);
                self.spawn_auto_reconnect(generation, "heartbeat failed");
                Ok(())
            }
            Err(e) => {
                self.inner.state.borrow_mut().error_count += 1;
                Err(e)
            }
        }
    }

    /// Close for good: no automatic reconnect afterwards
    pub async fn close(&self) {
        let (socket, tasks) = {
            let mut state = self.inner.state.borrow_mut();
            if state.closed_by_caller {
                return;
            }
            state.closed_by_caller = true;
            state.phase = ConnectionState::Closing;
            state.generation += 1;
            (state.socket.take(), [state.watchdog.take(), state.heartbeat_task.take()])
        };

        for task_id in tasks.into_iter().flatten() {
            self.inner.tasks.unregister(task_id);
        }
        if let Some(socket) = socket {
            close_socket(socket).await;
        }

        self.inner.state.borrow_mut().phase = ConnectionState::Closed;
        info!(url = %self.inner.config.url, session = %self.inner.session, "connection closed");
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Outbound::Text(text.into())).await
    }

    pub async fn send_json<T: Serialize>(&self, value: &T) -> Result<()> {
        let text = serde_json::to_string(value)?;
        self.send(Outbound::Text(text)).await
    }

    pub async fn send_binary(&self, data: Vec<u8>) -> Result<()> {
        self.send(Outbound::Binary(data)).await
    }

    async fn send(&self, message: Outbound) -> Result<()> {
        let writer = {
            let state = self.inner.state.borrow();
            if state.closed_by_caller {
                return Err(StreamError::ClosedByCaller);
            }
            state
                .socket
                .as_ref()
                .map(|socket| socket.writer.clone())
                .ok_or(StreamError::NotConnected)?
        };

        let result = writer.lock().await.send(message).await;
        if result.is_err() {
            self.inner.state.borrow_mut().error_count += 1;
        }
        result
    }

    /// One connect sequence: drop the old socket, open a new one
    async fn connect(&self) -> Result<()> {
        let generation = self.begin_connecting()?;
        self.discard_socket().await;
        self.attempt(generation).await
    }

    /// Reconnect triggered by a loss signal observed at `observed` generation
    async fn auto_reconnect(&self, observed: u64, reason: &'static str) {
        let (generation, failures) = {
            let mut state = self.inner.state.borrow_mut();
            if state.closed_by_caller || state.generation != observed || state.phase == ConnectionState::Connecting {
                debug!(session = %self.inner.session, reason, "reconnect already handled");
                return;
            }
            let failures = state.consecutive_failures;
            if !self.inner.config.reconnect.allows(failures) {
                warn!(
                    session = %self.inner.session,
                    failures,
                    "automatic reconnect suppressed; call reconnect() to retry"
                );
                return;
            }
            state.phase = ConnectionState::Connecting;
            state.generation += 1;
            (state.generation, failures)
        };

        self.discard_socket().await;

        let delay = self.inner.config.reconnect.delay_for(failures);
        info!(
            url = %self.inner.config.url,
            session = %self.inner.session,
            reason,
            delay_ms = delay.as_millis() as u64,
            "reconnecting"
        );
        if !delay.is_zero() {
            self.inner.state.borrow_mut().backoff = Some(generation);
            monoio::time::sleep(delay).await;

            let superseded = {
                let mut state = self.inner.state.borrow_mut();
                if state.backoff == Some(generation) {
                    state.backoff = None;
                }
                state.generation != generation
            };
            if superseded {
                debug!(session = %self.inner.session, reason, "backoff superseded");
                return;
            }
        }

        let _ = self.attempt(generation).await;
    }

    fn spawn_auto_reconnect(&self, observed: u64, reason: &'static str) {
        let conn = self.clone();
        spawn_isolated(format!("{}-reconnect", self.inner.session), async move {
            conn.auto_reconnect(observed, reason).await;
        });
    }

    fn begin_connecting(&self) -> Result<u64> {
        let mut state = self.inner.state.borrow_mut();
        if state.closed_by_caller {
            return Err(StreamError::ClosedByCaller);
        }
        state.phase = ConnectionState::Connecting;
        state.generation += 1;
        state.backoff = None;
        Ok(state.generation)
    }

    async fn discard_socket(&self) {
        let socket = self.inner.state.borrow_mut().socket.take();
        if let Some(socket) = socket {
            close_socket(socket).await;
        }
    }

    async fn attempt(&self, generation: u64) -> Result<()> {
        if !self.is_generation(generation) {
            return Err(StreamError::ClosedByCaller);
        }

        let config = &self.inner.config;
        debug!(url = %config.url, session = %self.inner.session, "connecting");

        let connecting = self.inner.connector.connect(&config.url, config.proxy.as_ref());
        let result = match monoio::time::timeout(config.connect_timeout, connecting).await {
            Ok(result) => result,
            Err(_) => Err(StreamError::NetworkError(format!(
                "connect timed out after {}ms",
                config.connect_timeout.as_millis()
            ))),
        };

        match result {
            Ok(socket) => self.on_open(socket, generation).await,
            Err(e) => {
                let mut state = self.inner.state.borrow_mut();
                state.consecutive_failures += 1;
                state.error_count += 1;
                if state.generation == generation && !state.closed_by_caller {
                    state.phase = ConnectionState::Disconnected;
                }
                error!(
                    url = %config.url,
                    session = %self.inner.session,
                    failures = state.consecutive_failures,
                    "connect failed: {}",
                    e
                );
                Err(e)
            }
        }
    }

    async fn on_open(&self, socket: Socket, generation: u64) -> Result<()> {
        let Socket { reader, writer, status } = socket;
        let (stop_reader, stop) = oneshot::channel();
        let active = ActiveSocket {
            writer: Rc::new(Mutex::new(writer)),
            status,
            stop_reader,
        };

        let superseded = {
            let mut state = self.inner.state.borrow_mut();
            if state.generation == generation && !state.closed_by_caller {
                state.socket = Some(active);
                state.phase = ConnectionState::Connected;
                state.connects += 1;
                state.consecutive_failures = 0;
                state.connected_at = Some(Timestamp::now());
                None
            } else {
                Some(active)
            }
        };

        if let Some(active) = superseded {
            debug!(session = %self.inner.session, "connect superseded, dropping socket");
            close_socket(active).await;
            return Err(StreamError::ConnectionClosed("connect superseded".to_string()));
        }

        info!(url = %self.inner.config.url, session = %self.inner.session, "connected");

        let session = &self.inner.session;
        spawn_isolated(format!("{session}-on-connected"), self.inner.handlers.connected());

        let conn = self.clone();
        spawn_isolated(format!("{session}-receive"), async move {
            conn.receive_loop(reader, stop, generation).await;
        });
        Ok(())
    }

    async fn receive_loop(
        &self,
        mut reader: Box<dyn FrameReader>,
        mut stop: oneshot::Receiver<()>,
        generation: u64,
    ) {
        loop {
            // A discarded socket may never see another byte from its peer
            let frame = match future::select(reader.next_frame(), &mut stop).await {
                Either::Left((frame, _)) => frame,
                Either::Right(_) => {
                    debug!(session = %self.inner.session, "socket discarded, receive loop exiting");
                    return;
                }
            };
            let kind = frame.kind();
            if !self.is_current(generation) {
                debug!(session = %self.inner.session, kind, "socket superseded, receive loop exiting");
                return;
            }

            let session = &self.inner.session;
            match frame {
                Inbound::Text(text) => {
                    self.inner.state.borrow_mut().frames_received += 1;
                    let payload = TextPayload::decode(text);
                    spawn_isolated(format!("{session}-on-text"), self.inner.handlers.text(payload));
                }
                Inbound::Binary(data) => {
                    self.inner.state.borrow_mut().frames_received += 1;
                    spawn_isolated(format!("{session}-on-binary"), self.inner.handlers.binary(data));
                }
                Inbound::Close { code, reason } => {
                    warn!(url = %self.inner.config.url, session = %session, ?code, %reason, "server closed the connection");
                    self.on_lost(generation, "close frame");
                    return;
                }
                Inbound::Closing | Inbound::Closed => {
                    warn!(url = %self.inner.config.url, session = %session, kind, "socket closed");
                    self.on_lost(generation, "socket closed");
                    return;
                }
                Inbound::Error(e) => {
                    self.inner.state.borrow_mut().error_count += 1;
                    error!(url = %self.inner.config.url, session = %session, "socket error: {}", e);
                    self.on_lost(generation, "socket error");
                    return;
                }
                Inbound::Other(detail) => {
                    warn!(session = %session, %detail, "unhandled inbound message");
                }
            }
        }
    }

    fn on_lost(&self, generation: u64, reason: &'static str) {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.generation == generation && state.phase == ConnectionState::Connected {
                state.phase = ConnectionState::Disconnected;
                if let Some(socket) = &state.socket {
                    socket.status.mark_closed();
                }
            }
        }
        self.spawn_auto_reconnect(generation, reason);
    }

    fn is_generation(&self, generation: u64) -> bool {
        let state = self.inner.state.borrow();
        state.generation == generation && !state.closed_by_caller
    }

    fn is_current(&self, generation: u64) -> bool {
        let state = self.inner.state.borrow();
        state.generation == generation && state.phase == ConnectionState::Connected
    }
}

impl fmt::Debug for StreamingConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingConnection")
            .field("url", &self.inner.config.url.as_str())
            .field("session", &self.inner.session)
            .field("state", &self.state())
            .finish()
    }
}

fn upgrade(weak: &Weak<Inner>) -> Option<StreamingConnection> {
    weak.upgrade().map(|inner| StreamingConnection { inner })
}

/// Close handshake, then release both halves of the socket
async fn close_socket(socket: ActiveSocket) {
    let ActiveSocket { writer, status, stop_reader } = socket;
    let closing = async { writer.lock().await.close().await };
    match monoio::time::timeout(SOCKET_CLOSE_TIMEOUT, closing).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("socket close failed: {}", e),
        Err(_) => debug!("socket close timed out"),
    }
    status.mark_closed();
    // The receive loop may already be gone
    let _ = stop_reader.send(());
}
