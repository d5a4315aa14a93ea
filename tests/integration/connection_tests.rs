//! Streaming connection lifecycle over the loopback transport

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::{TcpListener, TcpStream};
use rstest::rstest;
use serde_json::json;
use serial_test::serial;
use tickstream_net::websocket::accept_key;
use tickstream_net::{
    ConnectionConfig, ConnectionState, Handlers, HeartbeatPayload, Inbound, Outbound, ReconnectPolicy, StreamError,
    StreamingConnection, TextPayload,
};
use tickstream_tests::{block_on, fast_scheduler, loopback_config, sleep_ms, wait_until, Counter, Loopback};

fn recording_handlers() -> (Handlers, Rc<RefCell<Vec<TextPayload>>>) {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    let handlers = Handlers::new().on_text(move |payload| {
        sink.borrow_mut().push(payload);
        std::future::ready(())
    });
    (handlers, seen)
}

#[rstest]
#[case::close_frame(Inbound::Close { code: Some(1001), reason: "going away".into() })]
#[case::closed(Inbound::Closed)]
#[case::error(Inbound::Error("stream reset".into()))]
#[serial]
fn loss_signal_reconnects_exactly_once(#[case] signal: Inbound) {
    block_on(|| async move {
        let connected = Counter::new();
        let handlers = Handlers::new().on_connected(connected.callback());
        let lb = Loopback::new(loopback_config(30), handlers);

        lb.conn.initialize().unwrap();
        let first = lb.listener.accept().await.unwrap();
        sleep_ms(5).await;
        assert_eq!(lb.conn.state(), ConnectionState::Connected);

        first.push(signal);
        let second = lb.listener.accept().await.unwrap();
        sleep_ms(5).await;

        assert_eq!(second.index, 2);
        assert_eq!(lb.conn.state(), ConnectionState::Connected);
        assert_eq!(connected.get(), 2);

        // Several watchdog periods: no further attempts
        sleep_ms(120).await;
        assert_eq!(lb.connector.attempts(), 2);
        assert!(lb.listener.try_accept().is_none());
        assert_eq!(lb.conn.health().reconnect_count, 1);
    });
}

#[test]
#[serial]
fn no_stale_frames_after_reconnect() {
    block_on(|| async {
        let (handlers, seen) = recording_handlers();
        let lb = Loopback::new(loopback_config(30), handlers);

        lb.conn.initialize().unwrap();
        let first = lb.listener.accept().await.unwrap();
        sleep_ms(5).await;

        first.push_text("before");
        first.push(Inbound::Closed);
        // Anything queued behind the loss signal belongs to a dead socket
        first.push_text("stale");

        let second = lb.listener.accept().await.unwrap();
        second.push_text("after");
        sleep_ms(20).await;

        assert_eq!(
            seen.borrow().as_slice(),
            &[TextPayload::Raw("before".into()), TextPayload::Raw("after".into())]
        );
    });
}

#[test]
#[serial]
fn close_stops_everything() {
    block_on(|| async {
        let lb = Loopback::new(loopback_config(20), Handlers::new());
        lb.conn.set_heartbeat_payload(HeartbeatPayload::Text("ping".into())).unwrap();

        lb.conn.initialize().unwrap();
        let peer = lb.listener.accept().await.unwrap();
        sleep_ms(5).await;

        lb.conn.close().await;
        assert_eq!(lb.conn.state(), ConnectionState::Closed);
        assert!(peer.is_closed());
        assert!(lb.scheduler.is_empty());

        sleep_ms(100).await;
        assert_eq!(lb.connector.attempts(), 1);
        assert_eq!(lb.conn.state(), ConnectionState::Closed);

        // Idempotent
        lb.conn.close().await;
        assert_eq!(lb.conn.state(), ConnectionState::Closed);
    });
}

#[test]
#[serial]
fn heartbeat_sends_one_payload_per_interval() {
    block_on(|| async {
        let config = loopback_config(1_000).with_heartbeat_interval(Duration::from_millis(40));
        let lb = Loopback::new(config, Handlers::new());
        lb.conn
            .set_heartbeat_payload(HeartbeatPayload::Json(json!({"op": "ping"})))
            .unwrap();

        lb.conn.initialize().unwrap();
        let peer = lb.listener.accept().await.unwrap();

        sleep_ms(220).await;
        let sent = peer.drain_sent();
        assert!((4..=6).contains(&sent.len()), "sent {} heartbeats", sent.len());
        assert!(sent.iter().all(|m| *m == Outbound::Text(r#"{"op":"ping"}"#.into())));
        assert_eq!(lb.conn.health().heartbeats_sent, sent.len() as u64);
    });
}

#[test]
#[serial]
fn heartbeat_without_payload_sends_nothing() {
    block_on(|| async {
        let config = loopback_config(1_000).with_heartbeat_interval(Duration::from_millis(20));
        let lb = Loopback::new(config, Handlers::new());

        lb.conn.initialize().unwrap();
        let peer = lb.listener.accept().await.unwrap();

        sleep_ms(100).await;
        assert!(peer.drain_sent().is_empty());
        assert!(lb.conn.is_connected());
    });
}

#[test]
#[serial]
fn failed_heartbeat_triggers_reconnect() {
    block_on(|| async {
        // Watchdog far away: only the heartbeat can notice the dead socket
        let config = loopback_config(10_000).with_heartbeat_interval(Duration::from_millis(20));
        let lb = Loopback::new(config, Handlers::new());
        lb.conn.set_heartbeat_payload(HeartbeatPayload::Text("ping".into())).unwrap();

        lb.conn.initialize().unwrap();
        let first = lb.listener.accept().await.unwrap();
        sleep_ms(5).await;

        first.reset();
        let second = lb.listener.accept().await.unwrap();
        assert_eq!(second.index, 2);
        sleep_ms(5).await;
        assert!(lb.conn.is_connected());
    });
}

#[test]
#[serial]
fn watchdog_detects_silently_dead_socket() {
    block_on(|| async {
        let lb = Loopback::new(loopback_config(30), Handlers::new());

        lb.conn.initialize().unwrap();
        let first = lb.listener.accept().await.unwrap();
        sleep_ms(5).await;

        first.reset();
        let second = lb.listener.accept().await.unwrap();
        assert_eq!(second.index, 2);
    });
}

#[test]
#[serial]
fn watchdog_recovers_failed_initial_connect() {
    block_on(|| async {
        let lb = Loopback::new(loopback_config(30), Handlers::new());
        lb.connector.refuse_next(1);

        lb.conn.initialize().unwrap();
        sleep_ms(5).await;
        assert_eq!(lb.conn.state(), ConnectionState::Disconnected);
        assert_eq!(lb.conn.health().consecutive_failures, 1);

        let peer = lb.listener.accept().await.unwrap();
        assert_eq!(peer.index, 2);
        sleep_ms(5).await;
        assert!(lb.conn.is_connected());
        assert_eq!(lb.conn.health().consecutive_failures, 0);
    });
}

#[test]
#[serial]
fn automatic_reconnects_stop_after_max_attempts() {
    block_on(|| async {
        let config = loopback_config(20).with_reconnect(
            ReconnectPolicy::default()
                .with_initial_delay(Duration::from_millis(5))
                .with_max_delay(Duration::from_millis(10))
                .with_jitter(0.0)
                .with_max_attempts(Some(2)),
        );
        let lb = Loopback::new(config, Handlers::new());
        lb.connector.refuse_next(u32::MAX);

        lb.conn.initialize().unwrap();
        sleep_ms(250).await;
        // Initial attempt plus two automatic retries
        assert_eq!(lb.connector.attempts(), 3);
        assert_eq!(lb.conn.state(), ConnectionState::Disconnected);

        // An explicit reconnect is always honoured
        assert!(matches!(lb.conn.reconnect().await, Err(StreamError::NetworkError(_))));
        assert_eq!(lb.connector.attempts(), 4);
    });
}

#[test]
#[serial]
fn missing_handlers_do_not_disturb_the_connection() {
    block_on(|| async {
        let lb = Loopback::new(loopback_config(30), Handlers::new());

        lb.conn.initialize().unwrap();
        let peer = lb.listener.accept().await.unwrap();
        peer.push_text(r#"{"tick":1}"#);
        peer.push(Inbound::Binary(vec![0x1f, 0x8b]));
        peer.push(Inbound::Other("opcode 0x3".into()));

        sleep_ms(60).await;
        assert!(lb.conn.is_connected());
        assert_eq!(lb.connector.attempts(), 1);
        assert_eq!(lb.conn.health().frames_received, 2);
    });
}

#[test]
#[serial]
fn binary_frames_reach_their_handler() {
    block_on(|| async {
        let received = Rc::new(RefCell::new(Vec::new()));
        let sink = received.clone();
        let handlers = Handlers::new().on_binary(move |data| {
            sink.borrow_mut().push(data);
            async { Ok::<(), StreamError>(()) }
        });
        let lb = Loopback::new(loopback_config(30), handlers);

        lb.conn.initialize().unwrap();
        let peer = lb.listener.accept().await.unwrap();
        peer.push(Inbound::Binary(vec![1, 2, 3]));
        sleep_ms(10).await;

        assert_eq!(received.borrow().as_slice(), &[vec![1, 2, 3]]);
    });
}

/// Complete the WebSocket upgrade, then never send anything
#[cfg(target_os = "linux")]
async fn accept_silently(mut stream: TcpStream) -> Option<TcpStream> {
    let mut request: Vec<u8> = Vec::new();
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        let (n, chunk) = stream.read(vec![0u8; 1024]).await;
        let n = n.ok().filter(|n| *n > 0)?;
        request.extend_from_slice(&chunk[..n]);
    }
    let request = String::from_utf8(request).ok()?;
    let key = request
        .lines()
        .find_map(|line| line.strip_prefix("Sec-WebSocket-Key: "))?
        .trim()
        .to_string();

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(&key)
    );
    let (result, _) = stream.write_all(response.into_bytes()).await;
    result.ok()?;
    Some(stream)
}

#[cfg(target_os = "linux")]
fn open_fds() -> usize {
    std::fs::read_dir("/proc/self/fd").map(|dir| dir.count()).unwrap_or(0)
}

#[cfg(target_os = "linux")]
#[test]
#[serial]
fn reconnect_releases_superseded_tcp_sockets() {
    block_on(|| async {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let held = Rc::new(RefCell::new(Vec::<TcpStream>::new()));
        let server_held = held.clone();
        let _server = monoio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if let Some(stream) = accept_silently(stream).await {
                    server_held.borrow_mut().push(stream);
                }
            }
        });

        let config = ConnectionConfig::new(&format!("ws://{addr}/stream"))
            .unwrap()
            .with_check_interval(Duration::from_secs(10))
            .with_heartbeat_interval(Duration::ZERO);
        let conn = StreamingConnection::new(config, fast_scheduler(), Handlers::new());
        conn.initialize().unwrap();
        assert!(wait_until(Duration::from_secs(2), || conn.is_connected() && held.borrow().len() == 1).await);
        let before = open_fds();

        for _ in 0..5 {
            conn.reconnect().await.unwrap();
        }
        assert!(wait_until(Duration::from_secs(2), || held.borrow().len() == 6).await);

        // The server keeps all five new streams; the client only its current socket
        wait_until(Duration::from_secs(2), || open_fds() <= before + 5).await;
        assert_eq!(open_fds(), before + 5);

        conn.close().await;
    });
}
