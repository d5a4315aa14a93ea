//! HTTP CONNECT tunnelling

use crate::errors::{Result, StreamError};

use base64::Engine;
use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::TcpStream;
use tracing::debug;
use url::Url;

const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Open a TCP connection to `proxy` and ask it to tunnel to `host:port`
pub async fn connect_via_proxy(proxy: &Url, host: &str, port: u16) -> Result<TcpStream> {
    let proxy_host = proxy
        .host_str()
        .ok_or_else(|| StreamError::ProxyError(format!("no host in proxy url {proxy}")))?;
    let proxy_port = proxy.port_or_known_default().unwrap_or(8080);

    let mut stream = TcpStream::connect(format!("{proxy_host}:{proxy_port}"))
        .await
        .map_err(|e| StreamError::from_io("proxy connect", e))?;
    stream.set_nodelay(true).ok();

    let request = connect_request(proxy, host, port);
    let (result, _) = stream.write_all(request.into_bytes()).await;
    result.map_err(|e| StreamError::from_io("proxy CONNECT write", e))?;

    let mut head = Vec::with_capacity(1024);
    loop {
        let buf = vec![0u8; 1024];
        let (result, buf) = stream.read(buf).await;
        let n = result.map_err(|e| StreamError::from_io("proxy CONNECT read", e))?;
        if n == 0 {
            return Err(StreamError::ProxyError("proxy closed the connection during CONNECT".to_string()));
        }
        head.extend_from_slice(&buf[..n]);

        if find_head_end(&head).is_some() {
            break;
        }
        if head.len() > MAX_RESPONSE_HEAD {
            return Err(StreamError::ProxyError("proxy response head too large".to_string()));
        }
    }

    check_connect_response(&head)?;
    debug!(proxy = %proxy, target = %format!("{host}:{port}"), "proxy tunnel established");
    Ok(stream)
}

fn connect_request(proxy: &Url, host: &str, port: u16) -> String {
    let mut request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\n\
         Host: {host}:{port}\r\n"
    );

    if !proxy.username().is_empty() {
        let credentials = format!("{}:{}", proxy.username(), proxy.password().unwrap_or(""));
        let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
        request.push_str(&format!("Proxy-Authorization: Basic {encoded}\r\n"));
    }

    request.push_str("\r\n");
    request
}

/// Offset just past the blank line ending an HTTP response head
pub(crate) fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

fn check_connect_response(head: &[u8]) -> Result<()> {
    let text = String::from_utf8_lossy(head);
    let status_line = text.lines().next().unwrap_or_default();
    let status = status_line.split_whitespace().nth(1).unwrap_or_default();

    if status == "200" {
        Ok(())
    } else {
        Err(StreamError::ProxyError(format!("CONNECT rejected: {status_line}")))
    }
}
