//! rustls session shared by the two halves of a split TCP stream
//!
//! monoio sockets use owned buffers, so TLS records are produced and consumed
//! in memory: the writer encrypts into a `Vec<u8>` and ships it, the reader
//! feeds received ciphertext and drains plaintext. The session sits behind
//! `Rc<RefCell<..>>`; no borrow is held across an `.await`.

use crate::errors::{Result, StreamError};

use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::TcpStream;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection};
use std::cell::RefCell;
use std::io::{Cursor, ErrorKind, Read, Write};
use std::rc::Rc;
use std::sync::Arc;
use tracing::debug;

const TLS_READ_CHUNK: usize = 16 * 1024;

/// Client config trusting the webpki root set
pub fn default_client_config() -> Arc<ClientConfig> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    )
}

/// Outcome of draining decrypted data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drained {
    /// More records may follow
    Open,
    /// Peer sent close_notify
    PeerClosed,
}

#[derive(Clone)]
pub struct TlsSession {
    conn: Rc<RefCell<ClientConnection>>,
}

impl TlsSession {
    /// Run the TLS handshake over `stream` before it is split
    pub async fn handshake(stream: &mut TcpStream, host: &str, config: Arc<ClientConfig>) -> Result<Self> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| StreamError::TlsError(format!("invalid server name {host}: {e}")))?;
        let mut conn = ClientConnection::new(config, server_name)?;

        loop {
            while conn.wants_write() {
                let mut out = Vec::with_capacity(4096);
                conn.write_tls(&mut out)
                    .map_err(|e| StreamError::TlsError(format!("TLS write failed: {e}")))?;
                if !out.is_empty() {
                    let (result, _) = stream.write_all(out).await;
                    result.map_err(|e| StreamError::from_io("TLS handshake write", e))?;
                }
            }

            if !conn.is_handshaking() {
                break;
            }

            if !conn.wants_read() {
                return Err(StreamError::TlsError("TLS handshake stalled".to_string()));
            }

            let buf = vec![0u8; TLS_READ_CHUNK];
            let (result, buf) = stream.read(buf).await;
            let n = result.map_err(|e| StreamError::from_io("TLS handshake read", e))?;
            if n == 0 {
                return Err(StreamError::ConnectionClosed("connection closed during TLS handshake".to_string()));
            }
            feed(&mut conn, &buf[..n])?;
        }

        debug!(host, "TLS handshake completed");
        Ok(Self {
            conn: Rc::new(RefCell::new(conn)),
        })
    }

    /// Encrypt application data into TLS records ready for the wire.
    ///
    /// Records queued by the read side (key updates) go out with it.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut conn = self.conn.borrow_mut();
        conn.writer()
            .write_all(plaintext)
            .map_err(|e| StreamError::TlsError(format!("TLS application write failed: {e}")))?;
        flush_records(&mut conn)
    }

    /// Feed ciphertext and append any decrypted bytes to `plaintext`
    pub fn decrypt(&self, ciphertext: &[u8], plaintext: &mut Vec<u8>) -> Result<Drained> {
        let mut conn = self.conn.borrow_mut();
        feed(&mut conn, ciphertext)?;
        drain(&mut conn, plaintext)
    }

    /// close_notify alert ready for the wire
    pub fn close_notify(&self) -> Result<Vec<u8>> {
        let mut conn = self.conn.borrow_mut();
        conn.send_close_notify();
        flush_records(&mut conn)
    }
}

fn feed(conn: &mut ClientConnection, ciphertext: &[u8]) -> Result<()> {
    let mut cursor = Cursor::new(ciphertext);
    while (cursor.position() as usize) < ciphertext.len() {
        conn.read_tls(&mut cursor)
            .map_err(|e| StreamError::TlsError(format!("TLS read failed: {e}")))?;
        conn.process_new_packets()?;
    }
    Ok(())
}

fn drain(conn: &mut ClientConnection, plaintext: &mut Vec<u8>) -> Result<Drained> {
    let mut chunk = [0u8; 4096];
    loop {
        match conn.reader().read(&mut chunk) {
            Ok(0) => return Ok(Drained::PeerClosed),
            Ok(n) => plaintext.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(Drained::Open),
            Err(e) => return Err(StreamError::from_io("TLS read", e)),
        }
    }
}

fn flush_records(conn: &mut ClientConnection) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    while conn.wants_write() {
        conn.write_tls(&mut out)
            .map_err(|e| StreamError::TlsError(format!("TLS write failed: {e}")))?;
    }
    Ok(out)
}
