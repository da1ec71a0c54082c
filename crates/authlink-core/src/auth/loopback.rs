//! Localhost listener that receives the login redirect on desktop hosts.
//!
//! Only the raw request target is captured here. Parsing and the allow-list
//! check stay in [`CallbackReceiver`](super::CallbackReceiver).

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::callback::CallbackEvent;
use crate::error::SessionError;

/// Path the backend is asked to redirect to.
pub const CALLBACK_PATH: &str = "/callback";

/// Upper bound on the request line plus headers we are willing to read.
const MAX_REQUEST_HEAD: u64 = 16 * 1024;

/// How long one connection may take to send its request head.
/// Browsers open speculative connections that never send anything.
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);

const SUCCESS_PAGE: &str = "<html><body><h2>Login received</h2><p>You can close this window and return to the application.</p></body></html>";

pub struct LoopbackListener {
    listener: TcpListener,
    addr: SocketAddr,
}

impl LoopbackListener {
    /// Bind on 127.0.0.1. Port 0 picks a free port.
    pub async fn bind(port: u16) -> Result<Self, SessionError> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| SessionError::Network(format!("Failed to bind callback listener: {}", e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| SessionError::Network(e.to_string()))?;
        info!(port = addr.port(), "Callback listener ready");
        Ok(Self { listener, addr })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// The redirect URI to hand to the backend.
    pub fn redirect_uri(&self) -> String {
        format!("http://127.0.0.1:{}{}", self.addr.port(), CALLBACK_PATH)
    }

    /// Wait for a request on [`CALLBACK_PATH`] and return it as an event.
    /// Other requests (favicon fetches and the like) get a 404 and are skipped.
    pub async fn wait_for_callback(self, timeout: Duration) -> Result<CallbackEvent, SessionError> {
        match tokio::time::timeout(timeout, self.accept_callback()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "No callback received before timeout");
                Err(SessionError::LoginTimedOut)
            }
        }
    }

    /// Each connection is served on its own task so a silent one cannot hold
    /// up the redirect arriving on another.
    async fn accept_callback(&self) -> Result<CallbackEvent, SessionError> {
        let (callback_tx, mut callback_rx) = mpsc::channel::<String>(1);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (socket, peer) = accepted.map_err(|e| {
                        SessionError::Network(format!("Callback listener accept failed: {}", e))
                    })?;
                    tokio::spawn(serve_connection(socket, peer, callback_tx.clone()));
                }
                Some(target) = callback_rx.recv() => {
                    return Ok(CallbackEvent::Loopback(format!(
                        "http://127.0.0.1:{}{}",
                        self.addr.port(),
                        target
                    )));
                }
            }
        }
    }
}

async fn serve_connection(mut socket: TcpStream, peer: SocketAddr, callbacks: mpsc::Sender<String>) {
    let target = match tokio::time::timeout(REQUEST_READ_TIMEOUT, read_request_target(&mut socket)).await {
        Ok(Ok(target)) => target,
        Ok(Err(e)) => {
            debug!(%peer, error = %e, "Failed to read request");
            return;
        }
        Err(_) => {
            debug!(%peer, "Connection sent no request in time, dropping it");
            return;
        }
    };

    match target {
        Some(target) if target.starts_with(CALLBACK_PATH) => {
            send_response(&mut socket, 200, "OK", SUCCESS_PAGE).await;
            // Closed once the first callback has been taken.
            let _ = callbacks.send(target).await;
        }
        _ => {
            debug!(%peer, "Ignoring non-callback request");
            send_response(&mut socket, 404, "Not Found", "Not Found").await;
        }
    }
}

/// Read `GET <target> HTTP/1.1` and return the target. Headers are read and
/// discarded so the socket is drained before we answer. At most
/// [`MAX_REQUEST_HEAD`] bytes are read; a request line cut off by that limit
/// is rejected.
async fn read_request_target(socket: &mut TcpStream) -> std::io::Result<Option<String>> {
    let mut reader = BufReader::new(socket).take(MAX_REQUEST_HEAD);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    if !request_line.ends_with('\n') {
        return Ok(None);
    }

    let mut header_line = String::new();
    loop {
        header_line.clear();
        let read = reader.read_line(&mut header_line).await?;
        if read == 0 || header_line.trim().is_empty() {
            break;
        }
    }

    let mut parts = request_line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("GET"), Some(target)) => Ok(Some(target.to_string())),
        _ => Ok(None),
    }
}

async fn send_response(socket: &mut TcpStream, status: u16, reason: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
    );
    if let Err(e) = socket.write_all(response.as_bytes()).await {
        debug!(error = %e, "Failed to write callback response");
    }
    let _ = socket.shutdown().await;
}
