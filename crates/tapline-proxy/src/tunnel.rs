//! CONNECT tunnelling for HTTPS.
//!
//! A tunnel moves through these states:
//!
//! ```text
//! PENDING ──► CONNECTING ──► ESTABLISHED ──► CLOSED
//!                  │               │
//!                  └──► ERROR ◄────┘
//! ```
//!
//! Only the CONNECT exchange itself is recorded as a transaction. Once the
//! tunnel is established the bytes are relayed unmodified and never inspected.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use crate::error::{ProxyError, Result};
use crate::transaction::{
    HeaderRecord, RequestRecord, ResponseRecord, TransactionId, TransactionStore,
};

/// Sent to the client once the upstream connection is open.
pub const ESTABLISHED_RESPONSE: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Sent to the client when the upstream connection fails.
pub const BAD_GATEWAY_RESPONSE: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

const BAD_REQUEST_RESPONSE: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";

/// Port used when the CONNECT target omits one or it does not parse.
pub const DEFAULT_TUNNEL_PORT: u16 = 443;

/// Upper bound on the size of a CONNECT request head.
const MAX_HEAD_LEN: usize = 16 * 1024;

/// Lifecycle of one tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// CONNECT request observed, transaction opened.
    Pending,
    /// Outbound connection in progress.
    Connecting,
    /// Bytes are being relayed in both directions.
    Established,
    /// One side closed and the other was closed with it.
    Closed,
    /// The upstream connection failed or the relay broke.
    Error,
}

/// A parsed CONNECT request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// The raw request target, `host:port`.
    pub target: String,
    pub host: String,
    pub port: u16,
    pub headers: HeaderRecord,
    /// Bytes that arrived after the head; they belong to the tunnelled stream.
    pub leftover: Vec<u8>,
}

/// Splits a CONNECT target into host and port.
pub fn parse_target(target: &str) -> (String, u16) {
    let parse_port = |port: &str| {
        port.parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .unwrap_or(DEFAULT_TUNNEL_PORT)
    };

    if let Some(rest) = target.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail
                .strip_prefix(':')
                .map(parse_port)
                .unwrap_or(DEFAULT_TUNNEL_PORT);
            return (host.to_string(), port);
        }
    }

    match target.split_once(':') {
        Some((host, port)) => (host.to_string(), parse_port(port)),
        None => (target.to_string(), DEFAULT_TUNNEL_PORT),
    }
}

/// Parses a CONNECT request head (without the terminating blank line) into
/// its target and headers.
pub fn parse_head(head: &str) -> Result<(String, HeaderRecord)> {
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();

    let mut parts = request_line.split_whitespace();
    let target = match (parts.next(), parts.next(), parts.next()) {
        (Some("CONNECT"), Some(target), Some(version)) if version.starts_with("HTTP/") => target,
        _ => {
            return Err(ProxyError::Tunnel(format!(
                "malformed CONNECT request line: {:?}",
                request_line
            )))
        }
    };

    let mut headers = HeaderRecord::new();
    for line in lines.take_while(|l| !l.is_empty()) {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    Ok((target.to_string(), headers))
}

/// Reads a CONNECT request head from `stream`.
pub async fn read_connect_request<S>(stream: &mut S) -> Result<ConnectRequest>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProxyError::Tunnel(
                "client closed before finishing the CONNECT request".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]);
            let (target, headers) = parse_head(&head)?;
            let (host, port) = parse_target(&target);
            return Ok(ConnectRequest {
                target,
                host,
                port,
                headers,
                leftover: buf[end + 4..].to_vec(),
            });
        }

        if buf.len() > MAX_HEAD_LEN {
            return Err(ProxyError::Tunnel("CONNECT request head too large".to_string()));
        }
    }
}

impl ConnectRequest {
    /// Builds a request for `target` whose head was parsed elsewhere.
    pub fn new(target: impl Into<String>, headers: HeaderRecord) -> Self {
        let target = target.into();
        let (host, port) = parse_target(&target);
        Self {
            target,
            host,
            port,
            headers,
            leftover: Vec::new(),
        }
    }
}

/// Handles CONNECT requests, recording each handshake in the store.
#[derive(Debug, Clone)]
pub struct TunnelHandler {
    store: TransactionStore,
}

impl TunnelHandler {
    /// Creates a handler that records into `store`.
    pub fn new(store: TransactionStore) -> Self {
        Self { store }
    }

    /// Opens a transaction for `request` and connects to its target.
    ///
    /// When the target is unreachable the transaction is finalized with a
    /// 502 and the error is returned. The caller then answers the client
    /// with [`BAD_GATEWAY_RESPONSE`].
    pub async fn open(
        &self,
        request: &ConnectRequest,
        peer: Option<SocketAddr>,
    ) -> Result<OpenTunnel> {
        let source_ip = peer
            .map(|p| p.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let record = RequestRecord::new("CONNECT", &request.target, source_ip)
            .with_headers(request.headers.clone());
        let id = self.store.begin(record.clone());

        let mut state = TunnelState::Pending;
        tracing::debug!(
            transaction_id = %id,
            hostname = %request.host,
            port = request.port,
            url = %request.target,
            "HTTPS CONNECT request"
        );

        advance(&mut state, TunnelState::Connecting);
        match TcpStream::connect((request.host.as_str(), request.port)).await {
            Ok(upstream) => Ok(OpenTunnel {
                store: self.store.clone(),
                id,
                record,
                upstream,
                state,
            }),
            Err(e) => {
                advance(&mut state, TunnelState::Error);
                tracing::error!(
                    transaction_id = %id,
                    hostname = %request.host,
                    port = request.port,
                    error = %e,
                    "HTTPS tunnel error"
                );
                let response = ResponseRecord::for_request(&record, 502)
                    .with_body(Some(format!("Tunnel Error: {}", e)));
                self.store.fail(id, response, e.to_string());
                Err(ProxyError::Tunnel(format!(
                    "failed to connect to {}: {}",
                    request.target, e
                )))
            }
        }
    }

    /// Serves one raw client stream whose first request is CONNECT.
    ///
    /// Returns the terminal state of the tunnel. An error is returned only
    /// when the request head itself is unusable, before any transaction is
    /// opened. `shutdown` abandons an established tunnel.
    pub async fn handle<C>(
        &self,
        mut client: C,
        peer: Option<SocketAddr>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<TunnelState>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let request = match read_connect_request(&mut client).await {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "Rejecting CONNECT request");
                let _ = client.write_all(BAD_REQUEST_RESPONSE).await;
                let _ = client.shutdown().await;
                return Err(e);
            }
        };

        let mut tunnel = match self.open(&request, peer).await {
            Ok(tunnel) => tunnel,
            Err(_) => {
                let _ = client.write_all(BAD_GATEWAY_RESPONSE).await;
                let _ = client.shutdown().await;
                return Ok(TunnelState::Error);
            }
        };

        if let Err(e) = client.write_all(ESTABLISHED_RESPONSE).await {
            return Ok(tunnel.abort(e));
        }
        tunnel.established();

        Ok(tunnel.relay(client, &request.leftover, shutdown).await)
    }
}

/// A CONNECT whose upstream connection is open.
///
/// The client has not been answered yet. Call [`established`] once it has
/// been told `200 Connection Established`, then [`relay`]; or [`abort`] if
/// that answer could not be delivered.
///
/// [`established`]: OpenTunnel::established
/// [`relay`]: OpenTunnel::relay
/// [`abort`]: OpenTunnel::abort
#[derive(Debug)]
pub struct OpenTunnel {
    store: TransactionStore,
    id: TransactionId,
    record: RequestRecord,
    upstream: TcpStream,
    state: TunnelState,
}

impl OpenTunnel {
    pub fn transaction_id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    /// Finalizes the CONNECT transaction as a successful 200.
    pub fn established(&mut self) {
        let response = ResponseRecord::for_request(&self.record, 200)
            .with_body(Some("Connection Established".to_string()));
        self.store.complete(self.id, response);
        advance(&mut self.state, TunnelState::Established);
    }

    /// Gives up before the tunnel was established, recording `error`.
    pub fn abort(mut self, error: impl std::fmt::Display) -> TunnelState {
        advance(&mut self.state, TunnelState::Error);
        tracing::error!(
            transaction_id = %self.id,
            error = %error,
            "Client socket error in HTTPS tunnel"
        );
        let response = ResponseRecord::for_request(&self.record, 502);
        self.store.fail(self.id, response, error.to_string());
        self.state
    }

    /// Copies bytes both ways between `client` and the upstream until either
    /// side closes or `shutdown` fires, then closes both.
    ///
    /// `leftover` holds client bytes already read past the CONNECT head.
    pub async fn relay<C>(
        mut self,
        client: C,
        leftover: &[u8],
        mut shutdown: broadcast::Receiver<()>,
    ) -> TunnelState
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let id = self.id;
        if !leftover.is_empty() {
            if let Err(e) = self.upstream.write_all(leftover).await {
                tracing::debug!(transaction_id = %id, error = %e, "Upstream closed early");
                advance(&mut self.state, TunnelState::Error);
                return self.state;
            }
        }

        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut server_read, mut server_write) = self.upstream.into_split();

        let relayed = tokio::select! {
            res = tokio::io::copy(&mut client_read, &mut server_write) => res,
            res = tokio::io::copy(&mut server_read, &mut client_write) => res,
            _ = shutdown.recv() => {
                tracing::debug!(transaction_id = %id, "Abandoning tunnel on shutdown");
                Ok(0)
            }
        };

        // Close both directions so neither side outlives the other.
        let _ = client_write.shutdown().await;
        let _ = server_write.shutdown().await;

        let mut state = self.state;
        match relayed {
            Ok(_) => advance(&mut state, TunnelState::Closed),
            Err(e) => {
                tracing::debug!(transaction_id = %id, error = %e, "Tunnel relay failed");
                advance(&mut state, TunnelState::Error);
            }
        }
        state
    }
}

fn advance(state: &mut TunnelState, next: TunnelState) {
    tracing::trace!(from = ?state, to = ?next, "Tunnel state change");
    *state = next;
}
