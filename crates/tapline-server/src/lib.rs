//! Tapline Server - listening socket and control API.
//!
//! One TCP listener serves everything as HTTP/1.1. A `CONNECT` request, at any
//! point on a keep-alive connection, is answered here and the connection is
//! handed to the tunnel handler through hyper's upgrade API. Every other
//! request goes to the axum router below.
//!
//! ## Endpoints
//!
//! - `GET /proxy/status` - Server status and configuration
//! - `GET /proxy/logs` - In-flight transactions
//! - `GET /proxy/system-settings` - System proxy settings per network service
//! - `POST /proxy/system-enable` - Route the system through this proxy
//! - `POST /proxy/system-disable` - Turn system proxying off
//! - `POST /proxy/system-restore` - Restore a backup snapshot
//! - `GET /proxy/system-permissions` - Probe for sufficient privilege
//! - `ANY /proxy/forward/*` - Explicit forward (`X-Target-URL` override)
//! - `ANY *` - Catch-all forward (feature `system-proxy`)
//!
//! ## Example
//!
//! ```no_run
//! use tapline_server::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = Server::new(ServerConfig::default()).unwrap();
//!     let handle = server.start().await.unwrap();
//!     tokio::signal::ctrl_c().await.unwrap();
//!     handle.stop().await;
//! }
//! ```

mod capture;
pub mod config;
pub mod error;
mod handlers;
pub mod models;
pub mod state;

use std::net::SocketAddr;

use axum::extract::ConnectInfo;
use axum::http::header::CONNECTION;
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{any, get, post};
use axum::Router;
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tower::ServiceExt;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use tapline_proxy::transaction::record_headers;
use tapline_proxy::{
    ConnectRequest, Forwarder, ProxyError, SystemProxyManager, TransactionStore, TunnelHandler,
};

pub use tapline_proxy::transaction::MAX_RECORDED_BODY;
pub use config::{ConfigError, LogLevel, ServerConfig, DEFAULT_HOST};
pub use error::{ApiError, Result};
pub use state::AppState;

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Host name did not resolve to an address.
    #[error("failed to resolve {0}: {1}")]
    Resolve(String, std::io::Error),

    /// Failed to bind to address.
    #[error("failed to bind to {0}: {1}")]
    BindError(SocketAddr, std::io::Error),

    /// Proxy core error.
    #[error("proxy error: {0}")]
    Proxy(#[from] ProxyError),
}

/// Builds the HTTP router for `state`.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let router = Router::new()
        .route("/proxy/status", get(handlers::status))
        .route("/proxy/logs", get(handlers::logs))
        .route("/proxy/system-settings", get(handlers::system_settings))
        .route("/proxy/system-enable", post(handlers::system_enable))
        .route("/proxy/system-disable", post(handlers::system_disable))
        .route("/proxy/system-restore", post(handlers::system_restore))
        .route("/proxy/system-permissions", get(handlers::system_permissions))
        .route("/proxy/forward", any(handlers::forward_explicit))
        .route("/proxy/forward/{*rest}", any(handlers::forward_explicit));

    #[cfg(feature = "system-proxy")]
    let router = router.fallback(handlers::forward_catch_all);
    #[cfg(not(feature = "system-proxy"))]
    let router = router.fallback(handlers::not_found);

    router
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            capture::capture,
        ))
        .layer(cors)
        .with_state(state)
}

/// The proxy server.
pub struct Server {
    state: AppState,
    router: Router,
}

impl Server {
    /// Creates a new server with the given configuration.
    pub fn new(config: ServerConfig) -> std::result::Result<Self, ServerError> {
        config.validate()?;

        let system_proxy = SystemProxyManager::new(config.backup_dir.clone());
        let state = AppState::new(
            config,
            TransactionStore::new(),
            Forwarder::new()?,
            system_proxy,
        );
        Ok(Self::with_state(state))
    }

    /// Creates a server with custom application state.
    pub fn with_state(state: AppState) -> Self {
        let router = router(state.clone());
        Self { state, router }
    }

    /// Returns the shared state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Returns the router for testing.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Binds the listener and serves connections in the background.
    ///
    /// Returns a handle that can be used to stop the server.
    pub async fn start(self) -> std::result::Result<ServerHandle, ServerError> {
        let config = &self.state.config;
        let addr = resolve(&config.host, config.port).await?;
        let listener = bind(addr)?;
        let addr = listener
            .local_addr()
            .map_err(|e| ServerError::BindError(addr, e))?;

        info!(
            host = %config.host,
            port = addr.port(),
            log_level = %config.log_level,
            https_support = cfg!(feature = "https-tunnel"),
            "Local proxy started"
        );

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut shutdown_rx = shutdown_tx.subscribe();
        let connections = shutdown_tx.clone();
        let tunnel = self.state.tunnel_handler();
        let router = self.router;

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let conn = Connection {
                                router: router.clone(),
                                tunnel: tunnel.clone(),
                                shutdown: connections.subscribe(),
                            };
                            tokio::spawn(conn.serve(stream, peer));
                        }
                        Err(e) => warn!(error = %e, "Failed to accept connection"),
                    },
                    _ = shutdown_rx.recv() => {
                        info!("Proxy shutdown signal received");
                        break;
                    }
                }
            }
        });

        Ok(ServerHandle {
            shutdown_tx,
            addr,
            handle,
        })
    }
}

async fn resolve(host: &str, port: u16) -> std::result::Result<SocketAddr, ServerError> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ServerError::Resolve(host.to_string(), e))?;
    addrs.next().ok_or_else(|| {
        ServerError::Resolve(
            host.to_string(),
            std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses found"),
        )
    })
}

fn bind(addr: SocketAddr) -> std::result::Result<TcpListener, ServerError> {
    let bind_err = |e| ServerError::BindError(addr, e);

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_err)?;

    // Allow address reuse (helps with TIME_WAIT sockets after a restart)
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(1024).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener).map_err(bind_err)
}

/// One accepted connection.
struct Connection {
    router: Router,
    tunnel: TunnelHandler,
    shutdown: broadcast::Receiver<()>,
}

impl Connection {
    async fn serve(mut self, stream: TcpStream, peer: SocketAddr) {
        let router = self.router;
        let tunnel = self.tunnel;
        let tunnels_shutdown = self.shutdown.resubscribe();

        let service = service_fn(move |mut req: hyper::Request<Incoming>| {
            req.extensions_mut().insert(ConnectInfo(peer));
            let router = router.clone();
            let tunnel = tunnel.clone();
            let shutdown = tunnels_shutdown.resubscribe();
            async move {
                if is_tunnel_request(&req) {
                    return Ok(open_tunnel(tunnel, req, peer, shutdown).await);
                }
                router.oneshot(req).await
            }
        });

        // CONNECT replies must be exactly the status line and a blank line.
        let conn = http1::Builder::new()
            .auto_date_header(false)
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades();
        tokio::select! {
            result = conn => {
                if let Err(e) = result {
                    debug!(%peer, error = %e, "Connection error");
                }
            }
            _ = self.shutdown.recv() => {}
        }
    }
}

fn is_tunnel_request<B>(req: &hyper::Request<B>) -> bool {
    cfg!(feature = "https-tunnel") && req.method() == Method::CONNECT
}

/// Answers a CONNECT and, once hyper hands the connection over, relays it to
/// the target in the background.
///
/// The upstream is dialled before answering so an unreachable target gets a
/// `502 Bad Gateway` instead of `200 Connection Established`.
async fn open_tunnel(
    handler: TunnelHandler,
    req: hyper::Request<Incoming>,
    peer: SocketAddr,
    shutdown: broadcast::Receiver<()>,
) -> axum::response::Response {
    let Some(target) = req.uri().authority().map(|a| a.to_string()) else {
        warn!(%peer, uri = %req.uri(), "Rejecting CONNECT without host:port target");
        return tunnel_reply(StatusCode::BAD_REQUEST);
    };

    let request = ConnectRequest::new(target, record_headers(req.headers()));
    let mut tunnel = match handler.open(&request, Some(peer)).await {
        Ok(tunnel) => tunnel,
        Err(_) => return tunnel_reply(StatusCode::BAD_GATEWAY),
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                tunnel.established();
                let state = tunnel.relay(TokioIo::new(upgraded), &[], shutdown).await;
                debug!(%peer, ?state, "Tunnel finished");
            }
            Err(e) => {
                let state = tunnel.abort(e);
                debug!(%peer, ?state, "Tunnel upgrade failed");
            }
        }
    });

    let mut response = axum::response::Response::new(axum::body::Body::empty());
    response
        .extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection Established"));
    response
}

/// A bodiless CONNECT failure that closes the connection.
fn tunnel_reply(status: StatusCode) -> axum::response::Response {
    (status, [(CONNECTION, "close")]).into_response()
}

/// Handle for controlling a running server.
pub struct ServerHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Returns the address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals the server and its open connections to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the accept loop to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Shuts down the server and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use tapline_proxy::{CommandError, CommandRunner, Transaction};
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Minimal stand-in for the platform proxy tool.
    #[derive(Default)]
    struct FakeTool {
        state: Mutex<HashMap<String, (bool, String, String)>>,
    }

    #[async_trait]
    impl CommandRunner for FakeTool {
        async fn run(&self, args: &[String]) -> std::result::Result<String, CommandError> {
            let command = args[0].as_str();
            if command == "-listallnetworkservices" {
                return Ok("An asterisk (*) denotes that a network service is disabled.\nWi-Fi\n"
                    .to_string());
            }
            let mut state = self.state.lock();
            if let Some(kind) = command.strip_prefix("-get") {
                let (enabled, server, port) = state.get(kind).cloned().unwrap_or_default();
                return Ok(format!(
                    "Enabled: {}\nServer: {}\nPort: {}\nAuthenticated Proxy Enabled: 0\n",
                    if enabled { "Yes" } else { "No" },
                    server,
                    if port.is_empty() { "0" } else { port.as_str() },
                ));
            }
            let rest = &command["-set".len()..];
            if let Some(kind) = rest.strip_suffix("state") {
                state.entry(kind.to_string()).or_default().0 = args[2] == "on";
            } else {
                let entry = state.entry(rest.to_string()).or_default();
                entry.1 = args[2].clone();
                entry.2 = args[3].clone();
            }
            Ok(String::new())
        }
    }

    struct TestApp {
        state: AppState,
        finished: Arc<Mutex<Vec<Transaction>>>,
        _dir: TempDir,
    }

    fn test_app() -> TestApp {
        let dir = TempDir::new().unwrap();
        let finished = Arc::new(Mutex::new(Vec::new()));
        let sink = finished.clone();
        let store = TransactionStore::with_sink(move |t| sink.lock().push(t.clone()));
        let config = ServerConfig::default()
            .with_host("127.0.0.1")
            .with_port(0)
            .with_backup_dir(dir.path().join("backups"));
        let system_proxy =
            SystemProxyManager::with_runner(Arc::new(FakeTool::default()), &config.backup_dir);

        let state = AppState::new(config, store, Forwarder::new().unwrap(), system_proxy);
        TestApp {
            state,
            finished,
            _dir: dir,
        }
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    /// Larger than what a transaction record keeps.
    const OVERSIZED_BODY: usize = MAX_RECORDED_BODY + 1024 * 1024;

    /// Upstream echoing method, URI, Host header and body. `GET /large`
    /// answers with an [`OVERSIZED_BODY`] of `x`.
    async fn spawn_upstream() -> SocketAddr {
        async fn echo(req: Request<Body>) -> axum::Json<Value> {
            let (parts, body) = req.into_parts();
            let body = axum::body::to_bytes(body, usize::MAX).await.unwrap();
            let shown = if body.len() > 1024 { &body[..0] } else { &body[..] };
            axum::Json(json!({
                "method": parts.method.as_str(),
                "uri": parts.uri.to_string(),
                "host": parts.headers.get("host").and_then(|v| v.to_str().ok()),
                "targetHeader": parts.headers.get("x-target-url").is_some(),
                "body": String::from_utf8_lossy(shown),
                "bodyLen": body.len(),
            }))
        }

        async fn large() -> Vec<u8> {
            vec![b'x'; OVERSIZED_BODY]
        }

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let app = Router::new().route("/large", get(large)).fallback(echo);
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    /// Echoes every byte back on each accepted connection.
    async fn spawn_echo() -> SocketAddr {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = echo.accept().await {
                tokio::spawn(async move {
                    let (mut read, mut write) = socket.split();
                    let _ = tokio::io::copy(&mut read, &mut write).await;
                });
            }
        });
        addr
    }

    /// Reads one response head, and its `Content-Length` body, off a raw
    /// connection without consuming anything after it.
    async fn read_response(client: &mut TcpStream) -> (String, Vec<u8>) {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            client.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        let head = String::from_utf8(head).unwrap();
        let len = head
            .lines()
            .find_map(|line| {
                let line = line.to_ascii_lowercase();
                line.strip_prefix("content-length:")
                    .map(|v| v.trim().parse::<usize>().unwrap())
            })
            .unwrap_or(0);
        let mut body = vec![0u8; len];
        client.read_exact(&mut body).await.unwrap();
        (head, body)
    }

    /// An address with nothing listening on it.
    fn closed_addr() -> SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test]
    async fn test_status() {
        let app = test_app();
        let response = router(app.state.clone())
            .oneshot(Request::get("/proxy/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["status"], "running");
        assert_eq!(json["config"]["host"], "127.0.0.1");
        assert_eq!(json["config"]["logLevel"], "info");
        assert_eq!(json["config"]["enableHttps"], false);
        // The status request itself is in flight while it is answered.
        assert_eq!(json["activeTransactions"], 1);
    }

    #[tokio::test]
    async fn test_logs_shows_in_flight_only() {
        let app = test_app();
        let response = router(app.state.clone())
            .oneshot(Request::get("/proxy/logs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        let logs = json.as_array().unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0]["request"]["url"], "/proxy/logs");
        assert_eq!(logs[0]["request"]["sourceIp"], "unknown");

        // Completed after responding.
        assert!(app.state.store.is_empty());
        assert_eq!(app.finished.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_forward_rejects_control_paths() {
        let app = test_app();
        let response = router(app.state.clone())
            .oneshot(
                Request::get("/proxy/forward/proxy/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let json = body_json(response).await;
        assert_eq!(json["error"], "Proxy error");
        assert!(json["message"]
            .as_str()
            .unwrap()
            .contains("Cannot proxy to proxy endpoints"));

        let finished = app.finished.lock();
        assert_eq!(finished.len(), 1);
        assert!(finished[0].error.is_some());
    }

    #[tokio::test]
    async fn test_forward_with_target_header() {
        let upstream = spawn_upstream().await;
        let app = test_app();

        let response = router(app.state.clone())
            .oneshot(
                Request::post("/proxy/forward/api/items?limit=5")
                    .header("x-target-url", format!("http://{}", upstream))
                    .header("user-agent", "tapline-test")
                    .body(Body::from("hello"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["method"], "POST");
        assert_eq!(json["uri"], "/api/items?limit=5");
        assert_eq!(json["host"], upstream.to_string());
        assert_eq!(json["targetHeader"], false);
        assert_eq!(json["body"], "hello");

        let finished = app.finished.lock();
        assert_eq!(finished.len(), 1);
        let transaction = &finished[0];
        assert_eq!(transaction.request.body.as_deref(), Some("hello"));
        assert_eq!(transaction.request.user_agent.as_deref(), Some("tapline-test"));
        assert_eq!(transaction.response.as_ref().unwrap().status_code, 200);
        assert!(transaction.error.is_none());
    }

    #[tokio::test]
    async fn test_forward_with_target_in_path() {
        let upstream = spawn_upstream().await;
        let app = test_app();

        let response = router(app.state.clone())
            .oneshot(
                Request::get(format!("/proxy/forward/{}/health", upstream))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["uri"], "/health");
    }

    #[tokio::test]
    async fn test_forward_upstream_failure() {
        let app = test_app();
        let response = router(app.state.clone())
            .oneshot(
                Request::get("/proxy/forward")
                    .header("x-target-url", format!("http://{}", closed_addr()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(response).await["error"], "Proxy error");

        let finished = app.finished.lock();
        assert_eq!(finished[0].response.as_ref().unwrap().status_code, 500);
        assert!(finished[0].error.is_some());
    }

    #[cfg(feature = "system-proxy")]
    #[tokio::test]
    async fn test_catch_all_uses_host() {
        let upstream = spawn_upstream().await;
        let app = test_app();

        let response = router(app.state.clone())
            .oneshot(
                Request::put("/v1/things/7")
                    .header("host", upstream.to_string())
                    .body(Body::from("{\"a\":1}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["method"], "PUT");
        assert_eq!(json["uri"], "/v1/things/7");
        assert_eq!(json["body"], "{\"a\":1}");
    }

    #[cfg(feature = "system-proxy")]
    #[tokio::test]
    async fn test_catch_all_upstream_failure_is_502() {
        let app = test_app();
        let response = router(app.state.clone())
            .oneshot(
                Request::get("/")
                    .header("host", closed_addr().to_string())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(body.is_empty());

        let finished = app.finished.lock();
        assert_eq!(finished[0].response.as_ref().unwrap().status_code, 502);
        assert!(finished[0].error.is_some());
    }

    #[cfg(feature = "system-proxy")]
    #[tokio::test]
    async fn test_catch_all_requires_host() {
        let app = test_app();
        let response = router(app.state.clone())
            .oneshot(Request::get("/index.html").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(response).await["code"], "routing_error");
    }

    #[cfg(feature = "system-proxy")]
    #[tokio::test]
    async fn test_unknown_control_path_not_proxied() {
        let app = test_app();
        let response = router(app.state.clone())
            .oneshot(
                Request::get("/proxy/unknown")
                    .header("host", "example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_system_enable_and_settings() {
        let app = test_app();
        let router = router(app.state.clone());

        let response = router
            .clone()
            .oneshot(
                Request::post("/proxy/system-enable")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["message"], "System proxy enabled");
        assert!(app.state.system_proxy.last_backup().is_some());

        let response = router
            .clone()
            .oneshot(
                Request::get("/proxy/system-settings")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json[0]["name"], "Wi-Fi");
        assert_eq!(json[0]["httpProxy"]["enabled"], true);
        assert_eq!(json[0]["httpProxy"]["server"], "127.0.0.1");

        let response = router
            .oneshot(
                Request::post("/proxy/system-disable")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(response).await["message"], "System proxy disabled");
    }

    #[tokio::test]
    async fn test_restore_without_backup_is_400() {
        let app = test_app();
        let response = router(app.state.clone())
            .oneshot(
                Request::post("/proxy/system-restore")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "No backup file specified");
    }

    #[tokio::test]
    async fn test_restore_corrupt_snapshot_is_500() {
        let app = test_app();
        let path = app._dir.path().join("broken.json");
        std::fs::write(&path, "not json").unwrap();

        let response = router(app.state.clone())
            .oneshot(
                Request::post("/proxy/system-restore")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({ "path": path }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_json(response).await["error"],
            "Failed to restore system proxy settings"
        );
    }

    #[tokio::test]
    async fn test_permissions() {
        let app = test_app();
        let response = router(app.state.clone())
            .oneshot(
                Request::get("/proxy/system-permissions")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(response).await["permitted"], true);
    }

    #[tokio::test]
    async fn test_server_serves_http_on_listener() {
        let app = test_app();
        let handle = Server::with_state(app.state.clone()).start().await.unwrap();

        let mut client = TcpStream::connect(handle.addr()).await.unwrap();
        client
            .write_all(b"GET /proxy/status HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut reply = String::new();
        client.read_to_string(&mut reply).await.unwrap();
        assert!(reply.starts_with("HTTP/1.1 200"));
        assert!(reply.contains("\"running\""));

        let finished = app.finished.lock().clone();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].request.source_ip, "127.0.0.1");

        handle.stop().await;
    }

    #[cfg(feature = "https-tunnel")]
    #[tokio::test]
    async fn test_server_tunnels_connect() {
        let echo_addr = spawn_echo().await;
        let app = test_app();
        let handle = Server::with_state(app.state.clone()).start().await.unwrap();

        let mut client = TcpStream::connect(handle.addr()).await.unwrap();
        client
            .write_all(format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", echo_addr).as_bytes())
            .await
            .unwrap();

        let mut established = vec![0u8; tapline_proxy::tunnel::ESTABLISHED_RESPONSE.len()];
        client.read_exact(&mut established).await.unwrap();
        assert_eq!(established, tapline_proxy::tunnel::ESTABLISHED_RESPONSE);

        client.write_all(b"opaque tls bytes").await.unwrap();
        let mut echoed = [0u8; 16];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"opaque tls bytes");

        {
            let finished = app.finished.lock();
            assert_eq!(finished.len(), 1);
            assert_eq!(finished[0].request.method, "CONNECT");
            assert_eq!(finished[0].request.url, echo_addr.to_string());
            assert_eq!(finished[0].response.as_ref().unwrap().status_code, 200);
        }

        // Shutdown abandons the open tunnel.
        handle.stop().await;
        let mut rest = Vec::new();
        let _ = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            client.read_to_end(&mut rest),
        )
        .await
        .unwrap();
    }

    #[cfg(feature = "https-tunnel")]
    #[tokio::test]
    async fn test_server_connect_after_keep_alive_request() {
        let echo_addr = spawn_echo().await;
        let app = test_app();
        let handle = Server::with_state(app.state.clone()).start().await.unwrap();

        let mut client = TcpStream::connect(handle.addr()).await.unwrap();
        client
            .write_all(b"GET /proxy/status HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let (head, body) = read_response(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        let status: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(status["status"], "running");

        // Same socket, now tunnelled.
        client
            .write_all(format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", echo_addr).as_bytes())
            .await
            .unwrap();
        let mut established = vec![0u8; tapline_proxy::tunnel::ESTABLISHED_RESPONSE.len()];
        client.read_exact(&mut established).await.unwrap();
        assert_eq!(established, tapline_proxy::tunnel::ESTABLISHED_RESPONSE);

        client.write_all(b"hello upstream").await.unwrap();
        let mut echoed = [0u8; 14];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello upstream");

        {
            let finished = app.finished.lock();
            let methods: Vec<_> = finished.iter().map(|t| t.request.method.as_str()).collect();
            assert_eq!(methods, ["GET", "CONNECT"]);
            assert_eq!(finished[1].response.as_ref().unwrap().status_code, 200);
            assert_eq!(finished[1].request.source_ip, "127.0.0.1");
        }

        handle.stop().await;
    }

    #[cfg(feature = "https-tunnel")]
    #[tokio::test]
    async fn test_server_connect_unreachable_is_bad_gateway() {
        let target = closed_addr();
        let app = test_app();
        let handle = Server::with_state(app.state.clone()).start().await.unwrap();

        let mut client = TcpStream::connect(handle.addr()).await.unwrap();
        client
            .write_all(format!("CONNECT {} HTTP/1.1\r\n\r\n", target).as_bytes())
            .await
            .unwrap();

        let mut reply = String::new();
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            client.read_to_string(&mut reply),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(reply.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));

        {
            let finished = app.finished.lock();
            assert_eq!(finished.len(), 1);
            assert_eq!(finished[0].request.method, "CONNECT");
            assert_eq!(finished[0].response.as_ref().unwrap().status_code, 502);
            assert!(finished[0].error.is_some());
        }

        handle.stop().await;
    }

    #[cfg(feature = "system-proxy")]
    #[tokio::test]
    async fn test_catch_all_relays_response_over_record_limit() {
        let upstream = spawn_upstream().await;
        let app = test_app();

        let response = router(app.state.clone())
            .oneshot(
                Request::get("/large")
                    .header("host", upstream.to_string())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body.len(), OVERSIZED_BODY);

        let finished = app.finished.lock();
        let transaction = &finished[0];
        assert!(transaction.error.is_none());
        let recorded = transaction.response.as_ref().unwrap();
        assert_eq!(recorded.status_code, 200);
        assert!(recorded.body_truncated);
        assert_eq!(recorded.body.as_ref().map(String::len), Some(MAX_RECORDED_BODY));
    }

    #[tokio::test]
    async fn test_forward_relays_upload_over_record_limit() {
        let upstream = spawn_upstream().await;
        let app = test_app();

        let response = router(app.state.clone())
            .oneshot(
                Request::post("/proxy/forward/upload")
                    .header("x-target-url", format!("http://{}", upstream))
                    .header("content-type", "application/octet-stream")
                    .body(Body::from(vec![b'u'; OVERSIZED_BODY]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["bodyLen"], OVERSIZED_BODY);

        let finished = app.finished.lock();
        let request = &finished[0].request;
        assert!(request.body_truncated);
        assert_eq!(request.body.as_ref().map(String::len), Some(MAX_RECORDED_BODY));
        assert!(finished[0].error.is_none());
    }

    #[tokio::test]
    async fn test_server_rejects_invalid_config() {
        let config = ServerConfig::default().with_port(0);
        assert!(matches!(
            Server::new(config),
            Err(ServerError::Config(ConfigError::InvalidPort))
        ));
    }
}
