//! API route handlers.

use axum::body::{to_bytes, Body, Bytes};
use axum::extract::{Request, State};
use axum::http::request::Parts;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{info, warn};

use tapline_proxy::forward::{explicit_target, FORWARD_PREFIX, TARGET_HEADER};
use tapline_proxy::{ForwardMode, NetworkService, ProxyError, Transaction, UpstreamResponse};

use crate::capture::ForwardFailure;
use crate::error::{ApiError, Result};
use crate::models::{
    ForwardErrorResponse, PermissionsResponse, RestoreRequest, StatusConfig, StatusResponse,
    SystemActionResponse,
};
use crate::state::AppState;

/// GET /proxy/status - Server status and active transaction count.
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let config = &state.config;
    Json(StatusResponse {
        status: "running".to_string(),
        config: StatusConfig {
            port: config.port,
            host: config.host.clone(),
            log_level: config.log_level,
            enable_https: config.enable_https,
        },
        active_transactions: state.store.len(),
    })
}

/// GET /proxy/logs - In-flight transactions.
pub async fn logs(State(state): State<AppState>) -> Json<Vec<Transaction>> {
    Json(state.store.list_active())
}

/// GET /proxy/system-settings - Current proxy settings of every service.
pub async fn system_settings(State(state): State<AppState>) -> Json<Vec<NetworkService>> {
    Json(state.system_proxy.get_settings().await)
}

/// POST /proxy/system-enable - Route system traffic through this proxy.
pub async fn system_enable(State(state): State<AppState>) -> Result<Json<SystemActionResponse>> {
    let config = &state.config;
    match state.system_proxy.enable(&config.host, config.port).await {
        Ok(()) => Ok(Json(SystemActionResponse::ok("System proxy enabled"))),
        Err(e) => {
            warn!(error = %e, "Failed to enable system proxy");
            Err(ApiError::Internal("Failed to enable system proxy".to_string()))
        }
    }
}

/// POST /proxy/system-disable - Stop routing system traffic through this proxy.
pub async fn system_disable(State(state): State<AppState>) -> Result<Json<SystemActionResponse>> {
    match state.system_proxy.disable().await {
        Ok(()) => Ok(Json(SystemActionResponse::ok("System proxy disabled"))),
        Err(e) => {
            warn!(error = %e, "Failed to disable system proxy");
            Err(ApiError::Internal("Failed to disable system proxy".to_string()))
        }
    }
}

/// POST /proxy/system-restore - Restore a backup snapshot.
///
/// The body is optional; without a `path` the most recent backup is used.
pub async fn system_restore(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<SystemActionResponse>> {
    let req: RestoreRequest = if body.iter().all(u8::is_ascii_whitespace) {
        RestoreRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };

    match state.system_proxy.restore(req.path.as_deref()).await {
        Ok(()) => Ok(Json(SystemActionResponse::ok(
            "System proxy settings restored",
        ))),
        Err(e @ ProxyError::NoBackup) => Err(ApiError::BadRequest(e.to_string())),
        Err(e) => {
            warn!(error = %e, "Failed to restore system proxy settings");
            Err(ApiError::Internal(
                "Failed to restore system proxy settings".to_string(),
            ))
        }
    }
}

/// GET /proxy/system-permissions - Whether the proxy tool can be run.
pub async fn system_permissions(State(state): State<AppState>) -> Json<PermissionsResponse> {
    Json(PermissionsResponse {
        permitted: state.system_proxy.check_permissions().await,
    })
}

/// ANY /proxy/forward/* - Explicit forward.
pub async fn forward_explicit(State(state): State<AppState>, req: Request) -> Response {
    let (parts, body) = req.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let rest = path_and_query
        .strip_prefix(FORWARD_PREFIX)
        .unwrap_or(path_and_query);
    let target_header = parts
        .headers
        .get(TARGET_HEADER)
        .and_then(|v| v.to_str().ok());

    let outcome = match explicit_target(target_header, rest) {
        Ok(url) => relay(&state, parts, body, url).await,
        Err(e) => Err(e),
    };

    match outcome {
        Ok(upstream) => upstream_into_response(upstream),
        Err(e) => {
            warn!(error = %e, "Proxy error");
            let message = e.to_string();
            let mut response = (
                ForwardMode::Explicit.upstream_failure_status(),
                Json(ForwardErrorResponse {
                    error: "Proxy error".to_string(),
                    message: message.clone(),
                }),
            )
                .into_response();
            response.extensions_mut().insert(ForwardFailure(message));
            response
        }
    }
}

/// Fallback - Catch-all forward of traffic routed here by the system proxy.
#[cfg(feature = "system-proxy")]
pub async fn forward_catch_all(State(state): State<AppState>, req: Request) -> Response {
    use tapline_proxy::forward::{catch_all_target, is_control_path, FORWARDED_PROTO_HEADER};

    if req.method() == Method::CONNECT {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    // Unknown control paths are never proxied.
    if is_control_path(req.uri().path()) {
        return StatusCode::NOT_FOUND.into_response();
    }

    let (parts, body) = req.into_parts();

    let host = parts
        .headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|a| a.to_string()));
    let proto = parts
        .headers
        .get(FORWARDED_PROTO_HEADER)
        .and_then(|v| v.to_str().ok())
        .or(parts.uri.scheme_str())
        .map(str::to_string);
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();

    let url = match catch_all_target(host.as_deref(), proto.as_deref(), &path_and_query) {
        Ok(url) => url,
        Err(e) => {
            warn!(error = %e, "Cannot route request");
            let message = e.to_string();
            let mut response = ApiError::Routing(message.clone()).into_response();
            response.extensions_mut().insert(ForwardFailure(message));
            return response;
        }
    };

    match relay(&state, parts, body, url).await {
        Ok(upstream) => upstream_into_response(upstream),
        Err(e) => {
            warn!(error = %e, "Proxy error");
            let mut response = ForwardMode::CatchAll
                .upstream_failure_status()
                .into_response();
            response
                .extensions_mut()
                .insert(ForwardFailure(e.to_string()));
            response
        }
    }
}

/// Fallback without catch-all forwarding.
#[cfg(not(feature = "system-proxy"))]
pub async fn not_found(method: Method) -> StatusCode {
    if method == Method::CONNECT {
        StatusCode::METHOD_NOT_ALLOWED
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn relay(
    state: &AppState,
    parts: Parts,
    body: Body,
    url: String,
) -> tapline_proxy::Result<UpstreamResponse> {
    let body = to_bytes(body, usize::MAX)
        .await
        .map_err(|e| ProxyError::Upstream(format!("failed to read request body: {}", e)))?;

    info!(method = %parts.method, url = %url, "Forwarding request");
    state
        .forwarder
        .send(parts.method, &url, parts.headers, body.to_vec())
        .await
}

fn upstream_into_response(upstream: UpstreamResponse) -> Response {
    let mut response = Response::new(Body::from(upstream.body));
    *response.status_mut() = upstream.status;
    *response.headers_mut() = upstream.headers;
    response
}
