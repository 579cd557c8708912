//! Upstream target resolution and request relaying.
//!
//! Two modes are supported:
//!
//! - **Explicit**: the caller names the upstream with the `X-Target-URL`
//!   header, or with the path following the forward prefix.
//! - **Catch-all**: the operating system routes traffic through this proxy,
//!   so the upstream is inferred from the `Host` header.

use std::time::Duration;

use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};

use crate::error::{ProxyError, Result};

/// Path prefix owned by the control API.
pub const CONTROL_PREFIX: &str = "/proxy/";

/// Path prefix of the explicit-forward endpoint.
pub const FORWARD_PREFIX: &str = "/proxy/forward";

/// Header naming the upstream target in explicit mode.
pub const TARGET_HEADER: &str = "x-target-url";

/// Header carrying the original scheme in catch-all mode.
pub const FORWARDED_PROTO_HEADER: &str = "x-forwarded-proto";

/// Headers that describe a single hop and are never relayed.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
];

/// How a request reached the forwarder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    /// `/proxy/forward/*` with an optional target header.
    Explicit,
    /// Any other path, target taken from `Host`.
    CatchAll,
}

impl ForwardMode {
    /// Status returned to the client when the upstream cannot be reached.
    pub fn upstream_failure_status(&self) -> StatusCode {
        match self {
            ForwardMode::Explicit => StatusCode::INTERNAL_SERVER_ERROR,
            ForwardMode::CatchAll => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Returns true if `path` belongs to the control API.
pub fn is_control_path(path: &str) -> bool {
    path.starts_with(CONTROL_PREFIX)
}

/// Resolves the upstream URL in explicit mode.
///
/// `target_header` is the `X-Target-URL` value, if any. `path_and_query` is
/// the request target with the forward prefix already removed. With a header,
/// the header names the upstream base and the remaining path is appended to
/// it; without one, the remaining path itself is the target.
///
/// The control-API check is a literal prefix test on the computed target
/// string before any scheme is added.
pub fn explicit_target(target_header: Option<&str>, path_and_query: &str) -> Result<String> {
    let (target, suffix) = match target_header.map(str::trim).filter(|h| !h.is_empty()) {
        Some(header) => (header, path_and_query),
        None => (path_and_query, ""),
    };

    if is_control_path(target) {
        return Err(ProxyError::Routing(
            "Cannot proxy to proxy endpoints".to_string(),
        ));
    }

    let target = target.trim_start_matches('/');
    if target.is_empty() {
        return Err(ProxyError::Routing("No target URL given".to_string()));
    }

    let base = with_scheme(target, "http");
    Ok(join_target(&base, suffix))
}

/// Resolves the upstream URL in catch-all mode from the `Host` header and the
/// optional forwarded-protocol header (default `http`).
pub fn catch_all_target(
    host: Option<&str>,
    forwarded_proto: Option<&str>,
    path_and_query: &str,
) -> Result<String> {
    let host = host
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ProxyError::Routing("No host header found".to_string()))?;
    let scheme = forwarded_proto
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .unwrap_or("http");

    Ok(join_target(&format!("{}://{}", scheme, host), path_and_query))
}

fn with_scheme(target: &str, scheme: &str) -> String {
    if target.starts_with("http://") || target.starts_with("https://") {
        target.to_string()
    } else {
        format!("{}://{}", scheme, target)
    }
}

fn join_target(base: &str, path_and_query: &str) -> String {
    if path_and_query.is_empty() || (path_and_query == "/" && base.ends_with('/')) {
        return base.to_string();
    }
    match (base.ends_with('/'), path_and_query.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path_and_query[1..]),
        (false, false) if !path_and_query.starts_with('?') => {
            format!("{}/{}", base, path_and_query)
        }
        _ => format!("{}{}", base, path_and_query),
    }
}

/// Removes hop-by-hop headers plus any header named in `Connection`.
pub fn strip_hop_headers(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in HOP_BY_HOP.iter().chain(named.iter()) {
        headers.remove(name);
    }
}

/// Response received from an upstream server, fully buffered.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// Relays requests to upstream servers.
///
/// The client never goes through a proxy itself (the system proxy may point
/// back at us) and never follows redirects, which are relayed to the caller.
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: reqwest::Client,
}

impl Forwarder {
    /// Creates a forwarder with default client settings.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .redirect(reqwest::redirect::Policy::none())
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self { client })
    }

    /// Sends one request upstream and buffers the response.
    pub async fn send(
        &self,
        method: Method,
        url: &str,
        mut headers: HeaderMap,
        body: Vec<u8>,
    ) -> Result<UpstreamResponse> {
        strip_hop_headers(&mut headers);
        headers.remove(TARGET_HEADER);
        headers.remove(header::CONTENT_LENGTH);

        // Change origin: the upstream sees its own authority.
        headers.remove(header::HOST);
        if let Some(authority) = reqwest::Url::parse(url)
            .ok()
            .and_then(|u| authority_of(&u))
        {
            if let Ok(value) = HeaderValue::from_str(&authority) {
                headers.insert(header::HOST, value);
            }
        }

        tracing::debug!(%method, url, "Proxying request");

        let response = self
            .client
            .request(method, url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let mut headers = response.headers().clone();
        strip_hop_headers(&mut headers);
        headers.remove(header::CONTENT_LENGTH);
        let body = response.bytes().await?.to_vec();

        tracing::debug!(status = status.as_u16(), url, "Received response");

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

fn authority_of(url: &reqwest::Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}
