//! Transaction capture middleware.
//!
//! Wraps every HTTP request handled by the router: the request is buffered
//! and recorded with [`TransactionStore::begin`], the response is buffered and
//! recorded with `complete` (or `fail`, when the handler attached a
//! [`ForwardFailure`]).
//!
//! Bodies of any size are relayed whole. Only the recorded copy is capped at
//! [`MAX_RECORDED_BODY`] and flagged as truncated.
//!
//! [`TransactionStore::begin`]: tapline_proxy::TransactionStore::begin

use std::net::SocketAddr;

use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use tapline_proxy::transaction::{record_headers, MAX_RECORDED_BODY};
use tapline_proxy::{RequestRecord, ResponseRecord};

use crate::error::ApiError;
use crate::state::AppState;

/// Attached to a response produced after a failed forward. Carries the
/// failure description into the transaction record.
#[derive(Debug, Clone)]
pub struct ForwardFailure(pub String);

/// Source address of the request, or `"unknown"`.
fn source_ip(req: &Request) -> String {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn capture(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let record = RequestRecord::new(
        req.method().as_str(),
        req.uri().to_string(),
        source_ip(&req),
    )
    .with_headers(record_headers(req.headers()));

    let (parts, body) = req.into_parts();
    let bytes = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read request body");
            let id = state.store.begin(record.clone());
            let response =
                ApiError::BadRequest(format!("failed to read request body: {}", e)).into_response();
            let recorded = ResponseRecord::for_request(&record, response.status().as_u16());
            state.store.fail(id, recorded, e.to_string());
            return response;
        }
    };

    let record = record.with_captured_body(&bytes);
    let id = state.store.begin(record.clone());

    let response = next.run(Request::from_parts(parts, Body::from(bytes))).await;

    let (parts, body) = response.into_parts();
    // Only a broken body stream lands here; size alone never fails.
    let bytes = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(transaction_id = %id, error = %e, "Failed to read response body");
            let recorded = ResponseRecord::for_request(&record, 502);
            state.store.fail(id, recorded, e.to_string());
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let recorded = ResponseRecord::for_request(&record, parts.status.as_u16())
        .with_headers(record_headers(&parts.headers))
        .with_captured_body(&bytes);

    if recorded.body_truncated {
        tracing::debug!(
            transaction_id = %id,
            body_len = bytes.len(),
            recorded_len = MAX_RECORDED_BODY,
            "Response body recorded truncated"
        );
    }

    match parts.extensions.get::<ForwardFailure>() {
        Some(ForwardFailure(error)) => {
            state.store.fail(id, recorded, error.clone());
        }
        None => {
            state.store.complete(id, recorded);
        }
    }

    Response::from_parts(parts, Body::from(bytes))
}
