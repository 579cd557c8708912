//! In-flight transaction tracking.
//!
//! Every proxied exchange is recorded as a [`Transaction`] from the moment its
//! request is observed until its response (or failure) is known. Finalization
//! removes the record from the [`TransactionStore`] and hands it to the
//! configured [`TransactionSink`] exactly once, so the store only ever holds
//! requests that are still open.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use http::header::USER_AGENT;
use http::HeaderMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier assigned to a transaction when its request arrives.
pub type TransactionId = Uuid;

/// Header mapping as recorded in a transaction.
pub type HeaderRecord = BTreeMap<String, String>;

/// Longest body kept in a transaction record. Longer bodies are still relayed
/// in full; only the first `MAX_RECORDED_BODY` bytes are recorded.
pub const MAX_RECORDED_BODY: usize = 10 * 1024 * 1024;

/// Request half of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub url: String,
    pub headers: HeaderRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Set when `body` holds only a prefix of what was sent.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub body_truncated: bool,
    pub source_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl RequestRecord {
    /// Creates a request record stamped with the current time.
    pub fn new(
        method: impl Into<String>,
        url: impl Into<String>,
        source_ip: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            method: method.into(),
            url: url.into(),
            headers: HeaderRecord::new(),
            body: None,
            body_truncated: false,
            source_ip: source_ip.into(),
            user_agent: None,
        }
    }

    /// Records the request headers; the user agent is taken from them.
    pub fn with_headers(mut self, headers: HeaderRecord) -> Self {
        self.user_agent = headers.get(USER_AGENT.as_str()).cloned();
        self.headers = headers;
        self
    }

    /// Records the serialized request body.
    pub fn with_body(mut self, body: Option<String>) -> Self {
        self.body = body;
        self
    }

    /// Records a captured request body, keeping at most [`MAX_RECORDED_BODY`]
    /// bytes of it.
    pub fn with_captured_body(mut self, bytes: &[u8]) -> Self {
        (self.body, self.body_truncated) = record_body(bytes);
        self
    }
}

/// Response half of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseRecord {
    pub timestamp: DateTime<Utc>,
    pub status_code: u16,
    pub headers: HeaderRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub body_truncated: bool,
    /// Milliseconds between request arrival and this response.
    pub response_time: u64,
}

impl ResponseRecord {
    /// Creates a response record for `request`, measuring elapsed time from
    /// the request's arrival.
    pub fn for_request(request: &RequestRecord, status_code: u16) -> Self {
        let timestamp = Utc::now();
        let response_time = (timestamp - request.timestamp).num_milliseconds().max(0) as u64;

        Self {
            timestamp,
            status_code,
            headers: HeaderRecord::new(),
            body: None,
            body_truncated: false,
            response_time,
        }
    }

    /// Records the response headers.
    pub fn with_headers(mut self, headers: HeaderRecord) -> Self {
        self.headers = headers;
        self
    }

    /// Records the serialized response body.
    pub fn with_body(mut self, body: Option<String>) -> Self {
        self.body = body;
        self
    }

    /// Records a captured response body, keeping at most
    /// [`MAX_RECORDED_BODY`] bytes of it.
    pub fn with_captured_body(mut self, bytes: &[u8]) -> Self {
        (self.body, self.body_truncated) = record_body(bytes);
        self
    }
}

/// One proxied exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub request: RequestRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Receives every finalized transaction exactly once.
pub type TransactionSink = Arc<dyn Fn(&Transaction) + Send + Sync>;

/// Default sink: one structured `info` event per finalized transaction.
///
/// Each part of the record is its own field so JSON log output stays flat
/// and queryable. Bodies are left out; they are available through the store
/// while the exchange is in flight.
pub fn log_transaction(transaction: &Transaction) {
    let request = &transaction.request;
    let response = transaction.response.as_ref();

    tracing::info!(
        transaction_id = %transaction.id,
        method = %request.method,
        url = %request.url,
        source_ip = %request.source_ip,
        user_agent = request.user_agent.as_deref(),
        request_headers = ?request.headers,
        request_body_len = request.body.as_ref().map(String::len),
        status_code = response.map(|r| r.status_code),
        response_time_ms = response.map(|r| r.response_time),
        response_headers = ?response.map(|r| &r.headers),
        error = transaction.error.as_deref(),
        "HTTP Transaction"
    );
}

/// Converts an HTTP header map into its recorded form.
///
/// Values that are not valid UTF-8 are dropped; repeated headers are joined
/// with `", "`.
pub fn record_headers(headers: &HeaderMap) -> HeaderRecord {
    let mut record = HeaderRecord::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        record
            .entry(name.as_str().to_string())
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    record
}

/// Renders a captured body for recording, `None` when empty.
///
/// Bytes past [`MAX_RECORDED_BODY`] are dropped and the returned flag is set.
pub fn record_body(bytes: &[u8]) -> (Option<String>, bool) {
    let truncated = bytes.len() > MAX_RECORDED_BODY;
    let kept = &bytes[..bytes.len().min(MAX_RECORDED_BODY)];
    if kept.is_empty() {
        (None, truncated)
    } else {
        (Some(String::from_utf8_lossy(kept).into_owned()), truncated)
    }
}

/// Store of in-flight transactions.
///
/// Cloning is cheap; clones share the same underlying map.
#[derive(Clone)]
pub struct TransactionStore {
    active: Arc<Mutex<HashMap<TransactionId, Transaction>>>,
    sink: TransactionSink,
}

impl std::fmt::Debug for TransactionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionStore")
            .field("active", &self.len())
            .finish()
    }
}

impl Default for TransactionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionStore {
    /// Creates a store that logs finalized transactions through `tracing`.
    pub fn new() -> Self {
        Self::with_sink(log_transaction)
    }

    /// Creates a store with a custom sink for finalized transactions.
    pub fn with_sink<F>(sink: F) -> Self
    where
        F: Fn(&Transaction) + Send + Sync + 'static,
    {
        Self {
            active: Arc::new(Mutex::new(HashMap::new())),
            sink: Arc::new(sink),
        }
    }

    /// Opens a transaction for `request` and returns its fresh id.
    pub fn begin(&self, request: RequestRecord) -> TransactionId {
        let id = Uuid::new_v4();
        let transaction = Transaction {
            id,
            request,
            response: None,
            error: None,
        };
        self.active.lock().insert(id, transaction);
        id
    }

    /// Attaches `response` and finalizes the transaction.
    ///
    /// Returns the finalized record, or `None` if `id` is not in flight
    /// (unknown or already finalized).
    pub fn complete(&self, id: TransactionId, response: ResponseRecord) -> Option<Transaction> {
        self.finalize(id, response, None)
    }

    /// Finalizes the transaction as failed, recording both the synthetic
    /// response sent to the client and the failure description.
    pub fn fail(
        &self,
        id: TransactionId,
        response: ResponseRecord,
        error: impl Into<String>,
    ) -> Option<Transaction> {
        self.finalize(id, response, Some(error.into()))
    }

    fn finalize(
        &self,
        id: TransactionId,
        response: ResponseRecord,
        error: Option<String>,
    ) -> Option<Transaction> {
        let Some(mut transaction) = self.active.lock().remove(&id) else {
            tracing::debug!(transaction_id = %id, "Ignoring completion of unknown transaction");
            return None;
        };

        transaction.response = Some(response);
        transaction.error = error;

        // Lock released above; the sink may take its time.
        (self.sink)(&transaction);
        Some(transaction)
    }

    /// Returns a snapshot of the in-flight transactions, in no particular order.
    pub fn list_active(&self) -> Vec<Transaction> {
        self.active.lock().values().cloned().collect()
    }

    /// Returns the number of in-flight transactions.
    pub fn len(&self) -> usize {
        self.active.lock().len()
    }

    /// Returns true if nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.active.lock().is_empty()
    }
}
