//! API request/response models.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::LogLevel;

/// Response for GET /proxy/status.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: String,
    pub config: StatusConfig,
    pub active_transactions: usize,
}

/// Configuration echoed by the status endpoint.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusConfig {
    pub port: u16,
    pub host: String,
    pub log_level: LogLevel,
    pub enable_https: bool,
}

/// Response for the system enable/disable/restore endpoints.
#[derive(Debug, Serialize, Deserialize)]
pub struct SystemActionResponse {
    pub success: bool,
    pub message: String,
}

impl SystemActionResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }
}

/// Request body for POST /proxy/system-restore.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RestoreRequest {
    /// Snapshot to restore; the most recent backup when absent.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Response for GET /proxy/system-permissions.
#[derive(Debug, Serialize, Deserialize)]
pub struct PermissionsResponse {
    pub permitted: bool,
}

/// Error body of the explicit forward endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ForwardErrorResponse {
    pub error: String,
    pub message: String,
}
