//! Error types for the proxy.

use std::path::PathBuf;

use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// No valid upstream target could be resolved for a request.
    #[error("routing error: {0}")]
    Routing(String),

    /// The forwarded request could not reach or complete against its target.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// A CONNECT target could not be reached.
    #[error("tunnel error: {0}")]
    Tunnel(String),

    /// A single external proxy-configuration command failed.
    #[error("command error: {0}")]
    OrchestratorCommand(#[from] CommandError),

    /// Restore was requested without a path and no backup has been taken.
    #[error("No backup file specified")]
    NoBackup,

    /// The backup snapshot could not be read or parsed.
    #[error("backup snapshot {path} is unreadable: {reason}")]
    SnapshotCorrupt { path: PathBuf, reason: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        ProxyError::Upstream(err.to_string())
    }
}

/// Failure of one invocation of the platform proxy-configuration tool.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The tool could not be started.
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    /// The tool ran but reported failure.
    #[error("`{command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
