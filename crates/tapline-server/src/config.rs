//! Server configuration.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use tapline_proxy::system_proxy::default_backup_dir;
use tapline_proxy::{DEFAULT_HTTPS_PORT, DEFAULT_PROXY_PORT};

/// Default host to bind to.
pub const DEFAULT_HOST: &str = "localhost";

/// Configuration error types.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid port: must be between 1 and 65535")]
    InvalidPort,

    #[error("invalid HTTPS port: must be between 1 and 65535")]
    InvalidHttpsPort,

    #[error("invalid log level '{0}': expected one of silent, error, warn, info, debug")]
    UnknownLogLevel(String),

    #[error("host must not be empty")]
    EmptyHost,
}

/// Logging threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Silent,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    /// Returns the configured name of this level.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Silent => "silent",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }

    /// Returns the equivalent `tracing` filter directive.
    pub fn filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Silent => "off",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "silent" => Ok(LogLevel::Silent),
            "error" => Ok(LogLevel::Error),
            "warn" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            _ => Err(ConfigError::UnknownLogLevel(s.to_string())),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to (default: localhost).
    pub host: String,
    /// Port to bind to (default: 8080).
    pub port: u16,
    /// Logging threshold.
    pub log_level: LogLevel,
    /// Whether HTTPS support is advertised.
    pub enable_https: bool,
    /// Port reserved for HTTPS (default: 8443).
    pub https_port: u16,
    /// Optional log file, appended to.
    pub log_file: Option<PathBuf>,
    /// Directory backup snapshots are written to.
    pub backup_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PROXY_PORT,
            log_level: LogLevel::default(),
            enable_https: false,
            https_port: DEFAULT_HTTPS_PORT,
            log_file: None,
            backup_dir: default_backup_dir(),
        }
    }
}

impl ServerConfig {
    /// Sets the host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the backup directory.
    pub fn with_backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = dir.into();
        self
    }

    /// Checks the configuration before startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.https_port == 0 {
            return Err(ConfigError::InvalidHttpsPort);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 8080);
        assert_eq!(config.https_port, 8443);
        assert_eq!(config.log_level, LogLevel::Info);
        assert!(!config.enable_https);
        assert!(config.log_file.is_none());
        assert!(config.backup_dir.ends_with("backups"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_ports() {
        let config = ServerConfig::default().with_port(0);
        assert_eq!(config.validate(), Err(ConfigError::InvalidPort));

        let config = ServerConfig {
            https_port: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidHttpsPort));
    }

    #[test]
    fn validate_rejects_empty_host() {
        let config = ServerConfig::default().with_host("  ");
        assert_eq!(config.validate(), Err(ConfigError::EmptyHost));
    }

    #[test]
    fn log_level_parsing() {
        assert_eq!("silent".parse::<LogLevel>(), Ok(LogLevel::Silent));
        assert_eq!("DEBUG".parse::<LogLevel>(), Ok(LogLevel::Debug));
        assert_eq!(
            "verbose".parse::<LogLevel>(),
            Err(ConfigError::UnknownLogLevel("verbose".to_string()))
        );
    }

    #[test]
    fn silent_turns_logging_off() {
        assert_eq!(LogLevel::Silent.filter_directive(), "off");
        assert_eq!(LogLevel::Warn.filter_directive(), "warn");
        assert_eq!(LogLevel::Info.to_string(), "info");
    }
}
