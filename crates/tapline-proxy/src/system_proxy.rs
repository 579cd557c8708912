//! System proxy configuration.
//!
//! Reads and rewrites the per-network-service proxy settings of the host
//! through the platform `networksetup` tool. Every mutation is preceded by a
//! backup snapshot so the previous state can be restored.
//!
//! Individual command failures are logged and absorbed: a broken service never
//! stops the remaining services from being processed. Only structural problems
//! (no backup to restore, unreadable snapshot) are returned as errors.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use directories::ProjectDirs;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{CommandError, ProxyError, Result};

/// Default name of the platform proxy-configuration tool.
pub const NETWORKSETUP: &str = "networksetup";

/// Returns the default directory for backup snapshots.
pub fn default_backup_dir() -> PathBuf {
    ProjectDirs::from("", "tapline", "Tapline")
        .map(|dirs| dirs.data_dir().join("backups"))
        .unwrap_or_else(|| PathBuf::from("backups"))
}

/// Proxy configuration of one protocol on one network service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default)]
    pub authenticated: bool,
}

impl ProxySettings {
    /// Returns the server and port if this protocol should be re-enabled.
    fn enabled_endpoint(&self) -> Option<(&str, u16)> {
        match (self.enabled, self.server.as_deref(), self.port) {
            (true, Some(server), Some(port)) => Some((server, port)),
            _ => None,
        }
    }
}

/// One OS-level network service and its proxy settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkService {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<ProxySettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https_proxy: Option<ProxySettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ftp_proxy: Option<ProxySettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socks_proxy: Option<ProxySettings>,
}

impl NetworkService {
    /// Returns the recorded settings for `kind`.
    pub fn settings(&self, kind: ProxyKind) -> Option<&ProxySettings> {
        match kind {
            ProxyKind::Http => self.http_proxy.as_ref(),
            ProxyKind::Https => self.https_proxy.as_ref(),
            ProxyKind::Ftp => self.ftp_proxy.as_ref(),
            ProxyKind::Socks => self.socks_proxy.as_ref(),
        }
    }
}

/// The proxy protocols a network service can configure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyKind {
    Http,
    Https,
    Ftp,
    Socks,
}

impl ProxyKind {
    /// All kinds, in the order they are stored.
    pub const ALL: [ProxyKind; 4] = [
        ProxyKind::Http,
        ProxyKind::Https,
        ProxyKind::Ftp,
        ProxyKind::Socks,
    ];

    /// Kinds pointed at this proxy by [`SystemProxyManager::enable`].
    pub const ENABLED_BY_PROXY: [ProxyKind; 3] =
        [ProxyKind::Http, ProxyKind::Https, ProxyKind::Ftp];

    /// The tool's name for this kind, as used in `-get<name>` / `-set<name>`.
    pub fn tool_name(&self) -> &'static str {
        match self {
            ProxyKind::Http => "webproxy",
            ProxyKind::Https => "securewebproxy",
            ProxyKind::Ftp => "ftpproxy",
            ProxyKind::Socks => "socksfirewallproxy",
        }
    }

    /// Inverse of [`ProxyKind::tool_name`].
    pub fn from_tool_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.tool_name() == name)
    }

    fn get_args(&self, service: &str) -> Vec<String> {
        vec![format!("-get{}", self.tool_name()), service.to_string()]
    }

    fn set_args(&self, service: &str, server: &str, port: u16) -> Vec<String> {
        vec![
            format!("-set{}", self.tool_name()),
            service.to_string(),
            server.to_string(),
            port.to_string(),
        ]
    }

    fn state_args(&self, service: &str, on: bool) -> Vec<String> {
        vec![
            format!("-set{}state", self.tool_name()),
            service.to_string(),
            if on { "on" } else { "off" }.to_string(),
        ]
    }
}

/// Parses the output of `networksetup -listallnetworkservices`.
///
/// The informational header line and disabled services (prefixed with `*`)
/// are dropped.
pub fn parse_service_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with("An asterisk") && !line.starts_with('*'))
        .map(str::to_string)
        .collect()
}

/// Parses the output of `networksetup -get<kind> <service>`.
///
/// Grammar, one field per line, unknown lines ignored:
///
/// ```text
/// Enabled: Yes|No
/// Server: <host>
/// Port: <number>
/// Authenticated Proxy Enabled: Yes|No|1|0
/// ```
pub fn parse_proxy_settings(output: &str) -> ProxySettings {
    let mut settings = ProxySettings::default();

    for line in output.lines().map(str::trim) {
        if let Some(value) = line.strip_prefix("Enabled:") {
            settings.enabled = value.trim() == "Yes";
        } else if let Some(value) = line.strip_prefix("Server:") {
            let value = value.trim();
            settings.server = (!value.is_empty()).then(|| value.to_string());
        } else if let Some(value) = line.strip_prefix("Port:") {
            settings.port = value.trim().parse::<u16>().ok().filter(|p| *p != 0);
        } else if let Some(value) = line.strip_prefix("Authenticated Proxy Enabled:") {
            settings.authenticated = matches!(value.trim(), "Yes" | "1");
        }
    }

    settings
}

/// Runs the platform proxy-configuration tool.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs the tool with `args` and returns its standard output.
    async fn run(&self, args: &[String]) -> std::result::Result<String, CommandError>;
}

/// [`CommandRunner`] backed by the `networksetup` executable.
#[derive(Debug, Clone)]
pub struct NetworkSetup {
    program: PathBuf,
}

impl Default for NetworkSetup {
    fn default() -> Self {
        Self::new(NETWORKSETUP)
    }
}

impl NetworkSetup {
    /// Uses `program` as the tool executable.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl CommandRunner for NetworkSetup {
    async fn run(&self, args: &[String]) -> std::result::Result<String, CommandError> {
        let command = format!("{} {}", self.program.display(), args.join(" "));

        let output = tokio::process::Command::new(&self.program)
            .args(args)
            .output()
            .await
            .map_err(|source| CommandError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(CommandError::Failed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Orchestrates system proxy settings across all network services.
pub struct SystemProxyManager {
    runner: Arc<dyn CommandRunner>,
    backup_dir: PathBuf,
    last_backup: Mutex<Option<PathBuf>>,
}

impl std::fmt::Debug for SystemProxyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemProxyManager")
            .field("backup_dir", &self.backup_dir)
            .field("last_backup", &*self.last_backup.lock())
            .finish()
    }
}

impl SystemProxyManager {
    /// Creates a manager using `networksetup`, writing backups to `backup_dir`.
    pub fn new(backup_dir: impl Into<PathBuf>) -> Self {
        Self::with_runner(Arc::new(NetworkSetup::default()), backup_dir)
    }

    /// Creates a manager with a custom command runner.
    pub fn with_runner(runner: Arc<dyn CommandRunner>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            backup_dir: backup_dir.into(),
            last_backup: Mutex::new(None),
        }
    }

    /// Returns the directory backups are written to.
    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Returns the most recent backup taken by this manager.
    pub fn last_backup(&self) -> Option<PathBuf> {
        self.last_backup.lock().clone()
    }

    /// Lists enabled network services. Returns an empty list if the tool fails.
    pub async fn list_services(&self) -> Vec<String> {
        match self
            .runner
            .run(&["-listallnetworkservices".to_string()])
            .await
        {
            Ok(output) => parse_service_list(&output),
            Err(e) => {
                tracing::error!(error = %e, "Failed to get network services");
                Vec::new()
            }
        }
    }

    async fn query(&self, service: &str, kind: ProxyKind) -> Result<ProxySettings> {
        let output = self.runner.run(&kind.get_args(service)).await?;
        Ok(parse_proxy_settings(&output))
    }

    /// Reads the current proxy settings of every service.
    ///
    /// Services are processed one at a time; the four protocols of a service
    /// are queried concurrently. A service whose query fails is left out.
    pub async fn get_settings(&self) -> Vec<NetworkService> {
        let mut settings = Vec::new();

        for service in self.list_services().await {
            let queried = tokio::try_join!(
                self.query(&service, ProxyKind::Http),
                self.query(&service, ProxyKind::Https),
                self.query(&service, ProxyKind::Ftp),
                self.query(&service, ProxyKind::Socks),
            );

            match queried {
                Ok((http, https, ftp, socks)) => settings.push(NetworkService {
                    name: service,
                    http_proxy: Some(http),
                    https_proxy: Some(https),
                    ftp_proxy: Some(ftp),
                    socks_proxy: Some(socks),
                }),
                Err(e) => {
                    tracing::warn!(service = %service, error = %e, "Failed to get proxy settings");
                }
            }
        }

        settings
    }

    /// Writes the current settings of every service to a timestamped snapshot
    /// and remembers it as the default restore target.
    pub async fn backup(&self) -> Result<PathBuf> {
        let settings = self.get_settings().await;

        let timestamp = Utc::now()
            .to_rfc3339_opts(SecondsFormat::Millis, true)
            .replace([':', '.'], "-");
        let path = self
            .backup_dir
            .join(format!("proxy-backup-{}.json", timestamp));

        let json = serde_json::to_string_pretty(&settings)?;
        tokio::fs::create_dir_all(&self.backup_dir).await?;
        if let Err(e) = tokio::fs::write(&path, json).await {
            tracing::error!(path = %path.display(), error = %e, "Failed to backup proxy settings");
            return Err(e.into());
        }

        *self.last_backup.lock() = Some(path.clone());
        tracing::info!(path = %path.display(), "Proxy settings backed up");
        Ok(path)
    }

    /// Points HTTP, HTTPS and FTP proxying of every service at `host:port`.
    ///
    /// A backup is always taken first; failing to write it aborts the call.
    pub async fn enable(&self, host: &str, port: u16) -> Result<()> {
        tracing::info!(host, port, "Enabling system proxy");

        self.backup().await?;

        for service in self.list_services().await {
            let mut ok = true;
            for kind in ProxyKind::ENABLED_BY_PROXY {
                ok &= self.set_endpoint(&service, kind, host, port).await;
            }
            if ok {
                tracing::debug!(service = %service, "Proxy enabled for service");
            }
        }

        tracing::info!("System proxy configuration completed");
        Ok(())
    }

    /// Turns off HTTP, HTTPS, FTP and SOCKS proxying on every service.
    pub async fn disable(&self) -> Result<()> {
        tracing::info!("Disabling system proxy");

        for service in self.list_services().await {
            let mut ok = true;
            for kind in ProxyKind::ALL {
                ok &= self.set_state(&service, kind, false).await;
            }
            if ok {
                tracing::debug!(service = %service, "Proxy disabled for service");
            }
        }

        tracing::info!("System proxy disabled");
        Ok(())
    }

    /// Restores the settings recorded in a snapshot.
    ///
    /// Uses `path` if given, else the most recent backup. Every protocol of
    /// every recorded service ends up either enabled with its recorded
    /// endpoint or explicitly disabled.
    pub async fn restore(&self, path: Option<&Path>) -> Result<()> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => self.last_backup().ok_or(ProxyError::NoBackup)?,
        };

        let services = read_snapshot(&path).await.inspect_err(|e| {
            tracing::error!(error = %e, "Failed to restore proxy settings");
        })?;

        for service in &services {
            for kind in ProxyKind::ALL {
                match service.settings(kind).and_then(ProxySettings::enabled_endpoint) {
                    Some((server, port)) => {
                        self.set_endpoint(&service.name, kind, server, port).await;
                    }
                    None => {
                        self.set_state(&service.name, kind, false).await;
                    }
                }
            }
        }

        tracing::info!(path = %path.display(), "Proxy settings restored");
        Ok(())
    }

    /// Probes whether the tool can be run at all.
    pub async fn check_permissions(&self) -> bool {
        match self
            .runner
            .run(&["-listallnetworkservices".to_string()])
            .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "Insufficient permissions to modify network settings"
                );
                false
            }
        }
    }

    /// Sets `kind` on `service` to `server:port` and turns it on. The state
    /// is only switched on once the endpoint is set.
    async fn set_endpoint(&self, service: &str, kind: ProxyKind, server: &str, port: u16) -> bool {
        if let Err(e) = self.runner.run(&kind.set_args(service, server, port)).await {
            tracing::warn!(
                service,
                kind = kind.tool_name(),
                error = %e,
                "Failed to set proxy"
            );
            return false;
        }
        self.set_state(service, kind, true).await
    }

    async fn set_state(&self, service: &str, kind: ProxyKind, on: bool) -> bool {
        match self.runner.run(&kind.state_args(service, on)).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(
                    service,
                    kind = kind.tool_name(),
                    on,
                    error = %e,
                    "Failed to change proxy state"
                );
                false
            }
        }
    }
}

async fn read_snapshot(path: &Path) -> Result<Vec<NetworkService>> {
    let corrupt = |reason: String| ProxyError::SnapshotCorrupt {
        path: path.to_path_buf(),
        reason,
    };

    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| corrupt(e.to_string()))?;
    serde_json::from_str(&contents).map_err(|e| corrupt(e.to_string()))
}
