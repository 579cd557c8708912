//! Logging setup: JSON lines to stdout, optionally appended to a file.

use std::path::Path;

use anyhow::{Context, Result};
use tapline_server::LogLevel;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter directive for `level` when `RUST_LOG` is not set.
pub fn default_directive(level: LogLevel) -> String {
    match level {
        LogLevel::Silent => "off".to_string(),
        other => format!(
            "tapline={0},tapline_proxy={0},tapline_server={0},warn",
            other.filter_directive()
        ),
    }
}

/// Opens `path` for appending through a background writer.
///
/// The parent directory is created if missing. Log lines are flushed when the
/// returned guard is dropped.
pub fn file_writer(path: &Path) -> Result<(NonBlocking, WorkerGuard)> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let file_name = path
        .file_name()
        .with_context(|| format!("log file {:?} has no file name", path))?;

    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create log directory {:?}", dir))?;

    let appender = tracing_appender::rolling::never(dir, file_name);
    Ok(tracing_appender::non_blocking(appender))
}

/// Installs the global subscriber. Keep the returned guard alive until exit.
pub fn init_logging(level: LogLevel, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(level)));

    let stdout = fmt::layer().json().with_writer(std::io::stdout);

    match log_file {
        Some(path) => {
            let (writer, guard) = file_writer(path)?;
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stdout)
                .with(fmt::layer().json().with_ansi(false).with_writer(writer))
                .try_init()
                .context("failed to install log subscriber")?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stdout)
                .try_init()
                .context("failed to install log subscriber")?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn silent_disables_everything() {
        assert_eq!(default_directive(LogLevel::Silent), "off");
    }

    #[test]
    fn level_applies_to_own_crates() {
        let directive = default_directive(LogLevel::Debug);
        assert!(directive.contains("tapline_proxy=debug"));
        assert!(directive.contains("tapline_server=debug"));
        assert!(directive.ends_with(",warn"));
    }

    #[test]
    fn file_writer_creates_directory_and_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("tapline.log");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "first\n").unwrap();

        let (mut writer, guard) = file_writer(&path).unwrap();
        writer.write_all(b"second\n").unwrap();
        drop(guard);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "first\nsecond\n");
    }

    #[test]
    fn file_writer_creates_missing_parent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("proxy.log");

        let (_writer, _guard) = file_writer(&path).unwrap();
        assert!(path.parent().unwrap().is_dir());
    }
}
