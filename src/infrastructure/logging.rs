use std::fs;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::domain::DomainError;

/// Set to `1` or `true` to force debug verbosity.
pub const DEBUG_ENV: &str = "LORACTL_DEBUG";

/// Whether `LORACTL_DEBUG` asks for debug output.
pub fn debug_requested() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Default filter directive for our own targets at `level`.
fn directive(level: &str) -> String {
    format!("loractl_lib={0},loractl={0}", level)
}

/// Initialize the logging system with console output and file rotation.
///
/// Console output goes to stderr so command output on stdout stays clean.
/// `RUST_LOG` overrides the console filter. Returns a guard that must be
/// kept alive for the duration of the process; dropping it flushes the file.
pub fn init_logging(
    logs_dir: &Path,
    level: &str,
    file_logging: bool,
) -> Result<Option<WorkerGuard>, DomainError> {
    let level = if debug_requested() { "debug" } else { level };

    if file_logging {
        fs::create_dir_all(logs_dir)?;
    }

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},warn", directive(level))));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(level == "debug" || level == "trace")
        .with_thread_ids(false)
        .with_span_events(FmtSpan::NONE)
        .with_filter(env_filter);

    if file_logging {
        let file_appender = RollingFileAppender::new(Rotation::DAILY, logs_dir, "loractl.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        // File layer always records at least info, whatever the console shows
        let file_level = if level == "debug" || level == "trace" { level } else { "info" };
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_filter(EnvFilter::new(directive(file_level)));

        // try_init: a second call (tests, embedding) must not panic
        if tracing_subscriber::registry()
            .with(console_layer)
            .with(file_layer)
            .try_init()
            .is_ok()
        {
            tracing::debug!(
                logs_dir = ?logs_dir,
                level = level,
                "Logging initialized with file output"
            );
        }

        Ok(Some(guard))
    } else {
        let _ = tracing_subscriber::registry()
            .with(console_layer)
            .try_init();

        tracing::debug!(level = level, "Logging initialized (console only)");

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_directive_covers_lib_and_bin() {
        assert_eq!(directive("warn"), "loractl_lib=warn,loractl=warn");
        assert!(EnvFilter::try_new(directive("debug")).is_ok());
    }

    #[test]
    fn test_init_creates_logs_dir() {
        let dir = TempDir::new().unwrap();
        let logs = dir.path().join("logs");
        let guard = init_logging(&logs, "info", true).unwrap();
        assert!(guard.is_some());
        assert!(logs.is_dir());
    }
}
