//! Logging initialisation for vsphere-publish.
//!
//! Stderr output is always on, filtered by `RUST_LOG` (default `info`). When
//! the `VSPHERE_PUBLISH_LOG` environment variable is set to `1`, the same
//! events are also written to `publish.log` in the log directory.
//!
//! Returns a guard that must be kept alive for the duration of the process
//! so that buffered log lines are flushed on exit.

use std::path::PathBuf;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::paths::PublishPaths;

pub const LOG_ENV: &str = "VSPHERE_PUBLISH_LOG";
pub const LOG_FILE: &str = "publish.log";

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initialise the global tracing subscriber.
///
/// Call once from `main` and hold the returned `LogGuard` until exit.
pub fn init() -> LogGuard {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_guard = if file_logging_enabled() {
        let dir = log_dir();
        let _ = std::fs::create_dir_all(&dir);
        let file_appender = tracing_appender::rolling::never(&dir, LOG_FILE);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

        tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();

        None
    };

    LogGuard {
        _file_guard: file_guard,
    }
}

fn file_logging_enabled() -> bool {
    std::env::var(LOG_ENV).as_deref() == Ok("1")
}

fn log_dir() -> PathBuf {
    PublishPaths::resolve()
        .map(|p| p.logs)
        .unwrap_or_else(|| std::env::temp_dir().join("vsphere-publish"))
}
