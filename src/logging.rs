//! Process-wide logging sink, installed once by the first `Manager`.
//!
//! Modeled on the "Global logging" design note: the log sink is a
//! process-wide service with an idempotent `open`. A second `Manager`
//! constructed in the same process reuses whatever subscriber is already
//! installed rather than erroring or double-installing.

use std::path::Path;
use std::sync::OnceLock;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;

static LOGGING: OnceLock<Option<WorkerGuard>> = OnceLock::new();

/// Install the global `tracing` subscriber if one hasn't been installed yet
/// by this process. `log_path` of `None` logs to stdout.
pub fn init(min_level: Level, log_path: Option<&Path>) {
    LOGGING.get_or_init(|| {
        let filter = tracing_subscriber::EnvFilter::builder()
            .with_default_directive(min_level.into())
            .from_env_lossy();

        match log_path {
            Some(path) => {
                let dir = path.parent().unwrap_or_else(|| Path::new("."));
                let file_name = path
                    .file_name()
                    .map(|n| n.to_owned())
                    .unwrap_or_else(|| "device_manager.log".into());
                let file_appender = tracing_appender::rolling::never(dir, file_name);
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .init();
                Some(guard)
            }
            None => {
                tracing_subscriber::fmt().with_env_filter(filter).init();
                None
            }
        }
    });
}
