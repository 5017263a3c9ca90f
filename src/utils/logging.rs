// src/utils/logging.rs
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::utils::config::NodeConfig;

pub const LOG_FILE_PREFIX: &str = "fleetgate.log";

/// Installs the global subscriber: stdout always, plus a daily rolling file
/// when `log_dir` is configured. Keep the returned guard alive for the
/// lifetime of the process so buffered file output is flushed.
pub fn init_logging(node: &NodeConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(node.log_level.as_str()));
    let stdout = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true)
        .with_file(true)
        .with_line_number(true);

    let (file_layer, guard) = match node.log_dir.as_deref() {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(filter)
        .with(stdout)
        .with(file_layer)
        .try_init()
    {
        eprintln!("logging already initialised: {}", e);
    }
    guard
}
