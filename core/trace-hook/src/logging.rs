//! File logging for the hook.
//!
//! Hooks run inside someone else's process tree, so nothing goes to stdout or
//! stderr. Output lands in `<store>/logs/trace-hook.log`.
//!
//! `TRACE_DEBUG_LOG=1` forces `debug`; otherwise `RUST_LOG`, then `info`.

use std::env;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use trace_core::StorageConfig;

const LOG_FILE_NAME: &str = "trace-hook.log";
const DEBUG_ENV: &str = "TRACE_DEBUG_LOG";

/// Installs the subscriber. The returned guard flushes on drop and must be
/// held for the life of `main`. Returns `None` (logging disabled) if the log
/// directory cannot be created.
pub fn init(storage: &StorageConfig) -> Option<WorkerGuard> {
    let log_dir = storage.logs_dir();
    fs_err::create_dir_all(&log_dir).ok()?;

    let file_appender = tracing_appender::rolling::never(&log_dir, LOG_FILE_NAME);
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    let result = tracing_subscriber::registry()
        .with(filter())
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false),
        )
        .try_init();

    match result {
        Ok(()) => Some(guard),
        Err(_) => None,
    }
}

fn filter() -> EnvFilter {
    if debug_enabled(env::var(DEBUG_ENV).ok().as_deref()) {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

fn debug_enabled(value: Option<&str>) -> bool {
    matches!(value, Some("1" | "true" | "TRUE" | "yes" | "YES"))
}
