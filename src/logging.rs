//! Structured logging setup: console output gated by `VECAI_LOG_LEVEL`/
//! `NO_COLOR`, plus a rolling file layer under `.vecai/logs/`.

use std::path::{Path, PathBuf};

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Guard that must be kept alive for the lifetime of the process; dropping it
/// stops the non-blocking file writer from flushing further events.
pub struct LoggingGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initialize global tracing subscribers for a session.
///
/// `level` is an `EnvFilter` directive string (e.g. `"info"`, `"debug"`);
/// `log_dir` is the directory logs are written under (normally
/// `<home>/.vecai/logs`). Writes `session_<timestamp>.log` and relinks
/// `latest.log` to point at it.
pub fn init(level: &str, no_color: bool, log_dir: Option<&Path>, session_id: &str) -> LoggingGuard {
    let env_filter =
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    let console_layer = fmt::layer().with_ansi(!no_color).with_target(false);

    let (file_layer, guard) = match log_dir {
        Some(dir) => match make_file_layer(dir, session_id) {
            Ok((layer, guard)) => (Some(layer), Some(guard)),
            Err(e) => {
                eprintln!("warning: failed to initialize file logging: {e}");
                (None, None)
            }
        },
        None => (None, None),
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer);

    // Only the first call in a process should install the global subscriber;
    // subsequent calls (e.g. in tests) are no-ops.
    let _ = registry.try_init();

    LoggingGuard { _file_guard: guard }
}

type FileLayer = tracing_subscriber::fmt::Layer<
    tracing_subscriber::Registry,
    tracing_subscriber::fmt::format::DefaultFields,
    tracing_subscriber::fmt::format::Format,
    tracing_appender::non_blocking::NonBlocking,
>;

fn make_file_layer(
    log_dir: &Path,
    session_id: &str,
) -> std::io::Result<(FileLayer, tracing_appender::non_blocking::WorkerGuard)> {
    std::fs::create_dir_all(log_dir)?;
    let file_name = format!("session_{session_id}.log");
    let file_path = log_dir.join(&file_name);
    let file = std::fs::File::create(&file_path)?;

    relink_latest(log_dir, &file_name);

    let (non_blocking, guard) = tracing_appender::non_blocking(file);
    let layer = fmt::layer().with_ansi(false).with_writer(non_blocking);
    Ok((layer, guard))
}

fn relink_latest(log_dir: &Path, file_name: &str) {
    let latest: PathBuf = log_dir.join("latest.log");
    let _ = std::fs::remove_file(&latest);
    #[cfg(unix)]
    {
        let _ = std::os::unix::fs::symlink(file_name, &latest);
    }
    #[cfg(not(unix))]
    {
        let _ = std::fs::copy(log_dir.join(file_name), &latest);
    }
}

/// Default log directory: `<home>/.vecai/logs`.
pub fn default_log_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".vecai").join("logs"))
}
