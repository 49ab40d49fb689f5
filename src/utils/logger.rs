//! Logging initialization.
//!
//! Logs go to a file in the configured log directory so stdout stays free for
//! the JSON request/response stream. Each run gets its own file.
//!
//! The level is controlled by `RUST_LOG` (default `info`), e.g.
//! `RUST_LOG=hostgate::security=debug` to trace normalization.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// `logs/` next to the executable, or in the working directory.
pub fn default_log_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|p| p.join("logs")))
        .unwrap_or_else(|| PathBuf::from("logs"))
}

/// e.g. `hostgate.2024-12-06-14-30-25.log`
pub fn log_file_name(started: DateTime<Local>) -> String {
    format!("hostgate.{}.log", started.format("%Y-%m-%d-%H-%M-%S"))
}

/// Install the global subscriber. Keep the returned guard alive for the life
/// of the process; dropping it flushes and stops the writer thread.
///
/// When the log file cannot be created, logs fall back to stderr.
pub fn init_logging(log_dir: &Path) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let log_path = log_dir.join(log_file_name(Local::now()));
    let log_file = fs::create_dir_all(log_dir).and_then(|_| fs::File::create(&log_path));

    match log_file {
        Ok(file) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(file);
            let file_layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true);

            tracing_subscriber::registry().with(env_filter).with(file_layer).init();
            tracing::info!("Logging initialized - writing to {}", log_path.display());
            Some(guard)
        }
        Err(e) => {
            let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(true);
            tracing_subscriber::registry().with(env_filter).with(stderr_layer).init();
            tracing::warn!("Cannot write {} ({}); logging to stderr", log_path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_log_file_name() {
        let started = Local.with_ymd_and_hms(2024, 12, 6, 14, 30, 25).unwrap();
        assert_eq!(log_file_name(started), "hostgate.2024-12-06-14-30-25.log");
    }
}
