// SPDX-License-Identifier: MIT
//! Tracing subscriber initialization.
//!
//! Mirrors the daemon's own `setup_logging`: compact stdout by default, an
//! optional second `fmt::layer()` writing to a daily-rolling file when a log
//! path is configured. Never panics on a bad log path — falls back to
//! stdout-only with a warning.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Must stay alive for the process lifetime when file logging is enabled.
pub type LogGuard = Option<tracing_appender::non_blocking::WorkerGuard>;

pub fn init(log_level: &str, log_file: Option<&std::path::Path>) -> LogGuard {
    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("orchd.log"));

        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            tracing_subscriber::fmt()
                .with_env_filter(log_level)
                .compact()
                .init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(log_level))
            .with(tracing_subscriber::fmt::layer().compact())
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .init();

        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(log_level)
            .compact()
            .init();
        None
    }
}
