//! Tracing setup for the daemon.
//!
//! On Linux events go to the systemd journal when it is reachable. Otherwise
//! they are written to `photoindex.log` under the local data directory,
//! rotated once a day. `--once` and `--stderr` runs log to the terminal.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_ENV: &str = "PHOTOINDEX_LOG";

/// Writer thread handle for the file backend. Dropping it loses buffered lines.
static FILE_WRITER: OnceLock<WorkerGuard> = OnceLock::new();

/// `PHOTOINDEX_LOG` takes any `EnvFilter` directive; unset means `info`.
fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("photoindex")
        .join("logs")
}

/// Install the daemon subscriber: journald first, then the rolling file.
pub fn init(log_dir: Option<PathBuf>) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        if let Ok(journald) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(env_filter())
                .with(journald)
                .try_init()?;
            tracing::info!(backend = "journald", "Logging started");
            return Ok(());
        }
    }

    let log_dir = log_dir.unwrap_or_else(default_log_dir);
    std::fs::create_dir_all(&log_dir)?;

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "photoindex.log"));
    let _ = FILE_WRITER.set(guard);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .try_init()?;
    tracing::info!(backend = "file", dir = %log_dir.display(), "Logging started");
    Ok(())
}

/// Terminal logging for foreground runs.
pub fn init_stderr() -> Result<()> {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()?;
    Ok(())
}
