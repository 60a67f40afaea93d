//! Logging configuration with journald support on Linux.
//!
//! Sets up tracing-based logging that integrates with systemd's journal on
//! Linux, with a rolling-file fallback elsewhere. Interactive runs can ask
//! for plain stderr output instead.

use anyhow::Result;
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Where log records are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    /// journald when available, else a daily log file.
    System,
    Stderr,
}

/// Initialize the logging system.
///
/// Log level is controlled via the `IMGDEDUPE_LOG` environment variable
/// (`trace`, `debug`, `info`, `warn`, `error`); the default is `info`.
pub fn init(target: LogTarget, log_dir: Option<PathBuf>) -> Result<()> {
    let env_filter = EnvFilter::try_from_env("IMGDEDUPE_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if target == LogTarget::Stderr {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()?;
        return Ok(());
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(journald_layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(journald_layer)
                .try_init()?;

            tracing::info!("Logging initialized with journald backend");
            return Ok(());
        }
    }

    let log_dir = log_dir.unwrap_or_else(|| {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("imgdedupe")
            .join("logs")
    });

    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "imgdedupe.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // The writer flushes on drop; keep it for the life of the process.
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .try_init()?;

    tracing::info!("Logging initialized with file backend at {:?}", log_dir);
    Ok(())
}
