use std::{fs::File, path::{Path, PathBuf}, sync::Arc};

use anyhow::{Context, Result};
use tracing::level_filters::LevelFilter;

/// Default log directory following the XDG state-home convention:
/// `$XDG_STATE_HOME/spool/logs`, falling back to
/// `~/.local/state/spool/logs`.
pub fn default_log_dir() -> PathBuf {
    if let Some(state_home) = std::env::var_os("XDG_STATE_HOME") {
        return PathBuf::from(state_home).join("spool").join("logs");
    }
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".local").join("state").join("spool").join("logs"),
        None => PathBuf::from(".").join("spool").join("logs"),
    }
}

/// Initializes tracing with a timestamped log file in `log_dir`. With
/// `no_log` the subscriber is skipped entirely and tracing output is
/// discarded; the terminal reporter remains the user-facing surface
/// either way.
pub fn init(log_dir: &Path, verbose: bool, no_log: bool) -> Result<Option<PathBuf>> {
    if no_log {
        return Ok(None);
    }

    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;

    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let log_path = log_dir.join(format!("spool_encode_run_{timestamp}.log"));
    let file = File::create(&log_path)
        .with_context(|| format!("failed to create log file {}", log_path.display()))?;

    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_ansi(false)
        .with_writer(Arc::new(file))
        .init();

    tracing::info!("command: {args:?}", args = std::env::args().collect::<Vec<_>>());
    Ok(Some(log_path))
}
