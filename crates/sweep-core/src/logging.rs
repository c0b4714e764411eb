//! Subscriber setup for the `sweep` binary.
//!
//! Two layers: compact human-readable output on stderr, and JSON lines in a
//! per-invocation file under
//! `<logs_root>/<command>/<experiment>/sub_<YYYYmmddHHMM>/<command>.log`.
//! Library code only emits events; it never installs a subscriber.

use crate::ensure_dir;
use crate::error::{Result, SweepError};
use chrono::Local;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Where this invocation's log file went.
#[derive(Debug, Clone)]
pub struct LogGuard {
    pub log_dir: PathBuf,
    pub log_path: PathBuf,
}

pub fn invocation_log_dir(logs_root: &Path, command: &str, experiment: &str) -> PathBuf {
    let stamp = Local::now().format("sub_%Y%m%d%H%M").to_string();
    logs_root.join(command).join(experiment).join(stamp)
}

/// Install the global subscriber. Safe to call more than once; later calls keep
/// the first subscriber and only create the log directory.
pub fn init_logging(
    logs_root: &Path,
    command: &str,
    experiment: &str,
    verbose: bool,
) -> Result<LogGuard> {
    let log_dir = invocation_log_dir(logs_root, command, experiment);
    ensure_dir(&log_dir)?;
    let log_path = log_dir.join(format!("{}.log", command));
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| SweepError::io(&log_path, e))?;

    let default_filter = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(Mutex::new(file))
        .with_target(true);

    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(terminal_layer)
        .with(json_layer)
        .try_init();

    Ok(LogGuard { log_dir, log_path })
}

/// Terminal-only logging for commands that do not belong to an experiment.
pub fn init_terminal_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "warn" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .try_init();
}
