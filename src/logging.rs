//! Logging setup.

use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};

/// Route `log` output to `<log_dir>/taskloom.log`, filtered by `RUST_LOG`.
///
/// Returns the log file path. Fails if a global logger is already installed.
pub fn init_logging(log_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("taskloom.log");

    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(target))
        .try_init()
        .context("Failed to install logger")?;

    log::info!("Logging initialized, writing to: {}", log_file.display());
    Ok(log_file)
}
