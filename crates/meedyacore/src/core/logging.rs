//! Logging initialization
//!
//! The library only uses the `log` facade; binaries call [`init_logger`] once.

use anyhow::Result;
use simplelog::*;
use std::fs::OpenOptions;
use std::path::Path;

/// Initialize logger for both console and file output
///
/// The file is opened in append mode so restarts keep earlier runs.
///
/// # Arguments
/// * `log_file_path` - Path to the log file
/// * `level` - Minimum level for both sinks
///
/// # Returns
/// * `Ok(())` - Logger initialized successfully
/// * `Err(anyhow::Error)` - Failed to open the file or a logger is already set
pub fn init_logger(log_file_path: &Path, level: LevelFilter) -> Result<()> {
    if let Some(parent) = log_file_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file_path)
        .map_err(|e| anyhow::anyhow!("Failed to open log file {}: {}", log_file_path.display(), e))?;

    let config = ConfigBuilder::new()
        .add_filter_ignore_str("mp4ameta")
        .build();

    CombinedLogger::init(vec![
        TermLogger::new(level, config.clone(), TerminalMode::Stderr, ColorChoice::Auto),
        WriteLogger::new(level, config, log_file),
    ])
    .map_err(|e| anyhow::anyhow!("Failed to initialize logger: {}", e))?;

    Ok(())
}
