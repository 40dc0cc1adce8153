//! Logger setup for the `reckon` binary.
//!
//! The library only emits through the `log` facade; this module installs the `env_logger` backend
//! with a timestamped line format, writing to stderr or appending to a file.

use std::error::Error;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use log::LevelFilter;

/// Parse a level name (off, error, warn, info, debug, trace), case-insensitive
pub fn parse_level(log_level: &str) -> Result<LevelFilter, Box<dyn Error>> {
    log_level
        .parse::<LevelFilter>()
        .map_err(|_| format!("Invalid log level '{}'", log_level).into())
}

/// Initialize the global logger.
///
/// # Arguments
/// * `log_level` - Log level string (off, error, warn, info, debug, trace)
/// * `log_file` - Optional path to log file (logs to stderr if None); missing parent
///   directories are created
///
/// # Errors
/// Returns an error if the level is unknown, the log file cannot be opened, or a logger is
/// already installed.
pub fn init_logger(log_level: &str, log_file: Option<&PathBuf>) -> Result<(), Box<dyn Error>> {
    let level = parse_level(log_level)?;

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] {} - {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        )
    });

    if let Some(log_path) = log_file {
        if let Some(parent) = log_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let target = Box::new(OpenOptions::new().create(true).append(true).open(log_path)?);
        builder.target(env_logger::Target::Pipe(target));
    }

    builder.try_init()?;
    Ok(())
}
