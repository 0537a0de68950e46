//! Logger bootstrap for host applications

use std::fs::File;
use std::path::Path;
use std::str::FromStr;

use simplelog::{Config, LevelFilter, WriteLogger};

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("creating log file: {0}")]
    Io(#[from] std::io::Error),

    #[error("logger already initialized: {0}")]
    AlreadyInitialized(#[from] log::SetLoggerError),
}

/// Route the `log` facade to `path` at `level`
pub fn init_file_logger(path: &Path, level: LevelFilter) -> Result<(), LoggingError> {
    WriteLogger::init(level, Config::default(), File::create(path)?)?;
    log::info!("pagerast {} logging to {path:?}", crate::settings::VERSION);
    Ok(())
}

/// Same as [`init_file_logger`], with the level taken from the settings
pub fn init_from_settings(path: &Path) -> Result<(), LoggingError> {
    init_file_logger(path, level_from_name(&crate::settings::settings().log_level))
}

/// Parse a level name, falling back to `Info`
#[must_use]
pub fn level_from_name(name: &str) -> LevelFilter {
    LevelFilter::from_str(name).unwrap_or(LevelFilter::Info)
}
