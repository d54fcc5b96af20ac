use std::io;

use thiserror::Error;

/// Errors returned by the satie engine.
#[derive(Debug, Error)]
pub enum SatieError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Listen address could not be parsed.
    #[error("invalid listen address: {0}")]
    Addr(String),
    /// Document root missing or not a directory.
    #[error("document root unusable: {0}")]
    DocRoot(String),
    /// Log directory could not be created or opened for append.
    #[error("log directory unwritable: {0}")]
    LogDir(String),
    /// Request failed to parse; carries the HTTP status to answer with.
    #[error("malformed request (status {0})")]
    Parse(u16),
    /// Bad or inconsistent configuration value.
    #[error("configuration: {0}")]
    Config(String),
}

pub type SatieResult<T> = Result<T, SatieError>;
