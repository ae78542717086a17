//! Daemon-level errors
//!
//! Everything here is fatal: recoverable conditions are logged where they
//! happen and never surface as a `DaemonError`.

use std::path::PathBuf;
use thiserror::Error;

use crate::config::ConfigError;
use crate::enumerate::EnumerationError;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Driver database error: {0}")]
    Database(#[from] driver_db::DatabaseError),

    #[error("Enumeration error: {0}")]
    Enumeration(#[from] EnumerationError),

    #[error("Couldn't connect to {path} after {attempts} attempts: {source}")]
    Connect {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Event socket error: {0}")]
    Socket(#[source] std::io::Error),
}
