//! Error types for ZPAM

use thiserror::Error;

/// ZPAM error type
#[derive(Error, Debug)]
pub enum ZpamError {
    /// Configuration error
    #[error("config error: {0}")]
    Config(String),

    /// DNS resolution error
    #[error("dns error: {0}")]
    Dns(String),

    /// Learning store error
    #[error("store error: {0}")]
    Store(String),

    /// Plugin execution error
    #[error("plugin error: {0}")]
    Plugin(String),

    /// Milter protocol error
    #[error("milter error: {0}")]
    Milter(String),

    /// Network bind failure
    #[error("bind error: {0}")]
    Bind(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for ZPAM
pub type ZpamResult<T> = Result<T, ZpamError>;
