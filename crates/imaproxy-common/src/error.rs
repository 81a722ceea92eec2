//! Error types for IMAProxy

use thiserror::Error;

/// Main error type for IMAProxy
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Plugin error: {0}")]
    Plugin(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for IMAProxy
pub type Result<T> = std::result::Result<T, Error>;
