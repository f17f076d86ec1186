//! Common error types

use thiserror::Error;

/// Errors shared by configuration loading and env-file handling.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("env file line {line}: {message}")]
    EnvFile { line: usize, message: String },
}

/// Result alias using common Error
pub type Result<T> = std::result::Result<T, Error>;
