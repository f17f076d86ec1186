use thiserror::Error;

use crate::snapshot::SecretSource;

#[derive(Debug, Error)]
pub enum Error {
    #[error("secret {0} is not set in any enabled backend and has no default")]
    MissingSecret(String),

    #[error("{backend} backend failed for {name}: {message}")]
    SecretBackend {
        name: String,
        backend: SecretSource,
        message: String,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Secret name this error is about, if it concerns a single name.
    pub fn secret_name(&self) -> Option<&str> {
        match self {
            Error::MissingSecret(name) | Error::SecretBackend { name, .. } => Some(name),
            _ => None,
        }
    }
}

impl From<common::Error> for Error {
    fn from(err: common::Error) -> Self {
        match err {
            common::Error::Config(msg) => Error::Configuration(msg),
            other => Error::Io(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
