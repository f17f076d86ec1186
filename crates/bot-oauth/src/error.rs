//! Error types for the authorization flow

use std::time::Duration;

/// Errors from PKCE generation, the callback listener and the token endpoint.
///
/// Every variant is terminal for the current authorization attempt; the
/// operator restarts the flow from `authorize`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("callback state is missing or does not match the authorization request")]
    InvalidState,

    #[error("callback did not include an authorization code")]
    MissingCode,

    #[error("authorization denied by provider: {error}{}", describe_denial(.description))]
    ProviderDenied {
        error: String,
        description: Option<String>,
    },

    #[error("token exchange failed with status {status}: {}", describe_exchange(.error, .body))]
    TokenExchange {
        status: u16,
        error: Option<String>,
        body: String,
    },

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("no callback received within {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("token exchange did not complete within {}s of the callback timeout", .0.as_secs())]
    ExchangeTimeout(Duration),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("token file error: {0}")]
    TokenFile(String),
}

impl Error {
    /// OAuth error code reported by the provider, if any.
    pub fn provider_error(&self) -> Option<&str> {
        match self {
            Error::ProviderDenied { error, .. } => Some(error),
            Error::TokenExchange { error, .. } => error.as_deref(),
            _ => None,
        }
    }
}

fn describe_denial(description: &Option<String>) -> String {
    description
        .as_deref()
        .map(|d| format!(" ({d})"))
        .unwrap_or_default()
}

fn describe_exchange(error: &Option<String>, body: &str) -> String {
    match error {
        Some(code) => code.clone(),
        None => body.to_owned(),
    }
}

impl From<common::Error> for Error {
    fn from(e: common::Error) -> Self {
        match e {
            common::Error::Config(msg) => Error::Configuration(msg),
            other => Error::Io(other.to_string()),
        }
    }
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_exchange_display_prefers_error_code() {
        let err = Error::TokenExchange {
            status: 400,
            error: Some("invalid_grant".into()),
            body: r#"{"error":"invalid_grant"}"#.into(),
        };
        assert_eq!(
            err.to_string(),
            "token exchange failed with status 400: invalid_grant"
        );
        assert_eq!(err.provider_error(), Some("invalid_grant"));
    }

    #[test]
    fn token_exchange_display_falls_back_to_body() {
        let err = Error::TokenExchange {
            status: 503,
            error: None,
            body: "upstream unavailable".into(),
        };
        assert!(err.to_string().ends_with("upstream unavailable"));
        assert_eq!(err.provider_error(), None);
    }

    #[test]
    fn provider_denied_includes_description() {
        let err = Error::ProviderDenied {
            error: "access_denied".into(),
            description: Some("user cancelled".into()),
        };
        assert_eq!(
            err.to_string(),
            "authorization denied by provider: access_denied (user cancelled)"
        );
    }

    #[test]
    fn timeout_reports_window() {
        let err = Error::Timeout(Duration::from_secs(300));
        assert_eq!(err.to_string(), "no callback received within 300s");
    }
}
