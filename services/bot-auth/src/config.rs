//! Configuration types and loading
//!
//! Config precedence: CLI `--config` > `CONFIG_PATH` env var > `bot-auth.toml`.
//! Only non-secret settings live in the TOML. Client id, verifier, state and
//! tokens come from the secret chain so they never end up in a config file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bot_oauth::constants::{AUTHORIZE_ENDPOINT, DEFAULT_CALLBACK_PATH, DEFAULT_REDIRECT_URI, SCOPES, TOKEN_ENDPOINT};
use bot_secrets::Defaults;
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "bot-auth.toml";

/// Names resolved through the secret chain.
pub mod keys {
    pub const CLIENT_ID: &str = "TW_CLIENT_ID";
    pub const REDIRECT_URI: &str = "TW_REDIRECT_URI";
    pub const CODE_VERIFIER: &str = "TW_CODE_VERIFIER";
    pub const OAUTH_STATE: &str = "TW_OAUTH_STATE";
    pub const CLIENT_SECRET: &str = "TW_CLIENT_SECRET";
    pub use bot_oauth::constants::token_keys::{ACCESS_TOKEN, REFRESH_TOKEN};
}

/// Secrets the bot cannot start without.
pub const DEFAULT_REQUIRED: &[&str] = &[keys::CLIENT_ID, keys::ACCESS_TOKEN];

/// Compiled-in fallbacks, last in the secret chain.
pub fn secret_defaults() -> Defaults {
    Defaults::new([(keys::REDIRECT_URI, DEFAULT_REDIRECT_URI)])
}

/// Root configuration
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub callback: CallbackConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Provider endpoints and requested scopes
#[derive(Debug, Deserialize)]
pub struct OAuthConfig {
    #[serde(default = "default_authorize_endpoint")]
    pub authorize_endpoint: String,
    #[serde(default = "default_token_endpoint")]
    pub token_endpoint: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    /// Per-request timeout for the token endpoint
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Local redirect listener
#[derive(Debug, Deserialize)]
pub struct CallbackConfig {
    #[serde(default = "default_callback_path")]
    pub path: String,
    #[serde(default = "default_callback_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_token_file")]
    pub token_file: PathBuf,
}

fn default_authorize_endpoint() -> String {
    AUTHORIZE_ENDPOINT.into()
}

fn default_token_endpoint() -> String {
    TOKEN_ENDPOINT.into()
}

fn default_scopes() -> Vec<String> {
    SCOPES.iter().map(|s| s.to_string()).collect()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_callback_path() -> String {
    DEFAULT_CALLBACK_PATH.into()
}

fn default_callback_timeout() -> u64 {
    300
}

fn default_token_file() -> PathBuf {
    PathBuf::from("oauth_tokens.env")
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            authorize_endpoint: default_authorize_endpoint(),
            token_endpoint: default_token_endpoint(),
            scopes: default_scopes(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            path: default_callback_path(),
            timeout_secs: default_callback_timeout(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            token_file: default_token_file(),
        }
    }
}

impl OAuthConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl CallbackConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the resolved path. A missing file at the default path means
    /// built-in defaults; a missing file the operator named is an error.
    pub fn load_resolved(cli_path: Option<&Path>) -> common::Result<(Self, Option<PathBuf>)> {
        let (path, explicit) = Self::resolve_path(cli_path);
        if !explicit && !path.exists() {
            return Ok((Self::default(), None));
        }
        let config = Self::load(&path).map_err(|e| {
            common::Error::Config(format!("failed to load {}: {e}", path.display()))
        })?;
        Ok((config, Some(path)))
    }

    pub fn validate(&self) -> common::Result<()> {
        for (name, url) in [
            ("authorize_endpoint", &self.oauth.authorize_endpoint),
            ("token_endpoint", &self.oauth.token_endpoint),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(common::Error::Config(format!(
                    "{name} must start with http:// or https://, got: {url}"
                )));
            }
        }

        if self.oauth.scopes.iter().all(|s| s.trim().is_empty()) {
            return Err(common::Error::Config("scopes must not be empty".into()));
        }

        if self.oauth.request_timeout_secs == 0 {
            return Err(common::Error::Config(
                "oauth request_timeout_secs must be greater than 0".into(),
            ));
        }

        if !self.callback.path.starts_with('/') {
            return Err(common::Error::Config(format!(
                "callback path must start with '/', got: {}",
                self.callback.path
            )));
        }

        if self.callback.timeout_secs == 0 {
            return Err(common::Error::Config(
                "callback timeout_secs must be greater than 0".into(),
            ));
        }

        if self.storage.token_file.as_os_str().is_empty() {
            return Err(common::Error::Config("token_file must not be empty".into()));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    /// The flag is `true` when the path was named explicitly.
    pub fn resolve_path(cli_path: Option<&Path>) -> (PathBuf, bool) {
        if let Some(p) = cli_path {
            return (p.to_path_buf(), true);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return (PathBuf::from(p), true);
        }
        (PathBuf::from(DEFAULT_CONFIG_PATH), false)
    }
}
