//! Remote HTTP secret store
//!
//! Speaks the KV v2 read API (`GET /v1/{mount}/data/{path}` with an
//! `X-Vault-Token` header). The secret at `{prefix}/{name}` is expected to
//! hold either a field named `name` or a field named `value`.

use std::time::Duration;

use common::Secret;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};
use crate::snapshot::SecretSource;

pub const TOKEN_HEADER: &str = "X-Vault-Token";
pub const DEFAULT_MOUNT: &str = "secret";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct RemoteStoreConfig {
    pub addr: String,
    pub token: Secret<String>,
    pub mount: String,
    pub prefix: Option<String>,
    pub timeout: Duration,
}

impl RemoteStoreConfig {
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.addr)
            .map_err(|e| Error::Configuration(format!("remote store address is not a valid URL: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Configuration(format!(
                "remote store address must be http(s), got {}",
                url.scheme()
            )));
        }
        if self.token.is_blank() {
            return Err(Error::Configuration("remote store token is empty".into()));
        }
        if self.mount.trim_matches('/').is_empty() {
            return Err(Error::Configuration("remote store mount is empty".into()));
        }
        if self.timeout.is_zero() {
            return Err(Error::Configuration(
                "remote store timeout must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RemoteStore {
    http: reqwest::Client,
    config: RemoteStoreConfig,
}

impl RemoteStore {
    pub fn new(config: RemoteStoreConfig) -> Result<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("building remote store client: {e}")))?;
        Ok(Self { http, config })
    }

    /// Read URL for `name`.
    pub fn secret_url(&self, name: &str) -> Result<Url> {
        let mut url = Url::parse(&self.config.addr)
            .map_err(|e| Error::Configuration(format!("remote store address is not a valid URL: {e}")))?;
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                Error::Configuration("remote store address cannot be a base URL".into())
            })?;
            segments.pop_if_empty().push("v1");
            segments.extend(split_path(&self.config.mount));
            segments.push("data");
            if let Some(prefix) = &self.config.prefix {
                segments.extend(split_path(prefix));
            }
            segments.push(name);
        }
        Ok(url)
    }

    /// Fetch `name`. 404 means not stored here; every other failure is a
    /// backend error for this name only.
    pub async fn fetch(&self, name: &str) -> Result<Option<String>> {
        let fail = |message: String| Error::SecretBackend {
            name: name.to_owned(),
            backend: SecretSource::SecretStore,
            message,
        };

        let url = self.secret_url(name)?;
        debug!(name, path = url.path(), "querying remote secret store");

        let response = self
            .http
            .get(url)
            .header(TOKEN_HEADER, self.config.token.expose().as_str())
            .send()
            .await
            .map_err(|e| fail(format!("request failed: {}", e.without_url())))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(fail(format!("store answered with status {}", status.as_u16())));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| fail(format!("response is not JSON: {}", e.without_url())))?;
        extract_value(&body, name).map_err(fail)
    }
}

/// Pull the field for `name` out of a KV v2 read response.
fn extract_value(body: &Value, name: &str) -> std::result::Result<Option<String>, String> {
    let data = body
        .pointer("/data/data")
        .and_then(Value::as_object)
        .ok_or_else(|| "response has no data.data object".to_owned())?;

    match data.get(name).or_else(|| data.get("value")) {
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err("secret field is not a string".to_owned()),
        None => Err(format!("secret has neither a {name} nor a value field")),
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}
