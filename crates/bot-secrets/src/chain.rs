//! Ordered backend chain
//!
//! Backend order is fixed (environment, dotenv file, read-only files, remote
//! store, defaults) regardless of the order they are handed to
//! [`SecretChain::new`].
//! Enable-flags and addressing for the optional backends are read from the
//! environment snapshot, never from the dotenv file itself.

use std::path::PathBuf;
use std::time::Duration;

use common::Secret;
use tracing::{debug, info, warn};

use crate::backend::{Backend, Defaults, DotenvBackend, EnvironmentBackend};
use crate::error::{Error, Result};
use crate::remote::{DEFAULT_MOUNT, DEFAULT_TIMEOUT, RemoteStore, RemoteStoreConfig};
use crate::snapshot::{SecretEntry, SecretSnapshot, SecretSource};

pub const DOTENV_FLAG: &str = "SECRETS_DOTENV";
pub const DOTENV_PATH: &str = "SECRETS_DOTENV_PATH";
pub const REMOTE_FLAG: &str = "SECRETS_REMOTE";
pub const REMOTE_ADDR: &str = "SECRETS_REMOTE_ADDR";
pub const REMOTE_TOKEN: &str = "SECRETS_REMOTE_TOKEN";
pub const REMOTE_MOUNT: &str = "SECRETS_REMOTE_MOUNT";
pub const REMOTE_PREFIX: &str = "SECRETS_REMOTE_PREFIX";
pub const REMOTE_TIMEOUT_SECS: &str = "SECRETS_REMOTE_TIMEOUT_SECS";

pub const DEFAULT_DOTENV_PATH: &str = ".env";

/// Which optional backends are enabled, and how to reach them.
#[derive(Debug, Clone, Default)]
pub struct ChainSettings {
    pub dotenv: Option<PathBuf>,
    pub remote: Option<RemoteStoreConfig>,
}

impl ChainSettings {
    /// Read enable-flags and addressing from `env`.
    ///
    /// Enabling a backend without its required addressing is a configuration
    /// error.
    pub fn from_environment(env: &EnvironmentBackend) -> Result<Self> {
        let dotenv = flag(env, DOTENV_FLAG)?.then(|| {
            PathBuf::from(env.get(DOTENV_PATH).unwrap_or(DEFAULT_DOTENV_PATH))
        });

        let remote = if flag(env, REMOTE_FLAG)? {
            let addr = env.get(REMOTE_ADDR).ok_or_else(|| {
                Error::Configuration(format!("{REMOTE_FLAG} is set but {REMOTE_ADDR} is not"))
            })?;
            let token = env.get(REMOTE_TOKEN).ok_or_else(|| {
                Error::Configuration(format!("{REMOTE_FLAG} is set but {REMOTE_TOKEN} is not"))
            })?;
            let timeout = match env.get(REMOTE_TIMEOUT_SECS) {
                Some(raw) => Duration::from_secs(raw.trim().parse().map_err(|_| {
                    Error::Configuration(format!(
                        "{REMOTE_TIMEOUT_SECS} must be a whole number of seconds, got {raw:?}"
                    ))
                })?),
                None => DEFAULT_TIMEOUT,
            };
            let config = RemoteStoreConfig {
                addr: addr.to_owned(),
                token: Secret::from(token),
                mount: env.get(REMOTE_MOUNT).unwrap_or(DEFAULT_MOUNT).to_owned(),
                prefix: env.get(REMOTE_PREFIX).map(str::to_owned),
                timeout,
            };
            config.validate()?;
            Some(config)
        } else {
            None
        };

        Ok(Self { dotenv, remote })
    }
}

fn flag(env: &EnvironmentBackend, name: &str) -> Result<bool> {
    match env.get(name).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(Error::Configuration(format!(
                "{name} must be true/false, got {v:?}"
            ))),
        },
    }
}

/// Whether [`SecretChain::resolve_all`] stops at the first failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completeness {
    /// Fail fast: the first name that cannot be resolved is the error.
    Required,
    /// Resolve what can be resolved and report the rest.
    Partial,
}

/// Outcome of [`SecretChain::resolve_all`].
#[derive(Debug)]
pub struct Resolution {
    pub snapshot: SecretSnapshot,
    pub failures: Vec<Error>,
}

impl Resolution {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Escalate: every name in `required` must have resolved. Returns the
    /// original failure for the first required name that did not, so a
    /// backend outage is reported as such rather than as a missing secret.
    pub fn into_required<'a>(
        self,
        required: impl IntoIterator<Item = &'a str>,
    ) -> Result<SecretSnapshot> {
        let Resolution {
            snapshot,
            mut failures,
        } = self;
        for name in required {
            if snapshot.contains(name) {
                continue;
            }
            return Err(match failures.iter().position(|f| f.secret_name() == Some(name)) {
                Some(index) => failures.swap_remove(index),
                None => Error::MissingSecret(name.to_owned()),
            });
        }
        Ok(snapshot)
    }
}

#[derive(Debug)]
pub struct SecretChain {
    backends: Vec<Backend>,
}

impl SecretChain {
    /// Build a chain from explicit backends, ordered by precedence.
    pub fn new(mut backends: Vec<Backend>) -> Self {
        backends.sort_by_key(Backend::precedence);
        Self { backends }
    }

    /// Add a file that is read through the chain but owned elsewhere.
    pub fn with_read_only_file(mut self, file: DotenvBackend) -> Self {
        info!(path = %file.path().display(), "read-only secrets file added to chain");
        self.backends.push(Backend::ReadOnlyFile(file));
        self.backends.sort_by_key(Backend::precedence);
        self
    }

    /// Build the chain the process environment asks for.
    pub async fn from_process(defaults: Defaults) -> Result<Self> {
        Self::build(EnvironmentBackend::from_process(), defaults).await
    }

    /// Build from an environment snapshot: read the flags, load the dotenv
    /// file if enabled, connect the remote store if enabled.
    pub async fn build(env: EnvironmentBackend, defaults: Defaults) -> Result<Self> {
        let settings = ChainSettings::from_environment(&env)?;

        let mut backends = vec![Backend::Environment(env)];
        if let Some(path) = settings.dotenv {
            backends.push(Backend::DotenvFile(DotenvBackend::load(path).await?));
        }
        if let Some(remote) = settings.remote {
            info!(addr = %remote.addr, mount = %remote.mount, "remote secret store enabled");
            backends.push(Backend::Remote(RemoteStore::new(remote)?));
        }
        backends.push(Backend::Defaults(defaults));

        let chain = Self::new(backends);
        info!(
            backends = ?chain.sources().map(|s| s.as_str()).collect::<Vec<_>>(),
            "secret chain ready"
        );
        Ok(chain)
    }

    /// Backend sources in evaluation order.
    pub fn sources(&self) -> impl Iterator<Item = SecretSource> + '_ {
        self.backends.iter().map(Backend::source)
    }

    /// The dotenv backend, when enabled. This is the writable surface.
    pub fn dotenv(&self) -> Option<&DotenvBackend> {
        self.backends.iter().find_map(|b| match b {
            Backend::DotenvFile(file) => Some(file),
            _ => None,
        })
    }

    /// Resolve one name: first backend holding a value wins. A backend error
    /// stops resolution of this name; later backends are not consulted.
    pub async fn resolve(&self, name: &str) -> Result<SecretEntry> {
        for backend in &self.backends {
            let source = backend.source();
            match backend.try_resolve(name).await {
                Ok(Some(value)) => {
                    debug!(name, source = %source, "secret resolved");
                    return Ok(SecretEntry {
                        name: name.to_owned(),
                        value: Secret::new(value),
                        source,
                    });
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!(name, backend = %source, error = %e, "secret backend failed");
                    return Err(e);
                }
            }
        }
        Err(Error::MissingSecret(name.to_owned()))
    }

    /// Resolve every name once and freeze the results.
    ///
    /// Duplicate names are resolved once. In [`Completeness::Required`] mode
    /// the first failure is returned as the error.
    pub async fn resolve_all<'a>(
        &self,
        names: impl IntoIterator<Item = &'a str>,
        completeness: Completeness,
    ) -> Result<Resolution> {
        let mut entries: Vec<SecretEntry> = Vec::new();
        let mut failures = Vec::new();
        let mut seen: Vec<&str> = Vec::new();

        for name in names {
            if seen.contains(&name) {
                continue;
            }
            seen.push(name);

            match self.resolve(name).await {
                Ok(entry) => entries.push(entry),
                Err(e) if completeness == Completeness::Required => return Err(e),
                Err(e) => failures.push(e),
            }
        }

        info!(
            resolved = entries.len(),
            failed = failures.len(),
            "secrets resolved"
        );
        Ok(Resolution {
            snapshot: SecretSnapshot::new(entries),
            failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockStore, STORE_TOKEN};

    fn remote(addr: &str) -> Backend {
        Backend::Remote(
            RemoteStore::new(RemoteStoreConfig {
                addr: addr.into(),
                token: Secret::from(STORE_TOKEN),
                mount: DEFAULT_MOUNT.into(),
                prefix: None,
                timeout: Duration::from_secs(5),
            })
            .unwrap(),
        )
    }

    fn env(vars: &[(&str, &str)]) -> EnvironmentBackend {
        EnvironmentBackend::from_vars(vars.iter().copied())
    }

    #[tokio::test]
    async fn environment_beats_remote_store() {
        let mock = MockStore::start(vec![(
            "secret/data/TW_CLIENT_ID",
            200,
            r#"{"data":{"data":{"TW_CLIENT_ID":"from_store"}}}"#,
        )])
        .await;
        let chain = SecretChain::new(vec![
            remote(&mock.addr),
            Backend::Environment(env(&[("TW_CLIENT_ID", "from_env")])),
        ]);

        let entry = chain.resolve("TW_CLIENT_ID").await.unwrap();
        assert_eq!(entry.expose(), "from_env");
        assert_eq!(entry.source, SecretSource::Environment);
        assert_eq!(mock.hits(), 0);
    }

    #[tokio::test]
    async fn remote_store_beats_defaults() {
        let mock = MockStore::start(vec![(
            "secret/data/TW_REDIRECT_URI",
            200,
            r#"{"data":{"data":{"value":"http://127.0.0.1:8080/cb"}}}"#,
        )])
        .await;
        let chain = SecretChain::new(vec![
            Backend::Defaults(Defaults::new([("TW_REDIRECT_URI", "http://127.0.0.1:5000/callback")])),
            remote(&mock.addr),
            Backend::Environment(env(&[])),
        ]);

        let entry = chain.resolve("TW_REDIRECT_URI").await.unwrap();
        assert_eq!(entry.expose(), "http://127.0.0.1:8080/cb");
        assert_eq!(entry.source, SecretSource::SecretStore);
    }

    #[tokio::test]
    async fn falls_through_to_default() {
        let chain = SecretChain::new(vec![
            Backend::Environment(env(&[])),
            Backend::Defaults(Defaults::new([("TW_REDIRECT_URI", "http://127.0.0.1:5000/callback")])),
        ]);

        let entry = chain.resolve("TW_REDIRECT_URI").await.unwrap();
        assert_eq!(entry.source, SecretSource::Default);
    }

    #[tokio::test]
    async fn backend_error_fails_only_that_name() {
        let mock = MockStore::start(vec![
            ("secret/data/BROKEN", 500, "oops"),
            ("secret/data/OK", 200, r#"{"data":{"data":{"OK":"fine"}}}"#),
        ])
        .await;
        let chain = SecretChain::new(vec![
            Backend::Environment(env(&[])),
            remote(&mock.addr),
            Backend::Defaults(Defaults::new([("BROKEN", "fallback")])),
        ]);

        let resolution = chain
            .resolve_all(["BROKEN", "OK"], Completeness::Partial)
            .await
            .unwrap();

        assert_eq!(resolution.snapshot.value("OK"), Some("fine"));
        assert!(!resolution.snapshot.contains("BROKEN"));
        assert_eq!(resolution.failures.len(), 1);
        assert!(matches!(
            &resolution.failures[0],
            Error::SecretBackend { name, backend: SecretSource::SecretStore, .. } if name == "BROKEN"
        ));
    }

    #[tokio::test]
    async fn missing_required_secret_is_fatal() {
        let chain = SecretChain::new(vec![
            Backend::Environment(env(&[("TW_REDIRECT_URI", "http://127.0.0.1:5000/callback")])),
            Backend::Defaults(Defaults::default()),
        ]);

        let err = chain
            .resolve_all(["TW_REDIRECT_URI", "TW_CLIENT_ID"], Completeness::Required)
            .await
            .unwrap_err();

        match err {
            Error::MissingSecret(name) => assert_eq!(name, "TW_CLIENT_ID"),
            other => panic!("expected MissingSecret, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn partial_mode_collects_failures() {
        let chain = SecretChain::new(vec![Backend::Environment(env(&[("A", "1")]))]);

        let resolution = chain
            .resolve_all(["A", "B", "C", "A"], Completeness::Partial)
            .await
            .unwrap();

        assert!(!resolution.is_complete());
        assert_eq!(resolution.snapshot.len(), 1);
        let failed: Vec<_> = resolution
            .failures
            .iter()
            .filter_map(Error::secret_name)
            .collect();
        assert_eq!(failed, vec!["B", "C"]);
    }

    #[tokio::test]
    async fn into_required_keeps_backend_error() {
        let mock = MockStore::start(vec![("secret/data/TW_CLIENT_ID", 503, "")]).await;
        let chain = SecretChain::new(vec![Backend::Environment(env(&[("X", "1")])), remote(&mock.addr)]);

        let resolution = chain
            .resolve_all(["X", "TW_CLIENT_ID", "OTHER"], Completeness::Partial)
            .await
            .unwrap();

        let err = resolution.into_required(["X", "TW_CLIENT_ID"]).unwrap_err();
        assert!(matches!(err, Error::SecretBackend { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn into_required_ignores_optional_failures() {
        let chain = SecretChain::new(vec![Backend::Environment(env(&[("X", "1")]))]);
        let resolution = chain
            .resolve_all(["X", "OPTIONAL"], Completeness::Partial)
            .await
            .unwrap();

        let snapshot = resolution.into_required(["X"]).unwrap();
        assert_eq!(snapshot.value("X"), Some("1"));
    }

    #[tokio::test]
    async fn resolution_is_deterministic() {
        let chain = SecretChain::new(vec![Backend::Environment(env(&[("TW_CLIENT_ID", "abc123")]))]);
        let resolution = chain
            .resolve_all(["TW_CLIENT_ID"], Completeness::Required)
            .await
            .unwrap();

        let first = resolution.snapshot.resolve("TW_CLIENT_ID").unwrap().clone();
        let second = resolution.snapshot.resolve("TW_CLIENT_ID").unwrap();
        assert_eq!(&first, second);
    }

    #[test]
    fn backends_are_sorted_by_precedence() {
        let chain = SecretChain::new(vec![
            Backend::Defaults(Defaults::default()),
            Backend::Environment(env(&[])),
        ]);
        assert_eq!(
            chain.sources().collect::<Vec<_>>(),
            vec![SecretSource::Environment, SecretSource::Default]
        );
    }

    #[tokio::test]
    async fn read_only_file_sits_between_dotenv_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let dotenv = dir.path().join(".env");
        let tokens = dir.path().join("oauth_tokens.env");
        tokio::fs::write(&dotenv, "SHARED=from_dotenv\n").await.unwrap();
        tokio::fs::write(&tokens, "SHARED=from_tokens\nOAUTH2_USER_ACCESS_TOKEN=at_1\n")
            .await
            .unwrap();

        let chain = SecretChain::new(vec![
            Backend::Defaults(Defaults::new([("OAUTH2_USER_ACCESS_TOKEN", "at_default")])),
            Backend::Environment(env(&[])),
        ])
        .with_read_only_file(DotenvBackend::load_if_present(&tokens).await.unwrap());
        let chain = SecretChain::new(
            chain
                .backends
                .into_iter()
                .chain([Backend::DotenvFile(DotenvBackend::load(&dotenv).await.unwrap())])
                .collect(),
        );

        assert_eq!(
            chain.sources().collect::<Vec<_>>(),
            vec![
                SecretSource::Environment,
                SecretSource::File,
                SecretSource::File,
                SecretSource::Default
            ]
        );

        assert_eq!(chain.resolve("SHARED").await.unwrap().expose(), "from_dotenv");
        assert_eq!(chain.resolve("OAUTH2_USER_ACCESS_TOKEN").await.unwrap().expose(), "at_1");
        assert_eq!(chain.dotenv().unwrap().path(), dotenv.as_path());
    }

    #[test]
    fn settings_default_to_environment_only() {
        let settings = ChainSettings::from_environment(&env(&[])).unwrap();
        assert!(settings.dotenv.is_none());
        assert!(settings.remote.is_none());
    }

    #[test]
    fn settings_read_dotenv_flag() {
        let settings = ChainSettings::from_environment(&env(&[(DOTENV_FLAG, "true")])).unwrap();
        assert_eq!(settings.dotenv, Some(PathBuf::from(".env")));

        let settings = ChainSettings::from_environment(&env(&[
            (DOTENV_FLAG, "YES"),
            (DOTENV_PATH, "/etc/bot/secrets.env"),
        ]))
        .unwrap();
        assert_eq!(settings.dotenv, Some(PathBuf::from("/etc/bot/secrets.env")));

        let settings = ChainSettings::from_environment(&env(&[(DOTENV_FLAG, "0")])).unwrap();
        assert!(settings.dotenv.is_none());
    }

    #[test]
    fn settings_reject_bad_flag_value() {
        assert!(matches!(
            ChainSettings::from_environment(&env(&[(REMOTE_FLAG, "maybe")])),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn remote_flag_requires_addressing() {
        let err = ChainSettings::from_environment(&env(&[(REMOTE_FLAG, "1")])).unwrap_err();
        assert!(err.to_string().contains(REMOTE_ADDR));

        let err = ChainSettings::from_environment(&env(&[
            (REMOTE_FLAG, "1"),
            (REMOTE_ADDR, "http://127.0.0.1:8200"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains(REMOTE_TOKEN));
    }

    #[test]
    fn remote_settings_are_read() {
        let settings = ChainSettings::from_environment(&env(&[
            (REMOTE_FLAG, "true"),
            (REMOTE_ADDR, "http://127.0.0.1:8200"),
            (REMOTE_TOKEN, "tok"),
            (REMOTE_MOUNT, "kv"),
            (REMOTE_PREFIX, "bots/prod"),
            (REMOTE_TIMEOUT_SECS, "3"),
        ]))
        .unwrap();
        let remote = settings.remote.unwrap();
        assert_eq!(remote.mount, "kv");
        assert_eq!(remote.prefix.as_deref(), Some("bots/prod"));
        assert_eq!(remote.timeout, Duration::from_secs(3));
        assert_eq!(remote.token.expose(), "tok");
    }

    #[tokio::test]
    async fn build_loads_enabled_dotenv_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.env");
        tokio::fs::write(&path, "TW_CLIENT_ID=from_file\nTW_CODE_VERIFIER=v\n")
            .await
            .unwrap();
        let path_str = path.to_str().unwrap();

        let chain = SecretChain::build(
            env(&[(DOTENV_FLAG, "1"), (DOTENV_PATH, path_str), ("TW_CLIENT_ID", "from_env")]),
            Defaults::default(),
        )
        .await
        .unwrap();

        assert!(chain.dotenv().is_some());
        assert_eq!(chain.resolve("TW_CLIENT_ID").await.unwrap().source, SecretSource::Environment);
        let verifier = chain.resolve("TW_CODE_VERIFIER").await.unwrap();
        assert_eq!(verifier.source, SecretSource::File);
    }

    #[tokio::test]
    async fn disabled_dotenv_file_is_not_consulted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.env");
        tokio::fs::write(&path, "TW_CLIENT_ID=from_file\n").await.unwrap();

        let chain = SecretChain::build(
            env(&[(DOTENV_PATH, path.to_str().unwrap())]),
            Defaults::default(),
        )
        .await
        .unwrap();

        assert!(chain.dotenv().is_none());
        assert!(matches!(
            chain.resolve("TW_CLIENT_ID").await,
            Err(Error::MissingSecret(_))
        ));
    }

    #[tokio::test]
    async fn snapshot_ignores_later_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.env");
        tokio::fs::write(&path, "TW_OAUTH_STATE=first\n").await.unwrap();
        let chain = SecretChain::build(
            env(&[(DOTENV_FLAG, "1"), (DOTENV_PATH, path.to_str().unwrap())]),
            Defaults::default(),
        )
        .await
        .unwrap();
        let resolution = chain
            .resolve_all(["TW_OAUTH_STATE"], Completeness::Required)
            .await
            .unwrap();

        chain
            .dotenv()
            .unwrap()
            .persist(&[("TW_OAUTH_STATE", "second")])
            .await
            .unwrap();

        assert_eq!(resolution.snapshot.value("TW_OAUTH_STATE"), Some("first"));
        let on_disk = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(on_disk.contains("TW_OAUTH_STATE=second"));
    }
}
