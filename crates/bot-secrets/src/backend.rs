//! Secret backends
//!
//! Every backend answers the same question: does it hold a value for `name`?
//! `Ok(None)` means "not here, ask the next one"; `Err` means the backend
//! could not answer and resolution of that name stops.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::remote::RemoteStore;
use crate::snapshot::SecretSource;

#[derive(Debug)]
pub enum Backend {
    Environment(EnvironmentBackend),
    DotenvFile(DotenvBackend),
    /// A file some other component owns and rewrites, e.g. the token file.
    /// Consulted after the dotenv file and never written through the chain.
    ReadOnlyFile(DotenvBackend),
    Remote(RemoteStore),
    Defaults(Defaults),
}

impl Backend {
    pub fn source(&self) -> SecretSource {
        match self {
            Backend::Environment(_) => SecretSource::Environment,
            Backend::DotenvFile(_) | Backend::ReadOnlyFile(_) => SecretSource::File,
            Backend::Remote(_) => SecretSource::SecretStore,
            Backend::Defaults(_) => SecretSource::Default,
        }
    }

    /// Position in the chain; lower is consulted first.
    pub fn precedence(&self) -> u8 {
        match self {
            Backend::Environment(_) => 0,
            Backend::DotenvFile(_) => 1,
            Backend::ReadOnlyFile(_) => 2,
            Backend::Remote(_) => 3,
            Backend::Defaults(_) => 4,
        }
    }

    pub async fn try_resolve(&self, name: &str) -> Result<Option<String>> {
        match self {
            Backend::Environment(env) => Ok(env.get(name).map(str::to_owned)),
            Backend::DotenvFile(file) | Backend::ReadOnlyFile(file) => {
                Ok(file.get(name).map(str::to_owned))
            }
            Backend::Remote(store) => store.fetch(name).await,
            Backend::Defaults(defaults) => Ok(defaults.get(name).map(str::to_owned)),
        }
    }
}

/// Copy of the process environment taken at construction.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentBackend {
    vars: HashMap<String, String>,
}

impl EnvironmentBackend {
    /// Snapshot the current process environment. Variables whose name or
    /// value is not valid UTF-8 are skipped.
    pub fn from_process() -> Self {
        Self::from_vars(
            std::env::vars_os()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?))),
        )
    }

    pub fn from_vars<K, V>(vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: vars
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Value of `name`; empty values count as unset.
    pub fn get(&self, name: &str) -> Option<&str> {
        non_empty(self.vars.get(name))
    }
}

/// Local development file, read once at load.
#[derive(Debug, Clone)]
pub struct DotenvBackend {
    path: PathBuf,
    values: HashMap<String, String>,
}

impl DotenvBackend {
    /// Read `path`. A missing file yields an empty backend so that the first
    /// `persist` can create it.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        Self::read(path.into(), true).await
    }

    /// Like [`load`](Self::load), for files that legitimately do not exist
    /// yet (the token file before the first login).
    pub async fn load_if_present(path: impl Into<PathBuf>) -> Result<Self> {
        Self::read(path.into(), false).await
    }

    async fn read(path: PathBuf, warn_missing: bool) -> Result<Self> {
        let values = match tokio::fs::try_exists(&path).await {
            Ok(true) => common::envfile::read_map(&path).await?,
            Ok(false) => {
                if warn_missing {
                    warn!(path = %path.display(), "dotenv file does not exist, continuing without it");
                } else {
                    debug!(path = %path.display(), "file does not exist yet");
                }
                HashMap::new()
            }
            Err(e) => {
                return Err(Error::Io(format!("checking {}: {e}", path.display())));
            }
        };
        info!(path = %path.display(), keys = values.len(), "secrets file loaded");
        Ok(Self { path, values })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        non_empty(self.values.get(name))
    }

    /// Upsert keys in the file on disk, keeping comments and unrelated lines.
    ///
    /// Takes `&self`: values already loaded, and any snapshot built from them,
    /// are left as they were.
    pub async fn persist(&self, pairs: &[(&str, &str)]) -> Result<()> {
        common::envfile::upsert(&self.path, pairs).await?;
        debug!(
            path = %self.path.display(),
            keys = ?pairs.iter().map(|(k, _)| *k).collect::<Vec<_>>(),
            "dotenv file updated"
        );
        Ok(())
    }
}

/// Compiled-in fallbacks.
#[derive(Debug, Clone, Default)]
pub struct Defaults {
    values: HashMap<String, String>,
}

impl Defaults {
    pub fn new<K, V>(values: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: values
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).filter(|v| !v.trim().is_empty())
}
