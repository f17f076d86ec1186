//! Resolved secrets, frozen for the process lifetime

use std::collections::BTreeMap;
use std::fmt;

use common::Secret;

use crate::error::{Error, Result};

/// Backend a value was resolved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SecretSource {
    Environment,
    File,
    SecretStore,
    Default,
}

impl SecretSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretSource::Environment => "environment",
            SecretSource::File => "file",
            SecretSource::SecretStore => "secret-store",
            SecretSource::Default => "default",
        }
    }
}

impl fmt::Display for SecretSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One resolved credential. `Debug` never prints the value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretEntry {
    pub name: String,
    pub value: Secret<String>,
    pub source: SecretSource,
}

impl SecretEntry {
    pub fn expose(&self) -> &str {
        self.value.expose()
    }
}

/// Immutable name -> entry map built once by [`crate::SecretChain::resolve_all`].
#[derive(Debug, Clone, Default)]
pub struct SecretSnapshot {
    entries: BTreeMap<String, SecretEntry>,
}

impl SecretSnapshot {
    pub fn new(entries: impl IntoIterator<Item = SecretEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|entry| (entry.name.clone(), entry))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&SecretEntry> {
        self.entries.get(name)
    }

    /// The cached entry for `name`. Repeated calls return the same entry.
    pub fn resolve(&self, name: &str) -> Result<&SecretEntry> {
        self.get(name)
            .ok_or_else(|| Error::MissingSecret(name.to_owned()))
    }

    /// Exposed value of `name`, or `None` when it did not resolve.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.get(name).map(SecretEntry::expose)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Check that every name resolved. Fails on the first absent name, in
    /// the order given.
    pub fn require<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Result<()> {
        match names.into_iter().find(|name| !self.contains(name)) {
            Some(missing) => Err(Error::MissingSecret(missing.to_owned())),
            None => Ok(()),
        }
    }

    /// `(name, source)` pairs in name order, for diagnostics.
    pub fn sources(&self) -> impl Iterator<Item = (&str, SecretSource)> {
        self.entries
            .values()
            .map(|entry| (entry.name.as_str(), entry.source))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
