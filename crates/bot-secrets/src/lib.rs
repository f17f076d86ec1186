//! Layered secret resolution
//!
//! Each credential name is resolved through an ordered chain of backends,
//! first match wins:
//!
//! 1. process environment (snapshotted at construction)
//! 2. dotenv file, only when `SECRETS_DOTENV` enables it
//! 3. remote HTTP secret store, only when `SECRETS_REMOTE` enables it
//! 4. compiled-in defaults
//!
//! Resolution happens once at startup via [`SecretChain::resolve_all`]; the
//! resulting [`SecretSnapshot`] is immutable and passed to whatever needs it.
//! A rotated upstream secret takes effect on the next process start.

pub mod backend;
pub mod chain;
mod error;
pub mod remote;
pub mod snapshot;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{Backend, Defaults, DotenvBackend, EnvironmentBackend};
pub use chain::{ChainSettings, Completeness, Resolution, SecretChain};
pub use error::{Error, Result};
pub use remote::{RemoteStore, RemoteStoreConfig};
pub use snapshot::{SecretEntry, SecretSnapshot, SecretSource};
