//! Shared types for the bot credential tooling

pub mod envfile;
mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
