//! OAuth 2.0 user-context authorization for the bot
//!
//! Implements the authorization-code grant with PKCE against the provider,
//! token refresh, and persistence of the resulting tokens. Standalone library:
//! the `bot-auth` binary wires it to configuration and secrets.
//!
//! Flow:
//! 1. `pkce::generate()` yields the verifier, state and browser URL
//! 2. The operator authorizes in a browser
//! 3. `callback::CallbackListener` receives the redirect, validates it and
//!    calls `token::TokenExchanger::exchange_code()` exactly once
//! 4. Tokens are written via `token_file::TokenFile::save()`
//! 5. Later runs call `TokenExchanger::refresh()` before the access token expires

pub mod callback;
pub mod constants;
pub mod error;
pub mod pkce;
pub mod token;
pub mod token_file;

#[cfg(test)]
pub(crate) mod testing;

pub use callback::{CallbackListener, ListenerOptions, PendingAuthorization};
pub use error::{Error, Result};
pub use pkce::{Authorization, AuthorizationRequest, ClientConfig, PkceChallenge, PkceVerifier, generate};
pub use token::{TokenExchanger, TokenSet, parse_token_response};
pub use token_file::TokenFile;
