//! OAuth defaults for the bot account
//!
//! Endpoint and scope defaults for the X (Twitter) OAuth 2.0 user-context
//! flow. None of these are secrets; the client id, verifier and tokens are
//! resolved at runtime.

/// Authorization endpoint the operator's browser visits
pub const AUTHORIZE_ENDPOINT: &str = "https://twitter.com/i/oauth2/authorize";

/// Token endpoint for code exchange and token refresh
pub const TOKEN_ENDPOINT: &str = "https://api.twitter.com/2/oauth2/token";

/// Redirect URI used when none is configured. Must match the app registration.
pub const DEFAULT_REDIRECT_URI: &str = "http://127.0.0.1:5000/callback";

/// Scopes needed to read and post as the bot. `offline.access` is what makes
/// the provider issue a refresh token.
pub const SCOPES: &[&str] = &["tweet.read", "tweet.write", "users.read", "offline.access"];

/// Only challenge method this crate produces.
pub const CODE_CHALLENGE_METHOD: &str = "S256";

/// Default path the callback listener answers on.
pub const DEFAULT_CALLBACK_PATH: &str = "/callback";

/// Keys written to the persisted token file.
pub mod token_keys {
    pub const ACCESS_TOKEN: &str = "OAUTH2_USER_ACCESS_TOKEN";
    pub const REFRESH_TOKEN: &str = "OAUTH2_USER_REFRESH_TOKEN";
    pub const EXPIRES_IN: &str = "OAUTH2_TOKEN_EXPIRES_IN";
    pub const SCOPE: &str = "OAUTH2_SCOPE";
    pub const TOKEN_TYPE: &str = "OAUTH2_TOKEN_TYPE";
    pub const EXPIRES_AT: &str = "OAUTH2_TOKEN_EXPIRES_AT";
}
