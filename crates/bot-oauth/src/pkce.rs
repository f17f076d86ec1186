//! PKCE (Proof Key for Code Exchange) per RFC 7636
//!
//! Generates the code verifier, its S256 challenge, a fresh anti-CSRF state
//! and the authorization URL the operator opens in a browser. Nothing here is
//! persisted: storing the verifier and state until the callback arrives is
//! the caller's job (the `authorize` command writes them to the dotenv file).

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use common::Secret;
use rand::RngExt;
use sha2::{Digest, Sha256};
use url::Url;

use crate::constants::CODE_CHALLENGE_METHOD;
use crate::error::{Error, Result};

/// RFC 7636 bounds on the verifier length, in characters.
pub const VERIFIER_MIN_LEN: usize = 43;
pub const VERIFIER_MAX_LEN: usize = 128;

/// 64 random bytes encode to 86 base64url characters.
const VERIFIER_BYTES: usize = 64;

/// 16 random bytes encode to a 22 character state token.
const STATE_BYTES: usize = 16;

/// High-entropy secret bound to one authorization attempt.
///
/// Never reuse a verifier across two authorization codes: each call to
/// [`generate`] produces a new one.
#[derive(Clone, PartialEq, Eq)]
pub struct PkceVerifier(Secret<String>);

impl PkceVerifier {
    /// Generate a new random verifier.
    pub fn generate() -> Self {
        Self(Secret::new(random_token(VERIFIER_BYTES)))
    }

    /// Wrap a verifier loaded from storage, checking length and alphabet.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        let len = value.len();
        if !(VERIFIER_MIN_LEN..=VERIFIER_MAX_LEN).contains(&len) {
            return Err(Error::Configuration(format!(
                "code verifier must be {VERIFIER_MIN_LEN}-{VERIFIER_MAX_LEN} characters, got {len}"
            )));
        }
        if !value.chars().all(is_unreserved) {
            return Err(Error::Configuration(
                "code verifier contains characters outside the unreserved URL alphabet".into(),
            ));
        }
        Ok(Self(Secret::new(value.to_owned())))
    }

    /// The raw verifier, for the token request and for persisting.
    pub fn expose(&self) -> &str {
        self.0.expose()
    }

    /// Derive the S256 challenge for this verifier.
    pub fn challenge(&self) -> PkceChallenge {
        PkceChallenge::from_verifier(self.expose())
    }
}

impl fmt::Debug for PkceVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PkceVerifier").field(&self.0).finish()
    }
}

/// `BASE64URL(SHA256(verifier))`, no padding. Safe to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkceChallenge(String);

impl PkceChallenge {
    pub fn from_verifier(verifier: &str) -> Self {
        let hash = Sha256::digest(verifier.as_bytes());
        Self(URL_SAFE_NO_PAD.encode(hash))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PkceChallenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Static inputs to an authorization attempt.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub client_id: String,
    pub redirect_uri: String,
    pub authorize_endpoint: String,
    pub scopes: Vec<String>,
}

impl ClientConfig {
    /// Fail fast on missing or malformed static configuration.
    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(Error::Configuration("client_id is empty".into()));
        }
        if self.redirect_uri.trim().is_empty() {
            return Err(Error::Configuration("redirect_uri is empty".into()));
        }
        Url::parse(&self.redirect_uri)
            .map_err(|e| Error::Configuration(format!("redirect_uri is not a valid URL: {e}")))?;
        Url::parse(&self.authorize_endpoint).map_err(|e| {
            Error::Configuration(format!("authorize_endpoint is not a valid URL: {e}"))
        })?;
        Ok(())
    }
}

/// One authorization attempt as sent to the provider.
///
/// `state` is independent of the verifier; the callback listener compares the
/// value round-tripped through the browser against it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    pub client_id: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub state: String,
    pub challenge: PkceChallenge,
}

impl AuthorizationRequest {
    /// Compose the browser URL for this request.
    pub fn authorization_url(&self, authorize_endpoint: &str) -> Result<Url> {
        let mut url = Url::parse(authorize_endpoint).map_err(|e| {
            Error::Configuration(format!("authorize_endpoint is not a valid URL: {e}"))
        })?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("scope", &self.scopes.join(" "))
            .append_pair("state", &self.state)
            .append_pair("code_challenge", self.challenge.as_str())
            .append_pair("code_challenge_method", CODE_CHALLENGE_METHOD);
        Ok(url)
    }
}

/// Output of [`generate`]: everything needed to send the operator to the
/// provider and later complete the exchange.
#[derive(Debug, Clone)]
pub struct Authorization {
    pub verifier: PkceVerifier,
    pub request: AuthorizationRequest,
    pub url: Url,
}

/// Generate a verifier/challenge pair and the authorization URL.
pub fn generate(config: &ClientConfig) -> Result<Authorization> {
    config.validate()?;

    let verifier = PkceVerifier::generate();
    let request = AuthorizationRequest {
        client_id: config.client_id.trim().to_owned(),
        redirect_uri: config.redirect_uri.trim().to_owned(),
        scopes: dedup_scopes(&config.scopes),
        state: generate_state(),
        challenge: verifier.challenge(),
    };
    let url = request.authorization_url(&config.authorize_endpoint)?;

    Ok(Authorization {
        verifier,
        request,
        url,
    })
}

/// Fresh random anti-CSRF state token.
pub fn generate_state() -> String {
    random_token(STATE_BYTES)
}

fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rng().fill(bytes.as_mut_slice());
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Scopes are an ordered set: first occurrence wins, blanks are dropped.
fn dedup_scopes(scopes: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(scopes.len());
    for scope in scopes.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
        if !out.iter().any(|s| s == scope) {
            out.push(scope.to_owned());
        }
    }
    out
}

/// RFC 3986 unreserved characters.
fn is_unreserved(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~')
}
