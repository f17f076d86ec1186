//! OAuth token exchange and refresh
//!
//! Handles the two token endpoint interactions:
//! 1. Authorization code exchange (completes the PKCE flow)
//! 2. Refresh token exchange (keeps the bot's access token alive)
//!
//! Both POST a form to the token endpoint. Failures are never retried here:
//! an authorization code is single-use, so a second attempt with the same code
//! fails by protocol design, and a rejected refresh token needs a fresh
//! authorization by the operator.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::Secret;
use serde::Deserialize;
use serde_json::error::Category;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::pkce::PkceVerifier;

/// Provider error bodies are truncated to this many characters.
const MAX_ERROR_BODY: usize = 512;

/// Credentials returned by the token endpoint.
///
/// Always holds a non-empty access token and a positive lifetime; anything
/// less is rejected at parse time.
#[derive(Debug, Clone)]
pub struct TokenSet {
    pub access_token: Secret<String>,
    pub token_type: String,
    /// Seconds the access token was valid for when issued (delta, not absolute)
    pub expires_in: u64,
    pub refresh_token: Option<Secret<String>>,
    pub scope: String,
    /// Unix seconds at which the response was received
    pub obtained_at: u64,
}

impl TokenSet {
    /// Absolute expiry as unix seconds.
    pub fn expires_at(&self) -> u64 {
        self.obtained_at.saturating_add(self.expires_in)
    }

    /// Whether the access token expires within `threshold` of now.
    pub fn is_expiring_within(&self, threshold: Duration) -> bool {
        unix_now().saturating_add(threshold.as_secs()) >= self.expires_at()
    }

    pub fn is_expired(&self) -> bool {
        self.is_expiring_within(Duration::ZERO)
    }

    /// Fold a refresh response into the set it replaces.
    ///
    /// Providers may or may not rotate the refresh token. A response without
    /// one keeps the previous token; a response with one replaces it.
    pub fn merge_refresh(mut self, previous: &TokenSet) -> TokenSet {
        if self.refresh_token.is_none() {
            self.refresh_token = previous.refresh_token.clone();
        }
        if self.scope.is_empty() {
            self.scope = previous.scope.clone();
        }
        self
    }
}

/// Wire shape of a token endpoint response. Every field is optional so that
/// a malformed body is reported as a `TokenExchange` error rather than a
/// decode failure.
#[derive(Deserialize)]
struct RawTokenResponse {
    access_token: Option<String>,
    token_type: Option<String>,
    expires_in: Option<u64>,
    refresh_token: Option<String>,
    scope: Option<String>,
}

/// OAuth error body (`{"error": "...", "error_description": "..."}`).
#[derive(Deserialize)]
struct ErrorResponse {
    error: Option<String>,
}

/// Parse a 2xx token endpoint body into a validated `TokenSet`.
///
/// The raw body is never echoed into the error since it may carry tokens.
pub fn parse_token_response(status: u16, body: &str) -> Result<TokenSet> {
    let malformed = |reason: &str| Error::TokenExchange {
        status,
        error: None,
        body: format!("malformed token response: {reason}"),
    };

    let raw: RawTokenResponse =
        serde_json::from_str(body).map_err(|e| malformed(decode_failure(&e)))?;

    let access_token = raw
        .access_token
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| malformed("missing access_token"))?;
    let token_type = raw
        .token_type
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| malformed("missing token_type"))?;
    let expires_in = raw
        .expires_in
        .ok_or_else(|| malformed("missing expires_in"))?;
    if expires_in == 0 {
        return Err(malformed("expires_in must be positive"));
    }

    Ok(TokenSet {
        access_token: Secret::new(access_token),
        token_type,
        expires_in,
        refresh_token: raw
            .refresh_token
            .filter(|t| !t.trim().is_empty())
            .map(Secret::new),
        scope: raw.scope.unwrap_or_default(),
        obtained_at: unix_now(),
    })
}

/// Describe a decode failure by category and position only. serde's own
/// message can quote the offending value.
fn decode_failure(e: &serde_json::Error) -> &'static str {
    match e.classify() {
        Category::Data => "a field has the wrong type",
        Category::Syntax => "not JSON",
        Category::Eof => "truncated JSON",
        Category::Io => "unreadable body",
    }
}

/// Build a `TokenExchange` error from a non-2xx response.
fn rejection(status: u16, body: &str) -> Error {
    let error = serde_json::from_str::<ErrorResponse>(body)
        .ok()
        .and_then(|e| e.error);
    Error::TokenExchange {
        status,
        error,
        body: body.chars().take(MAX_ERROR_BODY).collect(),
    }
}

/// Client for the provider's token endpoint.
#[derive(Debug, Clone)]
pub struct TokenExchanger {
    http: reqwest::Client,
    token_endpoint: String,
    client_secret: Option<Secret<String>>,
}

impl TokenExchanger {
    pub fn new(http: reqwest::Client, token_endpoint: impl Into<String>) -> Self {
        Self {
            http,
            token_endpoint: token_endpoint.into(),
            client_secret: None,
        }
    }

    /// Authenticate with HTTP Basic (`client_id:client_secret`), as
    /// confidential clients must. Public PKCE clients leave this unset.
    pub fn with_client_secret(mut self, secret: Option<Secret<String>>) -> Self {
        self.client_secret = secret.filter(|s| !s.is_blank());
        self
    }

    pub fn token_endpoint(&self) -> &str {
        &self.token_endpoint
    }

    /// Exchange an authorization code for tokens.
    ///
    /// The verifier must be the one whose challenge went out in the
    /// authorization URL.
    pub async fn exchange_code(
        &self,
        code: &str,
        verifier: &PkceVerifier,
        client_id: &str,
        redirect_uri: &str,
    ) -> Result<TokenSet> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", client_id),
            ("code_verifier", verifier.expose()),
        ];
        let tokens = self.post(&form, client_id, "authorization_code").await?;
        info!(
            token_type = %tokens.token_type,
            expires_in = tokens.expires_in,
            has_refresh_token = tokens.refresh_token.is_some(),
            "authorization code exchanged"
        );
        Ok(tokens)
    }

    /// Exchange a refresh token for a new access token.
    ///
    /// A rejected refresh token (revoked, expired, already rotated) surfaces
    /// as `TokenExchange`; recovery is a full re-authorization.
    pub async fn refresh(&self, refresh_token: &Secret<String>, client_id: &str) -> Result<TokenSet> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.expose().as_str()),
            ("client_id", client_id),
        ];
        let tokens = self.post(&form, client_id, "refresh_token").await?;
        info!(
            expires_in = tokens.expires_in,
            rotated = tokens.refresh_token.is_some(),
            "access token refreshed"
        );
        Ok(tokens)
    }

    async fn post(&self, form: &[(&str, &str)], client_id: &str, grant: &str) -> Result<TokenSet> {
        debug!(endpoint = %self.token_endpoint, grant, "calling token endpoint");

        let mut request = self.http.post(&self.token_endpoint).form(form);
        if let Some(secret) = &self.client_secret {
            request = request.basic_auth(client_id, Some(secret.expose()));
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Http(format!("token endpoint request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Http(format!("reading token response failed: {e}")))?;

        if !status.is_success() {
            let err = rejection(status.as_u16(), &body);
            warn!(
                grant,
                status = status.as_u16(),
                error = err.provider_error().unwrap_or("<none>"),
                "token endpoint rejected request"
            );
            return Err(err);
        }

        parse_token_response(status.as_u16(), &body)
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
