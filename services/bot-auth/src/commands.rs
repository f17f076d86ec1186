//! Operator commands
//!
//! Each command resolves only the secrets it needs, once, into an immutable
//! snapshot, then drives the bot-oauth primitives.

use std::time::Duration;

use anyhow::{Context as _, Result, anyhow, bail};
use bot_oauth::{
    AuthorizationRequest, CallbackListener, ClientConfig, ListenerOptions, PendingAuthorization,
    PkceVerifier, TokenExchanger, TokenFile, TokenSet,
};
use bot_secrets::{Completeness, SecretChain, SecretSnapshot};
use tracing::{info, warn};

use crate::config::{Config, keys};

/// Everything a command needs, built once at startup.
pub struct Context {
    pub config: Config,
    pub chain: SecretChain,
    pub http: reqwest::Client,
}

impl Context {
    /// Resolve `required` and `optional` names in one pass.
    ///
    /// Optional names that fail because a backend errored are logged; plain
    /// absence is not.
    async fn secrets(&self, required: &[&str], optional: &[&str]) -> Result<SecretSnapshot> {
        let resolution = self
            .chain
            .resolve_all(required.iter().chain(optional).copied(), Completeness::Partial)
            .await?;
        for failure in &resolution.failures {
            let name = failure.secret_name().unwrap_or_default();
            if optional.contains(&name) && !matches!(failure, bot_secrets::Error::MissingSecret(_)) {
                warn!(name, error = %failure, "optional secret unavailable");
            }
        }
        Ok(resolution.into_required(required.iter().copied())?)
    }

    fn exchanger(&self, secrets: &SecretSnapshot) -> TokenExchanger {
        TokenExchanger::new(self.http.clone(), &self.config.oauth.token_endpoint)
            .with_client_secret(secrets.get(keys::CLIENT_SECRET).map(|e| e.value.clone()))
    }

    fn token_file(&self) -> TokenFile {
        TokenFile::new(&self.config.storage.token_file)
    }

    fn client_config(&self, secrets: &SecretSnapshot) -> Result<ClientConfig> {
        Ok(ClientConfig {
            client_id: secrets.resolve(keys::CLIENT_ID)?.expose().to_owned(),
            redirect_uri: secrets.resolve(keys::REDIRECT_URI)?.expose().to_owned(),
            authorize_endpoint: self.config.oauth.authorize_endpoint.clone(),
            scopes: self.config.oauth.scopes.clone(),
        })
    }

    /// Listener options for `redirect_uri`, checked against the configured path.
    fn listener_options(&self, redirect_uri: &str) -> Result<ListenerOptions> {
        let options = ListenerOptions::from_redirect_uri(redirect_uri, self.config.callback.timeout())?
            .with_exchange_timeout(self.config.oauth.request_timeout());
        if options.path != self.config.callback.path {
            bail!(
                "redirect URI path {} does not match configured callback path {}",
                options.path,
                self.config.callback.path
            );
        }
        Ok(options)
    }

    async fn bind_listener(
        &self,
        secrets: &SecretSnapshot,
        pending: PendingAuthorization,
    ) -> Result<CallbackListener> {
        let options = self.listener_options(&pending.request.redirect_uri)?;
        let listener = CallbackListener::bind(options, pending, self.exchanger(secrets), self.token_file())
            .await
            .context("failed to start callback listener")?;
        Ok(listener)
    }
}

/// Generate a PKCE pair and print the authorization URL.
pub async fn authorize(ctx: &Context, no_persist: bool) -> Result<()> {
    let secrets = ctx.secrets(&[keys::CLIENT_ID, keys::REDIRECT_URI], &[]).await?;
    let auth = bot_oauth::generate(&ctx.client_config(&secrets)?)?;

    if no_persist {
        println!("code_verifier (store as {}):\n{}\n", keys::CODE_VERIFIER, auth.verifier.expose());
        println!("state (store as {}):\n{}\n", keys::OAUTH_STATE, auth.request.state);
    } else {
        let dotenv = ctx.chain.dotenv().ok_or_else(|| {
            anyhow!("saving the verifier needs the dotenv backend: set SECRETS_DOTENV=1 or pass --no-persist")
        })?;
        dotenv
            .persist(&[
                (keys::CODE_VERIFIER, auth.verifier.expose()),
                (keys::OAUTH_STATE, auth.request.state.as_str()),
            ])
            .await
            .context("failed to save verifier and state")?;
        info!(path = %dotenv.path().display(), "verifier and state saved");
    }

    println!("Open this URL in a browser signed in as the bot account:\n\n{}\n", auth.url);
    println!("Then run `bot-auth callback` to receive the redirect.");
    Ok(())
}

/// Receive the redirect for a previously generated authorization URL.
pub async fn callback(ctx: &Context) -> Result<()> {
    let secrets = ctx
        .secrets(
            &[keys::CLIENT_ID, keys::REDIRECT_URI, keys::CODE_VERIFIER, keys::OAUTH_STATE],
            &[keys::CLIENT_SECRET],
        )
        .await?;
    let pending = stored_authorization(ctx, &secrets)?;

    let listener = ctx.bind_listener(&secrets, pending).await?;
    let outcome = listener.run().await;

    // A timeout without any callback leaves the attempt usable; anything
    // else has spent it.
    if !matches!(outcome, Err(bot_oauth::Error::Timeout(_))) {
        if let Err(e) = consume_stored_authorization(ctx).await {
            if outcome.is_ok() {
                return Err(e);
            }
            warn!(error = %format!("{e:#}"), "failed to clear stored authorization");
        }
    }

    report(ctx, outcome?);
    Ok(())
}

/// Blank the stored verifier and state so the attempt cannot be exchanged
/// again. Empty values count as unset in every backend.
async fn consume_stored_authorization(ctx: &Context) -> Result<()> {
    let Some(dotenv) = ctx.chain.dotenv() else {
        warn!(
            verifier = keys::CODE_VERIFIER,
            state = keys::OAUTH_STATE,
            "dotenv backend disabled, cannot clear the used verifier and state; remove them by hand"
        );
        return Ok(());
    };
    dotenv
        .persist(&[(keys::CODE_VERIFIER, ""), (keys::OAUTH_STATE, "")])
        .await
        .context("failed to clear stored verifier and state")?;
    info!(path = %dotenv.path().display(), "stored authorization consumed");
    Ok(())
}

/// Authorize and receive the redirect in one process.
pub async fn login(ctx: &Context) -> Result<()> {
    let secrets = ctx
        .secrets(&[keys::CLIENT_ID, keys::REDIRECT_URI], &[keys::CLIENT_SECRET])
        .await?;
    let auth = bot_oauth::generate(&ctx.client_config(&secrets)?)?;
    let url = auth.url.clone();

    // Bind before printing the URL so the redirect cannot arrive first
    let listener = ctx
        .bind_listener(
            &secrets,
            PendingAuthorization {
                request: auth.request,
                verifier: auth.verifier,
            },
        )
        .await?;

    println!("Open this URL in a browser signed in as the bot account:\n\n{url}\n");
    report(ctx, listener.run().await?);
    Ok(())
}

/// Refresh the access token if it expires within `threshold`.
pub async fn refresh(ctx: &Context, threshold: Duration) -> Result<()> {
    let token_file = ctx.token_file();
    let current = token_file.load().await.with_context(|| {
        format!(
            "cannot read {}; run `bot-auth login` first",
            token_file.path().display()
        )
    })?;

    if !current.is_expiring_within(threshold) {
        info!(expires_at = current.expires_at(), "access token still valid, not refreshing");
        println!("Access token valid until {} (unix); nothing to do.", current.expires_at());
        return Ok(());
    }

    let optional: &[&str] = if current.refresh_token.is_some() {
        &[keys::CLIENT_SECRET]
    } else {
        &[keys::CLIENT_SECRET, keys::REFRESH_TOKEN]
    };
    let secrets = ctx.secrets(&[keys::CLIENT_ID], optional).await?;

    let refresh_token = match &current.refresh_token {
        Some(token) => token.clone(),
        None => secrets
            .get(keys::REFRESH_TOKEN)
            .map(|e| e.value.clone())
            .ok_or_else(|| {
                anyhow!("no refresh token available; run `bot-auth login` to re-authorize")
            })?,
    };

    let client_id = secrets.resolve(keys::CLIENT_ID)?.expose();
    let tokens = match ctx.exchanger(&secrets).refresh(&refresh_token, client_id).await {
        Ok(tokens) => tokens,
        Err(e @ bot_oauth::Error::TokenExchange { .. }) => {
            return Err(anyhow!(e).context("refresh token rejected; run `bot-auth login` to re-authorize"));
        }
        Err(e) => return Err(e.into()),
    };

    let merged = tokens.merge_refresh(&current);
    token_file.save(&merged).await?;
    println!("Access token refreshed; valid until {} (unix).", merged.expires_at());
    Ok(())
}

/// Resolve the required secret set and report where each came from.
///
/// Returns an error when any required name failed.
pub async fn check(ctx: &Context, required: &[String]) -> Result<()> {
    let names = required_names(required);
    let resolution = ctx
        .chain
        .resolve_all(names.iter().copied(), Completeness::Partial)
        .await?;

    for (name, source) in resolution.snapshot.sources() {
        println!("{name:<28} {source}");
    }
    for failure in &resolution.failures {
        println!(
            "{:<28} FAILED: {failure}",
            failure.secret_name().unwrap_or("<unknown>")
        );
    }

    resolution
        .into_required(names.iter().copied())
        .context("required secrets are not available")?;
    println!("All {} required secrets resolved.", names.len());
    Ok(())
}

fn required_names(requested: &[String]) -> Vec<&str> {
    if requested.is_empty() {
        crate::config::DEFAULT_REQUIRED.to_vec()
    } else {
        requested.iter().map(String::as_str).collect()
    }
}

/// Rebuild the authorization attempt from the stored verifier and state.
/// The challenge is recomputed from the verifier, never regenerated.
fn stored_authorization(ctx: &Context, secrets: &SecretSnapshot) -> Result<PendingAuthorization> {
    let client = ctx.client_config(secrets)?;
    client.validate()?;
    let verifier = PkceVerifier::parse(secrets.resolve(keys::CODE_VERIFIER)?.expose())
        .with_context(|| format!("{} is not a usable code verifier", keys::CODE_VERIFIER))?;

    Ok(PendingAuthorization {
        request: AuthorizationRequest {
            client_id: client.client_id,
            redirect_uri: client.redirect_uri,
            scopes: client.scopes,
            state: secrets.resolve(keys::OAUTH_STATE)?.expose().to_owned(),
            challenge: verifier.challenge(),
        },
        verifier,
    })
}

fn report(ctx: &Context, tokens: TokenSet) {
    println!(
        "Tokens written to {} (access token valid until {} unix, refresh token {}).",
        ctx.config.storage.token_file.display(),
        tokens.expires_at(),
        if tokens.refresh_token.is_some() { "present" } else { "absent" }
    );
}
