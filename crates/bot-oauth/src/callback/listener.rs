//! One-shot HTTP listener for the provider redirect
//!
//! Binds the redirect URI's host/port, serves exactly one authorization
//! attempt on the callback path, then shuts down. The state machine in
//! [`super::machine`] decides what each request may do; this module only
//! performs the I/O it asks for.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, oneshot};
use tracing::{Instrument, error, info, info_span, warn};
use url::{Host, Url};

use super::machine::{CallbackAction, CallbackEvent, CallbackParams, CallbackState, validate};
use crate::error::{Error, Result};
use crate::pkce::{AuthorizationRequest, PkceVerifier};
use crate::token::{TokenExchanger, TokenSet};
use crate::token_file::TokenFile;

/// Upper bound on waiting for the final browser response to flush.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// How long an exchange already in flight may run past the callback timeout.
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

const SUCCESS_HTML: &str = "<html><body><h1>Authorization complete</h1><p>Tokens were saved. You may close this window.</p></body></html>";
const DUPLICATE_HTML: &str = "<html><body><h1>Already handled</h1><p>This authorization attempt has already been processed.</p></body></html>";
const INTERNAL_HTML: &str =
    "<html><body><h1>Unexpected listener state</h1><p>Restart the authorization flow.</p></body></html>";

/// Where and how long to listen.
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    pub bind: SocketAddr,
    pub path: String,
    pub timeout: Duration,
    pub exchange_timeout: Duration,
}

impl ListenerOptions {
    /// Derive the bind address and callback path from the redirect URI.
    ///
    /// `localhost` binds the IPv4 loopback. Remote hostnames are rejected:
    /// the listener can only receive redirects addressed to this machine.
    pub fn from_redirect_uri(redirect_uri: &str, timeout: Duration) -> Result<Self> {
        let url = Url::parse(redirect_uri)
            .map_err(|e| Error::Configuration(format!("redirect_uri is not a valid URL: {e}")))?;
        if url.scheme() != "http" {
            return Err(Error::Configuration(format!(
                "callback listener only serves plain http, redirect_uri uses {}",
                url.scheme()
            )));
        }
        let ip = match url.host() {
            Some(Host::Ipv4(ip)) => IpAddr::V4(ip),
            Some(Host::Ipv6(ip)) => IpAddr::V6(ip),
            Some(Host::Domain("localhost")) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            Some(Host::Domain(other)) => {
                return Err(Error::Configuration(format!(
                    "redirect_uri host {other} is not local; cannot listen for it"
                )));
            }
            None => return Err(Error::Configuration("redirect_uri has no host".into())),
        };
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::Configuration("redirect_uri has no port".into()))?;

        let options = Self {
            bind: SocketAddr::new(ip, port),
            path: url.path().to_owned(),
            timeout,
            exchange_timeout: DEFAULT_EXCHANGE_TIMEOUT,
        };
        options.validate()?;
        Ok(options)
    }

    pub fn with_exchange_timeout(mut self, exchange_timeout: Duration) -> Self {
        self.exchange_timeout = exchange_timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.path.starts_with('/') {
            return Err(Error::Configuration(format!(
                "callback path must start with '/', got {:?}",
                self.path
            )));
        }
        if self.path.contains(['{', '}', '*', ':']) {
            return Err(Error::Configuration(format!(
                "callback path {:?} contains route syntax characters",
                self.path
            )));
        }
        if self.timeout.is_zero() || self.exchange_timeout.is_zero() {
            return Err(Error::Configuration(
                "callback and exchange timeouts must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// The authorization attempt the listener completes: the request whose state
/// the callback must echo, and the verifier whose challenge was sent with it.
#[derive(Debug, Clone)]
pub struct PendingAuthorization {
    pub request: AuthorizationRequest,
    pub verifier: PkceVerifier,
}

/// Bound, not yet serving, callback listener.
pub struct CallbackListener {
    listener: TcpListener,
    options: ListenerOptions,
    state: ListenerState,
    outcome: oneshot::Receiver<Result<TokenSet>>,
}

impl CallbackListener {
    /// Bind the listener socket. The machine stays `Idle` until [`run`](Self::run).
    pub async fn bind(
        options: ListenerOptions,
        pending: PendingAuthorization,
        exchanger: TokenExchanger,
        token_file: TokenFile,
    ) -> Result<Self> {
        options.validate()?;
        let listener = TcpListener::bind(options.bind)
            .await
            .map_err(|e| Error::Io(format!("binding callback listener on {}: {e}", options.bind)))?;
        let (state, outcome) = ListenerState::new(pending, exchanger, token_file);

        Ok(Self {
            listener,
            options,
            state,
            outcome,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| Error::Io(format!("reading listener address: {e}")))
    }

    /// Serve until one authorization attempt finishes or the timeout elapses.
    pub async fn run(self) -> Result<TokenSet> {
        let Self {
            listener,
            options,
            state,
            mut outcome,
        } = self;

        let addr = listener
            .local_addr()
            .map_err(|e| Error::Io(format!("reading listener address: {e}")))?;
        let router = build_router(state.clone(), &options.path);

        state.shared.machine.lock().await.apply(CallbackEvent::ListenerBound);
        info!(
            addr = %addr,
            path = %options.path,
            timeout_secs = options.timeout.as_secs(),
            "waiting for authorization callback"
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let mut server = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        let received = match tokio::time::timeout(options.timeout, &mut outcome).await {
            Ok(received) => received,
            Err(_) => {
                let action = state
                    .shared
                    .machine
                    .lock()
                    .await
                    .apply(CallbackEvent::TimedOut(options.timeout));
                match action {
                    CallbackAction::Fail(e) => {
                        warn!(timeout_secs = options.timeout.as_secs(), "no callback received");
                        Ok(Err(e))
                    }
                    // Exchange already in flight; give it a bounded window
                    _ => match tokio::time::timeout(options.exchange_timeout, &mut outcome).await {
                        Ok(received) => received,
                        Err(_) => {
                            warn!(
                                exchange_timeout_secs = options.exchange_timeout.as_secs(),
                                "token exchange did not finish"
                            );
                            Ok(Err(Error::ExchangeTimeout(options.exchange_timeout)))
                        }
                    },
                }
            }
        };

        let _ = shutdown_tx.send(());
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await {
            Ok(Ok(Ok(()))) => info!("callback listener stopped"),
            Ok(Ok(Err(e))) => error!(error = %e, "callback server error during shutdown"),
            Ok(Err(e)) => error!(error = %e, "callback server task panicked"),
            Err(_) => {
                warn!("callback listener did not stop within grace period, aborting");
                server.abort();
            }
        }

        received.map_err(|_| Error::Io("callback listener stopped without an outcome".into()))?
    }
}

/// Shared handler state.
#[derive(Clone)]
pub(crate) struct ListenerState {
    shared: Arc<Shared>,
}

struct Shared {
    machine: Mutex<CallbackState>,
    pending: PendingAuthorization,
    exchanger: TokenExchanger,
    token_file: TokenFile,
    outcome: Mutex<Option<oneshot::Sender<Result<TokenSet>>>>,
}

impl ListenerState {
    pub(crate) fn new(
        pending: PendingAuthorization,
        exchanger: TokenExchanger,
        token_file: TokenFile,
    ) -> (Self, oneshot::Receiver<Result<TokenSet>>) {
        let (tx, rx) = oneshot::channel();
        let state = Self {
            shared: Arc::new(Shared {
                machine: Mutex::new(CallbackState::new(pending.request.state.clone())),
                pending,
                exchanger,
                token_file,
                outcome: Mutex::new(Some(tx)),
            }),
        };
        (state, rx)
    }

    #[cfg(test)]
    pub(crate) async fn mark_bound(&self) {
        self.shared.machine.lock().await.apply(CallbackEvent::ListenerBound);
    }

    async fn handle(&self, params: CallbackParams) -> Response {
        let code = {
            let mut machine = self.shared.machine.lock().await;
            let (params, expected_state) = match machine.apply(CallbackEvent::CallbackReceived(params)) {
                CallbackAction::Validate {
                    params,
                    expected_state,
                } => (params, expected_state),
                CallbackAction::RejectDuplicate => {
                    warn!(state = machine.label(), "ignoring callback outside awaiting_callback");
                    return page(StatusCode::CONFLICT, DUPLICATE_HTML.to_owned());
                }
                _ => return unexpected(),
            };

            match machine.apply(CallbackEvent::Validated(validate(&params, &expected_state))) {
                CallbackAction::Exchange { code } => code,
                CallbackAction::Fail(e) => {
                    drop(machine);
                    warn!(error = %e, "callback rejected");
                    let body = failure_html("Authorization failed", &e.to_string());
                    self.finish(Err(e)).await;
                    return page(StatusCode::BAD_REQUEST, body);
                }
                _ => return unexpected(),
            }
        };

        info!("callback validated, exchanging authorization code");
        let result = self.exchange_and_persist(&code).await;

        let mut machine = self.shared.machine.lock().await;
        match result {
            Ok(tokens) => match machine.apply(CallbackEvent::ExchangeSucceeded) {
                CallbackAction::Complete => {
                    drop(machine);
                    self.finish(Ok(tokens)).await;
                    page(StatusCode::OK, SUCCESS_HTML.to_owned())
                }
                _ => unexpected(),
            },
            Err(e) => match machine.apply(CallbackEvent::ExchangeFailed(e)) {
                CallbackAction::Fail(e) => {
                    drop(machine);
                    error!(error = %e, "token exchange failed");
                    let detail = match &e {
                        Error::TokenExchange { status, .. } => {
                            format!("The token endpoint answered with status {status}.")
                        }
                        _ => "The tokens could not be obtained or saved.".to_owned(),
                    };
                    let body = failure_html("Token exchange failed", &detail);
                    self.finish(Err(e)).await;
                    page(StatusCode::BAD_GATEWAY, body)
                }
                _ => unexpected(),
            },
        }
    }

    async fn exchange_and_persist(&self, code: &str) -> Result<TokenSet> {
        let PendingAuthorization { request, verifier } = &self.shared.pending;
        let tokens = self
            .shared
            .exchanger
            .exchange_code(code, verifier, &request.client_id, &request.redirect_uri)
            .await?;
        self.shared.token_file.save(&tokens).await?;
        Ok(tokens)
    }

    async fn finish(&self, outcome: Result<TokenSet>) {
        if let Some(tx) = self.shared.outcome.lock().await.take() {
            let _ = tx.send(outcome);
        }
    }
}

/// Build the callback router. Only `path` is routed; everything else is 404.
pub(crate) fn build_router(state: ListenerState, path: &str) -> Router {
    Router::new()
        .route(path, get(callback_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(1))
        .with_state(state)
}

async fn callback_handler(
    State(state): State<ListenerState>,
    Query(params): Query<CallbackParams>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    state
        .handle(params)
        .instrument(info_span!("callback", request_id = %request_id))
        .await
}

fn unexpected() -> Response {
    error!("callback listener reached an unexpected action");
    page(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_HTML.to_owned())
}

fn page(status: StatusCode, body: String) -> Response {
    (status, Html(body)).into_response()
}

fn failure_html(title: &str, detail: &str) -> String {
    format!(
        "<html><body><h1>{}</h1><p>{}</p><p>Restart the authorization flow.</p></body></html>",
        escape_html(title),
        escape_html(detail)
    )
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
