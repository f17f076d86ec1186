//! In-process token endpoint for tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::Router;
use axum::extract::{Form, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::post;
use tokio::sync::Mutex;

#[derive(Clone, Default)]
struct Recorded {
    hits: Arc<AtomicUsize>,
    form: Arc<Mutex<Option<HashMap<String, String>>>>,
    authorization: Arc<Mutex<Option<String>>>,
}

/// Serves `POST /token` with a canned response and records what it received.
pub(crate) struct MockTokenEndpoint {
    addr: SocketAddr,
    recorded: Recorded,
}

impl MockTokenEndpoint {
    pub(crate) async fn ok(body: &'static str) -> Self {
        Self::respond(200, body).await
    }

    pub(crate) async fn respond(status: u16, body: &'static str) -> Self {
        let recorded = Recorded::default();
        let status = StatusCode::from_u16(status).unwrap();

        let app = Router::new()
            .route(
                "/token",
                post(
                    move |State(recorded): State<Recorded>,
                          headers: HeaderMap,
                          Form(form): Form<HashMap<String, String>>| async move {
                        recorded.hits.fetch_add(1, Ordering::SeqCst);
                        *recorded.form.lock().await = Some(form);
                        *recorded.authorization.lock().await = headers
                            .get(header::AUTHORIZATION)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_owned);
                        (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
                    },
                ),
            )
            .with_state(recorded.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, recorded }
    }

    pub(crate) fn url(&self) -> String {
        format!("http://{}/token", self.addr)
    }

    pub(crate) fn hits(&self) -> usize {
        self.recorded.hits.load(Ordering::SeqCst)
    }

    pub(crate) async fn last_form(&self) -> Option<HashMap<String, String>> {
        self.recorded.form.lock().await.clone()
    }

    pub(crate) async fn last_authorization(&self) -> Option<String> {
        self.recorded.authorization.lock().await.clone()
    }
}
