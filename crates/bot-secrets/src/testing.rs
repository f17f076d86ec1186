//! In-process remote secret store for tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;

use crate::remote::TOKEN_HEADER;

pub(crate) const STORE_TOKEN: &str = "s.test-token";

#[derive(Clone)]
struct StoreState {
    table: Arc<HashMap<String, (u16, &'static str)>>,
    hits: Arc<AtomicUsize>,
}

/// Serves `GET /v1/{path}` from a fixed `path -> (status, body)` table.
/// Unknown paths are 404; requests without [`STORE_TOKEN`] are 403.
pub(crate) struct MockStore {
    pub(crate) addr: String,
    hits: Arc<AtomicUsize>,
}

impl MockStore {
    pub(crate) async fn start(responses: Vec<(&'static str, u16, &'static str)>) -> Self {
        let state = StoreState {
            table: Arc::new(
                responses
                    .into_iter()
                    .map(|(path, status, body)| (path.to_owned(), (status, body)))
                    .collect(),
            ),
            hits: Arc::new(AtomicUsize::new(0)),
        };
        let hits = state.hits.clone();

        let app = Router::new()
            .route("/v1/{*path}", get(serve_secret))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, hits }
    }

    pub(crate) fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn serve_secret(
    State(state): State<StoreState>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> (StatusCode, &'static str) {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let token = headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok());
    if token != Some(STORE_TOKEN) {
        return (StatusCode::FORBIDDEN, r#"{"errors":["permission denied"]}"#);
    }
    match state.table.get(&path) {
        Some((status, body)) => (
            StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            *body,
        ),
        None => (StatusCode::NOT_FOUND, r#"{"errors":[]}"#),
    }
}
