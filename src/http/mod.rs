//! Axum-based HTTP front — serves each configured index under `/<name>/`.
//!
//! The channel implements [`Component`] so it slots into the service
//! lifecycle: `run()` drives the axum event loop and the shared
//! [`CancellationToken`] is wired to axum's graceful shutdown.
//!
//! ## URL layout (per index)
//!
//! ```text
//! GET    /                           service summary
//! GET    /{index}/search             ordered external ids
//! GET    /{index}/search-fetch       ordered documents
//! GET    /{index}/tokenize           locale + tokens
//! GET    /{index}/shards             shard listing (?detailed=true)
//! POST   /{index}/flush              enqueue SYNC
//! POST   /{index}/optimize           enqueue OPTIMIZE
//! GET    /{index}/maintenance        read the flag
//! POST   /{index}/maintenance        set the flag
//! DELETE /{index}/maintenance        clear the flag
//! POST   /{index}/reconstruct        enqueue RECONSTRUCT  (maintenance)
//! POST   /{index}/reserve            enqueue RESERVE      (maintenance)
//! DELETE /{index}/shards/{timestamp} enqueue DROP_SHARD   (maintenance)
//! GET    /{index}/{docId}            fetch one document
//! PUT    /{index}/{docId}            enqueue ADD
//! DELETE /{index}/{docId}            enqueue REMOVE
//! ```

mod api;

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Router,
    routing::{delete, get, post},
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::engine::SearchEngine;
use crate::error::EngineError;
use crate::runtime::{Component, ComponentFuture};

// ── Shared request state ──────────────────────────────────────────────────────

/// Service-wide state behind the root route.
pub struct ServiceState {
    pub server_name: String,
    pub engines: BTreeMap<String, Arc<SearchEngine>>,
}

/// Per-index state injected into the index routes.
///
/// Cheap to clone — all fields are reference-counted.
#[derive(Clone)]
pub(crate) struct IndexState {
    pub(crate) engine: Arc<SearchEngine>,
}

// ── HttpChannel ───────────────────────────────────────────────────────────────

pub struct HttpChannel {
    channel_id: String,
    bind_addr: String,
    state: Arc<ServiceState>,
}

impl HttpChannel {
    pub fn new(
        channel_id: impl Into<String>,
        bind_addr: impl Into<String>,
        state: Arc<ServiceState>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            bind_addr: bind_addr.into(),
            state,
        }
    }
}

impl Component for HttpChannel {
    fn id(&self) -> &str {
        &self.channel_id
    }

    fn run(self: Box<Self>, shutdown: CancellationToken) -> ComponentFuture {
        Box::pin(run_http(self.channel_id, self.bind_addr, self.state, shutdown))
    }
}

// ── Server loop ───────────────────────────────────────────────────────────────

async fn run_http(
    channel_id: String,
    bind_addr: String,
    state: Arc<ServiceState>,
    shutdown: CancellationToken,
) -> Result<(), EngineError> {
    let router = build_router(state);

    let listener = TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| EngineError::Task(format!("http bind failed on {bind_addr}: {e}")))?;

    info!(%channel_id, %bind_addr, "http channel listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| EngineError::Task(format!("http server error: {e}")))?;

    info!(%channel_id, "http channel shut down");
    Ok(())
}

// ── Router ────────────────────────────────────────────────────────────────────

/// Build the full router: one sub-router per configured index, mounted under
/// its name, plus the service summary at the root.
pub fn build_router(state: Arc<ServiceState>) -> Router {
    let mut router = Router::new()
        .route("/", get(api::root))
        .with_state(state.clone());

    for (name, engine) in &state.engines {
        let index_state = IndexState { engine: engine.clone() };
        router = router.nest(&format!("/{name}"), index_router(index_state));
    }
    router
}

fn index_router(state: IndexState) -> Router {
    Router::new()
        .route("/search",               get(api::search))
        .route("/search-fetch",         get(api::search_fetch))
        .route("/tokenize",             get(api::tokenize))
        .route("/shards",               get(api::shards))
        .route("/shards/{timestamp}",   delete(api::drop_shard))
        .route("/flush",                post(api::flush))
        .route("/optimize",             post(api::optimize))
        .route("/maintenance",          get(api::maintenance_get)
                                            .post(api::maintenance_start)
                                            .delete(api::maintenance_end))
        .route("/reconstruct",          post(api::reconstruct))
        .route("/reserve",              post(api::reserve))
        .route("/{doc_id}",             get(api::get_document)
                                            .put(api::put_document)
                                            .delete(api::delete_document))
        .with_state(state)
}
