//! Axum handlers for the index routes.
//!
//! Each handler receives [`IndexState`] via [`axum::extract::State`] and
//! returns an axum [`Response`]. Mutating endpoints reply `202` with the
//! prefixed task id; `wait=true` (query or body) blocks on task completion
//! before responding.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::engine::task::{ReserveDocument, TaskPayload};
use crate::engine::{FetchOptions, SearchRequest};
use crate::error::EngineError;

use super::{IndexState, ServiceState};

/// Upper bound on `wait=true` blocking before the handler gives up.
const WAIT_TIMEOUT: Duration = Duration::from_secs(60);

const DEFAULT_LIMIT: usize = 100;
const DEFAULT_TIMEOUT_SECONDS: f64 = 1.0;

// ── Request types ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SearchParams {
    query: Option<String>,
    locale: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
    /// Seconds of wall time the shard walk may consume.
    timeout: Option<f64>,
    #[serde(default)]
    omit_body_text: bool,
    #[serde(default)]
    omit_attrs: bool,
}

#[derive(Deserialize)]
pub(super) struct TokenizeParams {
    text: Option<String>,
    locale: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct FetchParams {
    #[serde(default)]
    omit_body_text: bool,
    #[serde(default)]
    omit_attrs: bool,
}

#[derive(Deserialize, Default)]
pub(super) struct WaitParam {
    #[serde(default)]
    wait: bool,
}

#[derive(Deserialize)]
pub(super) struct ShardsParams {
    #[serde(default)]
    detailed: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct PutDocumentBody {
    text: String,
    timestamp: i64,
    locale: Option<String>,
    attrs: Option<String>,
    #[serde(default)]
    wait: bool,
}

#[derive(Deserialize)]
pub(super) struct DeleteDocumentBody {
    timestamp: i64,
    #[serde(default)]
    wait: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ReconstructBody {
    timestamp: i64,
    new_initial_id: Option<i64>,
    #[serde(default)]
    use_external_id: bool,
    #[serde(default)]
    wait: bool,
}

#[derive(Deserialize)]
pub(super) struct ReserveBody {
    timestamp: Option<i64>,
    ids: Option<Vec<String>>,
    documents: Option<Vec<ReserveDocument>>,
    #[serde(default)]
    wait: bool,
}

#[derive(Deserialize)]
pub(super) struct OptimizeBody {
    timestamp: i64,
    #[serde(default)]
    wait: bool,
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Build a JSON error response body.
fn json_error(code: &str, msg: impl std::fmt::Display) -> Json<serde_json::Value> {
    Json(json!({ "error": code, "message": format!("{msg}") }))
}

fn bad_request(msg: impl std::fmt::Display) -> Response {
    (StatusCode::BAD_REQUEST, json_error("invalid_argument", msg)).into_response()
}

fn error_response(e: EngineError) -> Response {
    let (status, code) = match &e {
        EngineError::Config(_) => (StatusCode::BAD_REQUEST, "invalid_argument"),
        EngineError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        EngineError::AdmissionDenied(_) => (StatusCode::CONFLICT, "maintenance_required"),
        EngineError::ResourceExhausted(_) => (StatusCode::INTERNAL_SERVER_ERROR, "exhausted"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };
    (status, json_error(code, e)).into_response()
}

/// Enqueue `payload`, optionally block on its completion, and reply with the
/// task id.
async fn enqueue_and_reply(
    state: &IndexState,
    payload: TaskPayload,
    wait: bool,
    status: StatusCode,
) -> Response {
    let task_id = match state.engine.enqueue_task(payload).await {
        Ok(id) => id,
        Err(e) => return error_response(e),
    };

    if wait {
        match tokio::time::timeout(WAIT_TIMEOUT, state.engine.wait_task(task_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return error_response(e),
            Err(_) => {
                warn!(task = %task_id, "wait on task timed out");
                return (
                    StatusCode::GATEWAY_TIMEOUT,
                    json_error("timeout", format!("task {task_id} still pending")),
                )
                    .into_response();
            }
        }
    }

    (status, Json(json!({ "taskId": task_id.to_string() }))).into_response()
}

fn build_search_request(state: &IndexState, query: String, params: &SearchParams) -> SearchRequest {
    let locale = state.engine.resolve_locale(&query, params.locale.as_deref());
    SearchRequest {
        query,
        locale,
        limit: params.limit.unwrap_or(DEFAULT_LIMIT),
        offset: params.offset.unwrap_or(0),
        timeout: Duration::from_secs_f64(
            params.timeout.unwrap_or(DEFAULT_TIMEOUT_SECONDS).max(0.0),
        ),
    }
}

// ── Service root ──────────────────────────────────────────────────────────────

/// GET / — service name and the configured indexes.
pub(super) async fn root(State(state): State<Arc<ServiceState>>) -> Response {
    let indexes: Vec<&String> = state.engines.keys().collect();
    (
        StatusCode::OK,
        Json(json!({ "name": state.server_name, "indexes": indexes })),
    )
        .into_response()
}

// ── Read endpoints ────────────────────────────────────────────────────────────

/// GET /{index}/search
pub(super) async fn search(
    State(state): State<IndexState>,
    Query(params): Query<SearchParams>,
) -> Response {
    let Some(query) = params.query.clone() else {
        return bad_request("missing 'query' parameter");
    };
    let req = build_search_request(&state, query, &params);
    match state.engine.search(req).await {
        Ok(ids) => (StatusCode::OK, Json(json!({ "results": ids }))).into_response(),
        Err(e) => error_response(e),
    }
}

/// GET /{index}/search-fetch
pub(super) async fn search_fetch(
    State(state): State<IndexState>,
    Query(params): Query<SearchParams>,
) -> Response {
    let Some(query) = params.query.clone() else {
        return bad_request("missing 'query' parameter");
    };
    let req = build_search_request(&state, query, &params);
    let ids = match state.engine.search(req).await {
        Ok(ids) => ids,
        Err(e) => return error_response(e),
    };
    let options = FetchOptions {
        omit_body_text: params.omit_body_text,
        omit_attrs: params.omit_attrs,
    };
    match state.engine.fetch_documents(&ids, options).await {
        Ok(records) => (StatusCode::OK, Json(json!({ "results": records }))).into_response(),
        Err(e) => error_response(e),
    }
}

/// GET /{index}/tokenize
pub(super) async fn tokenize(
    State(state): State<IndexState>,
    Query(params): Query<TokenizeParams>,
) -> Response {
    let Some(text) = params.text else {
        return bad_request("missing 'text' parameter");
    };
    let (locale, tokens) = state.engine.tokenize(&text, params.locale.as_deref());
    (
        StatusCode::OK,
        Json(json!({ "locale": locale, "tokens": tokens })),
    )
        .into_response()
}

/// GET /{index}/{docId}
pub(super) async fn get_document(
    State(state): State<IndexState>,
    Path(doc_id): Path<String>,
    Query(params): Query<FetchParams>,
) -> Response {
    let options = FetchOptions {
        omit_body_text: params.omit_body_text,
        omit_attrs: params.omit_attrs,
    };
    match state.engine.fetch_documents(&[doc_id.clone()], options).await {
        Ok(mut records) if !records.is_empty() => {
            (StatusCode::OK, Json(records.remove(0))).into_response()
        }
        Ok(_) => (
            StatusCode::NOT_FOUND,
            json_error("not_found", format!("document '{doc_id}'")),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// GET /{index}/shards
pub(super) async fn shards(
    State(state): State<IndexState>,
    Query(params): Query<ShardsParams>,
) -> Response {
    if params.detailed {
        match state.engine.shard_stats().await {
            Ok(stats) => (StatusCode::OK, Json(json!({ "shards": stats }))).into_response(),
            Err(e) => error_response(e),
        }
    } else {
        match state.engine.list_index_files().await {
            Ok(files) => {
                let shards: Vec<_> = files
                    .iter()
                    .map(|f| json!({ "bucketTs": f.bucket_ts, "healthy": f.healthy }))
                    .collect();
                (StatusCode::OK, Json(json!({ "shards": shards }))).into_response()
            }
            Err(e) => error_response(e),
        }
    }
}

// ── Document mutations ────────────────────────────────────────────────────────

/// PUT /{index}/{docId}
pub(super) async fn put_document(
    State(state): State<IndexState>,
    Path(doc_id): Path<String>,
    Query(wait): Query<WaitParam>,
    Json(body): Json<PutDocumentBody>,
) -> Response {
    let locale = state.engine.resolve_locale(&body.text, body.locale.as_deref());
    let payload = TaskPayload::Add {
        doc_id,
        timestamp: body.timestamp,
        body_text: body.text,
        locale,
        attrs: body.attrs,
    };
    enqueue_and_reply(&state, payload, wait.wait || body.wait, StatusCode::ACCEPTED).await
}

/// DELETE /{index}/{docId}
pub(super) async fn delete_document(
    State(state): State<IndexState>,
    Path(doc_id): Path<String>,
    Query(wait): Query<WaitParam>,
    Json(body): Json<DeleteDocumentBody>,
) -> Response {
    let payload = TaskPayload::Remove {
        doc_id,
        timestamp: body.timestamp,
    };
    enqueue_and_reply(&state, payload, wait.wait || body.wait, StatusCode::ACCEPTED).await
}

// ── Control endpoints ─────────────────────────────────────────────────────────

/// GET /{index}/maintenance
pub(super) async fn maintenance_get(State(state): State<IndexState>) -> Response {
    (
        StatusCode::OK,
        Json(json!({ "maintenance": state.engine.check_maintenance_mode() })),
    )
        .into_response()
}

/// POST /{index}/maintenance
pub(super) async fn maintenance_start(State(state): State<IndexState>) -> Response {
    state.engine.start_maintenance_mode();
    (StatusCode::OK, Json(json!({ "maintenance": true }))).into_response()
}

/// DELETE /{index}/maintenance
pub(super) async fn maintenance_end(State(state): State<IndexState>) -> Response {
    state.engine.end_maintenance_mode();
    (StatusCode::OK, Json(json!({ "maintenance": false }))).into_response()
}

/// POST /{index}/flush
pub(super) async fn flush(
    State(state): State<IndexState>,
    Query(wait): Query<WaitParam>,
) -> Response {
    enqueue_and_reply(&state, TaskPayload::Sync {}, wait.wait, StatusCode::OK).await
}

/// POST /{index}/optimize
pub(super) async fn optimize(
    State(state): State<IndexState>,
    Query(wait): Query<WaitParam>,
    Json(body): Json<OptimizeBody>,
) -> Response {
    let payload = TaskPayload::Optimize {
        target_timestamp: body.timestamp,
    };
    enqueue_and_reply(&state, payload, wait.wait || body.wait, StatusCode::OK).await
}

/// POST /{index}/reconstruct — requires maintenance mode.
pub(super) async fn reconstruct(
    State(state): State<IndexState>,
    Query(wait): Query<WaitParam>,
    Json(body): Json<ReconstructBody>,
) -> Response {
    let payload = TaskPayload::Reconstruct {
        target_timestamp: body.timestamp,
        new_initial_id: body.new_initial_id,
        use_external_id: body.use_external_id,
    };
    enqueue_and_reply(&state, payload, wait.wait || body.wait, StatusCode::OK).await
}

/// POST /{index}/reserve — requires maintenance mode.
///
/// Accepts either `{documents: [{id, timestamp}]}` or `{timestamp, ids: []}`.
pub(super) async fn reserve(
    State(state): State<IndexState>,
    Query(wait): Query<WaitParam>,
    Json(body): Json<ReserveBody>,
) -> Response {
    let documents = match (body.documents, body.timestamp, body.ids) {
        (Some(documents), _, _) => documents,
        (None, Some(timestamp), Some(ids)) => ids
            .into_iter()
            .map(|id| ReserveDocument { id, timestamp })
            .collect(),
        _ => return bad_request("expected 'documents' or 'timestamp' + 'ids'"),
    };
    let payload = TaskPayload::Reserve { documents };
    enqueue_and_reply(&state, payload, wait.wait || body.wait, StatusCode::OK).await
}

/// DELETE /{index}/shards/{timestamp} — requires maintenance mode.
pub(super) async fn drop_shard(
    State(state): State<IndexState>,
    Path(timestamp): Path<i64>,
    Query(wait): Query<WaitParam>,
) -> Response {
    let payload = TaskPayload::DropShard {
        target_timestamp: timestamp,
    };
    enqueue_and_reply(&state, payload, wait.wait, StatusCode::OK).await
}
