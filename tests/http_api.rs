//! Router-level tests: drive the axum router directly with tower's
//! `oneshot`, no TCP listener involved.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tower::util::ServiceExt;

use ttts::config::IndexConfig;
use ttts::engine::SearchEngine;
use ttts::http::{ServiceState, build_router};

// ── helpers ───────────────────────────────────────────────────────────────────

struct TestService {
    router: Router,
    token: CancellationToken,
    _tmp: TempDir,
}

impl Drop for TestService {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

fn service() -> TestService {
    let tmp = TempDir::new().expect("tempdir");
    let cfg = IndexConfig {
        name: "docs".into(),
        base_dir: tmp.path().to_path_buf(),
        bucket_duration_seconds: 100,
        initial_document_id: 1000,
        max_document_token_count: 10_000,
        max_query_token_count: 5,
        auto_commit_update_count: 1_000,
        auto_commit_duration_seconds: 3_600,
        record_positions: true,
        record_contents: true,
        read_connection_counts: vec![2, 0],
        cache_kibibytes: vec![1_024, 400],
        mmap_bytes: vec![0, 0],
        automerge_levels: vec![8, 2],
        journal_size_limit_bytes: 1 << 20,
        page_size: 8192,
        task_retry_count: 2,
        worker_idle_sleep_ms: 5,
        default_locale: "en".into(),
    };

    let token = CancellationToken::new();
    let engine = Arc::new(SearchEngine::open(cfg, &token).expect("open engine"));
    let mut engines = BTreeMap::new();
    engines.insert("docs".to_string(), engine);

    let state = Arc::new(ServiceState {
        server_name: "ttts-test".to_string(),
        engines,
    });

    TestService {
        router: build_router(state),
        token,
        _tmp: tmp,
    }
}

async fn read_json(response: axum::response::Response) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, value)
}

async fn get(svc: &TestService, uri: &str) -> (StatusCode, Value) {
    let response = svc
        .router
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .expect("request");
    read_json(response).await
}

async fn send(svc: &TestService, method: &str, uri: &str, body: Value) -> (StatusCode, Value) {
    let response = svc
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .expect("request");
    read_json(response).await
}

async fn send_empty(svc: &TestService, method: &str, uri: &str) -> (StatusCode, Value) {
    let response = svc
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .expect("request");
    read_json(response).await
}

async fn put_doc(svc: &TestService, doc_id: &str, timestamp: i64, text: &str) {
    let (status, body) = send(
        svc,
        "PUT",
        &format!("/docs/{doc_id}"),
        json!({ "text": text, "timestamp": timestamp }),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED, "put body: {body}");
    assert!(body["taskId"].as_str().unwrap().starts_with("d-"));
}

async fn flush(svc: &TestService) {
    let (status, body) = send_empty(svc, "POST", "/docs/flush?wait=true").await;
    assert_eq!(status, StatusCode::OK, "flush body: {body}");
}

// ── tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn root_lists_configured_indexes() {
    let svc = service();
    let (status, body) = get(&svc, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "ttts-test");
    assert_eq!(body["indexes"], json!(["docs"]));
}

#[tokio::test]
async fn put_flush_search_round_trip() {
    let svc = service();
    put_doc(&svc, "doc1", 1000, "hello world").await;
    flush(&svc).await;

    let (status, body) = get(&svc, "/docs/search?query=hello").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"], json!(["doc1"]));
}

#[tokio::test]
async fn search_without_query_is_bad_request() {
    let svc = service();
    let (status, body) = get(&svc, "/docs/search").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_argument");
}

#[tokio::test]
async fn search_fetch_returns_documents() {
    let svc = service();
    put_doc(&svc, "doc1", 1000, "fetchable words").await;
    flush(&svc).await;

    let (status, body) = get(&svc, "/docs/search-fetch?query=fetchable").await;
    assert_eq!(status, StatusCode::OK);
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["id"], "doc1");
    assert_eq!(results[0]["bodyText"], "fetchable words");

    let (_, trimmed) = get(
        &svc,
        "/docs/search-fetch?query=fetchable&omitBodyText=true",
    )
    .await;
    assert!(trimmed["results"][0].get("bodyText").is_none());
}

#[tokio::test]
async fn tokenize_endpoint_returns_locale_and_tokens() {
    let svc = service();
    let (status, body) = get(&svc, "/docs/tokenize?text=Hello%20World").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["locale"], "en");
    assert_eq!(body["tokens"], json!(["hello", "world"]));

    let (status, _) = get(&svc, "/docs/tokenize").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn get_document_and_not_found() {
    let svc = service();
    put_doc(&svc, "doc1", 1000, "retrievable body").await;
    flush(&svc).await;

    let (status, body) = get(&svc, "/docs/doc1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], "doc1");
    assert_eq!(body["bodyText"], "retrievable body");

    let (status, body) = get(&svc, "/docs/absent").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn delete_document_removes_it() {
    let svc = service();
    put_doc(&svc, "doc1", 1000, "short lived").await;
    flush(&svc).await;

    let (status, body) =
        send(&svc, "DELETE", "/docs/doc1", json!({ "timestamp": 1000 })).await;
    assert_eq!(status, StatusCode::ACCEPTED, "delete body: {body}");
    flush(&svc).await;

    let (status, _) = get(&svc, "/docs/doc1").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn maintenance_gates_reserve_and_drop() {
    let svc = service();

    let (status, body) = send(
        &svc,
        "POST",
        "/docs/reserve",
        json!({ "timestamp": 1000, "ids": ["x1"] }),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT, "reserve body: {body}");
    assert_eq!(body["error"], "maintenance_required");

    let (status, _) = send_empty(&svc, "DELETE", "/docs/shards/1000").await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send_empty(&svc, "POST", "/docs/maintenance").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["maintenance"], true);

    let (status, body) = send(
        &svc,
        "POST",
        "/docs/reserve",
        json!({ "timestamp": 1000, "ids": ["x1", "x2"] }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "reserve body: {body}");
    assert!(body["taskId"].as_str().unwrap().starts_with("m-"));

    let (status, body) = send_empty(&svc, "DELETE", "/docs/maintenance").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["maintenance"], false);

    let (_, body) = get(&svc, "/docs/maintenance").await;
    assert_eq!(body["maintenance"], false);
}

#[tokio::test]
async fn shards_listing_plain_and_detailed() {
    let svc = service();
    put_doc(&svc, "doc1", 1000, "some words").await;
    flush(&svc).await;

    let (status, body) = get(&svc, "/docs/shards").await;
    assert_eq!(status, StatusCode::OK);
    let shards = body["shards"].as_array().unwrap();
    assert_eq!(shards.len(), 1);
    assert_eq!(shards[0]["bucketTs"], 1000);
    assert_eq!(shards[0]["healthy"], true);

    let (status, body) = get(&svc, "/docs/shards?detailed=true").await;
    assert_eq!(status, StatusCode::OK);
    let shards = body["shards"].as_array().unwrap();
    assert_eq!(shards[0]["documentCount"], 1);
    assert!(shards[0]["fileSizeBytes"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn optimize_returns_task_id() {
    let svc = service();
    put_doc(&svc, "doc1", 1000, "optimizable").await;
    flush(&svc).await;

    let (status, body) = send(
        &svc,
        "POST",
        "/docs/optimize?wait=true",
        json!({ "timestamp": 1000 }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "optimize body: {body}");
    assert!(body["taskId"].as_str().unwrap().starts_with("m-"));
}

#[tokio::test]
async fn unknown_index_is_not_found() {
    let svc = service();
    let (status, _) = get(&svc, "/nope/search?query=x").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_timestamp_is_rejected_at_admission() {
    let svc = service();
    let (status, body) = send(
        &svc,
        "PUT",
        "/docs/doc1",
        json!({ "text": "x", "timestamp": -5 }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "body: {body}");
    assert_eq!(body["error"], "invalid_argument");
}
