//! End-to-end engine scenarios: the full add → queue → worker → shard →
//! search loop against real shard files in a temp directory.

use std::ops::Deref;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use ttts::config::IndexConfig;
use ttts::engine::queue::TaskQueue;
use ttts::engine::task::{ReserveDocument, TaskId, TaskPayload};
use ttts::engine::{FetchOptions, SearchEngine, SearchRequest};

// ── helpers ───────────────────────────────────────────────────────────────────

/// Engine wrapper that cancels the worker on drop so a failed assertion
/// cannot hang the test runtime.
struct TestEngine {
    engine: Option<SearchEngine>,
    token: CancellationToken,
    _tmp: TempDir,
}

impl Deref for TestEngine {
    type Target = SearchEngine;
    fn deref(&self) -> &SearchEngine {
        self.engine.as_ref().expect("engine open")
    }
}

impl Drop for TestEngine {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl TestEngine {
    async fn shutdown(mut self) -> (TempDir, IndexConfig) {
        let engine = self.engine.take().expect("engine open");
        engine.close().await;
        let cfg = engine.config().clone();
        // Keep the temp dir alive for reopen tests.
        let tmp = std::mem::replace(&mut self._tmp, TempDir::new().expect("tempdir"));
        (tmp, cfg)
    }
}

fn test_config(dir: &TempDir) -> IndexConfig {
    IndexConfig {
        name: "test".into(),
        base_dir: dir.path().to_path_buf(),
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
    }
}

fn open_engine_with(tmp: TempDir, cfg: IndexConfig) -> TestEngine {
    let token = CancellationToken::new();
    let engine = SearchEngine::open(cfg, &token).expect("open engine");
    TestEngine {
        engine: Some(engine),
        token,
        _tmp: tmp,
    }
}

fn open_engine() -> TestEngine {
    let tmp = TempDir::new().expect("tempdir");
    let cfg = test_config(&tmp);
    open_engine_with(tmp, cfg)
}

fn add_payload(doc_id: &str, timestamp: i64, body: &str) -> TaskPayload {
    TaskPayload::Add {
        doc_id: doc_id.into(),
        timestamp,
        body_text: body.into(),
        locale: "en".into(),
        attrs: None,
    }
}

async fn add(engine: &SearchEngine, doc_id: &str, timestamp: i64, body: &str) -> TaskId {
    engine
        .enqueue_task(add_payload(doc_id, timestamp, body))
        .await
        .expect("enqueue add")
}

async fn sync(engine: &SearchEngine) {
    let id = engine
        .enqueue_task(TaskPayload::Sync {})
        .await
        .expect("enqueue sync");
    engine.wait_task(id).await.expect("wait sync");
}

async fn search(engine: &SearchEngine, query: &str) -> Vec<String> {
    engine
        .search(SearchRequest {
            query: query.into(),
            locale: "en".into(),
            limit: 100,
            offset: 0,
            timeout: Duration::from_secs(5),
        })
        .await
        .expect("search")
}

// ── S1: basic add/search ──────────────────────────────────────────────────────

#[tokio::test]
async fn add_then_search_finds_document() {
    let engine = open_engine();

    add(&engine, "doc1", 1000, "hello world").await;
    sync(&engine).await;

    assert_eq!(search(&engine, "hello").await, vec!["doc1"]);
    assert_eq!(search(&engine, "world").await, vec!["doc1"]);
    assert!(search(&engine, "absent").await.is_empty());

    let files = engine.list_index_files().await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].bucket_ts, 1000);
    assert!(files[0].healthy);

    let stats = engine.shard_stats().await.unwrap();
    assert_eq!(stats[0].document_count, 1);
}

// ── S2: ordering within a shard ───────────────────────────────────────────────

#[tokio::test]
async fn results_within_shard_are_newest_insertion_first() {
    let engine = open_engine();

    add(&engine, "A", 1000, "shared token alpha").await;
    add(&engine, "B", 1000, "shared token beta").await;
    add(&engine, "C", 1000, "shared token gamma").await;
    sync(&engine).await;

    assert_eq!(search(&engine, "shared").await, vec!["C", "B", "A"]);
}

// ── S3: cross-shard ordering ──────────────────────────────────────────────────

#[tokio::test]
async fn results_are_newest_bucket_first() {
    let engine = open_engine();

    add(&engine, "old", 100, "common text").await;
    add(&engine, "new", 250, "common text").await;
    sync(&engine).await;

    assert_eq!(search(&engine, "common").await, vec!["new", "old"]);

    let files = engine.list_index_files().await.unwrap();
    let buckets: Vec<i64> = files.iter().map(|f| f.bucket_ts).collect();
    assert_eq!(buckets, vec![200, 100]);
}

// ── S4: reservation fixes ordering ────────────────────────────────────────────

#[tokio::test]
async fn reservation_sets_order_regardless_of_arrival() {
    let engine = open_engine();

    engine.start_maintenance_mode();
    let reserve_id = engine
        .enqueue_task(TaskPayload::Reserve {
            documents: vec![
                ReserveDocument { id: "x1".into(), timestamp: 1000 },
                ReserveDocument { id: "x2".into(), timestamp: 1000 },
                ReserveDocument { id: "x3".into(), timestamp: 1000 },
            ],
        })
        .await
        .expect("enqueue reserve");
    engine.end_maintenance_mode();
    engine.wait_task(reserve_id).await.expect("wait reserve");

    // Content arrives in a different order than the reservation.
    add(&engine, "x3", 1000, "common three").await;
    add(&engine, "x1", 1000, "common one").await;
    add(&engine, "x2", 1000, "common two").await;
    sync(&engine).await;

    assert_eq!(search(&engine, "common").await, vec!["x3", "x2", "x1"]);
}

#[tokio::test]
async fn reserve_outside_maintenance_is_denied() {
    let engine = open_engine();
    let err = engine
        .enqueue_task(TaskPayload::Reserve {
            documents: vec![ReserveDocument { id: "x".into(), timestamp: 0 }],
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ttts::error::EngineError::AdmissionDenied(_)));
}

// ── S5: drop removes visibility and files ─────────────────────────────────────

#[tokio::test]
async fn drop_shard_removes_file_and_results() {
    let engine = open_engine();

    add(&engine, "d", 1000, "droppable content").await;
    sync(&engine).await;
    assert_eq!(search(&engine, "droppable").await, vec!["d"]);

    engine.start_maintenance_mode();
    let drop_id = engine
        .enqueue_task(TaskPayload::DropShard { target_timestamp: 1000 })
        .await
        .expect("enqueue drop");
    engine.end_maintenance_mode();
    engine.wait_task(drop_id).await.expect("wait drop");

    assert!(engine.list_index_files().await.unwrap().is_empty());
    assert!(search(&engine, "droppable").await.is_empty());
}

// ── S6: pseudo-phrase vs native phrase ────────────────────────────────────────

#[tokio::test]
async fn pseudo_phrase_filters_non_adjacent_tokens() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = test_config(&tmp);
    cfg.record_positions = false;
    let engine = open_engine_with(tmp, cfg);

    add(&engine, "d", 1000, "alpha beta gamma").await;
    sync(&engine).await;

    assert_eq!(search(&engine, "\"alpha beta\"").await, vec!["d"]);
    // The AND query matches, but the post-filter drops the non-adjacent pair.
    assert!(search(&engine, "\"alpha gamma\"").await.is_empty());
    // Plain AND without quotes still matches.
    assert_eq!(search(&engine, "alpha gamma").await, vec!["d"]);
}

#[tokio::test]
async fn native_phrase_matches_same_outcomes() {
    let engine = open_engine();

    add(&engine, "d", 1000, "alpha beta gamma").await;
    sync(&engine).await;

    assert_eq!(search(&engine, "\"alpha beta\"").await, vec!["d"]);
    assert!(search(&engine, "\"alpha gamma\"").await.is_empty());
    assert_eq!(search(&engine, "alpha gamma").await, vec!["d"]);
}

// ── Updates, removals, attrs ──────────────────────────────────────────────────

#[tokio::test]
async fn update_replaces_tokens_under_same_id() {
    let engine = open_engine();

    add(&engine, "doc", 1000, "first version").await;
    sync(&engine).await;
    add(&engine, "doc", 1000, "second version").await;
    sync(&engine).await;

    assert!(search(&engine, "first").await.is_empty());
    assert_eq!(search(&engine, "second").await, vec!["doc"]);
    assert_eq!(engine.shard_stats().await.unwrap()[0].document_count, 1);
}

#[tokio::test]
async fn remove_deletes_document() {
    let engine = open_engine();

    add(&engine, "doc", 1000, "ephemeral content").await;
    sync(&engine).await;

    let id = engine
        .enqueue_task(TaskPayload::Remove { doc_id: "doc".into(), timestamp: 1000 })
        .await
        .unwrap();
    assert_eq!(id.to_string(), "d-3");
    sync(&engine).await;

    assert!(search(&engine, "ephemeral").await.is_empty());
    assert!(
        engine
            .fetch_documents(&["doc".into()], FetchOptions::default())
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn fetch_documents_preserves_caller_order_and_omits() {
    let engine = open_engine();

    engine
        .enqueue_task(TaskPayload::Add {
            doc_id: "a".into(),
            timestamp: 100,
            body_text: "alpha body".into(),
            locale: "en".into(),
            attrs: Some("{\"kind\":\"a\"}".into()),
        })
        .await
        .unwrap();
    add(&engine, "b", 250, "beta body").await;
    sync(&engine).await;

    let ids = vec!["b".to_string(), "missing".to_string(), "a".to_string()];
    let records = engine
        .fetch_documents(&ids, FetchOptions::default())
        .await
        .unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].id, "b");
    assert_eq!(records[0].bucket_ts, 200);
    assert_eq!(records[1].id, "a");
    assert_eq!(records[1].bucket_ts, 100);
    assert_eq!(records[1].body_text.as_deref(), Some("alpha body"));
    assert_eq!(records[1].attrs.as_deref(), Some("{\"kind\":\"a\"}"));

    let trimmed = engine
        .fetch_documents(
            &ids,
            FetchOptions { omit_body_text: true, omit_attrs: true },
        )
        .await
        .unwrap();
    assert!(trimmed.iter().all(|r| r.body_text.is_none() && r.attrs.is_none()));
}

// ── Duplicate policy ──────────────────────────────────────────────────────────

#[tokio::test]
async fn external_id_may_live_in_only_one_shard() {
    let engine = open_engine();

    add(&engine, "doc", 100, "original bucket").await;
    sync(&engine).await;

    // Same external id into a different bucket fails permanently; the task
    // completes (as failed) and the original stays put.
    let dup = add(&engine, "doc", 250, "other bucket").await;
    engine.wait_task(dup).await.unwrap();

    assert!(search(&engine, "other").await.is_empty());
    let records = engine
        .fetch_documents(&["doc".into()], FetchOptions::default())
        .await
        .unwrap();
    assert_eq!(records[0].bucket_ts, 100);
}

// ── Contentless shards ────────────────────────────────────────────────────────

#[tokio::test]
async fn contentless_shard_rejects_update_and_remove() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = test_config(&tmp);
    cfg.record_contents = false;
    cfg.record_positions = false;
    let engine = open_engine_with(tmp, cfg);

    add(&engine, "doc", 1000, "immutable content").await;
    sync(&engine).await;
    assert_eq!(search(&engine, "immutable").await, vec!["doc"]);

    let update = add(&engine, "doc", 1000, "replacement").await;
    engine.wait_task(update).await.unwrap();
    let remove = engine
        .enqueue_task(TaskPayload::Remove { doc_id: "doc".into(), timestamp: 1000 })
        .await
        .unwrap();
    engine.wait_task(remove).await.unwrap();

    // Both failed; the shard is unchanged.
    assert_eq!(search(&engine, "immutable").await, vec!["doc"]);
    assert!(search(&engine, "replacement").await.is_empty());
}

// ── Crash recovery ────────────────────────────────────────────────────────────

#[tokio::test]
async fn interrupted_data_task_is_replayed_on_start() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);

    // Simulate a crash between claim and completion: the task sits in the
    // batch table, its mutation never applied.
    let task_id = {
        let queue = TaskQueue::open(&tmp.path().join("test-common.db")).unwrap();
        queue.enqueue(&add_payload("crashdoc", 1000, "survives the crash")).unwrap();
        let task = queue.fetch_first().unwrap().unwrap();
        queue.move_to_batch(&task).unwrap();
        task.id
    };

    let engine = open_engine_with(tmp, cfg);
    engine.wait_task(task_id).await.expect("replayed task completes");
    assert_eq!(search(&engine, "survives").await, vec!["crashdoc"]);
}

#[tokio::test]
async fn state_survives_clean_restart() {
    let engine = open_engine();
    add(&engine, "persistent", 1000, "durable words").await;
    sync(&engine).await;
    let (tmp, cfg) = engine.shutdown().await;

    let engine = open_engine_with(tmp, cfg);
    assert_eq!(search(&engine, "durable").await, vec!["persistent"]);
}

// ── Reconstruct ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn reconstruct_preserves_documents_and_renumbers() {
    let engine = open_engine();

    add(&engine, "a", 1000, "alpha words").await;
    add(&engine, "b", 1000, "beta words").await;
    add(&engine, "c", 1000, "gamma words").await;
    sync(&engine).await;
    assert_eq!(search(&engine, "words").await, vec!["c", "b", "a"]);

    engine.start_maintenance_mode();
    let id = engine
        .enqueue_task(TaskPayload::Reconstruct {
            target_timestamp: 1000,
            new_initial_id: Some(500_000),
            use_external_id: false,
        })
        .await
        .unwrap();
    engine.end_maintenance_mode();
    engine.wait_task(id).await.unwrap();

    // Same document set, same within-shard ordering.
    assert_eq!(search(&engine, "words").await, vec!["c", "b", "a"]);
    assert_eq!(search(&engine, "beta").await, vec!["b"]);
    assert_eq!(engine.shard_stats().await.unwrap()[0].document_count, 3);

    // New inserts keep descending below the rebuilt numbering.
    add(&engine, "d", 1000, "delta words").await;
    sync(&engine).await;
    assert_eq!(search(&engine, "words").await, vec!["d", "c", "b", "a"]);
}

#[tokio::test]
async fn reconstruct_by_external_id_reorders_results() {
    let engine = open_engine();

    // Insertion order c, a, b — so search returns b, a, c beforehand.
    add(&engine, "c", 1000, "shuffle words").await;
    add(&engine, "a", 1000, "shuffle words").await;
    add(&engine, "b", 1000, "shuffle words").await;
    sync(&engine).await;
    assert_eq!(search(&engine, "shuffle").await, vec!["b", "a", "c"]);

    engine.start_maintenance_mode();
    let id = engine
        .enqueue_task(TaskPayload::Reconstruct {
            target_timestamp: 1000,
            new_initial_id: None,
            use_external_id: true,
        })
        .await
        .unwrap();
    engine.end_maintenance_mode();
    engine.wait_task(id).await.unwrap();

    // external_id ASC got the highest ids first → ascending rowid order is
    // the reverse of the external ordering.
    assert_eq!(search(&engine, "shuffle").await, vec!["c", "b", "a"]);
}

// ── Failure containment ───────────────────────────────────────────────────────

#[tokio::test]
async fn exhausted_rowid_space_leaves_task_for_operator() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = test_config(&tmp);
    cfg.initial_document_id = 3;
    let engine = open_engine_with(tmp, cfg);

    add(&engine, "a", 1000, "one").await;
    add(&engine, "b", 1000, "two").await;
    sync(&engine).await;

    let exhausted = add(&engine, "c", 1000, "three").await;
    // Give the worker time to hit the exhaustion and park the task.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(engine.is_pending(exhausted).await.unwrap());
    // Earlier documents are unaffected.
    assert_eq!(search(&engine, "one").await, vec!["a"]);
}

#[tokio::test]
async fn unhealthy_shard_is_listed_and_excluded() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    std::fs::write(tmp.path().join("test-500.db"), b"not a database").unwrap();
    let engine = open_engine_with(tmp, cfg);

    add(&engine, "good", 1000, "healthy content").await;
    sync(&engine).await;

    let files = engine.list_index_files().await.unwrap();
    assert_eq!(files.len(), 2);
    let bad = files.iter().find(|f| f.bucket_ts == 500).unwrap();
    assert!(!bad.healthy);

    // Search is served from the healthy shard only.
    assert_eq!(search(&engine, "healthy").await, vec!["good"]);
}

// ── Query surface details ─────────────────────────────────────────────────────

#[tokio::test]
async fn empty_query_is_rejected() {
    let engine = open_engine();
    let err = engine
        .search(SearchRequest {
            query: "!!! ???".into(),
            locale: "en".into(),
            limit: 10,
            offset: 0,
            timeout: Duration::from_secs(1),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ttts::error::EngineError::Config(_)));
}

#[tokio::test]
async fn limit_and_offset_page_through_results() {
    let engine = open_engine();

    add(&engine, "A", 1000, "paged entry").await;
    add(&engine, "B", 1000, "paged entry").await;
    add(&engine, "C", 1000, "paged entry").await;
    sync(&engine).await;

    let page = |limit, offset| {
        let engine = &engine;
        async move {
            engine
                .search(SearchRequest {
                    query: "paged".into(),
                    locale: "en".into(),
                    limit,
                    offset,
                    timeout: Duration::from_secs(5),
                })
                .await
                .unwrap()
        }
    };

    assert_eq!(page(2, 0).await, vec!["C", "B"]);
    assert_eq!(page(2, 1).await, vec!["B", "A"]);
    assert_eq!(page(2, 3).await, Vec::<String>::new());
}

#[tokio::test]
async fn zero_timeout_returns_without_visiting_shards() {
    let engine = open_engine();
    add(&engine, "doc", 1000, "timed content").await;
    sync(&engine).await;

    let ids = engine
        .search(SearchRequest {
            query: "timed".into(),
            locale: "en".into(),
            limit: 10,
            offset: 0,
            timeout: Duration::ZERO,
        })
        .await
        .unwrap();
    assert!(ids.is_empty());
}

#[tokio::test]
async fn wait_task_resolves_only_after_both_tables_clear() {
    let engine = open_engine();

    let add_id = add(&engine, "doc", 1000, "waited content").await;
    let sync_id = engine.enqueue_task(TaskPayload::Sync {}).await.unwrap();

    engine.wait_task(add_id).await.unwrap();
    assert!(!engine.is_pending(add_id).await.unwrap());
    // The SYNC barrier committed the shard, so the document is visible.
    engine.wait_task(sync_id).await.unwrap();
    assert_eq!(search(&engine, "waited").await, vec!["doc"]);
}
