//! Time-tiered full-text search engine.
//!
//! One `SearchEngine` per configured index. Document updates stream in as
//! tasks through a durable queue; a single worker (on the blocking pool)
//! applies them to time-bucketed shards, each an independent SQLite FTS5
//! store. Searches walk the shards newest-first through per-shard read
//! connections.
//!
//! ```text
//! enqueue_task ──► input_tasks ──► worker ──► shard writer ──► commit
//!                                    │
//! search / fetch_documents ──────────┴──► shard readers (round-robin)
//! ```

pub mod files;
pub mod query;
pub mod queue;
pub mod search;
pub mod shard;
pub mod task;
pub mod tokenizer;
mod worker;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::IndexConfig;
use crate::error::EngineError;

use files::{IndexFileManager, ShardStats};
use queue::TaskQueue;
use shard::Shard;
use task::{TaskId, TaskPayload};
use worker::Worker;

pub use files::ShardFileInfo;
pub use search::{DocumentRecord, FetchOptions, SearchRequest};

/// State shared between the public handle, the worker, and the read path.
pub(crate) struct EngineShared {
    pub(crate) cfg: IndexConfig,
    pub(crate) files: IndexFileManager,
    pub(crate) queue: TaskQueue,
    /// Bucket → shard, mutated only by the worker (plus initial discovery).
    shards: RwLock<BTreeMap<i64, Arc<Shard>>>,
    /// Buckets whose file exists but cannot be opened; excluded from search
    /// until repaired or dropped.
    unhealthy: RwLock<BTreeSet<i64>>,
    maintenance: AtomicBool,
    pub(crate) shutdown: CancellationToken,
    /// Bumped by the worker after each task completion; `wait_task` listens.
    completions: watch::Sender<u64>,
}

impl EngineShared {
    pub(crate) fn shard(&self, bucket_ts: i64) -> Option<Arc<Shard>> {
        self.read_shards().get(&bucket_ts).cloned()
    }

    /// All shards, newest bucket first.
    pub(crate) fn shards_desc(&self) -> Vec<Arc<Shard>> {
        self.read_shards().values().rev().cloned().collect()
    }

    pub(crate) fn latest_bucket(&self) -> Option<i64> {
        self.read_shards().keys().next_back().copied()
    }

    pub(crate) fn insert_shard(&self, shard: Arc<Shard>) {
        self.write_shards().insert(shard.bucket_ts(), shard);
    }

    pub(crate) fn remove_shard(&self, bucket_ts: i64) -> Option<Arc<Shard>> {
        self.write_shards().remove(&bucket_ts)
    }

    pub(crate) fn mark_unhealthy(&self, bucket_ts: i64) {
        match self.unhealthy.write() {
            Ok(mut set) => {
                set.insert(bucket_ts);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(bucket_ts);
            }
        }
    }

    /// Drop the unhealthy mark for `bucket_ts`; `true` when it was set.
    pub(crate) fn forget_unhealthy(&self, bucket_ts: i64) -> bool {
        match self.unhealthy.write() {
            Ok(mut set) => set.remove(&bucket_ts),
            Err(poisoned) => poisoned.into_inner().remove(&bucket_ts),
        }
    }

    pub(crate) fn maintenance_on(&self) -> bool {
        self.maintenance.load(Ordering::SeqCst)
    }

    pub(crate) fn set_maintenance(&self, on: bool) {
        self.maintenance.store(on, Ordering::SeqCst);
    }

    pub(crate) fn notify_completion(&self) {
        self.completions.send_modify(|n| *n = n.wrapping_add(1));
    }

    fn read_shards(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<i64, Arc<Shard>>> {
        match self.shards.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_shards(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<i64, Arc<Shard>>> {
        match self.shards.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Public handle to one index: enqueue mutations, search, fetch, manage.
pub struct SearchEngine {
    shared: Arc<EngineShared>,
    worker_token: CancellationToken,
    worker_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SearchEngine {
    /// Open the index under its configured base directory, discover and open
    /// existing shards, replay interrupted work, and start the worker.
    ///
    /// Must be called from within a Tokio runtime; the worker runs on the
    /// blocking pool until `shutdown` (or [`close`](Self::close)) fires.
    pub fn open(cfg: IndexConfig, shutdown: &CancellationToken) -> Result<Self, EngineError> {
        std::fs::create_dir_all(&cfg.base_dir)?;
        let files = IndexFileManager::new(&cfg.base_dir, &cfg.name);
        let queue = TaskQueue::open(&files.common_path())?;

        let worker_token = shutdown.child_token();
        let shared = Arc::new(EngineShared {
            files,
            queue,
            shards: RwLock::new(BTreeMap::new()),
            unhealthy: RwLock::new(BTreeSet::new()),
            maintenance: AtomicBool::new(false),
            shutdown: worker_token.clone(),
            completions: watch::channel(0u64).0,
            cfg,
        });

        discover_shards(&shared)?;

        let worker_shared = shared.clone();
        let handle = tokio::task::spawn_blocking(move || Worker::new(worker_shared).run());

        info!(index = %shared.cfg.name, dir = %shared.cfg.base_dir.display(), "engine started");
        Ok(Self {
            shared,
            worker_token,
            worker_handle: Mutex::new(Some(handle)),
        })
    }

    pub fn config(&self) -> &IndexConfig {
        &self.shared.cfg
    }

    // ── Task submission ───────────────────────────────────────────────────────

    /// Validate and enqueue a task, returning its prefixed id.
    ///
    /// Operations that mutate shard identity or allocation are admitted only
    /// while maintenance mode is on.
    pub async fn enqueue_task(&self, payload: TaskPayload) -> Result<TaskId, EngineError> {
        validate_payload(&payload)?;
        if payload.requires_maintenance() && !self.shared.maintenance_on() {
            return Err(EngineError::AdmissionDenied(format!(
                "{} requires maintenance mode",
                payload.kind()
            )));
        }

        let shared = self.shared.clone();
        tokio::task::spawn_blocking(move || shared.queue.enqueue(&payload))
            .await
            .map_err(|e| EngineError::Task(format!("enqueue join: {e}")))?
    }

    /// Resolve once `id` is absent from both queue tables — for data tasks
    /// that means the shard commit containing them has happened.
    pub async fn wait_task(&self, id: TaskId) -> Result<(), EngineError> {
        let mut rx = self.shared.completions.subscribe();
        loop {
            let shared = self.shared.clone();
            let pending = tokio::task::spawn_blocking(move || shared.queue.is_pending(id))
                .await
                .map_err(|e| EngineError::Task(format!("wait join: {e}")))??;
            if !pending {
                return Ok(());
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        // Worker side gone; keep polling the tables.
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(250)) => {}
            }
        }
    }

    /// Whether `id` is still queued or in flight.
    pub async fn is_pending(&self, id: TaskId) -> Result<bool, EngineError> {
        let shared = self.shared.clone();
        tokio::task::spawn_blocking(move || shared.queue.is_pending(id))
            .await
            .map_err(|e| EngineError::Task(format!("is_pending join: {e}")))?
    }

    // ── Read path ─────────────────────────────────────────────────────────────

    pub async fn search(&self, req: SearchRequest) -> Result<Vec<String>, EngineError> {
        search::search(&self.shared, req).await
    }

    pub async fn fetch_documents(
        &self,
        ids: &[String],
        options: FetchOptions,
    ) -> Result<Vec<DocumentRecord>, EngineError> {
        search::fetch_documents(&self.shared, ids, options).await
    }

    /// Tokenize `text` the way documents of this index are tokenized.
    pub fn tokenize(&self, text: &str, locale: Option<&str>) -> (String, Vec<String>) {
        let locale = self.resolve_locale(text, locale);
        let tokens = tokenizer::tokenize(text, &locale);
        (locale, tokens)
    }

    /// Guess the effective locale for `text`, preferring the caller's choice
    /// and falling back to the index default.
    pub fn resolve_locale(&self, text: &str, preferred: Option<&str>) -> String {
        let preferred = preferred.unwrap_or(&self.shared.cfg.default_locale);
        tokenizer::guess_locale(text, preferred)
    }

    // ── Maintenance mode ──────────────────────────────────────────────────────

    pub fn start_maintenance_mode(&self) {
        self.shared.set_maintenance(true);
        info!(index = %self.shared.cfg.name, "maintenance mode on");
    }

    pub fn end_maintenance_mode(&self) {
        self.shared.set_maintenance(false);
        info!(index = %self.shared.cfg.name, "maintenance mode off");
    }

    pub fn check_maintenance_mode(&self) -> bool {
        self.shared.maintenance_on()
    }

    // ── Introspection ─────────────────────────────────────────────────────────

    /// Shard files on disk, newest first, with health flags.
    pub async fn list_index_files(&self) -> Result<Vec<ShardFileInfo>, EngineError> {
        let shared = self.shared.clone();
        tokio::task::spawn_blocking(move || shared.files.list_shard_files())
            .await
            .map_err(|e| EngineError::Task(format!("list join: {e}")))?
    }

    /// Detailed per-shard statistics, newest first.
    pub async fn shard_stats(&self) -> Result<Vec<ShardStats>, EngineError> {
        let shared = self.shared.clone();
        tokio::task::spawn_blocking(move || {
            let mut stats = Vec::new();
            for info in shared.files.list_shard_files()? {
                stats.push(shared.files.stats(info.bucket_ts)?);
            }
            Ok(stats)
        })
        .await
        .map_err(|e| EngineError::Task(format!("stats join: {e}")))?
    }

    // ── Shutdown ──────────────────────────────────────────────────────────────

    /// Stop the worker, flush and close every shard. Idempotent.
    pub async fn close(&self) {
        self.worker_token.cancel();
        let handle = {
            let mut guard = match self.worker_handle.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.take()
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(index = %self.shared.cfg.name, "worker join failed: {e}");
            }
        }
    }
}

/// Open every shard file found on disk; unopenable files are marked
/// unhealthy and left alone.
fn discover_shards(shared: &Arc<EngineShared>) -> Result<(), EngineError> {
    let cfg = &shared.cfg;
    let found = shared.files.list_shard_files()?;
    let latest = found
        .iter()
        .filter(|f| f.healthy)
        .map(|f| f.bucket_ts)
        .max();

    for info in found {
        if !info.healthy {
            shared.mark_unhealthy(info.bucket_ts);
            continue;
        }
        let generation = latest
            .map(|l| cfg.generation(info.bucket_ts, l))
            .unwrap_or(0);
        match Shard::open(cfg, &info.path, info.bucket_ts, generation) {
            Ok(shard) => shared.insert_shard(Arc::new(shard)),
            Err(e) => {
                warn!(bucket = info.bucket_ts, "shard failed to open, marked unhealthy: {e}");
                shared.mark_unhealthy(info.bucket_ts);
            }
        }
    }

    let count = shared.shards_desc().len();
    if count > 0 {
        info!(index = %cfg.name, shards = count, latest = ?latest, "shards discovered");
    }
    Ok(())
}

fn validate_payload(payload: &TaskPayload) -> Result<(), EngineError> {
    fn doc_id_ok(doc_id: &str) -> Result<(), EngineError> {
        if doc_id.is_empty() {
            return Err(EngineError::Config("document id must not be empty".into()));
        }
        Ok(())
    }
    fn timestamp_ok(timestamp: i64) -> Result<(), EngineError> {
        if timestamp < 0 {
            return Err(EngineError::Config(format!(
                "timestamp must not be negative: {timestamp}"
            )));
        }
        Ok(())
    }

    match payload {
        TaskPayload::Add { doc_id, timestamp, .. }
        | TaskPayload::Remove { doc_id, timestamp } => {
            doc_id_ok(doc_id)?;
            timestamp_ok(*timestamp)
        }
        TaskPayload::Sync {} => Ok(()),
        TaskPayload::Optimize { target_timestamp }
        | TaskPayload::DropShard { target_timestamp } => timestamp_ok(*target_timestamp),
        TaskPayload::Reconstruct {
            target_timestamp,
            new_initial_id,
            ..
        } => {
            timestamp_ok(*target_timestamp)?;
            if let Some(id) = new_initial_id {
                if *id <= 1 {
                    return Err(EngineError::Config(format!(
                        "newInitialId must be greater than 1: {id}"
                    )));
                }
            }
            Ok(())
        }
        TaskPayload::Reserve { documents } => {
            if documents.is_empty() {
                return Err(EngineError::Config("reserve list must not be empty".into()));
            }
            for doc in documents {
                doc_id_ok(&doc.id)?;
                timestamp_ok(doc.timestamp)?;
            }
            Ok(())
        }
    }
}
