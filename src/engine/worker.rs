//! The single logical worker: every mutation in the system runs here.
//!
//! The worker owns task dispatch end to end: it claims data tasks into the
//! durable batch table, applies them to the target shard's writer, and
//! completes them when the shard transaction that contains them commits.
//! Management tasks (SYNC, OPTIMIZE, RECONSTRUCT, RESERVE, DROP_SHARD) are
//! applied inline and completed immediately.
//!
//! Failure policy: transient storage errors are retried a few times inline;
//! a task that keeps failing stays in the batch table for replay on the next
//! start and is surfaced in the log. Invalid-input failures (contentless
//! violations, cross-shard duplicates) are permanent and complete the task
//! as failed. A task that exhausted the rowid space stays durable until an
//! operator reconstructs the shard with a higher initial id.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, params};
use tracing::{debug, error, info, warn};

use crate::error::EngineError;

use super::EngineShared;
use super::shard::{self, Shard};
use super::task::{Task, TaskId, TaskPartition, TaskPayload};

/// Rows copied per transaction while rebuilding a shard.
const RECONSTRUCT_BATCH_ROWS: usize = 10_000;

/// Default numbering start for rebuilt shards.
const RECONSTRUCT_DEFAULT_INITIAL_ID: i64 = 268_435_455;

/// Sleep between inline retries of a failing data task.
const RETRY_SLEEP: Duration = Duration::from_millis(200);

pub(super) struct Worker {
    shared: Arc<EngineShared>,
    /// Data tasks applied to a shard's open transaction but not yet
    /// committed, per bucket. They complete (leave the batch table) when
    /// that shard commits, so `wait_task` implies visibility.
    uncommitted: HashMap<i64, Vec<TaskId>>,
}

impl Worker {
    pub(super) fn new(shared: Arc<EngineShared>) -> Self {
        Self {
            shared,
            uncommitted: HashMap::new(),
        }
    }

    /// Blocking run loop; returns once the shutdown token fires. All shard
    /// state is flushed and closed on the way out.
    pub(super) fn run(mut self) {
        if let Err(e) = self.replay_pending_batch() {
            error!(index = %self.shared.cfg.name, "batch replay failed: {e}");
        }

        let idle = Duration::from_millis(self.shared.cfg.worker_idle_sleep_ms);
        loop {
            if self.shared.shutdown.is_cancelled() {
                break;
            }
            if self.shared.maintenance_on() {
                std::thread::sleep(idle);
                continue;
            }

            match self.shared.queue.fetch_first() {
                Ok(Some(task)) => {
                    self.dispatch(task);
                    self.auto_commit_pass();
                    self.shared.notify_completion();
                }
                Ok(None) => {
                    self.auto_commit_pass();
                    std::thread::sleep(idle);
                }
                Err(e) => {
                    error!(index = %self.shared.cfg.name, "queue fetch failed: {e}");
                    std::thread::sleep(idle);
                }
            }
        }

        self.shutdown_flush();
    }

    // ── Startup recovery ──────────────────────────────────────────────────────

    /// Re-apply data tasks that were claimed but not completed by a prior
    /// run. Replays are idempotent on the external id.
    fn replay_pending_batch(&mut self) -> Result<(), EngineError> {
        let pending = self.shared.queue.pending_batch_tasks()?;
        if pending.is_empty() {
            return Ok(());
        }
        info!(
            index = %self.shared.cfg.name,
            count = pending.len(),
            "replaying interrupted data tasks"
        );

        for task in pending {
            match self.apply_data(&task) {
                Ok(bucket) => self.note_uncommitted(bucket, task.id),
                Err(e) if is_permanent(&e) => {
                    error!(task = %task.id, "replayed task failed permanently: {e}");
                    self.complete_data_task(task.id);
                }
                Err(e) => {
                    warn!(task = %task.id, "replayed task failed, left for next replay: {e}");
                }
            }
        }
        self.commit_all_shards();
        Ok(())
    }

    // ── Dispatch ──────────────────────────────────────────────────────────────

    fn dispatch(&mut self, task: Task) {
        debug!(task = %task.id, kind = task.payload.kind(), "dispatching task");
        match task.id.partition {
            TaskPartition::Data => self.dispatch_data(task),
            TaskPartition::Management => self.dispatch_management(task),
        }
    }

    fn dispatch_data(&mut self, task: Task) {
        if let Err(e) = self.shared.queue.move_to_batch(&task) {
            error!(task = %task.id, "claim failed: {e}");
            return;
        }

        let mut attempt = 0u32;
        loop {
            match self.apply_data(&task) {
                Ok(bucket) => {
                    self.note_uncommitted(bucket, task.id);
                    return;
                }
                Err(e) if is_permanent(&e) => {
                    error!(task = %task.id, "task failed permanently: {e}");
                    self.complete_data_task(task.id);
                    return;
                }
                Err(e @ EngineError::ResourceExhausted(_)) => {
                    // Operator action required; the task stays durable.
                    error!(task = %task.id, "task needs operator action, left in batch: {e}");
                    return;
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.shared.cfg.task_retry_count {
                        error!(task = %task.id, "task left in batch for replay: {e}");
                        return;
                    }
                    warn!(task = %task.id, attempt, "task failed, retrying: {e}");
                    std::thread::sleep(RETRY_SLEEP);
                }
            }
        }
    }

    fn dispatch_management(&mut self, task: Task) {
        if let Err(e) = self.apply_management(&task) {
            error!(task = %task.id, kind = task.payload.kind(), "management task failed: {e}");
        }
        if let Err(e) = self.shared.queue.remove_from_input(task.id) {
            error!(task = %task.id, "completing management task failed: {e}");
        }
    }

    // ── Data tasks ────────────────────────────────────────────────────────────

    /// Apply ADD or REMOVE to its shard, returning the target bucket.
    fn apply_data(&mut self, task: &Task) -> Result<i64, EngineError> {
        match &task.payload {
            TaskPayload::Add {
                doc_id,
                timestamp,
                body_text,
                locale,
                attrs,
            } => self.apply_add(doc_id, *timestamp, body_text, locale, attrs.as_deref()),
            TaskPayload::Remove { doc_id, timestamp } => self.apply_remove(doc_id, *timestamp),
            other => Err(EngineError::Task(format!(
                "payload {} routed to data partition",
                other.kind()
            ))),
        }
    }

    fn apply_add(
        &mut self,
        doc_id: &str,
        timestamp: i64,
        body_text: &str,
        locale: &str,
        attrs: Option<&str>,
    ) -> Result<i64, EngineError> {
        let cfg = self.shared.cfg.clone();
        let bucket = cfg.bucket_for(timestamp);

        // An external id may live in at most one shard.
        for shard in self.shared.shards_desc() {
            if shard.bucket_ts() != bucket && shard.contains_external_id(doc_id)? {
                return Err(EngineError::Config(format!(
                    "document '{doc_id}' already exists in shard {}",
                    shard.bucket_ts()
                )));
            }
        }

        let shard = self.get_or_create_shard(bucket)?;
        let tokens = shard::prepare_document_tokens(
            body_text,
            locale,
            shard.record_positions(),
            cfg.max_document_token_count,
        );
        let internal_id =
            shard.add_document(&cfg, doc_id, &tokens, body_text, locale, attrs)?;
        debug!(%doc_id, bucket, internal_id, "document indexed");
        Ok(bucket)
    }

    fn apply_remove(&mut self, doc_id: &str, timestamp: i64) -> Result<i64, EngineError> {
        let bucket = self.shared.cfg.bucket_for(timestamp);
        let Some(shard) = self.shared.shard(bucket) else {
            debug!(%doc_id, bucket, "remove for absent shard ignored");
            return Ok(bucket);
        };
        let removed = shard.remove_document(doc_id)?;
        debug!(%doc_id, bucket, removed, "document removal applied");
        Ok(bucket)
    }

    // ── Management tasks ──────────────────────────────────────────────────────

    fn apply_management(&mut self, task: &Task) -> Result<(), EngineError> {
        match &task.payload {
            TaskPayload::Sync {} => {
                self.commit_all_shards();
                Ok(())
            }
            TaskPayload::Optimize { target_timestamp } => self.apply_optimize(*target_timestamp),
            TaskPayload::Reserve { documents } => self.apply_reserve(documents),
            TaskPayload::Reconstruct {
                target_timestamp,
                new_initial_id,
                use_external_id,
            } => self.apply_reconstruct(*target_timestamp, *new_initial_id, *use_external_id),
            TaskPayload::DropShard { target_timestamp } => {
                self.apply_drop_shard(*target_timestamp)
            }
            other => Err(EngineError::Task(format!(
                "payload {} routed to management partition",
                other.kind()
            ))),
        }
    }

    /// Flush, FTS-optimize, checkpoint, vacuum. Best-effort: each step is
    /// logged on failure and the rest still run.
    fn apply_optimize(&mut self, target_timestamp: i64) -> Result<(), EngineError> {
        let bucket = self.shared.cfg.bucket_for(target_timestamp);
        let Some(shard) = self.shared.shard(bucket) else {
            return Err(EngineError::NotFound(format!("shard {bucket}")));
        };

        self.commit_shard(&shard);
        if let Err(e) = shard.optimize_index() {
            warn!(bucket, "fts optimize failed: {e}");
        }
        if let Err(e) = shard.checkpoint_truncate() {
            warn!(bucket, "wal checkpoint failed: {e}");
        }
        if let Err(e) = shard.vacuum() {
            warn!(bucket, "vacuum failed: {e}");
        }
        info!(bucket, "shard optimized");
        Ok(())
    }

    fn apply_reserve(
        &mut self,
        documents: &[super::task::ReserveDocument],
    ) -> Result<(), EngineError> {
        let cfg = self.shared.cfg.clone();
        let mut by_bucket: BTreeMap<i64, Vec<String>> = BTreeMap::new();
        for doc in documents {
            by_bucket
                .entry(cfg.bucket_for(doc.timestamp))
                .or_default()
                .push(doc.id.clone());
        }

        for (bucket, ids) in by_bucket {
            let shard = self.get_or_create_shard(bucket)?;
            shard.reserve_ids(&cfg, &ids)?;
            // reserve_ids commits the shard; complete any data tasks that
            // were riding the transaction it closed.
            self.finish_committed(bucket);
            info!(bucket, count = ids.len(), "ids reserved");
        }
        Ok(())
    }

    fn apply_drop_shard(&mut self, target_timestamp: i64) -> Result<(), EngineError> {
        let bucket = self.shared.cfg.bucket_for(target_timestamp);

        if let Some(shard) = self.shared.remove_shard(bucket) {
            // Data tasks still riding the open transaction die with the
            // shard; complete them so they are not replayed into a fresh
            // file on restart.
            self.finish_committed(bucket);
            shard.close();
        } else if !self.shared.forget_unhealthy(bucket) {
            return Err(EngineError::NotFound(format!("shard {bucket}")));
        }

        self.shared.files.delete_shard_files(bucket)?;
        info!(bucket, "shard dropped");
        self.refresh_generations();
        Ok(())
    }

    /// Rebuild a shard into a sibling temp file with fresh descending
    /// numbering, then atomically swap it in. On failure the temp set is
    /// deleted and the source stays untouched.
    fn apply_reconstruct(
        &mut self,
        target_timestamp: i64,
        new_initial_id: Option<i64>,
        use_external_id: bool,
    ) -> Result<(), EngineError> {
        let cfg = self.shared.cfg.clone();
        let bucket = cfg.bucket_for(target_timestamp);
        let Some(shard) = self.shared.shard(bucket) else {
            return Err(EngineError::NotFound(format!("shard {bucket}")));
        };
        if !shard.record_contents() {
            return Err(EngineError::Config(format!(
                "shard {bucket} is contentless; its tokens cannot be read back for a rebuild"
            )));
        }

        self.commit_shard(&shard);

        let initial_id = new_initial_id.unwrap_or(RECONSTRUCT_DEFAULT_INITIAL_ID);
        let source_path = self.shared.files.shard_path(bucket);
        let temp_path = self.shared.files.temp_shard_path(bucket);
        self.shared.files.delete_temp_files(bucket)?;

        let built = build_reconstructed(
            &cfg,
            &source_path,
            &temp_path,
            initial_id,
            use_external_id,
        );
        if let Err(e) = built {
            if let Err(del) = self.shared.files.delete_temp_files(bucket) {
                warn!(bucket, "temp cleanup after failed rebuild: {del}");
            }
            return Err(e);
        }

        // Swap: close the source, clear its WAL sidecars, rename the temp
        // over it, and re-open. Searches holding the old shard keep reading
        // their open file handles until they finish.
        let removed = self.shared.remove_shard(bucket);
        if let Some(old) = removed {
            old.close();
        }
        remove_sidecars(&source_path)?;
        std::fs::rename(&temp_path, &source_path)?;
        remove_sidecars(&temp_path)?;

        let generation = self
            .shared
            .latest_bucket()
            .map(|latest| cfg.generation(bucket, latest.max(bucket)))
            .unwrap_or(0);
        let reopened = Arc::new(Shard::open(&cfg, &source_path, bucket, generation)?);
        self.shared.insert_shard(reopened);
        self.refresh_generations();
        info!(bucket, initial_id, "shard reconstructed");
        Ok(())
    }

    // ── Shard lifecycle ───────────────────────────────────────────────────────

    fn get_or_create_shard(&mut self, bucket: i64) -> Result<Arc<Shard>, EngineError> {
        if let Some(shard) = self.shared.shard(bucket) {
            return Ok(shard);
        }

        let cfg = &self.shared.cfg;
        let previous_latest = self.shared.latest_bucket();
        let generation = match previous_latest {
            Some(latest) if bucket < latest => cfg.generation(bucket, latest),
            _ => 0,
        };

        let path = self.shared.files.shard_path(bucket);
        let shard = Arc::new(Shard::open(cfg, &path, bucket, generation)?);
        self.shared.insert_shard(shard.clone());
        info!(index = %cfg.name, bucket, generation, "shard created");

        // A strictly newer bucket becomes the hot shard; the outgoing hot is
        // demoted and scheduled for background optimization.
        if previous_latest.is_none_or(|latest| bucket > latest) {
            if let Some(old_hot) = previous_latest {
                self.refresh_generations();
                match self
                    .shared
                    .queue
                    .enqueue(&TaskPayload::Optimize { target_timestamp: old_hot })
                {
                    Ok(id) => debug!(bucket = old_hot, task = %id, "demoted shard queued for optimization"),
                    Err(e) => warn!(bucket = old_hot, "queueing demotion optimize failed: {e}"),
                }
            }
        }

        Ok(shard)
    }

    /// Re-apply per-generation tuning to every shard after the newest bucket
    /// changed.
    fn refresh_generations(&self) {
        let cfg = &self.shared.cfg;
        let Some(latest) = self.shared.latest_bucket() else {
            return;
        };
        for shard in self.shared.shards_desc() {
            let generation = cfg.generation(shard.bucket_ts(), latest);
            if let Err(e) = shard.set_generation(cfg, generation) {
                warn!(bucket = shard.bucket_ts(), generation, "retune failed: {e}");
            }
        }
    }

    // ── Commit bookkeeping ────────────────────────────────────────────────────

    fn note_uncommitted(&mut self, bucket: i64, id: TaskId) {
        self.uncommitted.entry(bucket).or_default().push(id);
    }

    /// Commit shards whose open transaction crossed the update-count or age
    /// threshold; complete the data tasks that rode in them.
    fn auto_commit_pass(&mut self) {
        let cfg = self.shared.cfg.clone();
        for shard in self.shared.shards_desc() {
            match shard.commit_if_needed(&cfg) {
                Ok(true) => self.finish_committed(shard.bucket_ts()),
                Ok(false) => {}
                Err(e) => warn!(bucket = shard.bucket_ts(), "auto-commit failed: {e}"),
            }
        }
    }

    /// SYNC barrier: commit every open transaction unconditionally.
    fn commit_all_shards(&mut self) {
        for shard in self.shared.shards_desc() {
            self.commit_shard(&shard);
        }
    }

    fn commit_shard(&mut self, shard: &Arc<Shard>) {
        match shard.force_commit() {
            Ok(()) => self.finish_committed(shard.bucket_ts()),
            Err(e) => warn!(bucket = shard.bucket_ts(), "commit failed: {e}"),
        }
    }

    /// A shard committed: its data tasks are durable, complete them.
    fn finish_committed(&mut self, bucket: i64) {
        let Some(ids) = self.uncommitted.remove(&bucket) else {
            return;
        };
        for id in ids {
            self.complete_data_task(id);
        }
        self.shared.notify_completion();
    }

    fn complete_data_task(&self, id: TaskId) {
        if let Err(e) = self.shared.queue.remove_from_batch(id) {
            error!(task = %id, "completing data task failed: {e}");
        }
    }

    // ── Shutdown ──────────────────────────────────────────────────────────────

    /// Let the current task finish (it already has), commit open
    /// transactions, and close readers then writers with a truncating WAL
    /// checkpoint.
    fn shutdown_flush(&mut self) {
        info!(index = %self.shared.cfg.name, "worker stopping, flushing shards");
        self.commit_all_shards();
        for shard in self.shared.shards_desc() {
            shard.close();
        }
        self.shared.notify_completion();
    }
}

/// Permanent failures: retrying or replaying cannot succeed, the task
/// completes as failed.
fn is_permanent(e: &EngineError) -> bool {
    matches!(e, EngineError::Config(_) | EngineError::Task(_))
}

fn remove_sidecars(db_path: &std::path::Path) -> Result<(), EngineError> {
    for suffix in ["-wal", "-shm"] {
        let mut s = db_path.as_os_str().to_os_string();
        s.push(suffix);
        match std::fs::remove_file(std::path::PathBuf::from(s)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Copy `(external_id, tokens, attrs)` out of the source shard into a fresh
/// temp file with descending ids starting below `initial_id`, in batches.
/// Reserved ids (no `docs` row) are carried across as bare `id_tuples` rows.
fn build_reconstructed(
    cfg: &crate::config::IndexConfig,
    source_path: &std::path::Path,
    temp_path: &std::path::Path,
    initial_id: i64,
    use_external_id: bool,
) -> Result<(), EngineError> {
    let source = Connection::open_with_flags(source_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;

    let mut dest = Connection::open(temp_path)?;
    dest.pragma_update(None, "page_size", cfg.page_size)?;
    dest.pragma_update(None, "journal_mode", "WAL")?;
    dest.pragma_update(None, "synchronous", "NORMAL")?;
    dest.pragma_update(None, "busy_timeout", 5000)?;
    shard::ensure_schema(&dest, cfg.record_positions, cfg.record_contents)?;

    let order = if use_external_id {
        "ORDER BY t.external_id ASC"
    } else {
        "ORDER BY t.internal_id DESC"
    };
    let select = format!(
        "SELECT t.external_id, d.tokens, a.attrs
         FROM id_tuples t
         LEFT JOIN docs d ON d.rowid = t.internal_id
         LEFT JOIN extra_attrs a ON a.external_id = t.external_id
         {order} LIMIT ?1 OFFSET ?2"
    );

    let mut next_id = initial_id;
    let mut offset: i64 = 0;
    loop {
        let rows: Vec<(String, Option<String>, Option<String>)> = {
            let mut stmt = source.prepare(&select)?;
            let mapped = stmt.query_map(
                params![RECONSTRUCT_BATCH_ROWS as i64, offset],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            mapped.collect::<Result<_, _>>()?
        };
        if rows.is_empty() {
            break;
        }
        offset += rows.len() as i64;

        let tx = dest.transaction()?;
        for (external_id, tokens, attrs) in rows {
            next_id -= 1;
            if next_id <= 0 {
                return Err(EngineError::ResourceExhausted(format!(
                    "rebuild numbering from {initial_id} ran out of ids"
                )));
            }
            tx.execute(
                "INSERT INTO id_tuples (internal_id, external_id) VALUES (?1, ?2)",
                params![next_id, external_id],
            )?;
            if let Some(tokens) = tokens {
                tx.execute(
                    "INSERT INTO docs (rowid, tokens) VALUES (?1, ?2)",
                    params![next_id, tokens],
                )?;
            }
            if let Some(attrs) = attrs {
                tx.execute(
                    "INSERT OR REPLACE INTO extra_attrs (external_id, attrs) VALUES (?1, ?2)",
                    params![external_id, attrs],
                )?;
            }
        }
        tx.commit()?;
    }

    dest.execute("INSERT INTO docs (docs) VALUES ('optimize')", [])?;
    dest.execute_batch("VACUUM")?;
    dest.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
    Ok(())
}
