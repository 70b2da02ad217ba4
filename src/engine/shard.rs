//! One time-bucket shard: a writer connection, a pool of read-only
//! connections, and the document schema.
//!
//! Every mutation goes through the single writer, owned by the worker. The
//! first mutation on an idle writer opens a transaction; the worker decides
//! when to commit (update count or age, see the worker's auto-commit pass).
//! Read-only connections are fanned out to searches by round-robin; when a
//! shard has no readers, or the writer is quiet, reads go through the writer
//! connection so they observe the open transaction.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use tracing::{debug, warn};

use crate::config::IndexConfig;
use crate::error::EngineError;

use super::tokenizer;

/// Reads routed to the writer switch back to a reader once reads arrive
/// more often than this.
const READ_REUSE_WINDOW: Duration = Duration::from_millis(100);

pub struct Shard {
    bucket_ts: i64,
    path: PathBuf,
    record_positions: bool,
    record_contents: bool,
    writer: Mutex<ShardWriter>,
    readers: Mutex<ReaderPool>,
    last_read_at: Mutex<Option<Instant>>,
}

struct ShardWriter {
    conn: Connection,
    pending_tx_count: u32,
    tx_started_at: Option<Instant>,
    committing: bool,
}

struct ReaderPool {
    connections: Vec<Arc<Mutex<Connection>>>,
    next: usize,
}

impl Shard {
    /// Open (creating if needed) the shard for `bucket_ts` with the tuning
    /// profile of `generation`. Any mutations staged by an interrupted run
    /// are replayed before the shard accepts new writes.
    pub fn open(
        cfg: &IndexConfig,
        path: &Path,
        bucket_ts: i64,
        generation: usize,
    ) -> Result<Self, EngineError> {
        let conn = Connection::open(path)?;
        // Page size must be in place before the first table is created.
        conn.pragma_update(None, "page_size", cfg.page_size)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.pragma_update(None, "journal_size_limit", cfg.journal_size_limit_bytes)?;

        ensure_schema(&conn, cfg.record_positions, cfg.record_contents)?;
        apply_generation_pragmas(&conn, cfg, generation)?;
        set_automerge(&conn, cfg.automerge_for(generation))?;

        let shard = Self {
            bucket_ts,
            path: path.to_path_buf(),
            record_positions: cfg.record_positions,
            record_contents: cfg.record_contents,
            writer: Mutex::new(ShardWriter {
                conn,
                pending_tx_count: 0,
                tx_started_at: None,
                committing: false,
            }),
            readers: Mutex::new(ReaderPool {
                connections: Vec::new(),
                next: 0,
            }),
            last_read_at: Mutex::new(None),
        };

        shard.replay_staged_mutations(cfg)?;
        shard.resize_readers(cfg, generation)?;
        Ok(shard)
    }

    pub fn bucket_ts(&self) -> i64 {
        self.bucket_ts
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_positions(&self) -> bool {
        self.record_positions
    }

    pub fn record_contents(&self) -> bool {
        self.record_contents
    }

    // ── Mutations (worker only) ───────────────────────────────────────────────

    /// Insert or update one document. Returns the internal rowid used.
    ///
    /// `tokens` must already be tokenized; position-recording shards store
    /// them in order, positionless shards store the deduplicated sorted
    /// form. Contentless shards reject updates of an existing external id.
    pub fn add_document(
        &self,
        cfg: &IndexConfig,
        doc_id: &str,
        tokens: &[String],
        body_text: &str,
        locale: &str,
        attrs: Option<&str>,
    ) -> Result<i64, EngineError> {
        let mut writer = self.lock_writer();
        let existing = lookup_internal_id(&writer.conn, doc_id)?;

        if existing.is_some() && !self.record_contents {
            return Err(EngineError::Config(format!(
                "contentless shard {} cannot update existing document '{doc_id}'",
                self.bucket_ts
            )));
        }

        begin_if_idle(&mut writer)?;

        let internal_id = match existing {
            Some(id) => id,
            None => allocate_internal_id(&writer.conn, cfg.initial_document_id)?,
        };

        let joined = tokens.join(" ");
        if self.record_contents {
            writer.conn.execute(
                "INSERT OR REPLACE INTO docs (rowid, tokens) VALUES (?1, ?2)",
                params![internal_id, joined],
            )?;
        } else {
            writer.conn.execute(
                "INSERT INTO docs (rowid, tokens) VALUES (?1, ?2)",
                params![internal_id, joined],
            )?;
        }

        if existing.is_none() {
            writer.conn.execute(
                "INSERT INTO id_tuples (internal_id, external_id) VALUES (?1, ?2)",
                params![internal_id, doc_id],
            )?;
        }

        if let Some(attrs) = attrs {
            writer.conn.execute(
                "INSERT OR REPLACE INTO extra_attrs (external_id, attrs) VALUES (?1, ?2)",
                params![doc_id, attrs],
            )?;
        }

        writer.conn.execute(
            "INSERT INTO batch_tasks (doc_id, body, locale, attrs, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![doc_id, body_text, locale, attrs, now_secs()],
        )?;

        writer.pending_tx_count += 1;
        Ok(internal_id)
    }

    /// Remove one document, if present. Forbidden on contentless shards.
    pub fn remove_document(&self, doc_id: &str) -> Result<bool, EngineError> {
        if !self.record_contents {
            return Err(EngineError::Config(format!(
                "contentless shard {} cannot remove documents",
                self.bucket_ts
            )));
        }

        let mut writer = self.lock_writer();
        let Some(internal_id) = lookup_internal_id(&writer.conn, doc_id)? else {
            return Ok(false);
        };

        begin_if_idle(&mut writer)?;
        writer
            .conn
            .execute("DELETE FROM docs WHERE rowid = ?1", params![internal_id])?;
        writer.conn.execute(
            "DELETE FROM id_tuples WHERE internal_id = ?1",
            params![internal_id],
        )?;
        writer.conn.execute(
            "DELETE FROM extra_attrs WHERE external_id = ?1",
            params![doc_id],
        )?;
        writer.conn.execute(
            "INSERT INTO batch_tasks (doc_id, body, locale, attrs, created_at)
             VALUES (?1, NULL, NULL, NULL, ?2)",
            params![doc_id, now_secs()],
        )?;

        writer.pending_tx_count += 1;
        Ok(true)
    }

    /// Allocate internal ids for the given external ids that do not exist
    /// yet, without writing any document content, then commit.
    pub fn reserve_ids(&self, cfg: &IndexConfig, doc_ids: &[String]) -> Result<(), EngineError> {
        let mut writer = self.lock_writer();
        begin_if_idle(&mut writer)?;
        for doc_id in doc_ids {
            if lookup_internal_id(&writer.conn, doc_id)?.is_some() {
                continue;
            }
            let internal_id = allocate_internal_id(&writer.conn, cfg.initial_document_id)?;
            writer.conn.execute(
                "INSERT INTO id_tuples (internal_id, external_id) VALUES (?1, ?2)",
                params![internal_id, doc_id],
            )?;
        }
        commit_locked(&mut writer)
    }

    /// `true` when the external id exists in this shard (sees the writer's
    /// open transaction).
    pub fn contains_external_id(&self, doc_id: &str) -> Result<bool, EngineError> {
        let writer = self.lock_writer();
        Ok(lookup_internal_id(&writer.conn, doc_id)?.is_some())
    }

    // ── Commit control ────────────────────────────────────────────────────────

    pub fn has_open_tx(&self) -> bool {
        self.lock_writer().tx_started_at.is_some()
    }

    pub fn pending_tx_count(&self) -> u32 {
        self.lock_writer().pending_tx_count
    }

    /// Commit when the open transaction crossed the update-count or age
    /// threshold. Returns `true` when a commit happened.
    pub fn commit_if_needed(&self, cfg: &IndexConfig) -> Result<bool, EngineError> {
        let mut writer = self.lock_writer();
        if writer.committing || writer.pending_tx_count == 0 {
            return Ok(false);
        }
        let Some(started_at) = writer.tx_started_at else {
            return Ok(false);
        };
        let due = writer.pending_tx_count >= cfg.auto_commit_update_count
            || started_at.elapsed().as_secs() >= cfg.auto_commit_duration_seconds;
        if !due {
            return Ok(false);
        }
        commit_locked(&mut writer)?;
        Ok(true)
    }

    /// Commit any open transaction unconditionally.
    pub fn force_commit(&self) -> Result<(), EngineError> {
        let mut writer = self.lock_writer();
        commit_locked(&mut writer)
    }

    // ── Maintenance ───────────────────────────────────────────────────────────

    /// Run the FTS `optimize` command on the writer connection.
    pub fn optimize_index(&self) -> Result<(), EngineError> {
        let writer = self.lock_writer();
        writer
            .conn
            .execute("INSERT INTO docs (docs) VALUES ('optimize')", [])?;
        Ok(())
    }

    /// Checkpoint the WAL into the main file and truncate it.
    pub fn checkpoint_truncate(&self) -> Result<(), EngineError> {
        let writer = self.lock_writer();
        writer
            .conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }

    /// VACUUM the shard file. The open transaction, if any, is committed
    /// first; VACUUM cannot run inside one.
    pub fn vacuum(&self) -> Result<(), EngineError> {
        let mut writer = self.lock_writer();
        commit_locked(&mut writer)?;
        writer.conn.execute_batch("VACUUM")?;
        Ok(())
    }

    /// Re-apply the tuning profile after a promotion or demotion and resize
    /// the reader pool to the generation's connection count.
    pub fn set_generation(&self, cfg: &IndexConfig, generation: usize) -> Result<(), EngineError> {
        {
            let writer = self.lock_writer();
            apply_generation_pragmas(&writer.conn, cfg, generation)?;
            set_automerge(&writer.conn, cfg.automerge_for(generation))?;
        }
        self.resize_readers(cfg, generation)
    }

    /// Commit, drop the reader pool, and checkpoint the WAL. The shard must
    /// not be used for mutations afterwards.
    pub fn close(&self) {
        {
            let mut writer = self.lock_writer();
            if let Err(e) = commit_locked(&mut writer) {
                warn!(bucket_ts = self.bucket_ts, "commit during close failed: {e}");
            }
        }
        self.lock_readers().connections.clear();
        if let Err(e) = self.checkpoint_truncate() {
            debug!(bucket_ts = self.bucket_ts, "checkpoint during close failed: {e}");
        }
    }

    // ── Read path ─────────────────────────────────────────────────────────────

    /// Run `f` on a read connection chosen by the routing rule: a round-robin
    /// reader when the pool is non-empty and either the writer has an open
    /// transaction (or is busy applying one) or the previous read on this
    /// shard was under 100 ms ago; the writer connection otherwise.
    pub fn with_read_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let recent = {
            let mut last = match self.last_read_at.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let recent = last.is_some_and(|at| at.elapsed() < READ_REUSE_WINDOW);
            *last = Some(Instant::now());
            recent
        };

        let reader = {
            let mut pool = self.lock_readers();
            if pool.connections.is_empty() {
                None
            } else if self.writer_engaged() || recent {
                let picked = pool.connections[pool.next % pool.connections.len()].clone();
                pool.next = pool.next.wrapping_add(1);
                Some(picked)
            } else {
                None
            }
        };

        match reader {
            Some(conn) => {
                let conn = match conn.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                f(&conn)
            }
            None => {
                let writer = self.lock_writer();
                f(&writer.conn)
            }
        }
    }

    /// Writer has an open transaction, or is locked by a mutation in flight.
    fn writer_engaged(&self) -> bool {
        match self.writer.try_lock() {
            Ok(writer) => writer.tx_started_at.is_some(),
            Err(_) => true,
        }
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn resize_readers(&self, cfg: &IndexConfig, generation: usize) -> Result<(), EngineError> {
        let want = cfg.read_connections_for(generation);
        let mut pool = self.lock_readers();
        pool.connections.truncate(want);
        for conn in &pool.connections {
            let conn = match conn.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            apply_generation_pragmas(&conn, cfg, generation)?;
        }
        while pool.connections.len() < want {
            let conn =
                Connection::open_with_flags(&self.path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
            conn.pragma_update(None, "busy_timeout", 5000)?;
            apply_generation_pragmas(&conn, cfg, generation)?;
            pool.connections.push(Arc::new(Mutex::new(conn)));
        }
        Ok(())
    }

    /// Replay mutations left in the shard-local `batch_tasks` staging table
    /// by an interrupted run, then purge it. Replays are idempotent on the
    /// external id.
    fn replay_staged_mutations(&self, cfg: &IndexConfig) -> Result<(), EngineError> {
        struct Staged {
            doc_id: String,
            body: Option<String>,
            locale: Option<String>,
            attrs: Option<String>,
        }

        let staged: Vec<Staged> = {
            let writer = self.lock_writer();
            let mut stmt = writer.conn.prepare(
                "SELECT doc_id, body, locale, attrs FROM batch_tasks ORDER BY id ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(Staged {
                    doc_id: row.get(0)?,
                    body: row.get(1)?,
                    locale: row.get(2)?,
                    attrs: row.get(3)?,
                })
            })?;
            rows.collect::<Result<_, _>>()?
        };

        if staged.is_empty() {
            return Ok(());
        }
        debug!(
            bucket_ts = self.bucket_ts,
            count = staged.len(),
            "replaying staged shard mutations"
        );

        for row in staged {
            match row.body {
                Some(body) => {
                    let locale = row.locale.as_deref().unwrap_or(&cfg.default_locale);
                    let tokens = prepare_document_tokens(
                        &body,
                        locale,
                        self.record_positions,
                        cfg.max_document_token_count,
                    );
                    self.add_document(
                        cfg,
                        &row.doc_id,
                        &tokens,
                        &body,
                        locale,
                        row.attrs.as_deref(),
                    )?;
                }
                None => {
                    self.remove_document(&row.doc_id)?;
                }
            }
        }

        let mut writer = self.lock_writer();
        commit_locked(&mut writer)
    }

    fn lock_writer(&self) -> MutexGuard<'_, ShardWriter> {
        match self.writer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_readers(&self) -> MutexGuard<'_, ReaderPool> {
        match self.readers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Tokenize a document body the way the shard stores it: ordered (and
/// truncated) when positions are recorded, deduplicated and sorted when not.
pub fn prepare_document_tokens(
    body_text: &str,
    locale: &str,
    record_positions: bool,
    max_tokens: usize,
) -> Vec<String> {
    let mut tokens = tokenizer::tokenize(body_text, locale);
    if record_positions {
        tokens.truncate(max_tokens);
        tokens
    } else {
        tokenizer::dedup_tokens(tokens, max_tokens)
    }
}

// ── Schema and pragmas (shared with reconstruct) ──────────────────────────────

/// Create the shard schema on a fresh connection.
pub fn ensure_schema(
    conn: &Connection,
    record_positions: bool,
    record_contents: bool,
) -> Result<(), EngineError> {
    let detail = if record_positions { "full" } else { "none" };
    let content = if record_contents { "" } else { ", content = ''" };
    conn.execute_batch(&format!(
        "
        CREATE TABLE IF NOT EXISTS id_tuples (
            internal_id INTEGER PRIMARY KEY,
            external_id TEXT NOT NULL UNIQUE
        );

        CREATE VIRTUAL TABLE IF NOT EXISTS docs USING fts5(
            tokens,
            tokenize = 'unicode61 categories ''L* N* M* P* S* Co''',
            detail = {detail}{content}
        );

        CREATE TABLE IF NOT EXISTS extra_attrs (
            external_id TEXT PRIMARY KEY,
            attrs TEXT
        );

        CREATE TABLE IF NOT EXISTS batch_tasks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            doc_id TEXT NOT NULL,
            body TEXT,
            locale TEXT,
            attrs TEXT,
            created_at INTEGER NOT NULL
        );
        ",
    ))?;
    Ok(())
}

/// Cache and mmap sizing for a generation; applied to both the writer and
/// every reader.
pub fn apply_generation_pragmas(
    conn: &Connection,
    cfg: &IndexConfig,
    generation: usize,
) -> Result<(), EngineError> {
    // Negative cache_size means KiB rather than pages.
    conn.pragma_update(None, "cache_size", -cfg.cache_kibibytes_for(generation))?;
    conn.pragma_update(None, "mmap_size", cfg.mmap_bytes_for(generation))?;
    Ok(())
}

/// Write the FTS automerge level into the index's config shadow table.
pub fn set_automerge(conn: &Connection, level: i64) -> Result<(), EngineError> {
    conn.execute(
        "INSERT OR REPLACE INTO docs_config (k, v) VALUES ('automerge', ?1)",
        params![level],
    )?;
    Ok(())
}

pub fn lookup_internal_id(conn: &Connection, doc_id: &str) -> Result<Option<i64>, EngineError> {
    let id = conn
        .query_row(
            "SELECT internal_id FROM id_tuples WHERE external_id = ?1",
            params![doc_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

/// Next internal id: one below the smallest allocated id, or one below the
/// initial id for an empty shard. Ids freed by deletion are never reused.
pub fn allocate_internal_id(conn: &Connection, initial_id: i64) -> Result<i64, EngineError> {
    let min: Option<i64> =
        conn.query_row("SELECT MIN(internal_id) FROM id_tuples", [], |row| row.get(0))?;
    let next = min.unwrap_or(initial_id) - 1;
    if next <= 0 {
        return Err(EngineError::ResourceExhausted(format!(
            "no internal ids left below {}",
            min.unwrap_or(initial_id)
        )));
    }
    Ok(next)
}

fn begin_if_idle(writer: &mut ShardWriter) -> Result<(), EngineError> {
    if writer.tx_started_at.is_none() {
        writer.conn.execute_batch("BEGIN IMMEDIATE")?;
        writer.tx_started_at = Some(Instant::now());
    }
    Ok(())
}

fn commit_locked(writer: &mut ShardWriter) -> Result<(), EngineError> {
    if writer.tx_started_at.is_none() {
        return Ok(());
    }
    writer.committing = true;
    let result = (|| {
        writer.conn.execute("DELETE FROM batch_tasks", [])?;
        writer.conn.execute_batch("COMMIT")?;
        Ok(())
    })();
    writer.committing = false;

    match result {
        Ok(()) => {
            writer.pending_tx_count = 0;
            writer.tx_started_at = None;
            Ok(())
        }
        Err(e) => {
            // A failed COMMIT leaves the transaction in an undefined state;
            // roll it back so the writer is usable for the next task.
            let _ = writer.conn.execute_batch("ROLLBACK");
            writer.pending_tx_count = 0;
            writer.tx_started_at = None;
            Err(e)
        }
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
