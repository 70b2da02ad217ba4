//! Durable FIFO task queue backed by `<prefix>-common.db`.
//!
//! Two tables: `input_tasks` holds the pending queue (ascending rowid =
//! FIFO); `batch_tasks` holds data tasks that were claimed but not yet
//! completed, so a crash between claim and completion replays them on the
//! next start. A task lives in exactly one of the two tables; the move is a
//! single transaction, so duplication cannot occur.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use crate::error::EngineError;

use super::task::{Task, TaskId, TaskPartition, TaskPayload};

pub struct TaskQueue {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl TaskQueue {
    /// Open (creating if needed) the shared task database.
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS input_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                partition TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS batch_tasks (
                id INTEGER PRIMARY KEY,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert a task into `input_tasks` and return its prefixed id.
    pub fn enqueue(&self, payload: &TaskPayload) -> Result<TaskId, EngineError> {
        let body = serde_json::to_string(payload)
            .map_err(|e| EngineError::Task(format!("encode task payload: {e}")))?;
        let partition = payload.partition();

        let conn = self.lock();
        conn.execute(
            "INSERT INTO input_tasks (partition, payload, created_at) VALUES (?1, ?2, ?3)",
            params![partition.as_str(), body, now_secs()],
        )?;
        let id = TaskId::new(partition, conn.last_insert_rowid());
        debug!(task = %id, kind = payload.kind(), "task enqueued");
        Ok(id)
    }

    /// Peek the oldest pending task without removing it.
    pub fn fetch_first(&self) -> Result<Option<Task>, EngineError> {
        let conn = self.lock();
        let row: Option<(i64, String, String)> = conn
            .query_row(
                "SELECT id, partition, payload FROM input_tasks ORDER BY id ASC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((number, partition, body)) = row else {
            return Ok(None);
        };
        let partition = decode_partition(&partition, number)?;
        let payload = decode_payload(&body, number)?;
        Ok(Some(Task {
            id: TaskId::new(partition, number),
            payload,
        }))
    }

    /// Atomically move a claimed data task from `input_tasks` to
    /// `batch_tasks`. Management tasks never enter the batch table.
    pub fn move_to_batch(&self, task: &Task) -> Result<(), EngineError> {
        if task.id.partition != TaskPartition::Data {
            return Err(EngineError::Task(format!(
                "task {} is not a data task; cannot move to batch",
                task.id
            )));
        }
        let body = serde_json::to_string(&task.payload)
            .map_err(|e| EngineError::Task(format!("encode task payload: {e}")))?;

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM input_tasks WHERE id = ?1", params![task.id.number])?;
        tx.execute(
            "INSERT INTO batch_tasks (id, payload, created_at) VALUES (?1, ?2, ?3)",
            params![task.id.number, body, now_secs()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Complete a management task (or discard an unstarted one).
    pub fn remove_from_input(&self, id: TaskId) -> Result<(), EngineError> {
        self.lock()
            .execute("DELETE FROM input_tasks WHERE id = ?1", params![id.number])?;
        Ok(())
    }

    /// Complete a claimed data task.
    pub fn remove_from_batch(&self, id: TaskId) -> Result<(), EngineError> {
        self.lock()
            .execute("DELETE FROM batch_tasks WHERE id = ?1", params![id.number])?;
        Ok(())
    }

    /// Data tasks interrupted by a prior crash, oldest first.
    pub fn pending_batch_tasks(&self) -> Result<Vec<Task>, EngineError> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT id, payload FROM batch_tasks ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut tasks = Vec::new();
        for row in rows {
            let (number, body) = row?;
            tasks.push(Task {
                id: TaskId::new(TaskPartition::Data, number),
                payload: decode_payload(&body, number)?,
            });
        }
        Ok(tasks)
    }

    /// Whether `id` is still present in either table.
    pub fn is_pending(&self, id: TaskId) -> Result<bool, EngineError> {
        let conn = self.lock();
        let in_input: Option<i64> = conn
            .query_row(
                "SELECT id FROM input_tasks WHERE id = ?1 AND partition = ?2",
                params![id.number, id.partition.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if in_input.is_some() {
            return Ok(true);
        }
        if id.partition != TaskPartition::Data {
            return Ok(false);
        }
        let in_batch: Option<i64> = conn
            .query_row(
                "SELECT id FROM batch_tasks WHERE id = ?1",
                params![id.number],
                |row| row.get(0),
            )
            .optional()?;
        Ok(in_batch.is_some())
    }

    /// Number of rows still waiting in `input_tasks`.
    pub fn pending_input_count(&self) -> Result<i64, EngineError> {
        let n: i64 =
            self.lock()
                .query_row("SELECT COUNT(*) FROM input_tasks", [], |row| row.get(0))?;
        Ok(n)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // Lock poisoning would mean a panic inside a queue operation; the
        // connection itself is still usable for the remaining tasks.
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn decode_partition(s: &str, number: i64) -> Result<TaskPartition, EngineError> {
    match s {
        "d" => Ok(TaskPartition::Data),
        "m" => Ok(TaskPartition::Management),
        _ => Err(EngineError::Task(format!(
            "task {number}: unknown partition '{s}'"
        ))),
    }
}

fn decode_payload(body: &str, number: i64) -> Result<TaskPayload, EngineError> {
    serde_json::from_str(body)
        .map_err(|e| EngineError::Task(format!("task {number}: decode payload: {e}")))
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
