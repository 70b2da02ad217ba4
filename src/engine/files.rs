//! Shard file layout: path conventions, discovery, statistics, deletion.
//!
//! All files for one index live flat in `base_dir`:
//!
//! ```text
//! <prefix>-<bucketTs>.db        shard store
//! <prefix>-<bucketTs>.db-wal
//! <prefix>-<bucketTs>.db-shm
//! <prefix>-common.db            task queue
//! ```
//!
//! Only names matching `<prefix>-<digits>.db` are treated as shards.

use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags};
use tracing::warn;

use crate::error::EngineError;

pub struct IndexFileManager {
    base_dir: PathBuf,
    prefix: String,
}

/// One discovered shard file.
#[derive(Debug, Clone)]
pub struct ShardFileInfo {
    pub bucket_ts: i64,
    pub path: PathBuf,
    /// `false` when the file exists but its schema cannot be opened. Such
    /// files are retained on disk and excluded from search.
    pub healthy: bool,
}

/// On-disk statistics for one shard.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardStats {
    pub bucket_ts: i64,
    pub healthy: bool,
    pub file_size_bytes: u64,
    pub wal_size_bytes: u64,
    /// `page_size * page_count` as reported by the store itself.
    pub page_bytes: i64,
    pub document_count: i64,
    /// FTS payload sizes by shadow table; absent tables report `null`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fts_data_bytes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fts_docsize_bytes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fts_content_bytes: Option<i64>,
}

impl IndexFileManager {
    pub fn new(base_dir: &Path, prefix: &str) -> Self {
        Self {
            base_dir: base_dir.to_path_buf(),
            prefix: prefix.to_string(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path of the shard owning `bucket_ts`.
    pub fn shard_path(&self, bucket_ts: i64) -> PathBuf {
        self.base_dir.join(format!("{}-{}.db", self.prefix, bucket_ts))
    }

    /// Sibling temp path used while a shard is being rebuilt. The `.new`
    /// suffix keeps it invisible to shard discovery.
    pub fn temp_shard_path(&self, bucket_ts: i64) -> PathBuf {
        self.base_dir.join(format!("{}-{}.db.new", self.prefix, bucket_ts))
    }

    /// Path of the shared task database.
    pub fn common_path(&self) -> PathBuf {
        self.base_dir.join(format!("{}-common.db", self.prefix))
    }

    /// Enumerate shard files, sorted by bucket timestamp descending
    /// (newest first). Files that exist but cannot be opened are reported
    /// with `healthy: false` and retained.
    pub fn list_shard_files(&self) -> Result<Vec<ShardFileInfo>, EngineError> {
        let mut shards = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(bucket_ts) = self.parse_shard_name(name) else {
                continue;
            };
            let path = entry.path();
            let healthy = match probe_schema(&path) {
                Ok(()) => true,
                Err(e) => {
                    warn!(%bucket_ts, path = %path.display(), "shard unhealthy: {e}");
                    false
                }
            };
            shards.push(ShardFileInfo { bucket_ts, path, healthy });
        }
        shards.sort_by(|a, b| b.bucket_ts.cmp(&a.bucket_ts));
        Ok(shards)
    }

    /// Delete a shard's `{.db, -wal, -shm}` triplet. The WAL and shm files
    /// may legitimately be absent.
    pub fn delete_shard_files(&self, bucket_ts: i64) -> Result<(), EngineError> {
        delete_file_set(&self.shard_path(bucket_ts))
    }

    /// Delete a reconstruct temp file set, if present.
    pub fn delete_temp_files(&self, bucket_ts: i64) -> Result<(), EngineError> {
        let path = self.temp_shard_path(bucket_ts);
        if path.exists() {
            delete_file_set(&path)
        } else {
            Ok(())
        }
    }

    /// Gather on-disk statistics for one shard.
    pub fn stats(&self, bucket_ts: i64) -> Result<ShardStats, EngineError> {
        let path = self.shard_path(bucket_ts);
        if !path.exists() {
            return Err(EngineError::NotFound(format!("shard {bucket_ts}")));
        }

        let file_size_bytes = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let wal_size_bytes = fs::metadata(wal_path(&path)).map(|m| m.len()).unwrap_or(0);

        let conn = match Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY) {
            Ok(conn) => conn,
            Err(_) => {
                return Ok(ShardStats {
                    bucket_ts,
                    healthy: false,
                    file_size_bytes,
                    wal_size_bytes,
                    page_bytes: 0,
                    document_count: 0,
                    fts_data_bytes: None,
                    fts_docsize_bytes: None,
                    fts_content_bytes: None,
                });
            }
        };

        let page_size: i64 = conn
            .query_row("PRAGMA page_size", [], |row| row.get(0))
            .unwrap_or(0);
        let page_count: i64 = conn
            .query_row("PRAGMA page_count", [], |row| row.get(0))
            .unwrap_or(0);
        let document_count = conn
            .query_row("SELECT COUNT(*) FROM id_tuples", [], |row| row.get(0))
            .unwrap_or(0);
        let healthy = probe_schema_conn(&conn).is_ok();

        Ok(ShardStats {
            bucket_ts,
            healthy,
            file_size_bytes,
            wal_size_bytes,
            page_bytes: page_size * page_count,
            document_count,
            fts_data_bytes: payload_bytes(&conn, "docs_data"),
            fts_docsize_bytes: payload_bytes(&conn, "docs_docsize"),
            fts_content_bytes: payload_bytes(&conn, "docs_content"),
        })
    }

    /// Parse `<prefix>-<digits>.db` into its bucket timestamp.
    fn parse_shard_name(&self, name: &str) -> Option<i64> {
        let rest = name.strip_prefix(&self.prefix)?.strip_prefix('-')?;
        let digits = rest.strip_suffix(".db")?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }
}

fn wal_path(db_path: &Path) -> PathBuf {
    let mut s = db_path.as_os_str().to_os_string();
    s.push("-wal");
    PathBuf::from(s)
}

fn shm_path(db_path: &Path) -> PathBuf {
    let mut s = db_path.as_os_str().to_os_string();
    s.push("-shm");
    PathBuf::from(s)
}

fn delete_file_set(db_path: &Path) -> Result<(), EngineError> {
    fs::remove_file(db_path)?;
    for sidecar in [wal_path(db_path), shm_path(db_path)] {
        match fs::remove_file(&sidecar) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Open read-only and touch the core tables. Any failure marks the shard
/// unhealthy without touching the file.
fn probe_schema(path: &Path) -> Result<(), EngineError> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    probe_schema_conn(&conn)
}

fn probe_schema_conn(conn: &Connection) -> Result<(), EngineError> {
    conn.query_row("SELECT COUNT(*) FROM id_tuples", [], |row| row.get::<_, i64>(0))?;
    conn.query_row("SELECT COUNT(*) FROM extra_attrs", [], |row| row.get::<_, i64>(0))?;
    Ok(())
}

/// Total payload bytes of one FTS shadow table, or `None` when the table
/// does not exist (e.g. `docs_content` on contentless shards).
fn payload_bytes(conn: &Connection, table: &str) -> Option<i64> {
    let column = match table {
        "docs_data" => "block",
        "docs_docsize" => "sz",
        "docs_content" => "c0",
        _ => return None,
    };
    conn.query_row(
        &format!("SELECT COALESCE(SUM(LENGTH({column})), 0) FROM {table}"),
        [],
        |row| row.get(0),
    )
    .ok()
}
