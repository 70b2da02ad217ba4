//! Multi-shard read path: `search` and `fetch_documents`.
//!
//! Shards are visited newest-first. Results within a shard come back ordered
//! by ascending rowid, which is newest-insertion-first thanks to descending
//! id allocation; across shards the bucket order provides the time ordering.
//! Per-shard failures are contained: the shard's results are dropped and the
//! walk continues.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::{OptionalExtension, params};
use tracing::warn;

use crate::error::EngineError;

use super::EngineShared;
use super::query::{self, CompiledQuery};
use super::shard::Shard;

/// Parameters of one search call.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub locale: String,
    pub limit: usize,
    pub offset: usize,
    pub timeout: Duration,
}

/// Column selection for [`fetch_documents`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    pub omit_body_text: bool,
    pub omit_attrs: bool,
}

/// One fetched document.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRecord {
    pub id: String,
    pub bucket_ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attrs: Option<String>,
}

/// Execute a search across all healthy shards, newest bucket first.
pub(super) async fn search(
    shared: &Arc<EngineShared>,
    req: SearchRequest,
) -> Result<Vec<String>, EngineError> {
    let cfg = &shared.cfg;
    let compiled = query::make_fts_query(
        &req.query,
        &req.locale,
        cfg.max_query_token_count,
        cfg.record_positions,
    );
    if compiled.fts_query.is_empty() {
        return Err(EngineError::Config(
            "query contains no usable tokens".to_string(),
        ));
    }

    let started = Instant::now();
    let wanted = req.limit.saturating_add(req.offset);
    let mut ordered: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for shard in shared.shards_desc() {
        if ordered.len() >= wanted || started.elapsed() >= req.timeout {
            break;
        }
        let remaining = wanted - ordered.len();
        let want_tokens = !compiled.filtering_phrases.is_empty() && shard.record_contents();

        let fts_query = compiled.fts_query.clone();
        let task_shard = shard.clone();
        let result = tokio::task::spawn_blocking(move || {
            shard_candidates(&task_shard, &fts_query, remaining, want_tokens)
        })
        .await;

        let rows = match result {
            Ok(Ok(rows)) => rows,
            Ok(Err(e)) => {
                warn!(bucket = shard.bucket_ts(), "shard search failed, skipped: {e}");
                continue;
            }
            Err(e) => {
                warn!(bucket = shard.bucket_ts(), "shard search task failed: {e}");
                continue;
            }
        };

        for (external_id, tokens) in rows {
            if !passes_post_filter(&compiled, tokens.as_deref()) {
                continue;
            }
            // Buckets are disjoint so cross-shard duplicates should not
            // occur; the set guards against it anyway.
            if seen.insert(external_id.clone()) {
                ordered.push(external_id);
            }
        }
    }

    Ok(ordered
        .into_iter()
        .skip(req.offset)
        .take(req.limit)
        .collect())
}

/// Candidate rows for one shard. With `want_tokens` the stored token text
/// rides along for pseudo-phrase filtering.
fn shard_candidates(
    shard: &Shard,
    fts_query: &str,
    limit: usize,
    want_tokens: bool,
) -> Result<Vec<(String, Option<String>)>, EngineError> {
    shard.with_read_connection(|conn| {
        if want_tokens {
            let mut stmt = conn.prepare(
                "SELECT t.external_id, docs.tokens
                 FROM docs JOIN id_tuples t ON docs.rowid = t.internal_id
                 WHERE docs MATCH ?1 ORDER BY docs.rowid ASC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![fts_query, limit as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        } else {
            let mut stmt = conn.prepare(
                "SELECT t.external_id
                 FROM docs JOIN id_tuples t ON docs.rowid = t.internal_id
                 WHERE docs MATCH ?1 ORDER BY docs.rowid ASC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![fts_query, limit as i64], |row| {
                Ok((row.get::<_, String>(0)?, None))
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        }
    })
}

/// Pseudo-phrase check: every filtering phrase must appear in-order and
/// contiguous in the stored tokens. Candidates without stored tokens
/// (contentless shards) cannot be filtered and are kept.
fn passes_post_filter(compiled: &CompiledQuery, tokens: Option<&str>) -> bool {
    if compiled.filtering_phrases.is_empty() {
        return true;
    }
    let Some(tokens) = tokens else {
        return true;
    };
    let doc_tokens: Vec<String> = tokens.split_whitespace().map(str::to_string).collect();
    compiled
        .filtering_phrases
        .iter()
        .all(|phrase| query::contains_phrase(&doc_tokens, phrase))
}

/// Fetch documents by external id, preserving the caller's id order.
/// Ids that exist nowhere (or are only reserved, with no content yet) are
/// omitted from the result.
pub(super) async fn fetch_documents(
    shared: &Arc<EngineShared>,
    ids: &[String],
    options: FetchOptions,
) -> Result<Vec<DocumentRecord>, EngineError> {
    let mut found: std::collections::HashMap<String, DocumentRecord> =
        std::collections::HashMap::new();

    for shard in shared.shards_desc() {
        let missing: Vec<String> = ids
            .iter()
            .filter(|id| !found.contains_key(*id))
            .cloned()
            .collect();
        if missing.is_empty() {
            break;
        }

        let task_shard = shard.clone();
        let result = tokio::task::spawn_blocking(move || {
            shard_fetch(&task_shard, &missing, options)
        })
        .await;

        match result {
            Ok(Ok(records)) => {
                for record in records {
                    found.entry(record.id.clone()).or_insert(record);
                }
            }
            Ok(Err(e)) => {
                warn!(bucket = shard.bucket_ts(), "shard fetch failed, skipped: {e}");
            }
            Err(e) => {
                warn!(bucket = shard.bucket_ts(), "shard fetch task failed: {e}");
            }
        }
    }

    Ok(ids.iter().filter_map(|id| found.remove(id)).collect())
}

fn shard_fetch(
    shard: &Shard,
    ids: &[String],
    options: FetchOptions,
) -> Result<Vec<DocumentRecord>, EngineError> {
    let tokens_column = if options.omit_body_text { "NULL" } else { "d.tokens" };
    let attrs_column = if options.omit_attrs { "NULL" } else { "a.attrs" };
    let sql = format!(
        "SELECT d.rowid, {tokens_column}, {attrs_column}
         FROM id_tuples t
         LEFT JOIN docs d ON d.rowid = t.internal_id
         LEFT JOIN extra_attrs a ON a.external_id = t.external_id
         WHERE t.external_id = ?1"
    );

    shard.with_read_connection(|conn| {
        let mut stmt = conn.prepare(&sql)?;
        let mut records = Vec::new();
        for id in ids {
            let row: Option<(Option<i64>, Option<String>, Option<String>)> = stmt
                .query_row(params![id], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })
                .optional()?;
            let Some((doc_rowid, body_text, attrs)) = row else {
                continue;
            };
            // A reserved id has an id_tuples row but no document yet.
            if doc_rowid.is_none() {
                continue;
            }
            records.push(DocumentRecord {
                id: id.clone(),
                bucket_ts: shard.bucket_ts(),
                body_text,
                attrs,
            });
        }
        Ok(records)
    })
}
