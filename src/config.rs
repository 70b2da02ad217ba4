//! Configuration loading with env-var overrides.
//!
//! Reads `config/default.toml` relative to the current working directory,
//! then applies `TTTS_WORK_DIR`, `TTTS_LOG_LEVEL` and `TTTS_HTTP_BIND` env
//! overrides. Config files may inherit from another file through
//! `[meta] base = "..."`.

use std::{
    collections::{BTreeMap, HashSet},
    env, fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::error::EngineError;

/// HTTP listener configuration.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Whether the HTTP front is enabled.
    pub enabled: bool,
    /// Socket address to bind the listener to.
    pub bind: String,
}

/// Fully-resolved configuration for one searchable index.
///
/// One `SearchEngine` is built per entry; `name` doubles as the shard file
/// prefix and the HTTP resource prefix (`/<name>/...`).
#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub name: String,
    /// Directory holding the shard files and the task database.
    pub base_dir: PathBuf,
    /// Width of a time bucket; one shard file per bucket.
    pub bucket_duration_seconds: i64,
    /// Rowid allocation starts at `initial_document_id - 1` and decrements.
    pub initial_document_id: i64,
    pub max_document_token_count: usize,
    pub max_query_token_count: usize,
    /// Commit an open write transaction once this many mutations piled up.
    pub auto_commit_update_count: u32,
    /// ... or once it has been open this long.
    pub auto_commit_duration_seconds: u64,
    /// `true` → FTS detail=full (native phrase queries); `false` → detail=none.
    pub record_positions: bool,
    /// `false` → contentless FTS table; updates and deletes are rejected.
    pub record_contents: bool,
    /// Per-generation tuning vectors, index 0 = hot shard. A shard whose
    /// generation exceeds the vector length uses the last entry.
    pub read_connection_counts: Vec<usize>,
    pub cache_kibibytes: Vec<i64>,
    pub mmap_bytes: Vec<i64>,
    pub automerge_levels: Vec<i64>,
    pub journal_size_limit_bytes: i64,
    /// Page size applied to newly created shard files.
    pub page_size: i64,
    /// Inline retries for a failing data task before it is left for replay.
    pub task_retry_count: u32,
    pub worker_idle_sleep_ms: u64,
    /// Locale assumed when a request carries none.
    pub default_locale: String,
}

impl IndexConfig {
    /// Bucket timestamp owning `timestamp`.
    pub fn bucket_for(&self, timestamp: i64) -> i64 {
        timestamp - timestamp.rem_euclid(self.bucket_duration_seconds)
    }

    /// Generation of `bucket_ts` relative to the newest bucket, clamped to
    /// the tuning vectors.
    pub fn generation(&self, bucket_ts: i64, latest_bucket_ts: i64) -> usize {
        if bucket_ts >= latest_bucket_ts {
            return 0;
        }
        ((latest_bucket_ts - bucket_ts) / self.bucket_duration_seconds).max(0) as usize
    }

    pub fn read_connections_for(&self, generation: usize) -> usize {
        clamp_pick(&self.read_connection_counts, generation).copied().unwrap_or(0)
    }

    pub fn cache_kibibytes_for(&self, generation: usize) -> i64 {
        clamp_pick(&self.cache_kibibytes, generation).copied().unwrap_or(2_000)
    }

    pub fn mmap_bytes_for(&self, generation: usize) -> i64 {
        clamp_pick(&self.mmap_bytes, generation).copied().unwrap_or(0)
    }

    pub fn automerge_for(&self, generation: usize) -> i64 {
        clamp_pick(&self.automerge_levels, generation).copied().unwrap_or(4)
    }
}

fn clamp_pick<T>(v: &[T], generation: usize) -> Option<&T> {
    if v.is_empty() {
        None
    } else {
        v.get(generation.min(v.len() - 1))
    }
}

/// Fully-resolved service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub server_name: String,
    /// Working directory for all persistent data (already expanded, no `~`).
    pub work_dir: PathBuf,
    pub log_level: String,
    pub http: HttpConfig,
    /// One entry per configured index, in name order.
    pub indexes: Vec<IndexConfig>,
}

// ── Raw TOML shapes ───────────────────────────────────────────────────────────

/// Raw TOML shape — `serde` target before resolution.
#[derive(Deserialize)]
struct RawConfig {
    server: RawServer,
    #[serde(default)]
    http: RawHttp,
    #[serde(default)]
    engine: RawEngine,
    #[serde(default)]
    indexes: BTreeMap<String, RawIndexOverrides>,
}

#[derive(Deserialize)]
struct RawServer {
    name: String,
    work_dir: String,
    log_level: String,
}

#[derive(Deserialize)]
struct RawHttp {
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default = "default_http_bind")]
    bind: String,
}

impl Default for RawHttp {
    fn default() -> Self {
        Self { enabled: true, bind: default_http_bind() }
    }
}

/// `[engine]` — defaults applied to every index; any key can be overridden
/// per index in `[indexes.<name>]`.
#[derive(Deserialize, Clone)]
struct RawEngine {
    #[serde(default = "default_bucket_duration")]
    bucket_duration_seconds: i64,
    #[serde(default = "default_initial_document_id")]
    initial_document_id: i64,
    #[serde(default = "default_max_document_tokens")]
    max_document_token_count: usize,
    #[serde(default = "default_max_query_tokens")]
    max_query_token_count: usize,
    #[serde(default = "default_auto_commit_updates")]
    auto_commit_update_count: u32,
    #[serde(default = "default_auto_commit_seconds")]
    auto_commit_duration_seconds: u64,
    #[serde(default = "default_true")]
    record_positions: bool,
    #[serde(default = "default_true")]
    record_contents: bool,
    #[serde(default = "default_read_connection_counts")]
    read_connection_counts: Vec<usize>,
    #[serde(default = "default_cache_kibibytes")]
    cache_kibibytes: Vec<i64>,
    #[serde(default = "default_mmap_bytes")]
    mmap_bytes: Vec<i64>,
    #[serde(default = "default_automerge_levels")]
    automerge_levels: Vec<i64>,
    #[serde(default = "default_journal_size_limit")]
    journal_size_limit_bytes: i64,
    #[serde(default = "default_page_size")]
    page_size: i64,
    #[serde(default = "default_task_retry_count")]
    task_retry_count: u32,
    #[serde(default = "default_worker_idle_sleep_ms")]
    worker_idle_sleep_ms: u64,
    #[serde(default = "default_locale")]
    default_locale: String,
}

impl Default for RawEngine {
    fn default() -> Self {
        Self {
            bucket_duration_seconds: default_bucket_duration(),
            initial_document_id: default_initial_document_id(),
            max_document_token_count: default_max_document_tokens(),
            max_query_token_count: default_max_query_tokens(),
            auto_commit_update_count: default_auto_commit_updates(),
            auto_commit_duration_seconds: default_auto_commit_seconds(),
            record_positions: true,
            record_contents: true,
            read_connection_counts: default_read_connection_counts(),
            cache_kibibytes: default_cache_kibibytes(),
            mmap_bytes: default_mmap_bytes(),
            automerge_levels: default_automerge_levels(),
            journal_size_limit_bytes: default_journal_size_limit(),
            page_size: default_page_size(),
            task_retry_count: default_task_retry_count(),
            worker_idle_sleep_ms: default_worker_idle_sleep_ms(),
            default_locale: default_locale(),
        }
    }
}

/// `[indexes.<name>]` — every field optional, falling back to `[engine]`.
#[derive(Deserialize, Default)]
struct RawIndexOverrides {
    bucket_duration_seconds: Option<i64>,
    initial_document_id: Option<i64>,
    max_document_token_count: Option<usize>,
    max_query_token_count: Option<usize>,
    auto_commit_update_count: Option<u32>,
    auto_commit_duration_seconds: Option<u64>,
    record_positions: Option<bool>,
    record_contents: Option<bool>,
    read_connection_counts: Option<Vec<usize>>,
    cache_kibibytes: Option<Vec<i64>>,
    mmap_bytes: Option<Vec<i64>>,
    automerge_levels: Option<Vec<i64>>,
    journal_size_limit_bytes: Option<i64>,
    page_size: Option<i64>,
    task_retry_count: Option<u32>,
    worker_idle_sleep_ms: Option<u64>,
    default_locale: Option<String>,
}

fn default_http_bind() -> String { "127.0.0.1:8080".to_string() }
fn default_bucket_duration() -> i64 { 86_400 }
fn default_initial_document_id() -> i64 { 2_097_151 }
fn default_max_document_tokens() -> usize { 10_000 }
fn default_max_query_tokens() -> usize { 5 }
fn default_auto_commit_updates() -> u32 { 1_000 }
fn default_auto_commit_seconds() -> u64 { 10 }
fn default_read_connection_counts() -> Vec<usize> { vec![4, 0] }
fn default_cache_kibibytes() -> Vec<i64> { vec![24_576, 400] }
fn default_mmap_bytes() -> Vec<i64> { vec![268_435_456, 0] }
fn default_automerge_levels() -> Vec<i64> { vec![8, 2] }
fn default_journal_size_limit() -> i64 { 67_108_864 }
fn default_page_size() -> i64 { 8_192 }
fn default_task_retry_count() -> u32 { 3 }
fn default_worker_idle_sleep_ms() -> u64 { 50 }
fn default_locale() -> String { "en".to_string() }

fn default_true() -> bool {
    true
}

// ── TOML inheritance ──────────────────────────────────────────────────────────

/// Read `path` and every ancestor it names through `[meta] base`, returning
/// the layers deepest base first so later layers win when overlaid. A file
/// that names itself, directly or through intermediaries, is an error.
fn read_inheritance_chain(path: &Path) -> Result<Vec<toml::Value>, EngineError> {
    let mut chain = Vec::new();
    let mut seen: HashSet<PathBuf> = HashSet::new();
    let mut next = Some(path.to_path_buf());

    while let Some(current) = next {
        let identity = current.canonicalize().unwrap_or_else(|_| current.clone());
        if !seen.insert(identity) {
            return Err(EngineError::Config(format!(
                "config inheritance loops back through {}",
                current.display()
            )));
        }

        let text = fs::read_to_string(&current).map_err(|e| {
            EngineError::Config(format!("unreadable config {}: {e}", current.display()))
        })?;
        let layer: toml::Value = toml::from_str(&text).map_err(|e| {
            EngineError::Config(format!("invalid TOML in {}: {e}", current.display()))
        })?;

        // Relative base references resolve against the file that made them.
        next = layer
            .get("meta")
            .and_then(|meta| meta.get("base"))
            .and_then(toml::Value::as_str)
            .map(|base| {
                let base = Path::new(base);
                if base.is_absolute() {
                    base.to_path_buf()
                } else {
                    current.parent().unwrap_or(Path::new(".")).join(base)
                }
            });

        chain.push(layer);
    }

    chain.reverse();
    Ok(chain)
}

/// Overlay `patch` onto `base` in place. Tables merge key by key, so an
/// overlay file only needs the keys it changes; any other value kind
/// (string, integer, array, …) replaces the base value outright.
fn overlay_value(base: &mut toml::Value, patch: toml::Value) {
    match (base, patch) {
        (toml::Value::Table(base_table), toml::Value::Table(patch_table)) => {
            for (key, value) in patch_table {
                match base_table.get_mut(&key) {
                    Some(slot) => overlay_value(slot, value),
                    None => {
                        base_table.insert(key, value);
                    }
                }
            }
        }
        (slot, patch) => *slot = patch,
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Load config from the given path, or `config/default.toml`, then apply
/// env-var overrides. If no path is given and `config/default.toml` does not
/// exist, returns a hardcoded minimal default with a single `default` index.
pub fn load(config_path: Option<&str>) -> Result<Config, EngineError> {
    let work_dir_override = env::var("TTTS_WORK_DIR").ok();
    let log_level_override = env::var("TTTS_LOG_LEVEL").ok();
    let http_bind_override = env::var("TTTS_HTTP_BIND").ok();

    if let Some(path) = config_path {
        // If explicitly provided, it must exist and be valid.
        return load_from(
            Path::new(path),
            work_dir_override.as_deref(),
            log_level_override.as_deref(),
            http_bind_override.as_deref(),
        );
    }

    let default_path = Path::new("config/default.toml");
    if default_path.exists() {
        load_from(
            default_path,
            work_dir_override.as_deref(),
            log_level_override.as_deref(),
            http_bind_override.as_deref(),
        )
    } else {
        let work_dir_str = work_dir_override.unwrap_or("~/.ttts".to_string());
        let work_dir = resolve_work_dir(&work_dir_str);
        let log_level = log_level_override.unwrap_or("info".to_string());
        let bind = http_bind_override.unwrap_or_else(default_http_bind);

        let engine = RawEngine::default();
        let index = resolve_index("default", &work_dir, &engine, &RawIndexOverrides::default());

        Ok(Config {
            server_name: "ttts".to_string(),
            work_dir,
            log_level,
            http: HttpConfig { enabled: true, bind },
            indexes: vec![index],
        })
    }
}

/// Internal loader — accepts an explicit path and optional overrides.
/// Tests pass overrides directly instead of mutating env vars.
/// Follows `[meta] base = "..."` inheritance chains before resolving.
pub fn load_from(
    path: &Path,
    work_dir_override: Option<&str>,
    log_level_override: Option<&str>,
    http_bind_override: Option<&str>,
) -> Result<Config, EngineError> {
    let mut merged = toml::Value::Table(toml::map::Map::new());
    for layer in read_inheritance_chain(path)? {
        overlay_value(&mut merged, layer);
    }

    let parsed: RawConfig = serde::Deserialize::deserialize(merged).map_err(
        |e: toml::de::Error| {
            EngineError::Config(format!("config error in {}: {e}", path.display()))
        },
    )?;

    let s = parsed.server;

    let work_dir_str = work_dir_override.unwrap_or(&s.work_dir).to_string();
    let work_dir = resolve_work_dir(&work_dir_str);
    let log_level = log_level_override.unwrap_or(&s.log_level).to_string();
    let bind = http_bind_override
        .map(ToString::to_string)
        .unwrap_or(parsed.http.bind);

    let mut indexes = Vec::new();
    if parsed.indexes.is_empty() {
        indexes.push(resolve_index(
            "default",
            &work_dir,
            &parsed.engine,
            &RawIndexOverrides::default(),
        ));
    } else {
        for (name, overrides) in &parsed.indexes {
            validate_index_name(name)?;
            indexes.push(resolve_index(name, &work_dir, &parsed.engine, overrides));
        }
    }

    for index in &indexes {
        validate_index(index)?;
    }

    Ok(Config {
        server_name: s.name,
        work_dir,
        log_level,
        http: HttpConfig { enabled: parsed.http.enabled, bind },
        indexes,
    })
}

fn resolve_index(
    name: &str,
    work_dir: &Path,
    engine: &RawEngine,
    ov: &RawIndexOverrides,
) -> IndexConfig {
    IndexConfig {
        name: name.to_string(),
        base_dir: work_dir.to_path_buf(),
        bucket_duration_seconds: ov
            .bucket_duration_seconds
            .unwrap_or(engine.bucket_duration_seconds),
        initial_document_id: ov.initial_document_id.unwrap_or(engine.initial_document_id),
        max_document_token_count: ov
            .max_document_token_count
            .unwrap_or(engine.max_document_token_count),
        max_query_token_count: ov
            .max_query_token_count
            .unwrap_or(engine.max_query_token_count),
        auto_commit_update_count: ov
            .auto_commit_update_count
            .unwrap_or(engine.auto_commit_update_count),
        auto_commit_duration_seconds: ov
            .auto_commit_duration_seconds
            .unwrap_or(engine.auto_commit_duration_seconds),
        record_positions: ov.record_positions.unwrap_or(engine.record_positions),
        record_contents: ov.record_contents.unwrap_or(engine.record_contents),
        read_connection_counts: ov
            .read_connection_counts
            .clone()
            .unwrap_or_else(|| engine.read_connection_counts.clone()),
        cache_kibibytes: ov
            .cache_kibibytes
            .clone()
            .unwrap_or_else(|| engine.cache_kibibytes.clone()),
        mmap_bytes: ov.mmap_bytes.clone().unwrap_or_else(|| engine.mmap_bytes.clone()),
        automerge_levels: ov
            .automerge_levels
            .clone()
            .unwrap_or_else(|| engine.automerge_levels.clone()),
        journal_size_limit_bytes: ov
            .journal_size_limit_bytes
            .unwrap_or(engine.journal_size_limit_bytes),
        page_size: ov.page_size.unwrap_or(engine.page_size),
        task_retry_count: ov.task_retry_count.unwrap_or(engine.task_retry_count),
        worker_idle_sleep_ms: ov.worker_idle_sleep_ms.unwrap_or(engine.worker_idle_sleep_ms),
        default_locale: ov
            .default_locale
            .clone()
            .unwrap_or_else(|| engine.default_locale.clone()),
    }
}

/// Index names become file prefixes and URL path segments, so they are kept
/// to a conservative character set.
fn validate_index_name(name: &str) -> Result<(), EngineError> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if ok {
        Ok(())
    } else {
        Err(EngineError::Config(format!(
            "invalid index name '{name}': use ASCII alphanumerics, '_' or '.'"
        )))
    }
}

fn validate_index(index: &IndexConfig) -> Result<(), EngineError> {
    if index.bucket_duration_seconds <= 0 {
        return Err(EngineError::Config(format!(
            "index '{}': bucket_duration_seconds must be positive",
            index.name
        )));
    }
    if index.initial_document_id <= 1 {
        return Err(EngineError::Config(format!(
            "index '{}': initial_document_id must be greater than 1",
            index.name
        )));
    }
    if index.read_connection_counts.is_empty() {
        return Err(EngineError::Config(format!(
            "index '{}': read_connection_counts must not be empty",
            index.name
        )));
    }
    Ok(())
}

/// Resolve the configured working directory, expanding a leading `~` to the
/// user's home. `~user` forms are passed through untouched; so is everything
/// when no home directory can be determined.
fn resolve_work_dir(raw: &str) -> PathBuf {
    let Some(rest) = raw.strip_prefix('~') else {
        return PathBuf::from(raw);
    };
    let Some(home) = dirs::home_dir() else {
        return PathBuf::from(raw);
    };
    if rest.is_empty() {
        home
    } else if let Some(tail) = rest.strip_prefix('/') {
        home.join(tail)
    } else {
        PathBuf::from(raw)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
