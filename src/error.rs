//! Application-wide error types.

use thiserror::Error;

/// Error kinds surfaced by the engine and its HTTP front.
///
/// The HTTP layer maps these onto status codes: `Config` → 400,
/// `NotFound` → 404, `AdmissionDenied` → 409, everything else → 500.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("maintenance mode required: {0}")]
    AdmissionDenied(String),

    #[error("rowid space exhausted: {0}")]
    ResourceExhausted(String),

    #[error("corrupt shard: {0}")]
    Corrupt(String),

    #[error("task error: {0}")]
    Task(String),

    #[error("logger error: {0}")]
    Logger(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
