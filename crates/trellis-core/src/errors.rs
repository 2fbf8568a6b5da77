//! Error types for the trellis core library.

/// Top-level error enum for the trellis core library.
#[derive(Debug, thiserror::Error)]
pub enum TrellisError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Extraction failed for {path}: {message}")]
    Extraction { path: String, message: String },

    #[error("Write conflict on {path} after {attempts} attempts")]
    WriteConflict { path: String, attempts: u32 },

    #[error("Invalid reference transition for {reference_id}: {from} -> {to}")]
    InvalidTransition {
        reference_id: String,
        from: String,
        to: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Run cancelled during {0}")]
    Cancelled(String),

    #[error("Indexing run in progress (phase: {0})")]
    RunInProgress(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TrellisError {
    /// True when SQLite reported a busy or locked database, which the store
    /// treats as a retryable write conflict.
    pub fn is_busy(&self) -> bool {
        match self {
            TrellisError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

pub type TrellisResult<T> = Result<T, TrellisError>;
