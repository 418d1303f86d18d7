//! Error types for the fact store.

use uuid::Uuid;

use crate::matcher::MatchError;

/// Errors that can occur while appending to, reading from, or locking the
/// fact log.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A database operation failed.
    #[error("fact store database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No pooled connection could be obtained.
    #[error("fact store connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// The pool could not be created.
    #[error("fact store pool init error: {0}")]
    PoolInit(#[from] factlog_db::PoolError),

    /// Schema migrations failed.
    #[error("fact store migration error: {0}")]
    Migration(#[from] factlog_db::MigrationError),

    /// JSON serialization or deserialization failed.
    #[error("fact store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A fact with this id already exists. The whole batch was rejected.
    #[error("duplicate fact id: {0}")]
    DuplicateFact(Uuid),

    /// A fact cannot be appended as given.
    #[error("invalid fact: {0}")]
    InvalidFact(String),

    /// A stored row could not be decoded.
    #[error("corrupt fact row at serial {serial}: {reason}")]
    CorruptRow {
        /// Serial of the offending row.
        serial: i64,
        /// What failed to decode.
        reason: String,
    },

    /// Evaluating a spec against a fact failed.
    #[error("fact predicate error: {0}")]
    Match(#[from] MatchError),

    /// The statement was cancelled before or while it ran.
    #[error("statement cancelled")]
    Cancelled,
}

impl StoreError {
    /// Returns `true` if this error is the result of a statement being
    /// cancelled, either before it started or by an interrupt while running.
    pub fn is_cancellation(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Database(rusqlite::Error::SqliteFailure(err, _)) => {
                err.code == rusqlite::ErrorCode::OperationInterrupted
            }
            _ => false,
        }
    }
}
