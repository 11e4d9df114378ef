//! Error types for the cache library
//!
//! Provides unified error handling using thiserror.

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for the persistent store.
///
/// In-memory cache operations never fail; every variant here belongs to
/// the storage tier.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Caller-supplied argument was rejected (empty key, empty value,
    /// missing filename in file mode, oversized root path).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Filesystem read/write/move/delete failure.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// Transient SQLite BUSY/LOCKED condition.
    #[error("database busy")]
    DbBusy,

    /// Non-transient SQLite failure.
    #[error("database failure: {0}")]
    Db(rusqlite::Error),

    /// The reopen gate is in effect after repeated open failures; all
    /// database operations fail fast until the retry window elapses.
    #[error("database unavailable: reopen gated after repeated failures")]
    DbUnavailable,
}

impl From<rusqlite::Error> for CacheError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy)
            | Some(rusqlite::ErrorCode::DatabaseLocked) => CacheError::DbBusy,
            _ => CacheError::Db(err),
        }
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache library.
pub type Result<T> = std::result::Result<T, CacheError>;
