//! Error taxonomy for the permission sync engine.
//!
//! Mirrors the error handling design in spec.md §7: transient DB/Redis
//! errors are retried by callers that hold a retry policy (the ACL
//! Upserter), schema mismatches are treated as "reset and continue" by the
//! Fence Validator and Progress Monitor, and lock loss is fatal for the
//! worker holding it.

use thiserror::Error;

/// Errors produced by the fence store, upserter, validator and monitor.
#[derive(Debug, Error)]
pub enum Error {
    /// A Redis command failed.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A Diesel query or connection error.
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    /// Checking out a pooled database connection failed.
    #[error("database pool error: {0}")]
    Pool(String),

    /// The fence payload stored in Redis could not be decoded.
    ///
    /// Validator and monitor both treat this as "reset and continue"; it is
    /// never fatal for the beat process as a whole.
    #[error("fence schema mismatch for key {key}: {source}")]
    SchemaMismatch {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// A Redis-backed lock was lost or could not be reacquired.
    ///
    /// Fatal for whichever worker observes it; the fence is left for the
    /// Fence Validator to reap on a later beat tick.
    #[error("lock lost: {0}")]
    LockLost(String),

    /// The fence never became ready (payload missing, or `celery_task_id`
    /// stayed null) within `CELERY_TASK_WAIT_FOR_FENCE_TIMEOUT`.
    #[error("timed out waiting for fence to be ready: {0}")]
    FenceTimeout(String),

    /// A condition that should abort the current sync attempt outright,
    /// with no retry (e.g. the CCP vanished, or no sync config exists for
    /// its source).
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// Whether a caller holding a bounded-retry policy (the ACL Upserter,
    /// per spec.md §4.4 and §7) should retry this error.
    ///
    /// Only transient database errors are retryable: deadlocks, dropped
    /// connections, and serialization failures. Schema mismatches, lock
    /// loss, and fatal errors always propagate.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Database(diesel::result::Error::DatabaseError(kind, _)) => matches!(
                kind,
                diesel::result::DatabaseErrorKind::SerializationFailure
                    | diesel::result::DatabaseErrorKind::ReadOnlyTransaction
                    | diesel::result::DatabaseErrorKind::Unknown
            ),
            Error::Pool(_) => true,
            Error::Redis(e) => e.is_timeout() || e.is_connection_dropped() || e.is_io_error(),
            _ => false,
        }
    }
}

/// Convenience result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
