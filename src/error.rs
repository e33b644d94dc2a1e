// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy for the sync daemon.
//!
//! Every component returns [`SyncError`]. The classification methods drive
//! the policies applied by callers:
//!
//! - [`SyncError::is_retryable`]: transient I/O, deadlocks and serialization
//!   failures are retried with backoff
//! - [`SyncError::is_cancelled`]: cancellation is not an error, callers return
//!   silently
//! - [`SyncError::exit_code`]: configuration errors exit with `2`, everything
//!   else fatal exits with `1`

use thiserror::Error;

use crate::entity::StructifyError;

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("no database schema exists, please import the schema file first")]
    SchemaMissing,

    #[error(
        "unexpected database schema version: v{actual} (expected v{expected}), \
         please make sure you have applied all database migrations after upgrading"
    )]
    SchemaVersion { expected: i64, actual: i64 },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Structify(#[from] StructifyError),

    #[error("data error: {0}")]
    Data(String),

    #[error("high availability: {0}")]
    Ha(String),

    #[error("task failed: {0}")]
    Task(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<SyncError>,
    },
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            SyncError::Cancelled
        } else {
            SyncError::Task(e.to_string())
        }
    }
}

impl SyncError {
    /// Attach a component or operation name to the error.
    #[must_use]
    pub fn context(self, context: impl Into<String>) -> Self {
        SyncError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping context wrappers.
    #[must_use]
    pub fn root(&self) -> &SyncError {
        match self {
            SyncError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), SyncError::Cancelled)
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            SyncError::Database(e) => is_retryable_sql(e),
            SyncError::Redis(e) => is_retryable_redis(e),
            _ => false,
        }
    }

    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self.root() {
            SyncError::Config(_) => 2,
            _ => 1,
        }
    }
}

/// Extension for attaching context to fallible calls.
pub trait ResultExt<T> {
    fn context(self, context: &str) -> Result<T>;
}

impl<T, E: Into<SyncError>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: &str) -> Result<T> {
        self.map_err(|e| e.into().context(context))
    }
}

/// MySQL error numbers that indicate a transient condition.
const MYSQL_RETRYABLE: &[u16] = &[
    1053, // server shutdown in progress
    1205, // lock wait timeout
    1213, // deadlock found
    2006, // server has gone away
    2013, // lost connection during query
];

/// SQLSTATE classes that indicate a transient condition.
const SQLSTATE_RETRYABLE: &[&str] = &[
    "40001", // serialization failure (also MySQL deadlock)
    "40P01", // deadlock detected
    "57P01", // admin shutdown
    "57P02", // crash shutdown
    "57P03", // cannot connect now
    "08000", "08003", "08006", // connection exceptions
];

/// SQLite primary result codes: BUSY, LOCKED.
const SQLITE_RETRYABLE: &[&str] = &["5", "6", "261", "517", "262"];

pub fn is_retryable_sql(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => {
            if let Some(my) = db.try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>() {
                if MYSQL_RETRYABLE.contains(&my.number()) {
                    return true;
                }
            }
            if let Some(code) = db.code() {
                if SQLSTATE_RETRYABLE.contains(&code.as_ref())
                    || SQLITE_RETRYABLE.contains(&code.as_ref())
                {
                    return true;
                }
            }
            let msg = db.message();
            msg.contains("server has gone away")
                || msg.contains("database is locked")
                || msg.contains("database table is locked")
        }
        _ => false,
    }
}

pub fn is_retryable_redis(err: &redis::RedisError) -> bool {
    err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
        || matches!(
            err.kind(),
            redis::ErrorKind::TryAgain
                | redis::ErrorKind::BusyLoadingError
                | redis::ErrorKind::MasterDown
                | redis::ErrorKind::ClusterDown
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_exit_two() {
        let err = SyncError::Config("database.host is required".into());
        assert_eq!(err.exit_code(), 2);
        assert_eq!(err.context("startup").exit_code(), 2);
    }

    #[test]
    fn test_runtime_errors_exit_one() {
        assert_eq!(SyncError::SchemaMissing.exit_code(), 1);
        assert_eq!(SyncError::Data("bad".into()).exit_code(), 1);
    }

    #[test]
    fn test_cancelled_through_context() {
        let err = SyncError::Cancelled.context("history-sync");
        assert!(err.is_cancelled());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_pool_timeout_is_retryable() {
        let err = SyncError::from(sqlx::Error::PoolTimedOut);
        assert!(err.is_retryable());
        let err = SyncError::from(sqlx::Error::RowNotFound);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_redis_io_error_is_retryable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = SyncError::from(redis::RedisError::from(io));
        assert!(err.is_retryable());

        let auth = redis::RedisError::from((redis::ErrorKind::AuthenticationFailed, "denied"));
        assert!(!SyncError::from(auth).is_retryable());
    }

    #[test]
    fn test_context_message() {
        let err = SyncError::Data("unknown runtime_type".into()).context("runtime-updates");
        assert_eq!(err.to_string(), "runtime-updates: data error: unknown runtime_type");
    }
}
