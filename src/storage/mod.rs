// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage backends: the SQL mirror and the Redis cache.

pub mod bulk;
pub mod progress;
pub mod query;
pub mod redis;
pub mod sql;

pub use bulk::{on_success, BulkExecutor, BulkOp, BulkOptions, OnSuccess, Tracked};
pub use progress::ProgressStore;
pub use redis::{CacheClient, MaxLen, StreamEntry, StreamReader};
pub use sql::{Db, Dialect, SCHEMA_VERSION};

/// Schema files shipped with the crate.
pub mod schema {
    pub const MYSQL: &str = include_str!("../../schema/mysql/schema.sql");
    pub const SQLITE: &str = include_str!("../../schema/sqlite/schema.sql");
}
