// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared helpers for the integration test binaries.

#![allow(dead_code)]

use std::path::PathBuf;

use icingadb_sync::config::DatabaseConfig;
use icingadb_sync::storage::{schema, Db, StreamEntry};
use icingadb_sync::types::Binary;

pub fn temp_db_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("icingadb_sync_it_{}_{}.db", name, uuid::Uuid::new_v4()))
}

/// Clean up SQLite database and its WAL files
pub fn cleanup_db(path: &PathBuf) {
    let _ = std::fs::remove_file(path);
    let _ = std::fs::remove_file(format!("{}-wal", path.display()));
    let _ = std::fs::remove_file(format!("{}-shm", path.display()));
}

/// A fresh SQLite database with the shipped schema imported.
pub async fn temp_db(name: &str) -> (Db, PathBuf) {
    let path = temp_db_path(name);
    cleanup_db(&path);
    let db = Db::connect(&DatabaseConfig::sqlite(path.display().to_string()))
        .await
        .expect("Failed to open SQLite database");
    db.import_schema(schema::SQLITE).await.expect("Failed to import schema");
    (db, path)
}

pub fn entry(id: &str, fields: &[(&str, &str)]) -> StreamEntry {
    StreamEntry {
        id: id.to_string(),
        fields: fields.iter().copied().collect(),
    }
}

pub fn bin(byte: u8) -> Binary {
    Binary::new(vec![byte; 20])
}

pub async fn count(db: &Db, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(db.pool())
        .await
        .expect("count query failed")
}
