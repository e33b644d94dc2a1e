// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resume points for history imports.
//!
//! An importer copying history in `[from_ts, to_ts)` windows records the last
//! source row it migrated, so a restart skips what is already done.

use crate::define_entity;
use crate::entity::{bind_values, plan, Columns, Entity};
use crate::error::Result;
use crate::types::Binary;

use super::query;
use super::sql::Db;

define_entity! {
    pub struct HistoryImportProgress {
        pub environment_id: Binary,
        pub history_type: String,
        pub from_ts: i64,
        pub to_ts: i64,
        pub last_source_id: i64,
    }
}

impl Entity for HistoryImportProgress {
    fn primary_key() -> &'static str {
        "environment_id, history_type, from_ts, to_ts"
    }

    fn id(&self) -> &Binary {
        &self.environment_id
    }

    fn upsert_columns() -> Option<Vec<&'static str>> {
        Some(vec!["last_source_id"])
    }
}

#[derive(Clone)]
pub struct ProgressStore {
    db: Db,
}

impl ProgressStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn load(
        &self,
        environment_id: &Binary,
        history_type: &str,
        from_ts: i64,
        to_ts: i64,
    ) -> Result<Option<i64>> {
        let sql = self.db.dialect().rebind(
            "SELECT last_source_id FROM history_import_progress \
             WHERE environment_id = ? AND history_type = ? AND from_ts = ? AND to_ts = ?",
        );
        let last: Option<i64> = sqlx::query_scalar(&sql)
            .bind(environment_id.as_bytes().to_vec())
            .bind(history_type)
            .bind(from_ts)
            .bind(to_ts)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(last)
    }

    pub async fn save(
        &self,
        environment_id: &Binary,
        history_type: &str,
        from_ts: i64,
        to_ts: i64,
        last_source_id: i64,
    ) -> Result<()> {
        let row = HistoryImportProgress {
            environment_id: environment_id.clone(),
            history_type: history_type.to_string(),
            from_ts,
            to_ts,
            last_source_id,
        };
        let sql = query::upsert(self.db.dialect(), &plan::<HistoryImportProgress>(), 1);
        bind_values(sqlx::query(&sql), row.values())
            .execute(self.db.pool())
            .await?;
        Ok(())
    }
}
