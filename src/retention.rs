// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retention sweeper: paced deletion of aged-out history and SLA rows.
//!
//! Each tick deletes at most `retention.count` rows per statement and keeps
//! going while the last statement was full, so one sweep never holds long
//! locks on busy tables.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::RetentionConfig;
use crate::error::Result;
use crate::resilience::retry::{retry_sync, RetryConfig};
use crate::storage::{Db, Dialect};
use crate::tasks::{cancellable, sleep};
use crate::telemetry::{Counter, Stats};
use crate::types::{Binary, UnixMilli};

/// Which configured window governs a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    History,
    Sla,
}

/// A retention-governed table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionTable {
    pub table: &'static str,
    pub pk: &'static str,
    pub age_column: &'static str,
    pub category: &'static str,
    pub window: Window,
}

const fn governed(
    table: &'static str,
    pk: &'static str,
    age_column: &'static str,
    category: &'static str,
    window: Window,
) -> RetentionTable {
    RetentionTable { table, pk, age_column, category, window }
}

pub const RETENTION_TABLES: [RetentionTable; 9] = [
    governed("acknowledgement_history", "id", "clear_time", "acknowledgement", Window::History),
    governed("comment_history", "comment_id", "remove_time", "comment", Window::History),
    governed("downtime_history", "downtime_id", "end_time", "downtime", Window::History),
    governed("flapping_history", "id", "end_time", "flapping", Window::History),
    governed("notification_history", "id", "send_time", "notification", Window::History),
    governed("state_history", "id", "event_time", "state", Window::History),
    governed("history", "id", "event_time", "history", Window::History),
    governed("sla_history_downtime", "downtime_id", "downtime_end", "sla_downtime", Window::Sla),
    governed("sla_history_state", "id", "event_time", "sla_state", Window::Sla),
];

/// Keys accepted in `retention.options`.
pub const RETENTION_CATEGORIES: [&str; 9] = [
    "acknowledgement",
    "comment",
    "downtime",
    "flapping",
    "notification",
    "state",
    "history",
    "sla_downtime",
    "sla_state",
];

/// Days to keep for `table`; `None` keeps everything.
pub fn retention_days(config: &RetentionConfig, table: &RetentionTable) -> Option<u16> {
    let window = match table.window {
        Window::History => config.history_days,
        Window::Sla => config.sla_days,
    };
    let days = config.options.get(table.category).copied().unwrap_or(window);
    (days > 0).then_some(days)
}

/// One bounded delete of rows older than the bound parameter.
pub fn delete_statement(dialect: Dialect, table: &RetentionTable, limit: u64) -> String {
    let t = dialect.quote(table.table);
    let pk = dialect.quote(table.pk);
    let age = dialect.quote(table.age_column);
    let sql = match dialect {
        Dialect::Mysql => format!(
            "DELETE FROM {t} WHERE environment_id = ? AND {age} < ? ORDER BY {age} LIMIT {limit}"
        ),
        Dialect::Postgres | Dialect::Sqlite => format!(
            "WITH rows AS (SELECT {pk} FROM {t} WHERE environment_id = ? AND {age} < ? LIMIT {limit}) \
             DELETE FROM {t} WHERE {pk} IN (SELECT {pk} FROM rows)"
        ),
    };
    dialect.rebind(&sql)
}

pub struct Retention {
    db: Db,
    environment_id: Binary,
    config: RetentionConfig,
    stats: Arc<Stats>,
}

impl Retention {
    pub fn new(db: Db, environment_id: Binary, config: RetentionConfig, stats: Arc<Stats>) -> Self {
        Self {
            db,
            environment_id,
            config,
            stats,
        }
    }

    /// Delete rows of `table` older than `older_than`, batch by batch.
    pub async fn sweep_table(
        &self,
        cancel: &CancellationToken,
        table: &RetentionTable,
        older_than: UnixMilli,
    ) -> Result<u64> {
        let sql = delete_statement(self.db.dialect(), table, self.config.count);
        let name = format!("retention {}", table.table);
        let mut total = 0;

        loop {
            let deleted = cancellable(cancel, async {
                retry_sync(&name, &RetryConfig::database(), cancel, || async {
                    let done = sqlx::query(&sql)
                        .bind(self.environment_id.as_bytes().to_vec())
                        .bind(older_than.millis())
                        .execute(self.db.pool())
                        .await?;
                    Ok(done.rows_affected())
                })
                .await
            })
            .await?;

            total += deleted;
            if deleted > 0 {
                crate::metrics::record_retention_deleted(table.table, deleted);
                self.stats.add(Counter::HistoryRetention, deleted);
            }
            if deleted < self.config.count {
                return Ok(total);
            }
        }
    }

    /// One pass over every governed table with a retention window.
    pub async fn sweep(&self, cancel: &CancellationToken, now: UnixMilli) -> Result<u64> {
        let mut total = 0;
        for table in &RETENTION_TABLES {
            let Some(days) = retention_days(&self.config, table) else {
                continue;
            };
            let started = Instant::now();
            let older_than = now.saturating_sub(Duration::from_secs(u64::from(days) * 86_400));
            let deleted = self.sweep_table(cancel, table, older_than).await?;
            if deleted > 0 {
                info!(table = table.table, count = deleted, days, took = ?started.elapsed(), "Removed old rows");
            } else {
                debug!(table = table.table, days, "Nothing to remove");
            }
            total += deleted;
        }
        Ok(total)
    }

    /// Sweep on every interval tick until cancelled.
    #[tracing::instrument(skip_all)]
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        if RETENTION_TABLES.iter().all(|t| retention_days(&self.config, t).is_none()) {
            debug!("Retention disabled");
            cancel.cancelled().await;
            return Ok(());
        }
        loop {
            self.sweep(cancel, UnixMilli::now()).await?;
            sleep(cancel, self.config.interval()).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testing::{cleanup_db, temp_db};
    use std::collections::BTreeMap;

    fn config(history_days: u16, sla_days: u16, count: u64) -> RetentionConfig {
        RetentionConfig {
            history_days,
            sla_days,
            count,
            ..RetentionConfig::default()
        }
    }

    #[test]
    fn test_categories_match_tables() {
        let categories: Vec<&str> = RETENTION_TABLES.iter().map(|t| t.category).collect();
        assert_eq!(categories, RETENTION_CATEGORIES);
    }

    #[test]
    fn test_retention_days() {
        let mut cfg = config(30, 0, 10);
        cfg.options = BTreeMap::from([("state".to_string(), 7)]);
        let by = |name: &str| *RETENTION_TABLES.iter().find(|t| t.table == name).unwrap();

        assert_eq!(retention_days(&cfg, &by("state_history")), Some(7));
        assert_eq!(retention_days(&cfg, &by("comment_history")), Some(30));
        assert_eq!(retention_days(&cfg, &by("sla_history_state")), None);
    }

    #[test]
    fn test_delete_statements() {
        let table = RETENTION_TABLES[1];
        assert_eq!(
            delete_statement(Dialect::Mysql, &table, 500),
            "DELETE FROM `comment_history` WHERE environment_id = ? AND `remove_time` < ? \
             ORDER BY `remove_time` LIMIT 500"
        );
        let pg = delete_statement(Dialect::Postgres, &table, 500);
        assert!(pg.starts_with("WITH rows AS (SELECT \"comment_id\" FROM \"comment_history\""));
        assert!(pg.contains("environment_id = $1 AND \"remove_time\" < $2 LIMIT 500"));
        assert!(pg.ends_with("WHERE \"comment_id\" IN (SELECT \"comment_id\" FROM rows)"));
    }

    #[tokio::test]
    async fn test_sweep_respects_cap_and_age() {
        let (db, path) = temp_db("retention").await;
        let env = Binary::new(vec![1; 20]);
        let other = Binary::new(vec![2; 20]);

        for i in 0..25u8 {
            let (environment, time) = match i {
                0..=11 => (&env, 1_000i64),
                12..=19 => (&env, 9_000_000_000_000),
                _ => (&other, 1_000),
            };
            sqlx::query("INSERT INTO state_history (id, environment_id, event_time) VALUES (?, ?, ?)")
                .bind(vec![i; 20])
                .bind(environment.as_bytes().to_vec())
                .bind(time)
                .execute(db.pool())
                .await
                .unwrap();
        }

        let stats = Arc::new(Stats::new());
        let retention = Retention::new(db.clone(), env, config(1, 0, 5), stats.clone());
        let cancel = CancellationToken::new();
        let deleted = retention
            .sweep_table(&cancel, &RETENTION_TABLES[5], UnixMilli::now())
            .await
            .unwrap();
        assert_eq!(deleted, 12);
        assert_eq!(stats.get(Counter::HistoryRetention), 12);

        let left: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM state_history")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(left, 13);

        db.close().await;
        cleanup_db(&path);
    }

    #[tokio::test]
    async fn test_sweep_skips_disabled_windows() {
        let (db, path) = temp_db("retention_disabled").await;
        let retention = Retention::new(db.clone(), Binary::new(vec![1; 20]), config(0, 0, 5), Arc::new(Stats::new()));
        let deleted = retention.sweep(&CancellationToken::new(), UnixMilli::now()).await.unwrap();
        assert_eq!(deleted, 0);

        db.close().await;
        cleanup_db(&path);
    }
}
