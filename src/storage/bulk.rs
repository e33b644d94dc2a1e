// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bulk DML executor.
//!
//! Turns a channel of entities into batched, retried writes:
//!
//! ```text
//! mpsc::Receiver<T> ─▶ Batcher ─▶ split duplicates ─▶ spawn (≤ concurrency)
//!                                                        │ table semaphore
//!                                                        │ retry(database)
//!                                                        ▼
//!                                                   on_success(rows)
//! ```
//!
//! Batch sizes follow the placeholder budget: `max_placeholders_per_statement
//! / columns` rows per `INSERT`, `max_placeholders_per_statement` ids per
//! `DELETE ... IN`, `max_rows_per_transaction` statements per update
//! transaction. With `concurrency == 1` batches commit in source order.

use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::batching::{split_duplicates, BatchConfig, Batcher};
use crate::entity::{bind_values, plan, Columns, Entity, EntityPlan, SqlValue, ToSql};
use crate::error::{Result, SyncError};
use crate::metrics::BatchTimer;
use crate::resilience::retry::{retry_sync, RetryConfig};
use crate::types::Binary;

use super::query;
use super::sql::Db;

/// Callback receiving the rows of a committed batch.
pub type OnSuccess<T> = Arc<dyn Fn(Vec<T>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap an async closure as an [`OnSuccess`] callback.
pub fn on_success<T, F, Fut>(f: F) -> OnSuccess<T>
where
    F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |rows| Box::pin(f(rows)))
}

type BatchFn<T> = Arc<dyn Fn(Vec<T>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkOp {
    Create,
    Upsert,
    Update,
    Delete,
}

impl BulkOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkOp::Create => "create",
            BulkOp::Upsert => "upsert",
            BulkOp::Update => "update",
            BulkOp::Delete => "delete",
        }
    }
}

pub struct BulkOptions<T> {
    /// Maximum batches in flight for this call.
    pub concurrency: usize,
    /// Caps the computed batch size; `Some(1)` is strict mode.
    pub batch_size: Option<usize>,
    pub on_success: Vec<OnSuccess<T>>,
}

impl<T> Default for BulkOptions<T> {
    fn default() -> Self {
        Self {
            concurrency: 1,
            batch_size: None,
            on_success: Vec::new(),
        }
    }
}

impl<T> BulkOptions<T> {
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size.max(1));
        self
    }

    pub fn on_success(mut self, callback: OnSuccess<T>) -> Self {
        self.on_success.push(callback);
        self
    }
}

/// An entity tagged with the stream entry it came from. Writes exactly like
/// the wrapped entity; the id survives into success callbacks.
#[derive(Debug, Clone)]
pub struct Tracked<E> {
    pub entity: E,
    pub stream_id: String,
}

impl<E: Columns> Columns for Tracked<E> {
    fn push_columns(out: &mut Vec<&'static str>) {
        E::push_columns(out)
    }

    fn push_values(&self, out: &mut Vec<SqlValue>) {
        self.entity.push_values(out)
    }
}

impl<E: Entity> Entity for Tracked<E> {
    const TABLE: Option<&'static str> = E::TABLE;
    const CHECKSUMMED: bool = E::CHECKSUMMED;

    fn table_name() -> String {
        E::table_name()
    }

    fn primary_key() -> &'static str {
        E::primary_key()
    }

    fn id(&self) -> &Binary {
        self.entity.id()
    }

    fn checksum(&self) -> Option<&Binary> {
        self.entity.checksum()
    }

    fn upsert_columns() -> Option<Vec<&'static str>> {
        E::upsert_columns()
    }
}

#[derive(Clone)]
pub struct BulkExecutor {
    db: Db,
    flush_interval: Duration,
}

impl BulkExecutor {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            flush_interval: BatchConfig::default().flush_interval,
        }
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Rows per `INSERT` for `plan`, bounded by the placeholder budget.
    pub fn insert_batch_size(&self, plan: &EntityPlan) -> usize {
        (self.db.options().max_placeholders_per_statement / plan.placeholders_per_row().max(1)).max(1)
    }

    /// `INSERT ... IGNORE` every entity from `rx`.
    pub async fn create<T: Entity>(
        &self,
        cancel: &CancellationToken,
        rx: mpsc::Receiver<T>,
        options: BulkOptions<T>,
    ) -> Result<()> {
        let plan = plan::<T>();
        let size = self.insert_batch_size(&plan);
        let db = self.db.clone();
        let p = plan.clone();
        let exec: BatchFn<T> = Arc::new(move |rows: Vec<T>| {
            let db = db.clone();
            let p = p.clone();
            Box::pin(async move { insert_rows(&db, &p, &rows, false).await })
        });
        self.run(BulkOp::Create, &plan.table, cancel, rx, options, size, true, exec)
            .await
    }

    /// `INSERT ... ON DUPLICATE KEY UPDATE` every entity from `rx`. Repeated
    /// ids within one batch are written in successive statements so the
    /// later value wins.
    pub async fn upsert<T: Entity>(
        &self,
        cancel: &CancellationToken,
        rx: mpsc::Receiver<T>,
        options: BulkOptions<T>,
    ) -> Result<()> {
        let plan = plan::<T>();
        let size = self.insert_batch_size(&plan);
        let db = self.db.clone();
        let p = plan.clone();
        let exec: BatchFn<T> = Arc::new(move |rows: Vec<T>| {
            let db = db.clone();
            let p = p.clone();
            Box::pin(async move { insert_rows(&db, &p, &rows, true).await })
        });
        self.run(BulkOp::Upsert, &plan.table, cancel, rx, options, size, true, exec)
            .await
    }

    /// `UPDATE ... WHERE id = ?` per entity, one transaction per batch.
    pub async fn update<T: Entity>(
        &self,
        cancel: &CancellationToken,
        rx: mpsc::Receiver<T>,
        options: BulkOptions<T>,
    ) -> Result<()> {
        let plan = plan::<T>();
        let pk_index = plan.pk_index.ok_or_else(|| {
            SyncError::Data(format!("{} has no column {}", plan.table, plan.primary_key))
        })?;
        let size = self.db.options().max_rows_per_transaction.max(1);
        let db = self.db.clone();
        let p = plan.clone();
        let exec: BatchFn<T> = Arc::new(move |rows: Vec<T>| {
            let db = db.clone();
            let p = p.clone();
            Box::pin(async move { update_rows(&db, &p, pk_index, &rows).await })
        });
        self.run(BulkOp::Update, &plan.table, cancel, rx, options, size, false, exec)
            .await
    }

    /// `DELETE ... WHERE pk IN (...)` for every id from `rx`.
    pub async fn delete<T: Entity>(
        &self,
        cancel: &CancellationToken,
        rx: mpsc::Receiver<Binary>,
        options: BulkOptions<Binary>,
    ) -> Result<()> {
        let plan = plan::<T>();
        self.delete_from(&plan.table, plan.primary_key, cancel, rx, options)
            .await
    }

    /// [`BulkExecutor::delete`] for a table known only by name.
    pub async fn delete_from(
        &self,
        table: &str,
        key: &'static str,
        cancel: &CancellationToken,
        rx: mpsc::Receiver<Binary>,
        options: BulkOptions<Binary>,
    ) -> Result<()> {
        let size = self.db.options().max_placeholders_per_statement.max(1);
        let db = self.db.clone();
        let t = table.to_string();
        let exec: BatchFn<Binary> = Arc::new(move |ids: Vec<Binary>| {
            let db = db.clone();
            let t = t.clone();
            Box::pin(async move { delete_ids(&db, &t, key, &ids).await })
        });
        self.run_with(BulkOp::Delete, table, cancel, rx, options, size, None, exec)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run<T: Entity>(
        &self,
        op: BulkOp,
        table: &str,
        cancel: &CancellationToken,
        rx: mpsc::Receiver<T>,
        options: BulkOptions<T>,
        batch_size: usize,
        split: bool,
        exec: BatchFn<T>,
    ) -> Result<()> {
        let key: Option<fn(&T) -> Binary> = if split { Some(|row: &T| row.id().clone()) } else { None };
        self.run_with(op, table, cancel, rx, options, batch_size, key, exec)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_with<T: Clone + Send + Sync + 'static>(
        &self,
        op: BulkOp,
        table: &str,
        cancel: &CancellationToken,
        rx: mpsc::Receiver<T>,
        options: BulkOptions<T>,
        batch_size: usize,
        key: Option<fn(&T) -> Binary>,
        exec: BatchFn<T>,
    ) -> Result<()> {
        let batch_size = options.batch_size.map_or(batch_size, |cap| cap.min(batch_size)).max(1);
        let mut batcher = Batcher::new(
            rx,
            BatchConfig {
                flush_count: batch_size,
                flush_interval: self.flush_interval,
            },
        );
        let limiter = Arc::new(Semaphore::new(options.concurrency.max(1)));
        let table_sem = self.db.table_semaphore(table);
        let callbacks = Arc::new(options.on_success);
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        debug!(table, op = op.as_str(), batch_size, "Starting bulk writer");

        loop {
            let batch = tokio::select! {
                biased;
                _ = cancel.cancelled() => return drain(tasks).await,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    joined??;
                    continue;
                }
                batch = batcher.next_batch() => batch,
            };
            let Some(batch) = batch else { break };

            let permit = tokio::select! {
                _ = cancel.cancelled() => return drain(tasks).await,
                permit = limiter.clone().acquire_owned() => permit.map_err(|_| SyncError::Cancelled)?,
            };

            let parts = match key {
                Some(key) => split_duplicates(batch.items, key),
                None => vec![batch.items],
            };
            trace!(table, op = op.as_str(), parts = parts.len(), reason = ?batch.reason, "Dispatching batch");

            let table = table.to_string();
            let table_sem = table_sem.clone();
            let exec = exec.clone();
            let callbacks = callbacks.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = permit;
                for rows in parts {
                    let _slot = table_sem.acquire().await.map_err(|_| SyncError::Cancelled)?;
                    let timer = BatchTimer::start(&table, op.as_str());
                    let name = format!("bulk {} {}", op.as_str(), table);
                    retry_sync(&name, &RetryConfig::database(), &cancel, || exec(rows.clone()))
                        .await
                        .map_err(|e| e.context(name.clone()))?;
                    timer.finish(rows.len());
                    for callback in callbacks.iter() {
                        callback(rows.clone()).await?;
                    }
                }
                Ok(())
            });
        }

        while let Some(joined) = tasks.join_next().await {
            joined??;
        }
        Ok(())
    }
}

/// Let in-flight batches finish, then report cancellation.
async fn drain(mut tasks: JoinSet<Result<()>>) -> Result<()> {
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Err(e)) if !e.is_cancelled() => return Err(e),
            Err(e) if !e.is_cancelled() => return Err(e.into()),
            _ => {}
        }
    }
    Err(SyncError::Cancelled)
}

async fn insert_rows<T: Entity>(db: &Db, plan: &EntityPlan, rows: &[T], upsert: bool) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let sql = if upsert {
        query::upsert(db.dialect(), plan, rows.len())
    } else {
        query::insert_ignore(db.dialect(), plan, rows.len())
    };
    let values = rows.iter().flat_map(Columns::values);
    bind_values(sqlx::query(&sql), values).execute(db.pool()).await?;
    Ok(())
}

async fn update_rows<T: Entity>(db: &Db, plan: &EntityPlan, pk_index: usize, rows: &[T]) -> Result<()> {
    let sql = query::update_by_id(db.dialect(), plan);
    let mut tx = db.pool().begin().await?;
    for row in rows {
        let mut values = row.values();
        let key = values.remove(pk_index);
        values.push(key);
        bind_values(sqlx::query(&sql), values).execute(&mut *tx).await?;
    }
    tx.commit().await?;
    Ok(())
}

async fn delete_ids(db: &Db, table: &str, key: &str, ids: &[Binary]) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let sql = query::delete_in(db.dialect(), table, key, ids.len());
    bind_values(sqlx::query(&sql), ids.iter().map(ToSql::to_sql))
        .execute(db.pool())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::config::{ChecksumMeta, Zone};
    use crate::storage::testing::{cleanup_db, temp_db};
    use parking_lot::Mutex;

    fn zone(id: u8, name: &str) -> Zone {
        Zone {
            meta: ChecksumMeta {
                id: Binary::new(vec![id; 20]),
                environment_id: Binary::new(vec![9; 20]),
                properties_checksum: Binary::new(vec![id; 20]),
            },
            name: name.to_string(),
            ..Default::default()
        }
    }

    async fn names(db: &Db) -> Vec<String> {
        sqlx::query_scalar("SELECT name FROM zone ORDER BY name")
            .fetch_all(db.pool())
            .await
            .unwrap()
    }

    async fn feed<T: Send + 'static>(items: Vec<T>) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(items.len().max(1));
        for item in items {
            tx.send(item).await.unwrap();
        }
        rx
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let (db, path) = temp_db("bulk_upsert").await;
        let bulk = BulkExecutor::new(db.clone()).with_flush_interval(Duration::from_millis(5));
        let cancel = CancellationToken::new();

        for _ in 0..2 {
            let rx = feed(vec![zone(1, "master"), zone(2, "satellite")]).await;
            bulk.upsert(&cancel, rx, BulkOptions::default()).await.unwrap();
        }
        assert_eq!(names(&db).await, vec!["master", "satellite"]);

        db.close().await;
        cleanup_db(&path);
    }

    #[tokio::test]
    async fn test_upsert_duplicate_ids_later_wins() {
        let (db, path) = temp_db("bulk_duplicates").await;
        let bulk = BulkExecutor::new(db.clone());
        let cancel = CancellationToken::new();

        let rx = feed(vec![zone(1, "first"), zone(2, "other"), zone(1, "second")]).await;
        bulk.upsert(&cancel, rx, BulkOptions::default()).await.unwrap();
        assert_eq!(names(&db).await, vec!["other", "second"]);

        db.close().await;
        cleanup_db(&path);
    }

    #[tokio::test]
    async fn test_create_ignores_existing() {
        let (db, path) = temp_db("bulk_create").await;
        let bulk = BulkExecutor::new(db.clone());
        let cancel = CancellationToken::new();

        bulk.create(&cancel, feed(vec![zone(1, "kept")]).await, BulkOptions::default())
            .await
            .unwrap();
        bulk.create(&cancel, feed(vec![zone(1, "ignored")]).await, BulkOptions::default())
            .await
            .unwrap();
        assert_eq!(names(&db).await, vec!["kept"]);

        db.close().await;
        cleanup_db(&path);
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let (db, path) = temp_db("bulk_update_delete").await;
        let bulk = BulkExecutor::new(db.clone());
        let cancel = CancellationToken::new();

        let rx = feed(vec![zone(1, "a"), zone(2, "b"), zone(3, "c")]).await;
        bulk.create(&cancel, rx, BulkOptions::default()).await.unwrap();

        let rx = feed(vec![zone(2, "renamed")]).await;
        bulk.update(&cancel, rx, BulkOptions::default()).await.unwrap();

        let rx = feed(vec![Binary::new(vec![1; 20]), Binary::new(vec![3; 20])]).await;
        bulk.delete::<Zone>(&cancel, rx, BulkOptions::default()).await.unwrap();

        assert_eq!(names(&db).await, vec!["renamed"]);

        db.close().await;
        cleanup_db(&path);
    }

    #[tokio::test]
    async fn test_strict_mode_callbacks_in_order() {
        let (db, path) = temp_db("bulk_strict").await;
        let bulk = BulkExecutor::new(db.clone());
        let cancel = CancellationToken::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let rows: Vec<Tracked<Zone>> = (1..=5u8)
            .map(|i| Tracked {
                entity: zone(i, &format!("z{i}")),
                stream_id: format!("{i}-0"),
            })
            .collect();
        let sink = seen.clone();
        let options = BulkOptions::default().batch_size(1).on_success(on_success(
            move |rows: Vec<Tracked<Zone>>| {
                let sink = sink.clone();
                async move {
                    sink.lock().extend(rows.into_iter().map(|r| r.stream_id));
                    Ok(())
                }
            },
        ));
        bulk.upsert(&cancel, feed(rows).await, options).await.unwrap();

        assert_eq!(*seen.lock(), vec!["1-0", "2-0", "3-0", "4-0", "5-0"]);

        db.close().await;
        cleanup_db(&path);
    }

    #[tokio::test]
    async fn test_cancelled_writer_returns_cancelled() {
        let (db, path) = temp_db("bulk_cancel").await;
        let bulk = BulkExecutor::new(db.clone());
        let cancel = CancellationToken::new();
        let (_tx, rx) = mpsc::channel::<Zone>(1);

        cancel.cancel();
        let err = bulk.upsert(&cancel, rx, BulkOptions::default()).await.unwrap_err();
        assert!(err.is_cancelled());

        db.close().await;
        cleanup_db(&path);
    }

    #[tokio::test]
    async fn test_non_retryable_error_propagates() {
        let (db, path) = temp_db("bulk_error").await;
        sqlx::query("DROP TABLE zone").execute(db.pool()).await.unwrap();
        let bulk = BulkExecutor::new(db.clone());
        let cancel = CancellationToken::new();

        let err = bulk
            .upsert(&cancel, feed(vec![zone(1, "x")]).await, BulkOptions::default())
            .await
            .unwrap_err();
        assert!(!err.is_cancelled());
        assert!(err.to_string().contains("bulk upsert zone"));

        db.close().await;
        cleanup_db(&path);
    }
}
