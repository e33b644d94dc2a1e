// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Full config and state sync of one entity type.
//!
//! Checksummed types diff on the lightweight `icinga:checksum:<type>`
//! listing first and fetch bodies only for rows to create or update.
//! Non-checksummed types are listed with their bodies directly.

use futures::TryStreamExt;
use serde::Deserialize;
use sqlx::Row;
use std::collections::HashSet;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::entity::config::{ConfigEntity, Customvar, CustomvarFlat};
use crate::entity::customvar::flatten_customvar;
use crate::entity::{plan, structify, Entity, FieldMap};
use crate::error::{Result, ResultExt, SyncError};
use crate::storage::{query, BulkExecutor, BulkOptions};
use crate::tasks::{cancellable, Yield};
use crate::types::Binary;

use super::delta::{self, Delta, IdChecksum};
use super::{cache_key, checksum_key, SyncContext};

/// Rows written by one sync of one type.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl SyncStats {
    pub fn total(&self) -> usize {
        self.created + self.updated + self.deleted
    }
}

impl std::ops::Add for SyncStats {
    type Output = SyncStats;

    fn add(self, other: SyncStats) -> SyncStats {
        SyncStats {
            created: self.created + other.created,
            updated: self.updated + other.updated,
            deleted: self.deleted + other.deleted,
        }
    }
}

#[derive(Deserialize)]
struct ChecksumBody {
    checksum: String,
}

fn parse_id(field: &str) -> Result<Binary> {
    Binary::from_hex(field).map_err(|e| SyncError::Data(format!("invalid id {field:?}: {e}")))
}

fn parse_checksum(field: &str, body: &str) -> Result<IdChecksum> {
    let parsed: ChecksumBody = serde_json::from_str(body)?;
    let checksum = Binary::from_hex(&parsed.checksum)
        .map_err(|e| SyncError::Data(format!("invalid checksum for {field}: {e}")))?;
    Ok(IdChecksum::new(parse_id(field)?, Some(checksum)))
}

/// Structify a JSON body from a cache hash and fill its identity.
pub fn entity_from_body<T: ConfigEntity>(field: &str, body: &str, checksum: Option<&Binary>) -> Result<T> {
    let fields = FieldMap::from_json(body)?;
    let mut entity: T = structify(&fields)?;
    entity.fill_identity(&parse_id(field)?, checksum);
    Ok(entity)
}

/// `(id, checksum)` of every row of `T` in the current environment.
fn actual_rows<T: Entity>(bulk: &BulkExecutor, environment_id: &Binary, cancel: &CancellationToken) -> Yield<IdChecksum> {
    let (tx, rx) = mpsc::channel(1024);
    let db = bulk.db().clone();
    let environment_id = environment_id.clone();
    let cancel = cancel.clone();

    let task = tokio::spawn(async move {
        let table = plan::<T>().table.clone();
        let sql = query::select_checksums(db.dialect(), &table, T::CHECKSUMMED);
        let mut rows = sqlx::query(&sql)
            .bind(environment_id.into_bytes())
            .fetch(db.pool());

        while let Some(row) = cancellable(&cancel, async { Ok(rows.try_next().await?) }).await? {
            let id: Vec<u8> = row.try_get(0)?;
            let checksum: Option<Vec<u8>> = if T::CHECKSUMMED { row.try_get(1)? } else { None };
            let item = IdChecksum::new(Binary::new(id), checksum.map(Binary::new));
            if tx.send(item).await.is_err() {
                break;
            }
        }
        Ok(())
    });

    Yield { rx, task }
}

/// Feed `items` into a fresh channel from a background task.
fn feed<T: Send + 'static>(items: Vec<T>) -> mpsc::Receiver<T> {
    let (tx, rx) = mpsc::channel(1024);
    tokio::spawn(async move {
        for item in items {
            if tx.send(item).await.is_err() {
                break;
            }
        }
    });
    rx
}

/// Apply creates, updates and deletes concurrently.
pub async fn apply<T: Entity>(
    bulk: &BulkExecutor,
    cancel: &CancellationToken,
    create: Vec<T>,
    update: Vec<T>,
    delete: Vec<Binary>,
) -> Result<SyncStats> {
    let stats = SyncStats {
        created: create.len(),
        updated: update.len(),
        deleted: delete.len(),
    };
    let concurrency = bulk.db().options().max_connections_per_table;

    let creates = async {
        if create.is_empty() {
            return Ok(());
        }
        bulk.create(cancel, feed(create), BulkOptions::default().concurrency(concurrency))
            .await
    };
    let updates = async {
        if update.is_empty() {
            return Ok(());
        }
        bulk.update(cancel, feed(update), BulkOptions::default().concurrency(concurrency))
            .await
    };
    let deletes = async {
        if delete.is_empty() {
            return Ok(());
        }
        bulk.delete::<T>(cancel, feed(delete), BulkOptions::default().concurrency(concurrency))
            .await
    };
    futures::try_join!(creates, updates, deletes)?;
    Ok(stats)
}

/// Diff already structified rows against the database and apply.
pub async fn sync_values<T: Entity>(
    bulk: &BulkExecutor,
    environment_id: &Binary,
    cancel: &CancellationToken,
    desired: Vec<T>,
) -> Result<SyncStats> {
    let started = Instant::now();
    let actual = actual_rows::<T>(bulk, environment_id, cancel);
    let delta: Delta<T> = delta::compute(cancel, T::CHECKSUMMED, actual.rx, feed(desired), |row: &T| {
        IdChecksum::new(row.id().clone(), row.checksum().cloned())
    })
    .await?;
    actual.task.await??;

    let stats = apply(
        bulk,
        cancel,
        delta.create.into_values().collect(),
        delta.update.into_values().collect(),
        delta.delete.into_values().map(|row| row.id).collect(),
    )
    .await?;
    log_delta::<T>(&stats, started);
    Ok(stats)
}

/// Every body of `icinga:<key>`, structified.
pub async fn desired_bodies<T: ConfigEntity>(
    ctx: &SyncContext,
    cancel: &CancellationToken,
    key: &str,
) -> Result<Vec<T>> {
    let bodies = ctx.cache.hscan(cancel, &cache_key(key)).collect().await?;
    bodies
        .iter()
        .map(|(field, body)| entity_from_body::<T>(field, body, None))
        .collect()
}

async fn sync_checksummed<T: ConfigEntity>(
    ctx: &SyncContext,
    cancel: &CancellationToken,
    key: &str,
) -> Result<SyncStats> {
    let started = Instant::now();
    let actual = actual_rows::<T>(&ctx.bulk, &ctx.environment_id, cancel);

    let mut listing = ctx.cache.hscan(cancel, &checksum_key(key));
    let (desired_tx, desired_rx) = mpsc::channel(1024);
    let convert = tokio::spawn(async move {
        while let Some((field, body)) = listing.rx.recv().await {
            if desired_tx.send(parse_checksum(&field, &body)?).await.is_err() {
                break;
            }
        }
        listing.task.await?
    });

    let delta = delta::compute(cancel, true, actual.rx, desired_rx, Clone::clone).await?;
    actual.task.await??;
    convert.await??;

    let wanted: Vec<String> = delta.create.keys().chain(delta.update.keys()).cloned().collect();
    let creates: HashSet<&String> = delta.create.keys().collect();
    let mut create = Vec::with_capacity(delta.create.len());
    let mut update = Vec::with_capacity(delta.update.len());

    if !wanted.is_empty() {
        let mut bodies = ctx.cache.hmget(cancel, &cache_key(key), wanted);
        while let Some((field, body)) = bodies.rx.recv().await {
            let checksum = delta
                .create
                .get(&field)
                .or_else(|| delta.update.get(&field))
                .and_then(|row| row.checksum.as_ref());
            let entity: T = entity_from_body(&field, &body, checksum)?;
            if creates.contains(&field) {
                create.push(entity);
            } else {
                update.push(entity);
            }
        }
        bodies.task.await??;
    }

    let stats = apply(
        &ctx.bulk,
        cancel,
        create,
        update,
        delta.delete.into_values().map(|row| row.id).collect(),
    )
    .await?;
    log_delta::<T>(&stats, started);
    Ok(stats)
}

fn log_delta<T: Entity>(stats: &SyncStats, started: Instant) {
    let table = plan::<T>().table.clone();
    if stats.total() == 0 {
        debug!(table = %table, took = ?started.elapsed(), "Nothing to do");
    } else {
        info!(
            table = %table,
            created = stats.created,
            updated = stats.updated,
            deleted = stats.deleted,
            took = ?started.elapsed(),
            "Delta applied"
        );
    }
}

/// Full sync of one config or state type.
pub async fn sync_type<T: ConfigEntity>(
    ctx: &SyncContext,
    cancel: &CancellationToken,
    key: &str,
) -> Result<SyncStats> {
    let result = if T::CHECKSUMMED {
        sync_checksummed::<T>(ctx, cancel, key).await
    } else {
        let desired = desired_bodies::<T>(ctx, cancel, key).await?;
        sync_values(&ctx.bulk, &ctx.environment_id, cancel, desired).await
    };
    result.context(key)
}

/// Custom variables and their flattened leaves, derived from one listing.
pub async fn sync_customvars(ctx: &SyncContext, cancel: &CancellationToken) -> Result<SyncStats> {
    let customvars: Vec<Customvar> = desired_bodies(ctx, cancel, "customvar").await.context("customvar")?;
    let mut flat: Vec<CustomvarFlat> = Vec::new();
    for cv in &customvars {
        flat.extend(flatten_customvar(cv).context("customvar")?);
    }

    let (a, b) = futures::try_join!(
        sync_values(&ctx.bulk, &ctx.environment_id, cancel, customvars),
        sync_values(&ctx.bulk, &ctx.environment_id, cancel, flat)
    )?;
    Ok(a + b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::config::Zone;

    #[test]
    fn test_parse_checksum_body() {
        let id = "0a".repeat(20);
        let row = parse_checksum(&id, &format!(r#"{{"checksum":"{}"}}"#, "0b".repeat(20))).unwrap();
        assert_eq!(row.id, Binary::new(vec![0x0a; 20]));
        assert_eq!(row.checksum, Some(Binary::new(vec![0x0b; 20])));

        assert!(parse_checksum("zz", r#"{"checksum":"00"}"#).is_err());
        assert!(parse_checksum(&id, "not json").is_err());
    }

    #[test]
    fn test_entity_from_body_fills_identity() {
        let id = "01".repeat(20);
        let checksum = Binary::new(vec![2; 20]);
        let body = format!(
            r#"{{"environment_id":"{}","name":"master","is_global":false,"depth":0}}"#,
            "09".repeat(20)
        );
        let zone: Zone = entity_from_body(&id, &body, Some(&checksum)).unwrap();
        assert_eq!(zone.meta.id, Binary::new(vec![1; 20]));
        assert_eq!(zone.meta.properties_checksum, checksum);
        assert_eq!(zone.meta.environment_id, Binary::new(vec![9; 20]));
        assert_eq!(zone.name, "master");
    }

    #[test]
    fn test_stats_add() {
        let a = SyncStats { created: 1, updated: 2, deleted: 3 };
        let b = SyncStats { created: 1, updated: 0, deleted: 0 };
        assert_eq!((a + b).total(), 7);
    }
}
