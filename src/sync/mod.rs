// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Config and state synchronization.
//!
//! - [`config_sync`]: full sync of one type (delta + apply)
//! - [`runtime`]: point mutations from the runtime streams
//! - [`dump`]: producer dump progress signals
//! - [`registry`]: the catalogue of synced types

pub mod config_sync;
pub mod delta;
pub mod dump;
pub mod registry;
pub mod runtime;

use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::Result;
use crate::storage::{BulkExecutor, CacheClient};
use crate::tasks::{cancellable, TaskGroup};
use crate::telemetry::{Counter, Stats};
use crate::types::Binary;

pub use config_sync::SyncStats;
pub use dump::DumpSignals;
pub use registry::{EntityType, Registry, RuntimeMode};
pub use runtime::RuntimeUpdates;

/// Handles shared by every sync task of one responsible scope.
#[derive(Clone)]
pub struct SyncContext {
    pub cache: CacheClient,
    pub bulk: BulkExecutor,
    pub environment_id: Binary,
    pub stats: Arc<Stats>,
}

/// Hash holding the bodies of `key`.
pub fn cache_key(key: &str) -> String {
    format!("icinga:{key}")
}

/// Hash holding the `{"checksum": ...}` listing of `key`.
pub fn checksum_key(key: &str) -> String {
    format!("icinga:checksum:{key}")
}

/// Full sync of every registered type, concurrently. Each type starts once
/// the producer has dumped its key. The first failing type cancels the
/// others.
#[tracing::instrument(skip_all)]
pub async fn full_sync(
    ctx: &SyncContext,
    registry: &Registry,
    dump: &DumpSignals,
    cancel: &CancellationToken,
) -> Result<()> {
    let started = Instant::now();
    let mut group = TaskGroup::new(cancel);

    for entity_type in registry.iter() {
        let entity_type = entity_type.clone();
        let ctx = ctx.clone();
        let token = group.token();
        let dump = dump.clone();
        group.spawn(format!("full sync {}", entity_type.key()), async move {
            dumped(&dump, entity_type.key(), &token).await?;
            let stats = entity_type.full_sync(&ctx, &token).await?;
            let counter = if entity_type.is_state() {
                Counter::StateSync
            } else {
                Counter::ConfigSync
            };
            ctx.stats.add(counter, stats.total() as u64);
            Ok(())
        });
    }

    group.wait().await?;
    info!(types = registry.len(), took = ?started.elapsed(), "Finished full sync");
    Ok(())
}

/// Wait until the producer has dumped `key`.
async fn dumped(dump: &DumpSignals, key: &str, cancel: &CancellationToken) -> Result<()> {
    let done = dump.done(&cache_key(key));
    if !done.is_cancelled() {
        debug!(key, "Waiting for dump");
        cancellable(cancel, async {
            done.cancelled().await;
            Ok(())
        })
        .await?;
    }
    Ok(())
}
