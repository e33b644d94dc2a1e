// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Runtime updates: point mutations announced on `icinga:runtime` and
//! `icinga:runtime:state`.
//!
//! ```text
//! XREAD ─▶ dispatcher ─┬─▶ host      upsert ─▶ structify ─▶ BulkUpsert
//!   │      (redis_key) │             delete ─────────────▶ BulkDelete
//!   │                  └─▶ customvar upsert ─▶ structify ─┬▶ BulkUpsert customvar
//!   ▼                                                     └▶ BulkUpsert customvar_flat
//! XTRIM MINID ~
//! ```
//!
//! FIFO types are written one row at a time and the dispatcher waits for the
//! commit before routing the next entry, so an upsert and a later delete of
//! the same id commit in stream order.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::entity::config::{ConfigEntity, Customvar, CustomvarFlat};
use crate::entity::customvar::flatten_customvar;
use crate::entity::structify;
use crate::error::{Result, SyncError};
use crate::storage::{on_success, BulkExecutor, BulkOptions, OnSuccess, StreamEntry};
use crate::tasks::{cancellable, TaskGroup};
use crate::telemetry::{Counter, Stats};
use crate::types::Binary;

use super::registry::{Registry, RuntimeMode};
use super::SyncContext;

/// Streams carrying runtime updates.
pub const RUNTIME_STREAMS: [&str; 2] = ["icinga:runtime", "icinga:runtime:state"];

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeOp {
    Upsert,
    Delete,
}

impl RuntimeOp {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "upsert" => Some(RuntimeOp::Upsert),
            "delete" => Some(RuntimeOp::Delete),
            _ => None,
        }
    }
}

/// Registry key named by a `redis_key` field, with or without the
/// `icinga:` prefix.
pub fn registry_key(redis_key: &str) -> &str {
    redis_key.strip_prefix("icinga:").unwrap_or(redis_key)
}

/// Input side of one type's worker pair.
pub struct RuntimeSink {
    mode: RuntimeMode,
    upserts: mpsc::Sender<StreamEntry>,
    deletes: mpsc::Sender<StreamEntry>,
    acks: Option<mpsc::Receiver<()>>,
}

impl RuntimeSink {
    pub fn mode(&self) -> RuntimeMode {
        self.mode
    }

    /// Route one entry; in FIFO mode wait until it is committed or skipped.
    pub async fn dispatch(&mut self, cancel: &CancellationToken, op: RuntimeOp, entry: StreamEntry) -> Result<()> {
        let tx = match op {
            RuntimeOp::Upsert => &self.upserts,
            RuntimeOp::Delete => &self.deletes,
        };
        cancellable(cancel, async { tx.send(entry).await.map_err(|_| SyncError::Cancelled) }).await?;

        if let Some(acks) = self.acks.as_mut() {
            cancellable(cancel, async { acks.recv().await.ok_or(SyncError::Cancelled) }).await?;
        }
        Ok(())
    }
}

fn counter(is_state: bool) -> Counter {
    if is_state {
        Counter::StateSync
    } else {
        Counter::ConfigSync
    }
}

/// Callback acknowledging each committed row to the dispatcher.
fn ack_each<T: Send + 'static>(ack: mpsc::Sender<()>) -> OnSuccess<T> {
    on_success(move |rows: Vec<T>| {
        let ack = ack.clone();
        async move {
            for _ in rows {
                ack.send(()).await.map_err(|_| SyncError::Cancelled)?;
            }
            Ok(())
        }
    })
}

fn count_rows<T: Send + 'static>(stats: &Arc<Stats>, counter: Counter) -> OnSuccess<T> {
    let stats = stats.clone();
    on_success(move |rows: Vec<T>| {
        stats.add(counter, rows.len() as u64);
        async { Ok(()) }
    })
}

fn options<T: Send + 'static>(
    bulk: &BulkExecutor,
    stats: &Arc<Stats>,
    mode: RuntimeMode,
    ack: Option<&mpsc::Sender<()>>,
    counter: Counter,
) -> BulkOptions<T> {
    let mut options = BulkOptions::default().on_success(count_rows(stats, counter));
    match mode {
        RuntimeMode::Fifo => {
            options = options.batch_size(1).concurrency(1);
        }
        RuntimeMode::Parallel => {
            options = options.concurrency(bulk.db().options().max_connections_per_table);
        }
    }
    if let Some(ack) = ack {
        options = options.on_success(ack_each(ack.clone()));
    }
    options
}

async fn skip(ack: Option<&mpsc::Sender<()>>) -> Result<()> {
    if let Some(ack) = ack {
        ack.send(()).await.map_err(|_| SyncError::Cancelled)?;
    }
    Ok(())
}

fn channels(mode: RuntimeMode) -> (Option<mpsc::Sender<()>>, Option<mpsc::Receiver<()>>) {
    match mode {
        RuntimeMode::Fifo => {
            let (tx, rx) = mpsc::channel(1);
            (Some(tx), Some(rx))
        }
        RuntimeMode::Parallel => (None, None),
    }
}

/// Structify upserts of `T` and feed them to the writer. Malformed entries
/// are logged and skipped; the next full sync repairs them.
async fn structify_upserts<T: ConfigEntity>(
    key: &'static str,
    cancel: CancellationToken,
    mut entries: mpsc::Receiver<StreamEntry>,
    rows: mpsc::Sender<T>,
    ack: Option<mpsc::Sender<()>>,
) -> Result<()> {
    while let Some(entry) = cancellable(&cancel, async { Ok(entries.recv().await) }).await? {
        match structify::<T>(&entry.fields) {
            Ok(row) => {
                cancellable(&cancel, async { rows.send(row).await.map_err(|_| SyncError::Cancelled) }).await?;
            }
            Err(e) => {
                error!(key, stream_id = %entry.id, error = %e, "Cannot structify runtime update, skipping");
                crate::metrics::record_error("runtime-updates", "structify");
                skip(ack.as_ref()).await?;
            }
        }
    }
    Ok(())
}

async fn parse_deletes(
    key: &'static str,
    cancel: CancellationToken,
    mut entries: mpsc::Receiver<StreamEntry>,
    ids: mpsc::Sender<Binary>,
    ack: Option<mpsc::Sender<()>>,
) -> Result<()> {
    while let Some(entry) = cancellable(&cancel, async { Ok(entries.recv().await) }).await? {
        let id = entry
            .fields
            .get("id")
            .ok_or_else(|| "missing id".to_string())
            .and_then(|raw| Binary::from_hex(raw).map_err(|e| e.to_string()));
        match id {
            Ok(id) => {
                cancellable(&cancel, async { ids.send(id).await.map_err(|_| SyncError::Cancelled) }).await?;
            }
            Err(e) => {
                error!(key, stream_id = %entry.id, error = %e, "Invalid runtime delete, skipping");
                skip(ack.as_ref()).await?;
            }
        }
    }
    Ok(())
}

/// Spawn the upsert and delete pipelines of `T`.
pub fn spawn_workers<T: ConfigEntity>(
    bulk: &BulkExecutor,
    stats: &Arc<Stats>,
    group: &mut TaskGroup,
    key: &'static str,
    mode: RuntimeMode,
    is_state: bool,
) -> RuntimeSink {
    let (upserts, upsert_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (deletes, delete_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (ack, acks) = channels(mode);
    let counter = counter(is_state);
    let token = group.token();

    let (rows_tx, rows_rx) = mpsc::channel::<T>(CHANNEL_CAPACITY);
    group.spawn(
        format!("runtime structify {key}"),
        structify_upserts::<T>(key, token.clone(), upsert_rx, rows_tx, ack.clone()),
    );
    let writer = bulk.clone();
    let opts = options::<T>(bulk, stats, mode, ack.as_ref(), counter);
    let t = token.clone();
    group.spawn(format!("runtime upsert {key}"), async move {
        writer.upsert(&t, rows_rx, opts).await
    });

    let (ids_tx, ids_rx) = mpsc::channel::<Binary>(CHANNEL_CAPACITY);
    group.spawn(
        format!("runtime parse deletes {key}"),
        parse_deletes(key, token.clone(), delete_rx, ids_tx, ack.clone()),
    );
    let writer = bulk.clone();
    let opts = options::<Binary>(bulk, stats, mode, ack.as_ref(), counter);
    group.spawn(format!("runtime delete {key}"), async move {
        writer.delete::<T>(&token, ids_rx, opts).await
    });

    RuntimeSink {
        mode,
        upserts,
        deletes,
        acks,
    }
}

/// Customvar upserts fan out to `customvar` and `customvar_flat`; deletes
/// are never produced upstream and are only logged.
pub fn spawn_customvar_workers(bulk: &BulkExecutor, stats: &Arc<Stats>, group: &mut TaskGroup) -> RuntimeSink {
    let (upserts, mut upsert_rx) = mpsc::channel::<StreamEntry>(CHANNEL_CAPACITY);
    let (deletes, mut delete_rx) = mpsc::channel::<StreamEntry>(CHANNEL_CAPACITY);
    let (ack, acks) = channels(RuntimeMode::Fifo);
    let token = group.token();

    let (cv_tx, cv_rx) = mpsc::channel::<Customvar>(CHANNEL_CAPACITY);
    let (flat_tx, flat_rx) = mpsc::channel::<CustomvarFlat>(CHANNEL_CAPACITY);

    let t = token.clone();
    let skip_ack = ack.clone();
    group.spawn("runtime structify customvar", async move {
        while let Some(entry) = cancellable(&t, async { Ok(upsert_rx.recv().await) }).await? {
            let parsed = structify::<Customvar>(&entry.fields)
                .map_err(SyncError::from)
                .and_then(|cv| Ok((flatten_customvar(&cv)?, cv)));
            match parsed {
                Ok((flat, cv)) => {
                    for row in flat {
                        cancellable(&t, async { flat_tx.send(row).await.map_err(|_| SyncError::Cancelled) }).await?;
                    }
                    cancellable(&t, async { cv_tx.send(cv).await.map_err(|_| SyncError::Cancelled) }).await?;
                }
                Err(e) => {
                    error!(stream_id = %entry.id, error = %e, "Cannot structify customvar, skipping");
                    skip(skip_ack.as_ref()).await?;
                }
            }
        }
        Ok(())
    });

    let writer = bulk.clone();
    let opts = options::<Customvar>(bulk, stats, RuntimeMode::Fifo, ack.as_ref(), Counter::ConfigSync);
    let t = token.clone();
    group.spawn("runtime upsert customvar", async move { writer.upsert(&t, cv_rx, opts).await });

    let writer = bulk.clone();
    let opts = BulkOptions::default().on_success(count_rows(stats, Counter::ConfigSync));
    let t = token.clone();
    group.spawn("runtime upsert customvar_flat", async move {
        writer.upsert(&t, flat_rx, opts).await
    });

    let t = token;
    group.spawn("runtime delete customvar", async move {
        while let Some(entry) = cancellable(&t, async { Ok(delete_rx.recv().await) }).await? {
            error!(stream_id = %entry.id, "Customvar delete received, this should not happen");
            skip(ack.as_ref()).await?;
        }
        Ok(())
    });

    RuntimeSink {
        mode: RuntimeMode::Fifo,
        upserts,
        deletes,
        acks,
    }
}

/// Reads both runtime streams from `positions` and routes entries to the
/// per-type sinks until cancelled.
pub struct RuntimeUpdates {
    ctx: SyncContext,
    registry: Arc<Registry>,
}

impl RuntimeUpdates {
    pub fn new(ctx: SyncContext, registry: Arc<Registry>) -> Self {
        Self { ctx, registry }
    }

    /// Stream ids to resume from, captured before a full sync starts.
    pub async fn positions(ctx: &SyncContext, cancel: &CancellationToken) -> Result<Vec<(String, String)>> {
        let mut positions = Vec::with_capacity(RUNTIME_STREAMS.len());
        for stream in RUNTIME_STREAMS {
            positions.push((stream.to_string(), ctx.cache.last_stream_id(cancel, stream).await?));
        }
        Ok(positions)
    }

    pub async fn run(self, cancel: &CancellationToken, positions: Vec<(String, String)>) -> Result<()> {
        let mut group = TaskGroup::new(cancel);
        let mut sinks: HashMap<&'static str, RuntimeSink> = self
            .registry
            .iter()
            .map(|t| (t.key(), t.runtime_workers(&self.ctx, &mut group)))
            .collect();

        let token = group.token();
        let ctx = self.ctx.clone();
        group.spawn("runtime reader", async move {
            let mut reader = ctx.cache.stream_reader().await?;
            let mut positions = positions;
            loop {
                let results = reader.read_until_result(&token, &positions).await?;
                for (stream, entries) in results {
                    let Some(last) = entries.last().map(|e| e.id.clone()) else { continue };
                    crate::metrics::record_stream_entries(&stream, entries.len());
                    for entry in entries {
                        route(&mut sinks, &token, entry).await?;
                    }
                    if let Some(position) = positions.iter_mut().find(|(s, _)| *s == stream) {
                        position.1 = last.clone();
                    }
                    ctx.cache.xtrim_minid_approx(&stream, &last).await;
                }
            }
        });

        group.wait().await
    }
}

/// Route one runtime entry. Unknown keys and operations are logged and
/// skipped.
pub async fn route(
    sinks: &mut HashMap<&'static str, RuntimeSink>,
    cancel: &CancellationToken,
    entry: StreamEntry,
) -> Result<()> {
    let Some(redis_key) = entry.fields.get("redis_key").map(str::to_string) else {
        error!(stream_id = %entry.id, "Runtime update without redis_key, skipping");
        return Ok(());
    };
    let Some(sink) = sinks.get_mut(registry_key(&redis_key)) else {
        error!(stream_id = %entry.id, redis_key = %redis_key, "Unknown redis_key, skipping");
        crate::metrics::record_error("runtime-updates", "redis_key");
        return Ok(());
    };
    let runtime_type = entry.fields.get("runtime_type").unwrap_or_default().to_string();
    let Some(op) = RuntimeOp::parse(&runtime_type) else {
        error!(stream_id = %entry.id, runtime_type = %runtime_type, "Unknown runtime_type, skipping");
        crate::metrics::record_error("runtime-updates", "runtime_type");
        return Ok(());
    };

    debug!(stream_id = %entry.id, redis_key = %redis_key, ?op, "Runtime update");
    sink.dispatch(cancel, op, entry).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_key_strips_prefix() {
        assert_eq!(registry_key("icinga:host:state"), "host:state");
        assert_eq!(registry_key("hostgroup:member"), "hostgroup:member");
    }

    #[test]
    fn test_runtime_op() {
        assert_eq!(RuntimeOp::parse("upsert"), Some(RuntimeOp::Upsert));
        assert_eq!(RuntimeOp::parse("delete"), Some(RuntimeOp::Delete));
        assert_eq!(RuntimeOp::parse("replace"), None);
    }

    fn entry(id: &str, fields: &[(&str, &str)]) -> StreamEntry {
        StreamEntry {
            id: id.to_string(),
            fields: fields.iter().copied().collect(),
        }
    }

    #[tokio::test]
    async fn test_route_skips_unknown() {
        let (upserts, mut upsert_rx) = mpsc::channel(4);
        let (deletes, _delete_rx) = mpsc::channel(4);
        let mut sinks = HashMap::new();
        sinks.insert(
            "host",
            RuntimeSink {
                mode: RuntimeMode::Parallel,
                upserts,
                deletes,
                acks: None,
            },
        );
        let cancel = CancellationToken::new();

        route(&mut sinks, &cancel, entry("1-0", &[("redis_key", "icinga:unknown"), ("runtime_type", "upsert")]))
            .await
            .unwrap();
        route(&mut sinks, &cancel, entry("2-0", &[("redis_key", "icinga:host"), ("runtime_type", "bogus")]))
            .await
            .unwrap();
        route(&mut sinks, &cancel, entry("3-0", &[("redis_key", "icinga:host"), ("runtime_type", "upsert")]))
            .await
            .unwrap();

        assert_eq!(upsert_rx.recv().await.unwrap().id, "3-0");
        assert!(upsert_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fifo_dispatch_waits_for_ack() {
        let (upserts, mut upsert_rx) = mpsc::channel(4);
        let (deletes, _delete_rx) = mpsc::channel(4);
        let (ack, acks) = mpsc::channel(1);
        let mut sink = RuntimeSink {
            mode: RuntimeMode::Fifo,
            upserts,
            deletes,
            acks: Some(acks),
        };
        let cancel = CancellationToken::new();

        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            sink.dispatch(&cancel, RuntimeOp::Upsert, entry("1-0", &[])),
        )
        .await;
        assert!(pending.is_err(), "dispatch must block until acknowledged");

        ack.send(()).await.unwrap();
        sink.dispatch(&cancel, RuntimeOp::Upsert, entry("2-0", &[])).await.ok();
        assert_eq!(upsert_rx.recv().await.unwrap().id, "1-0");
    }
}
