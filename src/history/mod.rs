// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! History replay: drains `icinga:history:stream:<kind>` into the history
//! tables, at least once.
//!
//! # Pipeline per kind
//!
//! ```text
//! XREAD ─▶ fan-out ─┬─▶ stage 1 (structify ─▶ BulkUpsert) ─┐
//!                   ├─▶ stage 2 ...                        ├─▶ completion ─▶ XDEL
//!                   └─▶ stage N ...                        ┘
//! ```
//!
//! Deleting the stream entry is the only acknowledgement. Upserts are
//! idempotent, so a crash between commit and `XDEL` replays the entry
//! without duplicating rows.

pub mod collector;
pub mod kinds;

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::entity::history::HistoryKind;
use crate::error::{Result, ResultExt, SyncError};
use crate::storage::{BulkExecutor, CacheClient, StreamEntry, StreamReader};
use crate::tasks::{cancellable, TaskGroup};
use crate::telemetry::Stats;

pub use collector::{Completion, StreamAck};

const CHANNEL_CAPACITY: usize = 1024;

/// Process entries of one kind until `entries` closes or `cancel` fires.
///
/// Returns the first stage error; entries not fully committed by then stay
/// in the stream.
pub async fn process(
    bulk: &BulkExecutor,
    ack: Arc<dyn StreamAck>,
    stats: Arc<Stats>,
    kind: HistoryKind,
    cancel: &CancellationToken,
    mut entries: mpsc::Receiver<StreamEntry>,
) -> Result<()> {
    let stages = kinds::stages(kind);
    let mut group = TaskGroup::new(cancel);
    let (completed_tx, completed_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (trim_tx, trim_rx) = mpsc::channel(CHANNEL_CAPACITY);

    let mut inputs = Vec::with_capacity(stages.len());
    for stage in &stages {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        stage.spawn(bulk, kind, &mut group, rx, completed_tx.clone());
        inputs.push(tx);
    }
    drop(completed_tx);

    group.spawn(
        format!("history {kind} collector"),
        collector::collect(stages.len(), group.token(), completed_rx, trim_tx),
    );
    group.spawn(
        format!("history {kind} trim"),
        collector::trim(ack, stats, group.token(), kind.stream_key(), trim_rx),
    );

    let token = group.token();
    group.spawn(format!("history {kind} fan-out"), async move {
        while let Some(entry) = cancellable(&token, async { Ok(entries.recv().await) }).await? {
            for input in &inputs {
                let entry = entry.clone();
                cancellable(&token, async { input.send(entry).await.map_err(|_| SyncError::Cancelled) }).await?;
            }
        }
        Ok(())
    });

    group.wait().await
}

/// Replays every history kind concurrently.
pub struct HistorySync {
    cache: CacheClient,
    bulk: BulkExecutor,
    stats: Arc<Stats>,
}

impl HistorySync {
    pub fn new(cache: CacheClient, bulk: BulkExecutor, stats: Arc<Stats>) -> Self {
        Self { cache, bulk, stats }
    }

    #[tracing::instrument(skip_all)]
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        info!(kinds = HistoryKind::ALL.len(), "Starting history sync");
        let mut group = TaskGroup::new(cancel);
        for kind in HistoryKind::ALL {
            let cache = self.cache.clone();
            let bulk = self.bulk.clone();
            let stats = self.stats.clone();
            let token = group.token();
            group.spawn(format!("history {kind}"), async move {
                sync_kind(cache, bulk, stats, kind, token).await.context(kind.as_str())
            });
        }
        group.wait().await
    }
}

/// Read one stream from the beginning and feed [`process`].
async fn sync_kind(
    cache: CacheClient,
    bulk: BulkExecutor,
    stats: Arc<Stats>,
    kind: HistoryKind,
    cancel: CancellationToken,
) -> Result<()> {
    let reader = cache.stream_reader().await?;
    let (tx, rx) = mpsc::channel(cache.options().xread_count.max(1));
    let ack: Arc<dyn StreamAck> = Arc::new(cache.clone());
    let scope = cancel.child_token();

    let processed = async {
        let result = process(&bulk, ack, stats, kind, &scope, rx).await;
        scope.cancel();
        result
    };
    let (read, processed) = tokio::join!(read_stream(reader, kind.stream_key(), tx, &scope), processed);
    match (read, processed) {
        (Err(e), _) if !e.is_cancelled() => Err(e),
        (_, result) => result,
    }
}

async fn read_stream(
    mut reader: StreamReader,
    stream: String,
    tx: mpsc::Sender<StreamEntry>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut position = vec![(stream, "0-0".to_string())];
    loop {
        for (key, batch) in reader.read_until_result(cancel, &position).await? {
            debug!(stream = %key, count = batch.len(), "Read history entries");
            crate::metrics::record_stream_entries(&key, batch.len());
            if let Some(last) = batch.last() {
                position[0].1 = last.id.clone();
            }
            for entry in batch {
                cancellable(cancel, async { tx.send(entry).await.map_err(|_| SyncError::Cancelled) }).await?;
            }
        }
    }
}
