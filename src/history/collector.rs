// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Completion tracking and stream trimming for history replay.
//!
//! An entry is acknowledged (`XDEL`) only once every stage of its kind has
//! reported it. Ids are buffered and deleted in batches.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::batching::{BatchConfig, Batcher};
use crate::error::{Result, SyncError};
use crate::storage::CacheClient;
use crate::tasks::cancellable;
use crate::telemetry::{Counter, Stats};

const TRIM_BATCH: usize = 1000;
const TRIM_INTERVAL: Duration = Duration::from_millis(250);

/// Deletes acknowledged entries from a stream.
#[async_trait]
pub trait StreamAck: Send + Sync {
    async fn xdel(&self, cancel: &CancellationToken, stream: &str, ids: &[String]) -> Result<usize>;
}

#[async_trait]
impl StreamAck for CacheClient {
    async fn xdel(&self, cancel: &CancellationToken, stream: &str, ids: &[String]) -> Result<usize> {
        CacheClient::xdel(self, cancel, stream, ids).await
    }
}

/// Per-entry stage counts.
#[derive(Debug)]
pub struct Completion {
    stages: usize,
    pending: HashMap<String, usize>,
}

impl Completion {
    pub fn new(stages: usize) -> Self {
        Self {
            stages: stages.max(1),
            pending: HashMap::new(),
        }
    }

    /// Record one stage finishing `id`; true once all stages have.
    pub fn complete(&mut self, id: &str) -> bool {
        let seen = self.pending.entry(id.to_string()).or_insert(0);
        *seen += 1;
        if *seen >= self.stages {
            self.pending.remove(id);
            true
        } else {
            false
        }
    }

    /// Entries with at least one but not all stages done.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

/// Forward ids to `trim` once all stages reported them.
pub async fn collect(
    stages: usize,
    cancel: CancellationToken,
    mut completed: mpsc::Receiver<String>,
    trim: mpsc::Sender<String>,
) -> Result<()> {
    let mut completion = Completion::new(stages);
    while let Some(id) = cancellable(&cancel, async { Ok(completed.recv().await) }).await? {
        if completion.complete(&id) {
            cancellable(&cancel, async { trim.send(id).await.map_err(|_| SyncError::Cancelled) }).await?;
        }
    }
    trace!(in_flight = completion.in_flight(), "Completion collector finished");
    Ok(())
}

/// Delete fully processed entries, flushing every [`TRIM_BATCH`] ids or
/// 250 ms after the first buffered one.
pub async fn trim(
    ack: Arc<dyn StreamAck>,
    stats: Arc<Stats>,
    cancel: CancellationToken,
    stream: String,
    ids: mpsc::Receiver<String>,
) -> Result<()> {
    let mut batcher = Batcher::new(
        ids,
        BatchConfig {
            flush_count: TRIM_BATCH,
            flush_interval: TRIM_INTERVAL,
        },
    );

    while let Some(batch) = cancellable(&cancel, async { Ok(batcher.next_batch().await) }).await? {
        let deleted = ack.xdel(&cancel, &stream, &batch.items).await?;
        trace!(stream = %stream, count = batch.items.len(), deleted, reason = ?batch.reason, "Trimmed history stream");
        stats.add(Counter::HistorySync, batch.items.len() as u64);
    }
    Ok(())
}
