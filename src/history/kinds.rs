// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Destination stages of each history kind.

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::entity::history::{self as rows, HistoryKind};
use crate::entity::{plan, Entity, FieldMap, StructifyError};
use crate::error::SyncError;
use crate::storage::{on_success, BulkExecutor, BulkOptions, StreamEntry, Tracked};
use crate::tasks::{cancellable, TaskGroup};

const CHANNEL_CAPACITY: usize = 1024;

/// Derives zero or one destination row from an entry.
pub type Structifier<E> = Arc<dyn Fn(&FieldMap) -> Result<Option<E>, StructifyError> + Send + Sync>;

/// One destination table of a history kind.
pub trait Stage: Send + Sync {
    fn table(&self) -> String;

    /// Spawn the structify and upsert tasks of this stage. Every entry read
    /// from `input` is eventually reported on `completed`, either after its
    /// row committed or right away when it yields no row.
    fn spawn(
        &self,
        bulk: &BulkExecutor,
        kind: HistoryKind,
        group: &mut TaskGroup,
        input: mpsc::Receiver<StreamEntry>,
        completed: mpsc::Sender<String>,
    );
}

struct UpsertStage<E> {
    structify: Structifier<E>,
}

impl<E: Entity> Stage for UpsertStage<E> {
    fn table(&self) -> String {
        plan::<E>().table.clone()
    }

    fn spawn(
        &self,
        bulk: &BulkExecutor,
        kind: HistoryKind,
        group: &mut TaskGroup,
        mut input: mpsc::Receiver<StreamEntry>,
        completed: mpsc::Sender<String>,
    ) {
        let table = self.table();
        let token = group.token();
        let (rows_tx, rows_rx) = mpsc::channel::<Tracked<E>>(CHANNEL_CAPACITY);

        let structify = self.structify.clone();
        let skipped = completed.clone();
        let t = token.clone();
        group.spawn(format!("history {kind} structify {table}"), async move {
            while let Some(entry) = cancellable(&t, async { Ok(input.recv().await) }).await? {
                let row = structify(&entry.fields)
                    .map_err(|e| SyncError::from(e).context(format!("{kind} entry {}", entry.id)))?;
                let sent = match row {
                    Some(entity) => {
                        let tracked = Tracked {
                            entity,
                            stream_id: entry.id,
                        };
                        cancellable(&t, async { rows_tx.send(tracked).await.map_err(|_| SyncError::Cancelled) }).await
                    }
                    None => cancellable(&t, async { skipped.send(entry.id).await.map_err(|_| SyncError::Cancelled) }).await,
                };
                sent?;
            }
            Ok(())
        });

        let concurrency = bulk.db().options().max_connections_per_table;
        let options = BulkOptions::default()
            .concurrency(concurrency)
            .on_success(on_success(move |rows: Vec<Tracked<E>>| {
                let completed = completed.clone();
                async move {
                    for row in rows {
                        completed.send(row.stream_id).await.map_err(|_| SyncError::Cancelled)?;
                    }
                    Ok(())
                }
            }));
        let writer = bulk.clone();
        group.spawn(format!("history {kind} upsert {table}"), async move {
            writer.upsert(&token, rows_rx, options).await
        });
    }
}

fn stage<E, F>(structify: F) -> Box<dyn Stage>
where
    E: Entity,
    F: Fn(&FieldMap) -> Result<Option<E>, StructifyError> + Send + Sync + 'static,
{
    Box::new(UpsertStage::<E> {
        structify: Arc::new(structify),
    })
}

fn umbrella(kind: HistoryKind) -> Box<dyn Stage> {
    stage(move |fields: &FieldMap| rows::history(kind, fields))
}

/// Stages of `kind`, in no particular order.
pub fn stages(kind: HistoryKind) -> Vec<Box<dyn Stage>> {
    match kind {
        HistoryKind::State => vec![
            stage(rows::state_history),
            umbrella(kind),
            stage(rows::sla_history_state),
        ],
        HistoryKind::Notification => vec![stage(rows::notification_history), umbrella(kind)],
        HistoryKind::UserNotification => vec![stage(rows::user_notification_history)],
        HistoryKind::Downtime => vec![
            stage(rows::downtime_history),
            umbrella(kind),
            stage(rows::sla_history_downtime),
        ],
        HistoryKind::Comment => vec![stage(rows::comment_history), umbrella(kind)],
        HistoryKind::Flapping => vec![stage(rows::flapping_history), umbrella(kind)],
        HistoryKind::Acknowledgement => vec![stage(rows::acknowledgement_history), umbrella(kind)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables(kind: HistoryKind) -> Vec<String> {
        stages(kind).iter().map(|s| s.table()).collect()
    }

    #[test]
    fn test_stage_tables() {
        assert_eq!(tables(HistoryKind::State), ["state_history", "history", "sla_history_state"]);
        assert_eq!(tables(HistoryKind::UserNotification), ["user_notification_history"]);
        assert_eq!(
            tables(HistoryKind::Downtime),
            ["downtime_history", "history", "sla_history_downtime"]
        );
        assert_eq!(tables(HistoryKind::Acknowledgement), ["acknowledgement_history", "history"]);
        for kind in HistoryKind::ALL {
            assert!(!stages(kind).is_empty(), "{kind}");
        }
    }
}
