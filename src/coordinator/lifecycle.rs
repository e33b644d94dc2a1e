// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Supervisor lifecycle: start, HA loop, responsible scope, shutdown.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SyncError};
use crate::ha::{heartbeat, HaController, HaSignals, Handover, Takeover};
use crate::history::HistorySync;
use crate::retention::Retention;
use crate::storage::{BulkExecutor, CacheClient, Db};
use crate::sync::{full_sync, DumpSignals, Registry, RuntimeUpdates, SyncContext};
use crate::tasks::{cancellable, TaskGroup};
use crate::telemetry::{log_progress, Telemetry};

use super::{DaemonState, ScopeExit, Supervisor, SHUTDOWN_GRACE};

impl Supervisor {
    /// Connect to Redis and the database and verify the schema.
    ///
    /// Connection attempts use startup-mode retry; a schema that is missing
    /// or at the wrong version is fatal.
    #[tracing::instrument(skip(self))]
    pub async fn start(&mut self) -> Result<()> {
        let startup_start = Instant::now();
        info!("Starting icingadb-sync");
        self.set_state(DaemonState::Connecting);

        // ========== PHASE 1: Connect to Redis ==========
        let cache = CacheClient::connect(&self.config.redis).await.map_err(|e| {
            crate::metrics::record_error("redis", "connect");
            e.context("can't connect to redis")
        })?;
        self.cache = Some(cache);

        // ========== PHASE 2: Connect to the database ==========
        let db = Db::connect(&self.config.database).await.map_err(|e| {
            crate::metrics::record_error("database", "connect");
            e.context("can't connect to database")
        })?;
        db.ping().await?;

        // ========== PHASE 3: Check the schema version ==========
        self.set_state(DaemonState::CheckingSchema);
        if let Err(e) = db.check_schema().await {
            match &e {
                SyncError::SchemaMissing => {
                    error!("No database schema exists, import the schema file first")
                }
                SyncError::SchemaVersion { .. } => {
                    error!(error = %e, "Apply the pending schema upgrades and restart")
                }
                _ => {}
            }
            self.last_error.set(&e);
            return Err(e);
        }
        self.db = Some(db);

        self.set_state(DaemonState::Standby);
        info!(took = ?startup_start.elapsed(), "Started, waiting for HA election");
        Ok(())
    }

    /// Run until `cancel` fires or a fatal error occurs.
    ///
    /// Heartbeat, HA and telemetry run for the whole process. Every takeover
    /// starts a responsible scope which is cancelled again on handover.
    #[tracing::instrument(skip_all)]
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        let (Some(db), Some(cache)) = (self.db.clone(), self.cache.clone()) else {
            return Err(SyncError::Task("supervisor run before start".into()));
        };

        let daemon = cancel.child_token();
        let (controller, signals) = HaController::new(db.clone());
        let HaSignals {
            mut takeover,
            mut handover,
            status,
        } = signals;

        // ========== Process-wide tasks ==========
        let mut background = TaskGroup::new(&daemon);
        let (heartbeat_tx, heartbeat_rx) = mpsc::channel(1);
        {
            let cache = cache.clone();
            let token = background.token();
            background.spawn("heartbeat", async move { heartbeat::listen(cache, token, heartbeat_tx).await });
        }
        background.spawn("high-availability", controller.run(background.token(), heartbeat_rx));
        background.spawn(
            "telemetry",
            Telemetry::new(cache.clone(), self.stats.clone(), status, self.last_error.clone())
                .run(background.token()),
        );
        background.spawn(
            "progress",
            log_progress(self.stats.clone(), self.config.logging.interval(), background.token()),
        );
        let background = watch_background(background, daemon.clone(), self.last_error.clone());

        // ========== HA loop ==========
        let result = loop {
            let next = tokio::select! {
                biased;
                _ = daemon.cancelled() => None,
                next = takeover.recv() => next,
            };
            let Some(next) = next else { break Ok(()) };

            self.set_state(DaemonState::Responsible);
            let exit = self
                .responsible(&db, &cache, next, &mut handover, &daemon)
                .await;
            self.set_state(DaemonState::Standby);

            match exit {
                Ok(ScopeExit::Handover(reason)) => info!(reason = %reason, "Stopped sync after handover"),
                Ok(ScopeExit::Shutdown) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        // ========== Stop process-wide tasks ==========
        self.set_state(DaemonState::ShuttingDown);
        daemon.cancel();
        let background = match tokio::time::timeout(SHUTDOWN_GRACE, background).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(SyncError::from(e)),
            Err(_) => {
                warn!("Background tasks did not stop in time");
                Ok(())
            }
        };

        // The first real error wins; a background failure is what cancelled
        // the loop in that case.
        match (result, background) {
            (Err(e), _) if !e.is_cancelled() => Err(e),
            (_, Err(e)) if !e.is_cancelled() => Err(e),
            _ => Ok(()),
        }
    }

    /// One responsible period, from takeover until handover, shutdown or a
    /// fatal error.
    #[tracing::instrument(skip_all, fields(environment = %takeover.environment_id.to_hex()))]
    async fn responsible(
        &self,
        db: &Db,
        cache: &CacheClient,
        takeover: Takeover,
        handover: &mut mpsc::Receiver<Handover>,
        daemon: &CancellationToken,
    ) -> Result<ScopeExit> {
        // A handover queued before this takeover is stale.
        while handover.try_recv().is_ok() {}

        info!("Taking over, starting sync");
        let ctx = SyncContext {
            cache: cache.clone(),
            bulk: BulkExecutor::new(db.clone()),
            environment_id: takeover.environment_id,
            stats: self.stats.clone(),
        };
        let dump = DumpSignals::new();
        let mut scope = TaskGroup::new(daemon);

        {
            let dump = dump.clone();
            let cache = cache.clone();
            let token = scope.token();
            scope.spawn("dump-signals", async move { dump.listen(&cache, &token).await });
        }
        {
            let ctx = ctx.clone();
            let registry = self.registry.clone();
            let dump = dump.clone();
            let token = scope.token();
            scope.spawn("config-sync", async move { config_sync(ctx, registry, dump, token).await });
        }
        {
            let history = HistorySync::new(cache.clone(), ctx.bulk.clone(), self.stats.clone());
            let token = scope.token();
            scope.spawn("history-sync", async move { history.run(&token).await });
        }
        {
            let retention = Retention::new(
                db.clone(),
                ctx.environment_id.clone(),
                self.config.retention.clone(),
                self.stats.clone(),
            );
            let token = scope.token();
            scope.spawn("retention", async move { retention.run(&token).await });
        }

        let token = scope.token();
        let mut wait = Box::pin(scope.wait());
        let exit = tokio::select! {
            result = &mut wait => return self.scope_result(result),
            reason = handover.recv() => match reason {
                Some(Handover { reason }) => ScopeExit::Handover(reason),
                None => ScopeExit::Shutdown,
            },
            _ = daemon.cancelled() => ScopeExit::Shutdown,
        };

        debug!(exit = ?exit, "Cancelling sync");
        token.cancel();
        match tokio::time::timeout(SHUTDOWN_GRACE, wait).await {
            Ok(result) => {
                self.scope_result(result)?;
            }
            Err(_) => warn!(grace = ?SHUTDOWN_GRACE, "Sync tasks did not stop in time"),
        }
        Ok(exit)
    }

    fn scope_result(&self, result: Result<()>) -> Result<ScopeExit> {
        match result {
            Err(e) if !e.is_cancelled() => {
                error!(error = %e, "Sync failed");
                crate::metrics::record_error("supervisor", "fatal");
                self.last_error.set(&e);
                Err(e)
            }
            _ => Ok(ScopeExit::Shutdown),
        }
    }

    /// Mark the state and release the connection pool.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&mut self) {
        self.set_state(DaemonState::ShuttingDown);
        if let Some(db) = self.db.take() {
            db.close().await;
        }
        self.cache = None;
        info!("Shutdown complete");
    }
}

/// Await the process-wide group in the background. A failure cancels the
/// daemon.
fn watch_background(
    background: TaskGroup,
    daemon: CancellationToken,
    last_error: crate::telemetry::LastError,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let result = background.wait().await;
        if let Err(e) = &result {
            if !e.is_cancelled() {
                error!(error = %e, "Background task failed");
                last_error.set(e);
                daemon.cancel();
            }
        }
        result
    })
}

/// Wait for the initial dump, capture runtime positions, full sync, then
/// follow runtime updates. A new dump restarts the whole sequence.
async fn config_sync(
    ctx: SyncContext,
    registry: Arc<Registry>,
    dump: DumpSignals,
    cancel: CancellationToken,
) -> Result<()> {
    let mut progress = dump.in_progress();
    loop {
        progress.borrow_and_update();
        let round = cancel.child_token();
        let mut sync = std::pin::pin!(sync_round(&ctx, &registry, &dump, &round));

        tokio::select! {
            result = &mut sync => return result,
            changed = progress.changed() => {
                if changed.is_err() {
                    return Err(SyncError::Cancelled);
                }
                info!("Dump in progress, restarting config sync");
                round.cancel();
                match sync.await {
                    Err(e) if !e.is_cancelled() => return Err(e),
                    _ => {}
                }
            }
        }
    }
}

async fn sync_round(
    ctx: &SyncContext,
    registry: &Arc<Registry>,
    dump: &DumpSignals,
    cancel: &CancellationToken,
) -> Result<()> {
    let positions = RuntimeUpdates::positions(ctx, cancel).await?;
    full_sync(ctx, registry, dump, cancel).await?;

    let all_done = dump.all_done();
    cancellable(cancel, async {
        all_done.cancelled().await;
        Ok(())
    })
    .await?;
    info!("Following runtime updates");
    RuntimeUpdates::new(ctx.clone(), registry.clone())
        .run(cancel, positions)
        .await
}
