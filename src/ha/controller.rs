// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Election against `icingadb_instance`.
//!
//! Every valid heartbeat runs one serializable transaction: if no other
//! endpoint of the environment holds a fresh responsible row, this replica
//! writes its own row as responsible and takes over; otherwise it writes its
//! row as standby. Only the controller task mutates the HA state.

use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::heartbeat::{Freshness, Heartbeat, HEARTBEAT_TIMEOUT};
use super::{HaState, HaStatus};
use crate::define_entity;
use crate::entity::config::Environment;
use crate::entity::{bind_values, plan, Columns, Entity};
use crate::error::{Result, SyncError};
use crate::resilience::retry::{retry_sync, RetryConfig};
use crate::storage::{query, Db};
use crate::types::objectpacker::object_id;
use crate::types::{Binary, Bool, UnixMilli};

/// Upper bound for marking the own row standby on shutdown.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

define_entity! {
    pub struct Instance {
        pub id: Binary,
        pub environment_id: Binary,
        pub endpoint_id: Binary,
        pub heartbeat: UnixMilli,
        pub responsible: Bool,
        pub icinga2_version: String,
        pub icinga2_start_time: UnixMilli,
        pub icinga2_notifications_enabled: Bool,
        pub icinga2_active_service_checks_enabled: Bool,
        pub icinga2_active_host_checks_enabled: Bool,
        pub icinga2_event_handlers_enabled: Bool,
        pub icinga2_flap_detection_enabled: Bool,
        pub icinga2_performance_data_enabled: Bool,
    }
}

impl Entity for Instance {
    const TABLE: Option<&'static str> = Some("icingadb_instance");

    fn primary_key() -> &'static str {
        "environment_id, endpoint_id"
    }

    fn id(&self) -> &Binary {
        &self.id
    }

    fn upsert_columns() -> Option<Vec<&'static str>> {
        Some(
            Self::columns()
                .into_iter()
                .filter(|c| !matches!(*c, "environment_id" | "endpoint_id"))
                .collect(),
        )
    }
}

/// Emitted when this replica becomes responsible.
#[derive(Debug, Clone, PartialEq)]
pub struct Takeover {
    pub environment_id: Binary,
    pub endpoint_id: Binary,
}

/// Emitted when this replica stops being responsible.
#[derive(Debug, Clone, PartialEq)]
pub struct Handover {
    pub reason: String,
}

/// Receiving ends of the controller. Takeover and handover hold at most one
/// pending value each.
pub struct HaSignals {
    pub takeover: mpsc::Receiver<Takeover>,
    pub handover: mpsc::Receiver<Handover>,
    pub status: watch::Receiver<HaStatus>,
}

pub struct HaController {
    db: Db,
    instance_id: Binary,
    state: HaState,
    identity: Option<(Binary, Binary)>,
    status: watch::Sender<HaStatus>,
    takeover: mpsc::Sender<Takeover>,
    handover: mpsc::Sender<Handover>,
    /// Interrupts election retries; replaced by the token given to `run`.
    cancel: CancellationToken,
}

impl HaController {
    pub fn new(db: Db) -> (Self, HaSignals) {
        let (takeover, takeover_rx) = mpsc::channel(1);
        let (handover, handover_rx) = mpsc::channel(1);
        let (status, status_rx) = watch::channel(HaStatus::default());
        let controller = Self {
            db,
            instance_id: Binary::new(uuid::Uuid::new_v4().as_bytes().to_vec()),
            state: HaState::Unresponsible,
            identity: None,
            status,
            takeover,
            handover,
            cancel: CancellationToken::new(),
        };
        let signals = HaSignals {
            takeover: takeover_rx,
            handover: handover_rx,
            status: status_rx,
        };
        (controller, signals)
    }

    pub fn state(&self) -> HaState {
        self.state
    }

    pub fn instance_id(&self) -> &Binary {
        &self.instance_id
    }

    /// Run one election round for `heartbeat`.
    pub async fn realize(&mut self, heartbeat: &Heartbeat) -> Result<()> {
        if heartbeat.freshness() == Freshness::Expired {
            warn!(sent = %heartbeat.sent, received = %heartbeat.received, "Received expired heartbeat");
            if self.state == HaState::Responsible {
                self.hand_over("heartbeat expired").await;
            }
            return Ok(());
        }

        let endpoint_id = object_id(&heartbeat.environment_id, &heartbeat.app.node_name);
        self.identity = Some((heartbeat.environment_id.clone(), endpoint_id.clone()));
        self.status.send_modify(|s| s.performance_data_enabled = heartbeat.app.enable_perfdata);

        let was_responsible = self.state == HaState::Responsible;
        let other = retry_sync("ha realize", &RetryConfig::database(), &self.cancel, || {
            self.realize_once(heartbeat, &endpoint_id, was_responsible)
        })
        .await?;

        match other {
            None if !was_responsible => {
                info!(
                    environment = %heartbeat.environment_id.to_hex(),
                    endpoint = %endpoint_id.to_hex(),
                    "Taking over"
                );
                self.state = HaState::Responsible;
                crate::metrics::set_responsible(true);
                self.status.send_modify(|s| {
                    s.responsible = true;
                    s.responsible_since = Some(heartbeat.received);
                });
                let _ = self.takeover.try_send(Takeover {
                    environment_id: heartbeat.environment_id.clone(),
                    endpoint_id,
                });
            }
            None => debug!("Refreshed responsible heartbeat"),
            Some(other) => {
                self.status.send_modify(|s| s.last_other_responsible = Some(heartbeat.received));
                if was_responsible {
                    warn!(other = %other.to_hex(), "Another instance is responsible");
                    self.set_unresponsible("another instance is responsible");
                } else {
                    debug!(other = %other.to_hex(), "Another instance is responsible");
                }
            }
        }
        Ok(())
    }

    /// One serializable election transaction. Returns the endpoint of a
    /// fresh responsible peer, if any.
    async fn realize_once(
        &self,
        heartbeat: &Heartbeat,
        endpoint_id: &Binary,
        was_responsible: bool,
    ) -> Result<Option<Binary>> {
        let dialect = self.db.dialect();
        let mut conn = self.db.pool().acquire().await?;
        let mut tx = self.db.begin_serializable(&mut conn).await?;

        let fresh_after = heartbeat.received.saturating_sub(HEARTBEAT_TIMEOUT);
        let sql = dialect.rebind(
            "SELECT endpoint_id FROM icingadb_instance \
             WHERE environment_id = ? AND endpoint_id <> ? AND responsible = 'y' AND heartbeat > ? \
             LIMIT 1",
        );
        let other: Option<Vec<u8>> = sqlx::query_scalar(&sql)
            .bind(heartbeat.environment_id.as_bytes().to_vec())
            .bind(endpoint_id.as_bytes().to_vec())
            .bind(fresh_after.millis())
            .fetch_optional(&mut *tx)
            .await?;
        let responsible = other.is_none();

        let app = &heartbeat.app;
        let row = Instance {
            id: self.instance_id.clone(),
            environment_id: heartbeat.environment_id.clone(),
            endpoint_id: endpoint_id.clone(),
            heartbeat: heartbeat.sent,
            responsible: Bool(responsible),
            icinga2_version: app.version.clone(),
            icinga2_start_time: heartbeat.program_start(),
            icinga2_notifications_enabled: Bool(app.enable_notifications),
            icinga2_active_service_checks_enabled: Bool(app.enable_service_checks),
            icinga2_active_host_checks_enabled: Bool(app.enable_host_checks),
            icinga2_event_handlers_enabled: Bool(app.enable_event_handlers),
            icinga2_flap_detection_enabled: Bool(app.enable_flapping),
            icinga2_performance_data_enabled: Bool(app.enable_perfdata),
        };
        let sql = query::upsert(dialect, &plan::<Instance>(), 1);
        bind_values(sqlx::query(&sql), row.values()).execute(&mut *tx).await?;

        if responsible && !was_responsible {
            let environment = Environment {
                id: heartbeat.environment_id.clone(),
                name: app.environment.clone(),
            };
            let sql = query::upsert(dialect, &plan::<Environment>(), 1);
            bind_values(sqlx::query(&sql), environment.values()).execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(other.map(Binary::new))
    }

    fn set_unresponsible(&mut self, reason: &str) {
        self.state = HaState::Unresponsible;
        crate::metrics::set_responsible(false);
        self.status.send_modify(|s| {
            s.responsible = false;
            s.responsible_since = None;
        });
        let _ = self.handover.try_send(Handover {
            reason: reason.to_string(),
        });
    }

    async fn mark_standby(&self) -> Result<()> {
        let Some((environment_id, endpoint_id)) = &self.identity else {
            return Ok(());
        };
        let sql = self.db.dialect().rebind(
            "UPDATE icingadb_instance SET responsible = 'n' WHERE environment_id = ? AND endpoint_id = ?",
        );
        sqlx::query(&sql)
            .bind(environment_id.as_bytes().to_vec())
            .bind(endpoint_id.as_bytes().to_vec())
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Give up responsibility: mark the own row standby (best effort, at
    /// most 5 s) and signal handover.
    async fn hand_over(&mut self, reason: &str) {
        info!(reason, "Handing over");
        match tokio::time::timeout(RELEASE_TIMEOUT, self.mark_standby()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Cannot mark instance as standby"),
            Err(_) => warn!("Timed out marking instance as standby"),
        }
        self.set_unresponsible(reason);
    }

    /// Elect on every heartbeat until cancelled. A missing heartbeat for
    /// 60 s hands over. On cancellation a responsible replica releases its
    /// row before returning.
    #[tracing::instrument(skip_all)]
    pub async fn run(mut self, cancel: CancellationToken, mut heartbeats: mpsc::Receiver<Heartbeat>) -> Result<()> {
        self.cancel = cancel.clone();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    if self.state == HaState::Responsible {
                        self.hand_over("shutdown").await;
                    }
                    return Ok(());
                }
                heartbeat = heartbeats.recv() => match heartbeat {
                    Some(heartbeat) => {
                        if let Err(e) = self.realize(&heartbeat).await {
                            if e.is_cancelled() {
                                if self.state == HaState::Responsible {
                                    self.hand_over("shutdown").await;
                                }
                                return Ok(());
                            }
                            if self.state == HaState::Responsible {
                                self.hand_over("election failed").await;
                            }
                            return Err(SyncError::Ha(e.to_string()));
                        }
                    }
                    None => return Err(SyncError::Cancelled),
                },
                _ = tokio::time::sleep(HEARTBEAT_TIMEOUT) => {
                    warn!(timeout = ?HEARTBEAT_TIMEOUT, "Lost heartbeat");
                    if self.state == HaState::Responsible {
                        self.hand_over("heartbeat lost").await;
                    }
                }
            }
        }
    }
}
