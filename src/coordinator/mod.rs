// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Daemon supervisor.
//!
//! The [`Supervisor`] owns the Redis and database handles and ties the
//! subsystems together:
//! - heartbeat listener, HA controller and telemetry for the whole process
//! - while responsible: dump listener, full sync followed by runtime
//!   updates, history replay and retention
//!
//! # Lifecycle
//!
//! ```text
//! Created → Connecting → CheckingSchema → Standby ⇄ Responsible → ShuttingDown
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use icingadb_sync::{Config, Supervisor};
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), icingadb_sync::SyncError> {
//! let config = Config::load("/etc/icingadb/config.toml")?;
//! let mut supervisor = Supervisor::new(config);
//! supervisor.start().await?;
//! supervisor.run(CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

mod lifecycle;
mod types;

pub use types::{DaemonState, ScopeExit};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::config::Config;
use crate::storage::{CacheClient, Db};
use crate::sync::Registry;
use crate::telemetry::{LastError, Stats};

/// Upper bound for children to stop after cancellation.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct Supervisor {
    pub(super) config: Config,

    /// State (broadcast to watchers)
    pub(super) state: watch::Sender<DaemonState>,
    pub(super) state_rx: watch::Receiver<DaemonState>,

    pub(super) registry: Arc<Registry>,
    pub(super) stats: Arc<Stats>,
    pub(super) last_error: LastError,

    /// Set by [`Supervisor::start`]
    pub(super) db: Option<Db>,
    pub(super) cache: Option<CacheClient>,
}

impl Supervisor {
    /// The supervisor starts in `Created` state. Call
    /// [`start()`](Self::start) to connect.
    pub fn new(config: Config) -> Self {
        let (state, state_rx) = watch::channel(DaemonState::Created);
        Self {
            config,
            state,
            state_rx,
            registry: Arc::new(Registry::default()),
            stats: Arc::new(Stats::new()),
            last_error: LastError::default(),
            db: None,
            cache: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> DaemonState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<DaemonState> {
        self.state_rx.clone()
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    /// Text of the last fatal or HA error, as reported in telemetry.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.get()
    }

    pub(super) fn set_state(&self, state: DaemonState) {
        let _ = self.state.send(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseConfig, LoggingConfig, RedisConfig, RetentionConfig};

    #[test]
    fn test_new_is_created() {
        let supervisor = Supervisor::new(Config {
            database: DatabaseConfig::sqlite("unused.db"),
            redis: RedisConfig::default(),
            logging: LoggingConfig::default(),
            retention: RetentionConfig::default(),
        });
        assert_eq!(supervisor.state(), DaemonState::Created);
        assert_eq!(supervisor.registry.len(), 20);
        assert!(supervisor.last_error().is_none());

        let rx = supervisor.state_receiver();
        supervisor.set_state(DaemonState::Standby);
        assert_eq!(*rx.borrow(), DaemonState::Standby);
    }
}
