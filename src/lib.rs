// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # icingadb-sync
//!
//! Mirrors monitoring configuration, runtime state and event history from
//! Redis into a relational database (MySQL, PostgreSQL or SQLite).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Redis                              │
//! │  icinga:<type> hashes   icinga:runtime*   icinga:history:*  │
//! │  icinga:stats (producer heartbeat)   icinga:dump            │
//! └─────────────────────────────────────────────────────────────┘
//!          │                    │                    │
//!   (full sync: delta)   (runtime updates)   (history replay)
//!          ▼                    ▼                    ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Bulk DML executor                        │
//! │  • placeholder-sized batches, per-table semaphores          │
//! │  • retry with backoff on deadlocks and dropped connections  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    SQL database                             │
//! │  • icingadb_instance: HA election, one responsible replica  │
//! │  • retention sweeper deletes aged-out history               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use icingadb_sync::{Config, Supervisor};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_toml_str(
//!         r#"
//!         [database]
//!         type = "mysql"
//!         host = "localhost"
//!         database = "icingadb"
//!         user = "icingadb"
//!         password = "secret"
//!         "#,
//!     )
//!     .expect("valid config");
//!
//!     let mut supervisor = Supervisor::new(config);
//!     supervisor.start().await.expect("Failed to start");
//!     supervisor.run(CancellationToken::new()).await.expect("Sync failed");
//!     supervisor.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: the [`Supervisor`] driving startup and the HA loop
//! - [`sync`]: full config/state sync, runtime updates, dump signals
//! - [`history`]: history stream replay with ack-after-commit
//! - [`ha`]: heartbeat parsing and the HA election
//! - [`storage`]: database pool, bulk executor, Redis client
//! - [`entity`]: table rows and their structifiers
//! - [`retention`]: paced deletion of old history
//! - [`telemetry`]: heartbeat and stats written back to Redis
//! - [`resilience`]: retry policies for transient failures

pub mod batching;
pub mod config;
pub mod coordinator;
pub mod entity;
pub mod error;
pub mod ha;
pub mod history;
pub mod logging;
pub mod metrics;
pub mod resilience;
pub mod retention;
pub mod storage;
pub mod sync;
pub mod tasks;
pub mod telemetry;
pub mod types;

// Note: We don't expose a `tracing` module to avoid conflict with the tracing crate

pub use config::Config;
pub use coordinator::{DaemonState, Supervisor};
pub use error::{Result, SyncError};
pub use resilience::retry::RetryConfig;
pub use storage::{BulkExecutor, CacheClient, Db};
pub use types::{Binary, Bool, UnixMilli};
