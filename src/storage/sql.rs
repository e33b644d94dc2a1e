// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL connection handling for the mirror database.
//!
//! One [`Db`] handle wraps the `sqlx` `Any` pool and knows which dialect it
//! talks to. Statement text is written with `?` placeholders and rebound for
//! PostgreSQL.
//!
//! ## sqlx Any Driver Quirks
//!
//! The `Any` driver only binds `i64`, `f64`, text and blobs, so every entity
//! column is converted through [`SqlValue`](crate::entity::SqlValue). ENUM
//! columns are never read back through `Any`; comparisons happen in SQL.

use dashmap::DashMap;
use sqlx::any::AnyPoolOptions;
use sqlx::pool::PoolConnection;
use sqlx::{Any, AnyPool, Transaction};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::config::{DatabaseConfig, DatabaseOptions, DatabaseType};
use crate::error::{Result, SyncError};
use crate::resilience::retry::{retry, retry_if, RetryConfig};

/// Schema version this build writes against.
pub const SCHEMA_VERSION: i64 = 6;

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Mysql,
    Postgres,
    Sqlite,
}

impl From<DatabaseType> for Dialect {
    fn from(kind: DatabaseType) -> Self {
        match kind {
            DatabaseType::Mysql => Dialect::Mysql,
            DatabaseType::Pgsql => Dialect::Postgres,
            DatabaseType::Sqlite => Dialect::Sqlite,
        }
    }
}

impl Dialect {
    /// Quote an identifier. Needed for tables like `user` and columns like
    /// `type`.
    pub fn quote(&self, ident: &str) -> String {
        match self {
            Dialect::Mysql => format!("`{}`", ident.replace('`', "``")),
            Dialect::Postgres | Dialect::Sqlite => format!("\"{}\"", ident.replace('"', "\"\"")),
        }
    }

    /// Quote a comma separated column list.
    pub fn quote_list(&self, columns: &str) -> String {
        columns
            .split(',')
            .map(|c| self.quote(c.trim()))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Rewrite `?` placeholders to `$n` for PostgreSQL. Question marks inside
    /// single-quoted literals are left alone.
    pub fn rebind(&self, sql: &str) -> String {
        if *self != Dialect::Postgres {
            return sql.to_string();
        }
        let mut out = String::with_capacity(sql.len() + 16);
        let mut n = 0;
        let mut in_literal = false;
        for c in sql.chars() {
            match c {
                '\'' => {
                    in_literal = !in_literal;
                    out.push(c);
                }
                '?' if !in_literal => {
                    n += 1;
                    out.push('$');
                    out.push_str(&n.to_string());
                }
                _ => out.push(c),
            }
        }
        out
    }
}

/// Shared database handle. Cheap to clone.
#[derive(Clone)]
pub struct Db {
    pool: AnyPool,
    dialect: Dialect,
    options: DatabaseOptions,
    table_semaphores: Arc<DashMap<String, Arc<Semaphore>>>,
}

impl Db {
    /// Connect with startup-mode retry (fails fast if config is wrong).
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        install_drivers();

        let dialect = Dialect::from(config.kind);
        let url = config.url();
        let options = config.options.clone();

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(options.max_connections)
                .min_connections(0)
                .acquire_timeout(Duration::from_secs(60))
                .idle_timeout(Duration::from_secs(300))
                .connect(&url)
                .await
        })
        .await?;

        let db = Self {
            pool,
            dialect,
            options,
            table_semaphores: Arc::new(DashMap::new()),
        };

        if dialect == Dialect::Sqlite {
            db.enable_wal_mode().await?;
        }

        info!(
            dialect = ?dialect,
            max_connections = db.options.max_connections,
            "Connected to database"
        );
        Ok(db)
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn options(&self) -> &DatabaseOptions {
        &self.options
    }

    async fn enable_wal_mode(&self) -> Result<()> {
        sqlx::query("PRAGMA journal_mode = WAL").execute(&self.pool).await?;
        sqlx::query("PRAGMA synchronous = NORMAL").execute(&self.pool).await?;
        Ok(())
    }

    /// Round trip to the server, retried while the error is transient.
    pub async fn ping(&self) -> Result<()> {
        retry_if("sql_ping", &RetryConfig::database(), SyncError::is_retryable, || async {
            sqlx::query("SELECT 1").execute(&self.pool).await?;
            Ok(())
        })
        .await
    }

    pub async fn table_exists(&self, table: &str) -> Result<bool> {
        let sql = match self.dialect {
            Dialect::Sqlite => "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
            Dialect::Mysql => {
                "SELECT COUNT(*) FROM information_schema.tables \
                 WHERE table_schema = DATABASE() AND table_name = ?"
            }
            Dialect::Postgres => {
                "SELECT COUNT(*) FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_name = ?"
            }
        };
        let count: i64 = sqlx::query_scalar(&self.dialect.rebind(sql))
            .bind(table)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    /// Verify the schema is present and at [`SCHEMA_VERSION`].
    pub async fn check_schema(&self) -> Result<()> {
        if !self.table_exists("icingadb_schema").await? {
            return Err(SyncError::SchemaMissing);
        }
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM icingadb_schema ORDER BY id DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;
        match version {
            None => Err(SyncError::SchemaMissing),
            Some(actual) if actual != SCHEMA_VERSION => Err(SyncError::SchemaVersion {
                expected: SCHEMA_VERSION,
                actual,
            }),
            Some(_) => {
                debug!(version = SCHEMA_VERSION, "Database schema is up to date");
                Ok(())
            }
        }
    }

    /// Execute a schema file statement by statement. `--` comment lines are
    /// skipped.
    pub async fn import_schema(&self, schema: &str) -> Result<()> {
        let stripped: String = schema
            .lines()
            .filter(|line| !line.trim_start().starts_with("--"))
            .collect::<Vec<_>>()
            .join("\n");

        for statement in stripped.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Semaphore bounding concurrent writers on one table.
    pub fn table_semaphore(&self, table: &str) -> Arc<Semaphore> {
        self.table_semaphores
            .entry(table.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.options.max_connections_per_table)))
            .clone()
    }

    /// Begin a serializable transaction on `conn`.
    ///
    /// MySQL applies `SET TRANSACTION` to the next transaction, PostgreSQL to
    /// the current one. SQLite transactions are serializable already.
    pub async fn begin_serializable<'c>(
        &self,
        conn: &'c mut PoolConnection<Any>,
    ) -> Result<Transaction<'c, Any>> {
        const SET: &str = "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE";

        if self.dialect == Dialect::Mysql {
            sqlx::query(SET).execute(&mut **conn).await?;
        }
        let mut tx = sqlx::Connection::begin(&mut **conn).await?;
        if self.dialect == Dialect::Postgres {
            sqlx::query(SET).execute(&mut *tx).await?;
        }
        Ok(tx)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
