// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Daemon configuration.
//!
//! # Example
//!
//! ```
//! use icingadb_sync::Config;
//!
//! let config = Config::from_toml_str(r#"
//!     [database]
//!     type = "mysql"
//!     host = "localhost"
//!     database = "icingadb"
//!     user = "icingadb"
//!     password = "secret"
//!
//!     [retention]
//!     history_days = 30
//! "#).unwrap();
//!
//! assert_eq!(config.database.port(), 3306);
//! assert_eq!(config.redis.port, 6380);
//! assert_eq!(config.retention.count, 5000);
//! ```

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::SyncError;
use crate::retention::RETENTION_CATEGORIES;

/// Top-level configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

impl Config {
    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("can't read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, SyncError> {
        let config: Config =
            toml::from_str(raw).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        self.database.validate()?;
        self.redis.validate()?;
        self.logging.validate()?;
        self.retention.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    Mysql,
    #[serde(alias = "postgres", alias = "postgresql")]
    Pgsql,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(rename = "type", default = "default_database_type")]
    pub kind: DatabaseType,
    /// Server host, or the database file for SQLite.
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub options: DatabaseOptions,
}

fn default_database_type() -> DatabaseType { DatabaseType::Mysql }

impl DatabaseConfig {
    /// A SQLite configuration pointing at `path`. Used by tests and tools.
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self {
            kind: DatabaseType::Sqlite,
            host: path.into(),
            port: None,
            database: String::new(),
            user: String::new(),
            password: String::new(),
            options: DatabaseOptions::default(),
        }
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(match self.kind {
            DatabaseType::Mysql => 3306,
            DatabaseType::Pgsql => 5432,
            DatabaseType::Sqlite => 0,
        })
    }

    /// Connection URL understood by the sqlx `Any` driver.
    #[must_use]
    pub fn url(&self) -> String {
        match self.kind {
            DatabaseType::Sqlite => format!("sqlite://{}?mode=rwc", self.host),
            DatabaseType::Mysql | DatabaseType::Pgsql => {
                let scheme = if self.kind == DatabaseType::Mysql { "mysql" } else { "postgres" };
                let auth = if self.user.is_empty() {
                    String::new()
                } else if self.password.is_empty() {
                    format!("{}@", escape_userinfo(&self.user))
                } else {
                    format!("{}:{}@", escape_userinfo(&self.user), escape_userinfo(&self.password))
                };
                format!("{}://{}{}:{}/{}", scheme, auth, self.host, self.port(), self.database)
            }
        }
    }

    fn validate(&self) -> Result<(), SyncError> {
        if self.host.is_empty() {
            return Err(SyncError::Config("database.host is required".into()));
        }
        if self.kind != DatabaseType::Sqlite && self.database.is_empty() {
            return Err(SyncError::Config("database.database is required".into()));
        }
        self.options.validate()
    }
}

/// Percent-encode the characters that would break the authority section.
fn escape_userinfo(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '-' | '.' | '_' | '~' => out.push(c),
            _ => {
                let mut buf = [0u8; 4];
                for b in c.encode_utf8(&mut buf).bytes() {
                    out.push_str(&format!("%{:02X}", b));
                }
            }
        }
    }
    out
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseOptions {
    /// Pool size; idle connections are capped at a third of it.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_max_placeholders_per_statement")]
    pub max_placeholders_per_statement: usize,
    #[serde(default = "default_max_rows_per_transaction")]
    pub max_rows_per_transaction: usize,
    #[serde(default = "default_max_connections_per_table")]
    pub max_connections_per_table: usize,
}

fn default_max_connections() -> u32 { 16 }
fn default_max_placeholders_per_statement() -> usize { 8192 }
fn default_max_rows_per_transaction() -> usize { 8192 }
fn default_max_connections_per_table() -> usize { 8 }

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_placeholders_per_statement: default_max_placeholders_per_statement(),
            max_rows_per_transaction: default_max_rows_per_transaction(),
            max_connections_per_table: default_max_connections_per_table(),
        }
    }
}

impl DatabaseOptions {
    #[must_use]
    pub fn max_idle_connections(&self) -> u32 {
        self.max_connections / 3
    }

    fn validate(&self) -> Result<(), SyncError> {
        if self.max_connections == 0 {
            return Err(SyncError::Config("database.options.max_connections must be positive".into()));
        }
        if self.max_placeholders_per_statement == 0 {
            return Err(SyncError::Config(
                "database.options.max_placeholders_per_statement must be positive".into(),
            ));
        }
        if self.max_rows_per_transaction == 0 {
            return Err(SyncError::Config(
                "database.options.max_rows_per_transaction must be positive".into(),
            ));
        }
        if self.max_connections_per_table == 0 {
            return Err(SyncError::Config(
                "database.options.max_connections_per_table must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub options: RedisOptions,
}

fn default_redis_host() -> String { "localhost".into() }
fn default_redis_port() -> u16 { 6380 }

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            password: None,
            options: RedisOptions::default(),
        }
    }
}

impl RedisConfig {
    #[must_use]
    pub fn url(&self) -> String {
        match &self.password {
            Some(pw) if !pw.is_empty() => {
                format!("redis://:{}@{}:{}", escape_userinfo(pw), self.host, self.port)
            }
            _ => format!("redis://{}:{}", self.host, self.port),
        }
    }

    fn validate(&self) -> Result<(), SyncError> {
        if self.host.is_empty() {
            return Err(SyncError::Config("redis.host must not be empty".into()));
        }
        self.options.validate()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisOptions {
    /// Per-call XREAD block timeout in seconds.
    #[serde(default = "default_block_timeout")]
    pub block_timeout: f64,
    #[serde(default = "default_hscan_count")]
    pub hscan_count: usize,
    #[serde(default = "default_hmget_count")]
    pub hmget_count: usize,
    #[serde(default = "default_xread_count")]
    pub xread_count: usize,
    #[serde(default = "default_max_hmget_connections")]
    pub max_hmget_connections: usize,
}

fn default_block_timeout() -> f64 { 1.0 }
fn default_hscan_count() -> usize { 4096 }
fn default_hmget_count() -> usize { 4096 }
fn default_xread_count() -> usize { 4096 }
fn default_max_hmget_connections() -> usize { 8 }

impl Default for RedisOptions {
    fn default() -> Self {
        Self {
            block_timeout: default_block_timeout(),
            hscan_count: default_hscan_count(),
            hmget_count: default_hmget_count(),
            xread_count: default_xread_count(),
            max_hmget_connections: default_max_hmget_connections(),
        }
    }
}

impl RedisOptions {
    #[must_use]
    pub fn block_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.block_timeout)
    }

    fn validate(&self) -> Result<(), SyncError> {
        if !(self.block_timeout.is_finite() && self.block_timeout > 0.0) {
            return Err(SyncError::Config("redis.options.block_timeout must be positive".into()));
        }
        for (name, value) in [
            ("hscan_count", self.hscan_count),
            ("hmget_count", self.hmget_count),
            ("xread_count", self.xread_count),
            ("max_hmget_connections", self.max_hmget_connections),
        ] {
            if value == 0 {
                return Err(SyncError::Config(format!("redis.options.{} must be positive", name)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    Console,
    Journal,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Auto-detected from `JOURNAL_STREAM` when unset.
    #[serde(default)]
    pub output: Option<LogOutput>,
    /// Periodic progress log interval in seconds.
    #[serde(default = "default_log_interval")]
    pub interval: u64,
    /// Per-component level overrides, e.g. `history-sync = "debug"`.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

fn default_log_level() -> String { "info".into() }
fn default_log_interval() -> u64 { 20 }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output: None,
            interval: default_log_interval(),
            options: BTreeMap::new(),
        }
    }
}

pub const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "fatal"];

impl LoggingConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    fn validate(&self) -> Result<(), SyncError> {
        if !LOG_LEVELS.contains(&self.level.as_str()) {
            return Err(SyncError::Config(format!("invalid logging.level {:?}", self.level)));
        }
        if self.interval == 0 {
            return Err(SyncError::Config("logging.interval must be positive".into()));
        }
        for (component, level) in &self.options {
            if crate::logging::component_target(component).is_none() {
                return Err(SyncError::Config(format!("unknown logging component {:?}", component)));
            }
            if !LOG_LEVELS.contains(&level.as_str()) {
                return Err(SyncError::Config(format!(
                    "invalid level {:?} for logging component {:?}",
                    level, component
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionConfig {
    /// Days of history to keep; `0` keeps everything.
    #[serde(default)]
    pub history_days: u16,
    /// Days of SLA data to keep; `0` keeps everything.
    #[serde(default)]
    pub sla_days: u16,
    /// Sweep interval in seconds.
    #[serde(default = "default_retention_interval")]
    pub interval: u64,
    /// Maximum rows deleted per statement.
    #[serde(default = "default_retention_count")]
    pub count: u64,
    /// Per-category overrides of the history window.
    #[serde(default)]
    pub options: BTreeMap<String, u16>,
}

fn default_retention_interval() -> u64 { 3600 }
fn default_retention_count() -> u64 { 5000 }

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            history_days: 0,
            sla_days: 0,
            interval: default_retention_interval(),
            count: default_retention_count(),
            options: BTreeMap::new(),
        }
    }
}

impl RetentionConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    fn validate(&self) -> Result<(), SyncError> {
        if self.interval == 0 {
            return Err(SyncError::Config("retention.interval must be positive".into()));
        }
        if self.count == 0 {
            return Err(SyncError::Config("retention.count must be positive".into()));
        }
        for category in self.options.keys() {
            if !RETENTION_CATEGORIES.contains(&category.as_str()) {
                return Err(SyncError::Config(format!(
                    "invalid key {:?} for retention.options",
                    category
                )));
            }
        }
        Ok(())
    }
}
