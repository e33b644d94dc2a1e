// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration Tests for icingadb-sync
//!
//! This module contains the tests that require real backends (Redis, MySQL).
//! Tests use testcontainers for portability - no external docker-compose required.
//!
//! # Running Tests
//! ```bash
//! # Run all integration tests (requires Docker)
//! cargo test --test integration -- --ignored
//!
//! # Run only happy-path tests
//! cargo test --test integration happy -- --ignored
//!
//! # Run only failure scenario tests
//! cargo test --test integration failure -- --ignored
//! ```
//!
//! # Test Organization
//! - `happy_*` - Normal operation: stream plumbing, history replay, full daemon flow
//! - `failure_*` - Failure scenarios: missing schema, unreachable backends

mod common;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use icingadb_sync::config::{DatabaseConfig, DatabaseType, LoggingConfig, RedisConfig, RetentionConfig};
use icingadb_sync::history::HistorySync;
use icingadb_sync::storage::{schema, BulkExecutor, CacheClient, MaxLen};
use icingadb_sync::telemetry::Stats;
use icingadb_sync::types::{Binary, UnixMilli};
use icingadb_sync::{Config, DaemonState, Db, Supervisor, SyncError};

use common::{cleanup_db, count, temp_db, temp_db_path};
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

// =============================================================================
// Container Helpers
// =============================================================================

/// Create a Redis container with health check
fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

/// Create a MySQL container (takes ~30s to be ready)
fn mysql_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("mysql", "8.0")
        .with_env_var("MYSQL_ROOT_PASSWORD", "test")
        .with_env_var("MYSQL_DATABASE", "icingadb")
        .with_env_var("MYSQL_USER", "icingadb")
        .with_env_var("MYSQL_PASSWORD", "icingadb")
        .with_exposed_port(3306)
        .with_wait_for(WaitFor::message_on_stderr("ready for connections"));
    docker.run(image)
}

fn redis_config(port: u16) -> RedisConfig {
    RedisConfig {
        host: "127.0.0.1".into(),
        port,
        ..RedisConfig::default()
    }
}

fn mysql_config(port: u16) -> DatabaseConfig {
    DatabaseConfig {
        kind: DatabaseType::Mysql,
        host: "127.0.0.1".into(),
        port: Some(port),
        database: "icingadb".into(),
        user: "icingadb".into(),
        password: "icingadb".into(),
        ..DatabaseConfig::sqlite("")
    }
}

fn config(database: DatabaseConfig, redis: RedisConfig) -> Config {
    Config {
        database,
        redis,
        logging: LoggingConfig::default(),
        retention: RetentionConfig::default(),
    }
}

/// MySQL logs "ready" once for the init server; retry until the real one answers.
async fn connect_mysql(config: &DatabaseConfig) -> Db {
    for _ in 0..60 {
        if let Ok(db) = Db::connect(config).await {
            if db.ping().await.is_ok() {
                return db;
            }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    panic!("MySQL did not become ready");
}

async fn redis_cmd<T: redis::FromRedisValue>(cache: &CacheClient, cmd: &mut redis::Cmd) -> T {
    let mut conn = cache.connection();
    cmd.query_async(&mut conn).await.expect("redis command failed")
}

async fn wait_until<F, Fut>(what: &str, timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    panic!("timed out waiting for {what}");
}

fn app_json(node: &str) -> String {
    format!(
        r#"{{"status":{{"icingaapplication":{{"app":{{"node_name":"{node}","environment":"prod","version":"2.14.0","program_start":1700000000,"enable_perfdata":true}}}}}}}}"#
    )
}

/// Publish a producer heartbeat every second until cancelled.
fn spawn_producer(cache: CacheClient, env: Binary, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = app_json("master1");
        while !cancel.is_cancelled() {
            let fields = vec![
                ("timestamp".to_string(), UnixMilli::now().millis().to_string()),
                ("icingadb_environment".to_string(), env.to_hex()),
                ("IcingaApplication".to_string(), app.clone()),
            ];
            let _ = cache
                .xadd(&cancel, "icinga:stats", MaxLen::Approx(100), &fields)
                .await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    })
}

// =============================================================================
// Happy Path Tests - Normal Operation
// =============================================================================

#[tokio::test]
#[ignore] // Requires Docker
async fn happy_cache_client_hashes_and_streams() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let cache = CacheClient::connect(&redis_config(redis.get_host_port_ipv4(6379)))
        .await
        .expect("Failed to connect to redis");
    let cancel = CancellationToken::new();

    // Hash larger than one HSCAN page
    let mut hset = redis::cmd("HSET");
    hset.arg("icinga:zone");
    for i in 0..2500 {
        hset.arg(format!("{i:040x}")).arg(format!(r#"{{"name":"z{i}"}}"#));
    }
    let _: i64 = redis_cmd(&cache, &mut hset).await;

    let all = cache.hscan(&cancel, "icinga:zone").collect().await.unwrap();
    assert_eq!(all.len(), 2500);

    let wanted = vec![format!("{:040x}", 7), format!("{:040x}", 99_999)];
    let some = cache.hmget(&cancel, "icinga:zone", wanted).collect().await.unwrap();
    assert_eq!(some, vec![(format!("{:040x}", 7), r#"{"name":"z7"}"#.to_string())]);

    // Streams
    assert_eq!(cache.last_stream_id(&cancel, "icinga:dump").await.unwrap(), "0-0");
    let fields = vec![("key".to_string(), "*".to_string()), ("state".to_string(), "done".to_string())];
    let id = cache
        .xadd(&cancel, "icinga:dump", MaxLen::Exact(10), &fields)
        .await
        .unwrap();
    assert_eq!(cache.last_stream_id(&cancel, "icinga:dump").await.unwrap(), id);

    let deleted = cache.xdel(&cancel, "icinga:dump", &[id]).await.unwrap();
    assert_eq!(deleted, 1);
    let (fields_left, len): (i64, i64) = cache
        .pipeline(
            &cancel,
            redis::pipe().cmd("HLEN").arg("icinga:zone").cmd("XLEN").arg("icinga:dump"),
        )
        .await
        .unwrap();
    assert_eq!(fields_left, 2500);
    assert_eq!(len, 0);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn happy_history_replay_trims_stream() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let cache = CacheClient::connect(&redis_config(redis.get_host_port_ipv4(6379)))
        .await
        .expect("Failed to connect to redis");
    let (db, path) = temp_db("it_history").await;
    let cancel = CancellationToken::new();

    let env = "ee".repeat(20);
    for i in 0..50 {
        let fields: Vec<(String, String)> = [
            ("environment_id", env.as_str()),
            ("host_name", "web01"),
            ("object_type", "host"),
            ("state_type", "1"),
            ("hard_state", "2"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .chain([("event_time".to_string(), (1_700_000_000_000i64 + i).to_string())])
        .collect();
        cache
            .xadd(&cancel, "icinga:history:stream:state", MaxLen::Approx(1000), &fields)
            .await
            .unwrap();
    }

    let history = HistorySync::new(cache.clone(), BulkExecutor::new(db.clone()), Arc::new(Stats::new()));
    let token = cancel.clone();
    let task = tokio::spawn(async move { history.run(&token).await });

    wait_until("stream to drain", Duration::from_secs(30), || async {
        let len: i64 = redis_cmd(&cache, redis::cmd("XLEN").arg("icinga:history:stream:state")).await;
        len == 0
    })
    .await;

    assert_eq!(count(&db, "state_history").await, 50);
    assert_eq!(count(&db, "history").await, 50);
    assert_eq!(count(&db, "sla_history_state").await, 50);

    cancel.cancel();
    let result = task.await.unwrap();
    assert!(result.is_ok() || result.unwrap_err().is_cancelled());

    db.close().await;
    cleanup_db(&path);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn happy_supervisor_full_flow_mysql() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let mysql = mysql_container(&docker);

    let database = mysql_config(mysql.get_host_port_ipv4(3306));
    let db = connect_mysql(&database).await;
    db.import_schema(schema::MYSQL).await.expect("Failed to import schema");

    let redis_config = redis_config(redis.get_host_port_ipv4(6379));
    let cache = CacheClient::connect(&redis_config).await.unwrap();
    let env = Binary::new(vec![0xee; 20]);
    let cancel = CancellationToken::new();

    // Config objects plus the dump markers the producer writes
    let zone_id = format!("{:040x}", 1);
    let body = format!(r#"{{"environment_id":"{}","name":"master","is_global":false,"depth":0}}"#, env.to_hex());
    let _: i64 = redis_cmd(&cache, redis::cmd("HSET").arg("icinga:zone").arg(&zone_id).arg(&body)).await;
    let checksum = format!(r#"{{"checksum":"{}"}}"#, "11".repeat(20));
    let _: i64 = redis_cmd(&cache, redis::cmd("HSET").arg("icinga:checksum:zone").arg(&zone_id).arg(&checksum)).await;
    let done = vec![("key".to_string(), "*".to_string()), ("state".to_string(), "done".to_string())];
    cache.xadd(&cancel, "icinga:dump", MaxLen::Exact(10), &done).await.unwrap();

    let producer = spawn_producer(cache.clone(), env.clone(), cancel.clone());

    let mut supervisor = Supervisor::new(config(database, redis_config));
    supervisor.start().await.expect("Failed to start");
    assert_eq!(supervisor.state(), DaemonState::Standby);

    let mut states = supervisor.state_receiver();
    let daemon = cancel.child_token();
    let run = {
        let daemon = daemon.clone();
        tokio::spawn(async move {
            let result = supervisor.run(daemon).await;
            supervisor.shutdown().await;
            result
        })
    };

    tokio::time::timeout(Duration::from_secs(30), states.wait_for(|s| *s == DaemonState::Responsible))
        .await
        .expect("never became responsible")
        .unwrap();

    wait_until("zone to be synced", Duration::from_secs(30), || async {
        count(&db, "zone").await == 1
    })
    .await;
    let name: String = sqlx::query_scalar("SELECT name FROM zone")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(name, "master");

    let responsible: String = sqlx::query_scalar("SELECT responsible FROM icingadb_instance")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(responsible, "y");

    // Runtime update: the zone is renamed
    let update = vec![
        ("redis_key".to_string(), "icinga:zone".to_string()),
        ("runtime_type".to_string(), "upsert".to_string()),
        ("id".to_string(), zone_id.clone()),
        ("environment_id".to_string(), env.to_hex()),
        ("name".to_string(), "satellite".to_string()),
        ("properties_checksum".to_string(), "22".repeat(20)),
    ];
    cache.xadd(&cancel, "icinga:runtime", MaxLen::Approx(1000), &update).await.unwrap();

    wait_until("runtime update", Duration::from_secs(30), || async {
        let name: Option<String> = sqlx::query_scalar("SELECT name FROM zone")
            .fetch_optional(db.pool())
            .await
            .unwrap();
        name.as_deref() == Some("satellite")
    })
    .await;

    // Telemetry heartbeat is written back
    wait_until("telemetry heartbeat", Duration::from_secs(30), || async {
        let len: i64 = redis_cmd(&cache, redis::cmd("XLEN").arg("icingadb:telemetry:heartbeat")).await;
        len > 0
    })
    .await;

    daemon.cancel();
    let result = tokio::time::timeout(Duration::from_secs(20), run)
        .await
        .expect("supervisor did not stop")
        .unwrap();
    assert!(result.is_ok(), "{result:?}");

    // Released on shutdown
    let responsible: String = sqlx::query_scalar("SELECT responsible FROM icingadb_instance")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(responsible, "n");

    cancel.cancel();
    let _ = producer.await;
    db.close().await;
}

// =============================================================================
// Failure Scenario Tests
// =============================================================================

#[tokio::test]
#[ignore] // Requires Docker
async fn failure_start_without_schema() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let path = temp_db_path("it_no_schema");

    let mut supervisor = Supervisor::new(config(
        DatabaseConfig::sqlite(path.display().to_string()),
        redis_config(redis.get_host_port_ipv4(6379)),
    ));
    let err = supervisor.start().await.unwrap_err();
    assert!(matches!(err, SyncError::SchemaMissing), "{err:?}");
    assert_eq!(err.exit_code(), 1);
    assert_eq!(supervisor.state(), DaemonState::CheckingSchema);
    assert!(supervisor.last_error().is_some());

    supervisor.shutdown().await;
    cleanup_db(&path);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn failure_redis_down_at_startup() {
    // Nothing listens on this port; startup retry gives up with an error
    let path = temp_db_path("it_no_redis");
    let mut redis = redis_config(1);
    redis.host = "127.0.0.1".into();

    let mut supervisor = Supervisor::new(config(DatabaseConfig::sqlite(path.display().to_string()), redis));
    let started = tokio::time::timeout(Duration::from_secs(60), supervisor.start()).await;
    let err = started.expect("startup retry must be bounded").unwrap_err();
    assert!(!err.is_cancelled());
    assert_ne!(supervisor.state(), DaemonState::Standby);

    cleanup_db(&path);
}
