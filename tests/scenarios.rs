// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! End-to-end scenarios against a temporary SQLite database.
//!
//! Redis is replaced by in-process channels and a recording acknowledger,
//! so these run without Docker.

mod common;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use common::{bin, cleanup_db, count, entry, temp_db};
use icingadb_sync::entity::config::{ChecksumMeta, HostgroupMember, Zone};
use icingadb_sync::entity::history::HistoryKind;
use icingadb_sync::ha::{heartbeat::Heartbeat, HaController};
use icingadb_sync::ha::HaState;
use icingadb_sync::history::{self, StreamAck};
use icingadb_sync::storage::{BulkExecutor, StreamEntry};
use icingadb_sync::sync::config_sync::sync_values;
use icingadb_sync::sync::runtime::{spawn_workers, RuntimeOp};
use icingadb_sync::sync::{RuntimeMode, SyncStats};
use icingadb_sync::tasks::TaskGroup;
use icingadb_sync::telemetry::{Counter, Stats};
use icingadb_sync::types::objectpacker::{checksum, object_id, pack, service_id, Packable};
use icingadb_sync::types::{Binary, UnixMilli};
use icingadb_sync::Result;

#[derive(Default)]
struct RecordingAck(Mutex<Vec<(String, String)>>);

impl RecordingAck {
    fn acked(&self) -> Vec<String> {
        self.0.lock().iter().map(|(_, id)| id.clone()).collect()
    }
}

#[async_trait]
impl StreamAck for RecordingAck {
    async fn xdel(&self, _cancel: &CancellationToken, stream: &str, ids: &[String]) -> Result<usize> {
        let mut acked = self.0.lock();
        acked.extend(ids.iter().map(|id| (stream.to_string(), id.clone())));
        Ok(ids.len())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Full sync delta
// ═══════════════════════════════════════════════════════════════════════════

fn zone(env: &Binary, id: u8, sum: u8, name: &str) -> Zone {
    Zone {
        meta: ChecksumMeta {
            id: bin(id),
            environment_id: env.clone(),
            properties_checksum: bin(sum),
        },
        name: name.into(),
        ..Zone::default()
    }
}

async fn zone_names(db: &icingadb_sync::Db) -> Vec<String> {
    sqlx::query_scalar("SELECT name FROM zone ORDER BY name")
        .fetch_all(db.pool())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_full_sync_applies_delta() {
    let (db, path) = temp_db("full_sync").await;
    let bulk = BulkExecutor::new(db.clone());
    let env = bin(0xee);
    let cancel = CancellationToken::new();

    let stats = sync_values(&bulk, &env, &cancel, vec![zone(&env, 1, 1, "a"), zone(&env, 2, 1, "b")])
        .await
        .unwrap();
    assert_eq!(
        stats,
        SyncStats {
            created: 2,
            ..SyncStats::default()
        }
    );

    // 1 changes checksum, 2 disappears, 3 is new
    let desired = || vec![zone(&env, 1, 2, "a2"), zone(&env, 3, 1, "c")];
    let stats = sync_values(&bulk, &env, &cancel, desired()).await.unwrap();
    assert_eq!(
        stats,
        SyncStats {
            created: 1,
            updated: 1,
            deleted: 1
        }
    );
    assert_eq!(zone_names(&db).await, ["a2", "c"]);

    let stats = sync_values(&bulk, &env, &cancel, desired()).await.unwrap();
    assert_eq!(stats.total(), 0, "a converged table needs no writes");

    db.close().await;
    cleanup_db(&path);
}

#[tokio::test]
async fn test_full_sync_ignores_other_environments() {
    let (db, path) = temp_db("full_sync_env").await;
    let bulk = BulkExecutor::new(db.clone());
    let (prod, test) = (bin(0x01), bin(0x02));
    let cancel = CancellationToken::new();

    sync_values(&bulk, &test, &cancel, vec![zone(&test, 9, 1, "other")])
        .await
        .unwrap();
    let stats = sync_values(&bulk, &prod, &cancel, vec![zone(&prod, 1, 1, "mine")])
        .await
        .unwrap();

    assert_eq!(stats.deleted, 0);
    assert_eq!(zone_names(&db).await, ["mine", "other"]);

    db.close().await;
    cleanup_db(&path);
}

// ═══════════════════════════════════════════════════════════════════════════
// Canonical packing and ids
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_packing_and_ids_are_deterministic() {
    // [env_hex, name] packs as a tagged sequence of byte strings
    let packed = pack(&Packable::Seq(vec!["ab".into(), "web01".into()]));
    assert_eq!(packed[0], 0x05, "sequences start with their tag");
    assert_eq!(packed[1..9], 2u64.to_be_bytes());

    let env = Binary::from_hex(&"ab".repeat(20)).unwrap();
    let id = object_id(&env, "web01");
    assert_eq!(id.len(), 20);
    assert_eq!(id, object_id(&env, "web01"));
    assert_ne!(id, object_id(&bin(0xcd), "web01"));
    assert_eq!(service_id(&env, "web01", "ping"), object_id(&env, "web01!ping"));

    let env_hex = env.to_hex();
    assert_eq!(
        id,
        checksum(&Packable::Seq(vec![env_hex.as_str().into(), "web01".into()]))
    );
}

// ═══════════════════════════════════════════════════════════════════════════
// History replay
// ═══════════════════════════════════════════════════════════════════════════

fn state_entry(stream_id: &str, state_type: &str, event_time: &str) -> StreamEntry {
    let env = "ee".repeat(20);
    entry(
        stream_id,
        &[
            ("environment_id", env.as_str()),
            ("host_name", "web01"),
            ("object_type", "host"),
            ("event_time", event_time),
            ("state_type", state_type),
            ("soft_state", "1"),
            ("hard_state", "1"),
            ("previous_soft_state", "0"),
            ("previous_hard_state", "0"),
            ("check_attempt", "3"),
            ("max_check_attempts", "3"),
            ("output", "CRITICAL"),
        ],
    )
}

async fn replay(
    bulk: &BulkExecutor,
    ack: Arc<RecordingAck>,
    entries: Vec<StreamEntry>,
) -> (Result<()>, Arc<Stats>) {
    let stats = Arc::new(Stats::new());
    let (tx, rx) = mpsc::channel(16);
    for e in entries {
        tx.send(e).await.unwrap();
    }
    drop(tx);

    let cancel = CancellationToken::new();
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        history::process(bulk, ack, stats.clone(), HistoryKind::State, &cancel, rx),
    )
    .await
    .expect("history replay did not finish");
    (result, stats)
}

#[tokio::test]
async fn test_history_fans_out_and_acks_after_commit() {
    let (db, path) = temp_db("history_fanout").await;
    let bulk = BulkExecutor::new(db.clone());
    let ack = Arc::new(RecordingAck::default());

    let entries = vec![
        state_entry("1700000000000-0", "1", "1700000000000"),
        state_entry("1700000000001-0", "0", "1700000000001"),
    ];
    let (result, stats) = replay(&bulk, ack.clone(), entries).await;
    result.unwrap();

    assert_eq!(count(&db, "state_history").await, 2);
    assert_eq!(count(&db, "history").await, 2);
    // only the hard change is an SLA event
    assert_eq!(count(&db, "sla_history_state").await, 1);

    let mut acked = ack.acked();
    acked.sort();
    assert_eq!(acked, ["1700000000000-0", "1700000000001-0"]);
    assert!(ack.0.lock().iter().all(|(stream, _)| stream == "icinga:history:stream:state"));
    assert_eq!(stats.total(Counter::HistorySync), 2);

    let state_type: String = sqlx::query_scalar("SELECT state_type FROM state_history WHERE event_time = 1700000000000")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(state_type, "hard");

    db.close().await;
    cleanup_db(&path);
}

#[tokio::test]
async fn test_history_replay_is_idempotent() {
    let (db, path) = temp_db("history_replay").await;
    let bulk = BulkExecutor::new(db.clone());

    for _ in 0..2 {
        let ack = Arc::new(RecordingAck::default());
        let (result, _) = replay(&bulk, ack, vec![state_entry("5-0", "1", "5000")]).await;
        result.unwrap();
    }

    assert_eq!(count(&db, "state_history").await, 1);
    assert_eq!(count(&db, "history").await, 1);
    assert_eq!(count(&db, "sla_history_state").await, 1);

    db.close().await;
    cleanup_db(&path);
}

#[tokio::test]
async fn test_history_failure_leaves_entries_unacked() {
    let (db, path) = temp_db("history_failure").await;
    let bulk = BulkExecutor::new(db.clone());
    let ack = Arc::new(RecordingAck::default());

    sqlx::query("DROP TABLE sla_history_state")
        .execute(db.pool())
        .await
        .unwrap();

    let (result, _) = replay(&bulk, ack.clone(), vec![state_entry("7-0", "1", "7000")]).await;
    assert!(result.is_err());
    assert!(ack.acked().is_empty(), "an entry must not be acked before every stage committed");

    db.close().await;
    cleanup_db(&path);
}

// ═══════════════════════════════════════════════════════════════════════════
// HA election
// ═══════════════════════════════════════════════════════════════════════════

fn heartbeat(env: &Binary, node: &str, sent: i64, received: i64) -> Heartbeat {
    let app = format!(
        r#"{{"status":{{"icingaapplication":{{"app":{{"node_name":"{node}","environment":"prod","version":"2.14.0","program_start":1700000000}}}}}}}}"#
    );
    let sent_raw = sent.to_string();
    let env_hex = env.to_hex();
    let e = entry(
        &format!("{sent}-0"),
        &[
            ("timestamp", sent_raw.as_str()),
            ("icingadb_environment", env_hex.as_str()),
            ("IcingaApplication", app.as_str()),
        ],
    );
    Heartbeat::parse(&e, UnixMilli(received)).unwrap()
}

#[tokio::test]
async fn test_ha_single_responsible_and_failover() {
    let (db, path) = temp_db("ha_failover").await;
    let env = bin(0x05);
    let (mut a, mut a_signals) = HaController::new(db.clone());
    let (mut b, mut b_signals) = HaController::new(db.clone());

    a.realize(&heartbeat(&env, "master1", 100_000, 100_000)).await.unwrap();
    b.realize(&heartbeat(&env, "master2", 100_200, 100_200)).await.unwrap();
    assert_eq!(a.state(), HaState::Responsible);
    assert_eq!(b.state(), HaState::Unresponsible);
    assert!(a_signals.takeover.try_recv().is_ok());
    assert!(b_signals.takeover.try_recv().is_err());

    // A stops heartbeating; its row goes stale after 60 s
    b.realize(&heartbeat(&env, "master2", 170_000, 170_000)).await.unwrap();
    assert_eq!(b.state(), HaState::Responsible);
    assert_eq!(b_signals.takeover.try_recv().unwrap().environment_id, env);

    // A wakes up with an old heartbeat and must hand over
    a.realize(&heartbeat(&env, "master1", 100_000, 170_500)).await.unwrap();
    assert_eq!(a.state(), HaState::Unresponsible);
    assert!(a_signals.handover.try_recv().is_ok());

    let responsible: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM icingadb_instance WHERE responsible = 'y'")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(responsible, 1);

    db.close().await;
    cleanup_db(&path);
}

// ═══════════════════════════════════════════════════════════════════════════
// Runtime updates
// ═══════════════════════════════════════════════════════════════════════════

fn member_entry(stream_id: &str, id: u8) -> StreamEntry {
    let (id, env, host, group) = (bin(id).to_hex(), bin(0xee).to_hex(), bin(0x10).to_hex(), bin(0x20).to_hex());
    entry(
        stream_id,
        &[
            ("id", id.as_str()),
            ("environment_id", env.as_str()),
            ("host_id", host.as_str()),
            ("hostgroup_id", group.as_str()),
        ],
    )
}

#[tokio::test]
async fn test_runtime_fifo_applies_in_order() {
    let (db, path) = temp_db("runtime_fifo").await;
    let bulk = BulkExecutor::new(db.clone());
    let stats = Arc::new(Stats::new());
    let cancel = CancellationToken::new();
    let mut group = TaskGroup::new(&cancel);

    let mut sink = spawn_workers::<HostgroupMember>(
        &bulk,
        &stats,
        &mut group,
        "hostgroup:member",
        RuntimeMode::Fifo,
        false,
    );

    let dispatch = async {
        sink.dispatch(&cancel, RuntimeOp::Upsert, member_entry("1-0", 0x01)).await?;
        sink.dispatch(&cancel, RuntimeOp::Delete, member_entry("2-0", 0x01)).await?;
        sink.dispatch(&cancel, RuntimeOp::Upsert, member_entry("3-0", 0x02)).await
    };
    tokio::time::timeout(Duration::from_secs(10), dispatch)
        .await
        .expect("dispatch did not finish")
        .unwrap();

    let ids: Vec<Vec<u8>> = sqlx::query_scalar("SELECT id FROM hostgroup_member")
        .fetch_all(db.pool())
        .await
        .unwrap();
    assert_eq!(ids, vec![bin(0x02).into_bytes()]);
    assert_eq!(stats.total(Counter::ConfigSync), 3);

    cancel.cancel();
    drop(sink);
    let _ = group.wait().await;

    db.close().await;
    cleanup_db(&path);
}

#[tokio::test]
async fn test_runtime_malformed_upsert_is_skipped() {
    let (db, path) = temp_db("runtime_skip").await;
    let bulk = BulkExecutor::new(db.clone());
    let stats = Arc::new(Stats::new());
    let cancel = CancellationToken::new();
    let mut group = TaskGroup::new(&cancel);

    let mut sink = spawn_workers::<HostgroupMember>(
        &bulk,
        &stats,
        &mut group,
        "hostgroup:member",
        RuntimeMode::Fifo,
        false,
    );

    let dispatch = async {
        sink.dispatch(&cancel, RuntimeOp::Upsert, entry("1-0", &[("id", "not hex")])).await?;
        sink.dispatch(&cancel, RuntimeOp::Upsert, member_entry("2-0", 0x03)).await
    };
    tokio::time::timeout(Duration::from_secs(10), dispatch)
        .await
        .expect("a skipped entry must still be acknowledged")
        .unwrap();

    assert_eq!(count(&db, "hostgroup_member").await, 1);

    cancel.cancel();
    drop(sink);
    let _ = group.wait().await;

    db.close().await;
    cleanup_db(&path);
}
