// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the sync daemon.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding process chooses the exporter; none is installed here.
//!
//! # Metric Naming Convention
//! - `icingadb_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `table`: destination table
//! - `op`: create, upsert, update, delete
//! - `stream`: source stream key

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Rows committed by the bulk executor.
pub fn record_rows(table: &str, op: &str, count: usize) {
    counter!(
        "icingadb_sync_rows_total",
        "table" => table.to_string(),
        "op" => op.to_string()
    )
    .increment(count as u64);
}

/// Latency of one committed batch.
pub fn record_batch_latency(table: &str, op: &str, duration: Duration) {
    histogram!(
        "icingadb_sync_batch_seconds",
        "table" => table.to_string(),
        "op" => op.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Stream entries consumed.
pub fn record_stream_entries(stream: &str, count: usize) {
    counter!(
        "icingadb_sync_stream_entries_total",
        "stream" => stream.to_string()
    )
    .increment(count as u64);
}

/// Rows removed by the retention sweeper.
pub fn record_retention_deleted(table: &str, count: u64) {
    counter!(
        "icingadb_sync_retention_deleted_total",
        "table" => table.to_string()
    )
    .increment(count);
}

/// Whether this replica currently holds the HA role.
pub fn set_responsible(responsible: bool) {
    gauge!("icingadb_sync_responsible").set(if responsible { 1.0 } else { 0.0 });
}

/// Errors by component, for alerting on skipped entries.
pub fn record_error(component: &str, kind: &str) {
    counter!(
        "icingadb_sync_errors_total",
        "component" => component.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Records the batch latency and row count on [`BatchTimer::finish`].
pub struct BatchTimer {
    table: String,
    op: &'static str,
    start: Instant,
}

impl BatchTimer {
    pub fn start(table: &str, op: &'static str) -> Self {
        Self {
            table: table.to_string(),
            op,
            start: Instant::now(),
        }
    }

    pub fn finish(self, rows: usize) {
        record_batch_latency(&self.table, self.op, self.start.elapsed());
        record_rows(&self.table, self.op, rows);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn test_record_rows_counts() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_rows("host", "upsert", 3);
            record_rows("host", "upsert", 2);
        });

        let total: u64 = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .filter(|(key, _, _, _)| key.key().name() == "icingadb_sync_rows_total")
            .map(|(_, _, _, value)| match value {
                DebugValue::Counter(n) => n,
                _ => 0,
            })
            .sum();
        assert_eq!(total, 5);
    }

    #[test]
    fn test_batch_timer() {
        let timer = BatchTimer::start("state_history", "upsert");
        std::thread::sleep(Duration::from_micros(10));
        timer.finish(10);
    }

    #[test]
    fn test_gauges_and_counters() {
        set_responsible(true);
        set_responsible(false);
        record_stream_entries("icinga:runtime", 42);
        record_retention_deleted("history", 5000);
        record_error("runtime-updates", "data");
    }
}
