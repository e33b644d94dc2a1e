// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Telemetry published back into Redis for the producer to display.
//!
//! Once per second:
//! - `icingadb:telemetry:heartbeat` (`MAXLEN 1`): liveness, version and HA
//!   status of this replica.
//! - `icingadb:telemetry:stats` (`MAXLEN ~ 900`): rows written since the
//!   previous tick, per counter. Zero counters are omitted.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::ha::HaStatus;
use crate::storage::{CacheClient, MaxLen};
use crate::tasks::sleep;
use crate::types::UnixMilli;

pub const HEARTBEAT_STREAM: &str = "icingadb:telemetry:heartbeat";
pub const STATS_STREAM: &str = "icingadb:telemetry:stats";

const INTERVAL: Duration = Duration::from_secs(1);
const STATS_MAXLEN: usize = 15 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    ConfigSync,
    StateSync,
    HistorySync,
    HistoryRetention,
}

impl Counter {
    pub const ALL: [Counter; 4] = [
        Counter::ConfigSync,
        Counter::StateSync,
        Counter::HistorySync,
        Counter::HistoryRetention,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Counter::ConfigSync => "config_sync",
            Counter::StateSync => "state_sync",
            Counter::HistorySync => "history_sync",
            Counter::HistoryRetention => "history_retention",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Process-wide row counters, drained by the telemetry loop.
#[derive(Debug, Default)]
pub struct Stats {
    counters: [AtomicU64; 4],
    totals: [AtomicU64; 4],
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, counter: Counter, n: u64) {
        if n > 0 {
            self.counters[counter.index()].fetch_add(n, Ordering::Relaxed);
            self.totals[counter.index()].fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    /// Everything counted since start, unaffected by [`Stats::take`].
    pub fn total(&self, counter: Counter) -> u64 {
        self.totals[counter.index()].load(Ordering::Relaxed)
    }

    /// Reset every counter and return the non-zero ones.
    pub fn take(&self) -> Vec<(Counter, u64)> {
        Counter::ALL
            .into_iter()
            .filter_map(|c| match self.counters[c.index()].swap(0, Ordering::Relaxed) {
                0 => None,
                n => Some((c, n)),
            })
            .collect()
    }
}

/// Last fatal or HA error, reported in the heartbeat.
#[derive(Debug, Clone, Default)]
pub struct LastError(Arc<Mutex<Option<String>>>);

impl LastError {
    pub fn set(&self, error: impl ToString) {
        *self.0.lock() = Some(error.to_string());
    }

    pub fn clear(&self) {
        *self.0.lock() = None;
    }

    pub fn get(&self) -> Option<String> {
        self.0.lock().clone()
    }
}

fn ms(ts: Option<UnixMilli>) -> String {
    ts.map_or(0, |t| t.millis()).to_string()
}

fn flag(b: bool) -> String {
    if b { "1" } else { "0" }.to_string()
}

/// Fields of one heartbeat entry.
pub fn heartbeat_fields(started: UnixMilli, status: &HaStatus, error: Option<String>) -> Vec<(String, String)> {
    vec![
        ("version".into(), env!("CARGO_PKG_VERSION").into()),
        ("time".into(), UnixMilli::now().millis().to_string()),
        ("start-time".into(), started.millis().to_string()),
        ("error".into(), error.unwrap_or_default()),
        ("performance-data-enabled".into(), flag(status.performance_data_enabled)),
        ("ha-responsible".into(), flag(status.responsible)),
        ("ha-responsible-ts".into(), ms(status.responsible_since)),
        ("ha-last-other-responsible".into(), ms(status.last_other_responsible)),
    ]
}

pub struct Telemetry {
    cache: CacheClient,
    stats: Arc<Stats>,
    ha: watch::Receiver<HaStatus>,
    last_error: LastError,
    started: UnixMilli,
}

impl Telemetry {
    pub fn new(cache: CacheClient, stats: Arc<Stats>, ha: watch::Receiver<HaStatus>, last_error: LastError) -> Self {
        Self {
            cache,
            stats,
            ha,
            last_error,
            started: UnixMilli::now(),
        }
    }

    /// Write both streams every second. Redis failures are logged and the
    /// loop goes on; telemetry never stops the daemon.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        loop {
            sleep(&cancel, INTERVAL).await?;

            let status = self.ha.borrow().clone();
            let heartbeat = heartbeat_fields(self.started, &status, self.last_error.get());
            if let Err(e) = self.cache.xadd(&cancel, HEARTBEAT_STREAM, MaxLen::Exact(1), &heartbeat).await {
                if e.is_cancelled() {
                    return Err(e);
                }
                warn!(error = %e, "Cannot write telemetry heartbeat");
            }

            let counters = self.stats.take();
            if counters.is_empty() {
                continue;
            }
            let fields: Vec<(String, String)> = counters
                .iter()
                .map(|(c, n)| (c.as_str().to_string(), n.to_string()))
                .collect();
            debug!(?fields, "Telemetry stats");
            if let Err(e) = self.cache.xadd(&cancel, STATS_STREAM, MaxLen::Approx(STATS_MAXLEN), &fields).await {
                if e.is_cancelled() {
                    return Err(e);
                }
                warn!(error = %e, "Cannot write telemetry stats");
            }
        }
    }
}

/// Log what was written every `interval`, skipping quiet periods.
pub async fn log_progress(stats: Arc<Stats>, interval: Duration, cancel: CancellationToken) -> Result<()> {
    let mut last = Counter::ALL.map(|c| stats.total(c));
    loop {
        sleep(&cancel, interval).await?;
        for (i, counter) in Counter::ALL.into_iter().enumerate() {
            let now = stats.total(counter);
            let delta = now - last[i];
            last[i] = now;
            if delta > 0 {
                info!(counter = counter.as_str(), count = delta, interval = ?interval, "Progress");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_resets_and_omits_zero() {
        let stats = Stats::new();
        stats.add(Counter::ConfigSync, 3);
        stats.add(Counter::HistoryRetention, 5);
        stats.add(Counter::StateSync, 0);

        assert_eq!(
            stats.take(),
            vec![(Counter::ConfigSync, 3), (Counter::HistoryRetention, 5)]
        );
        assert!(stats.take().is_empty());
        assert_eq!(stats.total(Counter::ConfigSync), 3);
    }

    #[test]
    fn test_heartbeat_fields() {
        let status = HaStatus {
            responsible: true,
            responsible_since: Some(UnixMilli(1000)),
            last_other_responsible: None,
            performance_data_enabled: true,
        };
        let fields = heartbeat_fields(UnixMilli(500), &status, Some("boom".into()));
        let get = |k: &str| fields.iter().find(|(f, _)| f == k).map(|(_, v)| v.as_str());

        assert_eq!(get("start-time"), Some("500"));
        assert_eq!(get("ha-responsible"), Some("1"));
        assert_eq!(get("ha-responsible-ts"), Some("1000"));
        assert_eq!(get("ha-last-other-responsible"), Some("0"));
        assert_eq!(get("error"), Some("boom"));
    }

    #[test]
    fn test_last_error() {
        let last = LastError::default();
        assert_eq!(last.get(), None);
        last.set("schema mismatch");
        assert_eq!(last.clone().get().as_deref(), Some("schema mismatch"));
        last.clear();
        assert_eq!(last.get(), None);
    }
}
