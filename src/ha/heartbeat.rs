// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Producer heartbeats from `icinga:stats`.

use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::error::{Result, SyncError};
use crate::storage::{CacheClient, StreamEntry};
use crate::tasks::cancellable;
use crate::types::{Binary, UnixMilli};

pub const STATS_STREAM: &str = "icinga:stats";

/// A heartbeat older than this, or none for this long, means the producer
/// is gone.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);

/// Producer clocks ahead of ours by more than this are logged.
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(1);

/// `status.icingaapplication.app` of the producer.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct IcingaApplication {
    pub node_name: String,
    pub environment: String,
    pub version: String,
    /// Seconds since the epoch.
    pub program_start: f64,
    pub enable_notifications: bool,
    pub enable_flapping: bool,
    pub enable_perfdata: bool,
    pub enable_event_handlers: bool,
    pub enable_host_checks: bool,
    pub enable_service_checks: bool,
}

#[derive(Deserialize)]
struct StatusDoc {
    status: Status,
}

#[derive(Deserialize)]
struct Status {
    icingaapplication: AppDoc,
}

#[derive(Deserialize)]
struct AppDoc {
    app: IcingaApplication,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Heartbeat {
    /// Producer clock.
    pub sent: UnixMilli,
    /// Our clock, when the entry was read.
    pub received: UnixMilli,
    pub environment_id: Binary,
    pub app: IcingaApplication,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    /// Producer clock ahead of ours; still processed.
    Skewed,
    Expired,
}

impl Heartbeat {
    /// Parse a stats entry. Missing or malformed fields are data errors.
    pub fn parse(entry: &StreamEntry, received: UnixMilli) -> Result<Self> {
        let field = |name: &str| {
            entry
                .fields
                .get(name)
                .ok_or_else(|| SyncError::Data(format!("heartbeat {} lacks {name}", entry.id)))
        };

        let sent = UnixMilli::parse(field("timestamp")?)
            .filter(|t| !t.is_zero())
            .ok_or_else(|| SyncError::Data(format!("heartbeat {} has an invalid timestamp", entry.id)))?;
        let environment_id = Binary::from_hex(field("icingadb_environment")?)
            .map_err(|e| SyncError::Data(format!("heartbeat {} has an invalid environment: {e}", entry.id)))?;
        let doc: StatusDoc = serde_json::from_str(field("IcingaApplication")?)?;

        Ok(Self {
            sent,
            received,
            environment_id,
            app: doc.status.icingaapplication.app,
        })
    }

    pub fn freshness(&self) -> Freshness {
        if self.sent < self.received.saturating_sub(HEARTBEAT_TIMEOUT) {
            Freshness::Expired
        } else if self.sent > self.received.saturating_add(MAX_CLOCK_SKEW) {
            Freshness::Skewed
        } else {
            Freshness::Fresh
        }
    }

    pub fn program_start(&self) -> UnixMilli {
        UnixMilli((self.app.program_start * 1000.0) as i64)
    }
}

/// Tail `icinga:stats` from its newest entry and forward parsed heartbeats.
/// Malformed entries are logged and skipped.
pub async fn listen(cache: CacheClient, cancel: CancellationToken, tx: mpsc::Sender<Heartbeat>) -> Result<()> {
    let mut reader = cache.stream_reader().await?;
    let start = cache.last_stream_id(&cancel, STATS_STREAM).await?;
    let mut position = vec![(STATS_STREAM.to_string(), start)];

    loop {
        for (_, entries) in reader.read_until_result(&cancel, &position).await? {
            let Some(last) = entries.last() else { continue };
            position[0].1 = last.id.clone();

            // Only the newest entry of a batch matters.
            match Heartbeat::parse(last, UnixMilli::now()) {
                Ok(heartbeat) => {
                    if heartbeat.freshness() == Freshness::Skewed {
                        warn!(
                            sent = %heartbeat.sent,
                            received = %heartbeat.received,
                            "Received heartbeat from the future, clocks out of sync"
                        );
                    }
                    cancellable(&cancel, async { tx.send(heartbeat).await.map_err(|_| SyncError::Cancelled) })
                        .await?;
                }
                Err(e) => {
                    error!(stream_id = %last.id, error = %e, "Cannot parse heartbeat, skipping");
                    crate::metrics::record_error("heartbeat", "parse");
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn heartbeat_entry(env: &Binary, node: &str, sent: i64) -> StreamEntry {
        let app = format!(
            r#"{{"status":{{"icingaapplication":{{"app":{{"node_name":"{node}","environment":"prod","version":"2.14.0","program_start":1700000000.5,"enable_notifications":true,"enable_perfdata":true}}}}}}}}"#
        );
        let timestamp = sent.to_string();
        let env_hex = env.to_hex();
        StreamEntry {
            id: format!("{sent}-0"),
            fields: [
                ("timestamp", timestamp.as_str()),
                ("icingadb_environment", env_hex.as_str()),
                ("IcingaApplication", app.as_str()),
            ]
            .into_iter()
            .collect(),
        }
    }

    #[test]
    fn test_parse() {
        let env = Binary::new(vec![7; 20]);
        let hb = Heartbeat::parse(&heartbeat_entry(&env, "master1", 5_000), UnixMilli(5_100)).unwrap();
        assert_eq!(hb.environment_id, env);
        assert_eq!(hb.sent, UnixMilli(5_000));
        assert_eq!(hb.app.node_name, "master1");
        assert!(hb.app.enable_perfdata);
        assert!(!hb.app.enable_flapping);
        assert_eq!(hb.program_start(), UnixMilli(1_700_000_000_500));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        let env = Binary::new(vec![7; 20]);
        let mut entry = heartbeat_entry(&env, "master1", 5_000);
        entry.fields.insert("icingadb_environment", "xyz".to_string());
        assert!(Heartbeat::parse(&entry, UnixMilli(5_000)).is_err());

        let mut entry = heartbeat_entry(&env, "master1", 5_000);
        entry.fields.remove("IcingaApplication");
        assert!(Heartbeat::parse(&entry, UnixMilli(5_000)).is_err());
    }

    #[test]
    fn test_freshness() {
        let hb = |sent, received| Heartbeat {
            sent: UnixMilli(sent),
            received: UnixMilli(received),
            environment_id: Binary::default(),
            app: IcingaApplication::default(),
        };
        assert_eq!(hb(100_000, 100_500).freshness(), Freshness::Fresh);
        assert_eq!(hb(102_000, 100_000).freshness(), Freshness::Skewed);
        assert_eq!(hb(30_000, 100_000).freshness(), Freshness::Expired);
    }
}
