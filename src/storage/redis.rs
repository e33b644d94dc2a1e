// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache client: the producer's Redis.
//!
//! Hashes are read with `HSCAN`/`HMGET` and streamed over bounded channels;
//! streams are consumed with blocking `XREAD` on a dedicated connection per
//! reader so the shared [`ConnectionManager`] never stalls.
//!
//! All helpers take a [`CancellationToken`] and return
//! [`SyncError::Cancelled`] once it fires. Reads and deletes retry transient
//! connection failures with the daemon backoff; auth and protocol errors
//! propagate.

use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamId, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::{cmd, AsyncCommands, Client, FromRedisValue};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{RedisConfig, RedisOptions};
use crate::entity::FieldMap;
use crate::error::{Result, SyncError};
use crate::resilience::retry::{retry, retry_sync, RetryConfig};
use crate::tasks::{cancellable, Yield};

/// One stream entry with its fields flattened to strings.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: FieldMap,
}

impl StreamEntry {
    fn from_redis(entry: StreamId) -> Self {
        let fields = entry
            .map
            .iter()
            .filter_map(|(k, v)| String::from_redis_value(v).ok().map(|v| (k.clone(), v)))
            .collect();
        Self { id: entry.id, fields }
    }
}

/// `MAXLEN` policy for `XADD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxLen {
    Exact(usize),
    Approx(usize),
}

/// Send one command, retrying while its failure is transient. Each attempt
/// races `cancel`.
async fn command<T, F, Fut>(cancel: &CancellationToken, retry: &RetryConfig, name: &str, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = redis::RedisResult<T>>,
{
    retry_sync(name, retry, cancel, || {
        let sent = attempt();
        async move { cancellable(cancel, async { Ok(sent.await?) }).await }
    })
    .await
}

#[derive(Clone)]
pub struct CacheClient {
    client: Client,
    connection: ConnectionManager,
    options: RedisOptions,
    hmget_limiter: Arc<Semaphore>,
    retry: RetryConfig,
}

impl CacheClient {
    /// Connect with startup-mode retry (fails fast if config is wrong).
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url())?;

        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await?;

        debug!(host = %config.host, port = config.port, "Connected to redis");
        Ok(Self {
            client,
            connection,
            hmget_limiter: Arc::new(Semaphore::new(config.options.max_hmget_connections.max(1))),
            options: config.options.clone(),
            retry: RetryConfig::daemon(),
        })
    }

    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    pub fn options(&self) -> &RedisOptions {
        &self.options
    }

    /// A reader owning its own connection for blocking `XREAD`.
    pub async fn stream_reader(&self) -> Result<StreamReader> {
        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            self.client.get_multiplexed_async_connection().await
        })
        .await?;
        Ok(StreamReader {
            connection,
            options: self.options.clone(),
            retry: self.retry.clone(),
        })
    }

    /// All `(field, value)` pairs of a hash. Fields repeated across `SCAN`
    /// cursors are yielded once.
    pub fn hscan(&self, cancel: &CancellationToken, key: &str) -> Yield<(String, String)> {
        let (tx, rx) = mpsc::channel(self.options.hscan_count.max(1));
        let conn = self.connection();
        let count = self.options.hscan_count;
        let key = key.to_string();
        let cancel = cancel.clone();
        let retry = self.retry.clone();

        let task = tokio::spawn(async move {
            let mut seen = HashSet::new();
            let mut cursor = "0".to_string();
            loop {
                let (shared, key_arg, cursor_arg) = (&conn, &key, &cursor);
                let (next, flat): (String, Vec<String>) = command(&cancel, &retry, "HSCAN", move || {
                    let mut conn = shared.clone();
                    async move {
                        cmd("HSCAN")
                            .arg(key_arg)
                            .arg(cursor_arg)
                            .arg("COUNT")
                            .arg(count)
                            .query_async(&mut conn)
                            .await
                    }
                })
                .await?;

                let mut pairs = flat.into_iter();
                while let (Some(field), Some(value)) = (pairs.next(), pairs.next()) {
                    if seen.insert(field.clone()) && tx.send((field, value)).await.is_err() {
                        return Ok(());
                    }
                }

                if next == "0" {
                    return Ok(());
                }
                cursor = next;
            }
        });

        Yield { rx, task }
    }

    /// Values of `fields` in a hash, read in parallel chunks. Missing fields
    /// are skipped.
    pub fn hmget(&self, cancel: &CancellationToken, key: &str, fields: Vec<String>) -> Yield<(String, String)> {
        let chunk_size = self.options.hmget_count.max(1);
        let (tx, rx) = mpsc::channel(chunk_size);
        let conn = self.connection();
        let limiter = self.hmget_limiter.clone();
        let key = key.to_string();
        let cancel = cancel.clone();
        let retry = self.retry.clone();

        let task = tokio::spawn(async move {
            let mut chunks = tokio::task::JoinSet::new();
            for chunk in fields.chunks(chunk_size) {
                let permit = cancellable(&cancel, async {
                    limiter.clone().acquire_owned().await.map_err(|_| SyncError::Cancelled)
                })
                .await?;
                let chunk = chunk.to_vec();
                let conn = conn.clone();
                let key = key.clone();
                let tx = tx.clone();
                let cancel = cancel.clone();
                let retry = retry.clone();

                chunks.spawn(async move {
                    let _permit = permit;
                    let (shared, key_arg, fields_arg) = (&conn, &key, &chunk);
                    let values: Vec<Option<String>> = command(&cancel, &retry, "HMGET", move || {
                        let mut conn = shared.clone();
                        async move { cmd("HMGET").arg(key_arg).arg(fields_arg).query_async(&mut conn).await }
                    })
                    .await?;
                    for (field, value) in chunk.into_iter().zip(values) {
                        if let Some(value) = value {
                            if tx.send((field, value)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok::<(), SyncError>(())
                });

                while let Some(joined) = chunks.try_join_next() {
                    joined??;
                }
            }
            while let Some(joined) = chunks.join_next().await {
                joined??;
            }
            Ok(())
        });

        Yield { rx, task }
    }

    /// Best-effort `XTRIM MINID ~`; failures are logged only.
    pub async fn xtrim_minid_approx(&self, stream: &str, min_id: &str) {
        let mut conn = self.connection();
        let trimmed: redis::RedisResult<i64> = cmd("XTRIM")
            .arg(stream)
            .arg("MINID")
            .arg("~")
            .arg(min_id)
            .query_async(&mut conn)
            .await;
        if let Err(e) = trimmed {
            warn!(stream, min_id, error = %e, "Cannot trim stream");
        }
    }

    pub async fn xdel(&self, cancel: &CancellationToken, stream: &str, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        command(cancel, &self.retry, "XDEL", move || {
            let mut conn = self.connection();
            async move { conn.xdel(stream, ids).await }
        })
        .await
    }

    /// `XADD` with a length cap; returns the new entry id.
    pub async fn xadd(
        &self,
        cancel: &CancellationToken,
        stream: &str,
        max_len: MaxLen,
        fields: &[(String, String)],
    ) -> Result<String> {
        let mut command = cmd("XADD");
        command.arg(stream).arg("MAXLEN");
        match max_len {
            MaxLen::Exact(n) => command.arg(n),
            MaxLen::Approx(n) => command.arg("~").arg(n),
        };
        command.arg("*");
        for (field, value) in fields {
            command.arg(field).arg(value);
        }

        let mut conn = self.connection();
        cancellable(cancel, async { Ok(command.query_async(&mut conn).await?) }).await
    }

    /// Id of the newest entry, `0-0` for an empty or missing stream.
    pub async fn last_stream_id(&self, cancel: &CancellationToken, stream: &str) -> Result<String> {
        let reply: StreamRangeReply = command(cancel, &self.retry, "XREVRANGE", move || {
            let mut conn = self.connection();
            async move { conn.xrevrange_count(stream, "+", "-", 1).await }
        })
        .await?;
        Ok(reply
            .ids
            .into_iter()
            .next()
            .map_or_else(|| "0-0".to_string(), |entry| entry.id))
    }

    pub async fn pipeline<T: FromRedisValue>(&self, cancel: &CancellationToken, pipe: &redis::Pipeline) -> Result<T> {
        let mut conn = self.connection();
        cancellable(cancel, async { Ok(pipe.query_async(&mut conn).await?) }).await
    }
}

/// Blocking stream reads on a dedicated connection.
pub struct StreamReader {
    connection: MultiplexedConnection,
    options: RedisOptions,
    retry: RetryConfig,
}

impl StreamReader {
    /// `XREAD BLOCK` repeated until at least one entry arrives. `streams`
    /// pairs each key with the id to read after.
    pub async fn read_until_result(
        &mut self,
        cancel: &CancellationToken,
        streams: &[(String, String)],
    ) -> Result<Vec<(String, Vec<StreamEntry>)>> {
        let keys: Vec<&str> = streams.iter().map(|(k, _)| k.as_str()).collect();
        let ids: Vec<&str> = streams.iter().map(|(_, id)| id.as_str()).collect();
        let block_ms = self.options.block_timeout().as_millis().max(1) as usize;
        let opts = StreamReadOptions::default()
            .block(block_ms)
            .count(self.options.xread_count.max(1));

        let connection = &self.connection;
        let (keys, ids, opts) = (&keys, &ids, &opts);
        loop {
            let reply: Option<StreamReadReply> = command(cancel, &self.retry, "XREAD", move || {
                let mut conn = connection.clone();
                async move { conn.xread_options(keys, ids, opts).await }
            })
            .await?;

            let results: Vec<(String, Vec<StreamEntry>)> = reply
                .map(|r| r.keys)
                .unwrap_or_default()
                .into_iter()
                .filter(|k| !k.ids.is_empty())
                .map(|k| (k.key, k.ids.into_iter().map(StreamEntry::from_redis).collect()))
                .collect();
            if !results.is_empty() {
                return Ok(results);
            }
        }
    }
}
